#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use potluck_domain::{ChatError, MessageText, NewMessage, RoomId, StoredMessage, Username};
use tokio::sync::Mutex;

/// Durable sink for chat messages. `append` must succeed before a message may
/// be fanned out to room members.
#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
	/// Append a message with a server-assigned timestamp, returning the stored
	/// row with its id.
	async fn append(&self, msg: NewMessage, created_at_ms: i64) -> anyhow::Result<StoredMessage>;

	/// The most recent messages of a room, oldest first, capped at `limit`.
	async fn recent_history(&self, room: &RoomId, limit: usize) -> anyhow::Result<Vec<StoredMessage>>;
}

/// Process-local store used by tests and by deployments that run without a
/// database.
#[derive(Default)]
pub struct InMemoryMessageStore {
	inner: Mutex<InMemoryState>,
}

#[derive(Default)]
struct InMemoryState {
	next_id: i64,
	by_room: HashMap<RoomId, Vec<StoredMessage>>,
}

#[async_trait::async_trait]
impl MessageStore for InMemoryMessageStore {
	async fn append(&self, msg: NewMessage, created_at_ms: i64) -> anyhow::Result<StoredMessage> {
		let mut state = self.inner.lock().await;
		state.next_id += 1;

		let stored = StoredMessage {
			id: state.next_id,
			room: msg.room.clone(),
			username: msg.username,
			text: msg.text,
			created_at_ms,
		};

		state.by_room.entry(msg.room).or_default().push(stored.clone());
		Ok(stored)
	}

	async fn recent_history(&self, room: &RoomId, limit: usize) -> anyhow::Result<Vec<StoredMessage>> {
		let state = self.inner.lock().await;
		let Some(messages) = state.by_room.get(room) else {
			return Ok(Vec::new());
		};

		let start = messages.len().saturating_sub(limit);
		Ok(messages[start..].to_vec())
	}
}

/// SQL-backed store selected by the `database_url` scheme. Migrations run at
/// connect time.
#[derive(Clone)]
pub struct PersistentMessageStore {
	backend: PersistentBackend,
}

#[derive(Clone)]
enum PersistentBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

impl PersistentMessageStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;

			Ok(Self {
				backend: PersistentBackend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;

			Ok(Self {
				backend: PersistentBackend::Postgres(pool),
			})
		} else {
			Err(anyhow!("unsupported database_url (use sqlite:, postgres:)"))
		}
	}
}

#[async_trait::async_trait]
impl MessageStore for PersistentMessageStore {
	async fn append(&self, msg: NewMessage, created_at_ms: i64) -> anyhow::Result<StoredMessage> {
		let id = match &self.backend {
			PersistentBackend::Sqlite(pool) => {
				let (id,): (i64,) = sqlx::query_as(
					"INSERT INTO messages (room, username, body, created_at_ms) VALUES (?, ?, ?, ?) RETURNING id",
				)
				.bind(msg.room.as_str())
				.bind(msg.username.as_str())
				.bind(msg.text.as_str())
				.bind(created_at_ms)
				.fetch_one(pool)
				.await
				.context("insert message (sqlite)")?;
				id
			}
			PersistentBackend::Postgres(pool) => {
				let (id,): (i64,) = sqlx::query_as(
					"INSERT INTO messages (room, username, body, created_at_ms) VALUES ($1, $2, $3, $4) RETURNING id",
				)
				.bind(msg.room.as_str())
				.bind(msg.username.as_str())
				.bind(msg.text.as_str())
				.bind(created_at_ms)
				.fetch_one(pool)
				.await
				.context("insert message (postgres)")?;
				id
			}
		};

		Ok(StoredMessage {
			id,
			room: msg.room,
			username: msg.username,
			text: msg.text,
			created_at_ms,
		})
	}

	async fn recent_history(&self, room: &RoomId, limit: usize) -> anyhow::Result<Vec<StoredMessage>> {
		let rows: Vec<(i64, String, String, i64)> = match &self.backend {
			PersistentBackend::Sqlite(pool) => sqlx::query_as(
				"SELECT id, username, body, created_at_ms FROM messages WHERE room = ? ORDER BY id DESC LIMIT ?",
			)
			.bind(room.as_str())
			.bind(limit as i64)
			.fetch_all(pool)
			.await
			.context("select history (sqlite)")?,
			PersistentBackend::Postgres(pool) => sqlx::query_as(
				"SELECT id, username, body, created_at_ms FROM messages WHERE room = $1 ORDER BY id DESC LIMIT $2",
			)
			.bind(room.as_str())
			.bind(limit as i64)
			.fetch_all(pool)
			.await
			.context("select history (postgres)")?,
		};

		let mut messages = Vec::with_capacity(rows.len());
		for (id, username, body, created_at_ms) in rows.into_iter().rev() {
			let username = Username::new(username).map_err(|e| anyhow!("stored username: {e}"))?;
			let text = MessageText::new(body).map_err(|e| anyhow!("stored body: {e}"))?;
			messages.push(StoredMessage {
				id,
				room: room.clone(),
				username,
				text,
				created_at_ms,
			});
		}

		Ok(messages)
	}
}

/// Store handle shared across connections. Maps backend failures to the
/// retryable `StorageUnavailable` error the wire layer reports.
#[derive(Clone)]
pub struct StoreService {
	backend: Arc<dyn MessageStore>,
}

impl StoreService {
	pub fn in_memory() -> Self {
		Self {
			backend: Arc::new(InMemoryMessageStore::default()),
		}
	}

	pub fn persistent(backend: PersistentMessageStore) -> Self {
		Self {
			backend: Arc::new(backend),
		}
	}

	pub fn with_backend(backend: Arc<dyn MessageStore>) -> Self {
		Self { backend }
	}

	pub async fn append(&self, msg: NewMessage, created_at_ms: i64) -> Result<StoredMessage, ChatError> {
		self.backend
			.append(msg, created_at_ms)
			.await
			.map_err(|err| ChatError::StorageUnavailable(format!("{err:#}")))
	}

	pub async fn recent_history(&self, room: &RoomId, limit: usize) -> Result<Vec<StoredMessage>, ChatError> {
		self.backend
			.recent_history(room, limit)
			.await
			.map_err(|err| ChatError::StorageUnavailable(format!("{err:#}")))
	}
}
