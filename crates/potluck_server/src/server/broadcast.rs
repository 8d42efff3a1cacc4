#![forbid(unsafe_code)]

use potluck_domain::{ChatError, MessageText, NewMessage, RoomId, SessionId, StoredMessage};
use potluck_protocol::pb;
use tracing::{debug, warn};

use super::registry::RoomRegistry;
use super::session::{DeliveryStatus, SessionItem, SessionTable};
use super::store::StoreService;
use crate::util::time::{format_utc_minutes, unix_ms_now};

/// Configuration for `BroadcastEngine`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
	/// Maximum number of messages replayed to a joiner.
	pub history_limit: usize,
}

impl Default for EngineConfig {
	fn default() -> Self {
		Self { history_limit: 50 }
	}
}

/// Per-publish delivery tally across the room's member snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
	pub delivered: usize,
	pub dropped: usize,
	pub closed: usize,
}

/// Orchestrates join, publish, and disconnect across the registry, session
/// table, and message store.
///
/// Publishes for one room are serialized on that room's publish lock: the
/// append, the member snapshot, and the delivery attempts happen under it, so
/// delivery order within a room matches append order. Joins take the same
/// lock while reading history, which keeps a joiner from both missing and
/// double-seeing a message published concurrently.
#[derive(Clone)]
pub struct BroadcastEngine {
	registry: RoomRegistry,
	sessions: SessionTable,
	store: StoreService,
	cfg: EngineConfig,
}

impl BroadcastEngine {
	pub fn new(registry: RoomRegistry, sessions: SessionTable, store: StoreService, cfg: EngineConfig) -> Self {
		Self {
			registry,
			sessions,
			store,
			cfg,
		}
	}

	pub fn registry(&self) -> &RoomRegistry {
		&self.registry
	}

	pub fn sessions(&self) -> &SessionTable {
		&self.sessions
	}

	/// Admit a session into a room and return the room's recent history.
	///
	/// A storage failure aborts the join before any membership change, so a
	/// joiner never ends up a member without having been offered history.
	pub async fn join(&self, session: SessionId, room: &RoomId, invite_code: Option<&str>) -> Result<Vec<pb::MessageEvent>, ChatError> {
		let publish_lock = self.registry.authorize_join(room, invite_code).await?;
		let _guard = publish_lock.lock().await;

		let history = self.store.recent_history(room, self.cfg.history_limit).await?;

		self.registry.add_member(room, session).await?;
		self.sessions.record_join(session, room.clone()).await;

		debug!(room = %room, session = %session, history = history.len(), "session joined room");
		Ok(history.iter().map(message_event).collect())
	}

	/// Persist a message and fan it out to the room's current members,
	/// including the sender.
	///
	/// The append must succeed before any delivery is attempted; a failed
	/// append leaves every member queue untouched.
	pub async fn publish(&self, session: SessionId, room: &RoomId, raw_text: &str) -> Result<(StoredMessage, DeliveryReport), ChatError> {
		let Some(username) = self.sessions.username(session).await else {
			return Err(ChatError::NotAMember(room.clone()));
		};

		let text = MessageText::new(raw_text)?;

		let Some(publish_lock) = self.registry.publish_handle(room).await else {
			warn!(room = %room, session = %session, "publish to a room that does not exist");
			return Err(ChatError::NotAMember(room.clone()));
		};

		let mut clock = publish_lock.lock().await;

		if !self.registry.is_member(room, session).await {
			return Err(ChatError::NotAMember(room.clone()));
		}

		let created_at_ms = clock.stamp(unix_ms_now());
		let stored = self
			.store
			.append(NewMessage::new(room.clone(), username, text), created_at_ms)
			.await?;

		let members = self.registry.members(room).await.unwrap_or_default();
		let subscribers = self.sessions.subscribers_for(&members).await;

		let event = message_event(&stored);
		let mut report = DeliveryReport::default();

		for (member, subscriber) in &subscribers {
			match subscriber.try_deliver(SessionItem::Message(Box::new(event.clone()))) {
				DeliveryStatus::Delivered => report.delivered += 1,
				DeliveryStatus::Dropped => {
					report.dropped += 1;
					debug!(room = %room, session = %member, "dropped delivery, member queue full");
				}
				DeliveryStatus::Closed => report.closed += 1,
			}
		}

		Ok((stored, report))
	}

	/// Tear down a session, dropping it from every room it had joined.
	pub async fn disconnect(&self, session: SessionId) -> Vec<RoomId> {
		let rooms = self.sessions.remove(session).await;
		for room in &rooms {
			self.registry.remove_member(room, session).await;
		}

		if !rooms.is_empty() {
			debug!(session = %session, rooms = rooms.len(), "session left rooms on disconnect");
		}

		rooms
	}
}

/// Wire event for a stored message, carrying both the raw timestamp and its
/// minute-resolution display form.
pub(crate) fn message_event(stored: &StoredMessage) -> pb::MessageEvent {
	pb::MessageEvent {
		room: stored.room.as_str().to_string(),
		username: stored.username.as_str().to_string(),
		text: stored.text.as_str().to_string(),
		created_at_ms: stored.created_at_ms,
		created_at: format_utc_minutes(stored.created_at_ms),
		message_id: stored.id,
	}
}
