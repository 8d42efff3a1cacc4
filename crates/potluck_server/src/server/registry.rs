#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use potluck_domain::{ChatError, RoomId, RoomVisibility, SessionId};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::gate;

/// Configuration for `RoomRegistry`.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
	/// Create a public room when a bare join names a room that does not exist.
	pub create_on_demand: bool,
}

impl Default for RegistryConfig {
	fn default() -> Self {
		Self { create_on_demand: true }
	}
}

/// Catalog of rooms, their visibility, and their current members.
///
/// Rooms are never removed once created; membership empties out as sessions
/// disconnect but the room itself stays addressable.
#[derive(Debug, Clone)]
pub struct RoomRegistry {
	inner: Arc<Mutex<Inner>>,
	cfg: RegistryConfig,
}

/// Per-room ordering clock. Held behind the room's publish lock so that
/// timestamps assigned under the lock never go backwards within a room.
#[derive(Debug, Default)]
pub struct RoomClock {
	last_ts_ms: i64,
}

impl RoomClock {
	/// Stamp a message with `now_ms`, clamped so the sequence of stamps for
	/// this room is non-decreasing even if the wall clock steps backwards.
	pub fn stamp(&mut self, now_ms: i64) -> i64 {
		let ts = now_ms.max(self.last_ts_ms);
		self.last_ts_ms = ts;
		ts
	}
}

#[derive(Debug, Default)]
struct Inner {
	rooms: HashMap<RoomId, RoomEntry>,
}

#[derive(Debug)]
struct RoomEntry {
	visibility: RoomVisibility,
	members: HashSet<SessionId>,

	/// Serializes append, member snapshot, and delivery for this room.
	publish_lock: Arc<Mutex<RoomClock>>,
}

impl RoomEntry {
	fn new(visibility: RoomVisibility) -> Self {
		Self {
			visibility,
			members: HashSet::new(),
			publish_lock: Arc::new(Mutex::new(RoomClock::default())),
		}
	}
}

impl RoomRegistry {
	pub fn new(cfg: RegistryConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			cfg,
		}
	}

	/// Register a room from the configured catalog. Seeding the same name
	/// twice keeps the first entry.
	pub async fn seed(&self, room: RoomId, visibility: RoomVisibility) {
		let mut inner = self.inner.lock().await;
		if inner.rooms.contains_key(&room) {
			warn!(room = %room, "duplicate room in catalog, keeping first entry");
			return;
		}

		debug!(room = %room, visibility = %visibility, "seeded room");
		inner.rooms.insert(room, RoomEntry::new(visibility));
	}

	pub async fn visibility(&self, room: &RoomId) -> Option<RoomVisibility> {
		let inner = self.inner.lock().await;
		inner.rooms.get(room).map(|e| e.visibility.clone())
	}

	/// Check a join attempt against the room's visibility, creating the room
	/// on demand where configuration allows. Returns the room's publish lock
	/// on success; the caller holds it while reading history and recording
	/// membership.
	pub async fn authorize_join(&self, room: &RoomId, supplied_code: Option<&str>) -> Result<Arc<Mutex<RoomClock>>, ChatError> {
		let mut inner = self.inner.lock().await;

		if let Some(entry) = inner.rooms.get(room) {
			gate::authorize(Some(&entry.visibility), supplied_code)?;
			return Ok(entry.publish_lock.clone());
		}

		gate::authorize(None, supplied_code)?;

		if !self.cfg.create_on_demand {
			return Err(ChatError::UnknownRoom(room.clone()));
		}

		debug!(room = %room, "created public room on demand");
		let entry = inner.rooms.entry(room.clone()).or_insert_with(|| RoomEntry::new(RoomVisibility::Public));
		Ok(entry.publish_lock.clone())
	}

	/// Record a session as a member of an existing room.
	pub async fn add_member(&self, room: &RoomId, session: SessionId) -> Result<(), ChatError> {
		let mut inner = self.inner.lock().await;
		let Some(entry) = inner.rooms.get_mut(room) else {
			return Err(ChatError::UnknownRoom(room.clone()));
		};

		entry.members.insert(session);
		Ok(())
	}

	/// Drop a session from a room's member set. No-op when the session was
	/// not a member; the room itself is kept.
	pub async fn remove_member(&self, room: &RoomId, session: SessionId) {
		let mut inner = self.inner.lock().await;
		if let Some(entry) = inner.rooms.get_mut(room) {
			entry.members.remove(&session);
		}
	}

	pub async fn is_member(&self, room: &RoomId, session: SessionId) -> bool {
		let inner = self.inner.lock().await;
		inner.rooms.get(room).is_some_and(|e| e.members.contains(&session))
	}

	/// Snapshot of the current member set of a room.
	pub async fn members(&self, room: &RoomId) -> Option<Vec<SessionId>> {
		let inner = self.inner.lock().await;
		inner.rooms.get(room).map(|e| e.members.iter().copied().collect())
	}

	/// The publish lock for an existing room, or `None` when the room has
	/// never been created.
	pub async fn publish_handle(&self, room: &RoomId) -> Option<Arc<Mutex<RoomClock>>> {
		let inner = self.inner.lock().await;
		inner.rooms.get(room).map(|e| e.publish_lock.clone())
	}

	pub async fn room_count(&self) -> usize {
		let inner = self.inner.lock().await;
		inner.rooms.len()
	}

	pub async fn member_count(&self, room: &RoomId) -> usize {
		let inner = self.inner.lock().await;
		inner.rooms.get(room).map(|e| e.members.len()).unwrap_or(0)
	}
}
