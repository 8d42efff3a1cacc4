#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use potluck_domain::{RoomId, SessionId, Username};
use potluck_protocol::pb;
use tokio::sync::{Mutex, mpsc};

/// Items emitted on a session's delivery stream.
#[derive(Debug, Clone)]
pub enum SessionItem {
	Message(Box<pb::MessageEvent>),

	/// Indicates the session fell behind and items were dropped.
	Lagged { dropped: u64 },
}

/// Outcome of one delivery attempt to one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
	Delivered,
	Dropped,
	Closed,
}

/// Sender half of a session's bounded delivery queue. Deliveries never block
/// the publisher; a full queue drops the item and records a pending lag marker
/// that is flushed once the session drains.
#[derive(Debug)]
pub struct Subscriber {
	tx: mpsc::Sender<SessionItem>,
	pending_lag: AtomicU64,
}

impl Subscriber {
	fn new(tx: mpsc::Sender<SessionItem>) -> Self {
		Self {
			tx,
			pending_lag: AtomicU64::new(0),
		}
	}

	pub fn is_closed(&self) -> bool {
		self.tx.is_closed()
	}

	pub fn try_deliver(&self, item: SessionItem) -> DeliveryStatus {
		match self.tx.try_send(item) {
			Ok(()) => {
				let pending = self.pending_lag.swap(0, Ordering::Relaxed);
				if pending > 0 && self.tx.try_send(SessionItem::Lagged { dropped: pending }).is_err() {
					self.pending_lag.fetch_add(pending, Ordering::Relaxed);
				}
				DeliveryStatus::Delivered
			}
			Err(mpsc::error::TrySendError::Full(_)) => {
				self.pending_lag.fetch_add(1, Ordering::Relaxed);
				DeliveryStatus::Dropped
			}
			Err(mpsc::error::TrySendError::Closed(_)) => DeliveryStatus::Closed,
		}
	}
}

/// Live sessions and the rooms each one has joined. The reverse index is what
/// lets disconnect cleanup find every member set a session must leave.
#[derive(Clone, Default)]
pub struct SessionTable {
	inner: Arc<Mutex<HashMap<SessionId, SessionEntry>>>,
}

struct SessionEntry {
	username: Username,
	joined: HashSet<RoomId>,
	subscriber: Arc<Subscriber>,
}

impl SessionTable {
	pub fn new() -> Self {
		Self::default()
	}

	/// Register a session after its handshake, returning the receiver half of
	/// its delivery queue.
	pub async fn register(&self, id: SessionId, username: Username, queue_capacity: usize) -> mpsc::Receiver<SessionItem> {
		let (tx, rx) = mpsc::channel(queue_capacity);

		let mut inner = self.inner.lock().await;
		inner.insert(
			id,
			SessionEntry {
				username,
				joined: HashSet::new(),
				subscriber: Arc::new(Subscriber::new(tx)),
			},
		);

		rx
	}

	pub async fn record_join(&self, id: SessionId, room: RoomId) {
		let mut inner = self.inner.lock().await;
		if let Some(entry) = inner.get_mut(&id) {
			entry.joined.insert(room);
		}
	}

	pub async fn username(&self, id: SessionId) -> Option<Username> {
		let inner = self.inner.lock().await;
		inner.get(&id).map(|e| e.username.clone())
	}

	pub async fn joined_rooms(&self, id: SessionId) -> Vec<RoomId> {
		let inner = self.inner.lock().await;
		inner.get(&id).map(|e| e.joined.iter().cloned().collect()).unwrap_or_default()
	}

	/// Subscriber handles for a snapshot of session ids. Sessions that already
	/// vanished are skipped.
	pub async fn subscribers_for(&self, ids: &[SessionId]) -> Vec<(SessionId, Arc<Subscriber>)> {
		let inner = self.inner.lock().await;
		ids.iter()
			.filter_map(|id| inner.get(id).map(|e| (*id, e.subscriber.clone())))
			.collect()
	}

	/// Remove a session, returning the rooms it had joined so the caller can
	/// drop it from each member set.
	pub async fn remove(&self, id: SessionId) -> Vec<RoomId> {
		let mut inner = self.inner.lock().await;
		inner.remove(&id).map(|e| e.joined.into_iter().collect()).unwrap_or_default()
	}

	pub async fn len(&self) -> usize {
		let inner = self.inner.lock().await;
		inner.len()
	}
}
