#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use sphere_domain::{Identity, RoomId, SessionId, UserId};
use thiserror::Error;
use tokio::sync::{Mutex, Notify, mpsc};
use tracing::debug;

/// One serialized outbound frame, shared between every recipient of a fan-out.
pub type OutboundFrame = Arc<String>;

/// Configuration for `ConnectionRegistry`.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
	/// Maximum number of queued frames per session.
	pub outbound_queue_capacity: usize,

	pub debug_logs: bool,
}

impl Default for RegistryConfig {
	fn default() -> Self {
		Self {
			outbound_queue_capacity: 256,
			debug_logs: false,
		}
	}
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
	#[error("session outbound queue closed")]
	Closed,
	#[error("session outbound queue full for {0:?}")]
	TimedOut(Duration),
}

/// Handle to a live session. Cloned into fan-out snapshots; the registry owns the entry.
#[derive(Debug, Clone)]
pub struct SessionHandle {
	id: SessionId,
	identity: Option<Identity>,
	outbound: mpsc::Sender<OutboundFrame>,
	evicted: Arc<Notify>,
}

impl SessionHandle {
	pub fn id(&self) -> SessionId {
		self.id
	}

	pub fn identity(&self) -> Option<&Identity> {
		self.identity.as_ref()
	}

	pub fn user_id(&self) -> Option<&UserId> {
		self.identity.as_ref().map(|i| &i.user_id)
	}

	pub fn is_authenticated(&self) -> bool {
		self.identity.is_some()
	}

	/// Whether the session's writer has gone away.
	pub fn is_closed(&self) -> bool {
		self.outbound.is_closed()
	}

	/// Enqueue a frame, waiting at most `timeout` for queue space.
	pub async fn deliver(&self, frame: OutboundFrame, timeout: Duration) -> Result<(), DeliveryError> {
		match self.outbound.send_timeout(frame, timeout).await {
			Ok(()) => Ok(()),
			Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(DeliveryError::Closed),
			Err(mpsc::error::SendTimeoutError::Timeout(_)) => Err(DeliveryError::TimedOut(timeout)),
		}
	}

	/// Resolves once the registry has evicted this session.
	pub async fn evicted(&self) {
		self.evicted.notified().await;
	}
}

/// Point-in-time copy of both registry indices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrySnapshot {
	pub rooms: HashMap<RoomId, HashSet<SessionId>>,
	pub joined: HashMap<SessionId, HashSet<RoomId>>,
	pub channels: HashMap<UserId, SessionId>,
}

/// Tracks live sessions, room membership and per-user notification channels.
#[derive(Debug, Clone)]
pub struct ConnectionRegistry {
	inner: Arc<Mutex<Inner>>,
	next_session_id: Arc<AtomicU64>,
	cfg: RegistryConfig,
}

impl Default for ConnectionRegistry {
	fn default() -> Self {
		Self::new(RegistryConfig::default())
	}
}

impl ConnectionRegistry {
	pub fn new(cfg: RegistryConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			next_session_id: Arc::new(AtomicU64::new(1)),
			cfg,
		}
	}

	/// Register a new session and hand back its handle plus the receiving end of its queue.
	///
	/// Every session joins the global room. An authenticated session also takes over the
	/// notification channel for its user and joins `memberships`.
	pub async fn admit(
		&self,
		identity: Option<Identity>,
		memberships: impl IntoIterator<Item = RoomId>,
	) -> (SessionHandle, mpsc::Receiver<OutboundFrame>) {
		let (tx, rx) = mpsc::channel(self.cfg.outbound_queue_capacity.max(1));
		let id = SessionId(self.next_session_id.fetch_add(1, Ordering::Relaxed));

		let handle = SessionHandle {
			id,
			identity,
			outbound: tx,
			evicted: Arc::new(Notify::new()),
		};

		let mut inner = self.inner.lock().await;
		inner.sessions.insert(
			id,
			SessionEntry {
				handle: handle.clone(),
				joined_rooms: HashSet::new(),
			},
		);
		inner.join(id, RoomId::Global);

		if let Some(user) = handle.user_id().cloned() {
			if let Some(previous) = inner.channels.insert(user.clone(), id)
				&& previous != id
			{
				metrics::counter!("sphere_server_notification_channels_replaced_total").increment(1);
				debug!(user_id = %user, previous = %previous, session = %id, "registry: notification channel replaced");
			}

			for room in memberships {
				inner.join(id, room);
			}
		}

		if self.cfg.debug_logs {
			debug!(
				session = %id,
				user_id = ?handle.user_id().map(UserId::as_str),
				rooms = inner.sessions.get(&id).map(|e| e.joined_rooms.len()).unwrap_or(0),
				"registry: admitted"
			);
		}

		inner.record_gauges();
		(handle, rx)
	}

	/// Add a session to a room. Returns `true` if it was not already a member.
	pub async fn join_room(&self, session: SessionId, room: RoomId) -> bool {
		let mut inner = self.inner.lock().await;
		let joined = inner.join(session, room.clone());

		if self.cfg.debug_logs && joined {
			debug!(session = %session, room = %room, "registry: joined room");
		}

		inner.record_gauges();
		joined
	}

	/// Remove a session from a room, dropping the room once empty.
	pub async fn leave_room(&self, session: SessionId, room: &RoomId) -> bool {
		let mut inner = self.inner.lock().await;
		let left = inner.leave(session, room);

		if self.cfg.debug_logs && left {
			debug!(session = %session, room = %room, "registry: left room");
		}

		inner.record_gauges();
		left
	}

	/// Remove a session from every index. Safe to call repeatedly.
	pub async fn evict(&self, session: SessionId) -> bool {
		let mut inner = self.inner.lock().await;
		let Some(entry) = inner.sessions.remove(&session) else {
			return false;
		};

		for room in &entry.joined_rooms {
			inner.remove_member(room, session);
		}

		if let Some(user) = entry.handle.user_id()
			&& inner.channels.get(user) == Some(&session)
		{
			inner.channels.remove(user);
		}

		inner.record_gauges();
		drop(inner);

		entry.handle.evicted.notify_one();

		if self.cfg.debug_logs {
			debug!(session = %session, rooms = entry.joined_rooms.len(), "registry: evicted");
		}

		true
	}

	/// Snapshot of a room's current members.
	pub async fn members_of(&self, room: &RoomId) -> Vec<SessionHandle> {
		let inner = self.inner.lock().await;
		let Some(members) = inner.rooms.get(room) else {
			return Vec::new();
		};

		members
			.iter()
			.filter_map(|id| inner.sessions.get(id))
			.map(|entry| entry.handle.clone())
			.collect()
	}

	/// The live session currently mapped as `user`'s notification channel.
	pub async fn notification_channel_of(&self, user: &UserId) -> Option<SessionHandle> {
		let inner = self.inner.lock().await;
		let session = inner.channels.get(user)?;
		inner.sessions.get(session).map(|entry| entry.handle.clone())
	}

	/// Rooms a session has joined, or `None` if it is not admitted.
	pub async fn rooms_of(&self, session: SessionId) -> Option<HashSet<RoomId>> {
		let inner = self.inner.lock().await;
		inner.sessions.get(&session).map(|entry| entry.joined_rooms.clone())
	}

	/// Whether `session` has joined `room`.
	pub async fn is_member(&self, session: SessionId, room: &RoomId) -> bool {
		let inner = self.inner.lock().await;
		inner.rooms.get(room).is_some_and(|members| members.contains(&session))
	}

	pub async fn is_admitted(&self, session: SessionId) -> bool {
		self.inner.lock().await.sessions.contains_key(&session)
	}

	pub async fn session_count(&self) -> usize {
		self.inner.lock().await.sessions.len()
	}

	/// Member count per room.
	pub async fn room_member_counts(&self) -> HashMap<RoomId, usize> {
		let inner = self.inner.lock().await;
		inner.rooms.iter().map(|(k, v)| (k.clone(), v.len())).collect()
	}

	/// Run `f` while holding the registry lock.
	#[cfg(test)]
	pub(crate) async fn with_lock_held<T>(&self, f: impl std::future::Future<Output = T>) -> T {
		let _inner = self.inner.lock().await;
		f.await
	}

	pub async fn snapshot(&self) -> RegistrySnapshot {
		let inner = self.inner.lock().await;
		RegistrySnapshot {
			rooms: inner.rooms.clone(),
			joined: inner
				.sessions
				.iter()
				.map(|(id, entry)| (*id, entry.joined_rooms.clone()))
				.collect(),
			channels: inner.channels.clone(),
		}
	}
}

#[derive(Debug, Default)]
struct Inner {
	sessions: HashMap<SessionId, SessionEntry>,
	rooms: HashMap<RoomId, HashSet<SessionId>>,
	channels: HashMap<UserId, SessionId>,
}

#[derive(Debug)]
struct SessionEntry {
	handle: SessionHandle,
	joined_rooms: HashSet<RoomId>,
}

impl Inner {
	fn join(&mut self, session: SessionId, room: RoomId) -> bool {
		let Some(entry) = self.sessions.get_mut(&session) else {
			return false;
		};

		if !entry.joined_rooms.insert(room.clone()) {
			return false;
		}

		self.rooms.entry(room).or_default().insert(session);
		true
	}

	fn leave(&mut self, session: SessionId, room: &RoomId) -> bool {
		let Some(entry) = self.sessions.get_mut(&session) else {
			return false;
		};

		if !entry.joined_rooms.remove(room) {
			return false;
		}

		self.remove_member(room, session);
		true
	}

	fn remove_member(&mut self, room: &RoomId, session: SessionId) {
		if let Some(members) = self.rooms.get_mut(room) {
			members.remove(&session);
			if members.is_empty() {
				self.rooms.remove(room);
			}
		}
	}

	fn record_gauges(&self) {
		metrics::gauge!("sphere_server_sessions_active").set(self.sessions.len() as f64);
		metrics::gauge!("sphere_server_rooms_active").set(self.rooms.len() as f64);
		metrics::gauge!("sphere_server_notification_channels_active").set(self.channels.len() as f64);
	}
}
