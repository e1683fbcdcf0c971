#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use sphere_domain::{Identity, MessageId, NewMessage, RoomId, UserId};
use sphere_protocol::{InboundEvent, OutboundEvent, SendGlobalMessage, SendMessage, SendRoomMessage, encode_event};
use thiserror::Error;
use tracing::{debug, warn};

use crate::server::directory::{Directory, DirectoryError};
use crate::server::fanout::{FanoutReport, fan_out};
use crate::server::notify::{NotificationDispatcher, NotifyOutcome};
use crate::server::registry::{ConnectionRegistry, SessionHandle};
use crate::server::store::MessageStore;

/// Maximum size of a frame the router serializes for fan-out.
pub const DEFAULT_MAX_OUTBOUND_FRAME_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct RouterConfig {
	/// Upper bound on waiting for one recipient's queue.
	pub send_timeout: Duration,

	pub max_outbound_frame_bytes: usize,

	pub debug_log_events: bool,
}

impl Default for RouterConfig {
	fn default() -> Self {
		Self {
			send_timeout: Duration::from_secs(2),
			max_outbound_frame_bytes: DEFAULT_MAX_OUTBOUND_FRAME_BYTES,
			debug_log_events: false,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
	Unauthenticated,
	Malformed,
	/// The sending session has not joined the target room.
	NotAMember,
	RateLimited,
}

impl DropReason {
	pub const fn as_str(self) -> &'static str {
		match self {
			DropReason::Unauthenticated => "unauthenticated",
			DropReason::Malformed => "malformed",
			DropReason::NotAMember => "not_a_member",
			DropReason::RateLimited => "rate_limited",
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
	Delivered { message_id: MessageId, report: FanoutReport },
	/// Ignored without side effects.
	Dropped(DropReason),
	/// Persisting or encoding failed; nothing was delivered.
	Failed,
}

#[derive(Debug, Error)]
pub enum InviteError {
	#[error("invitations are only valid for private rooms")]
	NotPrivate,
	#[error("inviter is not a member of the room")]
	NotAMember,
	#[error("user {0} is not in the inviter's friends list")]
	NotFriends(UserId),
	#[error(transparent)]
	Directory(#[from] DirectoryError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InviteReceipt {
	pub room: RoomId,
	pub invited: Vec<UserId>,
	/// Live sessions joined to the room as part of this invitation.
	pub sessions_joined: usize,
	pub notified: usize,
}

/// Turns inbound chat events into persisted messages and targeted fan-out.
#[derive(Clone)]
pub struct RoomRouter {
	registry: ConnectionRegistry,
	store: Arc<dyn MessageStore>,
	directory: Arc<dyn Directory>,
	notifier: NotificationDispatcher,
	cfg: RouterConfig,
}

impl std::fmt::Debug for RoomRouter {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RoomRouter").field("cfg", &self.cfg).finish_non_exhaustive()
	}
}

fn non_blank(v: Option<String>) -> Option<String> {
	v.filter(|s| !s.trim().is_empty())
}

impl RoomRouter {
	pub fn new(
		registry: ConnectionRegistry,
		store: Arc<dyn MessageStore>,
		directory: Arc<dyn Directory>,
		cfg: RouterConfig,
	) -> Self {
		let notifier = NotificationDispatcher::new(registry.clone(), cfg.send_timeout, cfg.max_outbound_frame_bytes);
		Self {
			registry,
			store,
			directory,
			notifier,
			cfg,
		}
	}

	pub fn registry(&self) -> &ConnectionRegistry {
		&self.registry
	}

	pub fn directory(&self) -> &Arc<dyn Directory> {
		&self.directory
	}

	pub fn notifier(&self) -> &NotificationDispatcher {
		&self.notifier
	}

	/// Handle one inbound event from `sender`. Persists before any delivery.
	pub async fn route(&self, sender: &SessionHandle, event: InboundEvent) -> RouteOutcome {
		let event_name = event.name();
		let Some(identity) = sender.identity().cloned() else {
			debug!(conn_id = %sender.id(), event = event_name, "router: unauthenticated sender; dropping");
			return self.record(event_name, RouteOutcome::Dropped(DropReason::Unauthenticated));
		};

		let outcome = match event {
			InboundEvent::SendMessage(ev) => self.route_direct(&identity, ev).await,
			InboundEvent::SendGlobalMessage(ev) => self.route_global(&identity, ev).await,
			InboundEvent::SendRoomMessage(ev) => self.route_room(sender, &identity, ev).await,
		};

		if self.cfg.debug_log_events {
			debug!(conn_id = %sender.id(), user_id = %identity.user_id, event = event_name, outcome = ?outcome, "router: routed");
		}

		self.record(event_name, outcome)
	}

	async fn route_direct(&self, sender: &Identity, ev: SendMessage) -> RouteOutcome {
		let (Some(recipient), Some(content)) = (non_blank(ev.recipient_unique_id), non_blank(ev.content)) else {
			return RouteOutcome::Dropped(DropReason::Malformed);
		};
		let Ok(recipient) = UserId::new(recipient) else {
			return RouteOutcome::Dropped(DropReason::Malformed);
		};

		let message = match self
			.store
			.persist(NewMessage::direct(sender.user_id.clone(), recipient.clone(), content))
			.await
		{
			Ok(m) => m,
			Err(e) => {
				warn!(user_id = %sender.user_id, recipient = %recipient, error = %e, "router: persist direct message failed");
				return RouteOutcome::Failed;
			}
		};

		let Some(event) = OutboundEvent::direct(&message) else {
			return RouteOutcome::Failed;
		};

		let mut recipients = Vec::with_capacity(2);
		if let Some(h) = self.registry.notification_channel_of(&recipient).await {
			recipients.push(h);
		}
		if let Some(h) = self.registry.notification_channel_of(&sender.user_id).await
			&& !recipients.iter().any(|r| r.id() == h.id())
		{
			recipients.push(h);
		}

		self.deliver(message.id, &event, recipients).await
	}

	async fn route_global(&self, sender: &Identity, ev: SendGlobalMessage) -> RouteOutcome {
		let Some(content) = non_blank(ev.content) else {
			return RouteOutcome::Dropped(DropReason::Malformed);
		};

		let message = match self
			.store
			.persist(NewMessage::global(sender.user_id.clone(), content))
			.await
		{
			Ok(m) => m,
			Err(e) => {
				warn!(user_id = %sender.user_id, error = %e, "router: persist global message failed");
				return RouteOutcome::Failed;
			}
		};

		let Some(event) = OutboundEvent::global(&message, sender) else {
			return RouteOutcome::Failed;
		};

		let recipients = self.registry.members_of(&RoomId::Global).await;
		self.deliver(message.id, &event, recipients).await
	}

	async fn route_room(&self, session: &SessionHandle, sender: &Identity, ev: SendRoomMessage) -> RouteOutcome {
		let (Some(room), Some(content)) = (non_blank(ev.room_id), non_blank(ev.content)) else {
			return RouteOutcome::Dropped(DropReason::Malformed);
		};
		let room = match RoomId::parse_lenient(&room) {
			Ok(room) if !room.is_global() => room,
			_ => return RouteOutcome::Dropped(DropReason::Malformed),
		};

		if !self.registry.is_member(session.id(), &room).await {
			debug!(conn_id = %session.id(), room = %room, "router: sender has not joined room; dropping");
			return RouteOutcome::Dropped(DropReason::NotAMember);
		}

		let message = match self
			.store
			.persist(NewMessage::room(sender.user_id.clone(), room.clone(), content))
			.await
		{
			Ok(m) => m,
			Err(e) => {
				warn!(user_id = %sender.user_id, room = %room, error = %e, "router: persist room message failed");
				return RouteOutcome::Failed;
			}
		};

		let Some(event) = OutboundEvent::room(&message, sender) else {
			return RouteOutcome::Failed;
		};

		let recipients = self.registry.members_of(&room).await;
		self.deliver(message.id, &event, recipients).await
	}

	async fn deliver(&self, message_id: MessageId, event: &OutboundEvent, recipients: Vec<SessionHandle>) -> RouteOutcome {
		let frame = match encode_event(event, self.cfg.max_outbound_frame_bytes) {
			Ok(f) => Arc::new(f),
			Err(e) => {
				warn!(message_id = %message_id, event = event.name(), error = %e, "router: encode failed");
				return RouteOutcome::Failed;
			}
		};

		let report = fan_out(&self.registry, recipients, frame, self.cfg.send_timeout).await;
		RouteOutcome::Delivered { message_id, report }
	}

	/// Outcome for an event the connection's limiter refused.
	pub fn rate_limited(&self, event: &InboundEvent) -> RouteOutcome {
		self.record(event.name(), RouteOutcome::Dropped(DropReason::RateLimited))
	}

	fn record(&self, event_name: &'static str, outcome: RouteOutcome) -> RouteOutcome {
		let label = match &outcome {
			RouteOutcome::Delivered { .. } => "delivered",
			RouteOutcome::Dropped(reason) => reason.as_str(),
			RouteOutcome::Failed => "failed",
		};
		metrics::counter!("sphere_server_events_total", "event" => event_name, "outcome" => label).increment(1);
		outcome
	}

	/// Add `invitees` to a private room on behalf of `inviter`.
	///
	/// The inviter must already be a member and every invitee must be a friend of the
	/// inviter. Invitees that are online join the room immediately and get a
	/// `room_invitation` notification.
	pub async fn invite(
		&self,
		inviter: &Identity,
		room: &RoomId,
		invitees: &[UserId],
	) -> Result<InviteReceipt, InviteError> {
		if room.is_global() {
			return Err(InviteError::NotPrivate);
		}

		if !self.directory.is_room_member(room, &inviter.user_id).await? {
			return Err(InviteError::NotAMember);
		}

		let mut invited: Vec<UserId> = Vec::with_capacity(invitees.len());
		for user in invitees {
			if *user == inviter.user_id || invited.contains(user) {
				continue;
			}
			if !self.directory.are_friends(&inviter.user_id, user).await? {
				return Err(InviteError::NotFriends(user.clone()));
			}
			invited.push(user.clone());
		}

		self.directory.add_room_members(room, &invited).await?;

		let event = OutboundEvent::room_invitation(room, inviter);
		let mut sessions_joined = 0;
		let mut notified = 0;
		for user in &invited {
			if let Some(session) = self.registry.notification_channel_of(user).await
				&& self.registry.join_room(session.id(), room.clone()).await
			{
				sessions_joined += 1;
			}
			if self.notifier.notify(user, &event).await == NotifyOutcome::Delivered {
				notified += 1;
			}
		}

		debug!(
			room = %room,
			inviter = %inviter.user_id,
			invited = invited.len(),
			sessions_joined,
			notified,
			"router: room invitation"
		);

		Ok(InviteReceipt {
			room: room.clone(),
			invited,
			sessions_joined,
			notified,
		})
	}
}
