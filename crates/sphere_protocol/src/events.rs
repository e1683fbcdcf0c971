#![forbid(unsafe_code)]

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sphere_domain::{Identity, Message, MessageScope, RoomId};

/// Client → server events.
///
/// Payload fields are optional on the wire; presence is validated by the router so
/// that a missing field is a silent drop rather than a decode failure of the whole frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum InboundEvent {
	SendMessage(SendMessage),
	SendGlobalMessage(SendGlobalMessage),
	SendRoomMessage(SendRoomMessage),
}

impl InboundEvent {
	/// Wire name of the event.
	pub const fn name(&self) -> &'static str {
		match self {
			InboundEvent::SendMessage(_) => "send_message",
			InboundEvent::SendGlobalMessage(_) => "send_global_message",
			InboundEvent::SendRoomMessage(_) => "send_room_message",
		}
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessage {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub recipient_unique_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub content: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendGlobalMessage {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub content: Option<String>,
}

/// Message to a private room. `room_id` is `room:<id>` or the bare room key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRoomMessage {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub room_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub content: Option<String>,
}

/// Public view of a user embedded in outbound events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
	pub id: String,
	pub username: String,
}

impl From<&Identity> for UserSummary {
	fn from(identity: &Identity) -> Self {
		Self {
			id: identity.user_id.as_str().to_string(),
			username: identity.username.clone(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectMessagePayload {
	pub id: String,
	pub sender_id: String,
	pub recipient_id: String,
	pub content: String,
	pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalMessagePayload {
	pub id: String,
	pub content: String,
	pub timestamp: String,
	pub is_global: bool,
	pub sender: UserSummary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMessagePayload {
	pub id: String,
	pub room_id: String,
	pub content: String,
	pub timestamp: String,
	pub sender: UserSummary,
}

/// Server → client events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum OutboundEvent {
	ReceiveMessage(DirectMessagePayload),
	ReceiveGlobalMessage(GlobalMessagePayload),
	ReceiveRoomMessage(RoomMessagePayload),
	FriendRequestReceived { from: UserSummary },
	FriendRequestAccepted { by: UserSummary },
	RoomInvitation { room_id: String, inviter: UserSummary },
}

impl OutboundEvent {
	/// Wire name of the event.
	pub const fn name(&self) -> &'static str {
		match self {
			OutboundEvent::ReceiveMessage(_) => "receive_message",
			OutboundEvent::ReceiveGlobalMessage(_) => "receive_global_message",
			OutboundEvent::ReceiveRoomMessage(_) => "receive_room_message",
			OutboundEvent::FriendRequestReceived { .. } => "friend_request_received",
			OutboundEvent::FriendRequestAccepted { .. } => "friend_request_accepted",
			OutboundEvent::RoomInvitation { .. } => "room_invitation",
		}
	}

	/// `receive_message` for a persisted direct message; `None` for global messages.
	pub fn direct(message: &Message) -> Option<Self> {
		let MessageScope::Direct(recipient) = &message.scope else {
			return None;
		};

		Some(OutboundEvent::ReceiveMessage(DirectMessagePayload {
			id: message.id.to_string(),
			sender_id: message.sender_id.as_str().to_string(),
			recipient_id: recipient.as_str().to_string(),
			content: message.content.clone(),
			timestamp: format_timestamp(&message.timestamp),
		}))
	}

	/// `receive_global_message` for a persisted global message; `None` for direct messages.
	pub fn global(message: &Message, sender: &Identity) -> Option<Self> {
		if !message.is_global() {
			return None;
		}

		Some(OutboundEvent::ReceiveGlobalMessage(GlobalMessagePayload {
			id: message.id.to_string(),
			content: message.content.clone(),
			timestamp: format_timestamp(&message.timestamp),
			is_global: true,
			sender: UserSummary::from(sender),
		}))
	}

	/// `receive_room_message` for a persisted private room message.
	pub fn room(message: &Message, sender: &Identity) -> Option<Self> {
		let room = message.room_id()?;

		Some(OutboundEvent::ReceiveRoomMessage(RoomMessagePayload {
			id: message.id.to_string(),
			room_id: room.to_string(),
			content: message.content.clone(),
			timestamp: format_timestamp(&message.timestamp),
			sender: UserSummary::from(sender),
		}))
	}

	pub fn room_invitation(room: &RoomId, inviter: &Identity) -> Self {
		OutboundEvent::RoomInvitation {
			room_id: room.to_string(),
			inviter: UserSummary::from(inviter),
		}
	}
}

/// ISO-8601 / RFC 3339 rendering used on the wire (microsecond precision, `+00:00` offset).
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
	ts.to_rfc3339_opts(SecondsFormat::Micros, false)
}
