#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Stable user identifier issued by the authentication service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
	/// Create a non-empty `UserId`. Surrounding whitespace is trimmed.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		let trimmed = id.trim();
		if trimmed.is_empty() {
			return Err(ParseIdError::Empty);
		}
		if trimmed.len() == id.len() {
			Ok(Self(id))
		} else {
			Ok(Self(trimmed.to_string()))
		}
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for UserId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		UserId::new(s.to_string())
	}
}

/// Process-unique handle for one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "conn-{}", self.0)
	}
}

/// Broadcast room identifier: the shared global room or a private conversation room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RoomId {
	Global,
	Private(String),
}

impl RoomId {
	/// Literal identifier of the shared room every connection joins.
	pub const GLOBAL: &'static str = "global_chat";

	/// Prefix for private conversation rooms.
	pub const PRIVATE_PREFIX: &'static str = "room:";

	/// Private room keyed by the directory's room id.
	pub fn private(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		if id == Self::GLOBAL {
			return Err(ParseIdError::InvalidFormat(format!(
				"{} is reserved for the global room",
				Self::GLOBAL
			)));
		}
		Ok(Self::Private(id))
	}

	/// Parse either `global_chat` or `room:<id>`.
	pub fn parse(s: &str) -> Result<Self, ParseIdError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		if s == Self::GLOBAL {
			return Ok(Self::Global);
		}

		let rest = s
			.strip_prefix(Self::PRIVATE_PREFIX)
			.ok_or_else(|| ParseIdError::InvalidFormat(format!("expected {} or room:<id>", Self::GLOBAL)))?;
		Self::private(rest.to_string())
	}

	/// Like `parse`, but a value without the `room:` prefix is taken as a bare private room key.
	pub fn parse_lenient(s: &str) -> Result<Self, ParseIdError> {
		let s = s.trim();
		if s == Self::GLOBAL || s.starts_with(Self::PRIVATE_PREFIX) {
			return Self::parse(s);
		}
		Self::private(s.to_string())
	}

	pub fn is_global(&self) -> bool {
		matches!(self, RoomId::Global)
	}

	/// Directory-side id for private rooms.
	pub fn private_key(&self) -> Option<&str> {
		match self {
			RoomId::Global => None,
			RoomId::Private(id) => Some(id),
		}
	}
}

impl fmt::Display for RoomId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			RoomId::Global => f.write_str(Self::GLOBAL),
			RoomId::Private(id) => write!(f, "{}{}", Self::PRIVATE_PREFIX, id),
		}
	}
}

impl FromStr for RoomId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		RoomId::parse(s)
	}
}

impl TryFrom<String> for RoomId {
	type Error = ParseIdError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		RoomId::parse(&value)
	}
}

impl From<RoomId> for String {
	fn from(value: RoomId) -> Self {
		value.to_string()
	}
}

/// Persister-assigned message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub uuid::Uuid);

impl MessageId {
	/// Create a new random message id.
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for MessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for MessageId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		uuid::Uuid::parse_str(s.trim())
			.map(Self)
			.map_err(|e| ParseIdError::InvalidFormat(e.to_string()))
	}
}

/// Resolved identity of an authenticated connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
	pub user_id: UserId,
	pub username: String,
}

impl Identity {
	pub fn new(user_id: UserId, username: impl Into<String>) -> Self {
		Self {
			user_id,
			username: username.into(),
		}
	}
}

/// Audience of a message: one recipient, one private room, or the global room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageScope {
	Direct(UserId),
	Room(RoomId),
	Global,
}

impl MessageScope {
	pub fn recipient(&self) -> Option<&UserId> {
		match self {
			MessageScope::Direct(user) => Some(user),
			_ => None,
		}
	}

	pub fn room(&self) -> Option<&RoomId> {
		match self {
			MessageScope::Room(room) => Some(room),
			_ => None,
		}
	}

	pub fn is_global(&self) -> bool {
		matches!(self, MessageScope::Global)
	}

	/// Rebuild a scope from its stored columns. Exactly one of the three may be set.
	pub fn from_parts(recipient: Option<UserId>, room: Option<RoomId>, is_global: bool) -> Result<Self, ParseIdError> {
		match (recipient, room, is_global) {
			(Some(user), None, false) => Ok(MessageScope::Direct(user)),
			(None, Some(room), false) if !room.is_global() => Ok(MessageScope::Room(room)),
			(None, None, true) => Ok(MessageScope::Global),
			(None, None, false) => Err(ParseIdError::InvalidFormat(
				"message requires a recipient, a room or the global flag".into(),
			)),
			_ => Err(ParseIdError::InvalidFormat(
				"message must target exactly one private audience".into(),
			)),
		}
	}
}

/// A message as handed to the persister, before it has an id or timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
	pub sender_id: UserId,
	pub scope: MessageScope,
	pub content: String,
}

impl NewMessage {
	pub fn direct(sender_id: UserId, recipient_id: UserId, content: impl Into<String>) -> Self {
		Self {
			sender_id,
			scope: MessageScope::Direct(recipient_id),
			content: content.into(),
		}
	}

	pub fn global(sender_id: UserId, content: impl Into<String>) -> Self {
		Self {
			sender_id,
			scope: MessageScope::Global,
			content: content.into(),
		}
	}

	pub fn room(sender_id: UserId, room: RoomId, content: impl Into<String>) -> Self {
		Self {
			sender_id,
			scope: MessageScope::Room(room),
			content: content.into(),
		}
	}

	/// Attach the persister-assigned id and timestamp.
	pub fn into_stored(self, id: MessageId, timestamp: DateTime<Utc>) -> Message {
		Message {
			id,
			sender_id: self.sender_id,
			scope: self.scope,
			content: self.content,
			timestamp,
		}
	}
}

/// Persisted chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
	pub id: MessageId,
	pub sender_id: UserId,
	pub scope: MessageScope,
	pub content: String,
	pub timestamp: DateTime<Utc>,
}

impl Message {
	pub fn recipient_id(&self) -> Option<&UserId> {
		self.scope.recipient()
	}

	pub fn room_id(&self) -> Option<&RoomId> {
		self.scope.room()
	}

	pub fn is_global(&self) -> bool {
		self.scope.is_global()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn user_id_trims_and_rejects_empty() {
		assert_eq!(UserId::new("  alice ").unwrap().as_str(), "alice");
		assert!(UserId::new("   ").is_err());
		assert!("".parse::<UserId>().is_err());
	}

	#[test]
	fn room_id_parse_and_display() {
		assert_eq!(RoomId::parse("global_chat").unwrap(), RoomId::Global);
		let room = RoomId::parse("room:abc123").unwrap();
		assert_eq!(room.private_key(), Some("abc123"));
		assert_eq!(room.to_string(), "room:abc123");
		assert_eq!(RoomId::Global.to_string(), "global_chat");
	}

	#[test]
	fn room_id_rejects_bad_input() {
		assert!(RoomId::parse("").is_err());
		assert!(RoomId::parse("lobby").is_err());
		assert!(RoomId::parse("room:").is_err());
		assert!(RoomId::private(RoomId::GLOBAL).is_err());
	}

	#[test]
	fn lenient_parse_accepts_bare_keys_only_without_prefix() {
		assert_eq!(RoomId::parse_lenient("abc").unwrap(), RoomId::private("abc").unwrap());
		assert_eq!(RoomId::parse_lenient("room:abc").unwrap(), RoomId::private("abc").unwrap());
		assert_eq!(RoomId::parse_lenient("global_chat").unwrap(), RoomId::Global);
		assert!(RoomId::parse_lenient("room:").is_err());
		assert!(RoomId::parse_lenient("  ").is_err());
	}

	#[test]
	fn room_id_string_conversions_roundtrip() {
		let room = RoomId::private("r1").unwrap();
		let s = String::from(room.clone());
		assert_eq!(s, "room:r1");
		assert_eq!(RoomId::try_from(s).unwrap(), room);
	}

	#[test]
	fn scope_from_parts_enforces_exactly_one() {
		let bob = UserId::new("bob").unwrap();
		let room = RoomId::private("r1").unwrap();
		assert_eq!(
			MessageScope::from_parts(Some(bob.clone()), None, false).unwrap(),
			MessageScope::Direct(bob.clone())
		);
		assert_eq!(
			MessageScope::from_parts(None, Some(room.clone()), false).unwrap(),
			MessageScope::Room(room.clone())
		);
		assert_eq!(MessageScope::from_parts(None, None, true).unwrap(), MessageScope::Global);
		assert!(MessageScope::from_parts(Some(bob.clone()), None, true).is_err());
		assert!(MessageScope::from_parts(Some(bob), Some(room.clone()), false).is_err());
		assert!(MessageScope::from_parts(None, Some(RoomId::Global), false).is_err());
		assert!(MessageScope::from_parts(None, Some(room), true).is_err());
		assert!(MessageScope::from_parts(None, None, false).is_err());
	}

	#[test]
	fn new_message_into_stored_keeps_scope() {
		let alice = UserId::new("alice").unwrap();
		let bob = UserId::new("bob").unwrap();
		let id = MessageId::new_v4();
		let at = Utc::now();

		let msg = NewMessage::direct(alice.clone(), bob.clone(), "hi").into_stored(id, at);
		assert_eq!(msg.recipient_id(), Some(&bob));
		assert!(!msg.is_global());
		assert_eq!(msg.sender_id, alice);
		assert_eq!(msg.timestamp, at);

		let global = NewMessage::global(alice, "hey").into_stored(MessageId::new_v4(), at);
		assert!(global.is_global());
		assert!(global.recipient_id().is_none());
	}

	#[test]
	fn message_id_parse() {
		let id = MessageId::new_v4();
		assert_eq!(id.to_string().parse::<MessageId>().unwrap(), id);
		assert!("nope".parse::<MessageId>().is_err());
	}
}
