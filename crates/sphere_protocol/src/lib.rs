#![forbid(unsafe_code)]

pub mod codec;
pub mod events;

pub use codec::{CodecError, DEFAULT_MAX_FRAME_SIZE, decode_event, encode_event, encode_event_default};
pub use events::{
	DirectMessagePayload, GlobalMessagePayload, InboundEvent, OutboundEvent, RoomMessagePayload, SendGlobalMessage, SendMessage,
	SendRoomMessage, UserSummary, format_timestamp,
};

