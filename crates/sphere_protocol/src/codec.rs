#![forbid(unsafe_code)]

use thiserror::Error;

use crate::events::{InboundEvent, OutboundEvent};

/// Default maximum text frame size accepted from or written to a client.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024; // 64 KiB

#[derive(Debug, Error)]
pub enum CodecError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("empty frame")]
	Empty,

	#[error("json error: {0}")]
	Json(#[from] serde_json::Error),
}

/// Decode one inbound text frame into a typed event.
pub fn decode_event(text: &str, max_frame_size: usize) -> Result<InboundEvent, CodecError> {
	if text.len() > max_frame_size {
		return Err(CodecError::FrameTooLarge {
			len: text.len(),
			max: max_frame_size,
		});
	}

	if text.trim().is_empty() {
		return Err(CodecError::Empty);
	}

	Ok(serde_json::from_str(text)?)
}

/// Encode an outbound event into a text frame.
pub fn encode_event(event: &OutboundEvent, max_frame_size: usize) -> Result<String, CodecError> {
	let text = serde_json::to_string(event)?;
	if text.len() > max_frame_size {
		return Err(CodecError::FrameTooLarge {
			len: text.len(),
			max: max_frame_size,
		});
	}
	Ok(text)
}

/// Encode using `DEFAULT_MAX_FRAME_SIZE`.
pub fn encode_event_default(event: &OutboundEvent) -> Result<String, CodecError> {
	encode_event(event, DEFAULT_MAX_FRAME_SIZE)
}
