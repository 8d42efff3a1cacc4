#![forbid(unsafe_code)]

use bytes::{BufMut, BytesMut};
use prost::Message;
use thiserror::Error;

/// Default maximum frame payload size for v1.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 2 * 1024 * 1024; // 2 MiB

/// Length-prefix width in bytes (big-endian `u32` payload length).
const LEN_PREFIX: usize = 4;

#[derive(Debug, Error)]
pub enum FramingError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("insufficient data: need={need} have={have}")]
	InsufficientData {
		need: usize,
		have: usize,
	},

	#[error("protobuf decode error: {0}")]
	Decode(#[from] prost::DecodeError),

	#[error("protobuf encode error: {0}")]
	Encode(#[from] prost::EncodeError),
}

fn checked_payload_len<M: Message>(msg: &M, max_frame_size: usize) -> Result<usize, FramingError> {
	let payload_len = msg.encoded_len();
	if payload_len > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len: payload_len,
			max: max_frame_size,
		});
	}
	Ok(payload_len)
}

/// Read the payload length from a prefix, if enough bytes are present.
fn peek_payload_len(src: &[u8], max_frame_size: usize) -> Result<Option<usize>, FramingError> {
	if src.len() < LEN_PREFIX {
		return Ok(None);
	}

	let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
	if len > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len,
			max: max_frame_size,
		});
	}
	Ok(Some(len))
}

/// Encode a protobuf message into a length-prefixed frame.
pub fn encode_frame<M: Message>(msg: &M, max_frame_size: usize) -> Result<Vec<u8>, FramingError> {
	let payload_len = checked_payload_len(msg, max_frame_size)?;

	let mut out = Vec::with_capacity(LEN_PREFIX + payload_len);
	out.extend_from_slice(&(payload_len as u32).to_be_bytes());
	msg.encode(&mut out)?;
	Ok(out)
}

/// Encode a frame using `DEFAULT_MAX_FRAME_SIZE`.
pub fn encode_frame_default<M: Message>(msg: &M) -> Result<Vec<u8>, FramingError> {
	encode_frame(msg, DEFAULT_MAX_FRAME_SIZE)
}

/// Append an encoded frame into the provided buffer.
pub fn encode_frame_into<M: Message>(buf: &mut BytesMut, msg: &M, max_frame_size: usize) -> Result<(), FramingError> {
	let payload_len = checked_payload_len(msg, max_frame_size)?;

	buf.reserve(LEN_PREFIX + payload_len);
	buf.put_u32(payload_len as u32);
	msg.encode(buf)?;
	Ok(())
}

/// Decode a single frame from the start of `src`, returning the message and
/// the number of bytes consumed.
pub fn decode_frame<M: Message + Default>(src: &[u8], max_frame_size: usize) -> Result<(M, usize), FramingError> {
	let len = peek_payload_len(src, max_frame_size)?.ok_or(FramingError::InsufficientData {
		need: LEN_PREFIX,
		have: src.len(),
	})?;

	let need = LEN_PREFIX + len;
	if src.len() < need {
		return Err(FramingError::InsufficientData { need, have: src.len() });
	}

	let msg = M::decode(&src[LEN_PREFIX..need])?;
	Ok((msg, need))
}

/// Try to decode a single frame from a growable buffer. Returns `Ok(None)`
/// until a complete frame has accumulated; consumed bytes are split off.
pub fn try_decode_frame_from_buffer<M: Message + Default>(
	buf: &mut BytesMut,
	max_frame_size: usize,
) -> Result<Option<M>, FramingError> {
	let Some(len) = peek_payload_len(buf, max_frame_size)? else {
		return Ok(None);
	};

	let need = LEN_PREFIX + len;
	if buf.len() < need {
		return Ok(None);
	}

	let frame = buf.split_to(need);
	let msg = M::decode(&frame[LEN_PREFIX..])?;
	Ok(Some(msg))
}
