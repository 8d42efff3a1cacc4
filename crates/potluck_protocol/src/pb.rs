#![forbid(unsafe_code)]

//! Wire messages for the `potluck.v1` protocol.
//!
//! Every frame on the control stream carries exactly one [`Envelope`]. The
//! types are defined with prost derives directly so the wire format stays
//! plain proto3 without a codegen step.

use potluck_domain::ChatError;

/// Top-level frame payload.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
	#[prost(oneof = "envelope::Msg", tags = "1, 2, 3, 4, 5, 6, 7, 8, 9, 10")]
	pub msg: ::core::option::Option<envelope::Msg>,
}

pub mod envelope {
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Msg {
		#[prost(message, tag = "1")]
		Hello(super::Hello),
		#[prost(message, tag = "2")]
		Welcome(super::Welcome),
		#[prost(message, tag = "3")]
		Join(super::Join),
		#[prost(message, tag = "4")]
		JoinOk(super::JoinOk),
		#[prost(message, tag = "5")]
		Publish(super::Publish),
		#[prost(message, tag = "6")]
		PublishAck(super::PublishAck),
		#[prost(message, tag = "7")]
		MessageEvent(super::MessageEvent),
		#[prost(message, tag = "8")]
		ErrorReply(super::ErrorReply),
		#[prost(message, tag = "9")]
		Ping(super::Ping),
		#[prost(message, tag = "10")]
		Pong(super::Pong),
	}
}

impl Envelope {
	/// Wrap a oneof variant.
	pub fn from_msg(msg: envelope::Msg) -> Self {
		Self { msg: Some(msg) }
	}
}

/// First client frame on a connection. Exactly one of `username` or
/// `auth_token` is consulted, depending on the server's auth mode.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Hello {
	#[prost(string, tag = "1")]
	pub username: ::prost::alloc::string::String,
	#[prost(string, tag = "2")]
	pub auth_token: ::prost::alloc::string::String,
	#[prost(uint32, tag = "3")]
	pub protocol_version: u32,
}

/// Server reply to a valid `Hello`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Welcome {
	#[prost(uint64, tag = "1")]
	pub session_id: u64,
	#[prost(string, tag = "2")]
	pub server_name: ::prost::alloc::string::String,
	#[prost(string, tag = "3")]
	pub username: ::prost::alloc::string::String,
}

/// Join a room. `invite_code` is empty for public rooms; for private rooms it
/// must match the room's code exactly.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Join {
	#[prost(string, tag = "1")]
	pub room: ::prost::alloc::string::String,
	#[prost(string, tag = "2")]
	pub invite_code: ::prost::alloc::string::String,
}

/// Successful join. Carries recent history, oldest first, rendered with the
/// same shape as live events.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JoinOk {
	#[prost(string, tag = "1")]
	pub room: ::prost::alloc::string::String,
	#[prost(message, repeated, tag = "2")]
	pub history: ::prost::alloc::vec::Vec<MessageEvent>,
}

/// Send a chat message to a joined room.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Publish {
	#[prost(string, tag = "1")]
	pub room: ::prost::alloc::string::String,
	#[prost(string, tag = "2")]
	pub text: ::prost::alloc::string::String,
}

/// Acknowledges a stored `Publish`. The sender's rendered copy arrives via
/// the broadcast `MessageEvent`, not this ack.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PublishAck {
	#[prost(string, tag = "1")]
	pub room: ::prost::alloc::string::String,
	#[prost(int64, tag = "2")]
	pub message_id: i64,
}

/// A stored chat message fanned out to every current room member.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MessageEvent {
	#[prost(string, tag = "1")]
	pub room: ::prost::alloc::string::String,
	#[prost(string, tag = "2")]
	pub username: ::prost::alloc::string::String,
	#[prost(string, tag = "3")]
	pub text: ::prost::alloc::string::String,
	/// Server-assigned creation time, unix milliseconds.
	#[prost(int64, tag = "4")]
	pub created_at_ms: i64,
	/// `YYYY-MM-DD HH:MM` (UTC), ready for display.
	#[prost(string, tag = "5")]
	pub created_at: ::prost::alloc::string::String,
	#[prost(int64, tag = "6")]
	pub message_id: i64,
}

/// Error surfaced to the originating connection only.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ErrorReply {
	#[prost(enumeration = "ErrorCode", tag = "1")]
	pub code: i32,
	#[prost(string, tag = "2")]
	pub message: ::prost::alloc::string::String,
	#[prost(string, tag = "3")]
	pub room: ::prost::alloc::string::String,
	#[prost(bool, tag = "4")]
	pub retryable: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ping {
	#[prost(uint64, tag = "1")]
	pub nonce: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Pong {
	#[prost(uint64, tag = "1")]
	pub nonce: u64,
}

/// Wire error codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ErrorCode {
	Unspecified = 0,
	UnknownRoom = 1,
	InvalidInviteCode = 2,
	NotAMember = 3,
	EmptyMessage = 4,
	StorageUnavailable = 5,
	DeliveryFailure = 6,
	/// Handshake or framing misuse (e.g. events before `Hello`).
	Protocol = 7,
	/// Rejected credentials in token auth mode.
	Unauthorized = 8,
}

impl From<&ChatError> for ErrorCode {
	fn from(err: &ChatError) -> Self {
		match err {
			ChatError::UnknownRoom(_) => ErrorCode::UnknownRoom,
			ChatError::InvalidInviteCode => ErrorCode::InvalidInviteCode,
			ChatError::NotAMember(_) => ErrorCode::NotAMember,
			ChatError::EmptyMessage => ErrorCode::EmptyMessage,
			ChatError::StorageUnavailable(_) => ErrorCode::StorageUnavailable,
			ChatError::DeliveryFailure(_) => ErrorCode::DeliveryFailure,
		}
	}
}

impl ErrorReply {
	/// Build the wire reply for a chat failure scoped to `room`.
	pub fn from_chat_error(err: &ChatError, room: &str) -> Self {
		Self {
			code: ErrorCode::from(err) as i32,
			message: err.to_string(),
			room: room.to_string(),
			retryable: err.is_retryable(),
		}
	}
}

#[cfg(test)]
mod tests {
	use potluck_domain::RoomId;
	use prost::Message;

	use super::*;

	#[test]
	fn envelope_roundtrip_join() {
		let env = Envelope::from_msg(envelope::Msg::Join(Join {
			room: "veggie-lovers".to_string(),
			invite_code: "ABCD".to_string(),
		}));

		let bytes = env.encode_to_vec();
		let decoded = Envelope::decode(bytes.as_slice()).expect("decode");
		assert_eq!(decoded, env);
	}

	#[test]
	fn error_reply_maps_taxonomy() {
		let err = ChatError::NotAMember(RoomId::new("veggie-lovers").expect("room id"));
		let reply = ErrorReply::from_chat_error(&err, "veggie-lovers");
		assert_eq!(reply.code, ErrorCode::NotAMember as i32);
		assert_eq!(reply.room, "veggie-lovers");
		assert!(!reply.retryable);

		let storage = ChatError::StorageUnavailable("pool closed".to_string());
		let reply = ErrorReply::from_chat_error(&storage, "veggie-lovers");
		assert_eq!(reply.code, ErrorCode::StorageUnavailable as i32);
		assert!(reply.retryable);
	}

	#[test]
	fn invalid_invite_code_message_reveals_nothing() {
		let reply = ErrorReply::from_chat_error(&ChatError::InvalidInviteCode, "secret-room");
		assert_eq!(reply.message, "invalid invite code");
	}
}
