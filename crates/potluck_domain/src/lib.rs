#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

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

/// Room (group chat channel) identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
	/// Create a non-empty `RoomId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for RoomId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for RoomId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		RoomId::new(s.to_string())
	}
}

/// Display name attached to a session, resolved once at handshake.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Username(String);

impl Username {
	/// Create a `Username`; the value is trimmed and must be non-empty.
	pub fn new(name: impl Into<String>) -> Result<Self, ParseIdError> {
		let name = name.into();
		let trimmed = name.trim();
		if trimmed.is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(trimmed.to_string()))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for Username {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for Username {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Username::new(s.to_string())
	}
}

/// Identifier for one live connection. Assigned at accept time, never reused
/// for a reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Shared secret gating join access to a private room. Matched case-sensitive
/// and exact, scoped to the room that owns it. `Debug` is redacted so codes
/// never land in logs.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InviteCode(String);

impl fmt::Debug for InviteCode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("InviteCode(<redacted>)")
	}
}

impl InviteCode {
	/// Create a non-empty `InviteCode`.
	pub fn new(code: impl Into<String>) -> Result<Self, ParseIdError> {
		let code = code.into();
		if code.is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(code))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn as_bytes(&self) -> &[u8] {
		self.0.as_bytes()
	}
}

/// Room visibility. A private room always carries its invite code; a public
/// room never does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomVisibility {
	Public,
	Private { invite_code: InviteCode },
}

impl RoomVisibility {
	pub fn is_private(&self) -> bool {
		matches!(self, RoomVisibility::Private { .. })
	}

	/// Stable string identifier used in logs and config.
	pub const fn as_str(&self) -> &'static str {
		match self {
			RoomVisibility::Public => "public",
			RoomVisibility::Private { .. } => "private",
		}
	}
}

impl fmt::Display for RoomVisibility {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Owned secret value that never prints its contents.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

/// Chat message body, trimmed at construction. Whitespace-only input is
/// rejected before it can reach the store or the fan-out path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageText(String);

impl MessageText {
	pub fn new(raw: impl Into<String>) -> Result<Self, ChatError> {
		let raw = raw.into();
		let trimmed = raw.trim();
		if trimmed.is_empty() {
			return Err(ChatError::EmptyMessage);
		}
		Ok(Self(trimmed.to_string()))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for MessageText {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// A message as submitted by a sender, before the store assigns id and
/// timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
	pub room: RoomId,
	pub username: Username,
	pub text: MessageText,
}

impl NewMessage {
	pub fn new(room: RoomId, username: Username, text: MessageText) -> Self {
		Self { room, username, text }
	}
}

/// A persisted chat message. Immutable once appended; `created_at_ms` is
/// non-decreasing per room within one server process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
	pub id: i64,
	pub room: RoomId,
	pub username: Username,
	pub text: MessageText,
	pub created_at_ms: i64,
}

/// Failure taxonomy for join/send processing. Every variant is scoped to the
/// single event being handled.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChatError {
	#[error("unknown room: {0}")]
	UnknownRoom(RoomId),
	/// Deliberately identical for "wrong code" and "no such private room".
	#[error("invalid invite code")]
	InvalidInviteCode,
	#[error("not a member of room: {0}")]
	NotAMember(RoomId),
	#[error("message text is empty")]
	EmptyMessage,
	#[error("storage unavailable: {0}")]
	StorageUnavailable(String),
	#[error("delivery failed: {0}")]
	DeliveryFailure(String),
}

impl ChatError {
	/// Whether the sender may usefully retry the same request later.
	pub fn is_retryable(&self) -> bool {
		matches!(self, ChatError::StorageUnavailable(_))
	}
}
