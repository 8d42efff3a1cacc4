#![forbid(unsafe_code)]

use potluck_domain::{ChatError, RoomVisibility};

use super::auth::constant_time_eq;

/// Decide whether a join attempt may proceed against a room's visibility.
///
/// `visibility` is `None` when the room does not exist yet. A join that
/// carries an invite code for a nonexistent room is rejected with
/// `InvalidInviteCode` so callers cannot distinguish a wrong code from a
/// missing room. A bare join against a nonexistent room is allowed through;
/// the registry decides whether to create the room on demand.
pub fn authorize(visibility: Option<&RoomVisibility>, supplied_code: Option<&str>) -> Result<(), ChatError> {
	match visibility {
		Some(RoomVisibility::Public) => Ok(()),
		Some(RoomVisibility::Private { invite_code }) => {
			let Some(code) = supplied_code else {
				return Err(ChatError::InvalidInviteCode);
			};

			if constant_time_eq(invite_code.as_bytes(), code.as_bytes()) {
				Ok(())
			} else {
				Err(ChatError::InvalidInviteCode)
			}
		}
		None => {
			if supplied_code.is_some() {
				return Err(ChatError::InvalidInviteCode);
			}
			Ok(())
		}
	}
}
