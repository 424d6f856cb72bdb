//! Validation helpers for DTOs.

use validator::ValidationError;

/// Longest accepted player name, in characters.
pub const MAX_PLAYER_NAME_LEN: usize = 32;

/// Validates a player name: non-blank once trimmed, at most 32 characters, no control characters.
///
/// # Examples
///
/// ```ignore
/// validate_player_name("alice")     // Ok
/// validate_player_name("   ")       // Err - blank
/// validate_player_name("bob\u{7}")  // Err - control character
/// ```
pub fn validate_player_name(name: &str) -> Result<(), ValidationError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        let mut err = ValidationError::new("player_name_blank");
        err.message = Some("Player name must not be blank".into());
        return Err(err);
    }

    let len = trimmed.chars().count();
    if len > MAX_PLAYER_NAME_LEN {
        let mut err = ValidationError::new("player_name_length");
        err.message = Some(
            format!("Player name must be at most {MAX_PLAYER_NAME_LEN} characters (got {len})")
                .into(),
        );
        return Err(err);
    }

    if trimmed.chars().any(char::is_control) {
        let mut err = ValidationError::new("player_name_format");
        err.message = Some("Player name must not contain control characters".into());
        return Err(err);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_player_name_valid() {
        assert!(validate_player_name("alice").is_ok());
        assert!(validate_player_name("  Zoé  ").is_ok());
        assert!(validate_player_name(&"x".repeat(MAX_PLAYER_NAME_LEN)).is_ok());
    }

    #[test]
    fn test_validate_player_name_blank() {
        assert!(validate_player_name("").is_err());
        assert!(validate_player_name("   ").is_err());
    }

    #[test]
    fn test_validate_player_name_invalid() {
        assert!(validate_player_name(&"x".repeat(MAX_PLAYER_NAME_LEN + 1)).is_err());
        assert!(validate_player_name("bob\u{7}").is_err());
        assert!(validate_player_name("tab\tname").is_err());
    }
}
