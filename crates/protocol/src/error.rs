//! Numeric-prefixed wire errors shared by all three services.
//!
//! Every service answers failed commands with a single line of the form
//! `"<code> <message>"`, e.g. `"404 Not found"`. `ServiceError` is the typed
//! representation of that line; `Display` renders it back to wire form and
//! `ServiceError::parse` reconstructs one from a line read off the wire.

use std::fmt;

/// A wire-facing error: a three-digit code plus a human-readable message.
///
/// Codes below 400 never occur here; 4xx/5xx mirror HTTP's taxonomy loosely,
/// and 6xx is reserved for router-specific session-lifecycle failures that
/// have no HTTP analogue.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code} {message}")]
pub struct ServiceError {
    pub code: u16,
    pub message: String,
}

impl ServiceError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn bad_request() -> Self {
        Self::new(400, "Unknown command")
    }

    pub fn invalid_username() -> Self {
        Self::new(401, "Invalid user name or password")
    }

    pub fn invalid_password() -> Self {
        Self::new(401, "Invalid user name or password")
    }

    pub fn permission_denied() -> Self {
        Self::new(403, "Permission denied")
    }

    pub fn not_found() -> Self {
        Self::new(404, "Not found")
    }

    pub fn not_a_directory() -> Self {
        Self::new(405, "Not a directory")
    }

    pub fn sequence_error() -> Self {
        Self::new(406, "Sequence error")
    }

    pub fn already_exists() -> Self {
        Self::new(409, "Already exists")
    }

    pub fn slot_not_available() -> Self {
        Self::new(409, "Slot not available")
    }

    pub fn wrong_game_state() -> Self {
        Self::new(412, "Wrong game state")
    }

    pub fn invalid_identifier() -> Self {
        Self::new(412, "Invalid identifier")
    }

    pub fn file_too_large() -> Self {
        Self::new(413, "File too large")
    }

    pub fn range_error() -> Self {
        Self::new(416, "Range error")
    }

    pub fn unprocessable(message: impl Into<String>) -> Self {
        Self::new(422, message)
    }

    pub fn internal_error() -> Self {
        Self::new(500, "Internal error")
    }

    pub fn session_timed_out() -> Self {
        Self::new(600, "Session timed out")
    }

    pub fn cannot_start_session() -> Self {
        Self::new(601, "Session could not be started")
    }

    /// §7 groups tokens into the `404` "not found" band alongside files and
    /// users, distinct from the router's `6xx` session-lifecycle codes --
    /// `601` is `cannot_start_session`, a different failure entirely.
    pub fn token_expired() -> Self {
        Self::new(404, "Token expired")
    }

    pub fn session_conflict() -> Self {
        Self::new(609, "Session conflict")
    }

    pub fn too_many_sessions() -> Self {
        Self::new(610, "Too many sessions")
    }

    /// Parses a wire line of the form `"<code> <message>"`.
    ///
    /// Falls back to treating the whole line as the message with a 500 code
    /// if no leading numeric token is present -- callers that bridge a
    /// subprocess's stderr or an arbitrary panic message through here should
    /// not have to pre-validate the text.
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        match line.split_once(' ') {
            Some((code_str, message)) if code_str.len() == 3 && code_str.bytes().all(|b| b.is_ascii_digit()) => {
                let code = code_str.parse().unwrap_or(500);
                Self::new(code, message)
            }
            _ => Self::new(500, line),
        }
    }

    /// True if this code belongs to the 4xx/5xx "pass the message through
    /// verbatim" band, as opposed to an internal error whose message may leak
    /// implementation detail and should be replaced by a generic one.
    pub fn is_reportable(&self) -> bool {
        matches!(self.code / 100, 4 | 5 | 6)
    }

    /// Maps an arbitrary internal failure onto the wire taxonomy: reportable
    /// errors pass through unchanged, anything else becomes a generic 500.
    pub fn from_internal(err: &anyhow::Error) -> Self {
        if let Some(service_err) = err.downcast_ref::<ServiceError>() {
            service_err.clone()
        } else {
            Self::internal_error()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_wire_form() {
        assert_eq!(ServiceError::permission_denied().to_string(), "403 Permission denied");
        assert_eq!(ServiceError::not_found().to_string(), "404 Not found");
    }

    #[test]
    fn parse_roundtrips_known_codes() {
        let err = ServiceError::parse("412 Wrong game state");
        assert_eq!(err.code, 412);
        assert_eq!(err.message, "Wrong game state");
    }

    #[test]
    fn parse_falls_back_to_500_for_unstructured_text() {
        let err = ServiceError::parse("connection reset by peer");
        assert_eq!(err.code, 500);
        assert_eq!(err.message, "connection reset by peer");
    }

    #[test]
    fn parse_rejects_non_numeric_leading_token() {
        let err = ServiceError::parse("ERR something broke");
        assert_eq!(err.code, 500);
        assert_eq!(err.message, "ERR something broke");
    }

    #[test]
    fn is_reportable_covers_4xx_5xx_6xx() {
        assert!(ServiceError::bad_request().is_reportable());
        assert!(ServiceError::internal_error().is_reportable());
        assert!(ServiceError::session_timed_out().is_reportable());
        assert!(ServiceError::session_conflict().is_reportable());
    }

    #[test]
    fn router_specific_codes_are_distinct_6xx() {
        assert_eq!(ServiceError::session_conflict().code, 609);
        assert_eq!(ServiceError::too_many_sessions().code, 610);
    }

    #[test]
    fn from_internal_passes_through_service_errors() {
        let wrapped: anyhow::Error = ServiceError::file_too_large().into();
        let mapped = ServiceError::from_internal(&wrapped);
        assert_eq!(mapped.code, 413);
    }

    #[test]
    fn from_internal_hides_unstructured_errors_behind_500() {
        let wrapped = anyhow::anyhow!("disk fell off the truck");
        let mapped = ServiceError::from_internal(&wrapped);
        assert_eq!(mapped.code, 500);
        assert_eq!(mapped.message, "Internal error");
    }
}
