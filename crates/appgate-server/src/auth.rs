//! Connect-password authentication.
//!
//! One policy covers all socket kinds: the native protocol supplies the
//! secret as the `PASSENGER_CONNECT_PASSWORD` header field, HTTP as the
//! `X-Passenger-Connect-Password` header, and the console as a raw scalar
//! during its handshake.
//!
//! Rejection is silent by design: the worker closes the connection without
//! writing a byte, so probing a locked-down port looks the same whether the
//! password was wrong or the framing was garbage.

use appgate_core::headers::{HTTP_CONNECT_PASSWORD, PASSENGER_CONNECT_PASSWORD};
use appgate_core::HeaderMap;

/// Verdict of an authentication check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Accepted,
    /// Close the connection without a response.
    Rejected,
}

/// The configured connect password, fixed at construction.
#[derive(Clone)]
pub struct AuthPolicy {
    secret: Option<String>,
}

impl AuthPolicy {
    pub fn new(secret: Option<String>) -> Self {
        Self { secret }
    }

    /// Whether connections must authenticate at all.
    pub fn required(&self) -> bool {
        self.secret.is_some()
    }

    /// Checks a native-protocol header map and strips the password field so
    /// it never reaches the dispatched handler.
    pub fn check_native(&self, headers: &mut HeaderMap) -> AuthOutcome {
        let supplied = headers.remove(PASSENGER_CONNECT_PASSWORD);
        self.verdict(supplied.as_deref())
    }

    /// Checks a parsed HTTP header map and strips the password header.
    pub fn check_http(&self, headers: &mut HeaderMap) -> AuthOutcome {
        let supplied = headers.remove(HTTP_CONNECT_PASSWORD);
        self.verdict(supplied.as_deref())
    }

    /// Checks the console handshake scalar.
    pub fn check_console(&self, supplied: &[u8]) -> AuthOutcome {
        match &self.secret {
            None => AuthOutcome::Accepted,
            Some(secret) if secret.as_bytes() == supplied => AuthOutcome::Accepted,
            Some(_) => AuthOutcome::Rejected,
        }
    }

    fn verdict(&self, supplied: Option<&str>) -> AuthOutcome {
        match (&self.secret, supplied) {
            (None, _) => AuthOutcome::Accepted,
            (Some(secret), Some(supplied)) if secret == supplied => AuthOutcome::Accepted,
            (Some(_), _) => AuthOutcome::Rejected,
        }
    }
}

// The secret must never appear in logs, so Debug is written by hand.
impl std::fmt::Debug for AuthPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthPolicy")
            .field("required", &self.required())
            .finish()
    }
}
