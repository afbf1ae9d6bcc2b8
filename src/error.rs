use std::time::Duration;

use crate::api::Problem;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the certificate lifecycle engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing or invalid configuration. Fatal to activation, never retried.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The CA rejected a request, polling ran out of retries, or the terms of service were not
    /// accepted.
    #[error("ACME protocol error: {0:#}")]
    Protocol(eyre::Report),

    /// Revocation checking failed for a reason other than an unreachable responder.
    #[error("revocation check failed: {0:#}")]
    Check(eyre::Report),

    /// The minimum renewal interval has not elapsed since the last renewal.
    #[error("certificate renewal blocked, retry in {}ms", .retry_after.as_millis())]
    RenewBlocked { retry_after: Duration },

    /// The keystore collaborator could not read or write the certificate.
    #[error("keystore error: {0:#}")]
    Keystore(eyre::Report),
}

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Returns true for errors raised by the CA interaction.
    pub fn is_protocol(&self) -> bool {
        matches!(self, Error::Protocol(_))
    }
}

impl From<eyre::Report> for Error {
    fn from(err: eyre::Report) -> Self {
        Error::Protocol(err)
    }
}

impl From<Problem> for Error {
    fn from(problem: Problem) -> Self {
        Error::Protocol(eyre::Report::new(problem))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renew_blocked_message_carries_retry_after() {
        let err = Error::RenewBlocked {
            retry_after: Duration::from_millis(50_000),
        };
        assert_eq!(err.to_string(), "certificate renewal blocked, retry in 50000ms");
    }

    #[test]
    fn problem_becomes_protocol_error() {
        let err = Error::from(Problem {
            _type: "urn:ietf:params:acme:error:rateLimited".to_owned(),
            detail: Some("too many certificates".to_owned()),
            subproblems: None,
        });

        assert!(err.is_protocol());
        assert!(err.to_string().contains("rateLimited"));
    }
}
