//! JSON payloads exchanged with the ACME server.
//!
//! Field names follow [RFC 8555 §7.1]. Exposed for debugging only.
//!
//! [RFC 8555 §7.1]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.1

use std::fmt;

use serde::{
    ser::{SerializeMap as _, Serializer},
    Deserialize, Serialize,
};

mod account;
mod authorization;
mod directory;
mod identifier;
mod order;
mod revocation;

pub use self::{
    account::Account,
    authorization::{Authorization, AuthorizationStatus, Challenge, ChallengeStatus},
    directory::{Directory, DirectoryMeta},
    identifier::Identifier,
    order::{Finalize, Order, OrderStatus},
    revocation::Revocation,
};

/// Serializes to `""`, the payload of a POST-as-GET request.
pub struct EmptyString;

impl Serialize for EmptyString {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("")
    }
}

/// Serializes to `{}`, the payload that asks the server to validate a challenge.
pub struct EmptyObject;

impl Serialize for EmptyObject {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_map(Some(0))?.end()
    }
}

/// Problem document returned by the server for failed requests (RFC 7807).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    #[serde(rename = "type")]
    pub _type: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub subproblems: Option<Vec<Subproblem>>,
}

impl Problem {
    pub(crate) fn http(status: reqwest::StatusCode, body: &str) -> Self {
        Problem {
            _type: "httpReqError".to_owned(),
            detail: Some(format!("{status} body: {body}")),
            subproblems: None,
        }
    }

    fn is_acme_error(&self, name: &str) -> bool {
        self._type
            .strip_prefix("urn:ietf:params:acme:error:")
            .or_else(|| self._type.strip_prefix("urn:acme:error:"))
            .unwrap_or(&self._type)
            == name
    }

    /// Returns true if the server rejected the request nonce.
    pub fn is_bad_nonce(&self) -> bool {
        self.is_acme_error("badNonce")
    }

    /// Returns true if an `onlyReturnExisting` lookup found no account for the key.
    pub fn is_account_does_not_exist(&self) -> bool {
        self.is_acme_error("accountDoesNotExist")
    }

    /// Returns true if problem details indicate that JWS verification failed.
    pub fn is_jws_verification_error(&self) -> bool {
        self.is_acme_error("malformed")
            && self
                .detail
                .as_deref()
                .is_some_and(|detail| detail == "JWS verification error")
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}: {detail}", self._type)?,
            None => write!(f, "{}", self._type)?,
        }

        for sub in self.subproblems.iter().flatten() {
            write!(f, "; {sub}")?;
        }

        Ok(())
    }
}

impl std::error::Error for Problem {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subproblem {
    #[serde(rename = "type")]
    pub _type: String,
    pub detail: Option<String>,
    pub identifier: Option<Identifier>,
}

impl fmt::Display for Subproblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(identifier) = &self.identifier {
            write!(f, "[{}] ", identifier.value)?;
        }

        write!(f, "{}", self._type)?;

        if let Some(detail) = &self.detail {
            write!(f, ": {detail}")?;
        }

        Ok(())
    }
}
