use serde::{Deserialize, Serialize};

use crate::api;

/// The status of an [`api::Authorization`].
///
/// See [RFC 8555 §7.1.4].
///
/// [RFC 8555 §7.1.4]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.1.4
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Deactivated,
    Expired,
    Revoked,
}

// on incorrect challenge, something like:
//
//   "challenges": [
//     {
//       "type": "http-01",
//       "status": "invalid",
//       "error": {
//         "type": "urn:ietf:params:acme:error:unauthorized",
//         "detail": "Invalid response from http://martintest.foobar.com/.well-known/acme-challenge/...",
//         "status": 403
//       },
//       "url": "https://example.com/acme/chall/afyChhlFB8GLLmIqEnqqcXzX0Ss3GBw6oUlKAGDG6lY",
//       "token": "YsNqBWZnyYjDun3aUC2CkCopOaqZRrI5hp3tUjxPLQU"
//     },

/// An ACME authorization object, one per identifier in an order.
///
/// See [RFC 8555 §7.1.4].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorization {
    pub identifier: api::Identifier,
    pub status: AuthorizationStatus,

    /// RFC 3339. Required for valid authorizations.
    pub expires: Option<String>,

    pub challenges: Vec<Challenge>,
    pub wildcard: Option<bool>,
}

impl Authorization {
    /// Returns an `http-01` challenge, if one is present.
    pub fn http_challenge(&self) -> Option<&Challenge> {
        self.challenges.iter().find(|c| c._type == "http-01")
    }

    /// First error reported on any of the challenges.
    pub fn challenge_error(&self) -> Option<&api::Problem> {
        self.challenges.iter().find_map(|c| c.error.as_ref())
    }
}

/// The status of an [`api::Challenge`].
///
/// See [RFC 8555 §7.1.6].
///
/// [RFC 8555 §7.1.6]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.1.6
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

/// An ACME challenge object.
///
/// See [RFC 8555 §7.1.5] and, for `http-01`, [§8.3].
///
/// [RFC 8555 §7.1.5]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.1.5
/// [§8.3]: https://datatracker.ietf.org/doc/html/rfc8555#section-8.3
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    #[serde(rename = "type")]
    pub _type: String,

    pub url: String,
    pub status: ChallengeStatus,

    /// RFC 3339.
    pub validated: Option<String>,

    pub error: Option<api::Problem>,

    #[serde(default)]
    pub token: String,
}
