use serde::{Deserialize, Serialize};

use crate::api;

/// The status of an [`api::Order`].
///
/// `valid` and `invalid` are terminal.
///
/// See [RFC 8555 §7.1.6].
///
/// [RFC 8555 §7.1.6]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.1.6
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

/// An ACME order object.
///
/// See [RFC 8555 §7.1.3].
///
/// # Example JSON
///
/// ```json
/// {
///   "status": "pending",
///   "expires": "2019-01-09T08:26:43.570360537Z",
///   "identifiers": [{ "type": "dns", "value": "acmetest.algesten.se" }],
///   "authorizations": ["https://example.com/acme/authz/YTqpYUthlVfwBncUufE8"],
///   "finalize": "https://example.com/acme/finalize/7738992/18234324"
/// }
/// ```
///
/// [RFC 8555 §7.1.3]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.1.3
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<OrderStatus>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<String>,

    pub identifiers: Vec<api::Identifier>,

    /// Requested end of the validity period, RFC 3339.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_after: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<api::Problem>,

    #[serde(default, skip_serializing)]
    pub authorizations: Vec<String>,

    #[serde(default, skip_serializing)]
    pub finalize: String,

    #[serde(skip_serializing)]
    pub certificate: Option<String>,
}

impl Order {
    /// Builds a `newOrder` request payload.
    pub(crate) fn request(domains: &[String], not_after: Option<String>) -> Self {
        Self {
            identifiers: domains.iter().map(|d| api::Identifier::dns(d)).collect(),
            not_after,
            ..Default::default()
        }
    }

    /// Returns all domains associated with this order.
    pub fn domains(&self) -> Vec<&str> {
        self.identifiers
            .iter()
            .map(|identifier| identifier.value.as_str())
            .collect()
    }
}

/// Finalize request carrying the signed CSR.
///
/// See [RFC 8555 §7.4].
///
/// [RFC 8555 §7.4]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.4
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finalize {
    /// CSR in base64url-encoded DER.
    pub csr: String,
}
