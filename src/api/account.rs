use serde::{Deserialize, Serialize};

/// An ACME account resource, as sent to and returned from the `newAccount` endpoint.
///
/// See [RFC 8555 §7.1.2] and [§7.3].
///
/// [RFC 8555 §7.1.2]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.1.2
/// [§7.3]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.3
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub terms_of_service_agreed: Option<bool>,

    /// Look up the account bound to the request key instead of creating one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub only_return_existing: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub orders: Option<String>,
}

impl Account {
    pub(crate) fn lookup() -> Self {
        Account {
            only_return_existing: Some(true),
            ..Default::default()
        }
    }

    pub(crate) fn registration(contact: &[String], terms_of_service_agreed: bool) -> Self {
        Account {
            contact: (!contact.is_empty()).then(|| contact.to_vec()),
            terms_of_service_agreed: Some(terms_of_service_agreed),
            ..Default::default()
        }
    }

    pub fn is_status_valid(&self) -> bool {
        self.status.as_deref() == Some("valid")
    }
}
