use serde::{Deserialize, Serialize};

/// Certificate revocation request.
///
/// See [RFC 8555 §7.6].
///
/// [RFC 8555 §7.6]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.6
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revocation {
    /// The certificate to be revoked, base64url-encoded DER (not PEM).
    pub certificate: String,

    /// Reason code from [RFC 5280 §5.3.1]; absent for "unspecified".
    ///
    /// [RFC 5280 §5.3.1]: https://datatracker.ietf.org/doc/html/rfc5280#section-5.3.1
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<u8>,
}
