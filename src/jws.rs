//! JWS request signing, see [RFC 8555 §6.2].
//!
//! [RFC 8555 §6.2]: https://datatracker.ietf.org/doc/html/rfc8555#section-6.2

use base64::prelude::*;
use ecdsa::signature::Signer as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::key::AcmeKey;

/// JWS protected header.
///
/// `newAccount` requests (and lookups by key) carry the full `jwk`; every other request is signed
/// with the account URL in `kid`. The two are mutually exclusive.
#[derive(Debug, Serialize, Deserialize, Default)]
pub(crate) struct JwsProtectedHeader {
    /// Only ES256 (P-256) is produced.
    alg: String,

    /// Replay nonce from the server, base64url.
    nonce: String,

    /// Target URL of the request; must match the request URL exactly.
    url: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    jwk: Option<Jwk>,

    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<String>,
}

impl JwsProtectedHeader {
    pub(crate) fn new_jwk(jwk: Jwk, url: &str, nonce: String) -> Self {
        JwsProtectedHeader {
            alg: "ES256".to_owned(),
            url: url.to_owned(),
            nonce,
            jwk: Some(jwk),
            ..Default::default()
        }
    }

    pub(crate) fn new_kid(kid: &str, url: &str, nonce: String) -> Self {
        JwsProtectedHeader {
            alg: "ES256".to_owned(),
            url: url.to_owned(),
            nonce,
            kid: Some(kid.to_owned()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub(crate) struct Jwk {
    alg: String,
    crv: String,
    kty: String,
    #[serde(rename = "use")]
    _use: String,
    x: String,
    y: String,
}

impl TryFrom<&AcmeKey> for Jwk {
    type Error = eyre::Error;

    fn try_from(a: &AcmeKey) -> eyre::Result<Self> {
        let point = a.signing_key().verifying_key().to_encoded_point(false);

        let (Some(x), Some(y)) = (point.x(), point.y()) else {
            eyre::bail!("account public key is not an uncompressed point");
        };

        Ok(Jwk {
            alg: "ES256".to_owned(),
            kty: "EC".to_owned(),
            crv: "P-256".to_owned(),
            _use: "sig".to_owned(),
            x: BASE64_URL_SAFE_NO_PAD.encode(x),
            y: BASE64_URL_SAFE_NO_PAD.encode(y),
        })
    }
}

/// Members required for the RFC 7638 thumbprint.
#[derive(Debug, Serialize, Deserialize, Clone)]
// LEXICAL ORDER OF FIELDS MATTER!
pub(crate) struct JwkThumb {
    crv: String,
    kty: String,
    x: String,
    y: String,
}

impl From<&Jwk> for JwkThumb {
    fn from(a: &Jwk) -> Self {
        JwkThumb {
            crv: a.crv.clone(),
            kty: a.kty.clone(),
            x: a.x.clone(),
            y: a.y.clone(),
        }
    }
}

/// base64url(SHA-256(thumbprint JSON)) of the account key.
pub(crate) fn thumbprint(key: &AcmeKey) -> eyre::Result<String> {
    let jwk = Jwk::try_from(key)?;
    let jwk_json = serde_json::to_string(&JwkThumb::from(&jwk))?;
    Ok(BASE64_URL_SAFE_NO_PAD.encode(Sha256::digest(jwk_json)))
}

/// <https://datatracker.ietf.org/doc/html/rfc7515#section-7.2.2>
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct FlattenedJsonJws {
    protected: String,
    payload: String,
    signature: String,
}

/// Construct JWS with protected header according to [RFC 7515 §5.1].
///
/// [RFC 7515 §5.1]: https://datatracker.ietf.org/doc/html/rfc7515#section-5.1
pub(crate) fn jws_with<T: Serialize + ?Sized>(
    protected: JwsProtectedHeader,
    key: &AcmeKey,
    payload: &T,
) -> eyre::Result<String> {
    let header = BASE64_URL_SAFE_NO_PAD.encode(serde_json::to_string(&protected)?);

    let payload = {
        let payload_json = serde_json::to_string(payload)?;

        // POST-as-GET carries an empty payload, not base64url("\"\"")
        if payload_json == "\"\"" {
            String::new()
        } else {
            BASE64_URL_SAFE_NO_PAD.encode(payload_json)
        }
    };

    let to_sign = format!("{header}.{payload}");
    let signature: p256::ecdsa::Signature = key
        .signing_key()
        .try_sign(to_sign.as_bytes())
        .map_err(|err| eyre::eyre!("signing request: {err}"))?;

    let jws = FlattenedJsonJws {
        protected: header,
        payload,
        signature: BASE64_URL_SAFE_NO_PAD.encode(signature.to_bytes()),
    };

    Ok(serde_json::to_string(&jws)?)
}
