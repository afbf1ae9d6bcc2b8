//! HTTP-01 challenge responses.
//!
//! While a challenge is being validated the CA fetches
//! `http://<domain>/.well-known/acme-challenge/<token>` and expects the key authorization back.
//! The table here is what the host's HTTP responder reads from; it is written by the protocol
//! client and read from arbitrary request threads.

use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;

use crate::{jws, key::AcmeKey};

/// Computes the `http-01` key authorization, `token || '.' || base64url(JWK thumbprint)`.
///
/// See [RFC 8555 §8.1].
///
/// [RFC 8555 §8.1]: https://datatracker.ietf.org/doc/html/rfc8555#section-8.1
pub(crate) fn key_authorization(token: &str, key: &AcmeKey) -> eyre::Result<String> {
    Ok(format!("{token}.{}", jws::thumbprint(key)?))
}

/// Live token to key authorization mappings.
#[derive(Debug, Clone, Default)]
pub(crate) struct ChallengeTokens {
    tokens: Arc<RwLock<HashMap<String, String>>>,
}

impl ChallengeTokens {
    pub fn get(&self, token: &str) -> Option<String> {
        self.tokens.read().get(token).cloned()
    }

    /// Makes `token` answerable until the returned guard is dropped.
    #[must_use]
    pub fn publish(&self, token: &str, key_authorization: String) -> PublishedToken {
        log::debug!("Publishing HTTP-01 response for token {token}");

        self.tokens
            .write()
            .insert(token.to_owned(), key_authorization);

        PublishedToken {
            tokens: self.clone(),
            token: token.to_owned(),
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.tokens.read().len()
    }
}

/// Removes its token from the table on drop, whichever way the challenge ended.
#[derive(Debug)]
pub(crate) struct PublishedToken {
    tokens: ChallengeTokens,
    token: String,
}

impl Drop for PublishedToken {
    fn drop(&mut self) {
        log::debug!("Removing HTTP-01 response for token {}", self.token);
        self.tokens.tokens.write().remove(&self.token);
    }
}
