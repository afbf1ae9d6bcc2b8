use std::{collections::VecDeque, sync::Arc};

use parking_lot::Mutex;
use serde::Serialize;

use crate::{
    jws::{jws_with, Jwk, JwsProtectedHeader},
    key::AcmeKey,
    req::{req_expect_header, req_handle_error, req_head, req_post},
};

/// Attempts before a request that keeps hitting `badNonce` is given up on.
const MAX_NONCE_RETRIES: usize = 5;

/// JWS payload and nonce handling for requests to the API.
///
/// Setup is:
///
/// 1. `Transport::new()`
/// 2. `call_jwk()` against newAccount url
/// 3. `set_key_id` from the returned `Location` header.
/// 4. `call_kid()` for all calls after that.
#[derive(Clone, Debug)]
pub(crate) struct Transport {
    acme_key: AcmeKey,
    nonce_pool: Arc<NoncePool>,
}

impl Transport {
    pub fn new(nonce_pool: Arc<NoncePool>, acme_key: AcmeKey) -> Self {
        Transport {
            acme_key,
            nonce_pool,
        }
    }

    /// Update the key ID once it is known (part of setting up the transport).
    pub fn set_key_id(&mut self, kid: String) {
        self.acme_key.set_key_id(kid);
    }

    pub fn acme_key(&self) -> &AcmeKey {
        &self.acme_key
    }

    /// Make call using the full JWK. Only for `newAccount`.
    pub async fn call_jwk<T>(&self, url: &str, body: &T) -> eyre::Result<reqwest::Response>
    where
        T: Serialize + ?Sized,
    {
        fn jws_with_jwk<T: Serialize + ?Sized>(
            url: &str,
            nonce: String,
            key: &AcmeKey,
            payload: &T,
        ) -> eyre::Result<String> {
            let jwk = Jwk::try_from(key)?;
            let protected = JwsProtectedHeader::new_jwk(jwk, url, nonce);
            jws_with(protected, key, payload)
        }

        self.do_call(url, body, jws_with_jwk).await
    }

    /// Make call using the key ID.
    pub async fn call_kid<T>(&self, url: &str, body: &T) -> eyre::Result<reqwest::Response>
    where
        T: Serialize + ?Sized,
    {
        fn jws_with_kid<T: Serialize + ?Sized>(
            url: &str,
            nonce: String,
            key: &AcmeKey,
            payload: &T,
        ) -> eyre::Result<String> {
            let protected = JwsProtectedHeader::new_kid(key.key_id()?, url, nonce);
            jws_with(protected, key, payload)
        }

        self.do_call(url, body, jws_with_kid).await
    }

    async fn do_call<T, F>(
        &self,
        url: &str,
        body: &T,
        make_body: F,
    ) -> eyre::Result<reqwest::Response>
    where
        T: Serialize + ?Sized,
        F: Fn(&str, String, &AcmeKey, &T) -> eyre::Result<String>,
    {
        let mut attempt = 0;

        // The ACME API may at any point invalidate all nonces. If we detect such an
        // error, we retry with a fresh one.
        loop {
            attempt += 1;

            let nonce = self.nonce_pool.get_nonce().await?;
            let body = make_body(url, nonce, &self.acme_key, body)?;

            log::debug!("Call endpoint: {url}");

            let response = req_post(url, body).await?;

            // Regardless of the request being a success or not, there might be a nonce in the
            // response.
            self.nonce_pool.extract_nonce(&response);

            match req_handle_error(response).await {
                Ok(response) => return Ok(response),

                Err(problem) if problem.is_bad_nonce() && attempt < MAX_NONCE_RETRIES => {
                    log::debug!("Retrying on bad nonce");
                }

                Err(problem) if problem.is_jws_verification_error() && attempt < MAX_NONCE_RETRIES => {
                    log::debug!("Retrying on: {problem}");
                }

                Err(problem) => return Err(eyre::Report::new(problem)),
            }
        }
    }
}

/// Shared pool of nonces.
#[derive(Default, Debug)]
pub(crate) struct NoncePool {
    nonce_url: String,
    pool: Mutex<VecDeque<String>>,
}

impl NoncePool {
    pub fn new(nonce_url: &str) -> Self {
        NoncePool {
            nonce_url: nonce_url.to_owned(),
            ..Default::default()
        }
    }

    fn extract_nonce(&self, res: &reqwest::Response) {
        let Some(nonce) = res
            .headers()
            .get("replay-nonce")
            .and_then(|nonce| nonce.to_str().ok())
        else {
            return;
        };

        log::trace!("Extracting new nonce");

        let mut pool = self.pool.lock();
        pool.push_back(nonce.to_owned());

        if pool.len() > 10 {
            pool.pop_front();
        }
    }

    async fn get_nonce(&self) -> eyre::Result<String> {
        {
            let mut pool = self.pool.lock();

            if let Some(nonce) = pool.pop_front() {
                log::trace!("Use previous nonce");
                return Ok(nonce);
            }
        }

        log::debug!("Request new nonce");
        let res = req_head(&self.nonce_url).await?;

        Ok(req_expect_header(&res, "replay-nonce")?)
    }
}
