//! Keeps an ACME-issued TLS certificate installed, renewed and unrevoked.
//!
//! Certificates are obtained from ACME (Automatic Certificate Management Environment) providers
//! such as [Let's Encrypt](https://letsencrypt.org/) following
//! [RFC 8555](https://datatracker.ietf.org/doc/html/rfc8555), validated with `http-01`
//! challenges.
//!
//! # Usage
//!
//! The host application owns two things this crate only talks to:
//!
//! - a keystore the certificate and its private key get installed into, see [`Keystore`];
//! - an HTTP responder serving `/.well-known/acme-challenge/<token>` with whatever
//!   [`CertificateLifecycleManager::http_authorization`] returns for the token.
//!
//! With those in place, [`CertificateLifecycleManager::activate`] creates the first certificate
//! if needed and starts periodic checks that renew it when it is about to expire, no longer
//! matches the configured domains or subject, or has been revoked.
//!
//! # Rate Limits
//!
//! Let's Encrypt uses [rate limits] to ensure the API is not being abused. Keep the retry waits
//! and the minimum renewal window reasonable and use the staging environment for development.
//!
//! [rate limits]: https://letsencrypt.org/docs/rate-limits

#![deny(rust_2018_idioms, nonstandard_style, future_incompatible)]

mod account;
mod cert;
mod challenge;
mod client;
mod config;
mod decision;
mod dir;
mod error;
mod history;
mod jws;
mod key;
mod keystore;
mod manager;
mod req;
mod revocation;
mod scheduler;
mod trans;

pub mod api;


pub use crate::{
    account::RevocationReason,
    cert::IssuedCertificate,
    client::AcmeProtocolClient,
    config::{KeystoreLocation, RenewalConfig, RevocationConfig},
    decision::{is_renewal_required, renewal_reason, RenewalReason},
    error::{Error, Result},
    history::{CertificateHistoryLog, HistoryEntry},
    key::create_p256_key,
    keystore::Keystore,
    manager::{CertificateLifecycleManager, CheckOutcome, Collaborators},
    revocation::RevocationChecker,
    scheduler::{RenewalScheduler, ScheduleSettings, SchedulerState},
};
