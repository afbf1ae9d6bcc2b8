use rustls_pki_types::CertificateDer;

use crate::config::KeystoreLocation;

/// Storage for the installed certificate, provided by the host.
///
/// The lifecycle manager only ever goes through this trait; the container format (PKCS#12, a
/// directory of PEM files, an HSM) is the host's business.
pub trait Keystore: Send + Sync {
    /// Returns true if a keystore exists at `location`, even if it holds no certificate.
    fn exists(&self, location: &KeystoreLocation) -> eyre::Result<bool>;

    /// The installed chain, leaf first. `Ok(None)` when nothing is installed.
    fn certificate_chain(
        &self,
        location: &KeystoreLocation,
    ) -> eyre::Result<Option<Vec<CertificateDer<'static>>>>;

    /// Replaces whatever is installed at `location` with `chain` and its private key.
    fn install(
        &self,
        location: &KeystoreLocation,
        private_key_pem: &str,
        chain: &[CertificateDer<'static>],
    ) -> eyre::Result<()>;

    /// Creates an empty keystore so the host can start without a certificate.
    fn create_empty(&self, location: &KeystoreLocation) -> eyre::Result<()>;
}
