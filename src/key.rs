use std::{fs, io, path::Path};

use eyre::WrapErr as _;
use pkcs8::{DecodePrivateKey as _, EncodePrivateKey as _};
use zeroize::Zeroizing;

/// Make a P-256 private key (from which we can derive a public key).
pub fn create_p256_key() -> p256::ecdsa::SigningKey {
    let csprng = &mut rand::thread_rng();
    ecdsa::SigningKey::from(p256::SecretKey::random(csprng))
}

pub(crate) fn signing_key_from_pem(pem: &str) -> eyre::Result<p256::ecdsa::SigningKey> {
    p256::ecdsa::SigningKey::from_pkcs8_pem(pem).wrap_err("Failed to read PEM")
}

pub(crate) fn signing_key_to_pem(key: &p256::ecdsa::SigningKey) -> eyre::Result<Zeroizing<String>> {
    key.to_pkcs8_pem(pem::LineEnding::LF)
        .wrap_err("private_key_to_pem")
}

/// Reads a PKCS#8 PEM key file. `Ok(None)` when the file does not exist.
pub(crate) fn load_key(path: &Path) -> eyre::Result<Option<p256::ecdsa::SigningKey>> {
    let pem = match fs::read_to_string(path) {
        Ok(pem) => Zeroizing::new(pem),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).wrap_err_with(|| format!("reading key file {}", path.display()))
        }
    };

    signing_key_from_pem(&pem)
        .wrap_err_with(|| format!("parsing key file {}", path.display()))
        .map(Some)
}

/// Reads the key at `path`, generating and persisting a new one if there is none yet.
pub(crate) fn load_or_create_key(path: &Path) -> eyre::Result<p256::ecdsa::SigningKey> {
    if let Some(key) = load_key(path)? {
        log::debug!("Loaded key pair from {}", path.display());
        return Ok(key);
    }

    log::info!("Generating new key pair at {}", path.display());

    let key = create_p256_key();
    let pem = signing_key_to_pem(&key)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .wrap_err_with(|| format!("creating key directory {}", parent.display()))?;
    }
    fs::write(path, pem.as_bytes())
        .wrap_err_with(|| format!("writing key file {}", path.display()))?;

    Ok(key)
}

/// Account key used to sign JWS requests.
#[derive(Clone, Debug)]
pub(crate) struct AcmeKey {
    signing_key: p256::ecdsa::SigningKey,

    /// Set once we contacted the ACME API to figure out the key ID.
    key_id: Option<String>,
}

impl AcmeKey {
    pub(crate) fn from_key(signing_key: p256::ecdsa::SigningKey) -> AcmeKey {
        AcmeKey {
            signing_key,
            key_id: None,
        }
    }

    pub(crate) fn signing_key(&self) -> &p256::ecdsa::SigningKey {
        &self.signing_key
    }

    pub(crate) fn key_id(&self) -> eyre::Result<&str> {
        self.key_id
            .as_deref()
            .ok_or_else(|| eyre::eyre!("account key ID is not known yet"))
    }

    pub(crate) fn set_key_id(&mut self, kid: String) {
        self.key_id = Some(kid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_key_is_persisted_and_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys/account.pem");

        assert!(load_key(&path).unwrap().is_none());

        let created = load_or_create_key(&path).unwrap();
        assert!(path.exists());

        let loaded = load_or_create_key(&path).unwrap();
        assert_eq!(created, loaded);
    }

    #[test]
    fn garbage_key_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("account.pem");
        fs::write(&path, "not a key").unwrap();

        assert!(load_or_create_key(&path).is_err());
    }
}
