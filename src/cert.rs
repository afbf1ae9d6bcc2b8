use std::{
    collections::BTreeSet,
    str::FromStr as _,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use der::{
    asn1::{Ia5String, PrintableStringRef, Utf8StringRef},
    oid::{AssociatedOid as _, ObjectIdentifier},
    Decode as _, Encode as _,
};
use eyre::WrapErr as _;
use rustls_pki_types::CertificateDer;
use x509_cert::{
    builder::{Builder, RequestBuilder as CsrBuilder},
    ext::pkix::{name::GeneralName, SubjectAltName},
    name::Name,
    Certificate,
};
use zeroize::Zeroizing;

const COMMON_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.3");

/// Creates a CSR for `domains` with `subject` and signs it with `signer`.
///
/// All domains go into the Subject Alternative Name extension.
pub(crate) fn create_csr(
    signer: &p256::ecdsa::SigningKey,
    subject: Name,
    domains: &[String],
) -> eyre::Result<Vec<u8>> {
    let mut csr = CsrBuilder::new(subject, signer).wrap_err("CSR builder")?;

    let names = domains
        .iter()
        .map(|domain| Ok(GeneralName::DnsName(Ia5String::new(domain)?)))
        .collect::<Result<Vec<_>, der::Error>>()?;

    csr.add_extension(&SubjectAltName(names))
        .wrap_err("CSR subject alternative names")?;

    let csr = csr
        .build::<p256::ecdsa::DerSignature>()
        .wrap_err("build csr")?;

    Ok(csr.to_der()?)
}

/// Parses a configured distinguished name such as `CN=example.com,O=Example`.
pub(crate) fn parse_name(dn: &str) -> eyre::Result<Name> {
    Name::from_str(dn).wrap_err_with(|| format!("invalid distinguished name {dn:?}"))
}

/// A freshly issued certificate along with its private key.
///
/// Handed to the keystore collaborator on install; only the serial and directory are kept
/// afterwards.
#[derive(Clone)]
pub struct IssuedCertificate {
    private_key_pem: Zeroizing<String>,
    chain: Vec<CertificateDer<'static>>,
    directory_url: String,
    account_url: String,
}

impl IssuedCertificate {
    pub(crate) fn new(
        private_key_pem: Zeroizing<String>,
        chain: Vec<CertificateDer<'static>>,
        directory_url: String,
        account_url: String,
    ) -> Self {
        IssuedCertificate {
            private_key_pem,
            chain,
            directory_url,
            account_url,
        }
    }

    /// The private key in PKCS#8 PEM format.
    pub fn private_key(&self) -> &str {
        &self.private_key_pem
    }

    /// Leaf first, then the intermediates as sent by the CA.
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    /// The directory URL of the CA that issued the certificate.
    pub fn directory_url(&self) -> &str {
        &self.directory_url
    }

    /// The account URL the certificate was ordered with.
    pub fn account_url(&self) -> &str {
        &self.account_url
    }

    pub fn leaf(&self) -> eyre::Result<Certificate> {
        let leaf = self
            .chain
            .first()
            .ok_or_else(|| eyre::eyre!("no certificates in chain"))?;
        parse(leaf)
    }
}

impl std::fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("chain_len", &self.chain.len())
            .field("directory_url", &self.directory_url)
            .field("account_url", &self.account_url)
            .finish_non_exhaustive()
    }
}

pub(crate) fn parse(der: &CertificateDer<'_>) -> eyre::Result<Certificate> {
    Certificate::from_der(der.as_ref()).wrap_err("parsing certificate")
}

/// Lower-case hex serial without leading zeros, e.g. `ab12`.
pub fn serial_hex(cert: &Certificate) -> String {
    let hex = cert
        .tbs_certificate
        .serial_number
        .as_bytes()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<String>();

    match hex.trim_start_matches('0') {
        "" => "0".to_owned(),
        hex => hex.to_owned(),
    }
}

pub(crate) fn not_after(cert: &Certificate) -> SystemTime {
    UNIX_EPOCH + cert.tbs_certificate.validity.not_after.to_unix_duration()
}

/// Time left until `not_after`, zero when already expired.
pub(crate) fn remaining_validity(cert: &Certificate, now: SystemTime) -> Duration {
    not_after(cert).duration_since(now).unwrap_or_default()
}

fn attribute_string(value: &der::Any) -> Option<String> {
    if let Ok(s) = value.decode_as::<Utf8StringRef<'_>>() {
        return Some(s.as_str().to_owned());
    }
    if let Ok(s) = value.decode_as::<PrintableStringRef<'_>>() {
        return Some(s.as_str().to_owned());
    }
    None
}

/// First common name of `name`.
pub(crate) fn common_name(name: &Name) -> Option<String> {
    name.0
        .iter()
        .flat_map(|rdn| rdn.0.iter())
        .find(|atv| atv.oid == COMMON_NAME)
        .and_then(|atv| attribute_string(&atv.value))
}

/// Lower-cased `TYPE=value` attributes of `name`, order-insensitive.
pub(crate) fn name_attributes(name: &Name) -> BTreeSet<String> {
    name.0
        .iter()
        .flat_map(|rdn| rdn.0.iter())
        .map(|atv| atv.to_string().to_ascii_lowercase())
        .collect()
}

pub(crate) fn rdn_count(name: &Name) -> usize {
    name.0.len()
}

/// The subject CN and every SAN DNS name, lower-cased.
pub(crate) fn dns_names(cert: &Certificate) -> BTreeSet<String> {
    let mut names = BTreeSet::new();

    if let Some(cn) = common_name(&cert.tbs_certificate.subject) {
        names.insert(cn.to_ascii_lowercase());
    }

    for ext in cert.tbs_certificate.extensions.iter().flatten() {
        if ext.extn_id != SubjectAltName::OID {
            continue;
        }

        let Ok(san) = SubjectAltName::from_der(ext.extn_value.as_bytes()) else {
            log::warn!("Ignoring malformed subject alternative name extension");
            continue;
        };

        for name in san.0 {
            if let GeneralName::DnsName(dns) = name {
                names.insert(dns.to_string().to_ascii_lowercase());
            }
        }
    }

    names
}

/// Formats a `SystemTime` as RFC 3339 for log lines and order requests.
pub(crate) fn rfc3339(time: SystemTime) -> String {
    time::OffsetDateTime::from(time)
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| format!("{time:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{key::create_p256_key, test::TestCa};

    #[test]
    fn csr_carries_all_domains() {
        let key = create_p256_key();
        let subject = parse_name("CN=a.example.com,O=Example").unwrap();
        let domains = vec!["a.example.com".to_owned(), "b.example.com".to_owned()];

        let der = create_csr(&key, subject, &domains).unwrap();
        let csr = x509_cert::request::CertReq::from_der(&der).unwrap();

        assert_eq!(
            common_name(&csr.info.subject).as_deref(),
            Some("a.example.com")
        );
    }

    #[test]
    fn serial_is_lower_hex_without_padding() {
        let ca = TestCa::new();
        let leaf = ca.leaf(&["a.example.com"]).serial(&[0xab, 0x12]).issue();
        let cert = parse(&leaf.chain[0]).unwrap();

        assert_eq!(serial_hex(&cert), "ab12");
    }

    #[test]
    fn dns_names_include_cn_and_sans() {
        let ca = TestCa::new();
        let leaf = ca
            .leaf(&["Www.Example.com", "api.example.com"])
            .common_name("example.com")
            .issue();
        let cert = parse(&leaf.chain[0]).unwrap();

        let names = dns_names(&cert);
        assert!(names.contains("example.com"));
        assert!(names.contains("www.example.com"));
        assert!(names.contains("api.example.com"));
    }

    #[test]
    fn name_attributes_ignore_order_and_case() {
        let a = parse_name("CN=a.example.com,O=Example").unwrap();
        let b = parse_name("O=example,CN=A.example.com").unwrap();

        assert_eq!(name_attributes(&a), name_attributes(&b));
        assert_eq!(rdn_count(&a), 2);
    }
}
