//! PKCS#12 certificate resolution and transient PEM materialization.
//!
//! Resolution is a two-step strategy: decode the container natively, and only
//! when [`classify_failure`] says the container uses a legacy PBE cipher, fall
//! back to an external `openssl pkcs12 -legacy` run (see [`choose_strategy`]).
use base64ct::{Base64, Encoding};
use chrono::{DateTime, Utc};
use const_oid::ObjectIdentifier;
use p12_keystore::KeyStore;
use rsa::{
    RsaPrivateKey,
    pkcs1::DecodeRsaPrivateKey,
    pkcs8::{DecodePrivateKey, EncodePrivateKey, PrivateKeyInfo},
};
use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    process::Command,
};
use tempfile::{Builder, NamedTempFile};
use thiserror::Error;
use tracing::{debug, info, warn};
use x509_cert::{Certificate, der::Decode};
use zeroize::Zeroizing;

use crate::config::{CertificateConfig, Config};

const RSA_ENCRYPTION: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");

/// PBE schemes under `1.2.840.113549.1.12.1` that modern stacks refuse to decrypt.
const LEGACY_PBE_OIDS: [ObjectIdentifier; 5] = [
    // pbeWithSHAAnd128BitRC4
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.12.1.1"),
    // pbeWithSHAAnd40BitRC4
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.12.1.2"),
    // pbeWithSHAAnd2-KeyTripleDES-CBC
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.12.1.4"),
    // pbeWithSHAAnd128BitRC2-CBC
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.12.1.5"),
    // pbeWithSHAAnd40BitRC2-CBC
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.12.1.6"),
];

/// Child environment variable carrying the password to OpenSSL.
const PASSWORD_ENV: &str = "SIFEN_P12_PASSWORD";

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("certificate file not found: {path}")]
    NotFound { path: PathBuf },
    #[error("wrong PKCS#12 password")]
    WrongPassword,
    #[error("no private key found in PKCS#12 container")]
    NoPrivateKey,
    #[error("no certificate found in PKCS#12 container")]
    NoCertificate,
    #[error("openssl binary not found: {binary}")]
    OpenSslNotFound { binary: PathBuf },
    #[error("openssl failed ({status}): {stderr}")]
    OpenSslFailed { status: String, stderr: String },
    #[error("openssl output for the {output} lacks the expected PEM marker")]
    MissingPemMarker { output: &'static str },
    #[error("malformed certificate material: {0}")]
    Malformed(String),
    #[error("unsupported private key: {0}")]
    UnsupportedKey(String),
    #[error("no certificate configured")]
    NotConfigured,
    #[error("certificate I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Why native PKCS#12 decoding failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pkcs12Failure {
    BadPassword,
    /// Container uses one of the legacy PBE ciphers; carries the OID found.
    LegacyCipher(ObjectIdentifier),
    Malformed(String),
}

/// What to do after a native decoding failure.
#[derive(Debug)]
pub enum Fallback {
    Fail(CertificateError),
    OpenSslLegacy,
}

/// Classifies a native decoding failure by looking at the error and at the
/// algorithm identifiers present in the container.
pub fn classify_failure(container: &[u8], error: &p12_keystore::error::Error) -> Pkcs12Failure {
    match error {
        p12_keystore::error::Error::MacError(_) | p12_keystore::error::Error::UnpadError => {
            Pkcs12Failure::BadPassword
        }
        p12_keystore::error::Error::UnsupportedEncryptionScheme => match legacy_cipher(container) {
            Some(oid) => Pkcs12Failure::LegacyCipher(oid),
            None => Pkcs12Failure::Malformed(error.to_string()),
        },
        other => Pkcs12Failure::Malformed(other.to_string()),
    }
}

/// Picks the fallback for a classified failure.
pub fn choose_strategy(failure: &Pkcs12Failure) -> Fallback {
    match failure {
        Pkcs12Failure::BadPassword => Fallback::Fail(CertificateError::WrongPassword),
        Pkcs12Failure::LegacyCipher(_) => Fallback::OpenSslLegacy,
        Pkcs12Failure::Malformed(message) => {
            Fallback::Fail(CertificateError::Malformed(message.clone()))
        }
    }
}

/// First legacy PBE OID whose DER encoding appears in `container`.
pub fn legacy_cipher(container: &[u8]) -> Option<ObjectIdentifier> {
    LEGACY_PBE_OIDS.into_iter().find(|oid| {
        let body = oid.as_bytes();
        // short-form DER length only
        let Some(len) = u8::try_from(body.len()).ok().filter(|len| *len < 0x80) else {
            return false;
        };
        let mut needle = Vec::with_capacity(body.len() + 2);
        needle.push(0x06);
        needle.push(len);
        needle.extend_from_slice(body);
        container
            .windows(needle.len())
            .any(|window| window == needle.as_slice())
    })
}

/// How a bundle was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionStrategy {
    Native,
    OpenSslLegacy,
    Pem,
}

/// Private key and leaf certificate extracted from a PKCS#12 container.
pub struct CertificateBundle {
    key_der: Zeroizing<Vec<u8>>,
    key_algorithm: ObjectIdentifier,
    certificate: Certificate,
    certificate_der: Vec<u8>,
    strategy: ResolutionStrategy,
}

impl std::fmt::Debug for CertificateBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateBundle")
            .field("key", &"<KEY>")
            .field("key_algorithm", &self.key_algorithm)
            .field("subject", &self.subject())
            .field("strategy", &self.strategy)
            .finish()
    }
}

impl CertificateBundle {
    /// Builds a bundle from a PKCS#8 (or PKCS#1 RSA) private key and a certificate, both DER.
    pub fn from_der(certificate_der: &[u8], key_der: &[u8]) -> Result<Self, CertificateError> {
        Self::assemble(certificate_der, key_der, ResolutionStrategy::Pem)
    }

    /// Builds a bundle from PEM text. The inputs may carry extra text around the
    /// PEM blocks (OpenSSL bag attributes, for instance).
    pub fn from_pem(certificate_pem: &str, key_pem: &str) -> Result<Self, CertificateError> {
        let cert_der = pem_block(certificate_pem, "CERTIFICATE")
            .ok_or(CertificateError::MissingPemMarker { output: "certificate" })??;
        let key_der = private_key_der(key_pem)?;
        Self::assemble(&cert_der, &key_der, ResolutionStrategy::Pem)
    }

    fn assemble(
        certificate_der: &[u8],
        key_der: &[u8],
        strategy: ResolutionStrategy,
    ) -> Result<Self, CertificateError> {
        let certificate = Certificate::from_der(certificate_der)
            .map_err(|e| CertificateError::Malformed(format!("certificate: {e}")))?;
        let (key_der, key_algorithm) = normalize_key(key_der)?;
        Ok(Self {
            key_der,
            key_algorithm,
            certificate,
            certificate_der: certificate_der.to_vec(),
            strategy,
        })
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    pub fn certificate_der(&self) -> &[u8] {
        &self.certificate_der
    }

    pub fn key_algorithm(&self) -> ObjectIdentifier {
        self.key_algorithm
    }

    pub fn is_rsa(&self) -> bool {
        self.key_algorithm == RSA_ENCRYPTION
    }

    pub fn strategy(&self) -> ResolutionStrategy {
        self.strategy
    }

    /// Decoded RSA key, `None` for other algorithms.
    pub fn rsa_private_key(&self) -> Option<RsaPrivateKey> {
        if !self.is_rsa() {
            return None;
        }
        RsaPrivateKey::from_pkcs8_der(&self.key_der).ok()
    }

    pub fn subject(&self) -> String {
        self.certificate.tbs_certificate.subject.to_string()
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(
            self.certificate
                .tbs_certificate
                .validity
                .not_before
                .to_system_time(),
        )
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(
            self.certificate
                .tbs_certificate
                .validity
                .not_after
                .to_system_time(),
        )
    }

    pub fn validity(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        (self.not_before(), self.not_after())
    }

    pub fn check_validity(&self, now: DateTime<Utc>) -> ValidityStatus {
        if now < self.not_before() {
            ValidityStatus::NotYetValid
        } else if now > self.not_after() {
            ValidityStatus::Expired
        } else {
            ValidityStatus::Valid
        }
    }

    /// Writes the pair as owner-only PEM files. Both files are removed when the
    /// returned guard is dropped.
    pub fn materialize(&self) -> Result<PemPair, CertificateError> {
        let cert_pem = pem_encode("CERTIFICATE", &self.certificate_der);
        let key_pem = pem_encode("PRIVATE KEY", &self.key_der);
        let cert = write_private_temp("sifen-cert-", cert_pem.as_bytes())?;
        let key = write_private_temp("sifen-key-", key_pem.as_bytes())?;
        debug!(
            cert = %cert.path().display(),
            key = %key.path().display(),
            "materialized PEM pair"
        );
        Ok(PemPair { cert, key })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidityStatus {
    Valid,
    NotYetValid,
    Expired,
}

/// Transient `cert.pem`/`key.pem` pair on disk.
///
/// Owned by exactly one operation; the files disappear when the guard is
/// dropped, including during unwinding or when an enclosing future is dropped.
#[derive(Debug)]
pub struct PemPair {
    cert: NamedTempFile,
    key: NamedTempFile,
}

impl PemPair {
    pub fn cert_path(&self) -> &Path {
        self.cert.path()
    }

    pub fn key_path(&self) -> &Path {
        self.key.path()
    }

    /// Key followed by certificate, the layout TLS client identities expect.
    pub fn identity_pem(&self) -> Result<Zeroizing<Vec<u8>>, CertificateError> {
        let mut out = Zeroizing::new(fs::read(self.key.path())?);
        out.push(b'\n');
        out.extend_from_slice(&fs::read(self.cert.path())?);
        Ok(out)
    }

    /// Deletes both files now, reporting removal errors.
    pub fn close(self) -> Result<(), CertificateError> {
        self.key.close()?;
        self.cert.close()?;
        Ok(())
    }
}

/// Turns a PKCS#12 file into a [`CertificateBundle`].
#[derive(Debug, Clone)]
pub struct CertificateResolver {
    openssl_binary: PathBuf,
    configured: Option<CertificateConfig>,
}

impl CertificateResolver {
    pub fn new(config: &Config) -> Self {
        Self {
            openssl_binary: config.openssl_binary().to_path_buf(),
            configured: config.certificate().cloned(),
        }
    }

    /// Resolves the certificate named in the configuration.
    pub fn resolve_configured(&self) -> Result<CertificateBundle, CertificateError> {
        let configured = self
            .configured
            .as_ref()
            .ok_or(CertificateError::NotConfigured)?;
        self.resolve(&configured.path, configured.password.expose())
    }

    pub fn resolve(&self, path: &Path, password: &str) -> Result<CertificateBundle, CertificateError> {
        let container = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CertificateError::NotFound {
                    path: path.to_path_buf(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        match KeyStore::from_pkcs12(&container, password) {
            Ok(store) => {
                let bundle = from_keystore(&store)?;
                info!(path = %path.display(), strategy = "native", subject = %bundle.subject(), "resolved certificate");
                Ok(bundle)
            }
            Err(error) => {
                let failure = classify_failure(&container, &error);
                debug!(path = %path.display(), ?failure, "native PKCS#12 decoding failed");
                match choose_strategy(&failure) {
                    Fallback::Fail(err) => Err(err),
                    Fallback::OpenSslLegacy => {
                        warn!(path = %path.display(), "legacy PKCS#12 cipher, using openssl -legacy");
                        let bundle = self.openssl_legacy(path, password)?;
                        info!(path = %path.display(), strategy = "openssl-legacy", subject = %bundle.subject(), "resolved certificate");
                        Ok(bundle)
                    }
                }
            }
        }
    }

    fn openssl_legacy(&self, path: &Path, password: &str) -> Result<CertificateBundle, CertificateError> {
        let cert_out = Builder::new().prefix("sifen-p12-cert-").suffix(".pem").tempfile()?;
        let key_out = Builder::new().prefix("sifen-p12-key-").suffix(".pem").tempfile()?;

        self.run_openssl(path, password, &["-nokeys", "-clcerts"], cert_out.path())?;
        self.run_openssl(path, password, &["-nocerts", "-nodes"], key_out.path())?;

        let cert_pem = Zeroizing::new(fs::read_to_string(cert_out.path())?);
        let key_pem = Zeroizing::new(fs::read_to_string(key_out.path())?);
        drop(cert_out);
        drop(key_out);

        if !cert_pem.contains("-----BEGIN CERTIFICATE-----") {
            return Err(CertificateError::MissingPemMarker {
                output: "certificate",
            });
        }
        if !key_pem.contains("PRIVATE KEY-----") {
            return Err(CertificateError::MissingPemMarker {
                output: "private key",
            });
        }

        let cert_der = pem_block(&cert_pem, "CERTIFICATE")
            .ok_or(CertificateError::NoCertificate)??;
        let key_der = private_key_der(&key_pem)?;
        CertificateBundle::assemble(&cert_der, &key_der, ResolutionStrategy::OpenSslLegacy)
    }

    fn run_openssl(
        &self,
        path: &Path,
        password: &str,
        selection: &[&str],
        out: &Path,
    ) -> Result<(), CertificateError> {
        let output = Command::new(&self.openssl_binary)
            .arg("pkcs12")
            .arg("-legacy")
            .arg("-in")
            .arg(path)
            .args(selection)
            .arg("-out")
            .arg(out)
            .arg("-passin")
            .arg(format!("env:{PASSWORD_ENV}"))
            .env(PASSWORD_ENV, password)
            .output()
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => CertificateError::OpenSslNotFound {
                    binary: self.openssl_binary.clone(),
                },
                _ => CertificateError::Io(e),
            })?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let lowered = stderr.to_ascii_lowercase();
        if lowered.contains("mac verify") || lowered.contains("invalid password") {
            return Err(CertificateError::WrongPassword);
        }
        Err(CertificateError::OpenSslFailed {
            status: output.status.to_string(),
            stderr,
        })
    }
}

fn from_keystore(store: &KeyStore) -> Result<CertificateBundle, CertificateError> {
    let (_alias, chain) = store
        .private_key_chain()
        .ok_or(CertificateError::NoPrivateKey)?;
    let leaf = chain.chain().first().ok_or(CertificateError::NoCertificate)?;
    CertificateBundle::assemble(leaf.as_der(), chain.key(), ResolutionStrategy::Native)
}

/// Accepts PKCS#8 or PKCS#1 RSA DER and returns PKCS#8 DER plus the algorithm OID.
fn normalize_key(key_der: &[u8]) -> Result<(Zeroizing<Vec<u8>>, ObjectIdentifier), CertificateError> {
    if let Ok(info) = PrivateKeyInfo::try_from(key_der) {
        return Ok((Zeroizing::new(key_der.to_vec()), info.algorithm.oid));
    }
    let key = RsaPrivateKey::from_pkcs1_der(key_der)
        .map_err(|e| CertificateError::UnsupportedKey(e.to_string()))?;
    let document = key
        .to_pkcs8_der()
        .map_err(|e| CertificateError::UnsupportedKey(e.to_string()))?;
    Ok((Zeroizing::new(document.as_bytes().to_vec()), RSA_ENCRYPTION))
}

fn private_key_der(pem: &str) -> Result<Zeroizing<Vec<u8>>, CertificateError> {
    for label in ["PRIVATE KEY", "RSA PRIVATE KEY"] {
        if let Some(der) = pem_block(pem, label) {
            return der.map(Zeroizing::new);
        }
    }
    if pem.contains("ENCRYPTED PRIVATE KEY") {
        return Err(CertificateError::UnsupportedKey(
            "encrypted private key".into(),
        ));
    }
    Err(CertificateError::MissingPemMarker {
        output: "private key",
    })
}

/// Decodes the first `label` PEM block found in `text`.
fn pem_block(text: &str, label: &str) -> Option<Result<Vec<u8>, CertificateError>> {
    let begin = format!("-----BEGIN {label}-----");
    let end = format!("-----END {label}-----");
    let start = text.find(&begin)? + begin.len();
    let stop = start + text[start..].find(&end)?;
    let body: String = text[start..stop]
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    Some(
        Base64::decode_vec(&body)
            .map_err(|e| CertificateError::Malformed(format!("{label} PEM body: {e}"))),
    )
}

fn pem_encode(label: &str, der: &[u8]) -> Zeroizing<String> {
    let encoded = Zeroizing::new(Base64::encode_string(der));
    let mut out = Zeroizing::new(String::with_capacity(encoded.len() + encoded.len() / 64 + 64));
    out.push_str(&format!("-----BEGIN {label}-----\n"));
    for chunk in encoded.as_bytes().chunks(64) {
        out.push_str(&String::from_utf8_lossy(chunk));
        out.push('\n');
    }
    out.push_str(&format!("-----END {label}-----\n"));
    out
}

fn write_private_temp(prefix: &str, contents: &[u8]) -> Result<NamedTempFile, CertificateError> {
    // tempfile creates files with mode 0600 on unix
    let mut file = Builder::new().prefix(prefix).suffix(".pem").tempfile()?;
    file.write_all(contents)?;
    file.flush()?;
    Ok(file)
}
