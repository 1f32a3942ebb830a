//! XML-DSig signing under the SIFEN profile.
//!
//! Enveloped signature over `DE` (referenced as `#<CDC>`), exclusive c14n,
//! SHA-256 digest, RSA-SHA256. The `Signature` element uses the dsig namespace
//! as its default namespace and sits right after `DE`.
use base64ct::{Base64, Encoding};
use chrono::{DateTime, Local, NaiveDateTime, TimeDelta, Timelike, Utc};
use std::sync::{Mutex, PoisonError};
use const_oid::{AssociatedOid, ObjectIdentifier, db::rfc5280};
use libxml::tree::{Document, Node};
use rsa::{
    RsaPrivateKey, RsaPublicKey,
    pkcs1v15::{Signature as RsaSignature, SigningKey, VerifyingKey},
    pkcs8::DecodePublicKey,
    signature::{SignatureEncoding, Signer, Verifier},
    traits::PublicKeyParts,
};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};
use x509_cert::{
    Certificate,
    der::{Decode, Encode},
    ext::pkix::{
        AuthorityKeyIdentifier, BasicConstraints, CertificatePolicies, ExtendedKeyUsage, KeyUsage,
        KeyUsages, SubjectAltName, SubjectKeyIdentifier,
    },
};

use super::cdc::CdcError;
use super::xml::{
    self,
    constants::{DS_NS, EXC_C14N_ALG, RSA_SHA256_ALG, SHA256_ALG, SIGNATURE_TEMPLATE},
};
use super::{SignedDocument, UnsignedDocument};
use crate::cert::{CertificateBundle, ValidityStatus};

/// Minimum RSA modulus size accepted for signing.
pub const MIN_RSA_BITS: usize = 2048;

/// Format of `DE/dFecFirma`.
pub const SIGNING_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("certificate expired at {not_after}")]
    CertificateExpired { not_after: DateTime<Utc> },
    #[error("certificate not valid before {not_before}")]
    CertificateNotYetValid { not_before: DateTime<Utc> },
    #[error("signing key is not RSA")]
    NonRsaKey,
    #[error("RSA key too short: {bits} bits, minimum {minimum}")]
    KeyTooShort { bits: usize, minimum: usize },
    #[error("malformed XML: {0}")]
    MalformedXml(String),
    #[error("missing element: {0}")]
    MissingElement(&'static str),
    #[error("invalid document identifier: {0}")]
    Identifier(#[from] CdcError),
    #[error("signature profile violation: {0}")]
    ProfileViolation(String),
    #[error("crypto error: {0}")]
    Crypto(String),
}

/// Which verification path accepted (or rejected) a signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationPath {
    /// Every certificate extension decoded and key usage allows signing.
    Strict,
    /// At least one extension did not decode; extension policy was skipped.
    Relaxed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationReport {
    pub valid: bool,
    pub path: VerificationPath,
    /// Reason for rejection, `None` when valid.
    pub failure: Option<String>,
}

/// Signs `rDE` documents with a resolved certificate.
///
/// # Examples
/// ```rust,no_run
/// use sifen_core::cert::CertificateResolver;
/// use sifen_core::config::Config;
/// use sifen_core::document::{UnsignedDocument, sign::XmlSigner};
///
/// # fn run(xml: String) -> Result<(), sifen_core::Error> {
/// let config = Config::default().with_certificate("taxpayer.p12", "secret");
/// let bundle = CertificateResolver::new(&config).resolve_configured()?;
/// let signer = XmlSigner::new(&bundle)?;
/// let signed = signer.sign(&UnsignedDocument::from_xml(xml)?)?;
/// assert!(sifen_core::document::sign::verify(&signed));
/// # Ok(())
/// # }
/// ```
pub struct XmlSigner {
    key: SigningKey<Sha256>,
    certificate_b64: String,
    last_stamp: Mutex<Option<NaiveDateTime>>,
}

impl std::fmt::Debug for XmlSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XmlSigner").field("key", &"<KEY>").finish()
    }
}

impl XmlSigner {
    pub fn new(bundle: &CertificateBundle) -> Result<Self, SigningError> {
        Self::new_at(bundle, Utc::now())
    }

    /// Like [`XmlSigner::new`], checking certificate validity at `now`.
    pub fn new_at(bundle: &CertificateBundle, now: DateTime<Utc>) -> Result<Self, SigningError> {
        match bundle.check_validity(now) {
            ValidityStatus::Valid => {}
            ValidityStatus::Expired => {
                return Err(SigningError::CertificateExpired {
                    not_after: bundle.not_after(),
                });
            }
            ValidityStatus::NotYetValid => {
                return Err(SigningError::CertificateNotYetValid {
                    not_before: bundle.not_before(),
                });
            }
        }
        if !bundle.is_rsa() {
            return Err(SigningError::NonRsaKey);
        }
        let key = bundle
            .rsa_private_key()
            .ok_or_else(|| SigningError::Crypto("cannot decode RSA private key".into()))?;
        Self::from_rsa_key(key, bundle.certificate_der())
    }

    fn from_rsa_key(key: RsaPrivateKey, certificate_der: &[u8]) -> Result<Self, SigningError> {
        let bits = key.size() * 8;
        if bits < MIN_RSA_BITS {
            return Err(SigningError::KeyTooShort {
                bits,
                minimum: MIN_RSA_BITS,
            });
        }
        Ok(Self {
            key: SigningKey::<Sha256>::new(key),
            certificate_b64: Base64::encode_string(certificate_der),
            last_stamp: Mutex::new(None),
        })
    }

    /// Signs with the current local time as `dFecFirma`.
    ///
    /// `dFecFirma` has second resolution and the signature scheme is
    /// deterministic, so each call from the same signer stamps a later second
    /// than the previous one; a burst of signatures may run a few seconds
    /// ahead of the clock.
    pub fn sign(&self, document: &UnsignedDocument) -> Result<SignedDocument, SigningError> {
        self.sign_at(document, self.next_stamp(Local::now().naive_local()))
    }

    fn next_stamp(&self, now: NaiveDateTime) -> NaiveDateTime {
        let now = now.with_nanosecond(0).unwrap_or(now);
        let mut last = self.last_stamp.lock().unwrap_or_else(PoisonError::into_inner);
        let stamp = match *last {
            Some(previous) if previous >= now => previous + TimeDelta::seconds(1),
            _ => now,
        };
        *last = Some(stamp);
        stamp
    }

    pub fn sign_at(
        &self,
        document: &UnsignedDocument,
        signing_time: NaiveDateTime,
    ) -> Result<SignedDocument, SigningError> {
        let mut doc = xml::parse(document.xml()).map_err(SigningError::MalformedXml)?;
        let root = doc
            .get_root_element()
            .ok_or(SigningError::MissingElement("rDE"))?;
        let mut de = xml::child_named(&root, "DE").ok_or(SigningError::MissingElement("DE"))?;
        let cdc = document.cdc().clone();

        remove_stale_signatures(&root);
        stamp_signing_time(&doc, &de, signing_time)?;

        let canonical_de = xml::exclusive_c14n(&mut de).map_err(SigningError::Crypto)?;
        let digest_value = Base64::encode_string(&Sha256::digest(canonical_de.as_bytes()));

        let template = SIGNATURE_TEMPLATE
            .replace("{reference}", cdc.as_str())
            .replace("{digest}", &digest_value);
        let mut signature = xml::import_fragment(&mut doc, &template).map_err(SigningError::MalformedXml)?;
        de.add_next_sibling(&mut signature)
            .map_err(|e| SigningError::MalformedXml(e.to_string()))?;

        let mut signed_info = xml::child_named(&signature, "SignedInfo")
            .ok_or(SigningError::MissingElement("SignedInfo"))?;
        let canonical_signed_info = xml::exclusive_c14n(&mut signed_info).map_err(SigningError::Crypto)?;
        let signature_value: RsaSignature = self
            .key
            .try_sign(canonical_signed_info.as_bytes())
            .map_err(|e| SigningError::Crypto(e.to_string()))?;

        set_child_text(&signature, &["SignatureValue"], &Base64::encode_string(&signature_value.to_bytes()))?;
        set_child_text(
            &signature,
            &["KeyInfo", "X509Data", "X509Certificate"],
            &self.certificate_b64,
        )?;

        let serialized = xml::compact_root(&doc).map_err(SigningError::MalformedXml)?;
        check_profile(&serialized)?;
        debug!(cdc = %cdc, "signed document");
        Ok(SignedDocument::new(
            serialized,
            cdc,
            digest_value,
            Some(signing_time),
        ))
    }
}

fn remove_stale_signatures(root: &Node) {
    for mut child in xml::element_children(root) {
        if child.get_name() == "Signature" && xml::namespace_href(&child).as_deref() == Some(DS_NS) {
            child.unlink();
        }
    }
}

/// Sets `DE/dFecFirma`, inserting it right after `dDVId` (or first) when absent.
fn stamp_signing_time(doc: &Document, de: &Node, time: NaiveDateTime) -> Result<(), SigningError> {
    let value = time.format(SIGNING_TIME_FORMAT).to_string();
    if let Some(mut existing) = xml::child_named(de, "dFecFirma") {
        return existing
            .set_content(&value)
            .map_err(|e| SigningError::MalformedXml(e.to_string()));
    }
    let mut stamp = xml::new_element_like(doc, de, "dFecFirma", &value).map_err(SigningError::MalformedXml)?;
    let result = match (xml::child_named(de, "dDVId"), xml::first_element_child(de)) {
        (Some(mut dv), _) => dv.add_next_sibling(&mut stamp).map_err(|e| e.to_string()),
        (None, Some(mut first)) => first.add_prev_sibling(&mut stamp).map_err(|e| e.to_string()),
        (None, None) => de.clone().add_child(&mut stamp).map_err(|e| e.to_string()),
    };
    result.map_err(SigningError::MalformedXml)
}

fn set_child_text(parent: &Node, path: &[&'static str], value: &str) -> Result<(), SigningError> {
    let mut current = parent.clone();
    for name in path {
        current = xml::child_named(&current, name).ok_or(SigningError::MissingElement(name))?;
    }
    current
        .set_content(value)
        .map_err(|e| SigningError::MalformedXml(e.to_string()))
}

/// Post-conditions every signed document must meet before it leaves the signer.
pub fn check_profile(serialized: &str) -> Result<(), SigningError> {
    let violation = |msg: &str| Err(SigningError::ProfileViolation(msg.to_string()));

    if let Some(prefix) = prefixes_bound_to(serialized, DS_NS).first() {
        return violation(&format!("dsig namespace bound to prefix '{prefix}'"));
    }
    if serialized.contains("<ds:") || serialized.contains("</ds:") {
        return violation("prefixed ds: element");
    }

    let doc = xml::parse(serialized).map_err(SigningError::MalformedXml)?;
    let root = doc
        .get_root_element()
        .ok_or(SigningError::MissingElement("rDE"))?;
    let de = xml::child_named(&root, "DE").ok_or(SigningError::MissingElement("DE"))?;
    let signatures: Vec<Node> = xml::element_children(&root)
        .into_iter()
        .filter(|node| node.get_name() == "Signature")
        .collect();
    if signatures.len() != 1 {
        return violation(&format!("expected one Signature, found {}", signatures.len()));
    }
    let signature = &signatures[0];
    if xml::namespace_href(signature).as_deref() != Some(DS_NS) {
        return violation("Signature outside the dsig namespace");
    }
    let declares_default = signature
        .get_namespace_declarations()
        .iter()
        .any(|ns| ns.get_prefix().is_empty() && ns.get_href() == DS_NS);
    if !declares_default {
        return violation("Signature does not declare the dsig namespace as default");
    }
    match xml::next_element_sibling(&de) {
        Some(next) if next.get_name() == "Signature" => {}
        _ => return violation("Signature is not the next sibling of DE"),
    }
    let children = xml::element_children(&root);
    let position = |name: &str| children.iter().position(|node| node.get_name() == name);
    if let (Some(sig), Some(trailer)) = (position("Signature"), position("gCamFuFD")) {
        if trailer < sig {
            return violation("gCamFuFD precedes Signature");
        }
    }
    let reference = xml::child_named(signature, "SignedInfo")
        .and_then(|info| xml::child_named(&info, "Reference"))
        .and_then(|reference| reference.get_attribute("URI"));
    let expected = de.get_attribute("Id").map(|id| format!("#{id}"));
    if reference.is_none() || reference != expected {
        return violation("Reference URI does not point at DE/@Id");
    }
    Ok(())
}

/// Prefixes (other than the default) declared for `namespace` anywhere in `xml`.
fn prefixes_bound_to(serialized: &str, namespace: &str) -> Vec<String> {
    let mut prefixes = Vec::new();
    for quote in ['"', '\''] {
        let needle = format!("={quote}{namespace}{quote}");
        let mut offset = 0;
        while let Some(found) = serialized[offset..].find(&needle) {
            let at = offset + found;
            let attr_start = serialized[..at]
                .rfind(|c: char| c.is_ascii_whitespace() || c == '<')
                .map(|i| i + 1)
                .unwrap_or(0);
            let attr = &serialized[attr_start..at];
            if let Some(prefix) = attr.strip_prefix("xmlns:") {
                prefixes.push(prefix.to_string());
            }
            offset = at + needle.len();
        }
    }
    prefixes
}

/// `true` when the signature is valid on either verification path.
pub fn verify(document: &SignedDocument) -> bool {
    match verify_report(document) {
        Ok(report) => report.valid,
        Err(err) => {
            warn!(cdc = %document.cdc(), error = %err, "signature verification failed");
            false
        }
    }
}

/// Verifies digest and RSA signature, reporting which path was taken.
pub fn verify_report(document: &SignedDocument) -> Result<VerificationReport, SigningError> {
    let doc = xml::parse(document.xml()).map_err(SigningError::MalformedXml)?;
    let root = doc
        .get_root_element()
        .ok_or(SigningError::MissingElement("rDE"))?;
    let mut de = xml::child_named(&root, "DE").ok_or(SigningError::MissingElement("DE"))?;
    let signature = xml::next_element_sibling(&de)
        .filter(|node| node.get_name() == "Signature")
        .ok_or(SigningError::MissingElement("Signature"))?;
    let mut signed_info =
        xml::child_named(&signature, "SignedInfo").ok_or(SigningError::MissingElement("SignedInfo"))?;

    let certificate = embedded_certificate(&signature)?;
    let path = match extension_policy(&certificate) {
        Ok(()) => VerificationPath::Strict,
        Err(ExtensionPolicy::Undecodable(reason)) => {
            warn!(cdc = %document.cdc(), %reason, "certificate extensions undecodable, using relaxed verification");
            VerificationPath::Relaxed
        }
        Err(ExtensionPolicy::Forbidden(reason)) => {
            return Ok(rejected(VerificationPath::Strict, reason));
        }
    };

    if let Some(reason) = algorithm_mismatch(&signed_info) {
        return Ok(rejected(path, reason));
    }

    let reference = xml::child_named(&signed_info, "Reference")
        .ok_or(SigningError::MissingElement("Reference"))?;
    let expected_uri = format!("#{}", de.get_attribute("Id").unwrap_or_default());
    if reference.get_attribute("URI").as_deref() != Some(expected_uri.as_str()) {
        return Ok(rejected(path, "reference URI does not match DE/@Id".into()));
    }
    let claimed_digest = xml::child_named(&reference, "DigestValue")
        .map(|node| node.get_content().trim().to_string())
        .ok_or(SigningError::MissingElement("DigestValue"))?;
    let canonical_de = xml::exclusive_c14n(&mut de).map_err(SigningError::Crypto)?;
    let actual_digest = Base64::encode_string(&Sha256::digest(canonical_de.as_bytes()));
    if claimed_digest != actual_digest {
        return Ok(rejected(path, "DE digest mismatch".into()));
    }

    let signature_value = xml::child_named(&signature, "SignatureValue")
        .map(|node| compact_base64(&node.get_content()))
        .ok_or(SigningError::MissingElement("SignatureValue"))?;
    let signature_bytes = Base64::decode_vec(&signature_value)
        .map_err(|e| SigningError::Crypto(format!("SignatureValue: {e}")))?;
    let signature_value = RsaSignature::try_from(signature_bytes.as_slice())
        .map_err(|e| SigningError::Crypto(e.to_string()))?;

    let spki = certificate
        .tbs_certificate
        .subject_public_key_info
        .to_der()
        .map_err(|e| SigningError::Crypto(e.to_string()))?;
    let public_key = RsaPublicKey::from_public_key_der(&spki).map_err(|_| SigningError::NonRsaKey)?;
    let canonical_signed_info = xml::exclusive_c14n(&mut signed_info).map_err(SigningError::Crypto)?;
    let verified = VerifyingKey::<Sha256>::new(public_key)
        .verify(canonical_signed_info.as_bytes(), &signature_value)
        .is_ok();

    info!(cdc = %document.cdc(), ?path, valid = verified, "verified signature");
    Ok(VerificationReport {
        valid: verified,
        path,
        failure: (!verified).then(|| "RSA signature mismatch".to_string()),
    })
}

fn rejected(path: VerificationPath, reason: String) -> VerificationReport {
    debug!(?path, %reason, "signature rejected");
    VerificationReport {
        valid: false,
        path,
        failure: Some(reason),
    }
}

fn compact_base64(value: &str) -> String {
    value.chars().filter(|c| !c.is_ascii_whitespace()).collect()
}

fn embedded_certificate(signature: &Node) -> Result<Certificate, SigningError> {
    let encoded = xml::child_named(signature, "KeyInfo")
        .and_then(|info| xml::child_named(&info, "X509Data"))
        .and_then(|data| xml::child_named(&data, "X509Certificate"))
        .map(|node| compact_base64(&node.get_content()))
        .ok_or(SigningError::MissingElement("X509Certificate"))?;
    let der = Base64::decode_vec(&encoded)
        .map_err(|e| SigningError::Crypto(format!("X509Certificate: {e}")))?;
    Certificate::from_der(&der).map_err(|e| SigningError::Crypto(format!("X509Certificate: {e}")))
}

fn algorithm_mismatch(signed_info: &Node) -> Option<String> {
    let algorithm = |path: &[&str]| {
        let mut current = signed_info.clone();
        for name in path {
            current = xml::child_named(&current, name)?;
        }
        current.get_attribute("Algorithm")
    };
    let checks: [(&[&str], &str); 3] = [
        (&["CanonicalizationMethod"], EXC_C14N_ALG),
        (&["SignatureMethod"], RSA_SHA256_ALG),
        (&["Reference", "DigestMethod"], SHA256_ALG),
    ];
    checks.iter().find_map(|(path, expected)| {
        let found = algorithm(path);
        (found.as_deref() != Some(*expected)).then(|| {
            format!(
                "unexpected algorithm for {}: {}",
                path.join("/"),
                found.unwrap_or_default()
            )
        })
    })
}

enum ExtensionPolicy {
    Undecodable(String),
    Forbidden(String),
}

fn extension_policy(certificate: &Certificate) -> Result<(), ExtensionPolicy> {
    let Some(extensions) = certificate.tbs_certificate.extensions.as_ref() else {
        return Ok(());
    };
    let mut key_usage = None;
    for extension in extensions {
        let value = extension.extn_value.as_bytes();
        let decoded = decode_extension(extension.extn_id, value);
        match decoded {
            Ok(Some(usage)) => key_usage = Some(usage),
            Ok(None) => {}
            Err(e) => {
                return Err(ExtensionPolicy::Undecodable(format!(
                    "{}: {e}",
                    extension.extn_id
                )));
            }
        }
    }
    if let Some(usage) = key_usage {
        let allowed = usage.0.contains(KeyUsages::DigitalSignature)
            || usage.0.contains(KeyUsages::NonRepudiation);
        if !allowed {
            return Err(ExtensionPolicy::Forbidden(
                "certificate key usage does not allow signatures".into(),
            ));
        }
    }
    Ok(())
}

/// Decodes the extensions this signer knows about; unknown ones are skipped.
fn decode_extension(
    oid: ObjectIdentifier,
    value: &[u8],
) -> Result<Option<KeyUsage>, x509_cert::der::Error> {
    if oid == KeyUsage::OID {
        return KeyUsage::from_der(value).map(Some);
    }
    if oid == BasicConstraints::OID {
        BasicConstraints::from_der(value)?;
    } else if oid == ExtendedKeyUsage::OID {
        ExtendedKeyUsage::from_der(value)?;
    } else if oid == SubjectKeyIdentifier::OID {
        SubjectKeyIdentifier::from_der(value)?;
    } else if oid == AuthorityKeyIdentifier::OID {
        AuthorityKeyIdentifier::from_der(value)?;
    } else if oid == SubjectAltName::OID {
        SubjectAltName::from_der(value)?;
    } else if oid == rfc5280::ID_CE_CERTIFICATE_POLICIES {
        CertificatePolicies::from_der(value)?;
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIGNED_SHAPE: &str = r##"<rDE xmlns="http://ekuatia.set.gov.py/sifen/xsd"><dVerFor>150</dVerFor><DE Id="01045547378001001000000112026011411234567819"/><Signature xmlns="http://www.w3.org/2000/09/xmldsig#"><SignedInfo><Reference URI="#01045547378001001000000112026011411234567819"/></SignedInfo></Signature><gCamFuFD><dCarQR>x</dCarQR></gCamFuFD></rDE>"##;

    #[test]
    fn profile_accepts_default_namespace_signature_after_de() {
        check_profile(SIGNED_SHAPE).expect("profile");
    }

    #[test]
    fn profile_rejects_prefixed_dsig_namespace() {
        let prefixed = SIGNED_SHAPE
            .replace(
                r#"<Signature xmlns="http://www.w3.org/2000/09/xmldsig#">"#,
                r#"<ds:Signature xmlns:ds="http://www.w3.org/2000/09/xmldsig#">"#,
            )
            .replace("</Signature>", "</ds:Signature>")
            .replace("<SignedInfo>", "<ds:SignedInfo>")
            .replace("</SignedInfo>", "</ds:SignedInfo>")
            .replace("<Reference ", "<ds:Reference ");
        let err = check_profile(&prefixed).unwrap_err();
        assert!(matches!(err, SigningError::ProfileViolation(msg) if msg.contains("'ds'")));
    }

    #[test]
    fn profile_rejects_unused_prefix_declaration() {
        let sneaky = SIGNED_SHAPE.replace(
            "<dVerFor>",
            r#"<dVerFor xmlns:sig="http://www.w3.org/2000/09/xmldsig#">"#,
        );
        assert!(matches!(
            check_profile(&sneaky),
            Err(SigningError::ProfileViolation(_))
        ));
    }

    #[test]
    fn profile_rejects_trailer_before_signature() {
        let misplaced = r##"<rDE xmlns="http://ekuatia.set.gov.py/sifen/xsd"><dVerFor>150</dVerFor><DE Id="01045547378001001000000112026011411234567819"/><gCamFuFD/><Signature xmlns="http://www.w3.org/2000/09/xmldsig#"><SignedInfo><Reference URI="#01045547378001001000000112026011411234567819"/></SignedInfo></Signature></rDE>"##;
        let err = check_profile(misplaced).unwrap_err();
        assert!(matches!(err, SigningError::ProfileViolation(msg) if msg.contains("next sibling")));
    }

    #[test]
    fn profile_rejects_wrong_reference() {
        let wrong = SIGNED_SHAPE.replacen(
            "URI=\"#01045547378001001000000112026011411234567819\"",
            "URI=\"#other\"",
            1,
        );
        assert!(matches!(
            check_profile(&wrong),
            Err(SigningError::ProfileViolation(msg)) if msg.contains("Reference")
        ));
    }

    #[test]
    fn prefix_scan_ignores_default_declarations() {
        assert!(prefixes_bound_to(SIGNED_SHAPE, DS_NS).is_empty());
        let xml = "<a xmlns:x='http://www.w3.org/2000/09/xmldsig#'/>";
        assert_eq!(prefixes_bound_to(xml, DS_NS), vec!["x".to_string()]);
    }
}
