mod common;

use chrono::NaiveDate;
use rsa::RsaPrivateKey;
use sifen_core::{
    cert::CertificateBundle,
    config::{EnvironmentType, SecurityCodeConfig, Secret},
    document::{
        SignedDocument, UnsignedDocument, qr,
        sign::{SigningError, VerificationPath, XmlSigner, check_profile, verify, verify_report},
    },
};

use common::{CDC, bundle, certificate_der, certificate_with_broken_extension, key_pkcs8_der, rsa_key, sample_document};

fn at(hour: u32, minute: u32) -> chrono::NaiveDateTime {
    NaiveDate::from_ymd_opt(2026, 1, 14)
        .unwrap()
        .and_hms_opt(hour, minute, 0)
        .unwrap()
}

fn signer() -> XmlSigner {
    XmlSigner::new(&bundle()).expect("signer")
}

#[test]
fn signed_document_verifies_on_strict_path() {
    let signed = signer().sign_at(&sample_document(), at(10, 30)).expect("sign");

    let report = verify_report(&signed).expect("report");
    assert!(report.valid, "{:?}", report.failure);
    assert_eq!(report.path, VerificationPath::Strict);
    assert_eq!(signed.cdc().as_str(), CDC);
    assert_eq!(signed.signing_time(), Some(at(10, 30)));
    assert!(!signed.digest_value().is_empty());
}

#[test]
fn signature_uses_default_namespace_and_follows_de() {
    let signed = signer().sign(&sample_document()).expect("sign");
    let xml = signed.xml();

    assert!(xml.contains(r#"</DE><Signature xmlns="http://www.w3.org/2000/09/xmldsig#">"#));
    assert!(!xml.contains("ds:"));
    assert!(!xml.contains("xmlns:ds="));
    assert_eq!(xml.matches("<Signature").count(), 1);
    assert!(xml.contains(&format!(r##"<Reference URI="#{CDC}">"##)));
    check_profile(xml).expect("profile");
}

#[test]
fn signing_time_is_stamped_after_dv_id() {
    let signed = signer().sign_at(&sample_document(), at(8, 5)).expect("sign");
    assert!(
        signed
            .xml()
            .contains("<dDVId>9</dDVId><dFecFirma>2026-01-14T08:05:00</dFecFirma>")
    );
}

#[test]
fn resigning_twice_gives_different_valid_signatures() {
    let signer = signer();
    let first = signer.sign_at(&sample_document(), at(10, 0)).expect("first");
    let second = signer
        .sign_at(&first.to_unsigned().expect("strip"), at(10, 1))
        .expect("second");

    assert_ne!(first.xml(), second.xml());
    assert_ne!(first.digest_value(), second.digest_value());
    assert!(verify(&first));
    assert!(verify(&second));
    assert_eq!(second.xml().matches("<Signature").count(), 1);
    assert_eq!(second.xml().matches("<dFecFirma>").count(), 1);
}

#[test]
fn back_to_back_signing_never_repeats_the_signature() {
    let signer = signer();
    let document = sample_document();
    let first = signer.sign(&document).expect("first");
    let second = signer.sign(&document).expect("second");
    let third = signer.sign(&second.to_unsigned().expect("strip")).expect("third");

    assert_ne!(first.xml(), second.xml());
    assert_ne!(second.xml(), third.xml());
    let times: Vec<_> = [&first, &second, &third]
        .iter()
        .map(|d| d.signing_time().expect("dFecFirma"))
        .collect();
    assert!(times[0] < times[1] && times[1] < times[2], "{times:?}");
    assert!(verify(&first) && verify(&second) && verify(&third));
}

#[test]
fn tampered_content_fails_verification() {
    let signed = signer().sign(&sample_document()).expect("sign");
    let tampered = signed.xml().replace("110000", "990000");
    let tampered = SignedDocument::from_xml(tampered).expect("parse");

    let report = verify_report(&tampered).expect("report");
    assert!(!report.valid);
    assert_eq!(report.failure.as_deref(), Some("DE digest mismatch"));
}

#[test]
fn undecodable_extension_uses_relaxed_path() {
    let key = rsa_key();
    let bundle = CertificateBundle::from_der(&certificate_with_broken_extension(key), &key_pkcs8_der(key))
        .expect("bundle");
    let signed = XmlSigner::new(&bundle)
        .expect("signer")
        .sign(&sample_document())
        .expect("sign");

    let report = verify_report(&signed).expect("report");
    assert!(report.valid);
    assert_eq!(report.path, VerificationPath::Relaxed);
}

#[test]
fn short_keys_are_refused() {
    let key = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).expect("key");
    let bundle = CertificateBundle::from_der(&certificate_der(&key, -1, 30), &key_pkcs8_der(&key))
        .expect("bundle");
    assert!(matches!(
        XmlSigner::new(&bundle),
        Err(SigningError::KeyTooShort {
            bits: 1024,
            minimum: 2048
        })
    ));
}

#[test]
fn certificate_validity_is_checked() {
    let key = rsa_key();
    let expired = CertificateBundle::from_der(&certificate_der(key, -30, -1), &key_pkcs8_der(key))
        .expect("bundle");
    assert!(matches!(
        XmlSigner::new(&expired),
        Err(SigningError::CertificateExpired { .. })
    ));

    let future = CertificateBundle::from_der(&certificate_der(key, 2, 30), &key_pkcs8_der(key))
        .expect("bundle");
    assert!(matches!(
        XmlSigner::new(&future),
        Err(SigningError::CertificateNotYetValid { .. })
    ));
    let later = chrono::Utc::now() + chrono::Duration::days(3);
    assert!(XmlSigner::new_at(&future, later).is_ok());
}

#[test]
fn qr_trailer_follows_signature_and_keeps_it_valid() {
    let signed = signer().sign(&sample_document()).expect("sign");
    let csc = SecurityCodeConfig {
        id: "0001".into(),
        secret: Secret::new("ABCD0000000000000000000000000000"),
    };
    let sealed = qr::attach_trailer(&signed, EnvironmentType::Test, &csc).expect("qr");
    let xml = sealed.xml();

    let signature_end = xml.find("</Signature>").expect("signature");
    let trailer = xml.find("<gCamFuFD>").expect("trailer");
    assert_eq!(signature_end + "</Signature>".len(), trailer);
    assert!(xml.contains("<dCarQR>https://ekuatia.set.gov.py/consultas-test/qr?nVersion=150&amp;Id="));
    assert!(xml.contains("&amp;dRucRec=80012345&amp;"));
    assert!(xml.contains("&amp;cItems=1&amp;"));
    assert!(xml.contains("&amp;IdCSC=0001&amp;cHashQR="));
    assert!(verify(&sealed));

    let again = qr::attach_trailer(&sealed, EnvironmentType::Test, &csc).expect("qr again");
    assert_eq!(again.xml().matches("<gCamFuFD>").count(), 1);
}

#[test]
fn unsigned_documents_must_carry_a_valid_identifier() {
    let broken = common::sample_xml().replace(CDC, "01045547378001001000000112026011411234567810");
    assert!(matches!(
        UnsignedDocument::from_xml(broken),
        Err(SigningError::Identifier(_))
    ));
}
