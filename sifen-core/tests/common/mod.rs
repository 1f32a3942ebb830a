use std::{
    collections::VecDeque,
    str::FromStr,
    sync::{Mutex, OnceLock},
    time::{Duration, SystemTime},
};

use const_oid::{AssociatedOid, ObjectIdentifier, db::rfc5280};
use rsa::{
    RsaPrivateKey,
    pkcs1v15::{Signature, SigningKey},
    pkcs8::EncodePrivateKey,
};
use sha2::Sha256;
use sifen_core::{
    api::{Exchange, ExchangeError, HttpReply},
    cert::CertificateBundle,
    config::{BackoffPolicy, Config, EnvironmentType},
    document::UnsignedDocument,
};
use x509_cert::{
    builder::{Builder, CertificateBuilder, Profile},
    der::{Encode, asn1::Null},
    ext::{AsExtension, Extension},
    name::Name,
    serial_number::SerialNumber,
    spki::SubjectPublicKeyInfoOwned,
    time::{Time, Validity},
};

/// Reference CDC for `01 4554737 8 001 001 0000001 1 20260114 1 12345678`.
#[allow(dead_code)]
pub const CDC: &str = "01045547378001001000000112026011411234567819";

#[allow(dead_code)]
pub const SIFEN_NS: &str = "http://ekuatia.set.gov.py/sifen/xsd";

/// Routes library logs to the test harness; `RUST_LOG` picks the level.
#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

const DAY: u64 = 24 * 60 * 60;

/// One 2048-bit key for the whole test binary; generation is slow.
#[allow(dead_code)]
pub fn rsa_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| RsaPrivateKey::new(&mut rand::thread_rng(), 2048).expect("rsa key"))
}

#[allow(dead_code)]
pub fn key_pkcs8_der(key: &RsaPrivateKey) -> Vec<u8> {
    key.to_pkcs8_der().expect("pkcs8").as_bytes().to_vec()
}

fn at(offset_days: i64) -> Time {
    let now = SystemTime::now();
    let shift = Duration::from_secs(offset_days.unsigned_abs() * DAY);
    let moment = if offset_days >= 0 { now + shift } else { now - shift };
    Time::try_from(moment).expect("time")
}

/// Tampered key usage: a NULL where a BIT STRING belongs.
struct BrokenKeyUsage;

impl AssociatedOid for BrokenKeyUsage {
    const OID: ObjectIdentifier = rfc5280::ID_CE_KEY_USAGE;
}

impl Encode for BrokenKeyUsage {
    fn encoded_len(&self) -> x509_cert::der::Result<x509_cert::der::Length> {
        Null.encoded_len()
    }

    fn encode(&self, writer: &mut impl x509_cert::der::Writer) -> x509_cert::der::Result<()> {
        Null.encode(writer)
    }
}

impl AsExtension for BrokenKeyUsage {
    fn critical(&self, _subject: &Name, _extensions: &[Extension]) -> bool {
        false
    }
}

/// Self-issued leaf certificate (digitalSignature + nonRepudiation) valid
/// between the two day offsets from now.
#[allow(dead_code)]
pub fn certificate_der(key: &RsaPrivateKey, from_days: i64, to_days: i64) -> Vec<u8> {
    build_certificate(key, from_days, to_days, false)
}

/// Same as [`certificate_der`] but with an undecodable key-usage extension.
#[allow(dead_code)]
pub fn certificate_with_broken_extension(key: &RsaPrivateKey) -> Vec<u8> {
    build_certificate(key, -1, 365, true)
}

fn build_certificate(key: &RsaPrivateKey, from_days: i64, to_days: i64, broken: bool) -> Vec<u8> {
    let subject = Name::from_str("CN=EMPRESA DE PRUEBA S.A.,serialNumber=RUC4554737-8,O=Contribuyente,C=PY")
        .expect("name");
    let validity = Validity {
        not_before: at(from_days),
        not_after: at(to_days),
    };
    let spki = SubjectPublicKeyInfoOwned::from_key(key.to_public_key()).expect("spki");
    let signer = SigningKey::<Sha256>::new(key.clone());
    let mut builder = CertificateBuilder::new(
        Profile::Leaf {
            issuer: subject.clone(),
            enable_key_agreement: false,
            enable_key_encipherment: false,
        },
        SerialNumber::from(4554737u32),
        validity,
        subject,
        spki,
        &signer,
    )
    .expect("builder");
    if broken {
        builder.add_extension(&BrokenKeyUsage).expect("extension");
    }
    builder
        .build::<Signature>()
        .expect("certificate")
        .to_der()
        .expect("der")
}

#[allow(dead_code)]
pub fn bundle() -> CertificateBundle {
    let key = rsa_key();
    CertificateBundle::from_der(&certificate_der(key, -1, 365), &key_pkcs8_der(key)).expect("bundle")
}

/// PKCS#12 container (modern ciphers) holding the shared key and certificate.
#[allow(dead_code)]
pub fn pkcs12(password: &str) -> Vec<u8> {
    use p12_keystore::{Certificate, KeyStore, KeyStoreEntry, PrivateKeyChain};

    let key = rsa_key();
    let certificate = Certificate::from_der(&certificate_der(key, -1, 365)).expect("p12 cert");
    let chain = PrivateKeyChain::new(key_pkcs8_der(key), [1u8; 20], [certificate]);
    let mut store = KeyStore::new();
    store.add_entry("sifen", KeyStoreEntry::PrivateKeyChain(chain));
    store.writer(password).write().expect("p12")
}

/// A container native decoding refuses: bags encrypted under
/// pbeWithSHAAnd128BitRC2-CBC and no MAC, as exported by old tooling.
#[allow(dead_code)]
pub fn legacy_pkcs12(password: &str) -> Vec<u8> {
    use p12_keystore::{Certificate, EncryptionAlgorithm, KeyStore, KeyStoreEntry, PrivateKeyChain};
    use x509_cert::der::{Decode, Encode, asn1::Any};

    // 1.2.840.113549.1.12.1.6 (RC2-40), rewritten below to .5 (RC2-128)
    const RC2_40: [u8; 12] = [0x06, 0x0a, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x0c, 0x01, 0x06];

    let key = rsa_key();
    let certificate = Certificate::from_der(&certificate_der(key, -1, 365)).expect("p12 cert");
    let chain = PrivateKeyChain::new(key_pkcs8_der(key), [2u8; 20], [certificate]);
    let mut store = KeyStore::new();
    store.add_entry("sifen", KeyStoreEntry::PrivateKeyChain(chain));
    let mut der = store
        .writer(password)
        .encryption_algorithm(EncryptionAlgorithm::PbeWithShaAnd40BitRc4Cbc)
        .write()
        .expect("p12");

    let mut patched = 0;
    let mut at = 0;
    while let Some(offset) = der[at..].windows(RC2_40.len()).position(|w| w == RC2_40) {
        let end = at + offset + RC2_40.len();
        der[end - 1] = 0x05;
        patched += 1;
        at = end;
    }
    assert!(patched > 0, "no RC2-40 identifier in the written container");

    // PFX ::= SEQUENCE { version, authSafe, macData }; the MAC no longer matches
    let mut pfx = Vec::<Any>::from_der(&der).expect("pfx");
    pfx.truncate(2);
    pfx.to_der().expect("pfx der")
}

#[allow(dead_code)]
pub fn pem(label: &str, der: &[u8]) -> String {
    use base64ct::{Base64, Encoding};

    let body = Base64::encode_string(der);
    let mut out = format!("-----BEGIN {label}-----\n");
    for chunk in body.as_bytes().chunks(64) {
        out.push_str(std::str::from_utf8(chunk).expect("base64 is ascii"));
        out.push('\n');
    }
    out.push_str(&format!("-----END {label}-----\n"));
    out
}

/// Unsigned `rDE` with the reference identity and the given totals block.
#[allow(dead_code)]
pub fn sample_xml_with_totals(totals: &str) -> String {
    format!(
        r#"<rDE xmlns="{SIFEN_NS}"><dVerFor>150</dVerFor><DE Id="{CDC}"><dDVId>9</dDVId><dSisFact>1</dSisFact><gOpeDE><iTipEmi>1</iTipEmi><dDesTipEmi>Normal</dDesTipEmi><dCodSeg>123456789</dCodSeg></gOpeDE><gTimb><iTiDE>1</iTiDE><dDesTiDE>Factura electrónica</dDesTiDE><dNumTim>12345678</dNumTim><dEst>001</dEst><dPunExp>001</dPunExp><dNumDoc>0000001</dNumDoc><dFeIniT>2025-01-01</dFeIniT></gTimb><gDatGralOpe><dFeEmiDE>2026-01-14T10:30:00</dFeEmiDE><gDatRec><iNatRec>1</iNatRec><dRucRec>80012345</dRucRec><dNomRec>Cliente &amp; Cia</dNomRec></gDatRec></gDatGralOpe><gDtipDE><gCamItem><dCodInt>A1</dCodInt><dDesProSer>Servicio</dDesProSer><gCamIVA><iAfecIVA>1</iAfecIVA><dDesAfecIVA>Gravado IVA</dDesAfecIVA><dPropIVA>100</dPropIVA><dTasaIVA>10</dTasaIVA><dBasGravIVA>100000</dBasGravIVA><dLiqIVAItem>10000</dLiqIVAItem><dBasExe>0</dBasExe></gCamIVA></gCamItem></gDtipDE>{totals}</DE></rDE>"#
    )
}

#[allow(dead_code)]
pub fn sample_xml() -> String {
    sample_xml_with_totals(
        "<gTotSub><dSubExe>0</dSubExe><dSub10>110000</dSub10><dTotOpe>110000</dTotOpe><dTotGralOpe>110000</dTotGralOpe><dIVA10>10000</dIVA10><dTotIVA>10000</dTotIVA></gTotSub>",
    )
}

#[allow(dead_code)]
pub fn sample_document() -> UnsignedDocument {
    UnsignedDocument::from_xml(sample_xml()).expect("sample document")
}

/// Test config with millisecond backoffs.
#[allow(dead_code)]
pub fn fast_config() -> Config {
    Config::new(EnvironmentType::Test)
        .with_retry(BackoffPolicy::new(3, 1, 5).with_jitter_percent(0))
        .with_poll(BackoffPolicy::new(5, 1, 5).with_jitter_percent(0))
}

#[allow(dead_code)]
pub fn soap(inner: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><env:Envelope xmlns:env="http://www.w3.org/2003/05/soap-envelope"><env:Header/><env:Body>{inner}</env:Body></env:Envelope>"#
    )
}

#[allow(dead_code)]
pub fn receipt_reply(code: &str, protocol: &str) -> String {
    soap(&format!(
        r#"<ns2:rResEnviLoteDe xmlns:ns2="{SIFEN_NS}"><ns2:dFecProc>2026-01-14T10:31:00-03:00</ns2:dFecProc><ns2:dCodRes>{code}</ns2:dCodRes><ns2:dMsgRes>Lote recibido</ns2:dMsgRes><ns2:dProtConsLote>{protocol}</ns2:dProtConsLote><ns2:dTpoProces>0</ns2:dTpoProces></ns2:rResEnviLoteDe>"#
    ))
}

#[allow(dead_code)]
pub fn status_reply(code: &str) -> String {
    soap(&format!(
        r#"<ns2:rResEnviConsLoteDe xmlns:ns2="{SIFEN_NS}"><ns2:dCodResLot>{code}</ns2:dCodResLot><ns2:dMsgResLot>Lote en procesamiento</ns2:dMsgResLot></ns2:rResEnviConsLoteDe>"#
    ))
}

#[allow(dead_code)]
pub fn concluded_reply(cdc: &str, status: &str, results: &[(&str, &str)]) -> String {
    let results: String = results
        .iter()
        .map(|(code, message)| {
            format!("<ns2:gResProc><ns2:dCodRes>{code}</ns2:dCodRes><ns2:dMsgRes>{message}</ns2:dMsgRes></ns2:gResProc>")
        })
        .collect();
    soap(&format!(
        r#"<ns2:rResEnviConsLoteDe xmlns:ns2="{SIFEN_NS}"><ns2:dCodResLot>0362</ns2:dCodResLot><ns2:dMsgResLot>Procesamiento de lote concluido</ns2:dMsgResLot><ns2:gResProcLote><ns2:id>{cdc}</ns2:id><ns2:dEstRes>{status}</ns2:dEstRes><ns2:dProtAut>1234567890</ns2:dProtAut>{results}</ns2:gResProcLote></ns2:rResEnviConsLoteDe>"#
    ))
}

#[allow(dead_code)]
pub fn document_reply(code: &str) -> String {
    soap(&format!(
        r#"<ns2:rEnviConsDeResponse xmlns:ns2="{SIFEN_NS}"><ns2:dCodRes>{code}</ns2:dCodRes><ns2:dMsgRes>CDC consultado</ns2:dMsgRes></ns2:rEnviConsDeResponse>"#
    ))
}

/// Scripted [`Exchange`]: hands out queued replies in order and records
/// every request body it was given.
#[derive(Default)]
pub struct FakeExchange {
    replies: Mutex<VecDeque<Result<HttpReply, ExchangeError>>>,
    requests: Mutex<Vec<(String, String)>>,
}

#[allow(dead_code)]
impl FakeExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, body: impl Into<String>) -> Self {
        self.push(Ok(HttpReply {
            status: 200,
            body: body.into().into_bytes(),
        }))
    }

    pub fn reply_status(self, status: u16, body: impl Into<String>) -> Self {
        self.push(Ok(HttpReply {
            status,
            body: body.into().into_bytes(),
        }))
    }

    pub fn fail(self, error: ExchangeError) -> Self {
        self.push(Err(error))
    }

    fn push(self, item: Result<HttpReply, ExchangeError>) -> Self {
        self.replies.lock().expect("lock").push_back(item);
        self
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().expect("lock").len()
    }

    pub fn requests(&self) -> Vec<(String, String)> {
        self.requests.lock().expect("lock").clone()
    }

    fn next(&self, url: &str, body: &str) -> Result<HttpReply, ExchangeError> {
        self.requests
            .lock()
            .expect("lock")
            .push((url.to_string(), body.to_string()));
        self.replies
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or_else(|| Err(ExchangeError::Other("script exhausted".into())))
    }
}

impl Exchange for FakeExchange {
    async fn post(&self, url: &str, body: &str) -> Result<HttpReply, ExchangeError> {
        self.next(url, body)
    }

    async fn get(&self, url: &str) -> Result<HttpReply, ExchangeError> {
        self.next(url, "")
    }
}
