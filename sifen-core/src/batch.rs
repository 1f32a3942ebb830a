//! Batch (`rLoteDE`) packaging: compact XML, single-entry zip, base64.
use base64ct::{Base64, Encoding};
use chrono::{DateTime, Local, NaiveDateTime, TimeDelta, Timelike};
use sha2::{Digest, Sha256};
use std::{
    collections::HashMap,
    fmt,
    io::{Cursor, Read, Write},
    sync::{Mutex, PoisonError},
};
use thiserror::Error;
use tracing::debug;
use zip::{CompressionMethod, ZipArchive, ZipWriter, write::SimpleFileOptions};

use crate::document::{
    SignedDocument,
    cdc::{Cdc, CdcError},
    xml::{
        self,
        constants::{BATCH_ENTRY_NAME, DS_NS, SIFEN_NS},
    },
};

/// Width of a generated batch id.
pub const BATCH_ID_LEN: usize = 15;

static ISSUER: BatchIdIssuer = BatchIdIssuer::new();

#[derive(Debug, Error)]
pub enum PackagingError {
    #[error("batch contains no documents")]
    EmptyBatch,
    #[error("not a batch container: {0}")]
    NotABatch(String),
    #[error("rDE #{index} does not start with dVerFor")]
    MissingVersionMarker { index: usize },
    #[error("rDE #{index} has no DE element in the SIFEN namespace")]
    MissingDocument { index: usize },
    #[error("rDE #{index} carries no signature")]
    MissingSignature { index: usize },
    #[error("rDE #{index} must not carry an Id attribute")]
    UnexpectedId { index: usize },
    #[error("invalid document identifier in batch: {0}")]
    Identifier(#[from] CdcError),
    #[error("malformed batch XML: {0}")]
    MalformedXml(String),
    #[error("zip error: {0}")]
    Compression(String),
    #[error("base64 error: {0}")]
    Encoding(String),
    #[error("invalid batch id '{0}': expected {len} digits", len = BATCH_ID_LEN)]
    InvalidBatchId(String),
    #[error("batch id {id} already used for a different payload")]
    BatchIdReused { id: BatchId },
}

/// `dId`: a 15-digit, time-derived request identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BatchId(String);

impl BatchId {
    /// `YYYYMMDDHHMMSS` in local time plus one sequence digit, unique per process.
    pub fn generate() -> Self {
        ISSUER.issue_at(Local::now())
    }

    pub fn parse(value: &str) -> Result<Self, PackagingError> {
        if value.len() != BATCH_ID_LEN || !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(PackagingError::InvalidBatchId(value.to_string()));
        }
        Ok(BatchId(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hands out strictly increasing batch ids.
///
/// Ten ids fit in one clock second; the eleventh borrows the next second so
/// the fifteen-digit width never has to grow.
#[derive(Debug, Default)]
pub struct BatchIdIssuer {
    last: Mutex<Option<(NaiveDateTime, u8)>>,
}

impl BatchIdIssuer {
    pub const fn new() -> Self {
        Self { last: Mutex::new(None) }
    }

    pub fn issue_at(&self, now: DateTime<Local>) -> BatchId {
        let second = now
            .naive_local()
            .with_nanosecond(0)
            .unwrap_or_else(|| now.naive_local());
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        let next = match *last {
            Some((previous, sequence)) if previous >= second && sequence < 9 => (previous, sequence + 1),
            Some((previous, _)) if previous >= second => (previous + TimeDelta::seconds(1), 0),
            _ => (second, 0),
        };
        *last = Some(next);
        let (stamp, sequence) = next;
        BatchId(format!("{}{sequence}", stamp.format("%Y%m%d%H%M%S")))
    }
}

/// An immutable, ready-to-send batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    id: BatchId,
    xml: String,
    payload: String,
    documents: Vec<Cdc>,
}

impl Batch {
    pub fn id(&self) -> &BatchId {
        &self.id
    }

    /// Compact `rLoteDE` XML that was zipped.
    pub fn xml(&self) -> &str {
        &self.xml
    }

    /// Base64 of the zip archive (`xDE`).
    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn documents(&self) -> &[Cdc] {
        &self.documents
    }

    /// SHA-256 over the batch XML, used to detect id reuse.
    pub fn fingerprint(&self) -> [u8; 32] {
        Sha256::digest(self.xml.as_bytes()).into()
    }

    /// Reverses base64 and zip, returning the `lote.xml` entry.
    pub fn unpack(&self) -> Result<String, PackagingError> {
        unpack_payload(&self.payload)
    }
}

/// Decodes an `xDE` payload back to the batch XML.
pub fn unpack_payload(payload: &str) -> Result<String, PackagingError> {
    let bytes = Base64::decode_vec(payload).map_err(|e| PackagingError::Encoding(e.to_string()))?;
    let mut archive =
        ZipArchive::new(Cursor::new(bytes)).map_err(|e| PackagingError::Compression(e.to_string()))?;
    if archive.len() != 1 {
        return Err(PackagingError::Compression(format!(
            "expected a single entry, found {}",
            archive.len()
        )));
    }
    let mut entry = archive
        .by_index(0)
        .map_err(|e| PackagingError::Compression(e.to_string()))?;
    if entry.name() != BATCH_ENTRY_NAME {
        return Err(PackagingError::Compression(format!(
            "unexpected entry name '{}'",
            entry.name()
        )));
    }
    let mut out = String::new();
    entry
        .read_to_string(&mut out)
        .map_err(|e| PackagingError::Compression(e.to_string()))?;
    Ok(out)
}

/// Wraps signed documents into batches.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchPackager;

impl BatchPackager {
    pub fn new() -> Self {
        Self
    }

    pub fn wrap(&self, document: &SignedDocument, id: BatchId) -> Result<Batch, PackagingError> {
        self.wrap_many(std::slice::from_ref(document), id)
    }

    pub fn wrap_many(&self, documents: &[SignedDocument], id: BatchId) -> Result<Batch, PackagingError> {
        if documents.is_empty() {
            return Err(PackagingError::EmptyBatch);
        }
        let mut body = String::new();
        for document in documents {
            body.push_str(strip_declaration(document.xml()));
        }
        let xml = format!(r#"<rLoteDE xmlns="{SIFEN_NS}">{body}</rLoteDE>"#);
        let cdcs = documents.iter().map(|doc| doc.cdc().clone()).collect();
        seal(id, xml, cdcs)
    }

    /// Packages raw XML: a pre-assembled `rLoteDE` is validated and repackaged
    /// byte-for-byte, a single signed `rDE` is wrapped.
    pub fn wrap_xml(&self, raw: &str, id: BatchId) -> Result<Batch, PackagingError> {
        let xml = strip_declaration(raw);
        let doc = xml::parse(xml).map_err(PackagingError::MalformedXml)?;
        let root = doc
            .get_root_element()
            .ok_or_else(|| PackagingError::NotABatch("empty document".into()))?;
        match root.get_name().as_str() {
            "rLoteDE" => {
                let cdcs = validate_container(&root)?;
                debug!(batch = %id, documents = cdcs.len(), "repackaging pre-assembled batch");
                seal(id, xml.to_string(), cdcs)
            }
            "rDE" => {
                let document = SignedDocument::from_xml(xml)
                    .map_err(|e| PackagingError::NotABatch(e.to_string()))?;
                self.wrap(&document, id)
            }
            other => Err(PackagingError::NotABatch(format!("unexpected root {other}"))),
        }
    }
}

fn validate_container(root: &libxml::tree::Node) -> Result<Vec<Cdc>, PackagingError> {
    if xml::namespace_href(root).as_deref() != Some(SIFEN_NS) {
        return Err(PackagingError::NotABatch("rLoteDE outside the SIFEN namespace".into()));
    }
    let documents: Vec<_> = xml::element_children(root)
        .into_iter()
        .filter(|node| node.get_name() == "rDE")
        .collect();
    if documents.is_empty() {
        return Err(PackagingError::EmptyBatch);
    }
    let mut cdcs = Vec::with_capacity(documents.len());
    for (index, rde) in documents.iter().enumerate() {
        if rde.get_attribute("Id").is_some() {
            return Err(PackagingError::UnexpectedId { index });
        }
        match xml::first_element_child(rde) {
            Some(first) if first.get_name() == "dVerFor" => {}
            _ => return Err(PackagingError::MissingVersionMarker { index }),
        }
        let de = xml::element_children(rde)
            .into_iter()
            .find(|node| node.get_name() == "DE" && xml::namespace_href(node).as_deref() == Some(SIFEN_NS))
            .ok_or(PackagingError::MissingDocument { index })?;
        if !xml::element_children(rde)
            .iter()
            .any(|node| node.get_name() == "Signature" && xml::namespace_href(node).as_deref() == Some(DS_NS))
        {
            return Err(PackagingError::MissingSignature { index });
        }
        let id = de
            .get_attribute("Id")
            .ok_or(PackagingError::MissingDocument { index })?;
        cdcs.push(Cdc::parse(&id)?);
    }
    Ok(cdcs)
}

fn seal(id: BatchId, xml: String, documents: Vec<Cdc>) -> Result<Batch, PackagingError> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    writer
        .start_file(BATCH_ENTRY_NAME, options)
        .map_err(|e| PackagingError::Compression(e.to_string()))?;
    writer
        .write_all(xml.as_bytes())
        .map_err(|e| PackagingError::Compression(e.to_string()))?;
    let archive = writer
        .finish()
        .map_err(|e| PackagingError::Compression(e.to_string()))?
        .into_inner();
    let payload = Base64::encode_string(&archive);
    debug!(batch = %id, xml_bytes = xml.len(), zip_bytes = archive.len(), "packaged batch");
    Ok(Batch {
        id,
        xml,
        payload,
        documents,
    })
}

fn strip_declaration(xml: &str) -> &str {
    let trimmed = xml.trim();
    if trimmed.starts_with("<?xml") {
        if let Some(end) = trimmed.find("?>") {
            return trimmed[end + 2..].trim_start();
        }
    }
    trimmed
}

/// Remembers which payload each batch id was used for.
#[derive(Debug, Default)]
pub struct BatchRegistry {
    seen: HashMap<BatchId, [u8; 32]>,
}

impl BatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `batch`. Registering the same id with the same payload again is a no-op.
    pub fn register(&mut self, batch: &Batch) -> Result<(), PackagingError> {
        let fingerprint = batch.fingerprint();
        match self.seen.get(batch.id()) {
            Some(existing) if *existing != fingerprint => Err(PackagingError::BatchIdReused {
                id: batch.id().clone(),
            }),
            Some(_) => Ok(()),
            None => {
                self.seen.insert(batch.id().clone(), fingerprint);
                Ok(())
            }
        }
    }

    pub fn contains(&self, id: &BatchId) -> bool {
        self.seen.contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const CDC: &str = "01045547378001001000000112026011411234567819";

    fn signed_rde() -> String {
        format!(
            r##"<rDE xmlns="{SIFEN_NS}"><dVerFor>150</dVerFor><DE Id="{CDC}"><dDVId>9</dDVId></DE><Signature xmlns="{DS_NS}"><SignedInfo><Reference URI="#{CDC}"><DigestValue>AQID</DigestValue></Reference></SignedInfo></Signature></rDE>"##
        )
    }

    fn id(value: &str) -> BatchId {
        BatchId::parse(value).unwrap()
    }

    #[test]
    fn generated_ids_are_fifteen_digits_from_the_clock() {
        let now = Local.with_ymd_and_hms(2026, 1, 14, 9, 30, 5).unwrap();
        let id = BatchIdIssuer::new().issue_at(now);
        assert_eq!(id.as_str(), "202601140930050");
        assert_eq!(id.as_str().len(), BATCH_ID_LEN);
        assert!(BatchId::parse(id.as_str()).is_ok());
        assert!(BatchId::parse("2026011409300").is_err());
        assert!(BatchId::parse("20260114093005x").is_err());
        assert_eq!(BatchId::generate().as_str().len(), BATCH_ID_LEN);
    }

    #[test]
    fn a_burst_within_one_second_never_repeats_an_id() {
        let issuer = BatchIdIssuer::new();
        let now = Local.with_ymd_and_hms(2026, 1, 14, 9, 30, 5).unwrap();
        let ids: Vec<_> = (0..25).map(|_| issuer.issue_at(now)).collect();

        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(ids[9].as_str(), "202601140930059");
        assert_eq!(ids[10].as_str(), "202601140930060");
        assert_eq!(ids[24].as_str(), "202601140930074");
        assert!(ids.iter().all(|id| BatchId::parse(id.as_str()).is_ok()));

        // the clock catching up does not rewind the sequence
        let later = Local.with_ymd_and_hms(2026, 1, 14, 9, 30, 6).unwrap();
        assert_eq!(issuer.issue_at(later).as_str(), "202601140930075");
    }

    #[test]
    fn wrap_puts_signed_bytes_inside_rlotede_unchanged() {
        let document = SignedDocument::from_xml(signed_rde()).unwrap();
        let batch = BatchPackager::new()
            .wrap(&document, id("202601140930051"))
            .unwrap();
        assert_eq!(
            batch.xml(),
            format!(r#"<rLoteDE xmlns="{SIFEN_NS}">{}</rLoteDE>"#, signed_rde())
        );
        assert_eq!(batch.unpack().unwrap(), batch.xml());
        assert_eq!(batch.documents()[0].as_str(), CDC);
        assert!(!batch.xml().contains('\n'));
    }

    #[test]
    fn pre_assembled_batch_is_validated_and_kept_verbatim() {
        let lote = format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<rLoteDE xmlns=\"{SIFEN_NS}\">{}</rLoteDE>",
            signed_rde()
        );
        let batch = BatchPackager::new()
            .wrap_xml(&lote, id("202601140930052"))
            .unwrap();
        assert!(batch.xml().starts_with("<rLoteDE"));
        assert_eq!(batch.unpack().unwrap(), batch.xml());
    }

    #[test]
    fn pre_assembled_batch_shape_errors() {
        let packager = BatchPackager::new();
        let unsigned = format!(
            r#"<rDE xmlns="{SIFEN_NS}"><dVerFor>150</dVerFor><DE Id="{CDC}"><dDVId>9</dDVId></DE></rDE>"#
        );
        let lote = format!(r#"<rLoteDE xmlns="{SIFEN_NS}">{unsigned}</rLoteDE>"#);
        assert!(matches!(
            packager.wrap_xml(&lote, id("202601140930053")),
            Err(PackagingError::MissingSignature { index: 0 })
        ));

        let with_id = signed_rde().replacen("<rDE ", "<rDE Id=\"x\" ", 1);
        let lote = format!(r#"<rLoteDE xmlns="{SIFEN_NS}">{with_id}</rLoteDE>"#);
        assert!(matches!(
            packager.wrap_xml(&lote, id("202601140930054")),
            Err(PackagingError::UnexpectedId { index: 0 })
        ));

        let lote = format!(r#"<rLoteDE xmlns="{SIFEN_NS}"/>"#);
        assert!(matches!(
            packager.wrap_xml(&lote, id("202601140930055")),
            Err(PackagingError::EmptyBatch)
        ));
    }

    #[test]
    fn registry_rejects_id_reuse_for_different_payload() {
        let packager = BatchPackager::new();
        let document = SignedDocument::from_xml(signed_rde()).unwrap();
        let first = packager.wrap(&document, id("202601140930056")).unwrap();
        let other_xml = signed_rde().replace("<dDVId>9</dDVId>", "<dDVId>8</dDVId>");
        let second = packager
            .wrap(&SignedDocument::from_xml(other_xml).unwrap(), id("202601140930056"))
            .unwrap();

        let mut registry = BatchRegistry::new();
        registry.register(&first).unwrap();
        registry.register(&first).unwrap();
        assert!(matches!(
            registry.register(&second),
            Err(PackagingError::BatchIdReused { .. })
        ));
    }
}
