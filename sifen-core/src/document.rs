//! Electronic documents (DE) before and after signing.
pub mod cdc;
pub mod qr;
pub mod sign;
pub(crate) mod xml;

use chrono::NaiveDateTime;

use cdc::Cdc;
use sign::SigningError;
use xml::constants::{DS_NS, FORMAT_VERSION, SIFEN_NS};

/// An `rDE` document whose `DE` carries a verified CDC as its `Id`.
///
/// Any existing `Signature` or QR trailer is ignored; the signer replaces them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedDocument {
    xml: String,
    cdc: Cdc,
}

impl UnsignedDocument {
    /// Checks the minimal shape (`rDE` root in the SIFEN namespace, `dVerFor`
    /// first, a `DE` child whose `Id` is a valid CDC).
    pub fn from_xml(xml: impl Into<String>) -> Result<Self, SigningError> {
        let xml = xml.into();
        let cdc = inspect(&xml)?;
        Ok(Self { xml, cdc })
    }

    pub fn xml(&self) -> &str {
        &self.xml
    }

    pub fn cdc(&self) -> &Cdc {
        &self.cdc
    }

    pub fn into_xml(self) -> String {
        self.xml
    }
}

/// A signed `rDE`, serialized compactly. Produced by [`sign::XmlSigner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedDocument {
    xml: String,
    cdc: Cdc,
    digest_value: String,
    signing_time: Option<NaiveDateTime>,
}

impl SignedDocument {
    pub(crate) fn new(
        xml: String,
        cdc: Cdc,
        digest_value: String,
        signing_time: Option<NaiveDateTime>,
    ) -> Self {
        Self {
            xml,
            cdc,
            digest_value,
            signing_time,
        }
    }

    /// Wraps a document signed elsewhere, e.g. one read back from storage.
    pub fn from_xml(xml: impl Into<String>) -> Result<Self, SigningError> {
        let xml = xml.into();
        let cdc = inspect(&xml)?;
        let (digest_value, signing_time) = {
            let doc = xml::parse(&xml).map_err(SigningError::MalformedXml)?;
            let ctx = xml::context(&doc).map_err(SigningError::MalformedXml)?;
            let digest = xml::text(&ctx, "/s:rDE/ds:Signature/ds:SignedInfo/ds:Reference/ds:DigestValue")
                .map_err(SigningError::MalformedXml)?
                .ok_or(SigningError::MissingElement("DigestValue"))?;
            let time = xml::text(&ctx, "/s:rDE/s:DE/s:dFecFirma")
                .map_err(SigningError::MalformedXml)?
                .and_then(|value| NaiveDateTime::parse_from_str(&value, sign::SIGNING_TIME_FORMAT).ok());
            (digest, time)
        };
        Ok(Self {
            xml,
            cdc,
            digest_value,
            signing_time,
        })
    }

    pub fn xml(&self) -> &str {
        &self.xml
    }

    pub fn cdc(&self) -> &Cdc {
        &self.cdc
    }

    /// Base64 SHA-256 digest of the canonical `DE`.
    pub fn digest_value(&self) -> &str {
        &self.digest_value
    }

    pub fn signing_time(&self) -> Option<NaiveDateTime> {
        self.signing_time
    }

    /// Drops the signature and trailer, yielding a document that can be edited
    /// and signed again.
    pub fn to_unsigned(&self) -> Result<UnsignedDocument, SigningError> {
        let doc = xml::parse(&self.xml).map_err(SigningError::MalformedXml)?;
        let ctx = xml::context(&doc).map_err(SigningError::MalformedXml)?;
        for expr in ["/s:rDE/ds:Signature", "/s:rDE/s:gCamFuFD"] {
            for mut node in xml::nodes(&ctx, expr).map_err(SigningError::MalformedXml)? {
                node.unlink();
            }
        }
        let xml = xml::compact_root(&doc).map_err(SigningError::MalformedXml)?;
        UnsignedDocument::from_xml(xml)
    }

    pub fn into_xml(self) -> String {
        self.xml
    }
}

fn inspect(xml: &str) -> Result<Cdc, SigningError> {
    let doc = xml::parse(xml).map_err(SigningError::MalformedXml)?;
    let root = doc
        .get_root_element()
        .ok_or(SigningError::MissingElement("rDE"))?;
    if root.get_name() != "rDE" || xml::namespace_href(&root).as_deref() != Some(SIFEN_NS) {
        return Err(SigningError::MalformedXml(format!(
            "expected root rDE in {SIFEN_NS}, found {}",
            root.get_name()
        )));
    }
    let first = xml::first_element_child(&root).ok_or(SigningError::MissingElement("dVerFor"))?;
    if first.get_name() != "dVerFor" {
        return Err(SigningError::MissingElement("dVerFor"));
    }
    if first.get_content().trim() != FORMAT_VERSION {
        return Err(SigningError::MalformedXml(format!(
            "unsupported dVerFor '{}'",
            first.get_content().trim()
        )));
    }
    let de = xml::element_children(&root)
        .into_iter()
        .find(|node| node.get_name() == "DE" && xml::namespace_href(node).as_deref() == Some(SIFEN_NS))
        .ok_or(SigningError::MissingElement("DE"))?;
    let id = de
        .get_attribute("Id")
        .ok_or(SigningError::MissingElement("DE/@Id"))?;
    if xml::element_children(&root)
        .iter()
        .filter(|node| xml::namespace_href(node).as_deref() == Some(DS_NS))
        .count()
        > 1
    {
        return Err(SigningError::MalformedXml("more than one Signature".into()));
    }
    Ok(Cdc::parse(&id)?)
}
