//! `gCamFuFD/dCarQR` trailer: the public consultation URL sealed with the
//! taxpayer security code (CSC).
use base64ct::{Base64, Encoding};
use sha2::{Digest, Sha256};
use std::fmt::Write;
use thiserror::Error;

use super::SignedDocument;
use super::sign::{self, SigningError};
use super::xml::{self, constants::{FORMAT_VERSION, QR_TRAILER_TEMPLATE}};
use crate::config::{EnvironmentType, SecurityCodeConfig};

#[derive(Debug, Error)]
pub enum QrError {
    #[error("QR field missing from document: {0}")]
    MissingField(&'static str),
    #[error("QR XML error: {0}")]
    Xml(String),
    #[error("invalid DigestValue: {0}")]
    Digest(String),
    #[error(transparent)]
    Signing(#[from] SigningError),
}

pub type QrResult<T> = std::result::Result<T, QrError>;

/// Values the consultation URL is built from, read from a signed `rDE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrPayload {
    cdc: String,
    issue_date: String,
    receiver: Receiver,
    total: String,
    total_vat: String,
    items: usize,
    digest_value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Receiver {
    Ruc(String),
    Document(String),
}

impl QrPayload {
    pub fn from_signed(document: &SignedDocument) -> QrResult<Self> {
        let doc = xml::parse(document.xml()).map_err(QrError::Xml)?;
        let ctx = xml::context(&doc).map_err(QrError::Xml)?;
        let text = |expr: &str| xml::text(&ctx, expr).map_err(QrError::Xml);

        let issue_date = text("/s:rDE/s:DE/s:gDatGralOpe/s:dFeEmiDE")?
            .ok_or(QrError::MissingField("dFeEmiDE"))?;
        let receiver = match text("/s:rDE/s:DE/s:gDatGralOpe/s:gDatRec/s:dRucRec")? {
            Some(ruc) => Receiver::Ruc(ruc),
            None => Receiver::Document(
                text("/s:rDE/s:DE/s:gDatGralOpe/s:gDatRec/s:dNumIDRec")?.unwrap_or_else(|| "0".into()),
            ),
        };
        let total = text("/s:rDE/s:DE/s:gTotSub/s:dTotGralOpe")?.unwrap_or_else(|| "0".into());
        let total_vat = text("/s:rDE/s:DE/s:gTotSub/s:dTotIVA")?.unwrap_or_else(|| "0".into());
        let items = xml::nodes(&ctx, "/s:rDE/s:DE/s:gDtipDE/s:gCamItem")
            .map_err(QrError::Xml)?
            .len();

        Ok(Self {
            cdc: document.cdc().to_string(),
            issue_date,
            receiver,
            total,
            total_vat,
            items,
            digest_value: document.digest_value().to_string(),
        })
    }

    /// Query string without the hash, in the order the service expects.
    pub fn parameters(&self, csc_id: &str) -> String {
        let receiver = match &self.receiver {
            Receiver::Ruc(ruc) => format!("dRucRec={ruc}"),
            Receiver::Document(id) => format!("dNumIDRec={id}"),
        };
        format!(
            "nVersion={FORMAT_VERSION}&Id={}&dFeEmiDE={}&{receiver}&dTotGralOpe={}&dTotIVA={}&cItems={}&DigestValue={}&IdCSC={csc_id}",
            self.cdc,
            hex(self.issue_date.as_bytes()),
            self.total,
            self.total_vat,
            self.items,
            hex(self.digest_value.as_bytes()),
        )
    }

    /// Full consultation URL including `cHashQR`.
    pub fn url(&self, env: EnvironmentType, csc: &SecurityCodeConfig) -> String {
        let parameters = self.parameters(&csc.id);
        let seal = hex(&Sha256::digest(format!("{parameters}{}", csc.secret.expose()).as_bytes()));
        format!("{}{parameters}&cHashQR={seal}", env.qr_base_url())
    }

    /// The digest the URL embeds, decoded; useful to cross-check against `DE`.
    pub fn digest_bytes(&self) -> QrResult<Vec<u8>> {
        Base64::decode_vec(&self.digest_value).map_err(|e| QrError::Digest(e.to_string()))
    }
}

/// Appends (or replaces) the QR trailer after the signature.
pub fn attach_trailer(
    document: &SignedDocument,
    env: EnvironmentType,
    csc: &SecurityCodeConfig,
) -> QrResult<SignedDocument> {
    let url = QrPayload::from_signed(document)?.url(env, csc);
    let mut doc = xml::parse(document.xml()).map_err(QrError::Xml)?;
    let mut root = doc
        .get_root_element()
        .ok_or(QrError::MissingField("rDE"))?;
    for mut stale in xml::element_children(&root)
        .into_iter()
        .filter(|node| node.get_name() == "gCamFuFD")
    {
        stale.unlink();
    }
    let fragment = QR_TRAILER_TEMPLATE.replace("{qr}", &escape(&url));
    let mut trailer = xml::import_fragment(&mut doc, &fragment).map_err(QrError::Xml)?;
    root.add_child(&mut trailer).map_err(|e| QrError::Xml(e.to_string()))?;

    let serialized = xml::compact_root(&doc).map_err(QrError::Xml)?;
    sign::check_profile(&serialized)?;
    Ok(SignedDocument::new(
        serialized,
        document.cdc().clone(),
        document.digest_value().to_string(),
        document.signing_time(),
    ))
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}

fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
