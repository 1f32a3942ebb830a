//! Typed views over SIFEN SOAP replies.
//!
//! Fields are looked up by local name, so the parser does not care which
//! prefix the service binds to its namespaces.
use libxml::{
    tree::{Document, Node},
    xpath,
};
use tracing::debug;
use thiserror::Error;

use super::RawResponse;
use crate::document::xml;

/// The reply could not be read as the expected SIFEN message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("SOAP fault {code}: {reason}")]
    Fault { code: String, reason: String },
    #[error("HTTP {status} without a readable SOAP body")]
    Http { status: u16, body: String },
    #[error("response is not well-formed XML: {0}")]
    MalformedXml(String),
    #[error("expected <{expected}> in response, got: {snippet}")]
    UnexpectedShape { expected: &'static str, snippet: String },
    #[error("<{message}> is missing required field {field}")]
    MissingField {
        message: &'static str,
        field: &'static str,
    },
}

impl ProtocolError {
    /// Gateway-level HTTP failures and receiver-side faults may clear up on
    /// their own; everything else needs a change on our side.
    pub fn is_transient(&self) -> bool {
        match self {
            ProtocolError::Http { status, .. } => matches!(status, 502..=504),
            ProtocolError::Fault { code, .. } => code.ends_with("Receiver"),
            _ => false,
        }
    }
}

/// Element names the per-document result list has been seen under.
pub const LOTE_RESULT_VARIANTS: [&str; 3] = ["gResProcLote", "gResProcLOTE", "GResProcLote"];

/// Reply to `rEnvioLote` (`rResEnviLoteDe`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoteReceipt {
    processed_at: Option<String>,
    code: String,
    message: String,
    protocol: Option<String>,
    processing_time: Option<String>,
}

impl LoteReceipt {
    pub fn parse(response: &RawResponse) -> Result<Self, ProtocolError> {
        let reply = Reply::open(response, "rResEnviLoteDe")?;
        Ok(Self {
            processed_at: reply.field("dFecProc")?,
            code: reply.required("dCodRes")?,
            message: reply.field("dMsgRes")?.unwrap_or_default(),
            protocol: reply.field("dProtConsLote")?,
            processing_time: reply.field("dTpoProces")?,
        })
    }

    pub fn processed_at(&self) -> Option<&str> {
        self.processed_at.as_deref()
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Protocol number used to query the batch afterwards (`dProtConsLote`).
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    pub fn processing_time(&self) -> Option<&str> {
        self.processing_time.as_deref()
    }
}

/// One `gResProc` entry: a code and message attached to a document result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultMessage {
    pub code: String,
    pub message: String,
}

/// Per-document result inside a concluded batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentOutcome {
    cdc: Option<String>,
    status: String,
    authorization: Option<String>,
    results: Vec<ResultMessage>,
}

impl DocumentOutcome {
    pub fn new(cdc: Option<String>, status: impl Into<String>) -> Self {
        Self {
            cdc,
            status: status.into(),
            authorization: None,
            results: Vec::new(),
        }
    }

    pub fn with_result(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.results.push(ResultMessage {
            code: code.into(),
            message: message.into(),
        });
        self
    }

    pub fn with_authorization(mut self, authorization: impl Into<String>) -> Self {
        self.authorization = Some(authorization.into());
        self
    }

    pub fn cdc(&self) -> Option<&str> {
        self.cdc.as_deref()
    }

    /// Raw `dEstRes` text, e.g. `Aprobado con observación`.
    pub fn status(&self) -> &str {
        &self.status
    }

    /// Authorization protocol (`dProtAut`), present for approved documents.
    pub fn authorization(&self) -> Option<&str> {
        self.authorization.as_deref()
    }

    pub fn results(&self) -> &[ResultMessage] {
        &self.results
    }

    /// All result messages joined, as the service wrote them.
    pub fn message(&self) -> String {
        self.results
            .iter()
            .map(|r| format!("{}: {}", r.code, r.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Reply to `rEnviConsLoteDe` (`rResEnviConsLoteDe`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRecord {
    processed_at: Option<String>,
    code: String,
    message: String,
    documents: Vec<DocumentOutcome>,
}

impl StatusRecord {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            processed_at: None,
            code: code.into(),
            message: message.into(),
            documents: Vec::new(),
        }
    }

    pub fn with_document(mut self, outcome: DocumentOutcome) -> Self {
        self.documents.push(outcome);
        self
    }

    pub fn parse(response: &RawResponse) -> Result<Self, ProtocolError> {
        let reply = Reply::open(response, "rResEnviConsLoteDe")?;
        let mut documents = Vec::new();
        for variant in LOTE_RESULT_VARIANTS {
            let entries = reply.nodes(&format!("{}/*[local-name()='{variant}']", reply.root))?;
            if entries.is_empty() {
                continue;
            }
            for entry in entries {
                documents.push(reply.outcome(&entry)?);
            }
            break;
        }
        Ok(Self {
            processed_at: reply.field("dFecProc")?,
            code: reply.required("dCodResLot")?,
            message: reply.field("dMsgResLot")?.unwrap_or_default(),
            documents,
        })
    }

    pub fn processed_at(&self) -> Option<&str> {
        self.processed_at.as_deref()
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn documents(&self) -> &[DocumentOutcome] {
        &self.documents
    }

    /// Outcome for one CDC. A single unlabelled entry is taken to be the
    /// document of a single-document batch.
    pub fn outcome_for(&self, cdc: &str) -> Option<&DocumentOutcome> {
        self.documents
            .iter()
            .find(|d| d.cdc() == Some(cdc))
            .or_else(|| match self.documents.as_slice() {
                [only] if only.cdc().is_none() => Some(only),
                _ => None,
            })
    }
}

/// Reply to `rEnviConsDeRequest` (`rEnviConsDeResponse`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentQueryRecord {
    processed_at: Option<String>,
    code: String,
    message: String,
    content: Option<String>,
}

impl DocumentQueryRecord {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            processed_at: None,
            code: code.into(),
            message: message.into(),
            content: None,
        }
    }

    pub fn parse(response: &RawResponse) -> Result<Self, ProtocolError> {
        let reply = Reply::open(response, "rEnviConsDeResponse")?;
        Ok(Self {
            processed_at: reply.field("dFecProc")?,
            code: reply.required("dCodRes")?,
            message: reply.field("dMsgRes")?.unwrap_or_default(),
            content: reply.field("xContenDE")?,
        })
    }

    pub fn processed_at(&self) -> Option<&str> {
        self.processed_at.as_deref()
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Stored document as returned in `xContenDE`, when found.
    pub fn content(&self) -> Option<&str> {
        self.content.as_deref()
    }
}

struct Reply {
    ctx: xpath::Context,
    _doc: Document,
    message: &'static str,
    root: String,
}

impl Reply {
    fn open(response: &RawResponse, message: &'static str) -> Result<Self, ProtocolError> {
        let body = response.body();
        if body.trim().is_empty() {
            return Err(ProtocolError::Http {
                status: response.http_status(),
                body: String::new(),
            });
        }
        let status = response.http_status();
        let doc = match xml::parse(body) {
            Ok(doc) => doc,
            Err(reason) if status >= 400 => {
                debug!(%reason, status, "error reply is not XML");
                return Err(ProtocolError::Http {
                    status,
                    body: snippet(body),
                });
            }
            Err(reason) => return Err(ProtocolError::MalformedXml(reason)),
        };
        let ctx = xml::context(&doc).map_err(ProtocolError::MalformedXml)?;

        if xml::first_node(&ctx, "//*[local-name()='Fault']")
            .map_err(ProtocolError::MalformedXml)?
            .is_some()
        {
            let code = xml::text(
                &ctx,
                "//*[local-name()='Fault']/*[local-name()='Code']/*[local-name()='Value']",
            )
            .map_err(ProtocolError::MalformedXml)?
            .unwrap_or_default();
            let reason = xml::text(
                &ctx,
                "//*[local-name()='Fault']/*[local-name()='Reason']/*[local-name()='Text']",
            )
            .map_err(ProtocolError::MalformedXml)?
            .unwrap_or_default();
            return Err(ProtocolError::Fault { code, reason });
        }

        let root = format!("//*[local-name()='{message}']");
        if xml::first_node(&ctx, &root)
            .map_err(ProtocolError::MalformedXml)?
            .is_none()
        {
            if status >= 400 {
                return Err(ProtocolError::Http {
                    status,
                    body: snippet(body),
                });
            }
            return Err(ProtocolError::UnexpectedShape {
                expected: message,
                snippet: snippet(body),
            });
        }
        Ok(Self {
            ctx,
            _doc: doc,
            message,
            root,
        })
    }

    fn nodes(&self, expr: &str) -> Result<Vec<Node>, ProtocolError> {
        xml::nodes(&self.ctx, expr).map_err(ProtocolError::MalformedXml)
    }

    fn field(&self, name: &str) -> Result<Option<String>, ProtocolError> {
        xml::text(&self.ctx, &format!("{}/*[local-name()='{name}']", self.root))
            .map_err(ProtocolError::MalformedXml)
    }

    fn required(&self, name: &'static str) -> Result<String, ProtocolError> {
        self.field(name)?.ok_or(ProtocolError::MissingField {
            message: self.message,
            field: name,
        })
    }

    fn outcome(&self, entry: &Node) -> Result<DocumentOutcome, ProtocolError> {
        let child = |name: &str| {
            xml::child_named(entry, name)
                .map(|node| node.get_content().trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let mut outcome = DocumentOutcome::new(child("id"), child("dEstRes").unwrap_or_default());
        outcome.authorization = child("dProtAut");
        for result in xml::element_children(entry)
            .into_iter()
            .filter(|node| node.get_name() == "gResProc")
        {
            let text = |name: &str| {
                xml::child_named(&result, name)
                    .map(|node| node.get_content().trim().to_string())
                    .unwrap_or_default()
            };
            outcome.results.push(ResultMessage {
                code: text("dCodRes"),
                message: text("dMsgRes"),
            });
        }
        Ok(outcome)
    }
}

fn snippet(body: &str) -> String {
    body.chars().take(200).collect()
}
