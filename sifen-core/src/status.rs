//! Document lifecycle tracking from SIFEN status codes.
use std::fmt;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    api::{
        DocumentOutcome, DocumentQueryRecord, Exchange, LoteReceipt, SoapClient, StatusRecord,
        retry::Attempts,
    },
    config::BackoffPolicy,
    document::cdc::Cdc,
};

pub const CODE_BATCH_RECEIVED: &str = "0300";
pub const CODE_BATCH_NOT_QUEUED: &str = "0301";
pub const CODE_BATCH_NOT_FOUND: &str = "0360";
pub const CODE_BATCH_PROCESSING: &str = "0361";
pub const CODE_BATCH_CONCLUDED: &str = "0362";
pub const CODE_BATCH_QUERY_TOO_LATE: &str = "0364";
pub const CODE_DOCUMENT_NOT_FOUND: &str = "0420";
pub const CODE_DOCUMENT_FOUND: &str = "0422";

/// Final business outcome of a concluded document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Approved,
    Rejected,
}

/// Why a document ended in the error state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Receipt other than `0300` (including `0301`).
    NotQueued,
    BatchNotFound,
    DocumentNotFound,
    /// Concluded batch without a recognizable outcome for our document.
    UnknownOutcome,
    /// A status code this client does not know.
    UnrecognizedCode,
}

/// Service code and text that led to an error state, kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
}

impl ErrorDetail {
    /// The error to surface for this state. Unknown codes become a
    /// [`StateError`]; the rest are recognized service answers.
    pub fn to_error(&self) -> StateError {
        match self.kind {
            ErrorKind::UnrecognizedCode => StateError::UnexpectedCode {
                code: self.code.clone(),
                message: self.message.clone(),
            },
            _ => StateError::ServiceError {
                code: self.code.clone(),
                message: self.message.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleState {
    Signed,
    Submitted,
    Pending,
    Concluded(Outcome),
    Error(ErrorDetail),
}

impl LifecycleState {
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleState::Signed => "signed",
            LifecycleState::Submitted => "submitted",
            LifecycleState::Pending => "pending",
            LifecycleState::Concluded(Outcome::Approved) => "approved",
            LifecycleState::Concluded(Outcome::Rejected) => "rejected",
            LifecycleState::Error(_) => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Concluded(_) | LifecycleState::Error(_))
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("unexpected status code {code}: {message}")]
    UnexpectedCode { code: String, message: String },
    #[error("service reported {code}: {message}")]
    ServiceError { code: String, message: String },
    #[error("cannot apply {event} while {from}")]
    IllegalTransition {
        from: &'static str,
        event: &'static str,
    },
    #[error("no batch protocol number to poll with")]
    MissingProtocol,
}

/// Maps a receipt to the state it implies.
pub fn classify_receipt(receipt: &LoteReceipt) -> LifecycleState {
    match receipt.code() {
        CODE_BATCH_RECEIVED => LifecycleState::Submitted,
        CODE_BATCH_NOT_QUEUED => error(ErrorKind::NotQueued, receipt.code(), receipt.message()),
        other => error(ErrorKind::UnrecognizedCode, other, receipt.message()),
    }
}

/// Maps a batch status reply to the state it implies for one document, and
/// whether polling should switch to per-document lookups.
pub fn classify_batch(record: &StatusRecord, cdc: &Cdc) -> (LifecycleState, bool) {
    match record.code() {
        CODE_BATCH_PROCESSING => (LifecycleState::Pending, false),
        CODE_BATCH_QUERY_TOO_LATE => (LifecycleState::Pending, true),
        CODE_BATCH_NOT_FOUND => (
            error(ErrorKind::BatchNotFound, record.code(), record.message()),
            false,
        ),
        CODE_BATCH_CONCLUDED => match record.outcome_for(cdc.as_str()) {
            Some(outcome) => (classify_outcome(outcome), false),
            None => (
                error(
                    ErrorKind::UnknownOutcome,
                    record.code(),
                    &format!("no result for {cdc}: {}", record.message()),
                ),
                false,
            ),
        },
        other => (
            error(ErrorKind::UnrecognizedCode, other, record.message()),
            false,
        ),
    }
}

/// `dEstRes` text to outcome.
pub fn classify_outcome(outcome: &DocumentOutcome) -> LifecycleState {
    let status = outcome.status().trim();
    let lowered = status.to_lowercase();
    if lowered == "aprobado" || lowered == "aprobado con observación" || lowered == "aprobado con observacion" {
        LifecycleState::Concluded(Outcome::Approved)
    } else if lowered.starts_with("rechazado") {
        LifecycleState::Concluded(Outcome::Rejected)
    } else {
        error(ErrorKind::UnknownOutcome, CODE_BATCH_CONCLUDED, status)
    }
}

pub fn classify_document_query(record: &DocumentQueryRecord) -> LifecycleState {
    match record.code() {
        CODE_DOCUMENT_FOUND => LifecycleState::Concluded(Outcome::Approved),
        CODE_DOCUMENT_NOT_FOUND => error(ErrorKind::DocumentNotFound, record.code(), record.message()),
        other => error(ErrorKind::UnrecognizedCode, other, record.message()),
    }
}

fn error(kind: ErrorKind, code: &str, message: &str) -> LifecycleState {
    LifecycleState::Error(ErrorDetail {
        kind,
        code: code.to_string(),
        message: message.to_string(),
    })
}

/// Lifecycle of one document inside one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusTracker {
    cdc: Cdc,
    state: LifecycleState,
    protocol: Option<String>,
    use_document_lookup: bool,
    outcome: Option<DocumentOutcome>,
    history: Vec<(String, LifecycleState)>,
}

impl StatusTracker {
    pub fn new(cdc: Cdc) -> Self {
        Self {
            cdc,
            state: LifecycleState::Signed,
            protocol: None,
            use_document_lookup: false,
            outcome: None,
            history: Vec::new(),
        }
    }

    pub fn cdc(&self) -> &Cdc {
        &self.cdc
    }

    pub fn state(&self) -> &LifecycleState {
        &self.state
    }

    /// Batch protocol number from the receipt.
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    /// Set after `0364`: the batch can no longer be queried, only the document.
    pub fn use_document_lookup(&self) -> bool {
        self.use_document_lookup
    }

    /// Per-document result from the concluding batch reply, if any.
    pub fn outcome(&self) -> Option<&DocumentOutcome> {
        self.outcome.as_ref()
    }

    /// Status codes seen so far with the state each one produced.
    pub fn history(&self) -> &[(String, LifecycleState)] {
        &self.history
    }

    pub fn observe_receipt(&mut self, receipt: &LoteReceipt) -> Result<&LifecycleState, StateError> {
        if self.state != LifecycleState::Signed {
            return Err(self.illegal("receipt"));
        }
        let next = classify_receipt(receipt);
        if next == LifecycleState::Submitted {
            self.protocol = receipt.protocol().map(str::to_string);
        }
        Ok(self.advance(receipt.code(), next))
    }

    pub fn observe(&mut self, record: &StatusRecord) -> Result<&LifecycleState, StateError> {
        if !matches!(self.state, LifecycleState::Submitted | LifecycleState::Pending) {
            return Err(self.illegal("batch status"));
        }
        let (next, lookup) = classify_batch(record, &self.cdc);
        if lookup {
            self.use_document_lookup = true;
        }
        if let LifecycleState::Concluded(_) = next {
            self.outcome = record.outcome_for(self.cdc.as_str()).cloned();
        }
        Ok(self.advance(record.code(), next))
    }

    pub fn observe_document_query(
        &mut self,
        record: &DocumentQueryRecord,
    ) -> Result<&LifecycleState, StateError> {
        if !matches!(self.state, LifecycleState::Submitted | LifecycleState::Pending) {
            return Err(self.illegal("document lookup"));
        }
        let next = classify_document_query(record);
        Ok(self.advance(record.code(), next))
    }

    fn advance(&mut self, code: &str, next: LifecycleState) -> &LifecycleState {
        debug!(cdc = %self.cdc, code, from = self.state.name(), to = next.name(), "status transition");
        if next.is_terminal() {
            info!(cdc = %self.cdc, code, state = next.name(), "document settled");
        }
        self.history.push((code.to_string(), next.clone()));
        self.state = next;
        &self.state
    }

    fn illegal(&self, event: &'static str) -> StateError {
        StateError::IllegalTransition {
            from: self.state.name(),
            event,
        }
    }
}

/// Polls a submitted batch until its document settles or the poll budget
/// runs out, in which case the tracker is left in `Pending`.
///
/// Polls are strictly sequential; dropping the future between polls cancels it.
#[derive(Debug)]
pub struct StatusPoller<'a, E> {
    client: &'a SoapClient<E>,
    policy: BackoffPolicy,
}

impl<'a, E: Exchange> StatusPoller<'a, E> {
    pub fn new(client: &'a SoapClient<E>, policy: BackoffPolicy) -> Self {
        Self { client, policy }
    }

    pub async fn poll(&self, tracker: &mut StatusTracker) -> Result<LifecycleState, crate::Error> {
        let protocol = tracker
            .protocol()
            .map(str::to_string)
            .ok_or(StateError::MissingProtocol)?;
        let mut attempts = Attempts::new(&self.policy);
        while attempts.begin().is_some() {
            let by_document = tracker.use_document_lookup();
            if by_document {
                let record = self.client.document_status(tracker.cdc()).await?;
                tracker.observe_document_query(&record)?;
            } else {
                let record = self.client.batch_status(&protocol).await?;
                tracker.observe(&record)?;
            }
            if tracker.state().is_terminal() || attempts.exhausted() {
                break;
            }
            if !by_document && tracker.use_document_lookup() {
                // 0364: ask for the document straight away
                continue;
            }
            tokio::time::sleep(attempts.delay()).await;
        }
        Ok(tracker.state().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CDC: &str = "01045547378001001000000112026011411234567819";

    fn tracker() -> StatusTracker {
        StatusTracker::new(Cdc::parse(CDC).unwrap())
    }

    fn submitted() -> StatusTracker {
        let mut t = tracker();
        let receipt = receipt("0300");
        t.observe_receipt(&receipt).unwrap();
        t
    }

    fn receipt(code: &str) -> LoteReceipt {
        let body = format!(
            r#"<rResEnviLoteDe xmlns="http://ekuatia.set.gov.py/sifen/xsd"><dCodRes>{code}</dCodRes><dMsgRes>m</dMsgRes><dProtConsLote>4242</dProtConsLote></rResEnviLoteDe>"#
        );
        LoteReceipt::parse(&crate::api::RawResponse::new(
            crate::config::Operation::RecibeLote,
            "https://x/",
            200,
            body,
            1,
        ))
        .unwrap()
    }

    fn concluded(status: &str) -> StatusRecord {
        StatusRecord::new("0362", "Procesamiento concluido")
            .with_document(DocumentOutcome::new(Some(CDC.into()), status))
    }

    #[test]
    fn receipt_codes() {
        let mut t = tracker();
        assert_eq!(t.observe_receipt(&receipt("0300")).unwrap(), &LifecycleState::Submitted);
        assert_eq!(t.protocol(), Some("4242"));

        let mut t = tracker();
        let state = t.observe_receipt(&receipt("0301")).unwrap().clone();
        assert!(matches!(state, LifecycleState::Error(ErrorDetail { kind: ErrorKind::NotQueued, .. })));
    }

    #[test]
    fn batch_code_table() {
        let cdc = Cdc::parse(CDC).unwrap();
        let cases = [
            ("0361", "pending", false),
            ("0364", "pending", true),
            ("0360", "error", false),
            ("0999", "error", false),
        ];
        for (code, state, lookup) in cases {
            let (next, switch) = classify_batch(&StatusRecord::new(code, "x"), &cdc);
            assert_eq!(next.name(), state, "{code}");
            assert_eq!(switch, lookup, "{code}");
        }
    }

    #[test]
    fn outcome_texts() {
        let approved = ["Aprobado", "Aprobado con observación"];
        for text in approved {
            assert_eq!(
                classify_outcome(&DocumentOutcome::new(None, text)),
                LifecycleState::Concluded(Outcome::Approved)
            );
        }
        for text in ["Rechazado", "Rechazado con observación"] {
            assert_eq!(
                classify_outcome(&DocumentOutcome::new(None, text)),
                LifecycleState::Concluded(Outcome::Rejected)
            );
        }
        let LifecycleState::Error(detail) = classify_outcome(&DocumentOutcome::new(None, "Cancelado")) else {
            panic!("expected error state");
        };
        assert_eq!(detail.message, "Cancelado");
    }

    #[test]
    fn unknown_code_keeps_raw_values() {
        let mut t = submitted();
        let state = t.observe(&StatusRecord::new("0555", "Texto del servicio")).unwrap().clone();
        let LifecycleState::Error(detail) = state else {
            panic!("expected error state");
        };
        assert_eq!(
            detail.to_error(),
            StateError::UnexpectedCode {
                code: "0555".into(),
                message: "Texto del servicio".into(),
            }
        );
    }

    #[test]
    fn processing_then_approved_with_observation() {
        let mut t = submitted();
        for _ in 0..3 {
            assert_eq!(
                t.observe(&StatusRecord::new("0361", "En procesamiento")).unwrap(),
                &LifecycleState::Pending
            );
        }
        assert_eq!(
            t.observe(&concluded("Aprobado con observación")).unwrap(),
            &LifecycleState::Concluded(Outcome::Approved)
        );
        assert_eq!(t.outcome().unwrap().status(), "Aprobado con observación");
        assert_eq!(t.history().len(), 5);
    }

    #[test]
    fn terminal_states_reject_further_events() {
        let mut t = submitted();
        t.observe(&concluded("Rechazado")).unwrap();
        assert!(matches!(
            t.observe(&StatusRecord::new("0361", "x")),
            Err(StateError::IllegalTransition { from: "rejected", .. })
        ));
        assert!(t.observe_receipt(&receipt("0300")).is_err());
    }

    #[test]
    fn receipt_after_pending_is_illegal() {
        let mut t = submitted();
        t.observe(&StatusRecord::new("0361", "x")).unwrap();
        assert!(matches!(
            t.observe_receipt(&receipt("0300")),
            Err(StateError::IllegalTransition { from: "pending", event: "receipt" })
        ));
    }

    #[test]
    fn document_lookup_codes() {
        let mut t = submitted();
        t.observe(&StatusRecord::new("0364", "Consulta extemporánea")).unwrap();
        assert!(t.use_document_lookup());
        assert_eq!(
            t.observe_document_query(&DocumentQueryRecord::new("0422", "CDC encontrado")).unwrap(),
            &LifecycleState::Concluded(Outcome::Approved)
        );

        let mut t = submitted();
        let state = t
            .observe_document_query(&DocumentQueryRecord::new("0420", "CDC inexistente"))
            .unwrap()
            .clone();
        assert!(matches!(state, LifecycleState::Error(ErrorDetail { kind: ErrorKind::DocumentNotFound, .. })));
    }
}
