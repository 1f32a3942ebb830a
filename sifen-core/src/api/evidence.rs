//! Per-attempt exchange records, for audit and debugging.
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use crate::config::Operation;

/// Which part of a logical call an attempt belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// GET of the service description to find the endpoint.
    Discovery,
    /// POST of the SOAP envelope.
    Request,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Discovery => "discovery",
            Stage::Request => "request",
        }
    }
}

/// What was sent and what came back for one HTTP attempt.
///
/// Only the SOAP envelope and the reply are kept. Certificate passwords and
/// key material never pass through the transport, so they cannot end up here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExchangeArtifact {
    operation: Operation,
    stage: Stage,
    endpoint: String,
    attempt: u32,
    started_at: DateTime<Utc>,
    elapsed_ms: u64,
    request: String,
    http_status: Option<u16>,
    response: Option<String>,
    failure: Option<String>,
}

impl ExchangeArtifact {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        operation: Operation,
        endpoint: &str,
        attempt: u32,
        started_at: DateTime<Utc>,
        elapsed_ms: u64,
        request: &str,
        http_status: Option<u16>,
        response: Option<String>,
        failure: Option<String>,
    ) -> Self {
        Self {
            operation,
            stage: Stage::Request,
            endpoint: endpoint.to_string(),
            attempt,
            started_at,
            elapsed_ms,
            request: request.to_string(),
            http_status,
            response,
            failure,
        }
    }

    pub(crate) fn in_stage(mut self, stage: Stage) -> Self {
        self.stage = stage;
        self
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// 1-based attempt number within one logical call.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed_ms
    }

    pub fn request(&self) -> &str {
        &self.request
    }

    pub fn http_status(&self) -> Option<u16> {
        self.http_status
    }

    pub fn response(&self) -> Option<&str> {
        self.response.as_deref()
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }
}

/// Receives every artifact the client produces.
pub trait EvidenceSink: Send + Sync {
    fn record(&self, artifact: &ExchangeArtifact) -> io::Result<()>;
}

/// Drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEvidence;

impl EvidenceSink for NoEvidence {
    fn record(&self, _artifact: &ExchangeArtifact) -> io::Result<()> {
        Ok(())
    }
}

/// Keeps artifacts in memory; handy in tests and short-lived tools.
#[derive(Debug, Default)]
pub struct MemoryEvidence {
    artifacts: Mutex<Vec<ExchangeArtifact>>,
}

impl MemoryEvidence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn artifacts(&self) -> Vec<ExchangeArtifact> {
        self.artifacts
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.artifacts.lock().map(|guard| guard.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EvidenceSink for MemoryEvidence {
    fn record(&self, artifact: &ExchangeArtifact) -> io::Result<()> {
        self.artifacts
            .lock()
            .map_err(|_| io::Error::other("evidence store poisoned"))?
            .push(artifact.clone());
        Ok(())
    }
}

/// Writes each attempt as `NNNNNN-<operation>-<attempt>.json` under a directory
/// (`NNNNNN-<operation>-discovery-<attempt>.json` for description fetches).
#[derive(Debug)]
pub struct DirectoryEvidence {
    root: PathBuf,
    sequence: AtomicU64,
}

impl DirectoryEvidence {
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            sequence: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl EvidenceSink for DirectoryEvidence {
    fn record(&self, artifact: &ExchangeArtifact) -> io::Result<()> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let name = match artifact.stage() {
            Stage::Request => format!(
                "{sequence:06}-{}-{}.json",
                artifact.operation().as_str(),
                artifact.attempt()
            ),
            Stage::Discovery => format!(
                "{sequence:06}-{}-discovery-{}.json",
                artifact.operation().as_str(),
                artifact.attempt()
            ),
        };
        let body = serde_json::to_vec_pretty(artifact).map_err(io::Error::other)?;
        fs::write(self.root.join(name), body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(attempt: u32) -> ExchangeArtifact {
        ExchangeArtifact::new(
            Operation::RecibeLote,
            "https://sifen-test.set.gov.py/de/ws/async/recibe-lote.wsdl",
            attempt,
            Utc::now(),
            12,
            "<soap:Envelope/>",
            Some(200),
            Some("<ok/>".into()),
            None,
        )
    }

    #[test]
    fn memory_evidence_keeps_order() {
        let sink = MemoryEvidence::new();
        sink.record(&artifact(1)).expect("record");
        sink.record(&artifact(2)).expect("record");
        let attempts: Vec<u32> = sink.artifacts().iter().map(|a| a.attempt()).collect();
        assert_eq!(attempts, vec![1, 2]);
    }

    #[test]
    fn directory_evidence_writes_json_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = DirectoryEvidence::new(dir.path().join("evidence")).expect("sink");
        sink.record(&artifact(1)).expect("record");

        let written = sink.root().join("000001-recibe_lote-1.json");
        let value: serde_json::Value =
            serde_json::from_slice(&fs::read(written).expect("read")).expect("json");
        assert_eq!(value["attempt"], 1);
        assert_eq!(value["http_status"], 200);
        assert_eq!(value["operation"], "recibe_lote");
        assert_eq!(value["stage"], "request");
    }

    #[test]
    fn discovery_attempts_get_their_own_file_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = DirectoryEvidence::new(dir.path()).expect("sink");
        sink.record(&artifact(1).in_stage(Stage::Discovery)).expect("record");
        sink.record(&artifact(1)).expect("record");

        assert!(dir.path().join("000001-recibe_lote-discovery-1.json").exists());
        assert!(dir.path().join("000002-recibe_lote-1.json").exists());
    }
}
