//! SOAP 1.2 client for the SIFEN web services, plus typed replies.
pub mod endpoint;
pub mod envelope;
pub mod evidence;
pub mod exchange;
pub mod response;
pub mod retry;

use chrono::Utc;
use std::{sync::Arc, time::Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use endpoint::{EndpointResolver, EndpointSource};
pub use evidence::{DirectoryEvidence, EvidenceSink, ExchangeArtifact, MemoryEvidence, NoEvidence, Stage};
pub use exchange::{Exchange, ExchangeError, HttpReply, HttpsExchange};
pub use response::{
    DocumentOutcome, DocumentQueryRecord, LoteReceipt, ProtocolError, ResultMessage, StatusRecord,
};

use crate::{
    batch::{Batch, BatchId},
    config::{BackoffPolicy, Config, Operation},
    document::cdc::Cdc,
};
use retry::Attempts;

/// Errors raised before a reply reached us.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: ExchangeError },
    #[error("request failed on attempt {attempt}: {error}")]
    Failed { attempt: u32, error: ExchangeError },
    #[error("could not discover the {operation} endpoint: {reason}")]
    Discovery { operation: Operation, reason: String },
    #[error("HTTP client error: {0}")]
    Client(String),
}

/// Undecoded reply plus where and how it was obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    operation: Operation,
    endpoint: String,
    http_status: u16,
    body: String,
    attempts: u32,
}

impl RawResponse {
    pub fn new(
        operation: Operation,
        endpoint: impl Into<String>,
        http_status: u16,
        body: String,
        attempts: u32,
    ) -> Self {
        Self {
            operation,
            endpoint: endpoint.into(),
            http_status,
            body,
            attempts,
        }
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn http_status(&self) -> u16 {
        self.http_status
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// Number of attempts it took to get this reply.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// SIFEN SOAP client.
///
/// Every HTTP attempt is recorded in the configured [`EvidenceSink`] before
/// the reply is looked at. Network failures are retried with exponential
/// backoff and jitter; anything else fails on the first attempt.
///
/// # Examples
/// ```rust,no_run
/// use std::time::Duration;
/// use sifen_core::api::{HttpsExchange, SoapClient};
/// use sifen_core::config::{Config, EnvironmentType};
///
/// let config = Config::new(EnvironmentType::Test);
/// let exchange = HttpsExchange::without_identity(Duration::from_secs(30))?;
/// let client = SoapClient::new(&config, exchange);
/// # let _ = client;
/// # Ok::<(), sifen_core::api::TransportError>(())
/// ```
pub struct SoapClient<E> {
    exchange: E,
    endpoints: EndpointResolver,
    retry: BackoffPolicy,
    evidence: Arc<dyn EvidenceSink>,
}

impl<E> std::fmt::Debug for SoapClient<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoapClient")
            .field("endpoints", &self.endpoints)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl<E: Exchange> SoapClient<E> {
    pub fn new(config: &Config, exchange: E) -> Self {
        Self {
            exchange,
            endpoints: EndpointResolver::new(config),
            retry: *config.retry(),
            evidence: Arc::new(NoEvidence),
        }
    }

    pub fn with_evidence(mut self, evidence: Arc<dyn EvidenceSink>) -> Self {
        self.evidence = evidence;
        self
    }

    pub fn exchange(&self) -> &E {
        &self.exchange
    }

    pub fn endpoints(&self) -> &EndpointResolver {
        &self.endpoints
    }

    /// Posts a packaged batch (`rEnvioLote`).
    pub async fn send_batch(&self, batch: &Batch) -> Result<RawResponse, TransportError> {
        let envelope = envelope::recibe_lote(batch.id().as_str(), batch.payload());
        self.call(Operation::RecibeLote, &envelope).await
    }

    /// Queries a batch by the protocol number from its receipt.
    pub async fn query_batch(&self, protocol: &str) -> Result<RawResponse, TransportError> {
        let envelope = envelope::consulta_lote(BatchId::generate().as_str(), protocol);
        self.call(Operation::ConsultaLote, &envelope).await
    }

    /// Looks one document up by CDC.
    pub async fn query_document(&self, cdc: &Cdc) -> Result<RawResponse, TransportError> {
        let envelope = envelope::consulta_de(BatchId::generate().as_str(), cdc.as_str());
        self.call(Operation::ConsultaDe, &envelope).await
    }

    pub async fn submit_batch(&self, batch: &Batch) -> Result<LoteReceipt, crate::Error> {
        let raw = self.send_batch(batch).await?;
        Ok(LoteReceipt::parse(&raw)?)
    }

    pub async fn batch_status(&self, protocol: &str) -> Result<StatusRecord, crate::Error> {
        let raw = self.query_batch(protocol).await?;
        Ok(StatusRecord::parse(&raw)?)
    }

    pub async fn document_status(&self, cdc: &Cdc) -> Result<DocumentQueryRecord, crate::Error> {
        let raw = self.query_document(cdc).await?;
        Ok(DocumentQueryRecord::parse(&raw)?)
    }

    async fn call(&self, operation: Operation, envelope: &str) -> Result<RawResponse, TransportError> {
        let (endpoint, source) = self.endpoint(operation).await?;
        debug!(%operation, %endpoint, ?source, "sending request");
        let (reply, attempt) = self
            .with_retry(operation, Stage::Request, &endpoint, Some(envelope))
            .await?;
        Ok(RawResponse::new(
            operation,
            endpoint,
            reply.status,
            String::from_utf8_lossy(&reply.body).into_owned(),
            attempt,
        ))
    }

    /// Resolves the endpoint, fetching the service description when nothing
    /// is configured, known or cached.
    async fn endpoint(&self, operation: Operation) -> Result<(String, EndpointSource), TransportError> {
        if let Some(found) = self.endpoints.resolve_offline(operation) {
            return Ok(found);
        }
        let url = self.endpoints.description_url(operation);
        debug!(%operation, %url, "discovering endpoint");
        let (reply, _) = self
            .with_retry(operation, Stage::Discovery, &url, None)
            .await
            .map_err(|e| TransportError::Discovery {
                operation,
                reason: e.to_string(),
            })?;
        let endpoint = self.endpoints.accept_description(operation, &reply)?;
        Ok((endpoint, EndpointSource::Discovered))
    }

    /// POSTs `body` (or GETs when there is none) under the retry policy,
    /// recording one artifact per attempt. Returns the reply and the attempt
    /// that produced it.
    async fn with_retry(
        &self,
        operation: Operation,
        stage: Stage,
        url: &str,
        body: Option<&str>,
    ) -> Result<(HttpReply, u32), TransportError> {
        let mut attempts = Attempts::new(&self.retry);
        let mut last = None;
        while let Some(attempt) = attempts.begin() {
            let started_at = Utc::now();
            let clock = Instant::now();
            let result = match body {
                Some(body) => self.exchange.post(url, body).await,
                None => self.exchange.get(url).await,
            };
            let elapsed_ms = u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX);

            let (http_status, response, failure) = match &result {
                Ok(reply) => (
                    Some(reply.status),
                    Some(String::from_utf8_lossy(&reply.body).into_owned()),
                    None,
                ),
                Err(error) => (None, None, Some(error.to_string())),
            };
            let artifact = ExchangeArtifact::new(
                operation,
                url,
                attempt,
                started_at,
                elapsed_ms,
                body.unwrap_or_default(),
                http_status,
                response,
                failure,
            )
            .in_stage(stage);
            if let Err(error) = self.evidence.record(&artifact) {
                warn!(%operation, stage = stage.as_str(), attempt, %error, "failed to record exchange evidence");
            }

            match result {
                Ok(reply) => {
                    info!(%operation, stage = stage.as_str(), attempt, status = reply.status, elapsed_ms, "reply received");
                    return Ok((reply, attempt));
                }
                Err(error) if !error.is_transient() => {
                    warn!(%operation, stage = stage.as_str(), attempt, %error, "request failed, not retrying");
                    return Err(TransportError::Failed { attempt, error });
                }
                Err(error) => {
                    if !attempts.exhausted() {
                        let delay = attempts.delay();
                        warn!(%operation, stage = stage.as_str(), attempt, %error, delay_ms = delay.as_millis() as u64, "request failed, retrying");
                        tokio::time::sleep(delay).await;
                    }
                    last = Some(error);
                }
            }
        }

        Err(TransportError::RetriesExhausted {
            attempts: attempts.made(),
            last: last.unwrap_or_else(|| ExchangeError::Other("no attempt was made".into())),
        })
    }
}
