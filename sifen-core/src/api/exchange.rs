//! The narrow HTTP seam the SOAP client talks through.
use reqwest::{Client, Identity};
use std::{error::Error as StdError, future::Future, io, time::Duration};
use thiserror::Error;

use super::TransportError;
use crate::cert::PemPair;

/// Status and raw body of one HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Failure of a single exchange, classified for the retry loop.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExchangeError {
    #[error("connection reset: {0}")]
    ConnectionReset(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("{0}")]
    Other(String),
}

impl ExchangeError {
    /// Network-level failures worth retrying.
    pub fn is_transient(&self) -> bool {
        !matches!(self, ExchangeError::Other(_))
    }
}

/// Sends bytes to a URL and returns whatever came back.
///
/// `post` carries SOAP 1.2 envelopes; `get` is only used to fetch service
/// descriptions during endpoint discovery.
pub trait Exchange {
    fn post(&self, url: &str, body: &str) -> impl Future<Output = Result<HttpReply, ExchangeError>> + Send;

    fn get(&self, url: &str) -> impl Future<Output = Result<HttpReply, ExchangeError>> + Send;
}

pub(crate) const SOAP12_CONTENT_TYPE: &str = "application/soap+xml; charset=utf-8";

/// reqwest + rustls client presenting the taxpayer certificate (mTLS).
#[derive(Debug, Clone)]
pub struct HttpsExchange {
    client: Client,
}

impl HttpsExchange {
    /// Loads the client identity from a materialized PEM pair. The pair can be
    /// dropped afterwards; the identity lives in memory.
    pub fn new(pem: &PemPair, timeout: Duration) -> Result<Self, TransportError> {
        let identity_pem = pem
            .identity_pem()
            .map_err(|e| TransportError::Client(e.to_string()))?;
        let identity = Identity::from_pem(&identity_pem)
            .map_err(|e| TransportError::Client(format!("client identity: {e}")))?;
        let client = Client::builder()
            .use_rustls_tls()
            .identity(identity)
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Client(e.to_string()))?;
        Ok(Self { client })
    }

    /// Client without a client certificate, for plain-HTTP test doubles.
    pub fn without_identity(timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Client(e.to_string()))?;
        Ok(Self { client })
    }
}

impl Exchange for HttpsExchange {
    async fn post(&self, url: &str, body: &str) -> Result<HttpReply, ExchangeError> {
        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, SOAP12_CONTENT_TYPE)
            .body(body.to_string())
            .send()
            .await
            .map_err(|e| classify(&e))?;
        read_reply(response).await
    }

    async fn get(&self, url: &str) -> Result<HttpReply, ExchangeError> {
        let response = self.client.get(url).send().await.map_err(|e| classify(&e))?;
        read_reply(response).await
    }
}

async fn read_reply(response: reqwest::Response) -> Result<HttpReply, ExchangeError> {
    let status = response.status().as_u16();
    let body = response.bytes().await.map_err(|e| classify(&e))?;
    Ok(HttpReply {
        status,
        body: body.to_vec(),
    })
}

/// Maps a reqwest error onto the retry classification by inspecting the
/// error itself and every `source()` below it.
pub(crate) fn classify(error: &reqwest::Error) -> ExchangeError {
    let message = error.to_string();
    if error.is_timeout() {
        return ExchangeError::Timeout(message);
    }
    if has_reset_cause(error) {
        return ExchangeError::ConnectionReset(message);
    }
    if error.is_connect() {
        return ExchangeError::Connect(message);
    }
    ExchangeError::Other(message)
}

fn has_reset_cause(error: &(dyn StdError + 'static)) -> bool {
    let mut current: Option<&(dyn StdError + 'static)> = Some(error);
    while let Some(cause) = current {
        if let Some(io_error) = cause.downcast_ref::<io::Error>() {
            if is_reset_kind(io_error.kind()) {
                return true;
            }
        }
        let text = cause.to_string().to_ascii_lowercase();
        if text.contains("connection reset") || text.contains("connection closed before message completed") {
            return true;
        }
        current = cause.source();
    }
    false
}

fn is_reset_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}
