//! End-to-end submission: sign, seal the QR trailer, package, send and poll.
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, instrument};

use crate::{
    Error,
    api::{DocumentOutcome, EvidenceSink, Exchange, HttpsExchange, SoapClient},
    autofix::{AutoFixLoop, AutoFixReport, SubmissionDriver},
    batch::{Batch, BatchId, BatchPackager, BatchRegistry},
    cert::CertificateResolver,
    config::{BackoffPolicy, Config, EnvironmentType, SecurityCodeConfig},
    document::{SignedDocument, UnsignedDocument, cdc::Cdc, qr, sign::XmlSigner},
    status::{LifecycleState, StatusPoller, StatusTracker},
};

/// One document sent in one batch, and where tracking got to.
#[derive(Debug, Clone)]
pub struct Submission {
    batch_id: BatchId,
    tracker: StatusTracker,
    signed: Option<SignedDocument>,
}

impl Submission {
    pub fn new(batch_id: BatchId, tracker: StatusTracker) -> Self {
        Self {
            batch_id,
            tracker,
            signed: None,
        }
    }

    pub fn with_signed(mut self, signed: SignedDocument) -> Self {
        self.signed = Some(signed);
        self
    }

    pub fn batch_id(&self) -> &BatchId {
        &self.batch_id
    }

    pub fn cdc(&self) -> &Cdc {
        self.tracker.cdc()
    }

    pub fn state(&self) -> &LifecycleState {
        self.tracker.state()
    }

    pub fn tracker(&self) -> &StatusTracker {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut StatusTracker {
        &mut self.tracker
    }

    /// Per-document result, once the batch has concluded.
    pub fn outcome(&self) -> Option<&DocumentOutcome> {
        self.tracker.outcome()
    }

    /// The exact document that was sent.
    pub fn signed(&self) -> Option<&SignedDocument> {
        self.signed.as_ref()
    }
}

/// Drives single-document submissions through one SOAP client.
#[derive(Debug)]
pub struct SubmissionPipeline<E> {
    env: EnvironmentType,
    signer: XmlSigner,
    security_code: Option<SecurityCodeConfig>,
    packager: BatchPackager,
    client: SoapClient<E>,
    poll: BackoffPolicy,
    registry: Mutex<BatchRegistry>,
}

impl<E: Exchange + Sync> SubmissionPipeline<E> {
    pub fn new(config: &Config, signer: XmlSigner, client: SoapClient<E>) -> Self {
        Self {
            env: config.env(),
            signer,
            security_code: config.security_code().cloned(),
            packager: BatchPackager::new(),
            client,
            poll: *config.poll(),
            registry: Mutex::new(BatchRegistry::new()),
        }
    }

    pub fn client(&self) -> &SoapClient<E> {
        &self.client
    }

    /// Signs the document, adds the QR trailer when a CSC is configured and
    /// wraps it in a batch with a fresh id.
    pub fn prepare(&self, document: &UnsignedDocument) -> Result<(SignedDocument, Batch), Error> {
        let mut signed = self.signer.sign(document)?;
        if let Some(csc) = &self.security_code {
            signed = qr::attach_trailer(&signed, self.env, csc)?;
        }
        let batch = self.packager.wrap(&signed, BatchId::generate())?;
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .register(&batch)?;
        Ok((signed, batch))
    }

    #[instrument(skip_all, fields(cdc = %document.cdc()))]
    pub async fn submit_once(&self, document: &UnsignedDocument) -> Result<Submission, Error> {
        let (signed, batch) = self.prepare(document)?;
        info!(batch = %batch.id(), "submitting batch");
        let receipt = self.client.submit_batch(&batch).await?;

        let mut submission = Submission::new(batch.id().clone(), StatusTracker::new(signed.cdc().clone()))
            .with_signed(signed);
        submission.tracker_mut().observe_receipt(&receipt)?;
        if *submission.state() == LifecycleState::Submitted {
            StatusPoller::new(&self.client, self.poll)
                .poll(submission.tracker_mut())
                .await?;
        }
        Ok(submission)
    }

    pub async fn poll(&self, mut submission: Submission) -> Result<Submission, Error> {
        if !submission.state().is_terminal() {
            StatusPoller::new(&self.client, self.poll)
                .poll(submission.tracker_mut())
                .await?;
        }
        Ok(submission)
    }
}

impl<E: Exchange + Sync> SubmissionDriver for SubmissionPipeline<E> {
    async fn submit(&self, document: &UnsignedDocument) -> Result<Submission, Error> {
        self.submit_once(document).await
    }

    async fn resume(&self, submission: Submission) -> Result<Submission, Error> {
        self.poll(submission).await
    }
}

/// Resolves the configured certificate, opens an mTLS client and runs the
/// auto-fix loop for one document. The materialized PEM pair is removed
/// before returning, whatever the outcome.
pub async fn submit_with_config(
    config: &Config,
    document: UnsignedDocument,
    evidence: Arc<dyn EvidenceSink>,
) -> Result<AutoFixReport, Error> {
    config.check()?;
    let bundle = CertificateResolver::new(config).resolve_configured()?;
    let signer = XmlSigner::new(&bundle)?;
    let pem = bundle.materialize()?;

    let result = async {
        let exchange = HttpsExchange::new(&pem, config.request_timeout())?;
        let client = SoapClient::new(config, exchange).with_evidence(evidence);
        let pipeline = SubmissionPipeline::new(config, signer, client);
        Ok::<_, Error>(AutoFixLoop::from_config(config).run(document, &pipeline).await?)
    }
    .await;

    let closed = pem.close();
    let report = result?;
    closed?;
    Ok(report)
}
