//! Client-side submission pipeline for Paraguay's SIFEN e-invoicing service
//! (certificates, CDC, XML-DSig, batches, SOAP over mTLS and status tracking).
//!
//! # Examples
//! ```rust
//! use sifen_core::config::{Config, EnvironmentType};
//!
//! let config = Config::new(EnvironmentType::Test);
//! # let _ = config;
//! ```
pub mod api;
pub mod autofix;
pub mod batch;
pub mod cert;
pub mod config;
pub mod document;
pub mod pipeline;
pub mod status;

use std::fmt;
use thiserror::Error;

/// Top-level error wrapper for core operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Certificate(#[from] cert::CertificateError),
    #[error(transparent)]
    Cdc(#[from] document::cdc::CdcError),
    #[error(transparent)]
    Signing(#[from] document::sign::SigningError),
    #[error(transparent)]
    Qr(#[from] document::qr::QrError),
    #[error(transparent)]
    Packaging(#[from] batch::PackagingError),
    #[error(transparent)]
    Transport(#[from] api::TransportError),
    #[error(transparent)]
    Protocol(#[from] api::ProtocolError),
    #[error(transparent)]
    State(#[from] status::StateError),
    #[error(transparent)]
    AutoFix(#[from] autofix::AutoFixError),
}

/// The component that classified a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    Configuration,
    CertificateResolver,
    DocumentIdentifier,
    XmlSigner,
    BatchPackager,
    SoapTransport,
    StatusTracker,
    StructuralAutoFixer,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Configuration => "configuration",
            Component::CertificateResolver => "certificate_resolver",
            Component::DocumentIdentifier => "document_identifier",
            Component::XmlSigner => "xml_signer",
            Component::BatchPackager => "batch_packager",
            Component::SoapTransport => "soap_transport",
            Component::StatusTracker => "status_tracker",
            Component::StructuralAutoFixer => "structural_auto_fixer",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// The component that classified the failure. Submission failures raised
    /// inside the auto-fix loop report the component that produced them.
    pub fn component(&self) -> Component {
        match self {
            Error::AutoFix(autofix::AutoFixError::Submission(inner)) => inner.component(),
            Error::Config(_) => Component::Configuration,
            Error::Certificate(_) => Component::CertificateResolver,
            Error::Cdc(_) => Component::DocumentIdentifier,
            Error::Signing(_) | Error::Qr(_) => Component::XmlSigner,
            Error::Packaging(_) => Component::BatchPackager,
            Error::Transport(_) | Error::Protocol(_) => Component::SoapTransport,
            Error::State(_) => Component::StatusTracker,
            Error::AutoFix(_) => Component::StructuralAutoFixer,
        }
    }

    /// Whether the operation may succeed if repeated unchanged.
    ///
    /// Transport errors are already retried inside the SOAP client, so this is
    /// only true for a handful of service-side conditions.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Protocol(err) => err.is_transient(),
            Error::AutoFix(autofix::AutoFixError::Submission(inner)) => inner.is_retryable(),
            _ => false,
        }
    }
}
