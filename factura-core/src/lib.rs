//! Rust toolkit for SRI Ecuador e-invoicing (access keys, XAdES-BES signing,
//! reception/authorization client and the invoice lifecycle).
//!
//! # Examples
//! ```rust
//! use factura_core::config::{Config, EnvironmentType};
//!
//! let config = Config::new(EnvironmentType::Test);
//! # let _ = config;
//! ```
pub mod access_key;
pub mod api;
pub mod certificate;
pub mod config;
pub mod invoice;
pub mod operation;
pub mod sign;

use thiserror::Error;

/// Top-level error wrapper for core operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] config::EnvironmentParseError),
    #[error(transparent)]
    AccessKey(#[from] access_key::AccessKeyError),
    #[error(transparent)]
    Certificate(#[from] certificate::CertificateError),
    #[error(transparent)]
    Signing(#[from] sign::SigningError),
    #[error(transparent)]
    Invoice(#[from] invoice::InvoiceError),
    #[error(transparent)]
    Xml(#[from] invoice::InvoiceXmlError),
    #[error(transparent)]
    Api(#[from] api::SriError),
    #[error(transparent)]
    Operation(#[from] operation::OperationError),
}
