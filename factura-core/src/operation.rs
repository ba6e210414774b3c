//! Lifecycle of one invoice attempt, from signing to authorization.
mod clock;
mod runner;
mod sink;

pub use clock::{Clock, SystemClock};
pub use runner::OperationRunner;
pub use sink::{JournalEntry, JournalSink, MemorySink, SinkError, TransitionSink};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::{
    access_key::AccessKey,
    api::{AuthorizationResult, SriError, SubmissionResult},
    certificate::CertificateError,
    invoice::Invoice,
    sign::{SignedDocument, SigningError},
};

/// State of an [`Operation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Created,
    Signing,
    Signed,
    Submitting,
    Received,
    PollingAuthorization,
    Authorized,
    Rejected,
    PendingAuthorization,
    SigningFailed,
    SubmissionError,
}

impl OperationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationState::Created => "created",
            OperationState::Signing => "signing",
            OperationState::Signed => "signed",
            OperationState::Submitting => "submitting",
            OperationState::Received => "received",
            OperationState::PollingAuthorization => "polling_authorization",
            OperationState::Authorized => "authorized",
            OperationState::Rejected => "rejected",
            OperationState::PendingAuthorization => "pending_authorization",
            OperationState::SigningFailed => "signing_failed",
            OperationState::SubmissionError => "submission_error",
        }
    }

    /// Transition table of the state machine.
    ///
    /// # Examples
    /// ```rust
    /// use factura_core::operation::OperationState;
    ///
    /// assert!(OperationState::Created.can_transition_to(OperationState::Signing));
    /// assert!(!OperationState::Created.can_transition_to(OperationState::Submitting));
    /// assert!(OperationState::PendingAuthorization
    ///     .can_transition_to(OperationState::PollingAuthorization));
    /// ```
    pub fn can_transition_to(self, next: OperationState) -> bool {
        use OperationState::*;
        match self {
            Created => matches!(next, Signing),
            Signing => matches!(next, Signed | SigningFailed),
            Signed => matches!(next, Submitting | SubmissionError),
            Submitting => matches!(next, Received | Rejected | SubmissionError),
            Received => matches!(next, PollingAuthorization | SubmissionError),
            PollingAuthorization => matches!(
                next,
                Authorized | Rejected | PendingAuthorization | SubmissionError
            ),
            PendingAuthorization => matches!(next, PollingAuthorization),
            SubmissionError => matches!(next, Submitting | PollingAuthorization),
            SigningFailed => matches!(next, Created),
            Authorized | Rejected => false,
        }
    }

    /// Authorized and rejected documents never change state again.
    pub fn is_final(self) -> bool {
        matches!(self, OperationState::Authorized | OperationState::Rejected)
    }

    pub fn is_failure(self) -> bool {
        matches!(
            self,
            OperationState::SigningFailed | OperationState::SubmissionError
        )
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: OperationState,
    pub to: OperationState,
    pub at: DateTime<Utc>,
    pub cause: Option<String>,
}

/// Outcome whose transition could not be persisted yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct PendingTransition {
    to: OperationState,
    cause: Option<String>,
}

/// Errors raised while driving an [`Operation`].
#[derive(Debug, Error)]
pub enum OperationError {
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        from: OperationState,
        to: OperationState,
    },
    #[error("authorization requires an accepted reception")]
    ReceptionRequired,
    #[error("operation has no signed document to submit")]
    NotSigned,
    #[error("document access key {found} does not match operation access key {expected}")]
    AccessKeyMismatch { expected: String, found: String },
    #[error("failed to persist transition: {0}")]
    Persistence(#[from] SinkError),
    #[error("operation task interrupted: {0}")]
    Interrupted(String),
    #[error(transparent)]
    Certificate(#[from] CertificateError),
    #[error(transparent)]
    Signing(#[from] SigningError),
    #[error(transparent)]
    Authority(#[from] SriError),
}

/// Persisted record of one invoice attempt.
///
/// Only [`OperationRunner`] mutates it; every change of `state` is mirrored in
/// `history` and in the runner's [`TransitionSink`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    id: String,
    access_key: AccessKey,
    sequence: Option<String>,
    total: Option<f64>,
    state: OperationState,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    history: Vec<Transition>,
    signed_document: Option<SignedDocument>,
    reception: Option<SubmissionResult>,
    authorization: Option<AuthorizationResult>,
    last_raw_response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pending: Option<PendingTransition>,
}

// Public API
impl Operation {
    pub fn new(id: impl Into<String>, access_key: AccessKey) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            access_key,
            sequence: None,
            total: None,
            state: OperationState::Created,
            last_error: None,
            created_at: now,
            updated_at: now,
            history: Vec::new(),
            signed_document: None,
            reception: None,
            authorization: None,
            last_raw_response: None,
            pending: None,
        }
    }

    /// Operation for a generated invoice, carrying its key, sequence and total.
    pub fn for_invoice(id: impl Into<String>, invoice: &Invoice) -> Self {
        let mut operation = Self::new(id, invoice.access_key().clone());
        operation.sequence = Some(invoice.sequence().to_string());
        operation.total = Some(invoice.totals().total());
        operation
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn access_key(&self) -> &AccessKey {
        &self.access_key
    }

    pub fn sequence(&self) -> Option<&str> {
        self.sequence.as_deref()
    }

    pub fn total(&self) -> Option<f64> {
        self.total
    }

    pub fn state(&self) -> OperationState {
        self.state
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    pub fn signed_document(&self) -> Option<&SignedDocument> {
        self.signed_document.as_ref()
    }

    pub fn reception(&self) -> Option<&SubmissionResult> {
        self.reception.as_ref()
    }

    pub fn authorization(&self) -> Option<&AuthorizationResult> {
        self.authorization.as_ref()
    }

    pub fn last_raw_response(&self) -> Option<&str> {
        self.last_raw_response.as_deref()
    }

    /// State reached by a completed step whose transition the sink has not
    /// accepted yet; [`OperationRunner::settle`] records it.
    pub fn pending_transition(&self) -> Option<OperationState> {
        self.pending.as_ref().map(|pending| pending.to)
    }

    /// Whether the authority has accepted the document for processing,
    /// including a duplicate answer for an already received key.
    pub fn reception_accepted(&self) -> bool {
        self.reception
            .as_ref()
            .is_some_and(|r| r.accepted() || r.is_duplicate())
    }
}

// Private API
impl Operation {
    fn apply(&mut self, transition: Transition) {
        self.state = transition.to;
        self.updated_at = transition.at;
        if transition.to.is_failure() || transition.to == OperationState::Rejected {
            self.last_error = transition.cause.clone();
        }
        self.history.push(transition);
    }
}
