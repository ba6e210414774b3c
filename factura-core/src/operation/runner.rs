use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

use super::{
    Clock, Operation, OperationError, OperationState, PendingTransition, SystemClock, Transition,
    TransitionSink,
};
use crate::{
    api::{AuthorizationDecision, Authority, ReceptionStatus},
    certificate::CertificateSource,
    config::Config,
    sign::{self, SignedDocument, UnsignedDocument},
};

/// Drives [`Operation`]s through signing, reception and authorization.
///
/// Cloning is cheap; clones share the authority, sink and clock.
#[derive(Debug)]
pub struct OperationRunner<A, S, C = SystemClock> {
    authority: Arc<A>,
    sink: Arc<S>,
    clock: Arc<C>,
    authorization_delay: Duration,
}

impl<A, S, C> Clone for OperationRunner<A, S, C> {
    fn clone(&self) -> Self {
        Self {
            authority: Arc::clone(&self.authority),
            sink: Arc::clone(&self.sink),
            clock: Arc::clone(&self.clock),
            authorization_delay: self.authorization_delay,
        }
    }
}

impl<A: Authority, S: TransitionSink> OperationRunner<A, S, SystemClock> {
    /// Runner on the wall clock, waiting `config.authorization_delay()`
    /// between reception and the first authorization query.
    pub fn new(authority: A, sink: S, config: &Config) -> Self {
        Self::with_clock(authority, sink, SystemClock, config.authorization_delay())
    }
}

// Public API
impl<A: Authority, S: TransitionSink, C: Clock> OperationRunner<A, S, C> {
    pub fn with_clock(authority: A, sink: S, clock: C, authorization_delay: Duration) -> Self {
        Self {
            authority: Arc::new(authority),
            sink: Arc::new(sink),
            clock: Arc::new(clock),
            authorization_delay,
        }
    }

    pub fn authority(&self) -> &A {
        &self.authority
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Records the outcome left behind when the sink refused a transition.
    ///
    /// Every other step calls this first, so a retry after a sink outage picks
    /// up where the operation stopped. No-op when nothing is pending.
    ///
    /// # Errors
    /// [`OperationError::Persistence`] while the sink still refuses; the
    /// outcome stays pending.
    pub fn settle(&self, operation: &mut Operation) -> Result<(), OperationError> {
        let Some(pending) = operation.pending.take() else {
            return Ok(());
        };
        if let Err(err) = self.transition(operation, pending.to, pending.cause.clone()) {
            operation.pending = Some(pending);
            return Err(err);
        }
        Ok(())
    }

    /// Moves a failed signing attempt back to `created`.
    pub fn restart(&self, operation: &mut Operation) -> Result<(), OperationError> {
        self.settle(operation)?;
        self.transition(operation, OperationState::Created, None)
    }

    /// `created -> signing -> signed`, or `signing_failed`.
    ///
    /// The certificate is loaded from `source` for this call only and dropped
    /// before returning.
    ///
    /// # Errors
    /// The extraction or signing error after `signing_failed` is recorded, or
    /// [`OperationError::InvalidTransition`] when the operation is not in `created`.
    pub fn sign<Src>(
        &self,
        operation: &mut Operation,
        document: &UnsignedDocument,
        source: &Src,
    ) -> Result<SignedDocument, OperationError>
    where
        Src: CertificateSource + ?Sized,
    {
        self.begin_signing(operation)?;
        let signed =
            check_access_key(operation, document).and_then(|()| sign_document(document, source));
        self.finish_signing(operation, signed)
    }

    /// `signed -> submitting -> received | rejected | submission_error`.
    ///
    /// Also re-enters from `submission_error` when no reception was accepted.
    /// A duplicate answer for an already received key counts as received.
    ///
    /// # Errors
    /// The authority error after `submission_error` is recorded; SOAP faults are
    /// recorded without an error since the raw answer is kept on the operation.
    pub async fn submit(&self, operation: &mut Operation) -> Result<OperationState, OperationError> {
        self.settle(operation)?;
        let payload = operation
            .signed_document
            .as_ref()
            .map(SignedDocument::to_base64)
            .ok_or(OperationError::NotSigned)?;
        self.transition(operation, OperationState::Submitting, None)?;

        match self.authority.submit(&payload).await {
            Ok(result) => {
                let next = if result.accepted() || result.is_duplicate() {
                    (OperationState::Received, None)
                } else if *result.status() == ReceptionStatus::Returned {
                    (OperationState::Rejected, Some(result.summary()))
                } else {
                    (
                        OperationState::SubmissionError,
                        Some(format!("reception: {}", result.summary())),
                    )
                };
                operation.last_raw_response = Some(result.raw_response().to_string());
                operation.reception = Some(result);
                self.conclude(operation, next.0, next.1)?;
                Ok(next.0)
            }
            Err(err) => {
                operation.last_raw_response = err.raw_response().map(str::to_string);
                self.conclude(
                    operation,
                    OperationState::SubmissionError,
                    Some(err.to_string()),
                )?;
                Err(err.into())
            }
        }
    }

    /// `received -> polling_authorization -> authorized | rejected | pending_authorization`.
    ///
    /// Waits the configured delay only when coming from `received`; re-entry
    /// from `pending_authorization` or `submission_error` queries immediately.
    ///
    /// # Errors
    /// [`OperationError::ReceptionRequired`] before an accepted reception; the
    /// authority error after `submission_error` is recorded.
    pub async fn poll_authorization(
        &self,
        operation: &mut Operation,
    ) -> Result<OperationState, OperationError> {
        self.settle(operation)?;
        if !operation.reception_accepted() {
            return Err(OperationError::ReceptionRequired);
        }
        let from = operation.state();
        if !from.can_transition_to(OperationState::PollingAuthorization) {
            return Err(OperationError::InvalidTransition {
                from,
                to: OperationState::PollingAuthorization,
            });
        }
        if from == OperationState::Received {
            self.clock.sleep(self.authorization_delay).await;
        }
        self.transition(operation, OperationState::PollingAuthorization, None)?;

        let access_key = operation.access_key().clone();
        match self.authority.authorize(&access_key).await {
            Ok(result) => {
                let next = match result.decision() {
                    AuthorizationDecision::Authorized { number } => {
                        info!(operation_id = %operation.id(), number = %number, "document authorized");
                        (OperationState::Authorized, None)
                    }
                    AuthorizationDecision::Rejected { .. } => {
                        (OperationState::Rejected, Some(result.summary()))
                    }
                    AuthorizationDecision::Ambiguous(ambiguous) => {
                        (OperationState::PendingAuthorization, Some(ambiguous.to_string()))
                    }
                };
                operation.last_raw_response = Some(result.raw_response().to_string());
                operation.authorization = Some(result);
                self.conclude(operation, next.0, next.1)?;
                Ok(next.0)
            }
            Err(err) => {
                operation.last_raw_response = err.raw_response().map(str::to_string);
                self.conclude(
                    operation,
                    OperationState::SubmissionError,
                    Some(err.to_string()),
                )?;
                Err(err.into())
            }
        }
    }

    /// Continues a signed operation: submits unless a reception was already
    /// accepted, then polls for authorization. Final states are returned as is.
    pub async fn resume(&self, operation: &mut Operation) -> Result<OperationState, OperationError> {
        self.settle(operation)?;
        if operation.state().is_final() {
            return Ok(operation.state());
        }
        if !operation.reception_accepted() {
            let state = self.submit(operation).await?;
            if state != OperationState::Received {
                return Ok(state);
            }
        }
        self.poll_authorization(operation).await
    }

    /// Signs `document` and drives the operation to a resting state.
    ///
    /// Loading the certificate and signing run on the blocking pool. Once the
    /// document is signed the remaining steps run on a spawned task, so
    /// dropping this future leaves them running; their transitions still
    /// reach the sink.
    ///
    /// # Errors
    /// Any error of [`Self::sign`] or [`Self::resume`], or
    /// [`OperationError::Interrupted`] when a task panics or is cancelled.
    pub async fn process<Src>(
        &self,
        operation: &mut Operation,
        document: &UnsignedDocument,
        source: Arc<Src>,
    ) -> Result<OperationState, OperationError>
    where
        Src: CertificateSource + ?Sized + 'static,
    {
        self.begin_signing(operation)?;
        let signed = match check_access_key(operation, document) {
            Ok(()) => {
                let document = document.clone();
                tokio::task::spawn_blocking(move || sign_document(&document, source.as_ref()))
                    .await
                    .map_err(|err| OperationError::Interrupted(err.to_string()))
                    .and_then(|signed| signed)
            }
            Err(err) => Err(err),
        };
        self.finish_signing(operation, signed)?;

        let runner = self.clone();
        let mut detached = operation.clone();
        let task = tokio::spawn(async move {
            let result = runner.resume(&mut detached).await;
            (detached, result)
        });

        let (finished, result) = task
            .await
            .map_err(|err| OperationError::Interrupted(err.to_string()))?;
        *operation = finished;
        result
    }
}

// Private API
impl<A: Authority, S: TransitionSink, C: Clock> OperationRunner<A, S, C> {
    fn begin_signing(&self, operation: &mut Operation) -> Result<(), OperationError> {
        self.settle(operation)?;
        self.transition(operation, OperationState::Signing, None)
    }

    fn finish_signing(
        &self,
        operation: &mut Operation,
        signed: Result<SignedDocument, OperationError>,
    ) -> Result<SignedDocument, OperationError> {
        match signed {
            Ok(document) => {
                operation.signed_document = Some(document.clone());
                self.conclude(operation, OperationState::Signed, None)?;
                Ok(document)
            }
            Err(err) => {
                warn!(operation_id = %operation.id(), error = %err, "signing failed");
                self.conclude(operation, OperationState::SigningFailed, Some(err.to_string()))?;
                Err(err)
            }
        }
    }

    /// Records the outcome of a completed step. When the sink refuses it, the
    /// outcome is parked on the operation for [`Self::settle`].
    fn conclude(
        &self,
        operation: &mut Operation,
        to: OperationState,
        cause: Option<String>,
    ) -> Result<(), OperationError> {
        match self.transition(operation, to, cause.clone()) {
            Err(OperationError::Persistence(err)) => {
                warn!(
                    operation_id = %operation.id(),
                    to = %to,
                    error = %err,
                    "transition not persisted, kept pending"
                );
                operation.pending = Some(PendingTransition { to, cause });
                Err(OperationError::Persistence(err))
            }
            other => other,
        }
    }

    fn transition(
        &self,
        operation: &mut Operation,
        to: OperationState,
        cause: Option<String>,
    ) -> Result<(), OperationError> {
        let from = operation.state();
        if !from.can_transition_to(to) {
            return Err(OperationError::InvalidTransition { from, to });
        }

        let transition = Transition {
            from,
            to,
            at: self.clock.now(),
            cause,
        };
        self.sink.record(operation.id(), &transition)?;

        match transition.cause.as_deref() {
            Some(cause) if to.is_failure() || to == OperationState::Rejected => warn!(
                operation_id = %operation.id(),
                from = %from,
                to = %to,
                cause,
                "operation transition"
            ),
            _ => info!(operation_id = %operation.id(), from = %from, to = %to, "operation transition"),
        }
        operation.apply(transition);
        Ok(())
    }
}

fn sign_document<Src>(
    document: &UnsignedDocument,
    source: &Src,
) -> Result<SignedDocument, OperationError>
where
    Src: CertificateSource + ?Sized,
{
    let certificate = source.load()?;
    Ok(sign::sign(document, &certificate)?)
}

fn check_access_key(
    operation: &Operation,
    document: &UnsignedDocument,
) -> Result<(), OperationError> {
    let Some(found) = document.access_key() else {
        return Ok(());
    };
    if found != operation.access_key().as_str() {
        return Err(OperationError::AccessKeyMismatch {
            expected: operation.access_key().to_string(),
            found: found.to_string(),
        });
    }
    Ok(())
}
