//! SRI SOAP client for the reception and authorization services.
pub mod parse;

use reqwest::{Client, StatusCode, header::CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::{fmt, future::Future};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    access_key::{AccessKey, AccessKeyError},
    config::Config,
};

const SOAP_CONTENT_TYPE: &str = "text/xml; charset=utf-8";
/// Message identifier the reception service uses for an already registered access key.
pub const DUPLICATE_ACCESS_KEY_ID: &str = "43";

/// Errors returned by the SRI client.
#[derive(Debug, Error)]
pub enum SriError {
    #[error("invalid access key: {0}")]
    InvalidAccessKey(#[from] AccessKeyError),
    #[error("{stage} transport error: {message}")]
    Transport {
        stage: Stage,
        message: String,
        status: Option<u16>,
        body: Option<String>,
    },
    #[error("{stage} response could not be parsed: {message}")]
    Parse {
        stage: Stage,
        message: String,
        raw: String,
    },
    #[error("HTTP client error: {0}")]
    Client(#[source] reqwest::Error),
}

/// Protocol phase a request or failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Reception,
    Authorization,
}

/// Reception outcome reported by the authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceptionStatus {
    /// `RECIBIDA`
    Received,
    /// `DEVUELTA`
    Returned,
    /// SOAP fault instead of a reception answer.
    Fault,
    Other(String),
}

/// Message attached to a reception or authorization answer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorityMessage {
    pub identifier: Option<String>,
    pub message: Option<String>,
    pub additional_info: Option<String>,
    pub message_type: Option<String>,
}

/// Parsed answer of the reception service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionResult {
    status: ReceptionStatus,
    messages: Vec<AuthorityMessage>,
    fault: Option<String>,
    raw_response: String,
}

/// Parsed answer of the authorization service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationResult {
    authorized: bool,
    authorization_number: Option<String>,
    authorization_date: Option<String>,
    environment: Option<String>,
    access_key: Option<String>,
    document_count: u32,
    status: Option<String>,
    messages: Vec<AuthorityMessage>,
    raw_response: String,
}

/// What an [`AuthorizationResult`] means for the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationDecision {
    Authorized { number: String },
    Rejected { status: String },
    Ambiguous(AmbiguousAuthorization),
}

/// The authority answered without settling the document's fate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("authorization is inconclusive: {reason}")]
pub struct AmbiguousAuthorization {
    pub reason: String,
}

/// The remote authority consumed by the operation state machine.
pub trait Authority: Send + Sync + 'static {
    /// Sends a base64 signed document to the reception service.
    fn submit(
        &self,
        document_base64: &str,
    ) -> impl Future<Output = Result<SubmissionResult, SriError>> + Send;

    /// Queries the authorization service for `access_key`.
    fn authorize(
        &self,
        access_key: &AccessKey,
    ) -> impl Future<Output = Result<AuthorizationResult, SriError>> + Send;
}

/// SRI SOAP client.
///
/// # Examples
/// ```rust,no_run
/// use factura_core::api::SriClient;
/// use factura_core::config::Config;
///
/// let client = SriClient::new(Config::default())?;
/// # let _ = client;
/// # Ok::<(), factura_core::api::SriError>(())
/// ```
#[derive(Debug, Clone)]
pub struct SriClient {
    config: Config,
    client: Client,
}

// Public API
impl SriClient {
    /// Create a client applying the configured request timeout.
    ///
    /// # Errors
    /// Returns [`SriError::Client`] if the HTTP client cannot be built.
    pub fn new(config: Config) -> Result<Self, SriError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(SriError::Client)?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Submit a base64 signed document to the reception endpoint.
    ///
    /// HTTP 200 and 500 bodies are both parsed, since SOAP faults arrive as 500.
    ///
    /// # Errors
    /// [`SriError::Transport`] for network failures and unexpected statuses,
    /// [`SriError::Parse`] when the body holds no recognized reception answer.
    pub async fn submit_reception(
        &self,
        document_base64: &str,
        endpoint: &str,
    ) -> Result<SubmissionResult, SriError> {
        debug!(endpoint, payload_len = document_base64.len(), "sending document to reception");
        let envelope = reception_envelope(document_base64);
        let body = self.post(Stage::Reception, endpoint, envelope).await?;
        let result = parse::parse_reception(&body)?;
        info!(status = ?result.status(), messages = result.messages().len(), "reception answered");
        Ok(result)
    }

    /// Query the authorization endpoint for `access_key`.
    ///
    /// The key is validated before any request is sent.
    ///
    /// # Errors
    /// [`SriError::InvalidAccessKey`] for malformed keys, otherwise as
    /// [`SriClient::submit_reception`].
    pub async fn query_authorization(
        &self,
        access_key: &str,
        endpoint: &str,
    ) -> Result<AuthorizationResult, SriError> {
        let access_key = AccessKey::parse(access_key)?;
        debug!(endpoint, access_key = %access_key, "querying authorization");
        let envelope = authorization_envelope(&access_key);
        let body = self.post(Stage::Authorization, endpoint, envelope).await?;
        let result = parse::parse_authorization(&body)?;
        info!(
            access_key = %access_key,
            status = result.status().unwrap_or("-"),
            documents = result.document_count(),
            "authorization answered"
        );
        Ok(result)
    }
}

impl Authority for SriClient {
    async fn submit(&self, document_base64: &str) -> Result<SubmissionResult, SriError> {
        let endpoint = self.config.reception_url();
        self.submit_reception(document_base64, &endpoint).await
    }

    async fn authorize(&self, access_key: &AccessKey) -> Result<AuthorizationResult, SriError> {
        let endpoint = self.config.authorization_url();
        self.query_authorization(access_key.as_str(), &endpoint).await
    }
}

impl SriError {
    pub fn stage(&self) -> Option<Stage> {
        match self {
            SriError::Transport { stage, .. } | SriError::Parse { stage, .. } => Some(*stage),
            SriError::InvalidAccessKey(_) => Some(Stage::Authorization),
            SriError::Client(_) => None,
        }
    }

    /// Raw authority response kept for audit, when one was received.
    pub fn raw_response(&self) -> Option<&str> {
        match self {
            SriError::Transport { body, .. } => body.as_deref(),
            SriError::Parse { raw, .. } => Some(raw),
            _ => None,
        }
    }
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Reception => "reception",
            Stage::Authorization => "authorization",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ReceptionStatus {
    pub fn from_estado(estado: &str) -> Self {
        match estado.trim().to_ascii_uppercase().as_str() {
            "RECIBIDA" => ReceptionStatus::Received,
            "DEVUELTA" => ReceptionStatus::Returned,
            other => ReceptionStatus::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ReceptionStatus::Received => "RECIBIDA",
            ReceptionStatus::Returned => "DEVUELTA",
            ReceptionStatus::Fault => "FAULT",
            ReceptionStatus::Other(value) => value,
        }
    }
}

impl SubmissionResult {
    pub(crate) fn new(
        status: ReceptionStatus,
        messages: Vec<AuthorityMessage>,
        fault: Option<String>,
        raw_response: String,
    ) -> Self {
        Self {
            status,
            messages,
            fault,
            raw_response,
        }
    }

    /// `true` only for `RECIBIDA`.
    pub fn accepted(&self) -> bool {
        self.status == ReceptionStatus::Received
    }

    /// `DEVUELTA` because the access key is already registered with the authority.
    pub fn is_duplicate(&self) -> bool {
        self.status == ReceptionStatus::Returned
            && self
                .messages
                .iter()
                .any(|m| m.identifier.as_deref().map(str::trim) == Some(DUPLICATE_ACCESS_KEY_ID))
    }

    pub fn status(&self) -> &ReceptionStatus {
        &self.status
    }

    pub fn messages(&self) -> &[AuthorityMessage] {
        &self.messages
    }

    /// `faultstring` of a SOAP fault answer.
    pub fn fault(&self) -> Option<&str> {
        self.fault.as_deref()
    }

    pub fn raw_response(&self) -> &str {
        &self.raw_response
    }

    /// One-line summary of the authority messages, for audit causes.
    pub fn summary(&self) -> String {
        if let Some(fault) = &self.fault {
            return format!("SOAP fault: {fault}");
        }
        summarize(self.status.as_str(), &self.messages)
    }
}

impl AuthorizationResult {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        authorized: bool,
        authorization_number: Option<String>,
        authorization_date: Option<String>,
        environment: Option<String>,
        access_key: Option<String>,
        document_count: u32,
        status: Option<String>,
        messages: Vec<AuthorityMessage>,
        raw_response: String,
    ) -> Self {
        Self {
            authorized,
            authorization_number,
            authorization_date,
            environment,
            access_key,
            document_count,
            status,
            messages,
            raw_response,
        }
    }

    pub fn authorized(&self) -> bool {
        self.authorized
    }

    pub fn authorization_number(&self) -> Option<&str> {
        self.authorization_number.as_deref()
    }

    pub fn authorization_date(&self) -> Option<&str> {
        self.authorization_date.as_deref()
    }

    /// Environment label as reported (`PRUEBAS`, `PRODUCCION`).
    pub fn environment(&self) -> Option<&str> {
        self.environment.as_deref()
    }

    /// `claveAccesoConsultada` echoed by the authority.
    pub fn access_key(&self) -> Option<&str> {
        self.access_key.as_deref()
    }

    pub fn document_count(&self) -> u32 {
        self.document_count
    }

    /// `estado` of the first authorization entry.
    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    pub fn messages(&self) -> &[AuthorityMessage] {
        &self.messages
    }

    pub fn raw_response(&self) -> &str {
        &self.raw_response
    }

    pub fn summary(&self) -> String {
        summarize(self.status.as_deref().unwrap_or("SIN ESTADO"), &self.messages)
    }

    /// Authorized needs both the flag and a number; rejection needs an
    /// explicit `NO AUTORIZADO` or `RECHAZADA` status. Anything else is ambiguous.
    pub fn decision(&self) -> AuthorizationDecision {
        if self.authorized {
            if let Some(number) = self.authorization_number.as_deref().filter(|n| !n.trim().is_empty()) {
                return AuthorizationDecision::Authorized {
                    number: number.to_string(),
                };
            }
        }

        let status = self.status.as_deref().map(|s| s.trim().to_ascii_uppercase());
        match status.as_deref() {
            Some(status @ ("NO AUTORIZADO" | "RECHAZADA")) => AuthorizationDecision::Rejected {
                status: status.to_string(),
            },
            Some("AUTORIZADO") => AuthorizationDecision::Ambiguous(AmbiguousAuthorization {
                reason: "authorized without an authorization number".into(),
            }),
            Some(other) => AuthorizationDecision::Ambiguous(AmbiguousAuthorization {
                reason: format!("authorization status {other}"),
            }),
            None if self.document_count == 0 => {
                AuthorizationDecision::Ambiguous(AmbiguousAuthorization {
                    reason: "authority holds no document for this access key yet".into(),
                })
            }
            None => AuthorizationDecision::Ambiguous(AmbiguousAuthorization {
                reason: "authorization entry without status".into(),
            }),
        }
    }
}

impl fmt::Display for AuthorityMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}",
            self.identifier.as_deref().unwrap_or("?"),
            self.message.as_deref().unwrap_or_default()
        )?;
        if let Some(info) = &self.additional_info {
            write!(f, " ({info})")?;
        }
        Ok(())
    }
}

// Private API
impl SriClient {
    async fn post(&self, stage: Stage, endpoint: &str, envelope: String) -> Result<String, SriError> {
        let response = self
            .client
            .post(endpoint)
            .header(CONTENT_TYPE, SOAP_CONTENT_TYPE)
            .body(envelope)
            .send()
            .await
            .map_err(|e| {
                warn!(%stage, error = %e, "request failed");
                SriError::Transport {
                    stage,
                    message: e.to_string(),
                    status: None,
                    body: None,
                }
            })?;
        let status = response.status();
        let body = response.text().await.map_err(|e| SriError::Transport {
            stage,
            message: format!("failed to read response body: {e}"),
            status: Some(status.as_u16()),
            body: None,
        })?;
        debug!(%stage, status = status.as_u16(), body_len = body.len(), "authority responded");

        // SOAP faults arrive as 500 with a parseable envelope.
        if status == StatusCode::OK || status == StatusCode::INTERNAL_SERVER_ERROR {
            return Ok(body);
        }
        warn!(%stage, status = status.as_u16(), "unexpected HTTP status");
        Err(SriError::Transport {
            stage,
            message: format!("unexpected HTTP status {status}"),
            status: Some(status.as_u16()),
            body: Some(body),
        })
    }
}

fn reception_envelope(document_base64: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" xmlns:ec="http://ec.gob.sri.ws.recepcion">
  <soapenv:Header/>
  <soapenv:Body>
    <ec:validarComprobante>
      <xml>{document_base64}</xml>
    </ec:validarComprobante>
  </soapenv:Body>
</soapenv:Envelope>"#
    )
}

fn authorization_envelope(access_key: &AccessKey) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" xmlns:ec="http://ec.gob.sri.ws.autorizacion">
  <soapenv:Header/>
  <soapenv:Body>
    <ec:autorizacionComprobante>
      <claveAccesoComprobante>{access_key}</claveAccesoComprobante>
    </ec:autorizacionComprobante>
  </soapenv:Body>
</soapenv:Envelope>"#
    )
}

fn summarize(status: &str, messages: &[AuthorityMessage]) -> String {
    if messages.is_empty() {
        return status.to_string();
    }
    let joined = messages
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");
    format!("{status}: {joined}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::POST, MockServer};
    use std::sync::{Mutex, OnceLock};

    const KEY: &str = "0605202501120603993300110010010000000600608364218";
    const RECEIVED: &str = include_str!("../tests/fixtures/soap/reception_received.xml");
    const FAULT: &str = include_str!("../tests/fixtures/soap/reception_fault.xml");
    const AUTHORIZED: &str = include_str!("../tests/fixtures/soap/authorization_authorized.xml");

    fn base_url_lock() -> &'static Mutex<()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
    }

    struct BaseUrlGuard {
        _lock: std::sync::MutexGuard<'static, ()>,
        previous: Option<String>,
    }

    impl BaseUrlGuard {
        fn new(url: &str) -> Self {
            let lock = base_url_lock().lock().unwrap_or_else(|e| e.into_inner());
            let previous = std::env::var(crate::config::BASE_URL_ENV).ok();
            unsafe {
                std::env::set_var(crate::config::BASE_URL_ENV, url);
            }
            Self {
                _lock: lock,
                previous,
            }
        }
    }

    impl Drop for BaseUrlGuard {
        fn drop(&mut self) {
            match self.previous.as_ref() {
                Some(value) => unsafe {
                    std::env::set_var(crate::config::BASE_URL_ENV, value);
                },
                None => unsafe {
                    std::env::remove_var(crate::config::BASE_URL_ENV);
                },
            }
        }
    }

    fn result(authorized: bool, number: Option<&str>, status: Option<&str>, count: u32) -> AuthorizationResult {
        AuthorizationResult::new(
            authorized,
            number.map(str::to_string),
            None,
            None,
            Some(KEY.into()),
            count,
            status.map(str::to_string),
            Vec::new(),
            String::new(),
        )
    }

    #[test]
    fn envelopes_match_service_contract() {
        let reception = reception_envelope("PGZhY3R1cmEvPg==");
        assert!(reception.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<soapenv:Envelope"));
        assert!(reception.contains(r#"xmlns:ec="http://ec.gob.sri.ws.recepcion""#));
        assert!(reception.contains("<ec:validarComprobante>\n      <xml>PGZhY3R1cmEvPg==</xml>"));

        let key = AccessKey::parse(KEY).expect("key");
        let authorization = authorization_envelope(&key);
        assert!(authorization.contains(r#"xmlns:ec="http://ec.gob.sri.ws.autorizacion""#));
        assert!(authorization.contains(&format!(
            "<claveAccesoComprobante>{KEY}</claveAccesoComprobante>"
        )));
    }

    #[test]
    fn decision_requires_flag_and_number() {
        assert_eq!(
            result(true, Some("123"), Some("AUTORIZADO"), 1).decision(),
            AuthorizationDecision::Authorized {
                number: "123".into()
            }
        );
        assert!(matches!(
            result(true, None, Some("AUTORIZADO"), 1).decision(),
            AuthorizationDecision::Ambiguous(_)
        ));
        assert_eq!(
            result(false, None, Some("NO AUTORIZADO"), 1).decision(),
            AuthorizationDecision::Rejected {
                status: "NO AUTORIZADO".into()
            }
        );
        assert!(matches!(
            result(false, None, Some("EN PROCESO"), 1).decision(),
            AuthorizationDecision::Ambiguous(_)
        ));
        assert!(matches!(
            result(false, None, None, 0).decision(),
            AuthorizationDecision::Ambiguous(_)
        ));
    }

    #[test]
    fn duplicate_detection_needs_identifier_43() {
        let duplicate = SubmissionResult::new(
            ReceptionStatus::Returned,
            vec![AuthorityMessage {
                identifier: Some("43".into()),
                message: Some("CLAVE ACCESO REGISTRADA".into()),
                ..AuthorityMessage::default()
            }],
            None,
            String::new(),
        );
        assert!(duplicate.is_duplicate());
        assert!(!duplicate.accepted());
        assert_eq!(duplicate.summary(), "DEVUELTA: [43] CLAVE ACCESO REGISTRADA");

        let returned = SubmissionResult::new(ReceptionStatus::Returned, Vec::new(), None, String::new());
        assert!(!returned.is_duplicate());
    }

    #[test]
    fn submit_reception_parses_ok_and_fault_statuses() {
        let server = MockServer::start();
        let ok_mock = server.mock(|when, then| {
            when.method(POST)
                .path("/ok/RecepcionComprobantesOffline")
                .header("content-type", SOAP_CONTENT_TYPE)
                .body_contains("<ec:validarComprobante>")
                .body_contains("<xml>PGZhY3R1cmEvPg==</xml>");
            then.status(200).header("content-type", "text/xml").body(RECEIVED);
        });
        let fault_mock = server.mock(|when, then| {
            when.method(POST).path("/fault/RecepcionComprobantesOffline");
            then.status(500).header("content-type", "text/xml").body(FAULT);
        });

        let rt = tokio::runtime::Runtime::new().expect("runtime");
        rt.block_on(async {
            let client = SriClient::new(Config::default()).expect("client");
            let received = client
                .submit_reception("PGZhY3R1cmEvPg==", &server.url("/ok/RecepcionComprobantesOffline"))
                .await
                .expect("received");
            assert!(received.accepted());

            let fault = client
                .submit_reception("PGZhY3R1cmEvPg==", &server.url("/fault/RecepcionComprobantesOffline"))
                .await
                .expect("fault is parsed");
            assert_eq!(fault.status(), &ReceptionStatus::Fault);
            assert!(fault.fault().unwrap_or_default().contains("Unmarshalling Error"));
        });
        ok_mock.assert();
        fault_mock.assert();
    }

    #[test]
    fn unexpected_status_is_transport_error() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/RecepcionComprobantesOffline");
            then.status(404).body("not here");
        });

        let rt = tokio::runtime::Runtime::new().expect("runtime");
        rt.block_on(async {
            let client = SriClient::new(Config::default()).expect("client");
            let err = client
                .submit_reception("AA==", &server.url("/RecepcionComprobantesOffline"))
                .await
                .expect_err("404 must fail");
            match err {
                SriError::Transport {
                    stage, status, body, ..
                } => {
                    assert_eq!(stage, Stage::Reception);
                    assert_eq!(status, Some(404));
                    assert_eq!(body.as_deref(), Some("not here"));
                }
                other => panic!("unexpected error {other:?}"),
            }
        });
        mock.assert();
    }

    #[test]
    fn other_success_statuses_are_transport_errors() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/RecepcionComprobantesOffline");
            then.status(202).header("content-type", "text/xml").body(RECEIVED);
        });

        let rt = tokio::runtime::Runtime::new().expect("runtime");
        rt.block_on(async {
            let client = SriClient::new(Config::default()).expect("client");
            let err = client
                .submit_reception("AA==", &server.url("/RecepcionComprobantesOffline"))
                .await
                .expect_err("202 must fail");
            assert!(matches!(
                err,
                SriError::Transport {
                    stage: Stage::Reception,
                    status: Some(202),
                    ..
                }
            ));
        });
        mock.assert();
    }

    #[test]
    fn malformed_access_key_never_reaches_network() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST);
            then.status(200).body(AUTHORIZED);
        });

        let rt = tokio::runtime::Runtime::new().expect("runtime");
        rt.block_on(async {
            let client = SriClient::new(Config::default()).expect("client");
            let endpoint = server.url("/AutorizacionComprobantesOffline");
            for key in [&KEY[..48], &format!("{KEY}1")[..]] {
                let err = client
                    .query_authorization(key, &endpoint)
                    .await
                    .expect_err("invalid key");
                assert!(matches!(err, SriError::InvalidAccessKey(AccessKeyError::Length(_))));
            }
        });
        mock.assert_hits(0);
    }

    #[test]
    fn authority_trait_uses_base_url_override() {
        let server = MockServer::start();
        let _guard = BaseUrlGuard::new(&server.base_url());
        let reception_mock = server.mock(|when, then| {
            when.method(POST).path("/RecepcionComprobantesOffline");
            then.status(200).body(RECEIVED);
        });
        let authorization_mock = server.mock(|when, then| {
            when.method(POST)
                .path("/AutorizacionComprobantesOffline")
                .body_contains(KEY);
            then.status(200).body(AUTHORIZED);
        });

        let rt = tokio::runtime::Runtime::new().expect("runtime");
        rt.block_on(async {
            let client = SriClient::new(Config::default()).expect("client");
            let submitted = client.submit("AA==").await.expect("submit");
            assert!(submitted.accepted());
            let key = AccessKey::parse(KEY).expect("key");
            let authorization = client.authorize(&key).await.expect("authorize");
            assert!(matches!(
                authorization.decision(),
                AuthorizationDecision::Authorized { .. }
            ));
        });
        reception_mock.assert();
        authorization_mock.assert();
    }
}
