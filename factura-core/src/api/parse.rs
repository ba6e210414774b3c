//! Response parsing for the reception and authorization services.
//!
//! Namespace prefixes vary between service versions, so every lookup matches on
//! `local-name()`. Each service has a closed set of recognized answer shapes,
//! tried in priority order.
use libxml::{
    parser::Parser,
    tree::{Document, Node},
};
use tracing::debug;

use super::{
    AuthorityMessage, AuthorizationResult, ReceptionStatus, SriError, Stage, SubmissionResult,
};

/// Recognized reception answers, highest priority first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceptionShape {
    ValidarComprobanteResponse,
    RecepcionComprobanteResponse,
    RespuestaRecepcionComprobante,
    Fault,
}

/// Recognized authorization answers, highest priority first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationShape {
    AutorizacionComprobanteResponse,
    RespuestaAutorizacionComprobante,
    LegacyRespuestaAutorizacionComprobante,
}

impl ReceptionShape {
    const PRIORITY: [ReceptionShape; 4] = [
        ReceptionShape::ValidarComprobanteResponse,
        ReceptionShape::RecepcionComprobanteResponse,
        ReceptionShape::RespuestaRecepcionComprobante,
        ReceptionShape::Fault,
    ];

    fn xpath(&self) -> &'static str {
        match self {
            ReceptionShape::ValidarComprobanteResponse => {
                "//*[local-name()='validarComprobanteResponse']"
            }
            ReceptionShape::RecepcionComprobanteResponse => {
                "//*[local-name()='recepcionComprobanteResponse']"
            }
            ReceptionShape::RespuestaRecepcionComprobante => {
                "//*[local-name()='RespuestaRecepcionComprobante']"
            }
            ReceptionShape::Fault => "//*[local-name()='Fault']",
        }
    }
}

impl AuthorizationShape {
    const PRIORITY: [AuthorizationShape; 3] = [
        AuthorizationShape::AutorizacionComprobanteResponse,
        AuthorizationShape::RespuestaAutorizacionComprobante,
        AuthorizationShape::LegacyRespuestaAutorizacionComprobante,
    ];

    fn xpath(&self) -> &'static str {
        match self {
            AuthorizationShape::AutorizacionComprobanteResponse => {
                "//*[local-name()='autorizacionComprobanteResponse']/*[local-name()='RespuestaAutorizacionComprobante']"
            }
            AuthorizationShape::RespuestaAutorizacionComprobante => {
                "//*[local-name()='RespuestaAutorizacionComprobante']"
            }
            AuthorizationShape::LegacyRespuestaAutorizacionComprobante => {
                "//*[local-name()='respuestaAutorizacionComprobante']"
            }
        }
    }
}

/// Parses a reception service body into a [`SubmissionResult`].
///
/// # Errors
/// [`SriError::Parse`] when the body is not XML, holds none of the
/// [`ReceptionShape`]s, or a reception answer lacks its `estado`.
pub fn parse_reception(raw: &str) -> Result<SubmissionResult, SriError> {
    let doc = parse_document(Stage::Reception, raw)?;
    let (shape, node) = ReceptionShape::PRIORITY
        .iter()
        .find_map(|shape| first_node(&doc, shape.xpath()).map(|node| (*shape, node)))
        .ok_or_else(|| parse_error(Stage::Reception, "no recognized reception answer", raw))?;
    debug!(?shape, "reception answer shape");

    if shape == ReceptionShape::Fault {
        let fault = child_text(&node, "faultstring")
            .or_else(|| descendant_text(&node, "Text"))
            .unwrap_or_else(|| node.get_content().trim().to_string());
        return Ok(SubmissionResult::new(
            ReceptionStatus::Fault,
            Vec::new(),
            Some(fault),
            raw.to_string(),
        ));
    }

    let answer = match shape {
        ReceptionShape::RespuestaRecepcionComprobante => node,
        _ => first_descendant(&node, "RespuestaRecepcionComprobante").unwrap_or(node),
    };
    let estado = descendant_text(&answer, "estado")
        .ok_or_else(|| parse_error(Stage::Reception, "reception answer without estado", raw))?;

    Ok(SubmissionResult::new(
        ReceptionStatus::from_estado(&estado),
        messages(&answer),
        None,
        raw.to_string(),
    ))
}

/// Parses an authorization service body into an [`AuthorizationResult`].
///
/// When several `autorizacion` entries are present the first one wins.
///
/// # Errors
/// [`SriError::Parse`] when the body is not XML or holds none of the
/// [`AuthorizationShape`]s.
pub fn parse_authorization(raw: &str) -> Result<AuthorizationResult, SriError> {
    let doc = parse_document(Stage::Authorization, raw)?;
    let (shape, answer) = AuthorizationShape::PRIORITY
        .iter()
        .find_map(|shape| first_node(&doc, shape.xpath()).map(|node| (*shape, node)))
        .ok_or_else(|| {
            let message = match first_node(&doc, "//*[local-name()='Fault']")
                .and_then(|fault| child_text(&fault, "faultstring"))
            {
                Some(fault) => format!("SOAP fault: {fault}"),
                None => "no recognized authorization answer".to_string(),
            };
            parse_error(Stage::Authorization, &message, raw)
        })?;
    debug!(?shape, "authorization answer shape");

    let access_key = child_text(&answer, "claveAccesoConsultada");
    let document_count = child_text(&answer, "numeroComprobantes")
        .and_then(|count| count.parse::<u32>().ok())
        .unwrap_or(0);

    let entry = find_nodes(
        &answer,
        "./*[local-name()='autorizaciones']/*[local-name()='autorizacion']",
    )
    .into_iter()
    .next();

    let result = match entry {
        Some(entry) => {
            let status = child_text(&entry, "estado");
            AuthorizationResult::new(
                status.as_deref() == Some("AUTORIZADO"),
                child_text(&entry, "numeroAutorizacion"),
                child_text(&entry, "fechaAutorizacion"),
                child_text(&entry, "ambiente"),
                access_key,
                document_count,
                status,
                messages(&entry),
                raw.to_string(),
            )
        }
        None => AuthorizationResult::new(
            false,
            None,
            None,
            None,
            access_key,
            document_count,
            None,
            Vec::new(),
            raw.to_string(),
        ),
    };
    Ok(result)
}

fn parse_document(stage: Stage, raw: &str) -> Result<Document, SriError> {
    if raw.trim().is_empty() {
        return Err(parse_error(stage, "empty response body", raw));
    }
    Parser::default()
        .parse_string(raw)
        .map_err(|e| parse_error(stage, &format!("XML parse error: {e:?}"), raw))
}

fn parse_error(stage: Stage, message: &str, raw: &str) -> SriError {
    SriError::Parse {
        stage,
        message: message.to_string(),
        raw: raw.to_string(),
    }
}

fn first_node(doc: &Document, xpath: &str) -> Option<Node> {
    let root = doc.get_root_element()?;
    find_nodes(&root, xpath).into_iter().next()
}

fn find_nodes(node: &Node, xpath: &str) -> Vec<Node> {
    node.findnodes(xpath).unwrap_or_default()
}

fn first_descendant(node: &Node, name: &str) -> Option<Node> {
    find_nodes(node, &format!(".//*[local-name()='{name}']"))
        .into_iter()
        .next()
}

fn non_empty(node: &Node) -> Option<String> {
    let value = node.get_content().trim().to_string();
    (!value.is_empty()).then_some(value)
}

fn child_text(node: &Node, name: &str) -> Option<String> {
    find_nodes(node, &format!("./*[local-name()='{name}']"))
        .first()
        .and_then(non_empty)
}

fn descendant_text(node: &Node, name: &str) -> Option<String> {
    first_descendant(node, name).as_ref().and_then(non_empty)
}

/// `mensaje` entries carrying an `identificador`; the text child shares the name.
fn messages(node: &Node) -> Vec<AuthorityMessage> {
    find_nodes(
        node,
        ".//*[local-name()='mensaje'][*[local-name()='identificador']]",
    )
    .iter()
    .map(|message| AuthorityMessage {
        identifier: child_text(message, "identificador"),
        message: child_text(message, "mensaje"),
        additional_info: child_text(message, "informacionAdicional"),
        message_type: child_text(message, "tipo"),
    })
    .collect()
}
