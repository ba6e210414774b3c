//! Structural checks on signed documents.
use libxml::xpath;
use serde::Serialize;

use super::{
    SignedDocument,
    constants::{DS_NS, ETSI_NS, UANATACA_ISSUER_MARKERS},
    parse_strict,
};
use crate::certificate::KnownIssuer;

const REQUIRED_ELEMENTS: [(&str, &str); 5] = [
    ("ds:SignedInfo", "//ds:Signature/ds:SignedInfo"),
    ("ds:SignatureValue", "//ds:Signature/ds:SignatureValue"),
    ("ds:KeyInfo", "//ds:Signature/ds:KeyInfo"),
    ("etsi:SignedProperties", "//ds:Signature//etsi:SignedProperties"),
    ("ds:X509IssuerName", "//ds:Signature//ds:X509IssuerName"),
];

/// Outcome of [`validate`]; warnings never make a document invalid.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

pub fn validate(document: &SignedDocument) -> ValidationReport {
    validate_xml(document.xml())
}

/// Checks well-formedness, a single `ds:Signature`, the required XAdES-BES
/// elements and the issuer string format.
pub fn validate_xml(xml: &str) -> ValidationReport {
    let mut report = ValidationReport::default();

    let doc = match parse_strict(xml) {
        Ok(doc) => doc,
        Err(message) => {
            report.errors.push(format!("document is not well-formed: {message}"));
            return report;
        }
    };
    let ctx = match xpath::Context::new(&doc) {
        Ok(ctx) => ctx,
        Err(e) => {
            report.errors.push(format!("XPath context error: {e:?}"));
            return report;
        }
    };
    if ctx.register_namespace("ds", DS_NS).is_err() || ctx.register_namespace("etsi", ETSI_NS).is_err() {
        report.errors.push("failed to register signature namespaces".into());
        return report;
    }

    let signatures = match count(&ctx, "//ds:Signature") {
        Ok(n) => n,
        Err(message) => {
            report.errors.push(message);
            return report;
        }
    };
    match signatures {
        0 => {
            report.errors.push("document carries no ds:Signature".into());
            return report;
        }
        1 => {}
        n => report
            .errors
            .push(format!("document carries {n} ds:Signature elements, expected 1")),
    }

    for (label, path) in REQUIRED_ELEMENTS {
        match count(&ctx, path) {
            Ok(0) => report.errors.push(format!("missing required element {label}")),
            Ok(_) => {}
            Err(message) => report.errors.push(message),
        }
    }

    if let Some(issuer) = first_text(&ctx, "//ds:Signature//ds:X509IssuerName") {
        if !is_known_issuer_format(&issuer) {
            report
                .warnings
                .push(format!("issuer name may not match the expected format: {issuer}"));
        }
    }

    report.valid = report.errors.is_empty();
    report
}

fn is_known_issuer_format(issuer: &str) -> bool {
    KnownIssuer::all().any(|known| known.canonical_name() == issuer)
        || UANATACA_ISSUER_MARKERS
            .iter()
            .any(|marker| issuer.contains(marker))
}

fn count(ctx: &xpath::Context, path: &str) -> Result<usize, String> {
    ctx.evaluate(path)
        .map(|result| result.get_nodes_as_vec().len())
        .map_err(|()| format!("XPath evaluation failed for {path}"))
}

fn first_text(ctx: &xpath::Context, path: &str) -> Option<String> {
    ctx.evaluate(path)
        .ok()?
        .get_nodes_as_vec()
        .first()
        .map(|node| node.get_content().trim().to_string())
}
