//! Enveloped XAdES-BES signing of authority documents.
pub(crate) mod constants;
pub mod primitives;
pub mod validation;

use base64ct::{Base64, Encoding};
use chrono::{DateTime, Utc};
use libxml::{
    parser::{Parser, ParserOptions},
    tree::Document,
};
use quick_xml::escape::{escape, partial_escape};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, info};

use crate::certificate::SigningCertificate;
use constants::{
    C14N_ALGORITHM, DATA_OBJECT_DESCRIPTION, DATA_OBJECT_MIME_TYPE, ENVELOPED_SIGNATURE_ALGORITHM,
    RSA_SHA1_ALGORITHM, SHA1_ALGORITHM, SIGNATURE_XMLNS, SIGNED_PROPERTIES_TYPE, XML_DECLARATION,
};
use primitives::{BASE64_LINE_WIDTH, rsa_sha1_sign, sha1_base64, wrap_base64};

pub use validation::{ValidationReport, validate, validate_xml};

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("malformed document: {0}")]
    MalformedDocument(String),
    #[error("signing failed at {stage}: {message}")]
    Signing {
        stage: &'static str,
        message: String,
    },
}

impl SigningError {
    pub(crate) fn signing(stage: &'static str, message: impl Into<String>) -> Self {
        SigningError::Signing {
            stage,
            message: message.into(),
        }
    }
}

/// XML text to be signed. The root element must carry an `id` attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedDocument {
    xml: String,
}

/// Numeric suffixes for the ids inside one signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureIds {
    pub signature: u32,
    pub certificate: u32,
    pub signed_properties: u32,
    pub signed_info: u32,
    pub signed_properties_ref: u32,
    pub reference: u32,
    pub signature_value: u32,
    pub object: u32,
}

/// Rendered parts of one signature, built once per call and consumed by injection.
#[derive(Debug, Clone)]
pub(crate) struct SignatureBlock {
    ids: SignatureIds,
    signed_properties: String,
    key_info: String,
    signed_info: String,
    signature_value: String,
    payload_digest: String,
}

/// Normalized document with exactly one enveloped signature appended to its root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedDocument {
    xml: String,
    payload_digest: String,
    signature_id: String,
    signing_time: DateTime<Utc>,
}

/// Signs `document` with `certificate`.
///
/// The document is normalized to a single line, the three reference digests
/// are computed over the exact fragments written into the output, and the
/// signature is inserted right before the root's closing tag.
///
/// # Errors
/// [`SigningError::MalformedDocument`] when the input is not well-formed, has
/// no root `id`, or is already signed; [`SigningError::Signing`] when a
/// cryptographic step fails.
pub fn sign(
    document: &UnsignedDocument,
    certificate: &SigningCertificate,
) -> Result<SignedDocument, SigningError> {
    let ids = SignatureIds::generate(&mut rand::thread_rng());
    sign_with(document, certificate, ids, Utc::now())
}

/// [`sign`] with caller-provided ids and signing time.
pub fn sign_with(
    document: &UnsignedDocument,
    certificate: &SigningCertificate,
    ids: SignatureIds,
    signing_time: DateTime<Utc>,
) -> Result<SignedDocument, SigningError> {
    let normalized = normalize(document.as_str());
    let root_id = signable_root_id(&normalized)?;
    let closing_tag_at = root_closing_tag_start(&normalized)?;

    let block = SignatureBlock::build(&normalized, &root_id, certificate, ids, signing_time)?;
    let signature = block.render();

    let mut xml = String::with_capacity(normalized.len() + signature.len());
    xml.push_str(&normalized[..closing_tag_at]);
    xml.push_str(&signature);
    xml.push_str(&normalized[closing_tag_at..]);

    info!(
        root_id = %root_id,
        signature_id = %block.signature_id(),
        "document signed"
    );
    debug!(
        input_len = normalized.len(),
        output_len = xml.len(),
        "signature injected"
    );
    Ok(SignedDocument {
        xml,
        payload_digest: block.payload_digest,
        signature_id: format!("Signature{}", ids.signature),
        signing_time,
    })
}

/// Base64 of the UTF-8 document, as sent to the reception service.
pub fn transport_base64(xml: &str) -> String {
    Base64::encode_string(xml.as_bytes())
}

// Public API
impl UnsignedDocument {
    pub fn new(xml: impl Into<String>) -> Self {
        Self { xml: xml.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.xml
    }

    /// The single-line form that is digested and signed.
    pub fn normalized(&self) -> String {
        normalize(&self.xml)
    }

    /// Text of the first `claveAcceso` element, if the document carries one.
    pub fn access_key(&self) -> Option<&str> {
        let start = self.xml.find("<claveAcceso>")? + "<claveAcceso>".len();
        let len = self.xml[start..].find("</claveAcceso>")?;
        Some(self.xml[start..start + len].trim())
    }
}

impl From<String> for UnsignedDocument {
    fn from(xml: String) -> Self {
        Self::new(xml)
    }
}

impl SignatureIds {
    const MIN: u32 = 990;
    const MAX: u32 = 999_990;

    /// Draws eight distinct ids uniformly from `990..999990`.
    pub fn generate<R: Rng>(rng: &mut R) -> Self {
        let mut seen = HashSet::with_capacity(8);
        let mut next = || loop {
            let value = rng.gen_range(Self::MIN..Self::MAX);
            if seen.insert(value) {
                break value;
            }
        };
        Self {
            signature: next(),
            certificate: next(),
            signed_properties: next(),
            signed_info: next(),
            signed_properties_ref: next(),
            reference: next(),
            signature_value: next(),
            object: next(),
        }
    }

    pub fn as_array(&self) -> [u32; 8] {
        [
            self.signature,
            self.certificate,
            self.signed_properties,
            self.signed_info,
            self.signed_properties_ref,
            self.reference,
            self.signature_value,
            self.object,
        ]
    }
}

impl SignatureBlock {
    /// Builds every fragment and digest for `normalized`, signing SignedInfo last.
    pub(crate) fn build(
        normalized: &str,
        root_id: &str,
        certificate: &SigningCertificate,
        ids: SignatureIds,
        signing_time: DateTime<Utc>,
    ) -> Result<Self, SigningError> {
        let signed_properties = signed_properties_fragment(&ids, certificate, &signing_time);
        let key_info = key_info_fragment(&ids, certificate);

        let payload_digest = sha1_base64(normalized.as_bytes());
        let signed_properties_digest =
            sha1_base64(with_namespaces(&signed_properties, "etsi:SignedProperties").as_bytes());
        let key_info_digest = sha1_base64(with_namespaces(&key_info, "ds:KeyInfo").as_bytes());

        let signed_info = signed_info_fragment(
            &ids,
            root_id,
            &payload_digest,
            &signed_properties_digest,
            &key_info_digest,
        );
        let signature_value = rsa_sha1_sign(
            with_namespaces(&signed_info, "ds:SignedInfo").as_bytes(),
            certificate.private_key(),
        )?;

        Ok(Self {
            ids,
            signed_properties,
            key_info,
            signed_info,
            signature_value,
            payload_digest,
        })
    }

    pub(crate) fn signature_id(&self) -> String {
        format!("Signature{}", self.ids.signature)
    }

    /// The complete `ds:Signature` element.
    pub(crate) fn render(&self) -> String {
        let ids = &self.ids;
        format!(
            concat!(
                r#"<ds:Signature {xmlns} Id="Signature{sig}">"#,
                "{signed_info}",
                r#"<ds:SignatureValue Id="SignatureValue{value_id}">{value}</ds:SignatureValue>"#,
                "{key_info}",
                r#"<ds:Object Id="Signature{sig}-Object{object}">"#,
                r##"<etsi:QualifyingProperties Target="#Signature{sig}">"##,
                "{signed_properties}",
                "</etsi:QualifyingProperties>",
                "</ds:Object>",
                "</ds:Signature>"
            ),
            xmlns = SIGNATURE_XMLNS,
            sig = ids.signature,
            signed_info = self.signed_info,
            value_id = ids.signature_value,
            value = self.signature_value,
            key_info = self.key_info,
            object = ids.object,
            signed_properties = self.signed_properties,
        )
    }
}

impl SignedDocument {
    pub fn xml(&self) -> &str {
        &self.xml
    }

    pub fn into_xml(self) -> String {
        self.xml
    }

    /// SHA1 (base64) of the normalized document referenced by the payload Reference.
    pub fn payload_digest(&self) -> &str {
        &self.payload_digest
    }

    pub fn signature_id(&self) -> &str {
        &self.signature_id
    }

    pub fn signing_time(&self) -> DateTime<Utc> {
        self.signing_time
    }

    pub fn to_base64(&self) -> String {
        transport_base64(&self.xml)
    }
}

// Private API
/// Drops any XML declaration, trims, removes whitespace between tags and
/// prepends the fixed UTF-8 declaration.
pub(crate) fn normalize(xml: &str) -> String {
    let without_declaration = strip_declaration(xml);
    let trimmed = without_declaration.trim();

    let mut out = String::with_capacity(XML_DECLARATION.len() + trimmed.len());
    out.push_str(XML_DECLARATION);
    let mut pending = String::new();
    let mut after_tag = false;
    for ch in trimmed.chars() {
        if after_tag && ch.is_whitespace() {
            pending.push(ch);
            continue;
        }
        if !pending.is_empty() {
            if ch != '<' {
                out.push_str(&pending);
            }
            pending.clear();
        }
        out.push(ch);
        after_tag = ch == '>';
    }
    out.push_str(&pending);
    out
}

fn strip_declaration(xml: &str) -> String {
    if let Some(start) = xml.find("<?xml") {
        if let Some(gt) = xml[start..].find('>') {
            let end = start + gt;
            if xml[..end].ends_with('?') {
                return format!("{}{}", &xml[..start], &xml[end + 1..]);
            }
        }
    }
    xml.to_string()
}

pub(crate) fn parse_strict(xml: &str) -> Result<Document, String> {
    let options = ParserOptions {
        recover: false,
        ..ParserOptions::default()
    };
    Parser::default()
        .parse_string_with_options(xml, options)
        .map_err(|e| format!("XML parse error: {e:?}"))
}

fn signable_root_id(normalized: &str) -> Result<String, SigningError> {
    let doc = parse_strict(normalized).map_err(SigningError::MalformedDocument)?;
    let root = doc
        .get_root_element()
        .ok_or_else(|| SigningError::MalformedDocument("missing root element".into()))?;
    if normalized.contains("<ds:Signature ") {
        return Err(SigningError::MalformedDocument(
            "document already carries a signature".into(),
        ));
    }
    root.get_attribute("id")
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| {
            SigningError::MalformedDocument(format!(
                "root element <{}> has no id attribute",
                root.get_name()
            ))
        })
}

/// Byte offset of the root's closing tag, which must end the document.
fn root_closing_tag_start(normalized: &str) -> Result<usize, SigningError> {
    let missing = || SigningError::MalformedDocument("no closing tag for the root element".into());
    if !normalized.ends_with('>') {
        return Err(missing());
    }
    let start = normalized.rfind("</").ok_or_else(missing)?;
    let name = &normalized[start + 2..normalized.len() - 1];
    let valid_name = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '_' | ':' | '-' | '.'));
    if !valid_name {
        return Err(missing());
    }
    Ok(start)
}

fn with_namespaces(fragment: &str, tag: &str) -> String {
    let open = format!("<{tag}");
    match fragment.strip_prefix(&open) {
        Some(rest) => format!("{open} {SIGNATURE_XMLNS}{rest}"),
        None => fragment.to_string(),
    }
}

fn format_signing_time(time: &DateTime<Utc>) -> String {
    time.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

fn signed_properties_fragment(
    ids: &SignatureIds,
    certificate: &SigningCertificate,
    signing_time: &DateTime<Utc>,
) -> String {
    format!(
        concat!(
            r#"<etsi:SignedProperties Id="Signature{sig}-SignedProperties{props}">"#,
            "<etsi:SignedSignatureProperties>",
            "<etsi:SigningTime>{time}</etsi:SigningTime>",
            "<etsi:SigningCertificate>",
            "<etsi:Cert>",
            "<etsi:CertDigest>",
            r#"<ds:DigestMethod Algorithm="{sha1}"></ds:DigestMethod>"#,
            "<ds:DigestValue>{cert_digest}</ds:DigestValue>",
            "</etsi:CertDigest>",
            "<etsi:IssuerSerial>",
            "<ds:X509IssuerName>{issuer}</ds:X509IssuerName>",
            "<ds:X509SerialNumber>{serial}</ds:X509SerialNumber>",
            "</etsi:IssuerSerial>",
            "</etsi:Cert>",
            "</etsi:SigningCertificate>",
            "</etsi:SignedSignatureProperties>",
            "<etsi:SignedDataObjectProperties>",
            r##"<etsi:DataObjectFormat ObjectReference="#Reference-ID-{reference}">"##,
            "<etsi:Description>{description}</etsi:Description>",
            "<etsi:MimeType>{mime}</etsi:MimeType>",
            "</etsi:DataObjectFormat>",
            "</etsi:SignedDataObjectProperties>",
            "</etsi:SignedProperties>"
        ),
        sig = ids.signature,
        props = ids.signed_properties,
        time = format_signing_time(signing_time),
        sha1 = SHA1_ALGORITHM,
        cert_digest = certificate.certificate_digest(),
        issuer = partial_escape(certificate.issuer_name()),
        serial = partial_escape(certificate.serial_number()),
        reference = ids.reference,
        description = DATA_OBJECT_DESCRIPTION,
        mime = DATA_OBJECT_MIME_TYPE,
    )
}

fn key_info_fragment(ids: &SignatureIds, certificate: &SigningCertificate) -> String {
    format!(
        concat!(
            r#"<ds:KeyInfo Id="Certificate{cert}">"#,
            "<ds:X509Data>",
            "<ds:X509Certificate>{x509}</ds:X509Certificate>",
            "</ds:X509Data>",
            "<ds:KeyValue>",
            "<ds:RSAKeyValue>",
            "<ds:Modulus>{modulus}</ds:Modulus>",
            "<ds:Exponent>{exponent}</ds:Exponent>",
            "</ds:RSAKeyValue>",
            "</ds:KeyValue>",
            "</ds:KeyInfo>"
        ),
        cert = ids.certificate,
        x509 = wrap_base64(&certificate.certificate_base64(), BASE64_LINE_WIDTH),
        modulus = wrap_base64(certificate.modulus(), BASE64_LINE_WIDTH),
        exponent = certificate.exponent(),
    )
}

fn signed_info_fragment(
    ids: &SignatureIds,
    root_id: &str,
    payload_digest: &str,
    signed_properties_digest: &str,
    key_info_digest: &str,
) -> String {
    format!(
        concat!(
            r#"<ds:SignedInfo Id="Signature-SignedInfo{info}">"#,
            r#"<ds:CanonicalizationMethod Algorithm="{c14n}"></ds:CanonicalizationMethod>"#,
            r#"<ds:SignatureMethod Algorithm="{rsa_sha1}"></ds:SignatureMethod>"#,
            r##"<ds:Reference Id="SignedPropertiesID{props_ref}" Type="{props_type}" URI="#Signature{sig}-SignedProperties{props}">"##,
            r#"<ds:DigestMethod Algorithm="{sha1}"></ds:DigestMethod>"#,
            "<ds:DigestValue>{props_digest}</ds:DigestValue>",
            "</ds:Reference>",
            r##"<ds:Reference URI="#Certificate{cert}">"##,
            r#"<ds:DigestMethod Algorithm="{sha1}"></ds:DigestMethod>"#,
            "<ds:DigestValue>{key_info_digest}</ds:DigestValue>",
            "</ds:Reference>",
            r##"<ds:Reference Id="Reference-ID-{reference}" URI="#{root_id}">"##,
            "<ds:Transforms>",
            r#"<ds:Transform Algorithm="{enveloped}"></ds:Transform>"#,
            "</ds:Transforms>",
            r#"<ds:DigestMethod Algorithm="{sha1}"></ds:DigestMethod>"#,
            "<ds:DigestValue>{payload_digest}</ds:DigestValue>",
            "</ds:Reference>",
            "</ds:SignedInfo>"
        ),
        info = ids.signed_info,
        c14n = C14N_ALGORITHM,
        rsa_sha1 = RSA_SHA1_ALGORITHM,
        props_ref = ids.signed_properties_ref,
        props_type = SIGNED_PROPERTIES_TYPE,
        sig = ids.signature,
        props = ids.signed_properties,
        sha1 = SHA1_ALGORITHM,
        props_digest = signed_properties_digest,
        cert = ids.certificate,
        key_info_digest = key_info_digest,
        reference = ids.reference,
        root_id = escape(root_id),
        enveloped = ENVELOPED_SIGNATURE_ALGORITHM,
        payload_digest = payload_digest,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{SeedableRng, rngs::StdRng};

    #[test]
    fn normalize_collapses_inter_tag_whitespace() {
        let xml = "<?xml version=\"1.0\" encoding=\"ISO-8859-1\"?>\n<factura id=\"comprobante\">\n  <a> text  here </a>\n\t<b/>\n</factura>\n";
        assert_eq!(
            normalize(xml),
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?><factura id=\"comprobante\"><a> text  here </a><b/></factura>"
        );
    }

    #[test]
    fn normalize_is_idempotent() {
        let once = normalize("<r id=\"x\">\n <c>1</c>\n</r>");
        assert_eq!(normalize(&once), once);
    }

    #[test]
    fn ids_are_distinct_and_in_range() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let ids = SignatureIds::generate(&mut rng);
            let values = ids.as_array();
            let unique: HashSet<_> = values.iter().collect();
            assert_eq!(unique.len(), values.len());
            assert!(values.iter().all(|v| (990..999_990).contains(v)));
        }
    }

    #[test]
    fn namespaces_are_added_to_opening_tag_only() {
        let fragment = r#"<ds:KeyInfo Id="Certificate1"><ds:X509Data></ds:X509Data></ds:KeyInfo>"#;
        assert_eq!(
            with_namespaces(fragment, "ds:KeyInfo"),
            format!(
                r#"<ds:KeyInfo {SIGNATURE_XMLNS} Id="Certificate1"><ds:X509Data></ds:X509Data></ds:KeyInfo>"#
            )
        );
    }

    #[test]
    fn access_key_is_read_from_document() {
        let document = UnsignedDocument::new(
            "<factura id=\"comprobante\"><infoTributaria><claveAcceso> 123 </claveAcceso></infoTributaria></factura>",
        );
        assert_eq!(document.access_key(), Some("123"));
        assert_eq!(UnsignedDocument::new("<factura/>").access_key(), None);
    }

    #[test]
    fn closing_tag_is_located_at_document_end() {
        let xml = normalize(r#"<factura id="comprobante"><x/></factura>"#);
        let at = root_closing_tag_start(&xml).expect("closing tag");
        assert_eq!(&xml[at..], "</factura>");
        assert!(root_closing_tag_start("<factura id=\"comprobante\"/>").is_err());
    }

    #[test]
    fn root_without_id_is_malformed() {
        let err = signable_root_id(&normalize("<factura><x/></factura>")).expect_err("no id");
        assert!(matches!(err, SigningError::MalformedDocument(_)));
        let err = signable_root_id(&normalize("<factura id=\"c\"><x></factura>")).expect_err("bad xml");
        assert!(matches!(err, SigningError::MalformedDocument(_)));
    }

    #[test]
    fn signing_time_has_milliseconds() {
        let time = DateTime::parse_from_rfc3339("2025-05-06T10:11:12.345Z")
            .expect("time")
            .with_timezone(&Utc);
        assert_eq!(format_signing_time(&time), "2025-05-06T10:11:12.345Z");
    }
}
