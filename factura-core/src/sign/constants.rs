pub(crate) const DS_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
pub(crate) const ETSI_NS: &str = "http://uri.etsi.org/01903/v1.3.2#";

/// Namespace declarations inherited from the enclosing `ds:Signature`; digests
/// are taken over fragments carrying them on their opening tag.
pub(crate) const SIGNATURE_XMLNS: &str =
    r#"xmlns:ds="http://www.w3.org/2000/09/xmldsig#" xmlns:etsi="http://uri.etsi.org/01903/v1.3.2#""#;

pub(crate) const XML_DECLARATION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;

pub(crate) const C14N_ALGORITHM: &str = "http://www.w3.org/TR/2001/REC-xml-c14n-20010315";
pub(crate) const RSA_SHA1_ALGORITHM: &str = "http://www.w3.org/2000/09/xmldsig#rsa-sha1";
pub(crate) const SHA1_ALGORITHM: &str = "http://www.w3.org/2000/09/xmldsig#sha1";
pub(crate) const ENVELOPED_SIGNATURE_ALGORITHM: &str =
    "http://www.w3.org/2000/09/xmldsig#enveloped-signature";
pub(crate) const SIGNED_PROPERTIES_TYPE: &str = "http://uri.etsi.org/01903#SignedProperties";

pub(crate) const DATA_OBJECT_DESCRIPTION: &str = "contenido comprobante";
pub(crate) const DATA_OBJECT_MIME_TYPE: &str = "text/xml";

/// Organization identifier markers found in Uanataca issuer strings.
pub(crate) const UANATACA_ISSUER_MARKERS: [&str; 2] =
    ["VATES-A66721499", "#0c0f56415445532d413636373231343939"];
