//! Signing certificate extraction from PKCS#12 containers.
use base64ct::{Base64, Encoding};
use der::{
    Decode, Tag, Tagged,
    asn1::{
        Any, BmpString, Ia5StringRef, ObjectIdentifier, PrintableStringRef, TeletexStringRef,
        Utf8StringRef,
    },
};
use openssl::{error::ErrorStack, pkcs12::Pkcs12, pkey::Id};
use rsa::{BigUint, RsaPrivateKey, pkcs8::DecodePrivateKey, traits::PublicKeyParts};
use sha1::{Digest, Sha1};
use std::{fmt, path::PathBuf};
use thiserror::Error;
use tracing::debug;
use x509_cert::{Certificate, name::Name};

const OID_CN: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.3");
const OID_OU: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.11");
const OID_O: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.10");
const OID_L: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.7");
const OID_C: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.6");

// ERR_LIB_PKCS12 / PKCS12_R_MAC_VERIFY_FAILURE from OpenSSL's pkcs12err.h.
const ERR_LIB_PKCS12: i32 = 35;
const PKCS12_R_MAC_VERIFY_FAILURE: i32 = 113;

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("invalid passphrase for PKCS#12 container")]
    InvalidPassphrase,
    #[error("malformed PKCS#12 container: {0}")]
    MalformedContainer(String),
    #[error("failed to read certificate container {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Private key and certificate used for one signing call.
///
/// Holds everything the XAdES builder needs: the RSA key, the DER certificate,
/// the issuer string in the form the authority's validator expects, the decimal
/// serial number, the SHA1 certificate digest and the public key parts.
/// The value is deliberately not `Clone`; load a fresh one per call.
pub struct SigningCertificate {
    key: RsaPrivateKey,
    certificate_der: Vec<u8>,
    issuer_name: String,
    serial_number: String,
    certificate_digest: String,
    modulus: String,
    exponent: String,
}

/// Certificate authorities whose issuer string must match a fixed rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KnownIssuer {
    UanatacaCa2_2016,
    UanatacaCa2_2021,
}

/// Issuer attributes used for lookup and fallback rendering.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IssuerAttributes {
    pub common_name: Option<String>,
    pub organizational_unit: Option<String>,
    pub organization: Option<String>,
    pub locality: Option<String>,
    pub country: Option<String>,
}

/// Provides the certificate for a signing call.
///
/// Each call to [`CertificateSource::load`] yields an instance owned by the
/// caller.
pub trait CertificateSource: Send + Sync {
    fn load(&self) -> Result<SigningCertificate, CertificateError>;
}

/// In-memory PKCS#12 container and passphrase.
#[derive(Clone)]
pub struct Pkcs12Source {
    der: Vec<u8>,
    passphrase: String,
}

/// PKCS#12 container read from disk on every load.
#[derive(Clone)]
pub struct Pkcs12File {
    path: PathBuf,
    passphrase: String,
}

/// Decodes a PKCS#12 container and extracts the signing certificate.
///
/// CA chain certificates bundled in the container are ignored.
pub fn extract(p12: &[u8], passphrase: &str) -> Result<SigningCertificate, CertificateError> {
    let pkcs12 = Pkcs12::from_der(p12)
        .map_err(|e| CertificateError::MalformedContainer(format!("DER decode error: {e}")))?;
    let parsed = pkcs12.parse2(passphrase).map_err(|e| classify_parse_error(&e))?;

    let pkey = parsed
        .pkey
        .ok_or_else(|| CertificateError::MalformedContainer("no private key in container".into()))?;
    let cert = parsed
        .cert
        .ok_or_else(|| CertificateError::MalformedContainer("no certificate in container".into()))?;
    if pkey.id() != Id::RSA {
        return Err(CertificateError::MalformedContainer(format!(
            "unsupported key type {:?}, expected RSA",
            pkey.id()
        )));
    }

    let key_der = pkey
        .private_key_to_pkcs8()
        .map_err(|e| CertificateError::MalformedContainer(format!("key export error: {e}")))?;
    let cert_der = cert
        .to_der()
        .map_err(|e| CertificateError::MalformedContainer(format!("certificate export error: {e}")))?;
    if let Some(ca) = parsed.ca.as_ref() {
        debug!(chain_len = ca.len(), "ignoring CA chain bundled in container");
    }

    SigningCertificate::from_der(&cert_der, &key_der)
}

// Public API
impl SigningCertificate {
    /// Builds a signing certificate from a DER certificate and a PKCS#8 DER RSA key.
    pub fn from_der(cert_der: &[u8], pkcs8_key_der: &[u8]) -> Result<Self, CertificateError> {
        let certificate = Certificate::from_der(cert_der)
            .map_err(|e| CertificateError::MalformedContainer(format!("certificate parse error: {e}")))?;
        let key = RsaPrivateKey::from_pkcs8_der(pkcs8_key_der)
            .map_err(|e| CertificateError::MalformedContainer(format!("private key parse error: {e}")))?;

        let attributes = IssuerAttributes::from_name(&certificate.tbs_certificate.issuer);
        let issuer_name = attributes.issuer_name();
        let serial_number =
            BigUint::from_bytes_be(certificate.tbs_certificate.serial_number.as_bytes()).to_string();
        let certificate_digest = Base64::encode_string(&Sha1::digest(cert_der));
        let modulus = Base64::encode_string(&key.n().to_bytes_be());
        let exponent = Base64::encode_string(&key.e().to_bytes_be());

        debug!(issuer = %issuer_name, serial = %serial_number, "loaded signing certificate");
        Ok(Self {
            key,
            certificate_der: cert_der.to_vec(),
            issuer_name,
            serial_number,
            certificate_digest,
            modulus,
            exponent,
        })
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.key
    }

    pub fn certificate_der(&self) -> &[u8] {
        &self.certificate_der
    }

    /// Unwrapped base64 of the DER certificate.
    pub fn certificate_base64(&self) -> String {
        Base64::encode_string(&self.certificate_der)
    }

    pub fn issuer_name(&self) -> &str {
        &self.issuer_name
    }

    pub fn serial_number(&self) -> &str {
        &self.serial_number
    }

    /// Base64 SHA1 digest of the DER certificate.
    pub fn certificate_digest(&self) -> &str {
        &self.certificate_digest
    }

    pub fn modulus(&self) -> &str {
        &self.modulus
    }

    pub fn exponent(&self) -> &str {
        &self.exponent
    }
}

impl fmt::Debug for SigningCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningCertificate")
            .field("issuer_name", &self.issuer_name)
            .field("serial_number", &self.serial_number)
            .field("certificate_digest", &self.certificate_digest)
            .finish_non_exhaustive()
    }
}

impl KnownIssuer {
    const TABLE: [(&'static str, &'static str, KnownIssuer); 2] = [
        ("UANATACA S.A.", "UANATACA CA2 2016", KnownIssuer::UanatacaCa2_2016),
        ("UANATACA S.A.", "UANATACA CA2 2021", KnownIssuer::UanatacaCa2_2021),
    ];

    /// Looks up an issuer by organization and common name.
    pub fn lookup(organization: &str, common_name: &str) -> Option<Self> {
        let organization = organization.trim();
        let common_name = common_name.trim();
        Self::TABLE.iter().find_map(|(org, cn, issuer)| {
            (org.eq_ignore_ascii_case(organization) && cn.eq_ignore_ascii_case(common_name))
                .then_some(*issuer)
        })
    }

    pub fn canonical_name(&self) -> &'static str {
        match self {
            KnownIssuer::UanatacaCa2_2016 => {
                "2.5.4.97=#0c0f56415445532d413636373231343939,CN=UANATACA CA2 2016,OU=TSP-UANATACA,O=UANATACA S.A.,L=Barcelona (see current address at www.uanataca.com/address),C=ES"
            }
            KnownIssuer::UanatacaCa2_2021 => {
                "2.5.4.97=#0c0f56415445532d413636373231343939,CN=UANATACA CA2 2021,OU=TSP-UANATACA,O=UANATACA S.A.,L=Barcelona,C=ES"
            }
        }
    }

    pub fn all() -> impl Iterator<Item = KnownIssuer> {
        Self::TABLE.iter().map(|(_, _, issuer)| *issuer)
    }
}

impl IssuerAttributes {
    pub fn from_name(name: &Name) -> Self {
        let mut attributes = IssuerAttributes::default();
        for rdn in name.0.iter() {
            for atv in rdn.0.iter() {
                let Some(value) = attribute_text(&atv.value) else {
                    continue;
                };
                let slot = match atv.oid {
                    oid if oid == OID_CN => &mut attributes.common_name,
                    oid if oid == OID_OU => &mut attributes.organizational_unit,
                    oid if oid == OID_O => &mut attributes.organization,
                    oid if oid == OID_L => &mut attributes.locality,
                    oid if oid == OID_C => &mut attributes.country,
                    _ => continue,
                };
                if slot.is_none() {
                    *slot = Some(value.trim().to_string());
                }
            }
        }
        attributes
    }

    pub fn known_issuer(&self) -> Option<KnownIssuer> {
        match (&self.organization, &self.common_name) {
            (Some(organization), Some(common_name)) => {
                KnownIssuer::lookup(organization, common_name)
            }
            _ => None,
        }
    }

    /// Issuer string for `X509IssuerName`: the canonical string for known
    /// authorities, otherwise `CN,OU,O,L,C` with absent attributes skipped.
    pub fn issuer_name(&self) -> String {
        if let Some(known) = self.known_issuer() {
            return known.canonical_name().to_string();
        }
        self.render()
    }

    pub fn render(&self) -> String {
        [
            ("CN", &self.common_name),
            ("OU", &self.organizational_unit),
            ("O", &self.organization),
            ("L", &self.locality),
            ("C", &self.country),
        ]
        .into_iter()
        .filter_map(|(label, value)| value.as_ref().map(|v| format!("{label}={v}")))
        .collect::<Vec<_>>()
        .join(",")
    }
}

impl Pkcs12Source {
    pub fn new(der: impl Into<Vec<u8>>, passphrase: impl Into<String>) -> Self {
        Self {
            der: der.into(),
            passphrase: passphrase.into(),
        }
    }
}

impl CertificateSource for Pkcs12Source {
    fn load(&self) -> Result<SigningCertificate, CertificateError> {
        extract(&self.der, &self.passphrase)
    }
}

impl fmt::Debug for Pkcs12Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pkcs12Source")
            .field("len", &self.der.len())
            .finish_non_exhaustive()
    }
}

impl Pkcs12File {
    pub fn new(path: impl Into<PathBuf>, passphrase: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            passphrase: passphrase.into(),
        }
    }
}

impl CertificateSource for Pkcs12File {
    fn load(&self) -> Result<SigningCertificate, CertificateError> {
        let der = std::fs::read(&self.path).map_err(|source| CertificateError::Io {
            path: self.path.clone(),
            source,
        })?;
        extract(&der, &self.passphrase)
    }
}

impl fmt::Debug for Pkcs12File {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pkcs12File")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

// Private API
fn classify_parse_error(stack: &ErrorStack) -> CertificateError {
    let wrong_passphrase = stack.errors().iter().any(|e| {
        e.library_code() == ERR_LIB_PKCS12 && e.reason_code() == PKCS12_R_MAC_VERIFY_FAILURE
    });
    if wrong_passphrase {
        CertificateError::InvalidPassphrase
    } else {
        CertificateError::MalformedContainer(format!("cannot open container: {stack}"))
    }
}

/// Directory string value decoded according to its ASN.1 tag.
fn attribute_text(value: &Any) -> Option<String> {
    let text = match value.tag() {
        Tag::Utf8String => Utf8StringRef::try_from(value).ok()?.as_str().to_string(),
        Tag::PrintableString => PrintableStringRef::try_from(value).ok()?.as_str().to_string(),
        Tag::Ia5String => Ia5StringRef::try_from(value).ok()?.as_str().to_string(),
        Tag::TeletexString => TeletexStringRef::try_from(value).ok()?.as_str().to_string(),
        Tag::BmpString => BmpString::from_ucs2(value.value().to_vec()).ok()?.to_string(),
        _ => return None,
    };
    Some(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uanataca(cn: &str) -> IssuerAttributes {
        IssuerAttributes {
            common_name: Some(cn.into()),
            organizational_unit: Some("TSP-UANATACA".into()),
            organization: Some("UANATACA S.A.".into()),
            locality: Some("Barcelona".into()),
            country: Some("ES".into()),
        }
    }

    /// Self-signed certificate for `name`, returned as (certificate DER, PKCS#8 key DER).
    fn identity(name: &openssl::x509::X509NameRef, serial: &str) -> (Vec<u8>, Vec<u8>) {
        use openssl::{
            asn1::Asn1Time, bn::BigNum, hash::MessageDigest, pkey::PKey, rsa::Rsa, x509::X509,
        };

        let pkey = PKey::from_rsa(Rsa::generate(2048).expect("rsa")).expect("pkey");
        let mut builder = X509::builder().expect("builder");
        builder.set_version(2).expect("version");
        let serial = BigNum::from_dec_str(serial)
            .and_then(|n| n.to_asn1_integer())
            .expect("serial");
        builder.set_serial_number(&serial).expect("serial");
        builder.set_subject_name(name).expect("subject");
        builder.set_issuer_name(name).expect("issuer");
        builder.set_pubkey(&pkey).expect("pubkey");
        builder
            .set_not_before(&Asn1Time::days_from_now(0).expect("time"))
            .expect("not before");
        builder
            .set_not_after(&Asn1Time::days_from_now(30).expect("time"))
            .expect("not after");
        builder.sign(&pkey, MessageDigest::sha256()).expect("sign");
        (
            builder.build().to_der().expect("cert der"),
            pkey.private_key_to_pkcs8().expect("key der"),
        )
    }

    fn simple_name(cn: &str) -> openssl::x509::X509Name {
        let mut name = openssl::x509::X509NameBuilder::new().expect("name");
        name.append_entry_by_text("CN", cn).expect("CN");
        name.append_entry_by_text("C", "EC").expect("C");
        name.build()
    }

    #[test]
    fn serial_number_is_rendered_in_decimal_beyond_u64() {
        let (cert, key) = identity(&simple_name("Serial CA"), "18446744073709551616");
        let certificate = SigningCertificate::from_der(&cert, &key).expect("certificate");
        assert_eq!(certificate.serial_number(), "18446744073709551616");
        assert_eq!(certificate.issuer_name(), "CN=Serial CA,C=EC");
    }

    #[test]
    fn bmp_string_attributes_are_decoded() {
        use openssl::{asn1::Asn1Type, nid::Nid};

        // "Andes" as UCS-2 big endian.
        let ucs2 = "\0A\0n\0d\0e\0s";
        let mut name = openssl::x509::X509NameBuilder::new().expect("name");
        name.append_entry_by_text("CN", "Andes Root").expect("CN");
        name.append_entry_by_nid_with_type(Nid::ORGANIZATIONNAME, ucs2, Asn1Type::BMPSTRING)
            .expect("O");
        let (cert, key) = identity(&name.build(), "5");

        let certificate = SigningCertificate::from_der(&cert, &key).expect("certificate");
        assert_eq!(certificate.issuer_name(), "CN=Andes Root,O=Andes");
    }

    #[test]
    fn mac_failure_maps_to_invalid_passphrase() {
        let (cert, key) = identity(&simple_name("Mac CA"), "9");
        let pkey = openssl::pkey::PKey::private_key_from_pkcs8(&key).expect("pkey");
        let cert = openssl::x509::X509::from_der(&cert).expect("cert");
        let mut builder = Pkcs12::builder();
        builder.name("mac").pkey(&pkey).cert(&cert);
        let der = builder.build2("right").and_then(|p| p.to_der()).expect("p12");

        assert!(extract(&der, "right").is_ok());
        let err = extract(&der, "wrong").expect_err("wrong passphrase");
        assert!(matches!(err, CertificateError::InvalidPassphrase), "{err:?}");
    }

    #[test]
    fn known_issuers_use_canonical_strings() {
        let name = uanataca("UANATACA CA2 2016").issuer_name();
        assert!(name.starts_with("2.5.4.97=#0c0f56415445532d413636373231343939,CN=UANATACA CA2 2016"));
        assert!(name.contains("L=Barcelona (see current address"));

        let name = uanataca("uanataca ca2 2021").issuer_name();
        assert_eq!(name, KnownIssuer::UanatacaCa2_2021.canonical_name());
        assert_eq!(KnownIssuer::all().count(), 2);
    }

    #[test]
    fn unknown_issuer_falls_back_to_ordered_attributes() {
        let attributes = IssuerAttributes {
            common_name: Some("Test CA".into()),
            organization: Some("Example".into()),
            country: Some("EC".into()),
            ..IssuerAttributes::default()
        };
        assert_eq!(attributes.known_issuer(), None);
        assert_eq!(attributes.issuer_name(), "CN=Test CA,O=Example,C=EC");

        let cn_only = uanataca("UANATACA CA1 2016");
        assert_eq!(
            cn_only.issuer_name(),
            "CN=UANATACA CA1 2016,OU=TSP-UANATACA,O=UANATACA S.A.,L=Barcelona,C=ES"
        );
    }

    #[test]
    fn garbage_container_is_malformed() {
        let err = extract(b"not a container", "secret").expect_err("must fail");
        assert!(matches!(err, CertificateError::MalformedContainer(_)));
    }

    #[test]
    fn missing_file_reports_path() {
        let source = Pkcs12File::new("/nonexistent/factura.p12", "secret");
        let err = source.load().expect_err("must fail");
        assert!(matches!(err, CertificateError::Io { .. }));
        assert!(!format!("{source:?}").contains("secret"));
    }
}
