use base64ct::{Base64, Encoding};
use rsa::{Pkcs1v15Sign, RsaPrivateKey};
use sha1::{Digest, Sha1};

use super::SigningError;

/// Line width the authority's parser expects for base64 blocks.
pub const BASE64_LINE_WIDTH: usize = 76;

/// Base64 (standard, padded, unwrapped) SHA1 digest of `bytes`.
pub fn sha1_base64(bytes: &[u8]) -> String {
    Base64::encode_string(&Sha1::digest(bytes))
}

/// RSA PKCS#1 v1.5 signature over the SHA1 digest of `bytes`, base64 wrapped at 76 columns.
pub fn rsa_sha1_sign(bytes: &[u8], key: &RsaPrivateKey) -> Result<String, SigningError> {
    let digest = Sha1::digest(bytes);
    let signature = key
        .sign(Pkcs1v15Sign::new::<Sha1>(), &digest)
        .map_err(|e| SigningError::signing("signature value", format!("RSA-SHA1 error: {e}")))?;
    Ok(wrap_base64(&Base64::encode_string(&signature), BASE64_LINE_WIDTH))
}

/// Splits `text` into lines of at most `width` characters joined with `\n`.
pub fn wrap_base64(text: &str, width: usize) -> String {
    if width == 0 {
        return text.to_string();
    }
    text.as_bytes()
        .chunks(width)
        .map(|chunk| String::from_utf8_lossy(chunk))
        .collect::<Vec<_>>()
        .join("\n")
}
