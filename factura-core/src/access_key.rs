//! 49-digit access keys (`claveAcceso`) with the modulo-11 check digit.
use chrono::NaiveDate;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

use crate::config::EnvironmentType;

pub const ACCESS_KEY_LEN: usize = 49;

const CHECK_WEIGHTS: [u32; 6] = [2, 3, 4, 5, 6, 7];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessKeyError {
    #[error("access key must have {ACCESS_KEY_LEN} digits, got {0}")]
    Length(usize),
    #[error("access key must contain only ASCII digits")]
    NonDigit,
    #[error("access key check digit mismatch: expected {expected}, found {found}")]
    CheckDigit { expected: u8, found: u8 },
    #[error("{field} must contain only digits, got {value:?}")]
    NotNumeric { field: &'static str, value: String },
    #[error("{field} must have {width} digits, got {value:?}")]
    FieldWidth {
        field: &'static str,
        width: usize,
        value: String,
    },
}

/// Validated access key.
///
/// Always 49 ASCII digits whose last digit is the modulo-11 check digit of the
/// first 48.
///
/// # Examples
/// ```rust
/// use factura_core::access_key::AccessKey;
///
/// let key: AccessKey = "0605202501120603993300110010010000000600608364218".parse()?;
/// assert_eq!(key.tax_id(), "1206039933001");
/// assert_eq!(key.sequence(), "000000060");
/// # Ok::<(), factura_core::access_key::AccessKeyError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccessKey(String);

/// Components of an access key before the check digit is appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessKeyFields {
    pub issue_date: NaiveDate,
    /// `01` invoice, `04` credit note, `05` debit note, `06` waybill, `07` withholding.
    pub document_type: String,
    /// 13-digit RUC of the issuer.
    pub tax_id: String,
    pub environment: EnvironmentType,
    pub establishment: String,
    pub emission_point: String,
    pub sequence: u64,
    pub unique_code: UniqueCode,
    /// `1` for normal emission.
    pub emission_type: String,
}

/// Opaque 8-digit per-document token embedded in the access key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UniqueCode(String);

// Public API
impl AccessKey {
    pub fn parse(value: &str) -> Result<Self, AccessKeyError> {
        let value = value.trim();
        if !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AccessKeyError::NonDigit);
        }
        if value.len() != ACCESS_KEY_LEN {
            return Err(AccessKeyError::Length(value.len()));
        }
        let expected = check_digit(&value[..ACCESS_KEY_LEN - 1])?;
        let found = value.as_bytes()[ACCESS_KEY_LEN - 1] - b'0';
        if expected != found {
            return Err(AccessKeyError::CheckDigit { expected, found });
        }
        Ok(Self(value.to_string()))
    }

    /// Assembles the 48 field digits and appends the check digit.
    ///
    /// Short numeric fields are zero-padded to their width; values that do not
    /// fit raise [`AccessKeyError::FieldWidth`] instead of being truncated.
    pub fn build(fields: &AccessKeyFields) -> Result<Self, AccessKeyError> {
        let mut digits = String::with_capacity(ACCESS_KEY_LEN);
        digits.push_str(&fields.issue_date.format("%d%m%Y").to_string());
        digits.push_str(&padded("document_type", &fields.document_type, 2)?);
        digits.push_str(&exact("tax_id", &fields.tax_id, 13)?);
        digits.push(fields.environment.code());
        digits.push_str(&padded("establishment", &fields.establishment, 3)?);
        digits.push_str(&padded("emission_point", &fields.emission_point, 3)?);
        digits.push_str(&padded("sequence", &fields.sequence.to_string(), 9)?);
        digits.push_str(fields.unique_code.as_str());
        digits.push_str(&exact("emission_type", &fields.emission_type, 1)?);

        if digits.len() != ACCESS_KEY_LEN - 1 {
            return Err(AccessKeyError::Length(digits.len() + 1));
        }
        let check = check_digit(&digits)?;
        digits.push(char::from(b'0' + check));
        Ok(Self(digits))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Issue date as written in the key (`ddMMyyyy`).
    pub fn date_digits(&self) -> &str {
        &self.0[0..8]
    }

    pub fn issue_date(&self) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(self.date_digits(), "%d%m%Y").ok()
    }

    pub fn document_type(&self) -> &str {
        &self.0[8..10]
    }

    pub fn tax_id(&self) -> &str {
        &self.0[10..23]
    }

    pub fn environment(&self) -> Option<EnvironmentType> {
        EnvironmentType::from_str(&self.0[23..24]).ok()
    }

    /// Establishment and emission point (`001001`).
    pub fn series(&self) -> &str {
        &self.0[24..30]
    }

    pub fn sequence(&self) -> &str {
        &self.0[30..39]
    }

    pub fn unique_code(&self) -> &str {
        &self.0[39..47]
    }

    pub fn emission_type(&self) -> &str {
        &self.0[47..48]
    }

    pub fn check_digit(&self) -> u8 {
        self.0.as_bytes()[ACCESS_KEY_LEN - 1] - b'0'
    }
}

impl UniqueCode {
    pub const WIDTH: usize = 8;

    pub fn new(value: &str) -> Result<Self, AccessKeyError> {
        padded("unique_code", value, Self::WIDTH).map(Self)
    }

    pub fn random() -> Self {
        let value: u32 = rand::thread_rng().gen_range(0..100_000_000);
        Self(format!("{value:08}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Modulo-11 check digit over `digits`, weights 2..=7 applied right to left.
///
/// Residue 0 maps to 0 and residue 1 maps to 1; every other residue `r` maps
/// to `11 - r`.
pub fn check_digit(digits: &str) -> Result<u8, AccessKeyError> {
    let mut sum = 0u32;
    for (index, byte) in digits.bytes().rev().enumerate() {
        if !byte.is_ascii_digit() {
            return Err(AccessKeyError::NonDigit);
        }
        sum += u32::from(byte - b'0') * CHECK_WEIGHTS[index % CHECK_WEIGHTS.len()];
    }
    let digit = match sum % 11 {
        0 => 0,
        1 => 1,
        residue => 11 - residue,
    };
    Ok(digit as u8)
}

// Private API
fn numeric(field: &'static str, value: &str) -> Result<String, AccessKeyError> {
    let value = value.trim();
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AccessKeyError::NotNumeric {
            field,
            value: value.to_string(),
        });
    }
    Ok(value.to_string())
}

fn padded(field: &'static str, value: &str, width: usize) -> Result<String, AccessKeyError> {
    let value = numeric(field, value)?;
    if value.len() > width {
        return Err(AccessKeyError::FieldWidth {
            field,
            width,
            value,
        });
    }
    Ok(format!("{value:0>width$}"))
}

fn exact(field: &'static str, value: &str, width: usize) -> Result<String, AccessKeyError> {
    let value = numeric(field, value)?;
    if value.len() != width {
        return Err(AccessKeyError::FieldWidth {
            field,
            width,
            value,
        });
    }
    Ok(value)
}

impl FromStr for AccessKey {
    type Err = AccessKeyError;
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        AccessKey::parse(value)
    }
}

impl TryFrom<String> for AccessKey {
    type Error = AccessKeyError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        AccessKey::parse(&value)
    }
}

impl From<AccessKey> for String {
    fn from(key: AccessKey) -> Self {
        key.0
    }
}

impl AsRef<str> for AccessKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for UniqueCode {
    type Error = AccessKeyError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        UniqueCode::new(&value)
    }
}

impl From<UniqueCode> for String {
    fn from(code: UniqueCode) -> Self {
        code.0
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn build_parse_and_check_digit_agree(
            year in 2000i32..2100,
            month in 1u32..=12,
            day in 1u32..=28,
            document_type in 0u32..100,
            tax_id in "[0-9]{13}",
            production in any::<bool>(),
            establishment in 0u32..1000,
            emission_point in 0u32..1000,
            sequence in 0u64..1_000_000_000,
            unique_code in "[0-9]{8}",
            emission_type in "[0-9]",
        ) {
            let fields = AccessKeyFields {
                issue_date: NaiveDate::from_ymd_opt(year, month, day).expect("date"),
                document_type: document_type.to_string(),
                tax_id,
                environment: if production {
                    EnvironmentType::Production
                } else {
                    EnvironmentType::Test
                },
                establishment: establishment.to_string(),
                emission_point: emission_point.to_string(),
                sequence,
                unique_code: UniqueCode::new(&unique_code).expect("code"),
                emission_type,
            };
            let key = AccessKey::build(&fields).expect("build");

            prop_assert_eq!(key.as_str().len(), ACCESS_KEY_LEN);
            prop_assert!(key.check_digit() < 10);
            prop_assert_eq!(check_digit(&key.as_str()[..48]).expect("digits"), key.check_digit());
            let parsed = AccessKey::parse(key.as_str());
            prop_assert_eq!(parsed.as_ref(), Ok(&key));
            prop_assert_eq!(key.issue_date(), Some(fields.issue_date));
            prop_assert_eq!(key.sequence(), format!("{sequence:09}"));
        }
    }
}
