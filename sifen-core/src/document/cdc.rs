//! CDC (Código de Control) computation and diagnosis.
//!
//! A CDC is 43 data digits followed by a weighted modulus-11 check digit. The data
//! digits are fixed-width, left-zero-padded fields concatenated in a fixed order.
use sifen_derive::Validate;
use std::fmt;
use thiserror::Error;

/// Number of data digits before the check digit.
pub const DATA_DIGITS: usize = 43;
/// Total CDC length.
pub const CDC_LEN: usize = DATA_DIGITS + 1;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CdcError {
    #[error("invalid identity field: {0}")]
    Field(String),
    #[error("CDC must be {expected} digits, got {actual}", expected = CDC_LEN)]
    Length { actual: usize },
    #[error("CDC contains a non-digit character at position {position}")]
    NonDigit { position: usize },
    #[error("CDC check digit mismatch: expected {expected}, found {actual}")]
    ChecksumMismatch { expected: u8, actual: u8 },
}

impl From<String> for CdcError {
    fn from(message: String) -> Self {
        CdcError::Field(message)
    }
}

/// Positional fields of a CDC, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CdcField {
    DocumentType,
    Ruc,
    RucCheckDigit,
    Establishment,
    IssuancePoint,
    Number,
    TaxpayerType,
    IssueDate,
    EmissionType,
    Authorization,
    SecurityCode,
    CheckDigit,
}

impl CdcField {
    pub const DATA: [CdcField; 11] = [
        CdcField::DocumentType,
        CdcField::Ruc,
        CdcField::RucCheckDigit,
        CdcField::Establishment,
        CdcField::IssuancePoint,
        CdcField::Number,
        CdcField::TaxpayerType,
        CdcField::IssueDate,
        CdcField::EmissionType,
        CdcField::Authorization,
        CdcField::SecurityCode,
    ];

    pub fn width(&self) -> usize {
        match self {
            CdcField::DocumentType => 2,
            CdcField::Ruc => 8,
            CdcField::RucCheckDigit => 1,
            CdcField::Establishment => 3,
            CdcField::IssuancePoint => 3,
            CdcField::Number => 7,
            CdcField::TaxpayerType => 1,
            CdcField::IssueDate => 8,
            CdcField::EmissionType => 1,
            CdcField::Authorization => 8,
            CdcField::SecurityCode => 1,
            CdcField::CheckDigit => 1,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CdcField::DocumentType => "document_type",
            CdcField::Ruc => "ruc",
            CdcField::RucCheckDigit => "ruc_check_digit",
            CdcField::Establishment => "establishment",
            CdcField::IssuancePoint => "issuance_point",
            CdcField::Number => "number",
            CdcField::TaxpayerType => "taxpayer_type",
            CdcField::IssueDate => "issue_date",
            CdcField::EmissionType => "emission_type",
            CdcField::Authorization => "authorization",
            CdcField::SecurityCode => "security_code",
            CdcField::CheckDigit => "check_digit",
        }
    }
}

impl fmt::Display for CdcField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The 11 identity fields a CDC is derived from.
///
/// Every field is digits only and at most its declared width; shorter values are
/// zero-padded on the left by [`compute`].
///
/// # Examples
/// ```rust
/// use sifen_core::document::cdc::{compute, IdentityFields};
///
/// let fields = IdentityFields::new(
///     "01".into(), "4554737".into(), "8".into(), "001".into(), "001".into(),
///     "0000001".into(), "1".into(), "20260114".into(), "1".into(),
///     "12345678".into(), "1".into(),
/// )?;
/// assert_eq!(compute(&fields).as_str(), "01045547378001001000000112026011411234567819");
/// # Ok::<(), sifen_core::document::cdc::CdcError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Validate)]
#[validate_error(CdcError)]
pub struct IdentityFields {
    #[validate(max_digits = 2)]
    document_type: String,
    #[validate(max_digits = 8)]
    ruc: String,
    #[validate(max_digits = 1)]
    ruc_check_digit: String,
    #[validate(max_digits = 3)]
    establishment: String,
    #[validate(max_digits = 3)]
    issuance_point: String,
    #[validate(max_digits = 7)]
    number: String,
    #[validate(max_digits = 1)]
    taxpayer_type: String,
    #[validate(max_digits = 8)]
    issue_date: String,
    #[validate(max_digits = 1)]
    emission_type: String,
    #[validate(max_digits = 8)]
    authorization: String,
    #[validate(max_digits = 1)]
    security_code: String,
}

impl IdentityFields {
    /// Raw (unpadded) value of a data field. `CheckDigit` has no source field.
    pub fn get(&self, field: CdcField) -> Option<&str> {
        let value = match field {
            CdcField::DocumentType => &self.document_type,
            CdcField::Ruc => &self.ruc,
            CdcField::RucCheckDigit => &self.ruc_check_digit,
            CdcField::Establishment => &self.establishment,
            CdcField::IssuancePoint => &self.issuance_point,
            CdcField::Number => &self.number,
            CdcField::TaxpayerType => &self.taxpayer_type,
            CdcField::IssueDate => &self.issue_date,
            CdcField::EmissionType => &self.emission_type,
            CdcField::Authorization => &self.authorization,
            CdcField::SecurityCode => &self.security_code,
            CdcField::CheckDigit => return None,
        };
        Some(value.as_str())
    }

    /// Value of `field` left-padded to its width.
    pub fn padded(&self, field: CdcField) -> Option<String> {
        self.get(field)
            .map(|value| format!("{value:0>width$}", width = field.width()))
    }

    /// The 43 data digits in wire order.
    pub fn data_digits(&self) -> String {
        let mut out = String::with_capacity(DATA_DIGITS);
        for field in CdcField::DATA {
            if let Some(value) = self.padded(field) {
                out.push_str(&value);
            }
        }
        out
    }

    /// Splits an externally supplied 44-digit CDC at the exact boundaries used by
    /// [`compute`]. The check digit is not verified here; see [`diagnose`].
    pub fn from_cdc(cdc: &str) -> Result<Self, CdcError> {
        check_shape(cdc, CDC_LEN)?;
        let mut parts = Vec::with_capacity(CdcField::DATA.len());
        let mut offset = 0;
        for field in CdcField::DATA {
            let end = offset + field.width();
            parts.push(cdc[offset..end].to_string());
            offset = end;
        }
        let mut parts = parts.into_iter();
        let mut next = || parts.next().unwrap_or_default();
        IdentityFields::new(
            next(),
            next(),
            next(),
            next(),
            next(),
            next(),
            next(),
            next(),
            next(),
            next(),
            next(),
        )
    }
}

/// A CDC whose check digit is known to be correct.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cdc(String);

impl Cdc {
    /// Parses and verifies a 44-digit CDC.
    pub fn parse(value: &str) -> Result<Self, CdcError> {
        let validation = validate(value)?;
        if !validation.matches {
            return Err(CdcError::ChecksumMismatch {
                expected: validation.expected,
                actual: validation.actual,
            });
        }
        Ok(Cdc(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn check_digit(&self) -> u8 {
        self.0.as_bytes()[DATA_DIGITS] - b'0'
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Cdc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Cdc {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Outcome of [`validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CdcValidation {
    pub matches: bool,
    pub expected: u8,
    pub actual: u8,
}

/// One field where a CDC disagrees with the fields it should have been built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMismatch {
    pub field: CdcField,
    /// Padded value derived from the source fields.
    pub expected: String,
    /// Value found at that position in the CDC.
    pub actual: String,
}

/// Builds the CDC for `fields`.
pub fn compute(fields: &IdentityFields) -> Cdc {
    let mut digits = fields.data_digits();
    let check = weighted_check_digit(digits.as_bytes());
    digits.push(char::from(b'0' + check));
    Cdc(digits)
}

/// Check digit over 43 data digits.
pub fn check_digit(data: &str) -> Result<u8, CdcError> {
    check_shape(data, DATA_DIGITS)?;
    Ok(weighted_check_digit(data.as_bytes()))
}

/// Recomputes the check digit of a 44-digit CDC and compares it with the one carried.
pub fn validate(cdc: &str) -> Result<CdcValidation, CdcError> {
    check_shape(cdc, CDC_LEN)?;
    let bytes = cdc.as_bytes();
    let expected = weighted_check_digit(&bytes[..DATA_DIGITS]);
    let actual = bytes[DATA_DIGITS] - b'0';
    Ok(CdcValidation {
        matches: expected == actual,
        expected,
        actual,
    })
}

/// Compares a CDC with the fields it was supposedly derived from, field by field.
/// An empty result means the CDC is exactly `compute(fields)`.
pub fn diagnose(cdc: &str, fields: &IdentityFields) -> Result<Vec<FieldMismatch>, CdcError> {
    let found = IdentityFields::from_cdc(cdc)?;
    let mut mismatches = Vec::new();
    for field in CdcField::DATA {
        let expected = fields.padded(field).unwrap_or_default();
        let actual = found.padded(field).unwrap_or_default();
        if expected != actual {
            mismatches.push(FieldMismatch {
                field,
                expected,
                actual,
            });
        }
    }
    let expected = compute(fields);
    let actual = &cdc[DATA_DIGITS..];
    if expected.as_str()[DATA_DIGITS..] != *actual {
        mismatches.push(FieldMismatch {
            field: CdcField::CheckDigit,
            expected: expected.as_str()[DATA_DIGITS..].to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(mismatches)
}

fn check_shape(value: &str, len: usize) -> Result<(), CdcError> {
    if let Some(position) = value.bytes().position(|b| !b.is_ascii_digit()) {
        return Err(CdcError::NonDigit { position });
    }
    if value.len() != len {
        return Err(CdcError::Length {
            actual: value.len(),
        });
    }
    Ok(())
}

/// Weights 2..=9 cycle from the rightmost digit; remainder maps 11 to 0 and 10 to 1.
fn weighted_check_digit(digits: &[u8]) -> u8 {
    let mut weight = 2u32;
    let mut total = 0u32;
    for digit in digits.iter().rev() {
        total += u32::from(digit - b'0') * weight;
        weight = if weight == 9 { 2 } else { weight + 1 };
    }
    match 11 - total % 11 {
        11 => 0,
        10 => 1,
        other => other as u8,
    }
}
