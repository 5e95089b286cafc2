#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod message;
pub mod progress;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConvertError {
    #[error("{field} must be non-empty")]
    EmptyField { field: &'static str },
    #[error("malformed {what}: {reason}")]
    Malformed { what: &'static str, reason: String },
    #[error("range lower bound {lower} exceeds upper bound {higher}")]
    InvertedRange { lower: u64, higher: u64 },
    #[error("unsupported progress schema version {0}")]
    UnsupportedSchema(u32),
    #[error("json: {0}")]
    Json(String),
}

pub trait ToWire<T> {
    fn to_wire(&self) -> T;
}

pub trait TryToCore<T> {
    type Error;
    fn try_to_core(&self) -> Result<T, Self::Error>;
}

fn non_empty(field: &'static str, value: &str) -> Result<(), ConvertError> {
    if value.trim().is_empty() {
        return Err(ConvertError::EmptyField { field });
    }
    Ok(())
}

fn checked_range(lower: u64, higher: u64) -> Result<roster_core::types::Assignment, ConvertError> {
    if lower > higher {
        return Err(ConvertError::InvertedRange { lower, higher });
    }
    Ok(roster_core::types::Assignment { lower, higher })
}
