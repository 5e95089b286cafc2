//! Text messages exchanged over the datagram channel.
//!
//! - assignment: `lower,higher`
//! - result: `lower,higher,count,worker`
//!
//! Worker identities must not contain commas.

use std::str::FromStr;

use roster_core::types::Assignment;

use crate::{checked_range, non_empty, ConvertError};

/// Largest datagram either side sends or accepts.
pub const MAX_DATAGRAM_BYTES: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssignmentMsg {
    pub assignment: Assignment,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultMsg {
    pub assignment: Assignment,
    pub count: u64,
    pub worker: String,
}

impl AssignmentMsg {
    pub fn encode(&self) -> Vec<u8> {
        format!("{},{}", self.assignment.lower, self.assignment.higher).into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ConvertError> {
        let text = as_text("assignment", bytes)?;
        let fields: Vec<&str> = text.split(',').collect();
        let [lower, higher] = fields.as_slice() else {
            return Err(malformed("assignment", format!("expected 2 fields, got {}", fields.len())));
        };
        let assignment = checked_range(
            parse_field("assignment", lower)?,
            parse_field("assignment", higher)?,
        )?;
        Ok(Self { assignment })
    }
}

impl ResultMsg {
    pub fn encode(&self) -> Vec<u8> {
        format!(
            "{},{},{},{}",
            self.assignment.lower, self.assignment.higher, self.count, self.worker
        )
        .into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ConvertError> {
        let text = as_text("result", bytes)?;
        let fields: Vec<&str> = text.split(',').collect();
        let [lower, higher, count, worker] = fields.as_slice() else {
            return Err(malformed("result", format!("expected 4 fields, got {}", fields.len())));
        };
        non_empty("worker", worker)?;
        Ok(Self {
            assignment: checked_range(parse_field("result", lower)?, parse_field("result", higher)?)?,
            count: parse_field("result", count)?,
            worker: worker.trim().to_string(),
        })
    }
}

fn as_text<'a>(what: &'static str, bytes: &'a [u8]) -> Result<&'a str, ConvertError> {
    if bytes.len() > MAX_DATAGRAM_BYTES {
        return Err(malformed(what, format!("{} bytes exceeds datagram limit", bytes.len())));
    }
    std::str::from_utf8(bytes)
        .map(str::trim)
        .map_err(|err| malformed(what, err.to_string()))
}

fn parse_field<T: FromStr>(what: &'static str, value: &str) -> Result<T, ConvertError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|err| malformed(what, format!("{value:?}: {err}")))
}

fn malformed(what: &'static str, reason: String) -> ConvertError {
    ConvertError::Malformed { what, reason }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assignment_text_form() {
        let msg = AssignmentMsg {
            assignment: Assignment::new(1000, 2000),
        };
        assert_eq!(msg.encode(), b"1000,2000".to_vec());
        assert_eq!(AssignmentMsg::decode(b"1000,2000").unwrap(), msg);
    }

    #[test]
    fn result_text_form() {
        let msg = ResultMsg::decode(b"0,10,10,40001").unwrap();
        assert_eq!(msg.assignment, Assignment::new(0, 10));
        assert_eq!(msg.count, 10);
        assert_eq!(msg.worker, "40001");
        assert_eq!(msg.encode(), b"0,10,10,40001".to_vec());
    }

    #[test]
    fn result_requires_worker() {
        let err = ResultMsg::decode(b"0,10,10, ").unwrap_err();
        assert_eq!(err, ConvertError::EmptyField { field: "worker" });
    }

    #[test]
    fn malformed_messages_are_rejected() {
        assert!(matches!(
            AssignmentMsg::decode(b"0,10,10"),
            Err(ConvertError::Malformed { what: "assignment", .. })
        ));
        assert!(matches!(
            AssignmentMsg::decode(b"zero,10"),
            Err(ConvertError::Malformed { .. })
        ));
        assert!(matches!(
            ResultMsg::decode(&[0xff, 0xfe]),
            Err(ConvertError::Malformed { what: "result", .. })
        ));
        assert_eq!(
            AssignmentMsg::decode(b"20,10").unwrap_err(),
            ConvertError::InvertedRange {
                lower: 20,
                higher: 10
            }
        );
    }
}
