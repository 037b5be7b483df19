//! Minimal HL7 v2 header parsing and ACK construction.
//!
//! Only the MSH and PID fields needed for routing and audit are extracted.
//! Everything else in the message is opaque and forwarded verbatim.

use bytes::Bytes;
use chrono::Utc;

use super::mllp::{CARRIAGE_RETURN, END_BLOCK, START_BLOCK};

/// An MSH segment needs at least this many pipe-delimited fields to be
/// considered routable.
const MIN_MSH_FIELDS: usize = 12;

/// Errors from HL7 header extraction.
///
/// PID problems are deliberately absent: a missing or malformed PID segment
/// leaves the patient fields empty and is never a rejection.
#[derive(Debug, thiserror::Error)]
pub enum Hl7Error {
    #[error("empty message")]
    Empty,

    #[error("invalid HL7 message: no MSH segment")]
    MissingMsh,

    #[error("MSH segment has {got} fields, need at least {MIN_MSH_FIELDS}")]
    InsufficientFields { got: usize },
}

/// Header fields extracted from MSH and PID.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    pub sending_application: String,
    pub sending_facility: String,
    pub receiving_application: String,
    pub receiving_facility: String,
    pub message_type: String,
    pub control_id: String,
    pub patient_id: String,
    pub patient_name: String,
}

/// Acknowledgment codes this replicator produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckCode {
    /// Application accept.
    Aa,
    /// Application error (parse or processing failure).
    Ae,
    /// Application reject.
    Ar,
}

impl AckCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aa => "AA",
            Self::Ae => "AE",
            Self::Ar => "AR",
        }
    }
}

/// Parse the MSH (and optional PID) fields out of an unframed HL7 payload.
///
/// A stray MLLP wrapper is tolerated and stripped first.
pub fn parse_header(payload: &[u8]) -> Result<Header, Hl7Error> {
    let payload = strip_wrapper(payload);
    if payload.is_empty() {
        return Err(Hl7Error::Empty);
    }

    let text = String::from_utf8_lossy(payload);
    let mut segments = text.split(char::from(CARRIAGE_RETURN));

    let msh = segments.next().ok_or(Hl7Error::Empty)?;
    if !msh.starts_with("MSH") {
        return Err(Hl7Error::MissingMsh);
    }

    let fields: Vec<&str> = msh.split('|').collect();
    if fields.len() < MIN_MSH_FIELDS {
        return Err(Hl7Error::InsufficientFields { got: fields.len() });
    }

    let mut header = Header {
        sending_application: fields[2].to_string(),
        sending_facility: fields[3].to_string(),
        receiving_application: fields[4].to_string(),
        receiving_facility: fields[5].to_string(),
        message_type: fields[8].to_string(),
        control_id: fields[9].to_string(),
        ..Header::default()
    };

    for segment in segments {
        if !segment.starts_with("PID") {
            continue;
        }
        let pid: Vec<&str> = segment.split('|').collect();
        if pid.len() > 3 {
            header.patient_id = pid[3].to_string();
        }
        if pid.len() > 5 {
            // Components are LastName^FirstName^MiddleName; join with spaces.
            header.patient_name = pid[5]
                .split('^')
                .filter(|c| !c.is_empty())
                .collect::<Vec<_>>()
                .join(" ");
        }
        break;
    }

    Ok(header)
}

/// Build an MLLP-framed ACK for `original` with the given code.
///
/// The original message is re-parsed tolerantly; if it was unparseable the
/// echoed fields are empty and a control id of the form `ACK<unix_ts>` is
/// synthesized.
pub fn build_ack(original: &[u8], code: AckCode) -> Bytes {
    let header = parse_header(original).unwrap_or_default();

    let control_id = if header.control_id.is_empty() {
        format!("ACK{}", Utc::now().timestamp())
    } else {
        header.control_id.clone()
    };

    let payload = format!(
        "MSH|^~\\&|HL7_REPLICATOR|MINASOFT|{}|{}|{}||ACK^{}|{}|P|2.5\rMSA|{}|{}\r",
        header.sending_application,
        header.sending_facility,
        Utc::now().format("%Y%m%d%H%M%S"),
        header.message_type,
        control_id,
        code.as_str(),
        control_id,
    );

    super::mllp::wrap(payload.as_bytes())
}

/// Extract the acknowledgment code (MSA field 1) from an ACK payload.
pub fn extract_ack_code(payload: &[u8]) -> Option<String> {
    let payload = strip_wrapper(payload);
    let text = String::from_utf8_lossy(payload);

    text.split(char::from(CARRIAGE_RETURN))
        .find(|segment| segment.starts_with("MSA"))
        .and_then(|msa| msa.split('|').nth(1))
        .map(|code| code.to_string())
}

/// Strip an MLLP wrapper if one is present.
fn strip_wrapper(payload: &[u8]) -> &[u8] {
    let payload = payload.strip_prefix(&[START_BLOCK]).unwrap_or(payload);
    payload
        .strip_suffix(&[END_BLOCK, CARRIAGE_RETURN])
        .unwrap_or(payload)
}
