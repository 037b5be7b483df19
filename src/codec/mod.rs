//! MLLP framing and minimal HL7 v2 parsing.
//!
//! The wire format is the Minimal Lower Layer Protocol: a frame is
//! `SB payload EB CR`, segments inside the payload are separated by CR.
//! Parsing only extracts the handful of MSH/PID fields needed for routing
//! and audit; messages are never transformed.

mod hl7;
mod mllp;

pub use hl7::{build_ack, extract_ack_code, parse_header, AckCode, Header, Hl7Error};
pub use mllp::{wrap, CodecError, MllpCodec, CARRIAGE_RETURN, END_BLOCK, START_BLOCK};
