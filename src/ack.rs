//! Building and decoding HL7 acknowledgements.

use bytes::{BufMut, BytesMut};
use chrono::{DateTime, Local};
use std::fmt;

use crate::error::TransportError;
use crate::locator::{find_field, HEADER_SEGMENT};
use crate::mllp;
use crate::HL7_TIMESTAMP;

/// MSH-10, the field a sender puts its message control id in
pub const CONTROL_ID_FIELD: usize = 10;
/// Echoed in place of the control id when the inbound message doesn't carry one
pub const UNKNOWN_CONTROL_ID: &str = "<UNKNOWN>";
/// Version stamped on the listener's synthesized acks
pub const ACK_VERSION: &str = "2.5";

/// First character of an ack code
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckKind {
    Application,
    Commit,
}

/// Second character of an ack code
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckStatus {
    Accept,
    Error,
    Reject,
}

/// A two character acknowledgement code such as `AA` or `CR`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AckCode {
    pub kind: AckKind,
    pub status: AckStatus,
}

impl AckCode {
    pub const APPLICATION_ACCEPT: AckCode = AckCode {
        kind: AckKind::Application,
        status: AckStatus::Accept,
    };

    /// Parses exactly two bytes, anything else is `None`.
    pub fn from_bytes(code: &[u8]) -> Option<AckCode> {
        let (kind, status) = match code {
            [kind, status] => (*kind, *status),
            _ => return None,
        };

        let kind = match kind {
            b'A' => AckKind::Application,
            b'C' => AckKind::Commit,
            _ => return None,
        };
        let status = match status {
            b'A' => AckStatus::Accept,
            b'E' => AckStatus::Error,
            b'R' => AckStatus::Reject,
            _ => return None,
        };

        Some(AckCode { kind, status })
    }

    pub fn is_accept(&self) -> bool {
        self.status == AckStatus::Accept
    }
}

impl fmt::Display for AckCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            AckKind::Application => 'A',
            AckKind::Commit => 'C',
        };
        let status = match self.status {
            AckStatus::Accept => 'A',
            AckStatus::Error => 'E',
            AckStatus::Reject => 'R',
        };
        write!(f, "{}{}", kind, status)
    }
}

/// A decoded acknowledgement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ack {
    pub code: AckCode,
    /// MSA-2, the control id the remote end says it is acknowledging
    pub control_id: Option<String>,
}

impl Ack {
    /// Decodes a response, framed or not.
    pub fn parse(response: &[u8]) -> Result<Ack, TransportError> {
        let body = mllp::unwrap(response);
        let body = trim_trailing_terminators(&body);

        let code = find_field(body, "MSA", 1).ok_or_else(|| {
            TransportError::AckParse(format!(
                "no MSA-1 in response '{}'",
                String::from_utf8_lossy(body)
            ))
        })?;

        let code = AckCode::from_bytes(code).ok_or_else(|| {
            TransportError::AckParse(format!(
                "'{}' is not a recognised ack code",
                String::from_utf8_lossy(code)
            ))
        })?;

        let control_id = find_field(body, "MSA", 2)
            .filter(|id| !id.is_empty())
            .map(|id| String::from_utf8_lossy(id).into_owned());

        Ok(Ack { code, control_id })
    }
}

fn trim_trailing_terminators(body: &[u8]) -> &[u8] {
    let end = body
        .iter()
        .rposition(|b| *b != b'\r' && *b != b'\n')
        .map_or(0, |i| i + 1);
    &body[..end]
}

/// Extracts MSH-10 from a message, if present and non-empty.
pub fn control_id(message: &[u8]) -> Option<&[u8]> {
    find_field(message, HEADER_SEGMENT, CONTROL_ID_FIELD).filter(|id| !id.is_empty())
}

/// Builds the (unframed) `AA` acknowledgement the listener sends back for `message`.
pub fn build_ack(message: &[u8], now: DateTime<Local>) -> BytesMut {
    let control_id = control_id(message).unwrap_or(UNKNOWN_CONTROL_ID.as_bytes());
    let timestamp = now.format(HL7_TIMESTAMP).to_string();

    let mut ack = BytesMut::with_capacity(64 + 2 * control_id.len());
    ack.put_slice(b"MSH|^~\\&|||||");
    ack.put_slice(timestamp.as_bytes());
    ack.put_slice(b"||ACK|");
    ack.put_slice(control_id);
    ack.put_slice(b"|P|");
    ack.put_slice(ACK_VERSION.as_bytes());
    ack.put_slice(b"\rMSA|AA|");
    ack.put_slice(control_id);
    ack.put_slice(b"|OK|");
    ack
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_every_valid_code() {
        for code in ["AA", "AE", "AR", "CA", "CE", "CR"] {
            let parsed = AckCode::from_bytes(code.as_bytes());
            match parsed {
                Some(c) => assert_eq!(c.to_string(), code),
                None => panic!("{} should be a valid ack code", code),
            }
        }
    }

    #[test]
    fn rejects_invalid_codes() {
        for code in ["", "A", "AAA", "XA", "AX", "aa"] {
            assert_eq!(AckCode::from_bytes(code.as_bytes()), None, "{}", code);
        }
    }

    #[test]
    fn decodes_framed_response() {
        let framed = mllp::wrap(b"MSH|^~\\&|||||20240101120000||ACK|X|P|2.5\rMSA|AA|CTL123|OK|\r");
        let ack = Ack::parse(&framed).unwrap();

        assert_eq!(ack.code, AckCode::APPLICATION_ACCEPT);
        assert_eq!(ack.control_id.as_deref(), Some("CTL123"));
    }

    #[test]
    fn decodes_bare_response_with_commit_reject() {
        let ack = Ack::parse(b"MSH|^~\\&|x\rMSA|CR|\n").unwrap();
        assert_eq!(ack.code.kind, AckKind::Commit);
        assert_eq!(ack.code.status, AckStatus::Reject);
        assert!(!ack.code.is_accept());
        assert_eq!(ack.control_id, None);
    }

    #[test]
    fn response_without_msa_is_a_parse_error() {
        match Ack::parse(b"\x06") {
            Err(TransportError::AckParse(_)) => {}
            other => panic!("Expected AckParse, got {:?}", other),
        }
    }

    #[test]
    fn odd_code_is_a_parse_error() {
        match Ack::parse(b"MSA|ZZ|1") {
            Err(TransportError::AckParse(msg)) => assert!(msg.contains("ZZ")),
            other => panic!("Expected AckParse, got {:?}", other),
        }
    }

    #[test]
    fn built_ack_echoes_control_id() {
        let now = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 6).unwrap();
        let ack = build_ack(b"MSH|^~\\&|A|B|C|D|20240101||ADT^A01|MSG00042|P|2.5\rPID|1\r", now);

        assert_eq!(
            &ack[..],
            &b"MSH|^~\\&|||||20240309140506||ACK|MSG00042|P|2.5\rMSA|AA|MSG00042|OK|"[..]
        );
        let decoded = Ack::parse(&ack).unwrap();
        assert_eq!(decoded.control_id.as_deref(), Some("MSG00042"));
    }

    #[test]
    fn built_ack_uses_placeholder_without_control_id() {
        let ack = build_ack(b"PID|1|2\r", Local::now());
        assert_eq!(find_field(&ack, "MSA", 2), Some(UNKNOWN_CONTROL_ID.as_bytes()));
    }
}
