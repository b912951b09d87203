//! Framed handshake messages.
//!
//! A client opens every test with one SYN message; the server answers with
//! an ACK carrying its certificate blob and the delay to the next stats
//! tick. Frames are a u32 big-endian length prefix over a bincode body and
//! must fit the single ≤1024-byte handshake read.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::HandshakeError;
use crate::state::{ClientParams, TestId};

/// Handshake reads use a single kernel read of at most this many bytes
pub const MAX_MSG_LEN: usize = 1024;

/// Length prefix size
const FRAME_HEADER_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Msg {
    /// Client request: which test, with which parameters
    Syn { test_id: TestId, params: ClientParams },
    /// Server answer: opaque certificate blob and delay until the next
    /// stats-tick boundary
    Ack { cert: Vec<u8>, tick_delay: Duration },
    /// Orderly end of a test
    Fin { reason: String },
    /// Start marker for externally-driven tests
    Bgn,
}

/// Build the ACK for an accepted SYN
pub fn ack_msg(cert: &[u8], tick_delay: Duration) -> Msg {
    Msg::Ack {
        cert: cert.to_vec(),
        tick_delay,
    }
}

/// Encode a message as a length-prefixed frame
pub fn encode_msg(msg: &Msg) -> Result<Vec<u8>, HandshakeError> {
    let body = bincode::serialize(msg)?;
    if FRAME_HEADER_LEN + body.len() > MAX_MSG_LEN {
        return Err(HandshakeError::TooLarge(body.len()));
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode one message from the front of `buffer`.
///
/// Anything malformed (short buffer, bad length, undecodable body) is an
/// invalid handshake; the caller drops the connection.
pub fn decode_msg(buffer: &[u8]) -> Result<Msg, HandshakeError> {
    if buffer.len() < FRAME_HEADER_LEN {
        return Err(HandshakeError::Invalid);
    }
    let len = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
    if len == 0 || FRAME_HEADER_LEN + len > buffer.len() || FRAME_HEADER_LEN + len > MAX_MSG_LEN {
        return Err(HandshakeError::Invalid);
    }

    bincode::deserialize(&buffer[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len])
        .map_err(|_| HandshakeError::Invalid)
}

/// Decode the opening message and reject anything that is not a SYN
pub fn decode_syn(buffer: &[u8]) -> Result<(TestId, ClientParams), HandshakeError> {
    match decode_msg(buffer)? {
        Msg::Syn { test_id, params } => Ok((test_id, params)),
        _ => Err(HandshakeError::Invalid),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Protocol, TestKind};

    fn syn() -> Msg {
        Msg::Syn {
            test_id: TestId {
                protocol: Protocol::Tcp,
                kind: TestKind::Bandwidth,
            },
            params: ClientParams {
                num_threads: 2,
                buffer_size: 65536,
                rtt_count: 5,
                reverse: true,
                duration: Duration::from_secs(30),
            },
        }
    }

    #[test]
    fn test_roundtrip_identity() {
        for msg in [
            syn(),
            ack_msg(b"certificate-bytes", Duration::from_millis(371)),
            Msg::Fin {
                reason: "done".to_string(),
            },
            Msg::Bgn,
        ] {
            let frame = encode_msg(&msg).expect("encode");
            let decoded = decode_msg(&frame).expect("decode");
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn test_decode_ignores_trailing_bytes() {
        // A handshake read may pull the frame plus the start of test traffic
        let mut frame = encode_msg(&syn()).expect("encode");
        frame.extend_from_slice(&[0xAA; 32]);
        assert_eq!(decode_msg(&frame).expect("decode"), syn());
    }

    #[test]
    fn test_short_buffer_invalid() {
        let frame = encode_msg(&syn()).expect("encode");
        assert!(matches!(
            decode_msg(&frame[..frame.len() - 1]),
            Err(HandshakeError::Invalid)
        ));
        assert!(matches!(decode_msg(&[]), Err(HandshakeError::Invalid)));
        assert!(matches!(decode_msg(&[0, 0]), Err(HandshakeError::Invalid)));
    }

    #[test]
    fn test_corrupt_length_invalid() {
        let mut frame = encode_msg(&syn()).expect("encode");
        frame[0] = 0xFF; // claims a body far past the buffer
        assert!(matches!(decode_msg(&frame), Err(HandshakeError::Invalid)));
    }

    #[test]
    fn test_first_message_must_be_syn() {
        let frame = encode_msg(&Msg::Bgn).expect("encode");
        assert!(matches!(decode_syn(&frame), Err(HandshakeError::Invalid)));

        let frame = encode_msg(&syn()).expect("encode");
        let (test_id, params) = decode_syn(&frame).expect("syn accepted");
        assert_eq!(test_id.kind, TestKind::Bandwidth);
        assert_eq!(params.buffer_size, 65536);
    }

    #[test]
    fn test_oversized_cert_rejected_on_encode() {
        let msg = ack_msg(&vec![0u8; MAX_MSG_LEN], Duration::ZERO);
        assert!(matches!(
            encode_msg(&msg),
            Err(HandshakeError::TooLarge(_))
        ));
    }
}
