//! Message encoding and decoding.
//!
//! # Wire Format
//!
//! ```text
//! [version: u8][payload: SBOR-encoded SignedMessage]
//! ```
//!
//! The envelope payload is itself the SBOR encoding of one [`Message`].
//! SBOR is byte-deterministic (fixed field order, no optional-field
//! ambiguity), so the same message always signs and hashes identically
//! across implementations.

use crate::{Message, SignedMessage};
use thiserror::Error;

/// Current wire format version.
pub const WIRE_VERSION: u8 = 1;

/// Errors that can occur during message encoding/decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Version byte did not match [`WIRE_VERSION`].
    #[error("unknown wire version: {0}")]
    UnknownVersion(u8),

    /// Frame was empty or truncated.
    #[error("message too short")]
    MessageTooShort,

    /// SBOR decode failure.
    #[error("decode error: {0}")]
    Decode(String),

    /// SBOR encode failure.
    #[error("encode error: {0}")]
    Encode(String),
}

/// Encode a protocol message to its canonical payload bytes.
///
/// These are the bytes a replica signs.
pub fn encode_payload(message: &Message) -> Result<Vec<u8>, CodecError> {
    sbor::basic_encode(message).map_err(|e| CodecError::Encode(format!("{e:?}")))
}

/// Decode canonical payload bytes back into a protocol message.
pub fn decode_payload(payload: &[u8]) -> Result<Message, CodecError> {
    sbor::basic_decode(payload).map_err(|e| CodecError::Decode(format!("{e:?}")))
}

/// Encode a signed envelope to wire format.
pub fn encode_envelope(envelope: &SignedMessage) -> Result<Vec<u8>, CodecError> {
    let body =
        sbor::basic_encode(envelope).map_err(|e| CodecError::Encode(format!("{e:?}")))?;
    let mut bytes = Vec::with_capacity(1 + body.len());
    bytes.push(WIRE_VERSION);
    bytes.extend(body);
    Ok(bytes)
}

/// Decode a wire frame into a signed envelope.
///
/// This does not verify the signature; that is the engine's job, through the
/// host's signer capability.
pub fn decode_envelope(data: &[u8]) -> Result<SignedMessage, CodecError> {
    let (&version, body) = data.split_first().ok_or(CodecError::MessageTooShort)?;
    if version != WIRE_VERSION {
        return Err(CodecError::UnknownVersion(version));
    }
    sbor::basic_decode(body).map_err(|e| CodecError::Decode(format!("{e:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Commit, Digest, PqEntry, Prepare, Preprepare, ReplicaId, Request, Slot, ViewChange};

    fn round_trip(message: Message) {
        let payload = encode_payload(&message).unwrap();
        let decoded = decode_payload(&payload).unwrap();
        assert_eq!(decoded, message);
        // Byte-identical re-encode.
        assert_eq!(encode_payload(&decoded).unwrap(), payload);
    }

    #[test]
    fn payload_round_trips_every_variant() {
        let d = Digest::of(b"req");
        round_trip(Message::Request(Request::new(vec![1, 2, 3])));
        round_trip(Message::Preprepare(Preprepare {
            slot: Slot::new(0, 1),
            batch_digest: Digest::of_digests([&d]),
            request_digests: vec![d],
        }));
        round_trip(Message::Prepare(Prepare {
            slot: Slot::new(0, 1),
            batch_digest: d,
        }));
        round_trip(Message::Commit(Commit {
            slot: Slot::new(2, 7),
            batch_digest: d,
        }));
        round_trip(Message::ViewChange(ViewChange {
            new_view: 3,
            last_exec: 5,
            pset: vec![PqEntry {
                seq: 6,
                view: 2,
                batch_digest: Digest::of_digests([&d]),
                request_digests: vec![d],
            }],
            qset: vec![],
        }));
    }

    #[test]
    fn envelope_round_trips() {
        let payload = encode_payload(&Message::Prepare(Prepare {
            slot: Slot::new(1, 4),
            batch_digest: Digest::of(b"batch"),
        }))
        .unwrap();
        let envelope = SignedMessage {
            payload,
            signer: ReplicaId(2),
            signature: vec![9; 64],
        };
        let bytes = encode_envelope(&envelope).unwrap();
        assert_eq!(bytes[0], WIRE_VERSION);
        assert_eq!(decode_envelope(&bytes).unwrap(), envelope);
    }

    #[test]
    fn envelope_rejects_unknown_version() {
        let bytes = vec![99, 1, 2, 3];
        assert!(matches!(
            decode_envelope(&bytes),
            Err(CodecError::UnknownVersion(99))
        ));
    }

    #[test]
    fn envelope_rejects_empty_frame() {
        assert!(matches!(
            decode_envelope(&[]),
            Err(CodecError::MessageTooShort)
        ));
    }

    #[test]
    fn garbage_payload_is_an_error() {
        assert!(decode_payload(&[0xff, 0x00, 0x13]).is_err());
    }
}
