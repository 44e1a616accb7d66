//! Core types for Lockstep BFT replication.
//!
//! This crate provides the foundational types used throughout the
//! implementation:
//!
//! - **Primitives**: content digests, replica/view/sequence identifiers
//! - **Protocol messages**: the closed set of wire message variants
//! - **Wire format**: the signed envelope and its canonical codec
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not depend
//! on any other workspace crates, making it the foundation layer. All
//! serialization is SBOR, which is byte-deterministic: two replicas encoding
//! the same message produce the same bytes, which is what makes
//! content-addressing and signature verification well-defined.

mod codec;
mod digest;
mod identifiers;
mod message;
mod request;

pub use codec::{decode_envelope, decode_payload, encode_envelope, encode_payload, CodecError, WIRE_VERSION};
pub use digest::Digest;
pub use identifiers::{primary_of, ReplicaId, Slot};
pub use message::{Commit, Message, NewView, PqEntry, Preprepare, Prepare, SignedMessage, ViewChange};
pub use request::Request;
