//! AEAD stream codec
//!
//! This module provides:
//! - An encrypting/decrypting stream codec over AES-GCM with implicit,
//!   self-synchronizing nonce counters
//! - The `KeySource` boundary for key negotiation collaborators
//! - The `Marker` boundary for ordering/replay policy collaborators
//! - HKDF-SHA256 derivation of key material from a pre-shared secret

mod aead;
mod kdf;

pub use aead::{AeadCodec, FrameDecoder, FrameEncoder};
pub use kdf::PresharedKeySource;

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

/// Length of the implicit nonce counter in bytes
pub const NONCE_LEN: usize = 12;

/// Length of the authentication tag in bytes
pub const TAG_LEN: usize = 16;

/// Maximum plaintext carried by a single frame
pub const MAX_CHUNK_SIZE: usize = 4096;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("key source failed: {0}")]
    KeySource(String),

    #[error("unsupported key size: {0}")]
    UnsupportedKeySize(usize),

    #[error("key material rejected by cipher")]
    InvalidKey,

    #[error("frame sealing failed")]
    Encryption,

    #[error("frame authentication failed")]
    Authentication,

    #[error("malformed frame: {0}")]
    Malformed(&'static str),

    #[error("frame rejected by marker: {0}")]
    Rejected(String),
}

/// Supplies key material of a requested length.
///
/// Both peers must derive identical material for a given negotiation. The
/// codec calls `get` exactly once at construction and treats the result as
/// opaque; it is never logged or persisted.
pub trait KeySource: Send + Sync {
    fn get(&self, size: usize) -> Result<Vec<u8>, CodecError>;
}

/// Direction a frame traveled through the codec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkDirection {
    Encode,
    Decode,
}

/// Per-frame record handed to a [`Marker`]
#[derive(Debug, Clone, Copy)]
pub struct Mark {
    /// Direction of the frame
    pub direction: MarkDirection,
    /// Nonce the frame was sealed or opened under
    pub nonce: [u8; NONCE_LEN],
    /// Ciphertext length including the authentication tag
    pub frame_len: usize,
}

/// Observes every frame in both directions.
///
/// Markers own no codec state; an error return aborts the encode or decode
/// call that produced the frame.
pub trait Marker: Send + Sync {
    fn mark(&self, mark: Mark) -> Result<(), CodecError>;
}

/// Marker that accepts every frame
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMarker;

impl Marker for NullMarker {
    fn mark(&self, _mark: Mark) -> Result<(), CodecError> {
        Ok(())
    }
}

/// Critical-section handle serializing frame emission.
///
/// Shared across every codec instance bound to one physical connection so
/// encodes from different logical channels interleave only as whole frames.
pub type FrameLock = Arc<Mutex<()>>;

/// Create a fresh critical-section handle for one physical connection.
pub fn frame_lock() -> FrameLock {
    Arc::new(Mutex::new(()))
}
