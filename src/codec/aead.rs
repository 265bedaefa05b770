//! AEAD stream codec over AES-GCM
//!
//! Splits an arbitrary byte stream into frames of at most
//! [`MAX_CHUNK_SIZE`](super::MAX_CHUNK_SIZE) plaintext bytes. Each frame is
//! sealed under an implicit 12-byte nonce counter and written as a 2-byte
//! big-endian ciphertext length followed by ciphertext and tag. The nonce is
//! never transmitted: both peers advance mirrored counters by processing
//! frames in the same order, so a single lost or reordered frame
//! desynchronizes the stream and every later frame fails authentication.

use super::{
    CodecError, FrameLock, KeySource, Mark, MarkDirection, Marker, MAX_CHUNK_SIZE, NONCE_LEN,
    TAG_LEN,
};
use bytes::{Buf, BytesMut};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM, AES_256_GCM};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Implicit little-endian frame counter.
///
/// The 12 bytes are treated as a base-256 unsigned integer with the least
/// significant byte first; incrementing carries toward the last byte and the
/// whole counter wraps to zero on overflow.
#[derive(Debug, Clone, Copy, Default)]
struct NonceCounter {
    bytes: [u8; NONCE_LEN],
}

impl NonceCounter {
    fn bytes(&self) -> [u8; NONCE_LEN] {
        self.bytes
    }

    fn increment(&mut self) {
        for byte in self.bytes.iter_mut() {
            *byte = byte.wrapping_add(1);
            if *byte != 0 {
                break;
            }
        }
    }
}

/// AEAD stream codec bound to one physical connection.
///
/// Constructed from a [`KeySource`], a requested key size, a [`Marker`] and
/// the connection's shared frame lock. The encode and decode halves advance
/// independent nonce counters, each starting at zero.
pub struct AeadCodec {
    key: Arc<LessSafeKey>,
    marker: Arc<dyn Marker>,
    lock: FrameLock,
}

impl AeadCodec {
    /// Build a codec, deriving key material from the key source up front.
    ///
    /// 16-byte keys select AES-128-GCM, 32-byte keys AES-256-GCM; other
    /// sizes are rejected.
    pub fn new(
        key_source: &dyn KeySource,
        key_size: usize,
        marker: Arc<dyn Marker>,
        lock: FrameLock,
    ) -> Result<Self, CodecError> {
        let algorithm = match key_size {
            16 => &AES_128_GCM,
            32 => &AES_256_GCM,
            other => return Err(CodecError::UnsupportedKeySize(other)),
        };

        let material = key_source.get(key_size)?;
        let unbound = UnboundKey::new(algorithm, &material).map_err(|_| CodecError::InvalidKey)?;

        Ok(Self {
            key: Arc::new(LessSafeKey::new(unbound)),
            marker,
            lock,
        })
    }

    /// Wrap a sink into an encrypting frame writer.
    pub fn encode<W: AsyncWrite + Unpin + Send>(&self, sink: W) -> FrameEncoder<W> {
        FrameEncoder {
            sink,
            key: Arc::clone(&self.key),
            marker: Arc::clone(&self.marker),
            lock: Arc::clone(&self.lock),
            nonce: NonceCounter::default(),
        }
    }

    /// Wrap a source into a decrypting frame reader.
    pub fn decode<R: AsyncRead + Unpin + Send>(&self, source: R) -> FrameDecoder<R> {
        FrameDecoder {
            source,
            key: Arc::clone(&self.key),
            marker: Arc::clone(&self.marker),
            nonce: NonceCounter::default(),
            plaintext: BytesMut::new(),
        }
    }
}

/// Encrypting writer half of an [`AeadCodec`]
pub struct FrameEncoder<W> {
    sink: W,
    key: Arc<LessSafeKey>,
    marker: Arc<dyn Marker>,
    lock: FrameLock,
    nonce: NonceCounter,
}

impl<W: AsyncWrite + Unpin + Send> FrameEncoder<W> {
    /// Encrypt and write `data`, splitting it into frames as needed.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize, CodecError> {
        for chunk in data.chunks(MAX_CHUNK_SIZE) {
            self.write_frame(chunk).await?;
        }

        Ok(data.len())
    }

    async fn write_frame(&mut self, chunk: &[u8]) -> Result<(), CodecError> {
        // Whole-frame critical section: seal, emit, mark and advance must not
        // interleave with another channel's frame on the same connection.
        let _guard = self.lock.lock().await;

        let nonce_bytes = self.nonce.bytes();

        let mut sealed = Vec::with_capacity(chunk.len() + TAG_LEN);
        sealed.extend_from_slice(chunk);

        let nonce = Nonce::assume_unique_for_key(nonce_bytes);
        self.key
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut sealed)
            .map_err(|_| CodecError::Encryption)?;

        let len = (sealed.len() as u16).to_be_bytes();
        self.sink.write_all(&len).await?;
        self.sink.write_all(&sealed).await?;

        self.marker.mark(Mark {
            direction: MarkDirection::Encode,
            nonce: nonce_bytes,
            frame_len: sealed.len(),
        })?;

        self.nonce.increment();

        Ok(())
    }

    /// Flush the underlying sink.
    pub async fn flush(&mut self) -> Result<(), CodecError> {
        self.sink.flush().await?;

        Ok(())
    }
}

/// Decrypting reader half of an [`AeadCodec`]
pub struct FrameDecoder<R> {
    source: R,
    key: Arc<LessSafeKey>,
    marker: Arc<dyn Marker>,
    nonce: NonceCounter,
    plaintext: BytesMut,
}

impl<R: AsyncRead + Unpin + Send> FrameDecoder<R> {
    /// Read decrypted bytes into `buf`, pulling frames as needed.
    ///
    /// Returns 0 only on clean end of stream at a frame boundary.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, CodecError> {
        while self.plaintext.is_empty() {
            if !self.read_frame().await? {
                return Ok(0);
            }
        }

        let n = buf.len().min(self.plaintext.len());
        buf[..n].copy_from_slice(&self.plaintext[..n]);
        self.plaintext.advance(n);

        Ok(n)
    }

    /// Read exactly `buf.len()` decrypted bytes.
    ///
    /// End of stream before the buffer fills is an error.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), CodecError> {
        let mut filled = 0;

        while filled < buf.len() {
            let n = self.read(&mut buf[filled..]).await?;

            if n == 0 {
                return Err(CodecError::Malformed("stream ended inside a frame"));
            }

            filled += n;
        }

        Ok(())
    }

    /// Pull and verify one frame. Returns false on clean end of stream.
    async fn read_frame(&mut self) -> Result<bool, CodecError> {
        let mut len_buf = [0u8; 2];

        // A zero-length first read is the only clean way for the stream to end.
        let n = self.source.read(&mut len_buf[..1]).await?;
        if n == 0 {
            return Ok(false);
        }
        self.source.read_exact(&mut len_buf[1..]).await?;

        let frame_len = u16::from_be_bytes(len_buf) as usize;
        if frame_len < TAG_LEN {
            return Err(CodecError::Malformed("frame shorter than its tag"));
        }

        let mut sealed = vec![0u8; frame_len];
        self.source.read_exact(&mut sealed).await?;

        let nonce_bytes = self.nonce.bytes();
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let opened = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut sealed)
            .map_err(|_| CodecError::Authentication)?;
        let opened_len = opened.len();

        self.marker.mark(Mark {
            direction: MarkDirection::Decode,
            nonce: nonce_bytes,
            frame_len,
        })?;

        self.nonce.increment();

        self.plaintext.extend_from_slice(&sealed[..opened_len]);

        Ok(true)
    }
}
