//! Deterministic synthetic payloads and their content digests.

use std::pin::Pin;
use std::{fmt, io, task};

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};
use sha2::{Digest as _, Sha256};
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::io::ReaderStream;

use crate::datamodel::FileTest;

const DIGEST_CHUNK_SIZE: usize = 64 * 1024;

/// Type alias for data streams passed to and from storage clients.
pub type PayloadStream = BoxStream<'static, io::Result<bytes::Bytes>>;

/// Randomized contents of an object.
///
/// Two payloads created from the same seed and length yield byte-identical contents, which is what
/// allows downloads to be verified without keeping the uploaded data around.
#[derive(Debug, Clone)]
pub struct Payload {
    /// The remaining length of the payload in bytes.
    pub len: u64,
    /// The RNG used to fill the payload with random bytes.
    pub rng: SmallRng,
}

impl Payload {
    /// Creates a payload of `len` bytes from the given seed.
    pub fn new(seed: u64, len: u64) -> Self {
        Self {
            len,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// Creates the payload uploaded by worker `index` of the given file test.
    pub fn for_worker(file_test: &FileTest, index: usize) -> Self {
        Self::new(file_test.seed.wrapping_add(index as u64), file_test.size)
    }

    /// Fills `buf` with the next bytes of the payload and returns how many were written.
    ///
    /// Returns `0` once the payload is exhausted.
    pub fn fill(&mut self, buf: &mut [u8]) -> usize {
        let len_to_fill = (buf.len() as u64).min(self.len) as usize;
        self.rng.fill_bytes(&mut buf[..len_to_fill]);
        self.len -= len_to_fill as u64;
        len_to_fill
    }

    /// Converts the payload into a chunked byte stream.
    pub fn into_stream(self) -> PayloadStream {
        ReaderStream::new(self).boxed()
    }
}

impl io::Read for Payload {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.fill(buf))
    }
}

impl AsyncRead for Payload {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> task::Poll<io::Result<()>> {
        let len_to_fill = (buf.remaining() as u64).min(self.len) as usize;
        let filled = self.fill(buf.initialize_unfilled_to(len_to_fill));
        buf.advance(filled);

        task::Poll::Ready(Ok(()))
    }
}

/// A SHA-256 content digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest([u8; 32]);

impl Digest {
    /// Finishes the given hasher.
    pub fn from_hasher(hasher: Sha256) -> Self {
        Self(hasher.finalize().into())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({self})")
    }
}

/// Regenerates the payload of worker `index` locally and returns its digest.
///
/// This is CPU bound. Async callers should run it on a blocking thread.
pub fn expected_digest(file_test: &FileTest, index: usize) -> Digest {
    let mut payload = Payload::for_worker(file_test, index);
    let mut hasher = Sha256::new();
    let mut buf = vec![0; DIGEST_CHUNK_SIZE];
    loop {
        let len = payload.fill(&mut buf);
        if len == 0 {
            break;
        }
        hasher.update(&buf[..len]);
    }
    Digest::from_hasher(hasher)
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::time::Duration;

    use futures_util::TryStreamExt;

    use super::*;

    fn file_test(size: u64) -> FileTest {
        FileTest {
            size,
            parallelism: 2,
            seed: 1234,
            timeout: Duration::from_secs(1),
        }
    }

    fn read_all(mut payload: Payload) -> Vec<u8> {
        let mut contents = Vec::new();
        payload.read_to_end(&mut contents).unwrap();
        contents
    }

    #[test]
    fn payloads_are_deterministic() {
        let test = file_test(10_000);
        let first = read_all(Payload::for_worker(&test, 0));
        let second = read_all(Payload::for_worker(&test, 0));

        assert_eq!(first.len(), 10_000);
        assert_eq!(first, second);
    }

    #[test]
    fn workers_get_distinct_payloads() {
        let test = file_test(64);
        assert_ne!(
            read_all(Payload::for_worker(&test, 0)),
            read_all(Payload::for_worker(&test, 1))
        );
    }

    #[tokio::test]
    async fn stream_matches_reader() {
        let test = file_test(100_000);
        let chunks: Vec<_> = Payload::for_worker(&test, 1)
            .into_stream()
            .try_collect()
            .await
            .unwrap();
        let streamed: Vec<u8> = chunks.concat();

        assert_eq!(streamed, read_all(Payload::for_worker(&test, 1)));
    }

    #[test]
    fn expected_digest_hashes_payload() {
        let test = file_test(4096);
        let contents = read_all(Payload::for_worker(&test, 0));
        let mut hasher = Sha256::new();
        hasher.update(&contents);

        assert_eq!(expected_digest(&test, 0), Digest::from_hasher(hasher));
        assert_eq!(expected_digest(&test, 0).to_string().len(), 64);
    }

    #[test]
    fn empty_payload() {
        let test = file_test(0);
        assert!(read_all(Payload::for_worker(&test, 0)).is_empty());
    }
}
