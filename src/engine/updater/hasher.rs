//! Content Hashing
//!
//! Streaming digests over files, readers and chunk streams, plus a bounded
//! fan-out that lets one byte stream feed several consumers (a hasher and an
//! archive extractor) without buffering the whole payload.

use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use sha2::{Digest, Sha256, Sha512};
use std::fs::File;
use std::future::Future;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Sha512,
}

enum DigestState {
    Sha256(Sha256),
    Sha512(Sha512),
}

/// Incremental hasher producing a lowercase hex digest.
pub struct ContentHasher {
    state: DigestState,
    bytes: u64,
}

impl ContentHasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        let state = match algorithm {
            HashAlgorithm::Sha256 => DigestState::Sha256(Sha256::new()),
            HashAlgorithm::Sha512 => DigestState::Sha512(Sha512::new()),
        };
        Self { state, bytes: 0 }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.bytes += data.len() as u64;
        match &mut self.state {
            DigestState::Sha256(h) => h.update(data),
            DigestState::Sha512(h) => h.update(data),
        }
    }

    /// Number of bytes fed so far.
    pub fn bytes_hashed(&self) -> u64 {
        self.bytes
    }

    pub fn finalize(self) -> String {
        match self.state {
            DigestState::Sha256(h) => hex::encode(h.finalize()),
            DigestState::Sha512(h) => hex::encode(h.finalize()),
        }
    }

    /// Consume a reader to completion and return its digest.
    pub fn hash_reader<R: Read>(mut reader: R, algorithm: HashAlgorithm) -> io::Result<String> {
        let mut hasher = Self::new(algorithm);
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }
        Ok(hasher.finalize())
    }

    /// Hash a file on disk.
    pub fn hash_file(path: &Path, algorithm: HashAlgorithm) -> io::Result<String> {
        let file = File::open(path)?;
        Self::hash_reader(BufReader::new(file), algorithm)
    }

    /// Consume a fan-out branch to completion.
    ///
    /// Returns the digest and the number of bytes seen. An error forwarded by
    /// the pump ends the computation with that error.
    pub async fn hash_chunks(
        mut chunks: ChunkReceiver,
        algorithm: HashAlgorithm,
    ) -> io::Result<(String, u64)> {
        let mut hasher = Self::new(algorithm);
        while let Some(chunk) = chunks.next_chunk().await {
            hasher.update(&chunk?);
        }
        let bytes = hasher.bytes_hashed();
        Ok((hasher.finalize(), bytes))
    }
}

/// Compare two hex digests ignoring case.
pub fn digests_match(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Writer adapter that hashes everything passing through it.
pub struct HashingWriter<W> {
    inner: W,
    hasher: ContentHasher,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W, algorithm: HashAlgorithm) -> Self {
        Self {
            inner,
            hasher: ContentHasher::new(algorithm),
        }
    }

    /// Flush and return the inner writer, byte count and digest.
    pub fn finish(mut self) -> io::Result<(W, u64, String)> {
        self.inner.flush()?;
        let bytes = self.hasher.bytes_hashed();
        Ok((self.inner, bytes, self.hasher.finalize()))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

type Chunk = Arc<Vec<u8>>;

/// One consumer's view of a fanned-out stream.
pub struct ChunkReceiver {
    rx: mpsc::Receiver<io::Result<Chunk>>,
}

impl ChunkReceiver {
    /// Next chunk, or `None` once the source is exhausted.
    pub async fn next_chunk(&mut self) -> Option<io::Result<Chunk>> {
        self.rx.recv().await
    }

    /// Turn this branch into a blocking `Read` for use on a blocking thread.
    ///
    /// The returned reader must not be driven from inside an async context.
    pub fn into_blocking_reader(self) -> ChunkReader {
        ChunkReader {
            rx: self.rx,
            current: None,
            pos: 0,
        }
    }
}

/// Blocking reader over a fan-out branch.
pub struct ChunkReader {
    rx: mpsc::Receiver<io::Result<Chunk>>,
    current: Option<Chunk>,
    pos: usize,
}

impl Read for ChunkReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if let Some(chunk) = &self.current {
                if self.pos < chunk.len() {
                    let n = buf.len().min(chunk.len() - self.pos);
                    buf[..n].copy_from_slice(&chunk[self.pos..self.pos + n]);
                    self.pos += n;
                    return Ok(n);
                }
            }
            match self.rx.blocking_recv() {
                Some(Ok(chunk)) => {
                    self.current = Some(chunk);
                    self.pos = 0;
                }
                Some(Err(e)) => return Err(e),
                None => return Ok(0),
            }
        }
    }
}

/// Split one byte stream into `consumers` identical bounded streams.
///
/// The returned future pumps the source and must be polled for any consumer
/// to make progress. Each chunk is delivered to every live consumer in order
/// before the next chunk is read, so a slow consumer throttles the source
/// instead of letting the others run ahead. A consumer that hangs up is
/// skipped from then on. A source error is forwarded to every live consumer
/// and returned by the pump. The pump resolves to the number of source bytes.
pub fn fan_out<S>(
    source: S,
    consumers: usize,
    depth: usize,
) -> (impl Future<Output = io::Result<u64>> + Send, Vec<ChunkReceiver>)
where
    S: Stream<Item = io::Result<Vec<u8>>> + Send + Unpin,
{
    let mut senders = Vec::with_capacity(consumers);
    let mut receivers = Vec::with_capacity(consumers);
    for _ in 0..consumers {
        let (tx, rx) = mpsc::channel(depth.max(1));
        senders.push(Some(tx));
        receivers.push(ChunkReceiver { rx });
    }

    let pump = async move {
        let mut source = source;
        let mut total = 0u64;
        while let Some(item) = source.next().await {
            match item {
                Ok(bytes) => {
                    total += bytes.len() as u64;
                    let chunk: Chunk = Arc::new(bytes);
                    for slot in senders.iter_mut() {
                        if let Some(tx) = slot {
                            if tx.send(Ok(chunk.clone())).await.is_err() {
                                *slot = None;
                            }
                        }
                    }
                    if senders.iter().all(Option::is_none) {
                        break;
                    }
                }
                Err(e) => {
                    for tx in senders.iter().flatten() {
                        let _ = tx.send(Err(io::Error::new(e.kind(), e.to_string()))).await;
                    }
                    return Err(e);
                }
            }
        }
        Ok(total)
    };

    (pump, receivers)
}

/// Read an async source as a stream of owned chunks.
pub fn read_chunks<R>(reader: R, chunk_size: usize) -> BoxStream<'static, io::Result<Vec<u8>>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let chunk_size = chunk_size.max(1);
    stream::unfold(Some(reader), move |state| async move {
        let mut reader = state?;
        let mut buffer = vec![0u8; chunk_size];
        match reader.read(&mut buffer).await {
            Ok(0) => None,
            Ok(n) => {
                buffer.truncate(n);
                Some((Ok(buffer), Some(reader)))
            }
            Err(e) => Some((Err(e), None)),
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::NamedTempFile;

    const HELLO_WORLD_SHA256: &str =
        "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    fn chunked(data: &[u8], size: usize) -> Vec<io::Result<Vec<u8>>> {
        data.chunks(size).map(|c| Ok(c.to_vec())).collect()
    }

    #[test]
    fn test_hash_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"hello world").unwrap();
        file.flush().unwrap();

        let digest = ContentHasher::hash_file(file.path(), HashAlgorithm::Sha256).unwrap();
        assert_eq!(digest, HELLO_WORLD_SHA256);
    }

    #[test]
    fn test_sha512_differs_from_sha256() {
        let a = ContentHasher::hash_reader(&b"abc"[..], HashAlgorithm::Sha256).unwrap();
        let b = ContentHasher::hash_reader(&b"abc"[..], HashAlgorithm::Sha512).unwrap();
        assert_eq!(a.len(), 64);
        assert_eq!(b.len(), 128);
    }

    #[test]
    fn test_hashing_writer_passes_bytes_through() {
        let mut writer = HashingWriter::new(Vec::new(), HashAlgorithm::Sha256);
        writer.write_all(b"hello ").unwrap();
        writer.write_all(b"world").unwrap();
        let (inner, bytes, digest) = writer.finish().unwrap();
        assert_eq!(inner, b"hello world");
        assert_eq!(bytes, 11);
        assert_eq!(digest, HELLO_WORLD_SHA256);
        assert!(digests_match(&digest, &HELLO_WORLD_SHA256.to_uppercase()));
    }

    #[tokio::test]
    async fn test_fan_out_consumers_see_identical_bytes() {
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let source = stream::iter(chunked(&payload, 4096));
        let (pump, mut branches) = fan_out(source, 2, 2);
        let second = branches.pop().unwrap();
        let first = branches.pop().unwrap();

        let collect = |mut rx: ChunkReceiver| async move {
            let mut out = Vec::new();
            while let Some(chunk) = rx.next_chunk().await {
                out.extend_from_slice(&chunk.unwrap());
            }
            out
        };

        let (total, a, b) = tokio::join!(pump, collect(first), collect(second));
        assert_eq!(total.unwrap(), payload.len() as u64);
        assert_eq!(a, payload);
        assert_eq!(b, payload);
    }

    #[tokio::test]
    async fn test_dropped_consumer_does_not_stall_others() {
        let payload = vec![7u8; 50_000];
        let source = stream::iter(chunked(&payload, 1000));
        let (pump, mut branches) = fan_out(source, 2, 1);
        let hashed = branches.pop().unwrap();
        drop(branches);

        let (total, digest) =
            tokio::join!(pump, ContentHasher::hash_chunks(hashed, HashAlgorithm::Sha256));
        assert_eq!(total.unwrap(), 50_000);
        let (digest, bytes) = digest.unwrap();
        assert_eq!(bytes, 50_000);
        assert_eq!(
            digest,
            ContentHasher::hash_reader(&payload[..], HashAlgorithm::Sha256).unwrap()
        );
    }

    #[tokio::test]
    async fn test_source_error_reaches_every_consumer() {
        let items = vec![
            Ok(b"partial".to_vec()),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
        ];
        let (pump, mut branches) = fan_out(stream::iter(items), 2, 4);
        let b = branches.pop().unwrap();
        let a = branches.pop().unwrap();

        let (pumped, ra, rb) = tokio::join!(
            pump,
            ContentHasher::hash_chunks(a, HashAlgorithm::Sha256),
            ContentHasher::hash_chunks(b, HashAlgorithm::Sha256)
        );
        assert_eq!(pumped.unwrap_err().kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(ra.unwrap_err().kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(rb.unwrap_err().kind(), io::ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn test_blocking_reader_branch() {
        let payload = b"hello world".to_vec();
        let (pump, mut branches) = fan_out(stream::iter(chunked(&payload, 3)), 1, 1);
        let reader = branches.pop().unwrap().into_blocking_reader();
        let read = tokio::task::spawn_blocking(move || {
            ContentHasher::hash_reader(reader, HashAlgorithm::Sha256)
        });
        let (total, digest) = tokio::join!(pump, read);
        assert_eq!(total.unwrap(), 11);
        assert_eq!(digest.unwrap().unwrap(), HELLO_WORLD_SHA256);
    }

    #[tokio::test]
    async fn test_read_chunks_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"hello world").unwrap();
        file.flush().unwrap();

        let handle = tokio::fs::File::open(file.path()).await.unwrap();
        let chunks: Vec<_> = read_chunks(handle, 4).collect().await;
        let joined: Vec<u8> = chunks.into_iter().flat_map(|c| c.unwrap()).collect();
        assert_eq!(joined, b"hello world");
    }
}
