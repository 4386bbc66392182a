//! Streaming compression for archive uploads.
//!
//! Sources are fed through a chunked encoder so encoder state stays bounded
//! regardless of input size. A hard cap on staged input bytes turns oversized
//! sources into a distinguished [`CompressError::Truncated`] outcome: the
//! bytes written so far form a valid frame and the caller decides whether a
//! partial upload is acceptable.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Encoder state is flushed at this boundary.
const MAX_CHUNK_SIZE: usize = 8 << 20;

/// Default cap on staged input bytes per [`compress`] call.
pub const DEFAULT_MAX_WRITER_BUF_SIZE: usize = 16 << 20;

/// Buffers larger than this are not returned to a [`BufferPool`].
const MAX_POOLED_BUF_SIZE: usize = 1 << 20;

const READ_CHUNK: usize = 4096;

/// zstd level tuned for throughput over ratio; log payloads recompress well
/// downstream if needed.
const ZSTD_LEVEL: i32 = 1;

/// Compression algorithm selection, keyed by the config string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Algorithm {
    /// No compression; the output layer uploads the source as-is.
    #[default]
    #[serde(rename = "")]
    None,
    /// Zstandard frame format.
    #[serde(rename = "zstd")]
    Zstd,
    /// LZ4 frame format.
    #[serde(rename = "lz4")]
    Lz4,
}

impl Algorithm {
    /// File suffix appended to destination keys for this algorithm.
    pub fn suffix(&self) -> &'static str {
        match self {
            Algorithm::None => "",
            Algorithm::Zstd => ".zst",
            Algorithm::Lz4 => ".lz4",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Algorithm::None)
    }
}

/// Result alias for compression operations.
pub type CompressResult<T> = Result<T, CompressError>;

/// Error variants for compression operations.
#[derive(Debug, Error)]
pub enum CompressError {
    /// The staged input exceeded [`Options::max_writer_buf_size`] before the
    /// source was exhausted. The encoder was finished gracefully, so the
    /// output holds a valid frame of the input prefix.
    #[error("unexpected EOF: staged input exceeds the writer buffer cap")]
    Truncated,

    /// The requested algorithm has no streaming encoder.
    #[error("unsupported compress algorithm")]
    UnsupportedAlgorithm,

    /// I/O error from the source, the sink, or the encoder.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An error occurred and closing the encoder failed as well.
    #[error("{source}; encoder close error: {close}")]
    CloseFailed {
        /// The original error.
        source: Box<CompressError>,
        /// The error raised while closing the encoder.
        close: std::io::Error,
    },
}

impl CompressError {
    /// True for the distinguished partial-output outcome.
    pub fn is_truncated(&self) -> bool {
        match self {
            CompressError::Truncated => true,
            CompressError::CloseFailed { source, .. } => source.is_truncated(),
            _ => false,
        }
    }
}

/// Per-call compression options.
#[derive(Debug, Clone)]
pub struct Options {
    pub algorithm: Algorithm,
    /// Cap on staged input bytes; `0` disables the cap.
    pub max_writer_buf_size: usize,
}

impl Options {
    /// Options with the default staging cap.
    pub fn new(algorithm: Algorithm) -> Self {
        Self {
            algorithm,
            max_writer_buf_size: DEFAULT_MAX_WRITER_BUF_SIZE,
        }
    }
}

/// Compress `reader` into `writer` with the configured algorithm.
///
/// Returns [`CompressError::Truncated`] once `max_writer_buf_size` input
/// bytes have been staged without reaching EOF; everything staged up to that
/// point is encoded and the frame is closed before returning.
pub fn compress<R: Read, W: Write>(reader: R, writer: W, opts: &Options) -> CompressResult<()> {
    match opts.algorithm {
        Algorithm::Zstd => {
            let enc = zstd::stream::write::Encoder::new(writer, ZSTD_LEVEL)?;
            stream_chunks(reader, enc, opts.max_writer_buf_size, |enc| {
                enc.finish().map(|_| ())
            })
        }
        Algorithm::Lz4 => {
            let enc = lz4_flex::frame::FrameEncoder::new(writer);
            stream_chunks(reader, enc, opts.max_writer_buf_size, |enc| {
                enc.finish().map(|_| ()).map_err(std::io::Error::other)
            })
        }
        Algorithm::None => Err(CompressError::UnsupportedAlgorithm),
    }
}

/// Open `path` and compress it into `writer`.
pub fn compress_file<W: Write>(path: &Path, opts: &Options, writer: W) -> CompressResult<()> {
    let file = File::open(path)?;
    compress(file, writer, opts)
}

/// Drives the chunked encode loop shared by both codecs.
///
/// Input is staged and handed to the encoder at ~8 MiB boundaries; `finish`
/// closes the frame. On error the frame is still closed so the sink is never
/// left mid-frame, and a close failure is reported alongside the original
/// error.
fn stream_chunks<R, E, F>(mut reader: R, mut enc: E, cap: usize, finish: F) -> CompressResult<()>
where
    R: Read,
    E: Write,
    F: FnOnce(E) -> std::io::Result<()>,
{
    let mut staging: Vec<u8> = Vec::with_capacity(MAX_CHUNK_SIZE.min(cap.max(READ_CHUNK)));
    let mut chunk = [0u8; READ_CHUNK];
    let mut staged_total = 0usize;

    let result = loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => break Ok(()),
            Ok(n) => n,
            Err(e) => break Err(CompressError::Io(e)),
        };
        staging.extend_from_slice(&chunk[..n]);
        staged_total += n;

        // limit memory usage
        if cap > 0 && staged_total > cap {
            break Err(CompressError::Truncated);
        }

        if staging.len() >= MAX_CHUNK_SIZE {
            if let Err(e) = drain_staging(&mut enc, &mut staging) {
                break Err(CompressError::Io(e));
            }
        }
    };

    match result {
        Ok(()) | Err(CompressError::Truncated) => {
            if !staging.is_empty() {
                if let Err(e) = drain_staging(&mut enc, &mut staging) {
                    return Err(close_with(CompressError::Io(e), enc, finish));
                }
            }
            match finish(enc) {
                Ok(()) => result,
                Err(close) => match result {
                    Ok(()) => Err(CompressError::Io(close)),
                    Err(source) => Err(CompressError::CloseFailed {
                        source: Box::new(source),
                        close,
                    }),
                },
            }
        }
        Err(e) => Err(close_with(e, enc, finish)),
    }
}

fn drain_staging<E: Write>(enc: &mut E, staging: &mut Vec<u8>) -> std::io::Result<()> {
    enc.write_all(staging)?;
    staging.clear();
    enc.flush()
}

fn close_with<E, F>(err: CompressError, enc: E, finish: F) -> CompressError
where
    F: FnOnce(E) -> std::io::Result<()>,
{
    match finish(enc) {
        Ok(()) => err,
        Err(close) => CompressError::CloseFailed {
            source: Box::new(err),
            close,
        },
    }
}

/// Reusable byte buffers for compressed output.
///
/// The pool only ever holds `Vec<u8>`, so returning a foreign object to it is
/// a type error. Buffers that grew past 1 MiB are dropped on return to bound
/// resident memory.
#[derive(Debug, Default)]
pub struct BufferPool {
    bufs: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a cleared buffer from the pool, or allocate a fresh one.
    pub fn get(&self) -> Vec<u8> {
        self.bufs.lock().unwrap().pop().unwrap_or_default()
    }

    /// Return a buffer. Oversized buffers are dropped.
    pub fn put(&self, mut buf: Vec<u8>) {
        if buf.capacity() > MAX_POOLED_BUF_SIZE {
            return;
        }
        buf.clear();
        self.bufs.lock().unwrap().push(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn zstd_roundtrip(data: &[u8], opts: &Options) -> (CompressResult<()>, Vec<u8>) {
        let mut out = Vec::new();
        let res = compress(data, &mut out, opts);
        let decoded = zstd::decode_all(&out[..]).unwrap();
        (res, decoded)
    }

    #[test]
    fn suffix_per_algorithm() {
        assert_eq!(Algorithm::None.suffix(), "");
        assert_eq!(Algorithm::Zstd.suffix(), ".zst");
        assert_eq!(Algorithm::Lz4.suffix(), ".lz4");
    }

    #[test]
    fn algorithm_decodes_from_config_strings() {
        assert_eq!(
            serde_yaml::from_str::<Algorithm>("\"\"").unwrap(),
            Algorithm::None
        );
        assert_eq!(
            serde_yaml::from_str::<Algorithm>("zstd").unwrap(),
            Algorithm::Zstd
        );
        assert_eq!(
            serde_yaml::from_str::<Algorithm>("lz4").unwrap(),
            Algorithm::Lz4
        );
        assert!(serde_yaml::from_str::<Algorithm>("gzip").is_err());
    }

    #[test]
    fn none_algorithm_is_rejected_without_touching_writer() {
        let mut out = Vec::new();
        let err = compress(&b"abc"[..], &mut out, &Options::new(Algorithm::None)).unwrap_err();
        assert!(matches!(err, CompressError::UnsupportedAlgorithm));
        assert!(out.is_empty());
    }

    #[test]
    fn zstd_roundtrips() {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(100);
        let (res, decoded) = zstd_roundtrip(&data, &Options::new(Algorithm::Zstd));
        res.unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn lz4_roundtrips() {
        let data = b"0123456789abcdef".repeat(1000);
        let mut out = Vec::new();
        compress(&data[..], &mut out, &Options::new(Algorithm::Lz4)).unwrap();
        let mut decoded = Vec::new();
        lz4_flex::frame::FrameDecoder::new(&out[..])
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn empty_input_produces_valid_empty_frame() {
        let (res, decoded) = zstd_roundtrip(&[], &Options::new(Algorithm::Zstd));
        res.unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn oversized_input_truncates_to_a_valid_prefix() {
        let data: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
        let opts = Options {
            algorithm: Algorithm::Zstd,
            max_writer_buf_size: 16 * 1024,
        };
        let (res, decoded) = zstd_roundtrip(&data, &opts);
        assert!(res.unwrap_err().is_truncated());
        // Everything staged before the cap tripped is in the frame.
        assert!(decoded.len() > opts.max_writer_buf_size);
        assert!(decoded.len() < data.len());
        assert_eq!(decoded, data[..decoded.len()]);
    }

    #[test]
    fn input_at_the_cap_is_not_truncated() {
        let data = vec![7u8; 16 * 1024];
        let opts = Options {
            algorithm: Algorithm::Zstd,
            max_writer_buf_size: 16 * 1024,
        };
        let (res, decoded) = zstd_roundtrip(&data, &opts);
        res.unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn zero_cap_disables_truncation() {
        let data = vec![1u8; 128 * 1024];
        let opts = Options {
            algorithm: Algorithm::Zstd,
            max_writer_buf_size: 0,
        };
        let (res, decoded) = zstd_roundtrip(&data, &opts);
        res.unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn default_cap_is_sixteen_mib() {
        let opts = Options::new(Algorithm::Zstd);
        assert_eq!(opts.max_writer_buf_size, 16 << 20);
    }

    #[test]
    fn compress_file_missing_path_is_io_error() {
        let err = compress_file(
            Path::new("/nonexistent/input.log"),
            &Options::new(Algorithm::Zstd),
            Vec::new(),
        )
        .unwrap_err();
        assert!(matches!(err, CompressError::Io(_)));
    }

    #[test]
    fn compress_file_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.log");
        std::fs::write(&path, b"line one\nline two\n").unwrap();

        let mut out = Vec::new();
        compress_file(&path, &Options::new(Algorithm::Zstd), &mut out).unwrap();
        assert_eq!(zstd::decode_all(&out[..]).unwrap(), b"line one\nline two\n");
    }

    #[test]
    fn buffer_pool_reuses_small_buffers() {
        let pool = BufferPool::new();
        let mut buf = pool.get();
        buf.extend_from_slice(b"payload");
        pool.put(buf);

        let again = pool.get();
        assert!(again.is_empty());
        assert!(again.capacity() > 0);
    }

    #[test]
    fn buffer_pool_drops_oversized_buffers() {
        let pool = BufferPool::new();
        pool.put(vec![0u8; 2 << 20]);
        assert_eq!(pool.get().capacity(), 0);
    }

    proptest! {
        #[test]
        fn prop_zstd_roundtrip(data in prop::collection::vec(any::<u8>(), 0..100_000)) {
            let (res, decoded) = zstd_roundtrip(&data, &Options::new(Algorithm::Zstd));
            prop_assert!(res.is_ok());
            prop_assert_eq!(decoded, data);
        }

        #[test]
        fn prop_lz4_roundtrip(data in prop::collection::vec(any::<u8>(), 0..100_000)) {
            let mut out = Vec::new();
            compress(&data[..], &mut out, &Options::new(Algorithm::Lz4)).unwrap();
            let mut decoded = Vec::new();
            lz4_flex::frame::FrameDecoder::new(&out[..]).read_to_end(&mut decoded).unwrap();
            prop_assert_eq!(decoded, data);
        }
    }
}
