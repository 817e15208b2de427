//! Codec adapters: stateless encode/decode into caller-owned buffers.
//!
//! # Identity rules
//! Every codec is identified by its frozen u16 wire ID
//! ([`CompressAlgo`]).  The ID set is closed; a reader that meets an ID this
//! build cannot supply MUST fail the block — no fallback decode.  LZO's ID
//! is reserved but unavailable here (the original archiver compiles LZO in
//! conditionally; this build does not carry the primitive).
//!
//! # Adapter contract
//! `encode(src, dst, level)` and `decode(src, dst)` write into the
//! caller-supplied buffer and return the bytes used.  Adapters keep no state
//! across calls.  The error surface is deliberately small:
//! [`CodecError::Enomem`] drives the transformer's one-shot fallback to the
//! default codec, [`CodecError::MemLimit`] is internal to the LZMA decoder's
//! memory-cap ladder, everything else is [`CodecError::Unknown`] and makes
//! the transformer keep the block uncompressed (encode) or zero-fill it
//! (decode).
//!
//! GZIP payloads are zlib streams, as in the original archiver.

use std::io::{Cursor, Read};

use thiserror::Error;

use crate::format::CompressAlgo;

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CodecError {
    /// The codec ran out of memory.  Triggers the transformer's single
    /// retry at the default algorithm when the request was stronger.
    #[error("codec out of memory")]
    Enomem,
    /// The decoder hit its configured memory cap (LZMA only).
    #[error("decoder memory limit exceeded")]
    MemLimit,
    /// The wire ID is valid but this build carries no primitive for it.
    #[error("codec {0} is not available in this build")]
    Unavailable(&'static str),
    /// Any primitive failure that does not map to the above.
    #[error("codec failure: {0}")]
    Unknown(String),
}

// ── Codec trait ──────────────────────────────────────────────────────────────

pub trait Codec: Send + Sync {
    fn algo(&self) -> CompressAlgo;
    /// Compress `src` into `dst`, returning the bytes written.
    fn encode(&self, src: &[u8], dst: &mut [u8], level: u8) -> Result<usize, CodecError>;
    /// Decompress `src` into `dst` (sized to the original length exactly),
    /// returning the bytes written.
    fn decode(&self, src: &[u8], dst: &mut [u8]) -> Result<usize, CodecError>;
}

/// Resolves wire IDs to codec instances.  The pipeline context carries a
/// provider so embedders (and tests) can interpose their own codecs; the
/// default is [`BuiltinCodecs`].
pub trait CodecProvider: Send + Sync {
    fn resolve(&self, algo: CompressAlgo) -> Result<Box<dyn Codec>, CodecError>;
}

/// The built-in registry.
pub struct BuiltinCodecs;

impl CodecProvider for BuiltinCodecs {
    fn resolve(&self, algo: CompressAlgo) -> Result<Box<dyn Codec>, CodecError> {
        get_codec(algo)
    }
}

/// Resolve a wire ID to a built-in codec.
pub fn get_codec(algo: CompressAlgo) -> Result<Box<dyn Codec>, CodecError> {
    match algo {
        CompressAlgo::None => Ok(Box::new(NoneCodec)),
        CompressAlgo::Lz4 => Ok(Box::new(Lz4Codec)),
        CompressAlgo::Lzo => Err(CodecError::Unavailable("lzo")),
        CompressAlgo::Gzip => Ok(Box::new(GzipCodec)),
        CompressAlgo::Zstd => Ok(Box::new(ZstdCodec)),
        CompressAlgo::Bzip2 => Ok(Box::new(Bzip2Codec)),
        CompressAlgo::Lzma => Ok(Box::new(LzmaCodec)),
    }
}

fn copy_into(src: &[u8], dst: &mut [u8]) -> Result<usize, CodecError> {
    if src.len() > dst.len() {
        return Err(CodecError::Unknown(format!(
            "output of {} bytes exceeds the {}-byte buffer",
            src.len(),
            dst.len()
        )));
    }
    dst[..src.len()].copy_from_slice(src);
    Ok(src.len())
}

// ── Built-in codec implementations ───────────────────────────────────────────

/// Verbatim store.
pub struct NoneCodec;

impl Codec for NoneCodec {
    fn algo(&self) -> CompressAlgo {
        CompressAlgo::None
    }
    fn encode(&self, src: &[u8], dst: &mut [u8], _level: u8) -> Result<usize, CodecError> {
        copy_into(src, dst)
    }
    fn decode(&self, src: &[u8], dst: &mut [u8]) -> Result<usize, CodecError> {
        copy_into(src, dst)
    }
}

pub struct GzipCodec;

impl Codec for GzipCodec {
    fn algo(&self) -> CompressAlgo {
        CompressAlgo::Gzip
    }

    fn encode(&self, src: &[u8], dst: &mut [u8], level: u8) -> Result<usize, CodecError> {
        use flate2::{Compress, Compression, FlushCompress, Status};
        let mut c = Compress::new(Compression::new(level.clamp(1, 9) as u32), true);
        match c.compress(src, dst, FlushCompress::Finish) {
            Ok(Status::StreamEnd) => Ok(c.total_out() as usize),
            Ok(_) => Err(CodecError::Unknown("zlib stream did not finish".into())),
            Err(e) => Err(CodecError::Unknown(e.to_string())),
        }
    }

    fn decode(&self, src: &[u8], dst: &mut [u8]) -> Result<usize, CodecError> {
        use flate2::{Decompress, FlushDecompress, Status};
        let mut d = Decompress::new(true);
        match d.decompress(src, dst, FlushDecompress::Finish) {
            Ok(Status::StreamEnd) => Ok(d.total_out() as usize),
            Ok(_) => Err(CodecError::Unknown("zlib stream did not finish".into())),
            Err(e) => Err(CodecError::Unknown(e.to_string())),
        }
    }
}

pub struct Bzip2Codec;

impl Codec for Bzip2Codec {
    fn algo(&self) -> CompressAlgo {
        CompressAlgo::Bzip2
    }

    fn encode(&self, src: &[u8], dst: &mut [u8], level: u8) -> Result<usize, CodecError> {
        let mut out = Vec::new();
        bzip2::read::BzEncoder::new(src, bzip2::Compression::new(level.clamp(1, 9) as u32))
            .read_to_end(&mut out)
            .map_err(|e| CodecError::Unknown(e.to_string()))?;
        copy_into(&out, dst)
    }

    fn decode(&self, src: &[u8], dst: &mut [u8]) -> Result<usize, CodecError> {
        let mut out = Vec::new();
        bzip2::read::BzDecoder::new(src)
            .read_to_end(&mut out)
            .map_err(|e| CodecError::Unknown(e.to_string()))?;
        copy_into(&out, dst)
    }
}

pub struct ZstdCodec;

impl Codec for ZstdCodec {
    fn algo(&self) -> CompressAlgo {
        CompressAlgo::Zstd
    }

    fn encode(&self, src: &[u8], dst: &mut [u8], level: u8) -> Result<usize, CodecError> {
        zstd::bulk::compress_to_buffer(src, dst, level.clamp(1, 19) as i32)
            .map_err(|e| CodecError::Unknown(e.to_string()))
    }

    fn decode(&self, src: &[u8], dst: &mut [u8]) -> Result<usize, CodecError> {
        zstd::bulk::decompress_to_buffer(src, dst)
            .map_err(|e| CodecError::Unknown(e.to_string()))
    }
}

pub struct Lz4Codec;

impl Codec for Lz4Codec {
    fn algo(&self) -> CompressAlgo {
        CompressAlgo::Lz4
    }

    fn encode(&self, src: &[u8], dst: &mut [u8], _level: u8) -> Result<usize, CodecError> {
        lz4_flex::block::compress_into(src, dst)
            .map_err(|e| CodecError::Unknown(e.to_string()))
    }

    fn decode(&self, src: &[u8], dst: &mut [u8]) -> Result<usize, CodecError> {
        lz4_flex::block::decompress_into(src, dst)
            .map_err(|e| CodecError::Unknown(e.to_string()))
    }
}

/// LZMA decode memory cap: starting value.
const LZMA_MEMLIMIT_START: usize = 96 * 1024 * 1024;
/// LZMA decode memory cap: raise step on MEMLIMIT.
const LZMA_MEMLIMIT_STEP: usize = 64 * 1024 * 1024;
/// LZMA decode memory cap: hard ceiling before surfacing ENOMEM.
const LZMA_MEMLIMIT_MAX: usize = 3 * 1024 * 1024 * 1024;

pub struct LzmaCodec;

impl LzmaCodec {
    fn decode_once(src: &[u8], memlimit: usize) -> Result<Vec<u8>, CodecError> {
        use lzma_rs::decompress::{Options, UnpackedSize};
        let mut out = Vec::new();
        let opts = Options {
            unpacked_size: UnpackedSize::ReadFromHeader,
            memlimit: Some(memlimit),
            ..Options::default()
        };
        match lzma_rs::lzma_decompress_with_options(&mut Cursor::new(src), &mut out, &opts) {
            Ok(()) => Ok(out),
            Err(lzma_rs::error::Error::LzmaError(msg))
                if msg.contains("memory limit") || msg.contains("memlimit") =>
            {
                Err(CodecError::MemLimit)
            }
            Err(e) => Err(CodecError::Unknown(e.to_string())),
        }
    }
}

impl Codec for LzmaCodec {
    fn algo(&self) -> CompressAlgo {
        CompressAlgo::Lzma
    }

    fn encode(&self, src: &[u8], dst: &mut [u8], _level: u8) -> Result<usize, CodecError> {
        let mut out = Vec::new();
        lzma_rs::lzma_compress(&mut Cursor::new(src), &mut out)
            .map_err(|e| CodecError::Unknown(e.to_string()))?;
        copy_into(&out, dst)
    }

    /// Decode with an increasing memory cap: start modest, raise on
    /// MEMLIMIT up to the ceiling, then surface ENOMEM.
    fn decode(&self, src: &[u8], dst: &mut [u8]) -> Result<usize, CodecError> {
        let mut memlimit = LZMA_MEMLIMIT_START;
        loop {
            match Self::decode_once(src, memlimit) {
                Ok(out) => return copy_into(&out, dst),
                Err(CodecError::MemLimit) if memlimit < LZMA_MEMLIMIT_MAX => {
                    memlimit += LZMA_MEMLIMIT_STEP;
                    tracing::debug!(memlimit, "raising lzma decoder memory limit");
                }
                Err(CodecError::MemLimit) => return Err(CodecError::Enomem),
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Scratch sized like the transformer sizes its compression buffer.
    fn scratch_for(len: usize) -> Vec<u8> {
        vec![0u8; len + len / 16 + 64 + 3]
    }

    fn round_trip(algo: CompressAlgo, data: &[u8]) {
        let codec = get_codec(algo).unwrap();
        let mut comp = scratch_for(data.len());
        let used = codec.encode(data, &mut comp, 6).unwrap();
        let mut back = vec![0u8; data.len()];
        let n = codec.decode(&comp[..used], &mut back).unwrap();
        assert_eq!(n, data.len(), "{} length", algo.name());
        assert_eq!(&back, data, "{} payload", algo.name());
    }

    fn compressible() -> Vec<u8> {
        b"the quick brown fox jumps over the lazy dog\n"
            .iter()
            .cycle()
            .take(50_000)
            .copied()
            .collect()
    }

    #[test]
    fn round_trip_each_builtin() {
        let data = compressible();
        for algo in [
            CompressAlgo::None,
            CompressAlgo::Lz4,
            CompressAlgo::Gzip,
            CompressAlgo::Zstd,
            CompressAlgo::Bzip2,
            CompressAlgo::Lzma,
        ] {
            round_trip(algo, &data);
        }
    }

    #[test]
    fn compressible_input_shrinks() {
        let data = compressible();
        for algo in [CompressAlgo::Gzip, CompressAlgo::Zstd, CompressAlgo::Bzip2] {
            let codec = get_codec(algo).unwrap();
            let mut comp = scratch_for(data.len());
            let used = codec.encode(&data, &mut comp, 6).unwrap();
            assert!(used < data.len() / 2, "{} only reached {used}", algo.name());
        }
    }

    #[test]
    fn lzo_is_reserved_but_unavailable() {
        assert!(matches!(
            get_codec(CompressAlgo::Lzo),
            Err(CodecError::Unavailable("lzo"))
        ));
        assert!(matches!(
            BuiltinCodecs.resolve(CompressAlgo::Lzo),
            Err(CodecError::Unavailable("lzo"))
        ));
    }

    #[test]
    fn corrupt_gzip_stream_is_an_error() {
        let codec = get_codec(CompressAlgo::Gzip).unwrap();
        let mut dst = vec![0u8; 128];
        assert!(codec.decode(b"\x01\x02\x03\x04not-zlib", &mut dst).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]
        #[test]
        fn prop_round_trip_fast_codecs(data in proptest::collection::vec(any::<u8>(), 1..4096)) {
            for algo in [CompressAlgo::Lz4, CompressAlgo::Gzip, CompressAlgo::Zstd] {
                let codec = get_codec(algo).unwrap();
                let mut comp = scratch_for(data.len());
                let used = codec.encode(&data, &mut comp, 3).unwrap();
                let mut back = vec![0u8; data.len()];
                let n = codec.decode(&comp[..used], &mut back).unwrap();
                prop_assert_eq!(n, data.len());
                prop_assert_eq!(&back, &data);
            }
        }
    }
}
