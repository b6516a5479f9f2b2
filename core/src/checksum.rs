//! Checksum / compress adapters. The CRC-32C primitive and
//! the zlib codec are themselves out of scope; this module is
//! the thin, named contract the rest of the core calls through the `crc32c`
//! and `flate2` crates, the same pairing a filesystem reader driver uses
//! for on-disk block checksums and transparent compression.

use crate::error::{Error, Result};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Sets `buf[0..csum_size]` to `CRC32C(~0, buf[csum_size..len])` serialised
/// little-endian. `csum_size` is almost always 4 (a plain `u32` CRC); it is
/// a parameter because free-space v1 pages and metadata blocks share this
/// routine with different header shapes.
pub fn csum_block(buf: &mut [u8], csum_size: usize) {
    debug_assert!(buf.len() >= csum_size);
    let crc = crc32c::crc32c(&buf[csum_size..]);
    buf[..csum_size.min(4)].copy_from_slice(&crc.to_le_bytes()[..csum_size.min(4)]);
}

/// Computes `CRC32C(seed, data)` without mutating anything. `seed` lets
/// callers reproduce the tool's two historical seeds: `!0` for on-disk
/// block checksums and `!1` for the name-hash / CRC-utility contract used
/// by the metadump sanitiser's collision search.
pub fn crc32c_seeded(seed: u32, data: &[u8]) -> u32 {
    crc32c::crc32c_append(seed, data)
}

/// Verifies the stored checksum at the head of `buf` against the computed
/// one, returning `Ok(())` or `Error::ChecksumMismatch`.
pub fn verify_csum(buf: &[u8], csum_size: usize, bytenr: u64) -> Result<()> {
    debug_assert!(buf.len() >= csum_size);
    let stored = {
        let mut b = [0u8; 4];
        b[..csum_size.min(4)].copy_from_slice(&buf[..csum_size.min(4)]);
        u32::from_le_bytes(b)
    };
    let computed = crc32c::crc32c(&buf[csum_size..]);
    if stored != computed {
        return Err(Error::ChecksumMismatch {
            bytenr,
            expected: stored,
            found: computed,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressMethod {
    None,
    Zlib,
}

/// Compresses `input` at the given zlib level (0-9). `CompressMethod::None`
/// short-circuits to an identity copy so callers can always route through
/// this function regardless of whether compression was requested.
pub fn compress(input: &[u8], level: u32, method: CompressMethod) -> Result<Vec<u8>> {
    match method {
        CompressMethod::None => Ok(input.to_vec()),
        CompressMethod::Zlib => {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(level.min(9)));
            encoder
                .write_all(input)
                .map_err(|e| Error::Compress(e.to_string()))?;
            encoder.finish().map_err(|e| Error::Compress(e.to_string()))
        }
    }
}

/// Decompresses `input` into a buffer capped at `out_cap` bytes. Fails with
/// `Error::Compress` if the stream is malformed or would overflow the cap.
pub fn decompress(input: &[u8], out_cap: usize, method: CompressMethod) -> Result<Vec<u8>> {
    match method {
        CompressMethod::None => {
            if input.len() > out_cap {
                return Err(Error::Compress(format!(
                    "decompressed size {} exceeds cap {}",
                    input.len(),
                    out_cap
                )));
            }
            Ok(input.to_vec())
        }
        CompressMethod::Zlib => {
            let mut decoder = ZlibDecoder::new(input);
            let mut out = Vec::with_capacity(out_cap.min(1 << 20));
            let mut limited = (&mut decoder).take(out_cap as u64 + 1);
            limited
                .read_to_end(&mut out)
                .map_err(|e| Error::Compress(e.to_string()))?;
            if out.len() > out_cap {
                return Err(Error::Compress(format!(
                    "decompressed size exceeds cap {out_cap}"
                )));
            }
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csum_round_trips() {
        let mut buf = vec![0u8; 16];
        buf[4..].copy_from_slice(b"0123456789ab");
        csum_block(&mut buf, 4);
        assert!(verify_csum(&buf, 4, 0).is_ok());
        buf[8] ^= 0xff;
        assert!(verify_csum(&buf, 4, 0).is_err());
    }

    #[test]
    fn zlib_round_trips() {
        let input = b"the quick brown fox jumps over the lazy dog".repeat(20);
        let compressed = compress(&input, 6, CompressMethod::Zlib).unwrap();
        assert!(compressed.len() < input.len());
        let back = decompress(&compressed, input.len(), CompressMethod::Zlib).unwrap();
        assert_eq!(back, input);
    }

    #[test]
    fn decompress_rejects_oversized_cap() {
        let input = vec![1u8; 1000];
        let compressed = compress(&input, 6, CompressMethod::Zlib).unwrap();
        assert!(decompress(&compressed, 10, CompressMethod::Zlib).is_err());
    }
}
