//! permessage-deflate support (RFC 7692).
//!
//! Negotiation always uses `client_no_context_takeover` and
//! `server_no_context_takeover`, so compression state never carries
//! across messages; the zlib contexts themselves are pooled and reset
//! between uses. Decompression appends the four-byte sync-flush tail the
//! sender stripped (RFC 7692 §7.2.2) and grows its pooled output buffer
//! geometrically, checking the size cap on every grow.

use crate::error::{Error, Result};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use once_cell::sync::Lazy;
use webd_x::{global_pool, Pool, PooledBuf, Reuse};

const DEFLATE_TAIL: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

struct Encoder(Compress);

impl Reuse for Encoder {
    fn reuse(&mut self) -> bool {
        self.0.reset();
        true
    }
}

struct Decoder(Decompress);

impl Reuse for Decoder {
    fn reuse(&mut self) -> bool {
        self.0.reset(false);
        true
    }
}

static ENCODER_POOL: Lazy<Pool<Encoder>> = Lazy::new(|| Pool::new(32));
static DECODER_POOL: Lazy<Pool<Decoder>> = Lazy::new(|| Pool::new(32));

/// Deflates `payload` into a pooled buffer (raw deflate, no zlib header).
pub fn compress(payload: &[u8]) -> Result<PooledBuf> {
    let mut encoder = ENCODER_POOL.get_or(|| Encoder(Compress::new(Compression::fast(), false)));

    let mut out = global_pool().acquire(payload.len().max(512));
    let mut consumed = 0usize;
    let mut written = 0usize;

    loop {
        if written == out.len() {
            let new_len = out.len() * 2;
            out = grow(out, written, new_len);
        }
        let before_in = encoder.0.total_in();
        let before_out = encoder.0.total_out();
        let status = encoder
            .0
            .compress(
                &payload[consumed..],
                &mut out.as_mut_slice()[written..],
                FlushCompress::Finish,
            )
            .map_err(|e| Error::Compression(e.to_string()))?;
        consumed += (encoder.0.total_in() - before_in) as usize;
        written += (encoder.0.total_out() - before_out) as usize;

        match status {
            Status::StreamEnd => break,
            Status::Ok | Status::BufError => {
                // Finish keeps producing until StreamEnd; both statuses
                // mean the output window was the limiting factor.
                continue;
            }
        }
    }

    out.truncate(written);
    ENCODER_POOL.put(encoder);
    Ok(out)
}

/// Inflates `payload`, appending the sync-flush tail first.
///
/// The decompressed size is capped at `limit` (0 = unlimited); exceeding
/// it fails with [`Error::DecompressionLimit`].
pub fn decompress(payload: &[u8], limit: u64) -> Result<PooledBuf> {
    let mut decoder = DECODER_POOL.get_or(|| Decoder(Decompress::new(false)));

    let mut out = global_pool().acquire((payload.len() * 2).max(4096));
    let mut written = 0usize;

    'inputs: for (is_tail, input) in [(false, payload), (true, &DEFLATE_TAIL[..])] {
        let mut consumed = 0usize;
        while consumed < input.len() {
            if written == out.len() {
                out = grow_capped(out, written, limit)?;
            }
            let before_in = decoder.0.total_in();
            let before_out = decoder.0.total_out();
            let flush = if is_tail {
                FlushDecompress::Sync
            } else {
                FlushDecompress::None
            };
            let status = decoder
                .0
                .decompress(&input[consumed..], &mut out.as_mut_slice()[written..], flush)
                .map_err(|e| Error::Compression(e.to_string()))?;
            consumed += (decoder.0.total_in() - before_in) as usize;
            written += (decoder.0.total_out() - before_out) as usize;

            if limit > 0 && written as u64 > limit {
                return Err(Error::DecompressionLimit);
            }

            match status {
                Status::StreamEnd => break 'inputs,
                Status::Ok => {}
                Status::BufError => {
                    if written == out.len() {
                        // Output window full; grown at the top of the loop.
                        continue;
                    }
                    if consumed >= input.len() {
                        // Needs more input; move to the next chunk.
                        break;
                    }
                }
            }
        }
    }

    out.truncate(written);
    DECODER_POOL.put(decoder);
    Ok(out)
}

fn grow(old: PooledBuf, used: usize, new_len: usize) -> PooledBuf {
    let mut bigger = global_pool().acquire(new_len.max(used + 1));
    bigger.as_mut_slice()[..used].copy_from_slice(&old[..used]);
    bigger
}

fn grow_capped(old: PooledBuf, used: usize, limit: u64) -> Result<PooledBuf> {
    let mut new_len = old.len().saturating_mul(2);
    if limit > 0 && new_len as u64 > limit {
        // One byte past the cap is enough to detect overflow.
        new_len = limit as usize + 1;
    }
    if new_len <= old.len() {
        return Err(Error::DecompressionLimit);
    }
    Ok(grow(old, used, new_len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compress_then_decompress_round_trips() {
        let payload = b"Hello World ".repeat(100);
        let compressed = compress(&payload).unwrap();
        assert!(!compressed.is_empty());
        let restored = decompress(&compressed, 0).unwrap();
        assert_eq!(restored.as_slice(), payload.as_slice());
    }

    #[test]
    fn repetitive_payloads_actually_shrink() {
        let payload = vec![b'a'; 16 * 1024];
        let compressed = compress(&payload).unwrap();
        assert!(compressed.len() < payload.len() / 4);
    }

    #[test]
    fn empty_payload_round_trips() {
        let compressed = compress(b"").unwrap();
        let restored = decompress(&compressed, 0).unwrap();
        assert!(restored.is_empty());
    }

    #[test]
    fn incompressible_data_round_trips() {
        // Pseudo-random bytes: deflate will expand these slightly, which
        // exercises the output-growth path.
        let payload: Vec<u8> = (0..8192u32)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 24) as u8)
            .collect();
        let compressed = compress(&payload).unwrap();
        let restored = decompress(&compressed, 0).unwrap();
        assert_eq!(restored.as_slice(), payload.as_slice());
    }

    #[test]
    fn decompression_limit_is_enforced() {
        let payload = vec![b'x'; 64 * 1024];
        let compressed = compress(&payload).unwrap();
        let err = decompress(&compressed, 1024).unwrap_err();
        assert!(matches!(err, Error::DecompressionLimit));
    }

    #[test]
    fn limit_exactly_at_size_passes() {
        let payload = vec![b'y'; 2048];
        let compressed = compress(&payload).unwrap();
        let restored = decompress(&compressed, 2048).unwrap();
        assert_eq!(restored.len(), 2048);
    }
}
