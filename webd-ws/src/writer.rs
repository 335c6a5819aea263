//! Frame writing.

use crate::deflate;
use crate::error::Result;
use crate::frame::{apply_mask, encode_header, FrameHeader, Opcode, MAX_HEADER_LEN};
use crate::WsConfig;
use bytes::BytesMut;
use webd_x::{global_pool, Connection};

/// Messages below this size are not worth compressing.
pub(crate) const MIN_COMPRESS_SIZE: usize = 1024;

/// Writes one unfragmented message.
///
/// Data messages at or above [`MIN_COMPRESS_SIZE`] are deflated when
/// compression was negotiated (RSV1 set); control frames never are. In
/// masked (client) mode the mask key comes from the thread's CSPRNG and
/// caller-owned payloads are copied into a pooled buffer before the
/// in-place XOR so the caller's bytes are never mutated.
pub async fn write_message(
    conn: &Connection,
    cfg: &WsConfig,
    opcode: Opcode,
    payload: &[u8],
    masked: bool,
) -> Result<()> {
    let mut header = FrameHeader::new(opcode, payload.len() as u64);
    header.masked = masked;

    let mut compressed = None;
    if cfg.enable_compression && !opcode.is_control() && payload.len() >= MIN_COMPRESS_SIZE {
        let deflated = deflate::compress(payload)?;
        header.length = deflated.len() as u64;
        header.rsv1 = true;
        compressed = Some(deflated);
    }

    if masked {
        header.mask = rand::random();
    }

    let mut head = BytesMut::with_capacity(MAX_HEADER_LEN);
    encode_header(&header, &mut head);
    conn.write_all(&head).await?;

    if header.length == 0 {
        return Ok(());
    }

    match (masked, compressed) {
        (false, None) => conn.write_all(payload).await?,
        (false, Some(deflated)) => conn.write_all(&deflated).await?,
        (true, Some(mut deflated)) => {
            // The compressed buffer is ours; mask it in place.
            apply_mask(deflated.as_mut_slice(), header.mask);
            conn.write_all(&deflated).await?;
        }
        (true, None) => {
            let mut copy = global_pool().acquire(payload.len());
            copy.copy_from_slice_at(0, payload);
            apply_mask(copy.as_mut_slice(), header.mask);
            conn.write_all(&copy).await?;
        }
    }

    Ok(())
}
