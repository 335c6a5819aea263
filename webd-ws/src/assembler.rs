//! Reassembly of fragmented messages.
//!
//! One assembler lives on each upgraded connection. Its buffer is
//! non-empty exactly while a fragmented message is in flight; when the
//! final fragment arrives the assembled payload is handed out once and
//! the buffer returns to the pool.

use crate::deflate;
use crate::error::{Error, Result};
use crate::frame::{FrameHeader, Opcode};
use webd_x::{global_pool, PooledBuf};

/// A complete logical message ready for delivery.
///
/// The payload is either a borrowed view into the caller's frame bytes
/// (single-frame fast path) or a pooled buffer (reassembled or
/// decompressed); either way it is only valid until the delivery
/// callback returns.
#[derive(Debug)]
pub struct Message<'a> {
    pub opcode: Opcode,
    payload: MessagePayload<'a>,
}

#[derive(Debug)]
enum MessagePayload<'a> {
    Borrowed(&'a [u8]),
    Owned(PooledBuf),
}

impl Message<'_> {
    pub fn payload(&self) -> &[u8] {
        match &self.payload {
            MessagePayload::Borrowed(data) => data,
            MessagePayload::Owned(buf) => buf.as_slice(),
        }
    }
}

pub struct Assembler {
    buffer: Option<PooledBuf>,
    compressed: bool,
    opcode: Opcode,
    max_frame_size: u64,
    compression_negotiated: bool,
}

impl Assembler {
    pub fn new(max_frame_size: u64, compression_negotiated: bool) -> Self {
        Self {
            buffer: None,
            compressed: false,
            opcode: Opcode::Text,
            max_frame_size,
            compression_negotiated,
        }
    }

    /// True while a fragmented message is being accumulated.
    pub fn in_progress(&self) -> bool {
        self.buffer.is_some()
    }

    /// Feeds one data/continuation frame. Returns the complete message
    /// when `FIN` closes it, `None` while fragments are still expected.
    pub fn process_frame<'a>(
        &mut self,
        header: &FrameHeader,
        payload: &'a [u8],
    ) -> Result<Option<Message<'a>>> {
        match self.buffer.take() {
            None => self.start_message(header, payload),
            Some(buf) => self.continue_message(buf, header, payload),
        }
    }

    fn start_message<'a>(
        &mut self,
        header: &FrameHeader,
        payload: &'a [u8],
    ) -> Result<Option<Message<'a>>> {
        if header.opcode == Opcode::Continuation {
            return Err(Error::UnexpectedContinuation);
        }

        self.compressed = header.rsv1 && self.compression_negotiated;
        self.opcode = header.opcode;

        if header.fin {
            if self.compressed {
                let decompressed = deflate::decompress(payload, self.max_frame_size)
                    .map_err(remap_decompress_err)?;
                return Ok(Some(Message {
                    opcode: self.opcode,
                    payload: MessagePayload::Owned(decompressed),
                }));
            }
            return Ok(Some(Message {
                opcode: self.opcode,
                payload: MessagePayload::Borrowed(payload),
            }));
        }

        // Fragmentation: copy the first fragment into a pooled buffer.
        let mut buf = global_pool().acquire(payload.len().max(512));
        buf.copy_from_slice_at(0, payload);
        buf.truncate(payload.len());
        self.buffer = Some(buf);
        Ok(None)
    }

    fn continue_message<'a>(
        &mut self,
        mut buf: PooledBuf,
        header: &FrameHeader,
        payload: &'a [u8],
    ) -> Result<Option<Message<'a>>> {
        if header.opcode != Opcode::Continuation {
            // buf drops back to the pool here.
            return Err(Error::ExpectedContinuation);
        }

        if self.max_frame_size > 0
            && (buf.len() as u64).saturating_add(payload.len() as u64) > self.max_frame_size
        {
            return Err(Error::MessageTooLarge);
        }

        let required = buf.len() + payload.len();
        if required > buf.capacity() {
            let mut bigger = global_pool().acquire(required.max(buf.capacity() * 2));
            bigger.copy_from_slice_at(0, &buf);
            bigger.truncate(buf.len());
            buf = bigger;
        }
        buf.extend_from_slice(payload);

        if !header.fin {
            self.buffer = Some(buf);
            return Ok(None);
        }

        if self.compressed {
            let decompressed = deflate::decompress(&buf, self.max_frame_size)
                .map_err(remap_decompress_err)?;
            return Ok(Some(Message {
                opcode: self.opcode,
                payload: MessagePayload::Owned(decompressed),
            }));
        }

        Ok(Some(Message {
            opcode: self.opcode,
            payload: MessagePayload::Owned(buf),
        }))
    }
}

fn remap_decompress_err(err: Error) -> Error {
    // A decompressed message over the cap is a message-size failure from
    // the caller's point of view.
    match err {
        Error::DecompressionLimit => Error::MessageTooLarge,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_frame(opcode: Opcode, fin: bool, len: u64) -> FrameHeader {
        let mut header = FrameHeader::new(opcode, len);
        header.fin = fin;
        header
    }

    #[test]
    fn single_frame_passes_through_borrowed() {
        let mut asm = Assembler::new(0, false);
        let msg = asm
            .process_frame(&data_frame(Opcode::Text, true, 5), b"hello")
            .unwrap()
            .expect("complete message");
        assert_eq!(msg.opcode, Opcode::Text);
        assert_eq!(msg.payload(), b"hello");
        assert!(!asm.in_progress());
    }

    #[test]
    fn fragments_concatenate_in_order() {
        let mut asm = Assembler::new(0, false);
        assert!(asm
            .process_frame(&data_frame(Opcode::Text, false, 6), b"Hello ")
            .unwrap()
            .is_none());
        assert!(asm.in_progress());
        assert!(asm
            .process_frame(&data_frame(Opcode::Continuation, false, 5), b"World")
            .unwrap()
            .is_none());
        let msg = asm
            .process_frame(&data_frame(Opcode::Continuation, true, 1), b"!")
            .unwrap()
            .expect("complete message");
        assert_eq!(msg.payload(), b"Hello World!");
        assert_eq!(msg.opcode, Opcode::Text);
        assert!(!asm.in_progress());
    }

    #[test]
    fn initial_continuation_is_rejected() {
        let mut asm = Assembler::new(0, false);
        let err = asm
            .process_frame(&data_frame(Opcode::Continuation, true, 1), b"x")
            .unwrap_err();
        assert!(matches!(err, Error::UnexpectedContinuation));
    }

    #[test]
    fn non_continuation_mid_message_is_rejected() {
        let mut asm = Assembler::new(0, false);
        asm.process_frame(&data_frame(Opcode::Text, false, 1), b"a")
            .unwrap();
        let err = asm
            .process_frame(&data_frame(Opcode::Text, true, 1), b"b")
            .unwrap_err();
        assert!(matches!(err, Error::ExpectedContinuation));
        assert!(!asm.in_progress(), "buffer must be recycled on error");
    }

    #[test]
    fn accumulated_size_cap_is_enforced() {
        let mut asm = Assembler::new(8, false);
        asm.process_frame(&data_frame(Opcode::Binary, false, 6), b"123456")
            .unwrap();
        let err = asm
            .process_frame(&data_frame(Opcode::Continuation, true, 6), b"789012")
            .unwrap_err();
        assert!(matches!(err, Error::MessageTooLarge));
    }

    #[test]
    fn growth_across_many_fragments_preserves_bytes() {
        let mut asm = Assembler::new(0, false);
        let chunk = vec![0xABu8; 400];
        asm.process_frame(&data_frame(Opcode::Binary, false, 400), &chunk)
            .unwrap();
        for _ in 0..8 {
            assert!(asm
                .process_frame(&data_frame(Opcode::Continuation, false, 400), &chunk)
                .unwrap()
                .is_none());
        }
        let msg = asm
            .process_frame(&data_frame(Opcode::Continuation, true, 400), &chunk)
            .unwrap()
            .expect("complete");
        assert_eq!(msg.payload().len(), 400 * 10);
        assert!(msg.payload().iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn compressed_single_frame_is_decompressed() {
        let payload = b"Hello World ".repeat(100);
        let compressed = crate::deflate::compress(&payload).unwrap();

        let mut asm = Assembler::new(0, true);
        let mut header = data_frame(Opcode::Text, true, compressed.len() as u64);
        header.rsv1 = true;
        let msg = asm
            .process_frame(&header, compressed.as_slice())
            .unwrap()
            .expect("complete");
        assert_eq!(msg.payload(), payload.as_slice());
    }

    #[test]
    fn compressed_fragmented_message_reassembles() {
        let payload = b"Hello World ".repeat(100); // 1200 bytes
        let compressed = crate::deflate::compress(&payload).unwrap();
        let split = compressed.len() / 2;

        let mut asm = Assembler::new(0, true);
        let mut first = data_frame(Opcode::Text, false, split as u64);
        first.rsv1 = true;
        assert!(asm
            .process_frame(&first, &compressed[..split])
            .unwrap()
            .is_none());
        let rest = data_frame(Opcode::Continuation, true, (compressed.len() - split) as u64);
        let msg = asm
            .process_frame(&rest, &compressed[split..])
            .unwrap()
            .expect("complete");
        assert_eq!(msg.payload().len(), 1200);
        assert_eq!(msg.payload(), payload.as_slice());
    }

    #[test]
    fn compressed_overflow_reports_message_too_large() {
        let payload = vec![b'z'; 32 * 1024];
        let compressed = crate::deflate::compress(&payload).unwrap();

        let mut asm = Assembler::new(1024, true);
        let mut header = data_frame(Opcode::Binary, true, compressed.len() as u64);
        header.rsv1 = true;
        let err = asm
            .process_frame(&header, compressed.as_slice())
            .unwrap_err();
        assert!(matches!(err, Error::MessageTooLarge));
    }

    #[test]
    fn rsv1_without_negotiation_is_passthrough() {
        let mut asm = Assembler::new(0, false);
        let mut header = data_frame(Opcode::Binary, true, 4);
        header.rsv1 = true;
        let msg = asm.process_frame(&header, b"\x01\x02\x03\x04").unwrap().expect("complete");
        assert_eq!(msg.payload(), b"\x01\x02\x03\x04");
    }
}
