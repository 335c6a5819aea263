//! Per-connection frame read loop.
//!
//! A `FrameSession` is installed as the connection's read handler after a
//! successful upgrade (or dial). Each readiness event drains the socket
//! into the connection buffer and decodes as many complete frames as are
//! present; an incomplete frame simply ends the pass until the next
//! event. Control frames are dispatched before the partial message they
//! interleave with is extended further.

use crate::assembler::Assembler;
use crate::error::Error;
use crate::frame::{apply_mask, parse_header, Opcode};
use crate::handler::{WsConn, WsHandler};
use crate::writer::write_message;
use crate::WsConfig;
use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use tracing::{debug, trace};
use webd_http::ReadHandler;
use webd_x::{ConnIo, Connection};

enum Step {
    Continue,
    CloseFrame,
    Fail(Error),
}

pub struct FrameSession {
    handler: Arc<dyn WsHandler>,
    cfg: Arc<WsConfig>,
    assembler: Assembler,
    ws: WsConn,
    close_emitted: bool,
}

impl FrameSession {
    pub fn new(
        conn: Arc<Connection>,
        handler: Arc<dyn WsHandler>,
        cfg: Arc<WsConfig>,
        masked: bool,
    ) -> Self {
        let assembler = Assembler::new(cfg.max_frame_size, cfg.enable_compression);
        let ws = WsConn::new(conn, cfg.clone(), masked);
        Self {
            handler,
            cfg,
            assembler,
            ws,
            close_emitted: false,
        }
    }

    /// Processes every complete frame currently buffered. Returns `Ok`
    /// when the pass is over and more events are expected; any `Err`
    /// means the connection is done.
    pub async fn serve(&mut self, io: &ConnIo) -> Result<(), Error> {
        loop {
            let mut reader = io.reader.lock().await;
            reader.try_fill()?;

            if !io.conn.is_active() {
                drop(reader);
                self.emit_close(None).await;
                return Err(Error::Closed);
            }

            if reader.buffered() == 0 {
                if reader.is_eof() {
                    drop(reader);
                    self.emit_close(None).await;
                    return Err(Error::Closed);
                }
                return Ok(());
            }

            let (header, header_len) = match parse_header(reader.buffer()) {
                Ok(Some(parsed)) => parsed,
                Ok(None) => {
                    if reader.is_eof() {
                        drop(reader);
                        self.emit_close(None).await;
                        return Err(Error::Closed);
                    }
                    return Ok(());
                }
                Err(err) => {
                    drop(reader);
                    return self.fail(io, err).await;
                }
            };

            if self.cfg.max_frame_size > 0 && header.length > self.cfg.max_frame_size {
                drop(reader);
                return self.fail(io, Error::FrameTooLarge).await;
            }

            let payload_len = header.length as usize;
            if reader.buffered() < header_len + payload_len {
                if reader.is_eof() {
                    drop(reader);
                    self.emit_close(None).await;
                    return Err(Error::Closed);
                }
                // Frame spans future events; keep what we have buffered.
                return Ok(());
            }

            trace!(
                opcode = ?header.opcode,
                len = header.length,
                fin = header.fin,
                "frame received"
            );

            reader.consume(header_len);

            let step = {
                let payload = &mut reader.buffer_mut()[..payload_len];
                if header.masked {
                    apply_mask(payload, header.mask);
                }
                let payload: &[u8] = payload;

                if header.opcode.is_control() {
                    match header.opcode {
                        Opcode::Ping => {
                            self.handler.on_ping(&self.ws, payload).await;
                            match write_message(
                                &io.conn,
                                &self.cfg,
                                Opcode::Pong,
                                payload,
                                self.ws.masked(),
                            )
                            .await
                            {
                                Ok(()) => Step::Continue,
                                Err(err) => Step::Fail(err),
                            }
                        }
                        Opcode::Pong => {
                            self.handler.on_pong(&self.ws, payload).await;
                            Step::Continue
                        }
                        _ => Step::CloseFrame,
                    }
                } else {
                    match self.assembler.process_frame(&header, payload) {
                        Ok(None) => Step::Continue,
                        Ok(Some(message)) => {
                            self.handler
                                .on_message(&self.ws, message.opcode, message.payload())
                                .await;
                            Step::Continue
                        }
                        Err(err) => Step::Fail(err),
                    }
                }
            };

            reader.consume(payload_len);
            drop(reader);

            match step {
                Step::Continue => continue,
                Step::CloseFrame => {
                    self.emit_close(None).await;
                    io.conn.close();
                    return Err(Error::Closed);
                }
                Step::Fail(err) => return self.fail(io, err).await,
            }
        }
    }

    async fn fail(&mut self, io: &ConnIo, err: Error) -> Result<(), Error> {
        debug!(error = %err, "websocket session failed");
        self.emit_close(Some(&err)).await;
        io.conn.close();
        Err(err)
    }

    pub(crate) async fn emit_close(&mut self, err: Option<&Error>) {
        if !self.close_emitted {
            self.close_emitted = true;
            self.handler.on_close(&self.ws, err).await;
        }
    }
}

#[async_trait]
impl ReadHandler for FrameSession {
    async fn on_readable(&mut self, io: &ConnIo) -> io::Result<()> {
        match self.serve(io).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_clean_close() => Err(io::ErrorKind::UnexpectedEof.into()),
            Err(Error::Io(e)) => Err(e),
            Err(err) => Err(io::Error::new(io::ErrorKind::InvalidData, err.to_string())),
        }
    }
}
