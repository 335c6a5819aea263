use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use webd::{config, runtime, telemetry, Engine, Server};
use webd_http::{Handler, Method, Request, ResponseWriter};
use webd_ws::{Opcode, WsConfig, WsConn, WsHandler};

fn main() -> Result<()> {
    let config = config::load_config()?;

    let rt = runtime::create_runtime(&config.runtime)?;
    rt.block_on(async move {
        let metrics = telemetry::init_telemetry(&config.telemetry, &config.logging)?;

        info!(network = ?config.network, "configuration loaded");

        let mut engine = Engine::new(Arc::new(DemoRoutes))
            .with_max_drain_size(config.engine.max_drain_size)
            .with_buffer_size(config.engine.buffer_size);
        if let Some(timeout) = config.engine.request_timeout() {
            engine = engine.with_request_timeout(timeout);
        }

        let server = Server::new(Arc::new(engine))
            .with_read_timeout(config.engine.read_timeout())
            .with_write_timeout(config.engine.write_timeout())
            .with_keep_alive_timeout(config.engine.keep_alive_timeout())
            .with_max_conns(config.engine.max_conns)
            .with_socket_config(webd::SocketConfig {
                reuse_port: config.network.reuse_port,
                backlog: config.network.backlog,
                recv_buffer_size: config.network.recv_buffer_size,
                send_buffer_size: config.network.send_buffer_size,
            });

        let handle = server
            .start(&config.network.bind_addr())
            .await
            .context("starting server")?;

        info!(addr = %handle.local_addr(), "serving");

        signal::ctrl_c()
            .await
            .context("installing Ctrl+C handler")?;
        info!("shutdown signal received");

        handle.shutdown().await;
        metrics.shutdown().await;

        Ok(())
    })
}

/// Example routes: a landing page, an echo endpoint, and a WebSocket
/// echo at `/ws`.
struct DemoRoutes;

#[async_trait]
impl Handler for DemoRoutes {
    async fn serve_http(&self, req: &mut Request, w: &mut ResponseWriter) {
        match req.path() {
            "/" => {
                let _ = w.write_str(
                    "webd example server\n\
                     GET  /      this page\n\
                     POST /echo  echoes the request body\n\
                     GET  /ws    websocket echo (permessage-deflate enabled)\n",
                );
            }
            "/echo" if req.method() == Method::Post => {
                let mut body = Vec::new();
                let mut chunk = [0u8; 4096];
                loop {
                    match req.body_mut().read(&mut chunk).await {
                        Ok(0) => break,
                        Ok(n) => body.extend_from_slice(&chunk[..n]),
                        Err(err) => {
                            warn!(error = %err, "echo body read failed");
                            w.write_header(400);
                            return;
                        }
                    }
                }
                if let Some(content_type) = req.header("content-type") {
                    w.set_header("Content-Type", content_type.to_string());
                }
                let _ = w.write(&body);
            }
            "/ws" => {
                let cfg = WsConfig::default().with_compression(true);
                if let Err(err) = webd_ws::upgrade(req, w, Arc::new(EchoWs), cfg).await {
                    warn!(error = %err, "websocket upgrade failed");
                    if !w.hijacked() {
                        w.write_header(400);
                    }
                }
            }
            _ => {
                w.write_header(404);
                let _ = w.write_str("not found\n");
            }
        }
    }
}

/// Echoes every data message back to the sender.
struct EchoWs;

#[async_trait]
impl WsHandler for EchoWs {
    async fn on_message(&self, conn: &WsConn, opcode: Opcode, payload: &[u8]) {
        let result = match opcode {
            Opcode::Text => match std::str::from_utf8(payload) {
                Ok(text) => conn.send_text(text).await,
                Err(_) => conn.send_binary(payload).await,
            },
            _ => conn.send_binary(payload).await,
        };
        if let Err(err) = result {
            warn!(error = %err, "websocket echo failed");
            conn.close();
        }
    }
}
