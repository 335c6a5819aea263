//! End-to-end HTTP tests against a live server on a loopback socket.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use webd::{Engine, NetIoHandle, Server};
use webd_http::{Handler, Method, Request, ResponseWriter};

async fn start(
    handler: Arc<dyn Handler>,
    engine_cfg: impl FnOnce(Engine) -> Engine,
    server_cfg: impl FnOnce(Server) -> Server,
) -> NetIoHandle {
    let engine = engine_cfg(Engine::new(handler));
    let server = server_cfg(Server::new(Arc::new(engine)));
    server.start("127.0.0.1:0").await.expect("server start")
}

async fn read_until(client: &mut TcpStream, pred: impl Fn(&str) -> bool) -> String {
    let mut collected = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        if pred(&String::from_utf8_lossy(&collected)) {
            break;
        }
        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut chunk))
            .await
            .expect("read timed out")
            .expect("read failed");
        if n == 0 {
            break;
        }
        collected.extend_from_slice(&chunk[..n]);
    }
    String::from_utf8_lossy(&collected).into_owned()
}

async fn read_to_eof(client: &mut TcpStream) -> String {
    let mut collected = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        // A reset from the closing server counts as end-of-stream here.
        match tokio::time::timeout(Duration::from_secs(5), client.read(&mut chunk))
            .await
            .expect("read timed out")
        {
            Ok(0) | Err(_) => break,
            Ok(n) => collected.extend_from_slice(&chunk[..n]),
        }
    }
    String::from_utf8_lossy(&collected).into_owned()
}

/// Waits for the peer to close; fails the test if it stays open.
async fn expect_eof(client: &mut TcpStream) {
    let mut chunk = [0u8; 256];
    loop {
        match tokio::time::timeout(Duration::from_secs(5), client.read(&mut chunk))
            .await
            .expect("connection was not closed")
        {
            Ok(0) | Err(_) => return,
            Ok(_) => continue,
        }
    }
}

struct QueryEcho;

#[async_trait]
impl Handler for QueryEcho {
    async fn serve_http(&self, req: &mut Request, w: &mut ResponseWriter) {
        let id = req
            .query()
            .and_then(|q| q.strip_prefix("id="))
            .unwrap_or("?")
            .to_string();
        let _ = w.write_str(&format!("Response {id}"));
    }
}

struct BodyEcho;

#[async_trait]
impl Handler for BodyEcho {
    async fn serve_http(&self, req: &mut Request, w: &mut ResponseWriter) {
        let mut body = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            match req.body_mut().read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => body.extend_from_slice(&chunk[..n]),
                Err(_) => {
                    w.write_header(400);
                    return;
                }
            }
        }
        let _ = w.write(&body);
    }
}

struct IgnoreBody;

#[async_trait]
impl Handler for IgnoreBody {
    async fn serve_http(&self, _req: &mut Request, w: &mut ResponseWriter) {
        let _ = w.write_str("ok");
    }
}

#[tokio::test]
async fn pipelined_keep_alive_answers_in_order() {
    let handle = start(Arc::new(QueryEcho), |e| e, |s| s).await;
    let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();

    client
        .write_all(
            b"GET /?id=1 HTTP/1.1\r\nHost: x\r\n\r\nGET /?id=2 HTTP/1.1\r\nHost: x\r\n\r\n",
        )
        .await
        .unwrap();

    let output = read_until(&mut client, |s| s.contains("Response 2")).await;
    assert_eq!(output.matches("HTTP/1.1 200 OK").count(), 2, "got: {output}");
    let first = output.find("Response 1").expect("first response");
    let second = output.find("Response 2").expect("second response");
    assert!(first < second, "responses out of order: {output}");

    // The connection must still be usable.
    client
        .write_all(b"GET /?id=3 HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    let more = read_until(&mut client, |s| s.contains("Response 3")).await;
    assert!(more.contains("Response 3"));

    handle.shutdown().await;
}

#[tokio::test]
async fn chunked_request_body_is_decoded() {
    let handle = start(Arc::new(BodyEcho), |e| e, |s| s).await;
    let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();

    client
        .write_all(
            b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nHello\r\n7\r\n, World\r\n0\r\n\r\n",
        )
        .await
        .unwrap();

    let output = read_until(&mut client, |s| s.contains("Hello, World")).await;
    assert!(output.contains("HTTP/1.1 200 OK"));
    assert!(output.contains("Content-Length: 12"));

    handle.shutdown().await;
}

#[tokio::test]
async fn drain_cap_exceeded_closes_connection() {
    let handle = start(Arc::new(IgnoreBody), |e| e.with_max_drain_size(10), |s| s).await;
    let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();

    let body = vec![b'x'; 45];
    let mut request = b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 45\r\n\r\n".to_vec();
    request.extend_from_slice(&body);
    client.write_all(&request).await.unwrap();

    let output = read_to_eof(&mut client).await;
    assert!(output.contains("ok"), "got: {output}");
    // read_to_eof returning means the server closed the connection.

    handle.shutdown().await;
}

#[tokio::test]
async fn drain_within_cap_keeps_connection_alive() {
    let handle = start(Arc::new(IgnoreBody), |e| e.with_max_drain_size(10), |s| s).await;
    let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();

    // Exactly the cap's worth of unread body.
    let mut request = b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 10\r\n\r\n".to_vec();
    request.extend_from_slice(&[b'y'; 10]);
    client.write_all(&request).await.unwrap();
    let output = read_until(&mut client, |s| s.contains("ok")).await;
    assert!(output.contains("HTTP/1.1 200 OK"));

    // Connection survives for a second request.
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    let more = read_until(&mut client, |s| s.matches("ok").count() >= 1).await;
    assert!(more.contains("ok"));

    handle.shutdown().await;
}

#[tokio::test]
async fn handler_panic_before_headers_produces_single_500() {
    struct Panicker;

    #[async_trait]
    impl Handler for Panicker {
        async fn serve_http(&self, _req: &mut Request, _w: &mut ResponseWriter) {
            panic!("handler exploded");
        }
    }

    let handle = start(Arc::new(Panicker), |e| e, |s| s).await;
    let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();

    client
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();

    let output = read_to_eof(&mut client).await;
    assert_eq!(
        output.matches("HTTP/1.1 500 Internal Server Error").count(),
        1,
        "got: {output}"
    );

    handle.shutdown().await;
}

#[tokio::test]
async fn connection_close_header_is_honored() {
    let handle = start(Arc::new(QueryEcho), |e| e, |s| s).await;
    let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();

    client
        .write_all(b"GET /?id=9 HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let output = read_to_eof(&mut client).await;
    assert!(output.contains("Response 9"));
    // EOF reached: connection was closed after the response.

    handle.shutdown().await;
}

#[tokio::test]
async fn http10_defaults_to_close() {
    let handle = start(Arc::new(QueryEcho), |e| e, |s| s).await;
    let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();

    client
        .write_all(b"GET /?id=0 HTTP/1.0\r\nHost: x\r\n\r\n")
        .await
        .unwrap();

    let output = read_to_eof(&mut client).await;
    assert!(output.contains("Response 0"));

    handle.shutdown().await;
}

#[tokio::test]
async fn request_timeout_is_observable_through_cancellation() {
    struct SlowHandler;

    #[async_trait]
    impl Handler for SlowHandler {
        async fn serve_http(&self, req: &mut Request, w: &mut ResponseWriter) {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = w.write_str(&format!("cancelled={}", req.is_cancelled()));
        }
    }

    let handle = start(
        Arc::new(SlowHandler),
        |e| e.with_request_timeout(Duration::from_millis(20)),
        |s| s,
    )
    .await;
    let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();

    client
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    let output = read_until(&mut client, |s| s.contains("cancelled=")).await;
    assert!(output.contains("cancelled=true"), "got: {output}");

    handle.shutdown().await;
}

#[tokio::test]
async fn connection_cap_rejects_excess_accepts() {
    let handle = start(Arc::new(QueryEcho), |e| e, |s| s.with_max_conns(1)).await;

    // First connection occupies the only slot.
    let mut first = TcpStream::connect(handle.local_addr()).await.unwrap();
    first
        .write_all(b"GET /?id=1 HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    let output = read_until(&mut first, |s| s.contains("Response 1")).await;
    assert!(output.contains("Response 1"));

    // Second connection must be closed by the limiter.
    let mut second = TcpStream::connect(handle.local_addr()).await.unwrap();
    expect_eof(&mut second).await;

    handle.shutdown().await;
}

#[tokio::test]
async fn oversized_header_section_closes_connection() {
    let handle = start(Arc::new(QueryEcho), |e| e, |s| s).await;
    let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();

    let mut request = b"GET / HTTP/1.1\r\n".to_vec();
    while request.len() <= 9 * 1024 {
        request.extend_from_slice(b"X-Pad: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\r\n");
    }
    // The server may slam the door while we are still writing.
    let _ = client.write_all(&request).await;

    expect_eof(&mut client).await;
    handle.shutdown().await;
}

#[tokio::test]
async fn method_and_headers_reach_the_handler() {
    struct Introspect;

    #[async_trait]
    impl Handler for Introspect {
        async fn serve_http(&self, req: &mut Request, w: &mut ResponseWriter) {
            let agent = req.header("user-agent").unwrap_or("-").to_string();
            let _ = w.write_str(&format!("{} {} {}", req.method(), req.path(), agent));
            assert_eq!(req.method(), Method::Put);
        }
    }

    let handle = start(Arc::new(Introspect), |e| e, |s| s).await;
    let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();

    client
        .write_all(b"PUT /thing HTTP/1.1\r\nHost: x\r\nUser-Agent: webd-test\r\n\r\n")
        .await
        .unwrap();
    let output = read_until(&mut client, |s| s.contains("webd-test")).await;
    assert!(output.contains("PUT /thing webd-test"));

    handle.shutdown().await;
}
