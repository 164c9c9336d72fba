//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use crates_cache_proxy::config::ProxyConfig;
use crates_cache_proxy::storage::build_store;
use crates_cache_proxy::{HttpServer, Shutdown};

/// A mock upstream listening on an ephemeral port.
pub struct MockUpstream {
    pub addr: SocketAddr,
    pub calls: Arc<AtomicUsize>,
}

impl MockUpstream {
    pub fn url(&self) -> String {
        format!("http://{}/", self.addr)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// How the mock upstream delimits its response bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    ContentLength,
    Chunked,
}

/// Start a programmable mock upstream that sends `Content-Length` bodies.
///
/// `f` maps the request path (query included) to a status code and body.
pub async fn start_programmable_upstream<F>(f: F) -> MockUpstream
where
    F: Fn(&str) -> (u16, String) + Send + Sync + 'static,
{
    start_upstream(Framing::ContentLength, f).await
}

/// Start a programmable mock upstream with the given body framing.
pub async fn start_upstream<F>(framing: Framing, f: F) -> MockUpstream
where
    F: Fn(&str) -> (u16, String) + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let f = Arc::new(f);

    let counter = calls.clone();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((socket, _)) => {
                    let f = f.clone();
                    let counter = counter.clone();
                    tokio::spawn(async move {
                        let (read, mut write) = socket.into_split();
                        let mut reader = BufReader::new(read);

                        let mut request_line = String::new();
                        if reader.read_line(&mut request_line).await.unwrap_or(0) == 0 {
                            return;
                        }
                        loop {
                            let mut line = String::new();
                            match reader.read_line(&mut line).await {
                                Ok(0) => break,
                                Ok(_) if line == "\r\n" || line == "\n" => break,
                                Ok(_) => continue,
                                Err(_) => return,
                            }
                        }

                        counter.fetch_add(1, Ordering::SeqCst);
                        let path = request_line.split_whitespace().nth(1).unwrap_or("/");
                        let (status, body) = f(path);
                        let status_text = match status {
                            200 => "200 OK",
                            404 => "404 Not Found",
                            500 => "500 Internal Server Error",
                            503 => "503 Service Unavailable",
                            _ => "200 OK",
                        };

                        let response = match framing {
                            Framing::ContentLength => format!(
                                "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                                status_text,
                                body.len(),
                                body
                            ),
                            Framing::Chunked => format!(
                                "HTTP/1.1 {}\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n{}",
                                status_text,
                                encode_chunked(&body)
                            ),
                        };
                        let _ = write.write_all(response.as_bytes()).await;
                        let _ = write.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });

    MockUpstream { addr, calls }
}

/// Split `body` into two chunks plus the terminating zero-length chunk.
fn encode_chunked(body: &str) -> String {
    let (head, tail) = body.split_at(body.len() / 2);
    let mut encoded = String::new();
    for chunk in [head, tail] {
        if !chunk.is_empty() {
            encoded.push_str(&format!("{:x}\r\n{}\r\n", chunk.len(), chunk));
        }
    }
    encoded.push_str("0\r\n\r\n");
    encoded
}

/// Start an upstream that declares `Content-Length: declared`, sends only
/// `sent`, then holds the connection open for `hold` before closing it.
pub async fn start_truncating_upstream(
    declared: usize,
    sent: &'static str,
    hold: Duration,
) -> MockUpstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = calls.clone();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let counter = counter.clone();
            tokio::spawn(async move {
                let (read, mut write) = socket.into_split();
                let mut reader = BufReader::new(read);
                loop {
                    let mut line = String::new();
                    match reader.read_line(&mut line).await {
                        Ok(0) | Err(_) => return,
                        Ok(_) if line == "\r\n" => break,
                        Ok(_) => continue,
                    }
                }

                counter.fetch_add(1, Ordering::SeqCst);
                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {declared}\r\nConnection: close\r\n\r\n{sent}"
                );
                let _ = write.write_all(head.as_bytes()).await;
                tokio::time::sleep(hold).await;
                let _ = write.shutdown().await;
            });
        }
    });

    MockUpstream { addr, calls }
}

/// Start the proxy on an ephemeral port. Dropping the returned `Shutdown`
/// does not stop it; call `trigger`.
pub async fn start_proxy(config: ProxyConfig) -> (SocketAddr, Shutdown) {
    let store = build_store(&config.cache.storage).unwrap();
    let server = HttpServer::new(config, store).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let shutdown = Shutdown::new();
    let server_shutdown = shutdown.subscribe();
    tokio::spawn(async move {
        let _ = server.run(listener, server_shutdown).await;
    });

    (addr, shutdown)
}

/// A client that never goes through an environment proxy.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}

/// Cache commits finish after the client has read the body; poll for the entry.
pub async fn wait_for_file(path: &Path) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if path.is_file() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}
