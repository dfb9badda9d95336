//! Helpers shared by the integration tests
#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use fake_corp_proxy::config::ProxyConfig;
use fake_corp_proxy::tls::{CertificateProvider, RootAuthority};
use fake_corp_proxy::{Proxy, ProxyHandle};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Configuration listening on an ephemeral loopback port
pub fn local_config() -> ProxyConfig {
    ProxyConfig {
        bind_address: "127.0.0.1".parse().unwrap(),
        port: 0,
        intercept: false,
        connect_timeout: 5,
        ..ProxyConfig::default()
    }
}

/// Start a proxy that relays tunnels
pub async fn start_relay_proxy(config: ProxyConfig) -> ProxyHandle {
    let proxy = Proxy::new(Arc::new(config), None).unwrap();
    proxy.start().await.unwrap()
}

/// Start an intercepting proxy whose CA lives in `ca_dir`
pub async fn start_intercepting_proxy(mut config: ProxyConfig, ca_dir: &Path) -> (ProxyHandle, Arc<CertificateProvider>) {
    config.intercept = true;
    config.ca_dir = ca_dir.to_path_buf();
    let authority = RootAuthority::load_or_generate(ca_dir).unwrap();
    let provider = Arc::new(CertificateProvider::new(Arc::new(authority), Some(config.certs_dir())));
    let proxy = Proxy::new(Arc::new(config), Some(Arc::clone(&provider))).unwrap();
    (proxy.start().await.unwrap(), provider)
}

/// TCP server echoing every byte back
pub async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// HTTP origin answering every request with `body` and closing
pub async fn origin_server(body: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                if read_head(&mut stream).await.is_empty() {
                    return;
                }
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    addr
}

/// HTTP origin that sends a chunked head and `first_chunk`, then holds the
/// response open until the client goes away
pub async fn streaming_origin(first_chunk: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                if read_head(&mut stream).await.is_empty() {
                    return;
                }
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\n\r\n{:x}\r\n{}\r\n",
                    first_chunk.len(),
                    first_chunk
                );
                if stream.write_all(response.as_bytes()).await.is_err() {
                    return;
                }
                // Never finish the body
                let mut rest = [0u8; 64];
                while matches!(stream.read(&mut rest).await, Ok(n) if n > 0) {}
            });
        }
    });
    addr
}

/// Read up to and including the blank line ending a message head
pub async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
            Ok(0) | Err(_) => break,
            Ok(_) => head.push(byte[0]),
        }
    }
    String::from_utf8_lossy(&head).into_owned()
}

/// Send a CONNECT for `target` with optional extra header lines and read the answer head
pub async fn connect(stream: &mut TcpStream, target: &str, headers: &str) -> String {
    let request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n{}\r\n", target, target, headers);
    stream.write_all(request.as_bytes()).await.unwrap();
    read_head(stream).await
}

/// Read a `content-length` framed body following `head`
pub async fn read_body<S: AsyncRead + Unpin>(stream: &mut S, head: &str) -> String {
    let len: usize = header(head, "content-length").map_or(0, |value| value.parse().unwrap());
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await.unwrap();
    String::from_utf8(body).unwrap()
}

/// Value of header `name` in a response head, matched case-insensitively
pub fn header<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
    })
}
