//! Plain HTTP proxying tests
//!
//! Requests are sent through the proxy with an ordinary HTTP client and
//! over the TLS front listener.

mod support;

use std::fs;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use fake_corp_proxy::config::ProxyConfig;
use fake_corp_proxy::tls::{CertificateProvider, RootAuthority};
use openssl::ssl::{SslConnector, SslMethod};
use support::{header, local_config, origin_server, read_body, read_head, start_relay_proxy, streaming_origin};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_openssl::SslStream;

fn client_through(proxy: reqwest::Proxy) -> reqwest::Client {
    reqwest::Client::builder().proxy(proxy).build().unwrap()
}

#[tokio::test]
async fn test_request_is_forwarded() {
    let origin = origin_server("plain hello").await;
    let handle = start_relay_proxy(local_config()).await;

    let proxy = reqwest::Proxy::http(format!("http://{}", handle.http_addr())).unwrap();
    let response = client_through(proxy)
        .get(format!("http://{}/path", origin))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "plain hello");
}

#[tokio::test]
async fn test_basic_credentials_on_plain_requests() {
    let origin = origin_server("authenticated hello").await;
    let handle = start_relay_proxy(ProxyConfig {
        basic: true,
        ..local_config()
    })
    .await;
    let proxy_url = format!("http://{}", handle.http_addr());
    let url = format!("http://{}/", origin);

    let anonymous = client_through(reqwest::Proxy::http(&proxy_url).unwrap());
    let response = anonymous.get(&url).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::PROXY_AUTHENTICATION_REQUIRED);
    assert_eq!(
        response.headers().get("proxy-authenticate").unwrap(),
        "Basic"
    );

    let refused = client_through(reqwest::Proxy::http(&proxy_url).unwrap().basic_auth("unknown", "secret"));
    let response = refused.get(&url).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::FORBIDDEN);

    let accepted = client_through(reqwest::Proxy::http(&proxy_url).unwrap().basic_auth("alice", "secret"));
    let response = accepted.get(&url).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "authenticated hello");
}

#[tokio::test]
async fn test_response_is_streamed_before_origin_finishes() {
    let origin = streaming_origin("data: first").await;
    let handle = start_relay_proxy(local_config()).await;

    let mut stream = TcpStream::connect(handle.http_addr()).await.unwrap();
    let request = format!("GET http://{}/events HTTP/1.1\r\nHost: {}\r\n\r\n", origin, origin);
    stream.write_all(request.as_bytes()).await.unwrap();

    // The origin never completes its body, the head must still come through
    let head = timeout(Duration::from_secs(3), read_head(&mut stream))
        .await
        .expect("response head was held back");
    assert!(head.starts_with("HTTP/1.1 200 "), "{}", head);
    assert_eq!(header(&head, "content-type"), Some("text/event-stream"));

    let mut seen = Vec::new();
    let mut buf = [0u8; 256];
    timeout(Duration::from_secs(3), async {
        while !String::from_utf8_lossy(&seen).contains("data: first") {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed early");
            seen.extend_from_slice(&buf[..n]);
        }
    })
    .await
    .expect("first chunk was held back");
}

#[tokio::test]
async fn test_request_body_is_forwarded() {
    let origin = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin.local_addr().unwrap();
    let received = tokio::spawn(async move {
        let (mut stream, _) = origin.accept().await.unwrap();
        let head = read_head(&mut stream).await;
        let body = read_body(&mut stream, &head).await;
        stream
            .write_all(b"HTTP/1.1 204 No Content\r\nconnection: close\r\n\r\n")
            .await
            .unwrap();
        body
    });

    let handle = start_relay_proxy(local_config()).await;
    let proxy = reqwest::Proxy::http(format!("http://{}", handle.http_addr())).unwrap();
    let response = client_through(proxy)
        .post(format!("http://{}/upload", origin_addr))
        .body("field=value&other=1")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::NO_CONTENT);
    assert_eq!(received.await.unwrap(), "field=value&other=1");
}

#[tokio::test]
async fn test_unreachable_origin_is_bad_gateway() {
    let unused = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let origin = unused.local_addr().unwrap();
    drop(unused);

    let handle = start_relay_proxy(local_config()).await;
    let mut stream = TcpStream::connect(handle.http_addr()).await.unwrap();
    let request = format!(
        "GET http://{}/ HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        origin, origin
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let head = read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 502 "), "{}", head);
    assert!(header(&head, "x-proxy-error").is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tls_front_listener() {
    let origin = origin_server("over tls").await;

    // Certificate for the front listener, issued by a throwaway CA
    let dir = TempDir::new().unwrap();
    let authority = Arc::new(RootAuthority::load_or_generate(dir.path()).unwrap());
    let provider = CertificateProvider::new(Arc::clone(&authority), None);
    let record = provider.get_certificate("localhost").unwrap();
    let key = dir.path().join("proxy.key");
    let cert = dir.path().join("proxy.crt");
    fs::write(&key, &record.key_pem).unwrap();
    fs::write(&cert, &record.cert_pem).unwrap();

    let handle = start_relay_proxy(ProxyConfig {
        https: true,
        key: Some(key),
        cert: Some(cert),
        ..local_config()
    })
    .await;
    let https_addr = handle.https_addr().unwrap();
    assert_ne!(https_addr, handle.http_addr());

    let mut builder = SslConnector::builder(SslMethod::tls()).unwrap();
    builder.cert_store_mut().add_cert(authority.certificate().clone()).unwrap();
    let ssl = builder.build().configure().unwrap().into_ssl("localhost").unwrap();
    let stream = TcpStream::connect(https_addr).await.unwrap();
    let mut tls = SslStream::new(ssl, stream).unwrap();
    Pin::new(&mut tls).connect().await.unwrap();

    let request = format!(
        "GET http://{}/ HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        origin, origin
    );
    tls.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    let mut buf = [0u8; 1024];
    while !String::from_utf8_lossy(&response).contains("over tls") {
        match tls.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => response.extend_from_slice(&buf[..n]),
        }
    }
    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.1 200 OK"), "{}", response);
}
