//! HTTP CONNECT proxy traversal

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::{split_host_port, TransportError, TransportResult};

/// Upper bound on the proxy's response head
const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// Resolve `http://host:port` (or a bare `host:port`) to the proxy's address
pub fn proxy_addr(proxy_url: &str) -> TransportResult<String> {
    let without_scheme = match proxy_url.split_once("://") {
        Some(("http", rest)) => rest,
        Some((scheme, _)) => {
            return Err(TransportError::ProxyError(format!(
                "unsupported proxy scheme '{}'",
                scheme
            )))
        }
        None => proxy_url,
    };

    let authority = without_scheme.trim_end_matches('/');
    let (host, port) = split_host_port(authority)?;
    Ok(format!("{}:{}", host, port))
}

/// Dial the proxy and ask it to open a tunnel to `target`
pub async fn connect_via_proxy(proxy_url: &str, target: &str) -> TransportResult<TcpStream> {
    let addr = proxy_addr(proxy_url)?;
    let mut stream = TcpStream::connect(&addr)
        .await
        .map_err(|source| TransportError::ConnectionFailed {
            addr: addr.clone(),
            source,
        })?;

    let request = format!(
        "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\nProxy-Connection: Keep-Alive\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await?;

    // Read byte by byte so nothing past the response head is consumed
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err(TransportError::ProxyError(
                "proxy response head too large".to_string(),
            ));
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(TransportError::ProxyError(
                "proxy closed connection during CONNECT".to_string(),
            ));
        }
        head.push(byte[0]);
    }

    let status = parse_connect_response(&head)?;
    if !(200..300).contains(&status) {
        return Err(TransportError::ProxyError(format!(
            "proxy refused CONNECT to {} with status {}",
            target, status
        )));
    }

    debug!(proxy = %addr, target = %target, "Proxy tunnel established");
    Ok(stream)
}

fn parse_connect_response(head: &[u8]) -> TransportResult<u16> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut headers);

    match response.parse(head) {
        Ok(httparse::Status::Complete(_)) => response
            .code
            .ok_or_else(|| TransportError::ProxyError("proxy response without status".to_string())),
        Ok(httparse::Status::Partial) => Err(TransportError::ProxyError(
            "incomplete proxy response".to_string(),
        )),
        Err(e) => Err(TransportError::ProxyError(format!(
            "malformed proxy response: {}",
            e
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_proxy_addr() {
        assert_eq!(
            proxy_addr("http://proxy.local:3128").unwrap(),
            "proxy.local:3128"
        );
        assert_eq!(proxy_addr("proxy.local:3128/").unwrap(), "proxy.local:3128");
        assert!(proxy_addr("socks5://proxy.local:1080").is_err());
    }

    #[test]
    fn test_parse_connect_response() {
        assert_eq!(
            parse_connect_response(b"HTTP/1.1 200 Connection established\r\n\r\n").unwrap(),
            200
        );
        assert_eq!(
            parse_connect_response(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .unwrap(),
            407
        );
    }

    #[tokio::test]
    async fn test_connect_via_proxy_keeps_tunnel_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy = format!("http://{}", listener.local_addr().unwrap());

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let mut read = 0;
            while !buf[..read].ends_with(b"\r\n\r\n") {
                read += socket.read(&mut buf[read..]).await.unwrap();
            }
            assert!(buf[..read].starts_with(b"CONNECT server.example.com:4443 HTTP/1.1"));
            // Response head and first tunnel bytes in a single write
            socket
                .write_all(b"HTTP/1.1 200 OK\r\n\r\ntunnel-bytes")
                .await
                .unwrap();
        });

        let mut stream = connect_via_proxy(&proxy, "server.example.com:4443")
            .await
            .unwrap();
        let mut buf = [0u8; 12];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"tunnel-bytes");
    }

    #[tokio::test]
    async fn test_connect_via_proxy_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy = format!("http://{}", listener.local_addr().unwrap());

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let _ = socket.read(&mut buf).await.unwrap();
            socket
                .write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n")
                .await
                .unwrap();
        });

        let err = connect_via_proxy(&proxy, "server.example.com:4443")
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ProxyError(_)));
    }
}
