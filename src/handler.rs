//! Per-connection logic for the passthrough engine.
//!
//! Speaks just enough HTTP/1.x to frame exactly one request off the client
//! socket, branch to plain forwarding or CONNECT tunneling, run the
//! interceptor hooks at the two phases and record the exchange. Protocol
//! errors (malformed request line, missing Host, oversized body) drop the
//! connection without a capture entry.

use crate::config::CaptureLimits;
use crate::interceptor::{
    header_value, CapturedRequest, CapturedResponse, RequestAction, TrafficInterceptor,
};
use std::collections::HashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

const MAX_HEAD_BYTES: usize = 32 * 1024;

pub struct ConnectionHandler {
    interceptor: TrafficInterceptor,
    limits: CaptureLimits,
}

impl ConnectionHandler {
    pub fn new(interceptor: TrafficInterceptor, limits: CaptureLimits) -> Self {
        Self {
            interceptor,
            limits,
        }
    }

    /// Handle one accepted client connection. All errors terminate only this
    /// connection; the caller discards the result.
    pub async fn handle(&self, mut client: TcpStream) -> std::io::Result<()> {
        let head = match self.read_head(&mut client).await {
            Some(head) => head,
            None => return Ok(()),
        };
        let (head_block, mut body) = split_head(&head);
        let mut lines = head_block.split("\r\n");
        let request_line = lines.next().unwrap_or("");
        let (method, target) = match parse_request_line(request_line) {
            Some(parsed) => parsed,
            None => return Ok(()), // malformed: close silently
        };

        if method == "CONNECT" {
            let (host, port) = split_host_port(&target, 443);
            return self.handle_connect(client, &host, port).await;
        }

        let headers = parse_headers(lines);
        let (host, port, url, origin_path) = match resolve_target(&target, &headers) {
            Some(t) => t,
            None => return Ok(()), // no Host header: drop
        };

        // Body framed by Content-Length only; anything larger than the cap is
        // a protocol error for this proxy.
        let content_length = header_value(&headers, "content-length")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        if content_length > self.limits.max_request_body {
            debug!("Dropping {} {}: body of {} bytes over cap", method, url, content_length);
            return Ok(());
        }
        while body.len() < content_length {
            let mut chunk = vec![0u8; (content_length - body.len()).min(64 * 1024)];
            let n = match timeout(self.limits.client_read_timeout(), client.read(&mut chunk)).await
            {
                Ok(Ok(n)) => n,
                _ => return Ok(()),
            };
            if n == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..n]);
        }

        let mut request = CapturedRequest {
            method: method.clone(),
            url,
            headers,
            body,
        };
        if self.interceptor.on_request(&mut request) == RequestAction::Block {
            // No forward, no origin connection; just close.
            return Ok(());
        }

        let mut origin = match timeout(
            self.limits.origin_connect_timeout(),
            TcpStream::connect((host.as_str(), port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            _ => {
                debug!("Origin {}:{} unreachable", host, port);
                let _ = client
                    .write_all(b"HTTP/1.1 502 Bad Gateway\r\nConnection: close\r\n\r\n")
                    .await;
                return Ok(());
            }
        };

        origin
            .write_all(&serialize_request(&request, &origin_path))
            .await?;

        let mut response = match self.read_response(&mut origin).await {
            Some(res) => res,
            None => return Ok(()), // no response obtained: no capture
        };
        self.interceptor.on_response(&request, &mut response);

        // A response was obtained, so the exchange is captured even if the
        // client has gone away before the write-back.
        self.interceptor.record(&request, &response);
        client.write_all(&serialize_response(&response)).await?;
        Ok(())
    }

    /// CONNECT fast path: record tunnel establishment as a discrete event,
    /// then splice bytes opaquely. No inspection occurs inside the tunnel.
    async fn handle_connect(
        &self,
        mut client: TcpStream,
        host: &str,
        port: u16,
    ) -> std::io::Result<()> {
        let origin = match timeout(
            self.limits.origin_connect_timeout(),
            TcpStream::connect((host, port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            _ => {
                debug!("CONNECT {}:{} failed", host, port);
                let _ = client
                    .write_all(b"HTTP/1.1 502 Bad Gateway\r\nConnection: close\r\n\r\n")
                    .await;
                return Ok(());
            }
        };

        self.interceptor.record_connect(host, port);
        client
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await?;
        self.splice(client, origin).await
    }

    /// Relay bytes both ways until either peer closes or the idle timeout
    /// elapses. When one side closes, the other side's write half is shut
    /// down eagerly instead of waiting it out.
    async fn splice(&self, mut client: TcpStream, mut origin: TcpStream) -> std::io::Result<()> {
        let (mut client_r, mut client_w) = client.split();
        let (mut origin_r, mut origin_w) = origin.split();
        let mut client_buf = vec![0u8; 16 * 1024];
        let mut origin_buf = vec![0u8; 16 * 1024];

        loop {
            tokio::select! {
                read = client_r.read(&mut client_buf) => {
                    match read {
                        Ok(0) | Err(_) => {
                            let _ = origin_w.shutdown().await;
                            return Ok(());
                        }
                        Ok(n) => {
                            if origin_w.write_all(&client_buf[..n]).await.is_err() {
                                return Ok(());
                            }
                        }
                    }
                }
                read = origin_r.read(&mut origin_buf) => {
                    match read {
                        Ok(0) | Err(_) => {
                            let _ = client_w.shutdown().await;
                            return Ok(());
                        }
                        Ok(n) => {
                            if client_w.write_all(&origin_buf[..n]).await.is_err() {
                                return Ok(());
                            }
                        }
                    }
                }
                _ = tokio::time::sleep(self.limits.tunnel_idle_timeout()) => {
                    debug!("Tunnel idle timeout");
                    return Ok(());
                }
            }
        }
    }

    /// Read until the blank line terminating the request head. Returns None
    /// on timeout, early close or an oversized head.
    async fn read_head(&self, client: &mut TcpStream) -> Option<Vec<u8>> {
        let mut buf = Vec::with_capacity(8 * 1024);
        let mut chunk = vec![0u8; 8 * 1024];
        loop {
            if buf.len() > MAX_HEAD_BYTES {
                return None;
            }
            let n = timeout(self.limits.client_read_timeout(), client.read(&mut chunk))
                .await
                .ok()?
                .ok()?;
            if n == 0 {
                return None;
            }
            buf.extend_from_slice(&chunk[..n]);
            if find_subsequence(&buf, b"\r\n\r\n").is_some() {
                return Some(buf);
            }
        }
    }

    /// Read the origin's response: head, then a body framed by Content-Length
    /// or by connection close — whichever applies.
    async fn read_response(&self, origin: &mut TcpStream) -> Option<CapturedResponse> {
        let mut buf = Vec::with_capacity(16 * 1024);
        let mut chunk = vec![0u8; 64 * 1024];
        let head_end = loop {
            if let Some(pos) = find_subsequence(&buf, b"\r\n\r\n") {
                break pos;
            }
            if buf.len() > 256 * 1024 {
                return None;
            }
            let n = timeout(self.limits.origin_read_timeout(), origin.read(&mut chunk))
                .await
                .ok()?
                .ok()?;
            if n == 0 {
                return None;
            }
            buf.extend_from_slice(&chunk[..n]);
        };

        let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
        let mut lines = head.split("\r\n");
        let status = parse_status_line(lines.next().unwrap_or(""))?;
        let headers = parse_headers(lines);
        let mut body = buf[head_end + 4..].to_vec();

        match header_value(&headers, "content-length").and_then(|v| v.trim().parse::<usize>().ok())
        {
            Some(len) => {
                while body.len() < len {
                    let n = timeout(self.limits.origin_read_timeout(), origin.read(&mut chunk))
                        .await
                        .ok()?
                        .ok()?;
                    if n == 0 {
                        break;
                    }
                    body.extend_from_slice(&chunk[..n]);
                }
                body.truncate(len);
            }
            None => {
                // No framing header: read to close or timeout.
                loop {
                    let n = match timeout(
                        self.limits.origin_read_timeout(),
                        origin.read(&mut chunk),
                    )
                    .await
                    {
                        Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
                        Ok(Ok(n)) => n,
                    };
                    body.extend_from_slice(&chunk[..n]);
                }
            }
        }

        Some(CapturedResponse {
            status,
            headers,
            body,
        })
    }
}

/// Parse `METHOD target HTTP/1.x`. Returns None unless both a method and a
/// target are present.
fn parse_request_line(line: &str) -> Option<(String, String)> {
    let mut parts = line.split_whitespace();
    let method = parts.next()?.to_uppercase();
    let target = parts.next()?.to_string();
    Some((method, target))
}

fn parse_status_line(line: &str) -> Option<u16> {
    if !line.starts_with("HTTP/") {
        return None;
    }
    line.split_whitespace().nth(1)?.parse().ok()
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    headers
}

fn split_head(raw: &[u8]) -> (String, Vec<u8>) {
    match find_subsequence(raw, b"\r\n\r\n") {
        Some(pos) => (
            String::from_utf8_lossy(&raw[..pos]).into_owned(),
            raw[pos + 4..].to_vec(),
        ),
        None => (String::from_utf8_lossy(raw).into_owned(), Vec::new()),
    }
}

fn split_host_port(target: &str, default_port: u16) -> (String, u16) {
    match target.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (host.to_string(), default_port),
        },
        None => (target.to_string(), default_port),
    }
}

/// Determine origin host/port, the full URL and the origin-form path for one
/// plain-HTTP request. Browsers talking to a proxy send an absolute-form
/// target; direct clients send origin-form plus a Host header.
fn resolve_target(
    target: &str,
    headers: &HashMap<String, String>,
) -> Option<(String, u16, String, String)> {
    if target.starts_with("http://") || target.starts_with("https://") {
        let parsed = url::Url::parse(target).ok()?;
        let host = parsed.host_str()?.to_string();
        let port = parsed.port_or_known_default().unwrap_or(80);
        let mut path = parsed.path().to_string();
        if let Some(query) = parsed.query() {
            path.push('?');
            path.push_str(query);
        }
        return Some((host, port, target.to_string(), path));
    }

    let host_header = header_value(headers, "host")?.trim();
    if host_header.is_empty() {
        return None;
    }
    let (host, port) = split_host_port(host_header, 80);
    let path = if target.starts_with('/') {
        target.to_string()
    } else {
        format!("/{}", target)
    };
    let url = if port == 80 {
        format!("http://{}{}", host, path)
    } else {
        format!("http://{}:{}{}", host, port, path)
    };
    Some((host, port, url, path))
}

/// Rebuild the outbound request from the possibly mutated headers.
fn serialize_request(req: &CapturedRequest, origin_path: &str) -> Vec<u8> {
    let mut out = format!("{} {} HTTP/1.1\r\n", req.method, origin_path).into_bytes();
    for (key, value) in &req.headers {
        out.extend_from_slice(format!("{}: {}\r\n", key, value).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&req.body);
    out
}

/// Rebuild the response for the client from the possibly mutated headers
/// and body.
fn serialize_response(res: &CapturedResponse) -> Vec<u8> {
    let reason = match res.status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        _ => "",
    };
    let mut out = format!("HTTP/1.1 {} {}\r\n", res.status, reason).into_bytes();
    for (key, value) in &res.headers {
        out.extend_from_slice(format!("{}: {}\r\n", key, value).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&res.body);
    out
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request_line() {
        assert_eq!(
            parse_request_line("get /x HTTP/1.1"),
            Some(("GET".to_string(), "/x".to_string()))
        );
        assert_eq!(
            parse_request_line("CONNECT example.com:443 HTTP/1.1"),
            Some(("CONNECT".to_string(), "example.com:443".to_string()))
        );
        assert_eq!(parse_request_line("GARBAGE"), None);
        assert_eq!(parse_request_line(""), None);
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(
            split_host_port("example.com:8443", 443),
            ("example.com".to_string(), 8443)
        );
        assert_eq!(
            split_host_port("example.com", 443),
            ("example.com".to_string(), 443)
        );
        assert_eq!(
            split_host_port("example.com:bad", 443),
            ("example.com".to_string(), 443)
        );
    }

    #[test]
    fn test_resolve_target_absolute_form() {
        let (host, port, url, path) = resolve_target(
            "http://example.com:8080/a/b?q=1",
            &HashMap::new(),
        )
        .unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 8080);
        assert_eq!(url, "http://example.com:8080/a/b?q=1");
        assert_eq!(path, "/a/b?q=1");
    }

    #[test]
    fn test_resolve_target_origin_form_needs_host() {
        assert!(resolve_target("/a", &HashMap::new()).is_none());

        let headers = HashMap::from([("Host".to_string(), "example.com".to_string())]);
        let (host, port, url, path) = resolve_target("/a", &headers).unwrap();
        assert_eq!((host.as_str(), port), ("example.com", 80));
        assert_eq!(url, "http://example.com/a");
        assert_eq!(path, "/a");
    }

    #[test]
    fn test_parse_status_line() {
        assert_eq!(parse_status_line("HTTP/1.1 404 Not Found"), Some(404));
        assert_eq!(parse_status_line("HTTP/1.0 200"), Some(200));
        assert_eq!(parse_status_line("garbage"), None);
    }

    #[test]
    fn test_serialize_request_shape() {
        let req = CapturedRequest {
            method: "POST".to_string(),
            url: "http://example.com/x".to_string(),
            headers: HashMap::from([("Host".to_string(), "example.com".to_string())]),
            body: b"data".to_vec(),
        };
        let raw = String::from_utf8(serialize_request(&req, "/x")).unwrap();
        assert!(raw.starts_with("POST /x HTTP/1.1\r\n"));
        assert!(raw.contains("Host: example.com\r\n"));
        assert!(raw.ends_with("\r\n\r\ndata"));
    }
}
