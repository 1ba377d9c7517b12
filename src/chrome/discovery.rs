use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use serde::Deserialize;

use super::ChromeError;

/// Version document served by the browser's `/json/version` endpoint.
///
/// Only the fields the daemon needs; the endpoint also reports V8 and
/// WebKit versions which are ignored.
#[derive(Debug, Deserialize)]
pub struct BrowserVersion {
    /// Browser name and version, e.g. `Chrome/126.0.6478.55`.
    #[serde(rename = "Browser")]
    pub browser: String,

    /// CDP protocol version, e.g. `1.3`.
    #[serde(rename = "Protocol-Version")]
    pub protocol_version: String,

    /// Root (browser-level) WebSocket debugger URL.
    #[serde(rename = "webSocketDebuggerUrl")]
    pub ws_debugger_url: String,
}

/// Fetch `/json/version` from the browser's debug endpoint.
///
/// This is both the readiness probe during launch and the source of the
/// root WebSocket URL the transport connects to.
///
/// # Errors
///
/// Returns `ChromeError::HttpError` if the endpoint is unreachable or
/// `ChromeError::ParseError` if the document cannot be decoded.
pub async fn query_version(host: &str, port: u16) -> Result<BrowserVersion, ChromeError> {
    let body = http_get(host, port, "/json/version").await?;
    serde_json::from_str(&body).map_err(|e| ChromeError::ParseError(e.to_string()))
}

/// Minimal HTTP GET against the debug endpoint, run on the blocking
/// pool. The endpoint speaks plain HTTP/1.1 on localhost; pulling in an
/// HTTP client for two header lines is not worth it.
async fn http_get(host: &str, port: u16, path: &str) -> Result<String, ChromeError> {
    let addr = format!("{host}:{port}");
    let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");

    tokio::task::spawn_blocking(move || {
        let mut stream = TcpStream::connect_timeout(
            &addr
                .parse()
                .map_err(|e| ChromeError::HttpError(format!("invalid address: {e}")))?,
            Duration::from_secs(2),
        )
        .map_err(|e| ChromeError::HttpError(format!("connect to {addr} failed: {e}")))?;

        stream.set_read_timeout(Some(Duration::from_secs(5))).ok();
        stream
            .write_all(request.as_bytes())
            .map_err(|e| ChromeError::HttpError(format!("write failed: {e}")))?;

        // Read until the response is complete per Content-Length; the
        // browser sometimes keeps the connection open past the body.
        let mut buf = Vec::with_capacity(4096);
        let mut chunk = [0u8; 4096];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    if response_complete(&buf) {
                        break;
                    }
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    if response_complete(&buf) {
                        break;
                    }
                    return Err(ChromeError::HttpError(format!("read timed out: {e}")));
                }
                Err(e) => return Err(ChromeError::HttpError(format!("read failed: {e}"))),
            }
        }

        extract_body(&buf)
    })
    .await
    .map_err(|e| ChromeError::HttpError(format!("blocking task failed: {e}")))?
}

/// Whether `buf` holds complete headers and, when Content-Length is
/// present, the full body.
fn response_complete(buf: &[u8]) -> bool {
    let Some(header_end) = header_end(buf) else {
        return false;
    };
    match content_length(&buf[..header_end]) {
        Some(len) => buf.len() >= header_end + 4 + len,
        None => true,
    }
}

fn header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn content_length(headers: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(headers).ok()?;
    text.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim()
            .eq_ignore_ascii_case("content-length")
            .then(|| value.trim().parse().ok())?
    })
}

/// Validate the 200 status line and slice out the body.
fn extract_body(buf: &[u8]) -> Result<String, ChromeError> {
    let header_end =
        header_end(buf).ok_or_else(|| ChromeError::HttpError("malformed HTTP response".into()))?;
    let body_start = header_end + 4;

    let headers = std::str::from_utf8(&buf[..header_end])
        .map_err(|e| ChromeError::HttpError(format!("invalid UTF-8 in headers: {e}")))?;
    let status_line = headers
        .lines()
        .next()
        .ok_or_else(|| ChromeError::HttpError("empty response".into()))?;
    if !status_line.contains(" 200 ") {
        return Err(ChromeError::HttpError(format!(
            "unexpected status: {status_line}"
        )));
    }

    let body = match content_length(&buf[..header_end]) {
        Some(len) => &buf[body_start..(body_start + len).min(buf.len())],
        None => &buf[body_start..],
    };

    String::from_utf8(body.to_vec())
        .map_err(|e| ChromeError::HttpError(format!("invalid UTF-8 in body: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_version_document() {
        let json = r#"{
            "Browser": "Chrome/126.0.6478.55",
            "Protocol-Version": "1.3",
            "User-Agent": "Mozilla/5.0",
            "webSocketDebuggerUrl": "ws://127.0.0.1:9222/devtools/browser/abc-123"
        }"#;
        let v: BrowserVersion = serde_json::from_str(json).unwrap();
        assert_eq!(v.browser, "Chrome/126.0.6478.55");
        assert_eq!(v.protocol_version, "1.3");
        assert!(v.ws_debugger_url.starts_with("ws://"));
    }

    #[test]
    fn extract_body_with_content_length() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 11\r\n\r\nhello world";
        assert_eq!(extract_body(raw).unwrap(), "hello world");
    }

    #[test]
    fn extract_body_without_content_length() {
        let raw = b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n{\"ok\":true}";
        assert_eq!(extract_body(raw).unwrap(), "{\"ok\":true}");
    }

    #[test]
    fn extract_body_rejects_non_200() {
        let raw = b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n";
        assert!(extract_body(raw).is_err());
    }

    #[test]
    fn extract_body_rejects_missing_separator() {
        assert!(extract_body(b"HTTP/1.1 200 OK\nno crlf pair").is_err());
    }

    #[test]
    fn completeness_tracks_content_length() {
        assert!(!response_complete(
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nab"
        ));
        assert!(response_complete(
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nabcde"
        ));
    }

    #[test]
    fn completeness_without_length_is_headers_only() {
        assert!(!response_complete(b"HTTP/1.1 200 OK\r\n"));
        assert!(response_complete(
            b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\npartial"
        ));
    }

    #[test]
    fn content_length_is_case_insensitive() {
        assert_eq!(
            content_length(b"HTTP/1.1 200 OK\r\ncontent-LENGTH: 42"),
            Some(42)
        );
    }
}
