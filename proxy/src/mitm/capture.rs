//! HTTP request/response capture (§4.8): decodes both directions of an HTTP
//! stream (MitM-decrypted or cleartext), decompresses the body, and emits a
//! paired log record to the tracing sink.

use async_compression::tokio::bufread::{BrotliDecoder, GzipDecoder, ZlibDecoder, ZstdDecoder};
use http::{HeaderMap, Method, StatusCode};
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tracing::info;

const MAX_CAPTURED_BODY: usize = 1024 * 1024;

/// One decoded HTTP request, captured before being replayed/re-encoded to
/// the outbound leg.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
	pub method: Method,
	pub url: String,
	pub headers: HeaderMap,
	pub body: Vec<u8>,
}

/// One decoded HTTP response, paired with the request that produced it.
#[derive(Debug, Clone)]
pub struct CapturedResponse {
	pub status: StatusCode,
	pub headers: HeaderMap,
	pub body: Vec<u8>,
}

/// Parses one HTTP/1.1 request (request line + headers + body) out of
/// `raw`. Returns the parsed request and the number of bytes consumed.
pub fn parse_request(raw: &[u8]) -> Option<(CapturedRequest, usize)> {
	let head_end = find_header_end(raw)?;
	let head = std::str::from_utf8(&raw[..head_end]).ok()?;
	let mut lines = head.lines();
	let request_line = lines.next()?;
	let mut parts = request_line.split_whitespace();
	let method = Method::from_bytes(parts.next()?.as_bytes()).ok()?;
	let url = parts.next()?.to_string();

	let headers = parse_headers(lines)?;
	let body_start = head_end;
	let content_length = content_length(&headers).unwrap_or(0);
	let body_end = (body_start + content_length).min(raw.len());
	let body = raw[body_start..body_end].to_vec();

	Some((CapturedRequest { method, url, headers, body }, body_end))
}

/// Parses one HTTP/1.1 response (status line + headers + body).
pub fn parse_response(raw: &[u8]) -> Option<(CapturedResponse, usize)> {
	let head_end = find_header_end(raw)?;
	let head = std::str::from_utf8(&raw[..head_end]).ok()?;
	let mut lines = head.lines();
	let status_line = lines.next()?;
	let mut parts = status_line.split_whitespace();
	let _version = parts.next()?;
	let status = StatusCode::from_bytes(parts.next()?.as_bytes()).ok()?;

	let headers = parse_headers(lines)?;
	let body_start = head_end;
	let content_length = content_length(&headers).unwrap_or(0);
	let body_end = (body_start + content_length).min(raw.len());
	let body = raw[body_start..body_end].to_vec();

	Some((CapturedResponse { status, headers, body }, body_end))
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
	raw.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> Option<HeaderMap> {
	let mut headers = HeaderMap::new();
	for line in lines {
		if line.is_empty() {
			continue;
		}
		let (name, value) = line.split_once(':')?;
		let name = http::HeaderName::from_bytes(name.trim().as_bytes()).ok()?;
		let value = http::HeaderValue::from_str(value.trim()).ok()?;
		headers.append(name, value);
	}
	Some(headers)
}

fn content_length(headers: &HeaderMap) -> Option<usize> {
	headers.get(http::header::CONTENT_LENGTH)?.to_str().ok()?.parse().ok()
}

/// Decompresses `body` per its `Content-Encoding` header, capped at
/// [`MAX_CAPTURED_BODY`]. Unknown or absent encodings pass the body through
/// unchanged.
pub async fn decompress(headers: &HeaderMap, body: &[u8]) -> Vec<u8> {
	let encoding = headers.get(http::header::CONTENT_ENCODING).and_then(|v| v.to_str().ok()).unwrap_or("");

	let reader = BufReader::new(body);
	let decoded: Option<Box<dyn AsyncRead + Unpin + Send>> = match encoding {
		"gzip" => Some(Box::new(GzipDecoder::new(reader))),
		"deflate" => Some(Box::new(ZlibDecoder::new(reader))),
		"br" => Some(Box::new(BrotliDecoder::new(reader))),
		"zstd" => Some(Box::new(ZstdDecoder::new(reader))),
		_ => None,
	};

	match decoded {
		Some(mut decoder) => {
			let mut out = Vec::new();
			let mut limited = (&mut decoder).take(MAX_CAPTURED_BODY as u64);
			match limited.read_to_end(&mut out).await {
				Ok(_) => out,
				Err(_) => body.to_vec(),
			}
		},
		None => body.to_vec(),
	}
}

/// Logs one matched request/response pair to the tracing sink (§4.8,
/// scenario 6: "appears in the capture sink with status and headers both
/// present").
pub fn log_pair(request: &CapturedRequest, response: &CapturedResponse, decoded_body: &[u8]) {
	info!(
		method = %request.method,
		url = %request.url,
		status = %response.status,
		request_headers = request.headers.len(),
		response_headers = response.headers.len(),
		body_len = decoded_body.len(),
		"captured HTTP exchange"
	);
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_get_request_line_and_headers() {
		let raw = b"GET / HTTP/1.1\r\nHost: a.example.com\r\nContent-Length: 0\r\n\r\n";
		let (req, consumed) = parse_request(raw).unwrap();
		assert_eq!(req.method, Method::GET);
		assert_eq!(req.url, "/");
		assert_eq!(consumed, raw.len());
	}

	#[test]
	fn parses_status_line_and_body() {
		let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
		let (resp, consumed) = parse_response(raw).unwrap();
		assert_eq!(resp.status, StatusCode::OK);
		assert_eq!(resp.body, b"hello");
		assert_eq!(consumed, raw.len());
	}

	#[tokio::test]
	async fn passes_through_body_with_unknown_encoding() {
		let mut headers = HeaderMap::new();
		headers.insert(http::header::CONTENT_ENCODING, "identity".parse().unwrap());
		let out = decompress(&headers, b"plain body").await;
		assert_eq!(out, b"plain body");
	}
}
