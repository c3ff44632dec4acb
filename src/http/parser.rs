//! HTTP/1.1 message parsing
//!
//! Incremental parsers for requests and responses. Bytes are fed as they
//! arrive; a parser yields a message once its head and its framed body are
//! complete. How a body is framed decides whether the connection can carry
//! another exchange afterwards, so the framing is exposed to callers.

use super::{
    Error, Headers, HttpRequest, HttpResponse, Method, Result, Status, Version, MAX_HEAD_BYTES,
};

/// Largest body either parser will buffer
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Longest chunk-size line, extensions included
const MAX_CHUNK_LINE: usize = 4096;

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// End of the next line in `buf`, or `TooLarge` once it cannot fit in `limit`
fn line_end(buf: &[u8], limit: usize) -> Result<Option<usize>> {
    match find_crlf(buf) {
        Some(pos) if pos <= limit => Ok(Some(pos)),
        // A lone trailing CR may be half of the terminator
        None if buf.len() <= limit + 1 => Ok(None),
        _ => Err(Error::TooLarge),
    }
}

/// How the body of a message is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body follows the head
    Empty,
    /// Exactly this many bytes follow
    Length(usize),
    /// Chunked transfer coding
    Chunked,
    /// Body runs until the peer closes; the connection cannot be reused
    UntilClose,
}

impl BodyFraming {
    /// Whether the connection may carry another message after this one
    pub fn is_reusable(&self) -> bool {
        !matches!(self, BodyFraming::UntilClose)
    }
}

/// Parse `METHOD TARGET VERSION`
pub fn parse_request_line(line: &str) -> Result<(Method, String, Version)> {
    let mut parts = line.split(' ');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(target), Some(version), None) if !target.is_empty() => {
            Ok((method.parse()?, target.to_string(), version.parse()?))
        }
        _ => Err(Error::Parse(format!("Invalid request line: {:?}", line))),
    }
}

/// Parse `VERSION CODE [REASON]`
pub fn parse_status_line(line: &str) -> Result<(Version, Status, String)> {
    let mut parts = line.splitn(3, ' ');
    let version = parts
        .next()
        .ok_or_else(|| Error::Parse(format!("Invalid status line: {:?}", line)))?
        .parse()?;
    let code = parts
        .next()
        .and_then(|c| c.parse::<u16>().ok())
        .ok_or_else(|| Error::Parse(format!("Invalid status line: {:?}", line)))?;
    let status = Status::new(code)?;
    let reason = match parts.next() {
        Some(reason) if !reason.is_empty() => reason.to_string(),
        _ => status.reason_phrase().to_string(),
    };
    Ok((version, status, reason))
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ChunkState {
    Size,
    Data(usize),
    DataEnd,
    Trailer,
    Done,
}

/// Chunked transfer coding decoder
#[derive(Debug)]
struct ChunkedDecoder {
    state: ChunkState,
    trailer_bytes: usize,
}

impl ChunkedDecoder {
    fn new() -> Self {
        ChunkedDecoder {
            state: ChunkState::Size,
            trailer_bytes: 0,
        }
    }

    /// Move decoded bytes from `input` to `out`; true once the last chunk
    /// and trailers are consumed
    fn decode(&mut self, input: &mut Vec<u8>, out: &mut Vec<u8>) -> Result<bool> {
        loop {
            match self.state {
                ChunkState::Size => {
                    let Some(pos) = line_end(input, MAX_CHUNK_LINE)? else {
                        return Ok(false);
                    };
                    let line = String::from_utf8_lossy(&input[..pos]).into_owned();
                    let size_str = line.split(';').next().unwrap_or_default().trim();
                    let size = usize::from_str_radix(size_str, 16)
                        .map_err(|_| Error::InvalidChunkSize(size_str.to_string()))?;
                    input.drain(..pos + 2);
                    if out.len().saturating_add(size) > MAX_BODY_BYTES {
                        return Err(Error::TooLarge);
                    }
                    self.state = if size == 0 {
                        ChunkState::Trailer
                    } else {
                        ChunkState::Data(size)
                    };
                }
                ChunkState::Data(remaining) => {
                    if input.is_empty() {
                        return Ok(false);
                    }
                    let n = remaining.min(input.len());
                    out.extend(input.drain(..n));
                    self.state = if n == remaining {
                        ChunkState::DataEnd
                    } else {
                        ChunkState::Data(remaining - n)
                    };
                }
                ChunkState::DataEnd => {
                    if input.len() < 2 {
                        return Ok(false);
                    }
                    if &input[..2] != b"\r\n" {
                        return Err(Error::Parse("Expected CRLF after chunk".to_string()));
                    }
                    input.drain(..2);
                    self.state = ChunkState::Size;
                }
                ChunkState::Trailer => {
                    let limit = MAX_HEAD_BYTES.saturating_sub(self.trailer_bytes);
                    let Some(pos) = line_end(input, limit)? else {
                        return Ok(false);
                    };
                    self.trailer_bytes += pos + 2;
                    input.drain(..pos + 2);
                    if pos == 0 {
                        self.state = ChunkState::Done;
                    }
                }
                ChunkState::Done => return Ok(true),
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum State {
    Head,
    Body(BodyFraming),
    Complete,
}

/// Shared head/body machinery behind both parsers
#[derive(Debug)]
struct Framed {
    state: State,
    buffer: Vec<u8>,
    start_line: Option<String>,
    headers: Headers,
    body: Vec<u8>,
    chunked: ChunkedDecoder,
    framing: Option<BodyFraming>,
}

impl Framed {
    fn new() -> Self {
        Framed {
            state: State::Head,
            buffer: Vec::new(),
            start_line: None,
            headers: Headers::new(),
            body: Vec::new(),
            chunked: ChunkedDecoder::new(),
            framing: None,
        }
    }

    /// Feed bytes; `frame` picks the body framing once the head is complete.
    /// Returns true when the message is complete.
    fn feed<F>(&mut self, data: &[u8], frame: F) -> Result<bool>
    where
        F: FnOnce(&str, &Headers) -> Result<BodyFraming>,
    {
        self.buffer.extend_from_slice(data);

        if self.state == State::Head {
            if !self.parse_head()? {
                return Ok(false);
            }
            let start_line = self.start_line.as_deref().unwrap_or_default();
            let framing = frame(start_line, &self.headers)?;
            self.framing = Some(framing);
            self.state = State::Body(framing);
        }

        match self.state {
            State::Head => Ok(false),
            State::Body(BodyFraming::Empty) => {
                self.state = State::Complete;
                Ok(true)
            }
            State::Body(BodyFraming::Length(len)) => {
                if len > MAX_BODY_BYTES {
                    return Err(Error::TooLarge);
                }
                if self.buffer.len() < len {
                    return Ok(false);
                }
                self.body = self.buffer.drain(..len).collect();
                self.state = State::Complete;
                Ok(true)
            }
            State::Body(BodyFraming::Chunked) => {
                if self.chunked.decode(&mut self.buffer, &mut self.body)? {
                    self.state = State::Complete;
                    return Ok(true);
                }
                Ok(false)
            }
            State::Body(BodyFraming::UntilClose) => {
                self.body.append(&mut self.buffer);
                if self.body.len() > MAX_BODY_BYTES {
                    return Err(Error::TooLarge);
                }
                Ok(false)
            }
            State::Complete => Ok(true),
        }
    }

    fn parse_head(&mut self) -> Result<bool> {
        loop {
            let Some(pos) = find_crlf(&self.buffer) else {
                if self.buffer.len() > MAX_HEAD_BYTES {
                    return Err(Error::TooLarge);
                }
                return Ok(false);
            };
            let line = String::from_utf8_lossy(&self.buffer[..pos]).into_owned();
            self.buffer.drain(..pos + 2);

            if self.start_line.is_none() {
                // Tolerate stray CRLFs before the start line (RFC 9112 section 2.2)
                if !line.is_empty() {
                    self.start_line = Some(line);
                }
                continue;
            }
            if line.is_empty() {
                return Ok(true);
            }
            let (name, value) = Headers::parse_header_line(&line)?;
            self.headers.insert(name, value)?;
        }
    }

    fn framing(&self) -> Option<BodyFraming> {
        self.framing
    }

    /// Start over on the next message, keeping buffered bytes
    fn reset(&mut self) {
        let buffer = std::mem::take(&mut self.buffer);
        *self = Framed::new();
        self.buffer = buffer;
    }
}

/// HTTP request parser
#[derive(Debug)]
pub struct RequestParser {
    inner: Framed,
}

impl RequestParser {
    pub fn new() -> Self {
        RequestParser {
            inner: Framed::new(),
        }
    }

    /// Feed data; `Ok(Some(request))` once complete
    pub fn parse(&mut self, data: &[u8]) -> Result<Option<HttpRequest>> {
        let complete = self.inner.feed(data, |_, headers| {
            if headers.is_chunked() {
                return Ok(BodyFraming::Chunked);
            }
            Ok(match headers.content_length()? {
                Some(0) | None => BodyFraming::Empty,
                Some(len) => BodyFraming::Length(len),
            })
        })?;
        if !complete {
            return Ok(None);
        }

        let line = self.inner.start_line.take().unwrap_or_default();
        let (method, target, version) = parse_request_line(&line)?;
        let request = HttpRequest::builder()
            .method(method)
            .target(target)
            .version(version)
            .headers(std::mem::take(&mut self.inner.headers))
            .body(std::mem::take(&mut self.inner.body))
            .build();
        Ok(Some(request))
    }

    /// Bytes received past the end of the parsed message
    pub fn leftover(&self) -> &[u8] {
        &self.inner.buffer
    }
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

/// HTTP response parser
#[derive(Debug)]
pub struct ResponseParser {
    inner: Framed,
    request_method: Method,
}

impl ResponseParser {
    /// Parser for the response to a request with this method
    pub fn new(request_method: Method) -> Self {
        ResponseParser {
            inner: Framed::new(),
            request_method,
        }
    }

    /// Feed data; `Ok(Some(response))` once the final response is complete
    ///
    /// Informational responses other than `101` are consumed and dropped.
    pub fn parse(&mut self, mut data: &[u8]) -> Result<Option<HttpResponse>> {
        loop {
            let Some(response) = self.parse_one(data)? else {
                return Ok(None);
            };
            let code = response.status().code();
            if !(100..200).contains(&code) || code == 101 {
                return Ok(Some(response));
            }
            self.inner.reset();
            data = &[];
        }
    }

    fn parse_one(&mut self, data: &[u8]) -> Result<Option<HttpResponse>> {
        let method = self.request_method;
        let complete = self.inner.feed(data, |line, headers| {
            let (_, status, _) = parse_status_line(line)?;
            if method == Method::Head || status.is_bodiless() {
                return Ok(BodyFraming::Empty);
            }
            if headers.is_chunked() {
                return Ok(BodyFraming::Chunked);
            }
            Ok(match headers.content_length()? {
                Some(0) => BodyFraming::Empty,
                Some(len) => BodyFraming::Length(len),
                None => BodyFraming::UntilClose,
            })
        })?;
        if !complete {
            return Ok(None);
        }
        self.build().map(Some)
    }

    /// The peer closed the connection; completes an until-close body
    pub fn finish_at_eof(&mut self) -> Result<HttpResponse> {
        match self.inner.framing() {
            Some(BodyFraming::UntilClose) => {
                self.inner.state = State::Complete;
                self.build()
            }
            _ => Err(Error::ConnectionClosed),
        }
    }

    /// Body framing, known once the head has been parsed
    pub fn framing(&self) -> Option<BodyFraming> {
        self.inner.framing()
    }

    /// Bytes received past the end of the parsed message
    pub fn leftover(&self) -> &[u8] {
        &self.inner.buffer
    }

    fn build(&mut self) -> Result<HttpResponse> {
        let line = self.inner.start_line.take().unwrap_or_default();
        let (version, status, reason) = parse_status_line(&line)?;
        Ok(HttpResponse::builder()
            .version(version)
            .status(status)
            .reason(reason)
            .headers(std::mem::take(&mut self.inner.headers))
            .body(std::mem::take(&mut self.inner.body))
            .build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request_line() {
        let (method, target, version) = parse_request_line("GET /index.html HTTP/1.1").unwrap();
        assert_eq!(method, Method::Get);
        assert_eq!(target, "/index.html");
        assert_eq!(version, Version::Http11);

        assert!(parse_request_line("GET /").is_err());
        assert!(parse_request_line("GET / HTTP/1.1 extra").is_err());
    }

    #[test]
    fn test_parse_status_line() {
        let (version, status, reason) = parse_status_line("HTTP/1.0 404").unwrap();
        assert_eq!(version, Version::Http10);
        assert_eq!(status.code(), 404);
        assert_eq!(reason, "Not Found");

        assert!(parse_status_line("HTTP/1.1 abc OK").is_err());
    }

    #[test]
    fn test_response_incremental() {
        let mut parser = ResponseParser::new(Method::Get);

        assert!(parser.parse(b"HTTP/1.1 ").unwrap().is_none());
        assert!(parser.parse(b"200 OK\r\nContent-Length: 4\r\n").unwrap().is_none());
        assert!(parser.parse(b"\r\nTe").unwrap().is_none());
        assert_eq!(parser.framing(), Some(BodyFraming::Length(4)));

        let resp = parser.parse(b"st").unwrap().unwrap();
        assert_eq!(resp.body(), b"Test");
        assert!(parser.leftover().is_empty());
    }

    #[test]
    fn test_response_chunked() {
        let mut parser = ResponseParser::new(Method::Get);
        let data = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nHello\r\n7;ext=1\r\n, World\r\n0\r\nX-Trailer: 1\r\n\r\n";

        // Feed byte by byte to exercise every partial state
        let mut result = None;
        for b in data.iter() {
            if let Some(resp) = parser.parse(std::slice::from_ref(b)).unwrap() {
                result = Some(resp);
            }
        }

        let resp = result.unwrap();
        assert_eq!(resp.body(), b"Hello, World");
        assert_eq!(parser.framing(), Some(BodyFraming::Chunked));
    }

    #[test]
    fn test_chunk_size_line_is_bounded() {
        let mut parser = ResponseParser::new(Method::Get);
        let head = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5;";
        assert!(parser.parse(head).unwrap().is_none());
        let extension = vec![b'x'; 1024];
        let mut result = Ok(None);
        for _ in 0..8 {
            result = parser.parse(&extension);
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(Error::TooLarge)));
    }

    #[test]
    fn test_trailers_are_bounded() {
        let mut parser = ResponseParser::new(Method::Get);
        let head = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n0\r\n";
        assert!(parser.parse(head).unwrap().is_none());
        let line = format!("X-Pad: {}\r\n", "p".repeat(1000));
        let mut result = Ok(None);
        for _ in 0..(MAX_HEAD_BYTES / line.len() + 2) {
            result = parser.parse(line.as_bytes());
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(Error::TooLarge)));
    }

    #[test]
    fn test_interim_responses_skipped() {
        let mut parser = ResponseParser::new(Method::Get);
        let data = b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 103 Early Hints\r\nLink: </a.css>\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";

        let resp = parser.parse(data).unwrap().unwrap();
        assert_eq!(resp.status().code(), 200);
        assert_eq!(resp.body(), b"ok");
        assert_eq!(resp.headers().get("Link"), None);
        assert!(parser.leftover().is_empty());

        let mut split = ResponseParser::new(Method::Get);
        assert!(split.parse(b"HTTP/1.1 103 Early Hints\r\n\r\n").unwrap().is_none());
        let resp = split.parse(b"HTTP/1.1 204 No Content\r\n\r\n").unwrap().unwrap();
        assert_eq!(resp.status().code(), 204);
    }

    #[test]
    fn test_response_bad_chunk_size() {
        let mut parser = ResponseParser::new(Method::Get);
        let data = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n";
        assert!(matches!(parser.parse(data), Err(Error::InvalidChunkSize(_))));
    }

    #[test]
    fn test_response_until_close() {
        let mut parser = ResponseParser::new(Method::Get);
        assert!(parser.parse(b"HTTP/1.1 200 OK\r\n\r\npartial").unwrap().is_none());
        assert_eq!(parser.framing(), Some(BodyFraming::UntilClose));
        assert!(!BodyFraming::UntilClose.is_reusable());

        let resp = parser.finish_at_eof().unwrap();
        assert_eq!(resp.body(), b"partial");
    }

    #[test]
    fn test_eof_before_complete_is_error() {
        let mut parser = ResponseParser::new(Method::Get);
        assert!(parser.parse(b"HTTP/1.1 200 OK\r\nContent-Length: 9\r\n\r\nabc").unwrap().is_none());
        assert!(matches!(parser.finish_at_eof(), Err(Error::ConnectionClosed)));
    }

    #[test]
    fn test_head_response_has_no_body() {
        let mut parser = ResponseParser::new(Method::Head);
        let resp = parser
            .parse(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n")
            .unwrap()
            .unwrap();
        assert!(resp.body().is_empty());
    }

    #[test]
    fn test_leftover_after_response() {
        let mut parser = ResponseParser::new(Method::Get);
        let resp = parser
            .parse(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nokEXTRA")
            .unwrap()
            .unwrap();
        assert_eq!(resp.body(), b"ok");
        assert_eq!(parser.leftover(), b"EXTRA");
    }

    #[test]
    fn test_request_parser() {
        let mut parser = RequestParser::new();
        let req = parser
            .parse(b"\r\nPOST /x HTTP/1.1\r\nHost: a\r\nContent-Length: 3\r\n\r\nabc")
            .unwrap()
            .unwrap();
        assert_eq!(req.method(), Method::Post);
        assert_eq!(req.target(), "/x");
        assert_eq!(req.headers().get("host"), Some("a"));
        assert_eq!(req.body(), b"abc");
    }

    #[test]
    fn test_head_too_large() {
        let mut parser = RequestParser::new();
        let junk = vec![b'a'; MAX_HEAD_BYTES + 1];
        assert!(matches!(parser.parse(&junk), Err(Error::TooLarge)));
    }

    #[test]
    fn test_find_crlf() {
        assert_eq!(find_crlf(b"Hello\r\nWorld"), Some(5));
        assert_eq!(find_crlf(b"NoEOL"), None);
        assert_eq!(find_crlf(b"\r\n"), Some(0));
    }
}
