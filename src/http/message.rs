//! HTTP message types
//!
//! Requests and responses as exchanged over a pooled session, together with
//! the keep-alive rules that decide whether the session may be reused.

use super::{Error, Headers, Result, CRLF};
use std::fmt;
use std::str::FromStr;

/// HTTP methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Patch,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
            Method::Patch => "PATCH",
        }
    }

    /// Methods that may be replayed on a fresh connection after a stale
    /// pooled connection failed (RFC 9110 section 9.2.2)
    pub fn is_idempotent(&self) -> bool {
        !matches!(self, Method::Post | Method::Patch)
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "GET" => Ok(Method::Get),
            "HEAD" => Ok(Method::Head),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            "OPTIONS" => Ok(Method::Options),
            "PATCH" => Ok(Method::Patch),
            _ => Err(Error::InvalidMethod(s.to_string())),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Version {
    Http10,
    #[default]
    Http11,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "HTTP/1.0" => Ok(Version::Http10),
            "HTTP/1.1" => Ok(Version::Http11),
            _ => Err(Error::InvalidVersion(s.to_string())),
        }
    }
}

/// HTTP status code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(u16);

impl Status {
    pub const OK: Status = Status(200);
    pub const BAD_REQUEST: Status = Status(400);
    pub const NOT_FOUND: Status = Status(404);
    pub const INTERNAL_SERVER_ERROR: Status = Status(500);

    pub fn new(code: u16) -> Result<Self> {
        if (100..600).contains(&code) {
            Ok(Status(code))
        } else {
            Err(Error::InvalidStatus(code.to_string()))
        }
    }

    pub fn code(&self) -> u16 {
        self.0
    }

    /// Responses that never carry a body regardless of framing headers
    pub fn is_bodiless(&self) -> bool {
        (100..200).contains(&self.0) || self.0 == 204 || self.0 == 304
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.0)
    }

    pub fn reason_phrase(&self) -> &'static str {
        match self.0 {
            200 => "OK",
            201 => "Created",
            204 => "No Content",
            304 => "Not Modified",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            421 => "Misdirected Request",
            500 => "Internal Server Error",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.0, self.reason_phrase())
    }
}

/// Write start line, headers and body
fn encode(start_line: &str, headers: &Headers, body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(start_line.len() + body.len() + 256);
    buf.extend_from_slice(start_line.as_bytes());
    buf.extend_from_slice(CRLF.as_bytes());
    for (name, value) in headers.iter() {
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(CRLF.as_bytes());
    }
    buf.extend_from_slice(CRLF.as_bytes());
    buf.extend_from_slice(body);
    buf
}

/// Whether a message with this version and headers allows connection reuse
fn keep_alive(version: Version, headers: &Headers) -> bool {
    match version {
        Version::Http11 => !headers.has_token("Connection", "close"),
        Version::Http10 => headers.has_token("Connection", "keep-alive"),
    }
}

/// HTTP request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    method: Method,
    target: String,
    version: Version,
    headers: Headers,
    body: Vec<u8>,
}

impl HttpRequest {
    pub fn builder() -> HttpRequestBuilder {
        HttpRequestBuilder::default()
    }

    pub fn method(&self) -> Method {
        self.method
    }

    /// Request target (origin form, e.g. `/index.html?x=1`)
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn keep_alive(&self) -> bool {
        keep_alive(self.version, &self.headers)
    }

    /// Wire encoding; `Content-Length` is filled in for non-empty bodies
    pub fn to_wire(&self) -> Vec<u8> {
        let start = format!("{} {} {}", self.method, self.target, self.version.as_str());
        if !self.body.is_empty() && !self.headers.contains("Content-Length") {
            let mut headers = self.headers.clone();
            headers.set("Content-Length", self.body.len().to_string());
            return encode(&start, &headers, &self.body);
        }
        encode(&start, &self.headers, &self.body)
    }
}

/// Builder for HTTP requests
#[derive(Debug, Default)]
pub struct HttpRequestBuilder {
    method: Option<Method>,
    target: Option<String>,
    version: Version,
    headers: Headers,
    body: Vec<u8>,
}

impl HttpRequestBuilder {
    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    /// Set a header, replacing earlier values of the same name
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn build(self) -> HttpRequest {
        HttpRequest {
            method: self.method.unwrap_or(Method::Get),
            target: self.target.unwrap_or_else(|| "/".to_string()),
            version: self.version,
            headers: self.headers,
            body: self.body,
        }
    }
}

/// HTTP response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    version: Version,
    status: Status,
    reason: String,
    headers: Headers,
    body: Vec<u8>,
}

impl HttpResponse {
    pub fn builder() -> HttpResponseBuilder {
        HttpResponseBuilder::default()
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Body as UTF-8 text, lossily decoded
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn keep_alive(&self) -> bool {
        keep_alive(self.version, &self.headers)
    }

    /// Wire encoding; `Content-Length` is always written unless the message
    /// is chunked or the status forbids a body
    pub fn to_wire(&self) -> Vec<u8> {
        let start = format!("{} {} {}", self.version.as_str(), self.status.code(), self.reason);
        if !self.status.is_bodiless()
            && !self.headers.is_chunked()
            && !self.headers.contains("Content-Length")
        {
            let mut headers = self.headers.clone();
            headers.set("Content-Length", self.body.len().to_string());
            return encode(&start, &headers, &self.body);
        }
        encode(&start, &self.headers, &self.body)
    }
}

/// Builder for HTTP responses
#[derive(Debug, Default)]
pub struct HttpResponseBuilder {
    version: Version,
    status: Option<Status>,
    reason: Option<String>,
    headers: Headers,
    body: Vec<u8>,
}

impl HttpResponseBuilder {
    pub fn version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Set a header, replacing earlier values of the same name
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn build(self) -> HttpResponse {
        let status = self.status.unwrap_or(Status::OK);
        HttpResponse {
            version: self.version,
            status,
            reason: self
                .reason
                .unwrap_or_else(|| status.reason_phrase().to_string()),
            headers: self.headers,
            body: self.body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_parsing() {
        assert_eq!("GET".parse::<Method>().unwrap(), Method::Get);
        assert!("get".parse::<Method>().is_err());
        assert!(Method::Get.is_idempotent());
        assert!(Method::Put.is_idempotent());
        assert!(!Method::Post.is_idempotent());
    }

    #[test]
    fn test_status_bounds() {
        assert!(Status::new(99).is_err());
        assert!(Status::new(600).is_err());
        assert!(Status::new(204).unwrap().is_bodiless());
        assert_eq!(Status::OK.to_string(), "200 OK");
    }

    #[test]
    fn test_keep_alive_rules() {
        let resp = HttpResponse::builder().build();
        assert!(resp.keep_alive());

        let resp = HttpResponse::builder().header("Connection", "close").build();
        assert!(!resp.keep_alive());

        let resp = HttpResponse::builder().version(Version::Http10).build();
        assert!(!resp.keep_alive());

        let resp = HttpResponse::builder()
            .version(Version::Http10)
            .header("Connection", "Keep-Alive")
            .build();
        assert!(resp.keep_alive());
    }

    #[test]
    fn test_request_to_wire() {
        let req = HttpRequest::builder()
            .method(Method::Post)
            .target("/submit")
            .header("Host", "example.com")
            .body(b"abc".to_vec())
            .build();

        let wire = String::from_utf8(req.to_wire()).unwrap();
        assert!(wire.starts_with("POST /submit HTTP/1.1\r\n"));
        assert!(wire.contains("Host: example.com\r\n"));
        assert!(wire.contains("Content-Length: 3\r\n"));
        assert!(wire.ends_with("\r\n\r\nabc"));
    }

    #[test]
    fn test_response_to_wire_adds_length() {
        let resp = HttpResponse::builder().body(b"hi".to_vec()).build();
        let wire = String::from_utf8(resp.to_wire()).unwrap();
        assert!(wire.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(wire.contains("Content-Length: 2\r\n"));

        let resp = HttpResponse::builder().status(Status::new(204).unwrap()).build();
        let wire = String::from_utf8(resp.to_wire()).unwrap();
        assert!(!wire.contains("Content-Length"));
    }
}
