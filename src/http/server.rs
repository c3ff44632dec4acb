//! HTTP server side of an exchange
//!
//! Reads requests from and writes responses to one accepted session. Used by
//! loopback servers to answer the pooled client.

use super::{Error, HttpRequest, HttpResponse, HttpSession, RequestParser, Result, SessionOps, Status};
use std::time::Duration;

const READ_CHUNK: usize = 4096;

/// HTTP server
///
/// Provides methods for receiving requests and sending responses. Bytes
/// past the end of one request are kept for the next.
pub struct HttpServer<S: SessionOps> {
    session: HttpSession<S>,
    pending: Vec<u8>,
}

impl<S: SessionOps> HttpServer<S> {
    pub fn new(session: S) -> Self {
        HttpServer {
            session: HttpSession::new(session),
            pending: Vec::new(),
        }
    }

    /// Set the timeout for operations
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.session.set_timeout(timeout);
    }

    /// Receive the next request
    ///
    /// Returns `Ok(None)` when the peer closed the connection between
    /// requests.
    pub fn receive_request(&mut self) -> Result<Option<HttpRequest>> {
        let mut parser = RequestParser::new();

        if !self.pending.is_empty() {
            let pending = std::mem::take(&mut self.pending);
            if let Some(request) = parser.parse(&pending)? {
                self.pending = parser.leftover().to_vec();
                return Ok(Some(request));
            }
        }

        let mut started = false;
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = self.session.read(&mut buf)?;
            if n == 0 {
                return if started { Err(Error::ConnectionClosed) } else { Ok(None) };
            }
            started = true;

            if let Some(request) = parser.parse(&buf[..n])? {
                self.pending = parser.leftover().to_vec();
                return Ok(Some(request));
            }
        }
    }

    /// Send an HTTP response
    pub fn send_response(&mut self, response: &HttpResponse) -> Result<()> {
        self.session.write_all(&response.to_wire())
    }

    /// Send a simple 200 OK response
    pub fn send_ok(&mut self, body: &[u8]) -> Result<()> {
        let response = HttpResponse::builder()
            .status(Status::OK)
            .header("Content-Type", "text/plain")
            .body(body.to_vec())
            .build();

        self.send_response(&response)
    }

    pub fn session(&self) -> &S {
        self.session.get_ref()
    }

    pub fn close(&mut self) -> Result<()> {
        self.session.close()
    }

    pub fn into_inner(self) -> S {
        self.session.into_inner()
    }
}
