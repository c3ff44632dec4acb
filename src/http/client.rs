//! HTTP client exchange
//!
//! `HttpClient` runs request/response exchanges over one session and reports
//! whether the session is still fit for another exchange afterwards. It
//! never closes the session on its own; the caller takes the session back
//! with `into_inner` and decides between pooling and closing it.

use super::{HttpRequest, HttpResponse, HttpSession, ResponseParser, Result, SessionOps};
use std::time::Duration;

const READ_CHUNK: usize = 8192;

/// HTTP/1.1 client over a single session
pub struct HttpClient<S: SessionOps> {
    session: HttpSession<S>,
    reusable: bool,
    bytes_received: usize,
}

impl<S: SessionOps> HttpClient<S> {
    pub fn new(session: S) -> Self {
        HttpClient {
            session: HttpSession::new(session),
            reusable: true,
            bytes_received: 0,
        }
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.session.set_timeout(Some(timeout));
    }

    /// Write a request
    pub fn send_request(&mut self, request: &HttpRequest) -> Result<()> {
        self.session
            .write_all(&request.to_wire())
            .inspect_err(|_| self.reusable = false)
    }

    /// Read the response to a request previously sent with `send_request`
    pub fn receive_response(&mut self, request: &HttpRequest) -> Result<HttpResponse> {
        let result = self.read_response(request);
        if result.is_err() {
            self.reusable = false;
        }
        result
    }

    /// Send a request and read its response
    pub fn exchange(&mut self, request: &HttpRequest) -> Result<HttpResponse> {
        self.send_request(request)?;
        self.receive_response(request)
    }

    fn read_response(&mut self, request: &HttpRequest) -> Result<HttpResponse> {
        let mut parser = ResponseParser::new(request.method());
        let mut buf = vec![0u8; READ_CHUNK];

        loop {
            let n = self.session.read(&mut buf)?;
            if n == 0 {
                // Only an until-close body may legitimately end here
                let response = parser.finish_at_eof()?;
                self.reusable = false;
                return Ok(response);
            }
            self.bytes_received += n;

            if let Some(response) = parser.parse(&buf[..n])? {
                let framed_reusably = parser.framing().is_some_and(|f| f.is_reusable());
                self.reusable &= framed_reusably
                    && parser.leftover().is_empty()
                    && request.keep_alive()
                    && response.keep_alive();
                return Ok(response);
            }
        }
    }

    /// Whether every exchange so far completed cleanly and allows reuse
    pub fn is_reusable(&self) -> bool {
        self.reusable
    }

    /// Response bytes received over this client's lifetime
    pub fn bytes_received(&self) -> usize {
        self.bytes_received
    }

    pub fn session(&self) -> &S {
        self.session.get_ref()
    }

    pub fn into_inner(self) -> S {
        self.session.into_inner()
    }
}
