//! HTTP headers
//!
//! Ordered, case-insensitive header storage plus the handful of header
//! interpretations connection reuse depends on.

use super::{Error, Result, MAX_HEADERS};
use std::fmt;

/// HTTP headers collection
///
/// Insertion order is kept and names compare case-insensitively. Repeated
/// names are stored as separate entries.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Headers {
            entries: Vec::new(),
        }
    }

    /// Append a header
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> Result<()> {
        if self.entries.len() >= MAX_HEADERS {
            return Err(Error::InvalidHeader(format!(
                "more than {} headers",
                MAX_HEADERS
            )));
        }
        self.entries.push((name.into(), value.into()));
        Ok(())
    }

    /// Replace every value of `name` with a single one
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.entries.push((name, value.into()));
    }

    /// First value for a header (case-insensitive)
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Whether a comma-separated header carries `token` (case-insensitive)
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.entries
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .flat_map(|(_, v)| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    /// Parsed `Content-Length`, rejecting conflicting duplicates
    pub fn content_length(&self) -> Result<Option<usize>> {
        let mut found: Option<usize> = None;
        for (_, value) in self
            .entries
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case("Content-Length"))
        {
            let len = value
                .trim()
                .parse::<usize>()
                .map_err(|_| Error::Parse(format!("Invalid Content-Length: {}", value)))?;
            match found {
                Some(prev) if prev != len => {
                    return Err(Error::Parse("Conflicting Content-Length headers".to_string()))
                }
                _ => found = Some(len),
            }
        }
        Ok(found)
    }

    pub fn is_chunked(&self) -> bool {
        self.has_token("Transfer-Encoding", "chunked")
    }

    /// Parse a `name: value` header line
    pub fn parse_header_line(line: &str) -> Result<(String, String)> {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::InvalidHeader(format!("No colon in header: {}", line)))?;

        let name = name.trim();
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(Error::InvalidHeader(format!("Bad header name: {:?}", name)));
        }

        Ok((name.to_string(), value.trim().to_string()))
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.entries {
            writeln!(f, "{}: {}", name, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_get() {
        let mut headers = Headers::new();
        headers.insert("Content-Type", "text/html").unwrap();

        assert_eq!(headers.get("content-type"), Some("text/html"));
        assert_eq!(headers.get("CONTENT-TYPE"), Some("text/html"));
        assert!(!headers.contains("Missing"));
    }

    #[test]
    fn test_set_replaces() {
        let mut headers = Headers::new();
        headers.insert("Host", "a").unwrap();
        headers.insert("host", "b").unwrap();
        headers.set("Host", "c");

        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("HOST"), Some("c"));
    }

    #[test]
    fn test_connection_tokens() {
        let mut headers = Headers::new();
        headers.insert("Connection", "Upgrade, close").unwrap();

        assert!(headers.has_token("connection", "close"));
        assert!(headers.has_token("Connection", "upgrade"));
        assert!(!headers.has_token("Connection", "keep-alive"));
    }

    #[test]
    fn test_content_length() {
        let mut headers = Headers::new();
        assert_eq!(headers.content_length().unwrap(), None);

        headers.insert("Content-Length", "12").unwrap();
        headers.insert("content-length", "12").unwrap();
        assert_eq!(headers.content_length().unwrap(), Some(12));

        headers.insert("Content-Length", "13").unwrap();
        assert!(headers.content_length().is_err());
    }

    #[test]
    fn test_chunked() {
        let mut headers = Headers::new();
        headers.insert("Transfer-Encoding", "gzip, chunked").unwrap();
        assert!(headers.is_chunked());
    }

    #[test]
    fn test_parse_header_line() {
        let (name, value) = Headers::parse_header_line("X-Custom:  value  ").unwrap();
        assert_eq!(name, "X-Custom");
        assert_eq!(value, "value");

        assert!(Headers::parse_header_line("Invalid").is_err());
        assert!(Headers::parse_header_line(": value").is_err());
        assert!(Headers::parse_header_line("Bad Name: v").is_err());
    }

    #[test]
    fn test_max_headers() {
        let mut headers = Headers::new();
        for i in 0..MAX_HEADERS {
            headers.insert(format!("H-{}", i), "v").unwrap();
        }
        assert!(headers.insert("One-Too-Many", "v").is_err());
    }
}
