//! Request-line parsing.
//!
//! `METHOD SP URL [SP HTTP/version] CRLF`; a missing version means HTTP/0.9.
//! The URL is split into scheme, host, port, path and query; the path is
//! additionally kept as segments for the routing trie.

use super::ProtocolError;

/// Protocol version of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
pub enum HttpVersion {
    V09,
    V10,
    V11,
}

impl HttpVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpVersion::V09 => "HTTP/0.9",
            HttpVersion::V10 => "HTTP/1.0",
            HttpVersion::V11 => "HTTP/1.1",
        }
    }

    fn parse(token: &str) -> Result<Self, ProtocolError> {
        match token {
            "HTTP/0.9" => Ok(HttpVersion::V09),
            "HTTP/1.0" => Ok(HttpVersion::V10),
            "HTTP/1.1" => Ok(HttpVersion::V11),
            _ => Err(ProtocolError::BadRequestLine),
        }
    }
}

/// A parsed request line.
#[derive(Debug, Clone)]
pub struct Request {
    /// Original request line, for logging
    pub line: String,
    pub method: String,
    pub version: HttpVersion,
    /// URL scheme when the request used absolute form
    pub protocol: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Path portion, always starting with `/`
    pub url: String,
    pub query: Option<String>,
    /// Path split on `/`, empty segments dropped
    pub urlv: Vec<String>,
}

impl Request {
    /// Parse a request line.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let mut parts = line.split_ascii_whitespace();
        let method = parts.next().ok_or(ProtocolError::BadRequestLine)?;
        let target = parts.next().ok_or(ProtocolError::BadRequestLine)?;
        let version = match parts.next() {
            Some(token) => HttpVersion::parse(token)?,
            None => HttpVersion::V09,
        };
        if parts.next().is_some() || method.is_empty() {
            return Err(ProtocolError::BadRequestLine);
        }

        let (protocol, host, port, rest) = split_authority(target)?;
        let (path, query) = match rest.split_once('?') {
            Some((path, query)) => (path, Some(query.to_string())),
            None => (rest.as_str(), None),
        };
        let url = if path.is_empty() {
            "/".to_string()
        } else {
            path.to_string()
        };
        let urlv = url
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        Ok(Request {
            line: line.to_string(),
            method: method.to_string(),
            version,
            protocol,
            host,
            port,
            url,
            query,
            urlv,
        })
    }
}

type Authority = (Option<String>, Option<String>, Option<u16>, String);

/// Split `scheme://host[:port]/path` targets; origin-form targets pass
/// through with no authority.
fn split_authority(target: &str) -> Result<Authority, ProtocolError> {
    let Some((scheme, rest)) = target.split_once("://") else {
        if target.starts_with('/') || target == "*" {
            return Ok((None, None, None, target.to_string()));
        }
        return Err(ProtocolError::BadRequestLine);
    };

    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port.parse().map_err(|_| ProtocolError::BadRequestLine)?;
            (host, Some(port))
        }
        None => (authority, None),
    };
    if host.is_empty() {
        return Err(ProtocolError::BadRequestLine);
    }
    Ok((
        Some(scheme.to_string()),
        Some(host.to_string()),
        port,
        path.to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_form() {
        let req = Request::parse("GET /a/b?x=1 HTTP/1.0").unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.url, "/a/b");
        assert_eq!(req.query.as_deref(), Some("x=1"));
        assert_eq!(req.version, HttpVersion::V10);
        assert_eq!(req.urlv, vec!["a", "b"]);
        assert!(req.host.is_none());
    }

    #[test]
    fn test_absolute_form() {
        let req = Request::parse("GET http://example.com:8080/x HTTP/1.1").unwrap();
        assert_eq!(req.protocol.as_deref(), Some("http"));
        assert_eq!(req.host.as_deref(), Some("example.com"));
        assert_eq!(req.port, Some(8080));
        assert_eq!(req.url, "/x");
    }

    #[test]
    fn test_absolute_form_no_path() {
        let req = Request::parse("GET http://example.com HTTP/1.0").unwrap();
        assert_eq!(req.url, "/");
        assert!(req.urlv.is_empty());
    }

    #[test]
    fn test_missing_version_is_09() {
        let req = Request::parse("GET /").unwrap();
        assert_eq!(req.version, HttpVersion::V09);
    }

    #[test]
    fn test_bad_lines() {
        assert!(Request::parse("").is_err());
        assert!(Request::parse("GET").is_err());
        assert!(Request::parse("GET / HTTP/2.0").is_err());
        assert!(Request::parse("GET / HTTP/1.0 extra").is_err());
        assert!(Request::parse("GET relative/path HTTP/1.0").is_err());
    }

    #[test]
    fn test_bad_port() {
        assert!(Request::parse("GET http://host:notaport/ HTTP/1.0").is_err());
    }
}
