//! Response status policy: reason phrases, error bodies, redirect table.

use std::collections::HashMap;

/// Reason phrase for a status code; codes outside the table get
/// `Unknown Reason`.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        205 => "Reset Content",
        206 => "Partial Content",
        301 => "Moved",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        305 => "Use Proxy",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        412 => "Precondition Failed",
        413 => "Request Entity Too Large",
        414 => "Request-URI Too Long",
        415 => "Unsupported Media Type",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "Unknown Reason",
    }
}

/// Short HTML error body for a status, padded to at least `min_size` bytes.
/// Some browsers replace small error pages with their own; padding keeps
/// ours on screen.
pub fn error_body(status: u16, min_size: usize) -> String {
    let reason = reason_phrase(status);
    let mut body = format!(
        "<html>\n<head><title>{status} {reason}</title></head>\n\
         <body>\n<h2>{reason}</h2>\n</body>\n</html>\n"
    );
    if body.len() < min_size {
        let pad = min_size - body.len();
        body.push_str("<!--");
        for _ in 0..pad {
            body.push(' ');
        }
        body.push_str("-->\n");
    }
    body
}

/// Cap on re-dispatching registered error URLs, so a failing error page
/// cannot recurse forever.
pub const MAX_REDIRECT_RECURSION: u32 = 3;

/// Registered status → internal redirect URL table.
#[derive(Debug, Clone, Default)]
pub struct RedirectTable {
    map: HashMap<u16, String>,
}

impl RedirectTable {
    pub fn new(map: HashMap<u16, String>) -> Self {
        RedirectTable { map }
    }

    pub fn register(&mut self, status: u16, url: &str) {
        self.map.insert(status, url.to_string());
    }

    pub fn lookup(&self, status: u16) -> Option<&str> {
        self.map.get(&status).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_reasons() {
        assert_eq!(reason_phrase(200), "OK");
        assert_eq!(reason_phrase(301), "Moved");
        assert_eq!(reason_phrase(413), "Request Entity Too Large");
        assert_eq!(reason_phrase(505), "HTTP Version Not Supported");
    }

    #[test]
    fn test_unknown_reason() {
        assert_eq!(reason_phrase(299), "Unknown Reason");
        assert_eq!(reason_phrase(700), "Unknown Reason");
    }

    #[test]
    fn test_error_body_padded() {
        let body = error_body(404, 514);
        assert!(body.len() >= 514);
        assert!(body.contains("Not Found"));
    }

    #[test]
    fn test_error_body_unpadded_when_large_enough() {
        let body = error_body(404, 0);
        assert!(!body.contains("<!--"));
    }

    #[test]
    fn test_redirect_table() {
        let mut table = RedirectTable::default();
        table.register(404, "/notfound");
        assert_eq!(table.lookup(404), Some("/notfound"));
        assert_eq!(table.lookup(500), None);
    }
}
