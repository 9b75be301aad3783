/*!
 * HTTP wire types
 *
 * Just enough HTTP/1.0 for the connection engine: request-line and header
 * parsing with hard byte budgets, an insertion-order header set with a
 * configurable name-case policy, and the response status/reason policy.
 * Everything richer (MIME guessing, entity handling, templates) lives with
 * the request handlers, not here.
 */

pub mod headers;
pub mod request;
pub mod response;

pub use headers::HeaderSet;
pub use request::{HttpVersion, Request};
pub use response::{error_body, reason_phrase, RedirectTable};

use thiserror::Error;

/// Protocol-level parse failures; each maps to a 4xx response.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Malformed request line
    #[error("malformed request line")]
    BadRequestLine,

    /// A single line exceeded the maxline budget
    #[error("line exceeds {0} bytes")]
    LineTooLong(usize),

    /// Request line plus headers exceeded the maxheaders budget
    #[error("headers exceed {0} bytes")]
    HeadersTooLarge(usize),

    /// A header line without a colon (and not a continuation)
    #[error("malformed header: {0}")]
    BadHeader(String),

    /// Declared content length exceeds maxpost
    #[error("content length {0} exceeds limit {1}")]
    BodyTooLarge(u64, u64),

    /// Unparseable Content-Length value
    #[error("invalid content-length: {0}")]
    BadContentLength(String),
}

impl ProtocolError {
    /// The response status this failure maps to.
    pub fn status(&self) -> u16 {
        match self {
            ProtocolError::BadRequestLine => 400,
            ProtocolError::LineTooLong(_) => 414,
            ProtocolError::HeadersTooLarge(_) => 400,
            ProtocolError::BadHeader(_) => 400,
            ProtocolError::BodyTooLarge(..) => 413,
            ProtocolError::BadContentLength(_) => 400,
        }
    }
}
