//! Error types for resolver operations

use thiserror::Error;

/// Result type alias for resolver operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while resolving
#[derive(Debug, Error)]
pub enum Error {
    /// The query yielded no usable IP address
    #[error("couldn't find ip")]
    IpNotFound,

    /// A literal IP was given but its family does not match the query type
    #[error("ip version mismatched")]
    IpVersion,

    /// The DNS message carried no question section
    #[error("DNS message should have at least one question")]
    NoQuestion,

    /// System DNS discovery is not available on this platform
    #[error("system dns is not supported on this platform")]
    PlatformUnsupported,

    /// An upstream host could neither be parsed as an IP nor resolved
    #[error("dns host '{0}' is not a valid ip")]
    InvalidHost(String),

    /// DNS query/response error
    #[error("DNS error: {0}")]
    Dns(String),

    /// Resolver configuration error
    #[error("DNS configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
