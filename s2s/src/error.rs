use std::error::Error as StdError;
use std::fmt;
use std::io::Error as IoError;

/// Top-level error type for the connector.
#[derive(Debug)]
pub enum Error {
    /// I/O error.
    Io(IoError),
    /// A domain failed IDN nameprep.
    Nameprep(String),
    /// Config file could not be parsed.
    Config(String),
    /// XML parsing error from the config or a stream.
    Xml(minidom::Error),
    /// DNS resolution error.
    Resolve(hickory_resolver::error::ResolveError),
    /// The local SASL implementation reported an error authenticating to the router.
    Sasl(String),
    /// The router closed the link or refused authentication.
    RouterAuthFailed,
    /// A fatal condition was hit that requires the process to shut down.
    Fatal(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Nameprep(s) => write!(f, "nameprep failed for domain {:?}", s),
            Error::Config(s) => write!(f, "config error: {}", s),
            Error::Xml(e) => write!(f, "XML error: {}", e),
            Error::Resolve(e) => write!(f, "DNS resolution error: {}", e),
            Error::Sasl(s) => write!(f, "SASL error: {}", s),
            Error::RouterAuthFailed => write!(f, "router authentication failed"),
            Error::Fatal(s) => write!(f, "fatal error: {}", s),
        }
    }
}

impl StdError for Error {}

impl From<IoError> for Error {
    fn from(e: IoError) -> Self {
        Error::Io(e)
    }
}

impl From<minidom::Error> for Error {
    fn from(e: minidom::Error) -> Self {
        Error::Xml(e)
    }
}

impl From<hickory_resolver::error::ResolveError> for Error {
    fn from(e: hickory_resolver::error::ResolveError) -> Self {
        Error::Resolve(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
