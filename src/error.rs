use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Format error: {0}")]
    Format(String),

    #[error("Command failed: {command} (exit {code})")]
    Tool { command: String, code: i32 },

    #[error("Certificate parsing error: {0}")]
    CertParse(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("XML error: {0}")]
    Xml(String),
}

impl From<rustls::Error> for Error {
    fn from(err: rustls::Error) -> Self {
        Error::Tls(err.to_string())
    }
}

impl From<x509_parser::error::X509Error> for Error {
    fn from(err: x509_parser::error::X509Error) -> Self {
        Error::CertParse(err.to_string())
    }
}

impl From<x509_parser::nom::Err<x509_parser::error::X509Error>> for Error {
    fn from(err: x509_parser::nom::Err<x509_parser::error::X509Error>) -> Self {
        Error::CertParse(err.to_string())
    }
}

impl From<x509_parser::nom::Err<x509_parser::error::PEMError>> for Error {
    fn from(err: x509_parser::nom::Err<x509_parser::error::PEMError>) -> Self {
        Error::CertParse(err.to_string())
    }
}

#[cfg(feature = "json")]
impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Format(err.to_string())
    }
}

impl From<xmltree::ParseError> for Error {
    fn from(err: xmltree::ParseError) -> Self {
        Error::Xml(err.to_string())
    }
}

impl From<xmltree::Error> for Error {
    fn from(err: xmltree::Error) -> Self {
        Error::Xml(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
