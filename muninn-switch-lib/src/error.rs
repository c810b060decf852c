use thiserror::Error;

/// Errors surfaced by the datapath provider operations.
///
/// The variants map one-to-one onto the errno values a kernel datapath would
/// return for the same conditions; [`DpError::errno_name`] documents the
/// mapping for log readers used to the C surface.
#[derive(Error, Debug)]
pub enum DpError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no such datapath, port, or flow")]
    NotFound,

    #[error("datapath, port, or flow already exists")]
    Exists,

    #[error("invalid argument: {0}")]
    Invalid(String),

    #[error("capacity exceeded: {0}")]
    TooBig(&'static str),

    #[error("resource busy")]
    Busy,

    #[error("not supported: {0}")]
    Unsupported(&'static str),

    #[error("resource temporarily unavailable")]
    Again,

    #[error("no buffer space available")]
    NoBufs,

    #[error("end of data")]
    Eof,
}

pub type Result<T> = std::result::Result<T, DpError>;

impl DpError {
    /// The errno name a kernel-side implementation would report.
    pub fn errno_name(&self) -> &'static str {
        match self {
            DpError::Io(_) => "EIO",
            DpError::NotFound => "ENOENT",
            DpError::Exists => "EEXIST",
            DpError::Invalid(_) => "EINVAL",
            DpError::TooBig(_) => "EFBIG",
            DpError::Busy => "EBUSY",
            DpError::Unsupported(_) => "EOPNOTSUPP",
            DpError::Again => "EAGAIN",
            DpError::NoBufs => "ENOBUFS",
            DpError::Eof => "EOF",
        }
    }
}
