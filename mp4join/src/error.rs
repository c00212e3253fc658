//! Application-wide error types.

use std::net::IpAddr;
use std::path::PathBuf;

use thiserror::Error;

use crate::job::JobStatus;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
///
/// Variants group into the four recoverable families the server deals with:
/// admission (job creation), upload (part reception), dispatch (external
/// process) and stream (download delivery). None of them are fatal to the
/// server; only an error escaping `main` is.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid part count {0}, allowed values are 2, 4, 8 and 16")]
    InvalidPartCount(u32),

    #[error("job quota reached, please wait until current jobs finish processing")]
    QuotaExceeded { address: IpAddr },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("job {id} belongs to a different address")]
    WrongOwner { id: String },

    #[error("job {id} is no longer accepting parts (status {status})")]
    UploadClosed { id: String, status: JobStatus },

    #[error("part index {part} out of range for a {part_count}-part job")]
    PartOutOfRange { part: u32, part_count: u32 },

    #[error("part {part} is already received or currently uploading")]
    PartUnavailable { part: u32 },

    #[error("a positive content length is required")]
    LengthRequired,

    #[error("declared part size {declared} exceeds the maximum of {max} bytes")]
    PayloadTooLarge { declared: u64, max: u64 },

    #[error("upload body size {written} does not match the declared length {declared}")]
    LengthMismatch { declared: u64, written: u64 },

    #[error("too many concurrent streams ({active} active, cap {max})")]
    StreamCapacity { active: usize, max: usize },

    #[error("output file is not available: {}", path.display())]
    OutputMissing { path: PathBuf },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}
