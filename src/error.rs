//! Error taxonomy shared by the store, the capture path and export streams.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Storage root missing, not a directory, or not writable.
    #[error("storage root {} is not accessible: {reason}", path.display())]
    Access { path: PathBuf, reason: String },

    #[error("session {0} already exists")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad index for session {session} at line {line}: {reason}")]
    BadIndex {
        session: String,
        line: usize,
        reason: String,
    },

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("capture already active for session {0}")]
    CaptureActive(String),

    #[error("export stream already delivered end of stream")]
    StreamExhausted,

    #[error("export stream is closed")]
    StreamClosed,

    #[error("read buffer too small: {needed} bytes required for the next header field")]
    BufferTooSmall { needed: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn session_not_found(session_id: &str) -> Self {
        Error::NotFound(format!("session {session_id}"))
    }

    pub(crate) fn frame_not_found(session_id: &str, ordinal: usize) -> Self {
        Error::NotFound(format!("frame {ordinal} of session {session_id}"))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}
