use thiserror::Error;

#[derive(Error, Debug)]
pub enum VidxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("{tool} failed ({status}): {stderr}")]
    ExternalTool {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("Unreadable probe output: {0}")]
    Probe(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error(
        "keyframe enumerations disagree: {images} images vs {timestamps} timestamps"
    )]
    KeyframeMismatch { images: usize, timestamps: usize },

    #[error("Operation cancelled: {0}")]
    Cancelled(String),
}

impl VidxError {
    /// Duplicate inserts and already generated assets are recoverable no-ops.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, VidxError::AlreadyExists(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, VidxError::NotFound(_))
    }

    pub(crate) fn tool(
        tool: impl Into<String>,
        status: impl Into<String>,
        stderr: impl Into<String>,
    ) -> Self {
        VidxError::ExternalTool {
            tool: tool.into(),
            status: status.into(),
            stderr: stderr.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, VidxError>;
