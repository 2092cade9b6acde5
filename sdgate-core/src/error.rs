use thiserror::Error;

/// Rejections produced while turning a request body into a [`JobDescriptor`](crate::JobDescriptor).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("malformed JSON request body: {0}")]
    MalformedJson(String),

    #[error("missing required field `{0}`")]
    MissingRequiredField(&'static str),

    #[error("invalid value `{value}` for `{field}`")]
    InvalidEnumValue { field: &'static str, value: String },

    #[error("invalid value for `{field}`: {reason}")]
    InvalidFieldValue { field: &'static str, reason: String },
}

/// Failures while materializing an input image.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed image encoding: {0}")]
    MalformedEncoding(String),

    #[error("unsupported image content: {0}")]
    UnsupportedImageContent(String),
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("pixel buffer of {len} bytes does not match a {width}x{height}x{channels} image")]
    BufferMismatch {
        width: u32,
        height: u32,
        channels: u8,
        len: usize,
    },

    #[error("unsupported channel count {0}")]
    UnsupportedChannels(u8),

    #[error("image encoding failed: {0}")]
    Image(#[from] image::ImageError),
}

#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("failed to load input image: {0}")]
    InputImage(#[from] DecodeError),

    #[error("engine failure: {0}")]
    EngineFailure(String),

    #[error("model conversion failed: {0}")]
    ConversionFailed(String),
}

impl OrchestrationError {
    /// Whether the failure is attributable to the caller's input rather than the engine.
    pub fn is_client_error(&self) -> bool {
        matches!(self, OrchestrationError::InputImage(_))
    }

    pub(crate) fn engine(err: anyhow::Error) -> Self {
        OrchestrationError::EngineFailure(format!("{err:#}"))
    }
}
