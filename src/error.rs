use thiserror::Error;

/// Raised when the frame, mask and output surface disagree on size.
///
/// This is a caller bug, not a runtime condition: the render loop stops on it.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CompositeError {
    #[error("{what} is {actual_width}x{actual_height}, expected {expected_width}x{expected_height}")]
    DimensionMismatch {
        what: &'static str,
        expected_width: u32,
        expected_height: u32,
        actual_width: u32,
        actual_height: u32,
    },

    #[error("mask has {actual} entries, expected {expected}")]
    MaskLength { expected: usize, actual: usize },
}

#[derive(Debug, Error)]
pub enum CaptureError {
    /// Camera permission denied or no device present
    #[error("capture unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("failed to encode upload body: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("upload request failed: {0}")]
    Network(#[from] reqwest::Error),
}
