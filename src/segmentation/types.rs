use crate::frame::{Frame, Mask};
use anyhow::Result;
use async_trait::async_trait;

/// Trait for person-segmentation backends
///
/// Implementations must tolerate repeated calls on the same instance; the
/// render loop never issues a second call before the first has resolved.
#[async_trait]
pub trait MaskProvider: Send + Sync {
    /// Classify every pixel of `frame`
    ///
    /// Returns a mask with the frame's dimensions. A zero label means the pixel
    /// is not part of a person.
    async fn segment(&self, frame: &Frame) -> Result<Mask>;
}
