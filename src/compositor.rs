use crate::error::CompositeError;
use crate::frame::{check_dimensions, Frame, Mask};
use image::RgbaImage;

/// Copy live-frame pixels into `output` wherever the mask label is zero
///
/// Pixels with a non-zero label are not written at all, so they keep whatever
/// the surface held before. Returns the number of pixels written.
pub fn composite_into(
    frame: &Frame,
    mask: &Mask,
    output: &mut RgbaImage,
) -> Result<usize, CompositeError> {
    let _span = tracing::debug_span!("composite", sequence = frame.sequence()).entered();

    let expected = output.dimensions();
    check_dimensions("frame", expected, frame.dimensions())?;
    check_dimensions("mask", expected, mask.dimensions())?;

    let mut written = 0;
    for ((dst, src), &label) in output
        .chunks_exact_mut(4)
        .zip(frame.as_raw().chunks_exact(4))
        .zip(mask.labels())
    {
        if label == 0 {
            dst.copy_from_slice(src);
            written += 1;
        }
    }

    Ok(written)
}

/// Non-mutating form of [`composite_into`]
pub fn composite(
    frame: &Frame,
    mask: &Mask,
    prior_output: &RgbaImage,
) -> Result<RgbaImage, CompositeError> {
    let mut output = prior_output.clone();
    composite_into(frame, mask, &mut output)?;
    Ok(output)
}
