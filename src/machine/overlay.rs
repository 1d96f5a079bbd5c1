//! Overlay loading.
//!
//! Overlay images split their code into independently loadable ranges and
//! refer to functions by overlay index instead of code address. The machine
//! asks an [`OverlayLoader`] for the code of an overlay whenever control
//! enters one, and runs it from offset 0.

use super::cell::Cell;
use super::errors::AmxError;
use super::image::Image;
use bytes::Bytes;

/// Supplies the code of an overlay.
pub trait OverlayLoader: Send + Sync {
    /// Returns the code of overlay `index`; OVERLAY when it does not exist or
    /// cannot be loaded.
    fn load(&self, image: &Image, index: Cell) -> Result<Bytes, AmxError>;
}

/// Serves overlays straight out of the image buffer, without copying.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageOverlays;

impl OverlayLoader for ImageOverlays {
    fn load(&self, image: &Image, index: Cell) -> Result<Bytes, AmxError> {
        image.overlay_code(index)
    }
}

impl<F> OverlayLoader for F
where
    F: Fn(&Image, Cell) -> Result<Bytes, AmxError> + Send + Sync,
{
    fn load(&self, image: &Image, index: Cell) -> Result<Bytes, AmxError> {
        self(image, index)
    }
}
