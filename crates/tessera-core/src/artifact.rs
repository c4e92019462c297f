//! Decoded artifacts
//!
//! An [`Artifact`] is the in-memory image a request resolves to. Clones share
//! the pixel buffer, so handing one to a cache and a target costs a refcount.

use image::DynamicImage;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

/// Decoded image after zero or more transforms
#[derive(Clone)]
pub struct Artifact {
    image: Arc<DynamicImage>,
}

impl Artifact {
    /// Wrap a decoded image
    #[inline]
    #[must_use]
    pub fn new(image: DynamicImage) -> Self {
        Self {
            image: Arc::new(image),
        }
    }

    /// The decoded image
    #[inline]
    #[must_use]
    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    /// Width in pixels
    #[inline]
    #[must_use]
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    /// Height in pixels
    #[inline]
    #[must_use]
    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Approximate resident size of the pixel buffer in bytes
    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.image.as_bytes().len()
    }

    /// Produce a new artifact from this one's image
    #[must_use]
    pub fn map(&self, f: impl FnOnce(&DynamicImage) -> DynamicImage) -> Self {
        Self::new(f(&self.image))
    }

    /// Whether two artifacts share the same pixel buffer
    #[inline]
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.image, &other.image)
    }
}

impl Debug for Artifact {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Artifact")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("color", &self.image.color())
            .finish()
    }
}

impl From<DynamicImage> for Artifact {
    fn from(image: DynamicImage) -> Self {
        Self::new(image)
    }
}
