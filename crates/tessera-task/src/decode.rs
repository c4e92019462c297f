//! Byte-to-artifact decoding

use image::imageops::FilterType;
use image::{ImageError, ImageReader, Limits};
use std::io::Cursor;
use tessera_core::{Artifact, DecodeError, DecodeHints};

/// Decodes raw bytes into an artifact
///
/// Called from the blocking pool; implementations may be CPU heavy.
pub trait Decoder: Send + Sync {
    /// Decode `bytes`, honouring hints
    ///
    /// # Errors
    /// Returns `DecodeError::ResourceExhausted` if decoding would exceed the
    /// available memory, or another `DecodeError` for unreadable input
    fn decode(&self, bytes: &[u8], hints: Option<&DecodeHints>) -> Result<Artifact, DecodeError>;
}

/// Decoder backed by the `image` crate
///
/// Format is sniffed from the bytes. A `sample_size` above 1 downsamples the
/// decoded image by that factor in each dimension.
#[derive(Debug, Clone, Default)]
pub struct ImageDecoder {
    max_alloc: Option<u64>,
}

impl ImageDecoder {
    /// Decoder with the `image` crate's default limits
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoder that refuses to allocate more than `bytes` for one image
    #[must_use]
    pub fn with_limit(bytes: u64) -> Self {
        Self {
            max_alloc: Some(bytes),
        }
    }

    fn limits(&self) -> Limits {
        let mut limits = Limits::default();
        if let Some(max) = self.max_alloc {
            limits.max_alloc = Some(max);
        }
        limits
    }
}

impl Decoder for ImageDecoder {
    fn decode(&self, bytes: &[u8], hints: Option<&DecodeHints>) -> Result<Artifact, DecodeError> {
        let mut reader = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| DecodeError::Malformed(e.to_string()))?;
        reader.limits(self.limits());

        let image = reader.decode().map_err(map_image_error)?;

        let sample = hints.map_or(1, DecodeHints::effective_sample_size);
        if sample <= 1 {
            return Ok(Artifact::new(image));
        }
        let width = (image.width() / sample).max(1);
        let height = (image.height() / sample).max(1);
        Ok(Artifact::new(image.resize_exact(
            width,
            height,
            FilterType::Nearest,
        )))
    }
}

fn map_image_error(err: ImageError) -> DecodeError {
    match err {
        ImageError::Limits(_) => DecodeError::ResourceExhausted,
        ImageError::Unsupported(e) => DecodeError::Unsupported(e.to_string()),
        other => DecodeError::Malformed(other.to_string()),
    }
}
