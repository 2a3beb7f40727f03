//! Canvas image and palette storage.
//!
//! The image is one string per canvas: a 4-byte header followed by one palette
//! index per pixel in row-major order. Pixels are written one byte at a time
//! with bit-field writes, so concurrent editors never rewrite each other's
//! bytes. The palette is a packed list of 24-bit colors.

use crate::backend::{Backend, BitField, WriteBatch};
use crate::error::{Result, StoreError};
use crate::keys::CanvasKeys;
use crate::types::{CanvasGeometry, CanvasId, EditOutcome, RejectReason};
use bytes::Bytes;
use pixelboard_protocol::palette::entry_count;
use pixelboard_protocol::{
    decode_palette, encode_palette, ImageHeader, Pixel, Rgb, DEFAULT_PALETTE, IMAGE_HEADER_SIZE,
};
use std::sync::Arc;
use tracing::{debug, trace};

/// Image and palette access for every canvas.
#[derive(Clone)]
pub struct CanvasStore {
    backend: Arc<dyn Backend>,
    geometry: Arc<CanvasGeometry>,
    /// Encoded palette seeded into new canvases.
    default_palette: Bytes,
}

impl CanvasStore {
    /// Create a store seeding new canvases with [`DEFAULT_PALETTE`].
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>, geometry: Arc<CanvasGeometry>) -> Self {
        Self {
            backend,
            geometry,
            default_palette: encode_palette(&DEFAULT_PALETTE),
        }
    }

    /// Seed new canvases with a different palette.
    #[must_use]
    pub fn with_palette(mut self, palette: &[Rgb]) -> Self {
        self.default_palette = encode_palette(palette);
        self
    }

    /// Current image of `canvas`, creating a blank one on first access.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails or the stored image does not
    /// match the canvas dimensions.
    pub async fn get_image(&self, canvas: CanvasId) -> Result<Bytes> {
        let key = CanvasKeys::new(canvas).image();
        let header = self.geometry.header(canvas);

        let image = match self.backend.get(&key).await? {
            Some(image) => image,
            None => {
                self.initialize_image(canvas, &key, header).await?;
                self.backend
                    .get(&key)
                    .await?
                    .ok_or_else(|| StoreError::Unexpected {
                        key: key.clone(),
                        reason: "image missing after initialization".to_string(),
                    })?
            }
        };

        check_image(&key, &image, header)?;
        Ok(image)
    }

    /// Current palette of `canvas`, seeding the default one on first access.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails or the palette is corrupt.
    pub async fn get_palette(&self, canvas: CanvasId) -> Result<Vec<Rgb>> {
        let key = CanvasKeys::new(canvas).palette();

        let data = match self.backend.get(&key).await? {
            Some(data) => data,
            None => {
                self.initialize_palette(canvas, &key).await?;
                self.backend.get(&key).await?.unwrap_or_default()
            }
        };

        decode_palette(&data).map_err(|source| StoreError::Corrupt { key, source })
    }

    /// Number of palette entries of `canvas`, seeding the palette if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub async fn palette_len(&self, canvas: CanvasId) -> Result<usize> {
        let key = CanvasKeys::new(canvas).palette();

        let mut len = self.backend.strlen(&key).await?;
        if len == 0 {
            self.initialize_palette(canvas, &key).await?;
            len = self.backend.strlen(&key).await?;
        }

        Ok(entry_count(len))
    }

    /// Check an edit against the canvas bounds and palette.
    ///
    /// Also makes sure the image exists, so that the first byte-level write
    /// never creates an image without its header.
    ///
    /// The palette length is read here and not re-checked at commit time; the
    /// last successful validation wins.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub async fn validate(&self, canvas: CanvasId, pixel: Pixel) -> Result<Option<RejectReason>> {
        let header = self.geometry.header(canvas);
        if !header.contains(pixel.x, pixel.y) {
            return Ok(Some(RejectReason::OutOfBounds));
        }

        let palette_len = self.palette_len(canvas).await?;
        if usize::from(pixel.color) >= palette_len {
            debug!(
                canvas = %canvas,
                color = pixel.color,
                palette_len,
                "Dropping edit with color outside palette"
            );
            return Ok(Some(RejectReason::OutOfRange));
        }

        self.ensure_image(canvas).await?;
        Ok(None)
    }

    /// Write a single pixel.
    ///
    /// Edits outside the canvas or the palette are dropped and reported as
    /// rejected; nothing is written for them.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub async fn set_pixel(&self, canvas: CanvasId, pixel: Pixel) -> Result<EditOutcome> {
        if let Some(reason) = self.validate(canvas, pixel).await? {
            return Ok(EditOutcome::Rejected(reason));
        }

        let mut batch = WriteBatch::new();
        self.stage_pixel(&mut batch, canvas, pixel);
        self.backend.commit(batch).await?;
        Ok(EditOutcome::Accepted)
    }

    /// Add the image write for `pixel` to a batch.
    ///
    /// The caller is responsible for validating the pixel first.
    pub fn stage_pixel(&self, batch: &mut WriteBatch, canvas: CanvasId, pixel: Pixel) {
        let header = self.geometry.header(canvas);
        let index = IMAGE_HEADER_SIZE as u64 + header.offset(pixel.x, pixel.y);
        batch.set_bits(
            CanvasKeys::new(canvas).image(),
            BitField::u8(index),
            u64::from(pixel.color),
        );
        trace!(canvas = %canvas, x = pixel.x, y = pixel.y, color = pixel.color, "Staged pixel");
    }

    /// Create the image if it does not exist yet.
    async fn ensure_image(&self, canvas: CanvasId) -> Result<()> {
        let key = CanvasKeys::new(canvas).image();
        if self.backend.strlen(&key).await? == 0 {
            self.initialize_image(canvas, &key, self.geometry.header(canvas))
                .await?;
        }
        Ok(())
    }

    async fn initialize_image(
        &self,
        canvas: CanvasId,
        key: &str,
        header: ImageHeader,
    ) -> Result<()> {
        // Losing the race to another initializer is fine: both write the same
        // blank image and only one of them lands.
        if self
            .backend
            .set_if_absent(key, header.blank_image(), None)
            .await?
        {
            debug!(
                canvas = %canvas,
                width = header.width,
                height = header.height,
                "Initialized blank image"
            );
        }
        Ok(())
    }

    async fn initialize_palette(&self, canvas: CanvasId, key: &str) -> Result<()> {
        if self
            .backend
            .set_if_absent(key, self.default_palette.clone(), None)
            .await?
        {
            debug!(
                canvas = %canvas,
                entries = entry_count(self.default_palette.len()),
                "Initialized palette"
            );
        }
        Ok(())
    }
}

fn check_image(key: &str, image: &[u8], expected: ImageHeader) -> Result<()> {
    let header = ImageHeader::decode(image).map_err(|source| StoreError::Corrupt {
        key: key.to_string(),
        source,
    })?;

    if header != expected || image.len() != expected.image_len() {
        return Err(StoreError::Unexpected {
            key: key.to_string(),
            reason: format!(
                "expected {}x{} image of {} bytes, found {}x{} header and {} bytes",
                expected.width,
                expected.height,
                expected.image_len(),
                header.width,
                header.height,
                image.len()
            ),
        });
    }

    Ok(())
}
