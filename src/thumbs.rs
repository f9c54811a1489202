use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageEncoder};

use crate::engine::{FramePixels, ImageReference, RenderEngine};

const JPEG_QUALITY: u8 = 80;

/// Memoized series previews, keyed by series identifier. Entries live for the
/// process lifetime; a failed generation is never cached, so the next request
/// for that key retries.
#[derive(Clone, Default)]
pub struct ThumbnailCache {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl ThumbnailCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .expect("thumbnail cache lock poisoned")
            .get(key)
            .cloned()
    }

    /// Returns the cached preview for `key`, generating it from `reference`'s
    /// first frame if absent. Concurrent callers may both generate; the map is
    /// re-checked under the lock so they converge on one stored value.
    pub fn ensure(
        &self,
        key: &str,
        engine: &dyn RenderEngine,
        reference: &ImageReference,
        max_size: u32,
    ) -> Result<String> {
        if let Some(existing) = self.get(key) {
            return Ok(existing);
        }

        let frame = engine
            .load_frame(reference)
            .with_context(|| format!("could not load preview frame for {reference}"))?;
        let data_uri = encode_thumbnail(&frame, max_size)?;

        let mut entries = self.entries.lock().expect("thumbnail cache lock poisoned");
        Ok(entries
            .entry(key.to_string())
            .or_insert(data_uri)
            .clone())
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .expect("thumbnail cache lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Downscales so the longer edge fits `max_size` (never upscales), encodes
/// JPEG and wraps it in a data URI.
fn encode_thumbnail(frame: &FramePixels, max_size: u32) -> Result<String> {
    if frame.width == 0 || frame.height == 0 {
        bail!("preview frame has zero extent");
    }
    if frame.rgba.len() != frame.width * frame.height * 4 {
        bail!(
            "preview frame byte count {} does not match {}x{}",
            frame.rgba.len(),
            frame.width,
            frame.height
        );
    }

    let scale = (max_size as f32 / frame.width as f32)
        .min(max_size as f32 / frame.height as f32)
        .min(1.0);
    let out_width = ((frame.width as f32 * scale).round() as usize).max(1);
    let out_height = ((frame.height as f32 * scale).round() as usize).max(1);

    let rgb = downsample_to_rgb(frame, out_width, out_height);

    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(Cursor::new(&mut jpeg), JPEG_QUALITY)
        .write_image(
            &rgb,
            out_width as u32,
            out_height as u32,
            ExtendedColorType::Rgb8,
        )
        .context("could not encode thumbnail JPEG")?;

    Ok(format!("data:image/jpeg;base64,{}", BASE64.encode(&jpeg)))
}

/// Box filter over the source pixels covered by each output pixel.
fn downsample_to_rgb(frame: &FramePixels, out_width: usize, out_height: usize) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(out_width * out_height * 3);
    let x_ratio = frame.width as f32 / out_width as f32;
    let y_ratio = frame.height as f32 / out_height as f32;

    for out_y in 0..out_height {
        let src_y0 = (out_y as f32 * y_ratio) as usize;
        let src_y1 = (((out_y + 1) as f32 * y_ratio) as usize)
            .min(frame.height)
            .max(src_y0 + 1);
        for out_x in 0..out_width {
            let src_x0 = (out_x as f32 * x_ratio) as usize;
            let src_x1 = (((out_x + 1) as f32 * x_ratio) as usize)
                .min(frame.width)
                .max(src_x0 + 1);

            let mut sums = [0u64; 3];
            let mut count = 0u64;
            for src_y in src_y0..src_y1 {
                for src_x in src_x0..src_x1 {
                    let offset = (src_y * frame.width + src_x) * 4;
                    sums[0] += frame.rgba[offset] as u64;
                    sums[1] += frame.rgba[offset + 1] as u64;
                    sums[2] += frame.rgba[offset + 2] as u64;
                    count += 1;
                }
            }
            for sum in sums {
                rgb.push((sum / count.max(1)) as u8);
            }
        }
    }
    rgb
}
