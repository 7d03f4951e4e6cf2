//! Image normalization for captured frames.
//!
//! Cameras publish stills as JPEG, PNG or WebP, and some publish animated
//! GIFs. Stills pass through untouched. Animated sources are flattened to
//! their first frame on a white background and re-encoded as JPEG, so every
//! stored payload is a single still image.

use crate::config::ProcessingConfig;
use crate::digest::sha256_hex;
use bytes::Bytes;
use image::{DynamicImage, ImageReader, Rgb, RgbImage};
use jpeg_encoder::{ColorType, Encoder};
use std::io::Cursor;
use thiserror::Error;
use tracing::{debug, trace};

const GIF_MAGIC: &[u8] = b"GIF8";

/// Errors that can occur during normalization.
#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("bytes are not a recognizable image")]
    UnknownFormat,

    #[error("failed to decode animated source: {0}")]
    Decode(#[source] image::ImageError),

    #[error("frame of {width}x{height} exceeds the JPEG size limit")]
    TooLarge { width: u32, height: u32 },

    #[error("failed to re-encode frame as JPEG: {0}")]
    Encode(#[source] jpeg_encoder::EncodingError),
}

/// A capture ready to be stored.
#[derive(Debug, Clone)]
pub struct NormalizedFrame {
    /// Single still image
    pub bytes: Bytes,
    /// Extension with leading dot
    pub extension: &'static str,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub was_animated_source: bool,
    /// SHA-256 hex of `bytes`
    pub digest: String,
}

/// Normalizer for raw captured bytes.
#[derive(Debug, Clone)]
pub struct FrameNormalizer {
    jpeg_quality: u8,
}

impl FrameNormalizer {
    pub fn new(config: &ProcessingConfig) -> Self {
        Self {
            jpeg_quality: config.jpeg_quality,
        }
    }

    /// Normalize raw bytes fetched for a camera.
    ///
    /// `content_type` and `url_hint` are only hints; the bytes themselves
    /// decide whether the result is usable.
    pub fn normalize(
        &self,
        raw: Bytes,
        content_type: Option<&str>,
        url_hint: Option<&str>,
    ) -> Result<NormalizedFrame, NormalizeError> {
        if is_animated_source(&raw, content_type, url_hint) {
            return self.flatten_animated(&raw);
        }

        let reader = ImageReader::new(Cursor::new(raw.as_ref()))
            .with_guessed_format()
            .map_err(|e| NormalizeError::Decode(e.into()))?;
        if reader.format().is_none() {
            return Err(NormalizeError::UnknownFormat);
        }

        // Dimensions are metadata only; a truncated header just leaves them unset.
        let (width, height) = match reader.into_dimensions() {
            Ok((w, h)) => (Some(w), Some(h)),
            Err(e) => {
                debug!(error = %e, "Could not read image dimensions");
                (None, None)
            }
        };

        let digest = sha256_hex(&raw);
        Ok(NormalizedFrame {
            extension: extension_for(content_type, url_hint),
            bytes: raw,
            width,
            height,
            was_animated_source: false,
            digest,
        })
    }

    fn flatten_animated(&self, raw: &[u8]) -> Result<NormalizedFrame, NormalizeError> {
        // Decoding a GIF as a still yields its first frame.
        let first = image::load_from_memory(raw).map_err(NormalizeError::Decode)?;
        let still = flatten_on_white(first);
        let (width, height) = still.dimensions();

        let (Ok(w16), Ok(h16)) = (u16::try_from(width), u16::try_from(height)) else {
            return Err(NormalizeError::TooLarge { width, height });
        };

        let mut out = Vec::new();
        let mut encoder = Encoder::new(&mut out, self.jpeg_quality);
        encoder.set_optimized_huffman_tables(true);
        encoder
            .encode(still.as_raw(), w16, h16, ColorType::Rgb)
            .map_err(NormalizeError::Encode)?;

        trace!(width, height, bytes = out.len(), "Animated source flattened");
        metrics::counter!("capture.frames.flattened").increment(1);

        let digest = sha256_hex(&out);
        Ok(NormalizedFrame {
            bytes: Bytes::from(out),
            extension: ".jpg",
            width: Some(width),
            height: Some(height),
            was_animated_source: true,
            digest,
        })
    }
}

/// Animated-source detection: content type, then magic bytes, then URL path.
pub fn is_animated_source(raw: &[u8], content_type: Option<&str>, url_hint: Option<&str>) -> bool {
    if content_type.is_some_and(|ct| ct.to_ascii_lowercase().contains("gif")) {
        return true;
    }
    if raw.starts_with(GIF_MAGIC) {
        return true;
    }
    url_hint.is_some_and(|url| url_path(url).ends_with(".gif"))
}

/// Extension for a still: content type first, then URL suffix, then `.jpg`.
pub fn extension_for(content_type: Option<&str>, url_hint: Option<&str>) -> &'static str {
    if let Some(ct) = content_type.map(str::to_ascii_lowercase) {
        if ct.contains("jpeg") || ct.contains("jpg") {
            return ".jpg";
        }
        if ct.contains("png") {
            return ".png";
        }
        if ct.contains("webp") {
            return ".webp";
        }
    }

    if let Some(path) = url_hint.map(url_path) {
        if path.ends_with(".jpg") || path.ends_with(".jpeg") {
            return ".jpg";
        }
        if path.ends_with(".png") {
            return ".png";
        }
        if path.ends_with(".webp") {
            return ".webp";
        }
    }

    ".jpg"
}

/// Lowercased path component of a URL, ignoring query and fragment.
fn url_path(url: &str) -> String {
    match reqwest::Url::parse(url) {
        Ok(parsed) => parsed.path().to_ascii_lowercase(),
        Err(_) => url
            .split(|c| c == '?' || c == '#')
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase(),
    }
}

/// Composite any transparency onto opaque white.
fn flatten_on_white(image: DynamicImage) -> RgbImage {
    if !image.color().has_alpha() {
        return image.to_rgb8();
    }

    let rgba = image.to_rgba8();
    RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let [r, g, b, a] = rgba.get_pixel(x, y).0;
        let alpha = u16::from(a);
        let blend = |c: u8| ((u16::from(c) * alpha + 255 * (255 - alpha) + 127) / 255) as u8;
        Rgb([blend(r), blend(g), blend(b)])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::codecs::gif::{GifEncoder, Repeat};
    use image::{Delay, Frame, ImageFormat, Rgba, RgbaImage};

    fn normalizer() -> FrameNormalizer {
        FrameNormalizer::new(&ProcessingConfig::default())
    }

    fn png() -> Bytes {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(5, 4, Rgb([1, 2, 3])));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        Bytes::from(buf)
    }

    fn animated_gif() -> Bytes {
        let mut buf = Vec::new();
        {
            let mut encoder = GifEncoder::new(&mut buf);
            encoder.set_repeat(Repeat::Infinite).unwrap();
            let frames = [Rgba([255, 0, 0, 255]), Rgba([0, 0, 255, 255])].map(|px| {
                Frame::from_parts(
                    RgbaImage::from_pixel(6, 3, px),
                    0,
                    0,
                    Delay::from_numer_denom_ms(100, 1),
                )
            });
            encoder.encode_frames(frames).unwrap();
        }
        Bytes::from(buf)
    }

    #[test]
    fn test_png_passthrough() {
        let raw = png();
        let frame = normalizer()
            .normalize(raw.clone(), Some("image/png"), None)
            .unwrap();

        assert_eq!(frame.bytes, raw);
        assert_eq!(frame.extension, ".png");
        assert_eq!((frame.width, frame.height), (Some(5), Some(4)));
        assert!(!frame.was_animated_source);
        assert_eq!(frame.digest, sha256_hex(&raw));
    }

    #[test]
    fn test_animated_gif_becomes_jpeg() {
        let frame = normalizer()
            .normalize(animated_gif(), Some("image/gif"), None)
            .unwrap();

        assert_eq!(frame.extension, ".jpg");
        assert!(frame.was_animated_source);
        assert_eq!((frame.width, frame.height), (Some(6), Some(3)));

        let decoded = image::load_from_memory(&frame.bytes).unwrap();
        assert_eq!(
            image::guess_format(&frame.bytes).unwrap(),
            ImageFormat::Jpeg
        );
        // First frame was red.
        let px = decoded.to_rgb8().get_pixel(2, 1).0;
        assert!(px[0] > 200 && px[2] < 60);
    }

    #[test]
    fn test_flattened_jpeg_uses_optimized_huffman_tables() {
        let gif = animated_gif();
        let frame = normalizer().normalize(gif.clone(), Some("image/gif"), None).unwrap();

        let still = flatten_on_white(image::load_from_memory(&gif).unwrap());
        let mut standard = Vec::new();
        Encoder::new(&mut standard, 90)
            .encode(still.as_raw(), 6, 3, ColorType::Rgb)
            .unwrap();

        // Same pixels and quality; only the Huffman tables differ.
        assert!(frame.bytes.len() < standard.len());
    }

    #[test]
    fn test_gif_detected_by_magic_without_content_type() {
        let frame = normalizer()
            .normalize(animated_gif(), Some("application/octet-stream"), None)
            .unwrap();
        assert!(frame.was_animated_source);
        assert_eq!(frame.extension, ".jpg");
    }

    #[test]
    fn test_transparent_pixels_become_white() {
        let image = DynamicImage::ImageRgba8(RgbaImage::from_pixel(2, 2, Rgba([0, 0, 0, 0])));
        let flat = flatten_on_white(image);
        assert_eq!(flat.get_pixel(0, 0).0, [255, 255, 255]);
    }

    #[test]
    fn test_garbage_is_unknown_format() {
        let err = normalizer()
            .normalize(Bytes::from_static(b"<html>busy</html>"), Some("image/jpeg"), None)
            .unwrap_err();
        assert!(matches!(err, NormalizeError::UnknownFormat));
    }

    #[test]
    fn test_garbage_gif_is_decode_error() {
        let err = normalizer()
            .normalize(Bytes::from_static(b"GIF89a-truncated"), None, None)
            .unwrap_err();
        assert!(matches!(err, NormalizeError::Decode(_)));
    }

    #[test]
    fn test_extension_fallback_order() {
        assert_eq!(extension_for(None, Some("http://cam/x/snap.webp?t=1")), ".webp");
        assert_eq!(extension_for(None, Some("http://cam/x/snap")), ".jpg");
        assert_eq!(extension_for(None, None), ".jpg");
        assert_eq!(extension_for(Some("image/png"), Some("http://cam/a.webp")), ".png");
        assert_eq!(extension_for(Some("text/plain"), Some("/a/b.PNG")), ".png");
    }

    #[test]
    fn test_animated_detection_by_url() {
        assert!(is_animated_source(b"\xff\xd8", None, Some("http://cam/live.gif?x=1")));
        assert!(!is_animated_source(b"\xff\xd8", Some("image/jpeg"), Some("http://cam/a.jpg")));
    }
}
