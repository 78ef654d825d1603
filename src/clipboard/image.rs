//! Image normalization
//!
//! Outbound images are decoded from whatever the platform clipboard
//! produced (PNG, JPEG, GIF, BMP, WEBP) and re-encoded as PNG so the
//! receiving side installs one well-known format. If decoding fails the
//! original bytes are forwarded with the sniffed format name.

use image::ImageFormat;
use std::io::Cursor;
use tracing::debug;

/// An image ready to ship: bytes plus the header fields for IMAGE frames.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedImage {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: String,
}

/// Re-encode `bytes` as PNG, falling back to the original bytes when the
/// input cannot be decoded.
pub fn normalize(bytes: &[u8]) -> NormalizedImage {
    match image::load_from_memory(bytes) {
        Ok(decoded) => {
            let (width, height) = (decoded.width(), decoded.height());
            let mut out = Vec::new();
            match decoded.write_to(&mut Cursor::new(&mut out), ImageFormat::Png) {
                Ok(()) => NormalizedImage {
                    bytes: out,
                    width,
                    height,
                    format: "png".to_string(),
                },
                Err(e) => {
                    debug!("PNG re-encode failed, forwarding original bytes: {e}");
                    fallback(bytes)
                }
            }
        }
        Err(e) => {
            debug!("image decode failed, forwarding original bytes: {e}");
            fallback(bytes)
        }
    }
}

fn fallback(bytes: &[u8]) -> NormalizedImage {
    let format = image::guess_format(bytes)
        .ok()
        .and_then(|f| f.extensions_str().first().copied())
        .unwrap_or("bin")
        .to_string();
    NormalizedImage {
        bytes: bytes.to_vec(),
        width: 0,
        height: 0,
        format,
    }
}
