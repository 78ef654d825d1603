//! System clipboard adapter backed by `arboard`
//!
//! Covers text and images on the three desktop platforms. File lists are
//! outside `arboard`'s surface; a platform layer that owns pasteboard
//! file URLs can supply its own [`ClipboardAdapter`] implementation and
//! hand it to the agent instead.

use async_trait::async_trait;
use std::borrow::Cow;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Mutex;

use super::{ClipboardAdapter, ClipboardContent, ClipboardError};

pub struct SystemClipboard {
    inner: Mutex<arboard::Clipboard>,
}

impl SystemClipboard {
    pub fn new() -> Result<Self, ClipboardError> {
        let clipboard =
            arboard::Clipboard::new().map_err(|e| ClipboardError::Unavailable(e.to_string()))?;
        Ok(Self {
            inner: Mutex::new(clipboard),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, arboard::Clipboard>, ClipboardError> {
        self.inner
            .lock()
            .map_err(|_| ClipboardError::Unavailable("clipboard lock poisoned".into()))
    }
}

#[async_trait]
impl ClipboardAdapter for SystemClipboard {
    async fn read(&self) -> Result<ClipboardContent, ClipboardError> {
        let mut clipboard = self.lock()?;

        match clipboard.get_text() {
            Ok(text) if !text.is_empty() => return Ok(ClipboardContent::Text(text)),
            Ok(_) => {}
            Err(arboard::Error::ContentNotAvailable) => {}
            Err(e) => return Err(ClipboardError::Unavailable(e.to_string())),
        }

        match clipboard.get_image() {
            Ok(img) => {
                let png = rgba_to_png(&img)?;
                Ok(ClipboardContent::Image(png))
            }
            Err(arboard::Error::ContentNotAvailable) => Ok(ClipboardContent::Empty),
            Err(e) => Err(ClipboardError::Unavailable(e.to_string())),
        }
    }

    async fn write_text(&self, text: &str) -> Result<(), ClipboardError> {
        self.lock()?
            .set_text(text.to_string())
            .map_err(|e| ClipboardError::Unavailable(e.to_string()))
    }

    async fn write_image(&self, png: &[u8]) -> Result<(), ClipboardError> {
        let decoded = image::load_from_memory(png)
            .map_err(|_| ClipboardError::Unsupported("undecodable image"))?;
        let rgba = decoded.to_rgba8();
        let (width, height) = rgba.dimensions();
        let data = arboard::ImageData {
            width: width as usize,
            height: height as usize,
            bytes: Cow::Owned(rgba.into_raw()),
        };
        self.lock()?
            .set_image(data)
            .map_err(|e| ClipboardError::Unavailable(e.to_string()))
    }

    async fn write_files(&self, _paths: &[PathBuf]) -> Result<(), ClipboardError> {
        Err(ClipboardError::Unsupported("file lists"))
    }
}

fn rgba_to_png(img: &arboard::ImageData<'_>) -> Result<Vec<u8>, ClipboardError> {
    let buffer = image::RgbaImage::from_raw(
        img.width as u32,
        img.height as u32,
        img.bytes.clone().into_owned(),
    )
    .ok_or(ClipboardError::Unsupported("malformed image data"))?;

    let mut out = Vec::new();
    image::DynamicImage::ImageRgba8(buffer)
        .write_to(&mut Cursor::new(&mut out), image::ImageFormat::Png)
        .map_err(|e| ClipboardError::Unavailable(e.to_string()))?;
    Ok(out)
}
