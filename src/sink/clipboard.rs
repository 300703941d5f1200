use std::borrow::Cow;
use std::sync::{Arc, Mutex};

use tracing::debug;

use super::{ActionSink, SinkDelivery, SinkOutcome};
use crate::bitmap::BitmapData;
use crate::codec::MediaKind;
use crate::error::{CaptureError, CaptureResult};

const NAME: &str = "clipboard";

/// Packed RGBA pixels, row-major, no padding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClipboardImage {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

pub trait ClipboardProvider: Send + Sync {
    fn set_image(&self, image: ClipboardImage) -> CaptureResult<()>;
}

/// The system clipboard. A fresh handle is opened per copy so nothing
/// holds the clipboard between captures.
#[derive(Clone, Copy, Debug, Default)]
pub struct ArboardClipboard;

impl ClipboardProvider for ArboardClipboard {
    fn set_image(&self, image: ClipboardImage) -> CaptureResult<()> {
        let mut clipboard = arboard::Clipboard::new()
            .map_err(|err| CaptureError::sink(NAME, format!("cannot open clipboard: {err}")))?;
        clipboard
            .set_image(arboard::ImageData {
                width: image.width as usize,
                height: image.height as usize,
                bytes: Cow::Owned(image.rgba),
            })
            .map_err(|err| CaptureError::sink(NAME, err.to_string()))
    }
}

/// In-process clipboard, for tests and headless hosts.
#[derive(Clone, Debug, Default)]
pub struct MemoryClipboard {
    images: Arc<Mutex<Vec<ClipboardImage>>>,
}

impl MemoryClipboard {
    pub fn last(&self) -> Option<ClipboardImage> {
        self.images().pop()
    }

    pub fn images(&self) -> Vec<ClipboardImage> {
        match self.images.lock() {
            Ok(images) => images.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl ClipboardProvider for MemoryClipboard {
    fn set_image(&self, image: ClipboardImage) -> CaptureResult<()> {
        self.images
            .lock()
            .map_err(|_| CaptureError::sink(NAME, "clipboard store poisoned"))?
            .push(image);
        Ok(())
    }
}

/// Copies the unencoded capture to a clipboard on commit.
pub struct ClipboardSink {
    provider: Arc<dyn ClipboardProvider>,
    image: Option<ClipboardImage>,
}

impl ClipboardSink {
    pub fn new(provider: Arc<dyn ClipboardProvider>) -> Self {
        Self {
            provider,
            image: None,
        }
    }
}

impl ActionSink for ClipboardSink {
    fn name(&self) -> &str {
        NAME
    }

    fn delivery(&self) -> SinkDelivery {
        SinkDelivery::Bitmap
    }

    fn accepts(&self, media: MediaKind) -> bool {
        media == MediaKind::StillImage
    }

    fn set_bitmap_data(&mut self, bitmap: &BitmapData) -> CaptureResult<()> {
        self.image = Some(ClipboardImage {
            width: bitmap.width(),
            height: bitmap.height(),
            rgba: bitmap.to_rgba()?,
        });
        Ok(())
    }

    fn commit(&mut self) -> CaptureResult<SinkOutcome> {
        let image = self
            .image
            .take()
            .ok_or_else(|| CaptureError::sink(NAME, "no bitmap was provided"))?;
        debug!(width = image.width, height = image.height, "copying capture to clipboard");
        self.provider.set_image(image)?;
        Ok(SinkOutcome::default())
    }

    fn abort(&mut self) {
        self.image = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::{LockToken, PixelFormat};

    #[test]
    fn commit_copies_rgba_pixels() -> CaptureResult<()> {
        let clipboard = MemoryClipboard::default();
        let mut sink = ClipboardSink::new(Arc::new(clipboard.clone()));
        let bitmap = BitmapData::new(
            2,
            1,
            PixelFormat::Bgra8,
            12,
            vec![1, 2, 3, 255, 4, 5, 6, 255, 0, 0, 0, 0],
            LockToken::new(9),
        )?;
        sink.set_bitmap_data(&bitmap)?;
        assert!(clipboard.last().is_none());

        sink.commit()?;
        let image = clipboard.last().ok_or(CaptureError::BufferOverflow)?;
        assert_eq!((image.width, image.height), (2, 1));
        assert_eq!(image.rgba, vec![3, 2, 1, 255, 6, 5, 4, 255]);
        Ok(())
    }

    #[test]
    fn commit_without_bitmap_fails() {
        let mut sink = ClipboardSink::new(Arc::new(MemoryClipboard::default()));
        assert!(matches!(sink.commit(), Err(CaptureError::Sink { .. })));
        assert!(!sink.accepts(MediaKind::Video));
    }
}
