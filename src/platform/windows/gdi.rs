use std::ffi::c_void;
use std::mem::size_of;
use std::ptr::null_mut;

use anyhow::Context;
use windows::Win32::Foundation::{HANDLE, HWND};
use windows::Win32::Graphics::Gdi::{
    BI_RGB, BITMAPINFO, BITMAPINFOHEADER, BitBlt, CreateCompatibleDC, CreateDIBSection,
    DIB_RGB_COLORS, DeleteDC, DeleteObject, GetDC, HBITMAP, HDC, HGDIOBJ, ReleaseDC, SRCCOPY,
    SelectObject,
};

use crate::backend::{DesktopBlitter, StagingView, StagingVisitor};
use crate::error::{CaptureError, CaptureResult};
use crate::region::Rectangle;

/// Screen DC blits into a top-down 32-bpp DIB section.
pub(crate) struct GdiBlitter {
    screen_dc: HDC,
    mem_dc: HDC,
    bitmap: Option<HBITMAP>,
    old_bitmap: Option<HGDIOBJ>,
    bits: *mut u8,
    width: u32,
    height: u32,
    blitted: bool,
}

// The DCs and DIB memory are owned by this value and only used by the
// thread that owns the frame source.
unsafe impl Send for GdiBlitter {}

impl GdiBlitter {
    pub(crate) fn new() -> CaptureResult<Self> {
        let screen_dc = unsafe { GetDC(HWND(null_mut())) };
        if screen_dc.0.is_null() {
            return Err(CaptureError::Platform(anyhow::anyhow!(
                "GetDC(NULL) returned null"
            )));
        }
        let mem_dc = unsafe { CreateCompatibleDC(screen_dc) };
        if mem_dc.0.is_null() {
            unsafe {
                let _ = ReleaseDC(HWND(null_mut()), screen_dc);
            }
            return Err(CaptureError::Platform(anyhow::anyhow!(
                "CreateCompatibleDC failed"
            )));
        }
        Ok(Self {
            screen_dc,
            mem_dc,
            bitmap: None,
            old_bitmap: None,
            bits: null_mut(),
            width: 0,
            height: 0,
            blitted: false,
        })
    }

    fn stride(&self) -> usize {
        self.width as usize * 4
    }

    fn ensure_surface(&mut self, width: u32, height: u32) -> CaptureResult<()> {
        if self.bitmap.is_some() && self.width == width && self.height == height {
            return Ok(());
        }
        self.release_bitmap();

        let signed_width = i32::try_from(width).map_err(|_| CaptureError::BufferOverflow)?;
        let signed_height = i32::try_from(height).map_err(|_| CaptureError::BufferOverflow)?;
        let mut info = BITMAPINFO::default();
        info.bmiHeader.biSize = size_of::<BITMAPINFOHEADER>() as u32;
        info.bmiHeader.biWidth = signed_width;
        // Negative height selects a top-down DIB.
        info.bmiHeader.biHeight = -signed_height;
        info.bmiHeader.biPlanes = 1;
        info.bmiHeader.biBitCount = 32;
        info.bmiHeader.biCompression = BI_RGB.0;

        let mut bits: *mut c_void = null_mut();
        let bitmap = unsafe {
            CreateDIBSection(
                self.mem_dc,
                &info,
                DIB_RGB_COLORS,
                &mut bits,
                HANDLE::default(),
                0,
            )
        }
        .context("CreateDIBSection failed")
        .map_err(CaptureError::Platform)?;

        let selected = unsafe { SelectObject(self.mem_dc, bitmap) };
        if selected.0.is_null() {
            unsafe {
                let _ = DeleteObject(bitmap);
            }
            return Err(CaptureError::Platform(anyhow::anyhow!(
                "SelectObject failed for the blit bitmap"
            )));
        }

        self.bitmap = Some(bitmap);
        self.old_bitmap = Some(selected);
        self.bits = bits.cast();
        self.width = width;
        self.height = height;
        Ok(())
    }

    fn release_bitmap(&mut self) {
        if let Some(old) = self.old_bitmap.take() {
            unsafe {
                SelectObject(self.mem_dc, old);
            }
        }
        if let Some(bitmap) = self.bitmap.take() {
            unsafe {
                let _ = DeleteObject(bitmap);
            }
        }
        self.bits = null_mut();
        self.width = 0;
        self.height = 0;
        self.blitted = false;
    }
}

impl DesktopBlitter for GdiBlitter {
    fn blit(&mut self, region: Rectangle) -> CaptureResult<()> {
        self.ensure_surface(region.width, region.height)?;
        unsafe {
            BitBlt(
                self.mem_dc,
                0,
                0,
                region.width as i32,
                region.height as i32,
                self.screen_dc,
                region.x,
                region.y,
                SRCCOPY,
            )
        }
        .context("BitBlt failed")
        .map_err(CaptureError::Platform)?;
        self.blitted = true;
        Ok(())
    }

    fn read(&mut self, visit: &mut StagingVisitor<'_>) -> CaptureResult<()> {
        if !self.blitted || self.bits.is_null() {
            return Err(CaptureError::InvalidState("nothing has been blitted".into()));
        }
        let len = self
            .stride()
            .checked_mul(self.height as usize)
            .ok_or(CaptureError::BufferOverflow)?;
        let bytes = unsafe { std::slice::from_raw_parts_mut(self.bits, len) };
        // GDI leaves the alpha channel at zero.
        for pixel in bytes.chunks_exact_mut(4) {
            pixel[3] = 0xFF;
        }
        visit(StagingView {
            width: self.width,
            height: self.height,
            stride: self.stride(),
            bytes,
        })
    }
}

impl Drop for GdiBlitter {
    fn drop(&mut self) {
        self.release_bitmap();
        unsafe {
            if !self.mem_dc.0.is_null() {
                let _ = DeleteDC(self.mem_dc);
            }
            if !self.screen_dc.0.is_null() {
                let _ = ReleaseDC(HWND(null_mut()), self.screen_dc);
            }
        }
    }
}
