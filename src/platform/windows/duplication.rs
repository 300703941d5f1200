use std::time::Duration;

use anyhow::Context;
use windows::Win32::Foundation::E_NOTIMPL;
use windows::Win32::Graphics::Direct3D11::{
    D3D11_BOX, D3D11_CPU_ACCESS_READ, D3D11_MAP_READ, D3D11_MAPPED_SUBRESOURCE,
    D3D11_TEXTURE2D_DESC, D3D11_USAGE_STAGING, ID3D11Device, ID3D11DeviceContext, ID3D11Resource,
    ID3D11Texture2D,
};
use windows::Win32::Graphics::Dxgi::Common::{DXGI_FORMAT_B8G8R8A8_UNORM, DXGI_SAMPLE_DESC};
use windows::Win32::Graphics::Dxgi::{
    DXGI_ERROR_ACCESS_LOST, DXGI_ERROR_UNSUPPORTED, DXGI_ERROR_WAIT_TIMEOUT,
    DXGI_OUTDUPL_FRAME_INFO, IDXGIOutput1, IDXGIOutput5, IDXGIOutputDuplication, IDXGIResource,
};
use windows::core::Interface;

use crate::backend::{AcquireOutcome, FrameInfo, OutputDuplication, StagingView, StagingVisitor};
use crate::error::{CaptureError, CaptureResult};
use crate::region::Rectangle;

use super::ResolvedOutput;
use super::d3d11;

fn platform_error(error: windows::core::Error, what: &'static str) -> CaptureError {
    CaptureError::Platform(anyhow::Error::from(error).context(what))
}

fn duplication_error(error: windows::core::Error) -> CaptureError {
    let code = error.code();
    if code == DXGI_ERROR_UNSUPPORTED || code == E_NOTIMPL {
        CaptureError::BackendUnsupported(format!("desktop duplication unavailable: {error}"))
    } else {
        platform_error(error, "DuplicateOutput failed")
    }
}

fn create_duplication(
    resolved: &ResolvedOutput,
    device: &ID3D11Device,
) -> CaptureResult<IDXGIOutputDuplication> {
    if let Ok(output5) = resolved.output.cast::<IDXGIOutput5>() {
        let formats = [DXGI_FORMAT_B8G8R8A8_UNORM];
        if let Ok(duplication) = unsafe { output5.DuplicateOutput1(device, 0, &formats) } {
            return Ok(duplication);
        }
    }
    let output1: IDXGIOutput1 = resolved
        .output
        .cast()
        .context("failed to query IDXGIOutput1")
        .map_err(CaptureError::Platform)?;
    unsafe { output1.DuplicateOutput(device) }.map_err(duplication_error)
}

fn create_staging(device: &ID3D11Device, local: Rectangle) -> CaptureResult<ID3D11Texture2D> {
    let desc = D3D11_TEXTURE2D_DESC {
        Width: local.width,
        Height: local.height,
        MipLevels: 1,
        ArraySize: 1,
        Format: DXGI_FORMAT_B8G8R8A8_UNORM,
        SampleDesc: DXGI_SAMPLE_DESC {
            Count: 1,
            Quality: 0,
        },
        Usage: D3D11_USAGE_STAGING,
        BindFlags: Default::default(),
        CPUAccessFlags: D3D11_CPU_ACCESS_READ.0 as u32,
        MiscFlags: Default::default(),
    };
    let mut texture: Option<ID3D11Texture2D> = None;
    unsafe { device.CreateTexture2D(&desc, None, Some(&mut texture)) }
        .map_err(|e| platform_error(e, "failed to create staging texture"))?;
    texture.ok_or_else(|| {
        CaptureError::Platform(anyhow::anyhow!("CreateTexture2D returned no staging texture"))
    })
}

/// One output's desktop duplication plus a staging texture covering the
/// output-local capture rectangle.
pub(crate) struct DxgiDuplication {
    _device: ID3D11Device,
    context: ID3D11DeviceContext,
    duplication: IDXGIOutputDuplication,
    staging: ID3D11Resource,
    local: Rectangle,
    leased: bool,
    desktop: Option<ID3D11Resource>,
}

// COM objects here are created on a single-threaded device and are only
// used by the thread that owns the frame source.
unsafe impl Send for DxgiDuplication {}

impl DxgiDuplication {
    pub(crate) fn open(resolved: &ResolvedOutput, local: Rectangle) -> CaptureResult<Self> {
        let (device, context) =
            d3d11::create_device_for_adapter(&resolved.adapter).map_err(CaptureError::Platform)?;
        let duplication = create_duplication(resolved, &device)?;
        let staging = create_staging(&device, local)?
            .cast::<ID3D11Resource>()
            .context("failed to cast staging texture to ID3D11Resource")
            .map_err(CaptureError::Platform)?;
        Ok(Self {
            _device: device,
            context,
            duplication,
            staging,
            local,
            leased: false,
            desktop: None,
        })
    }
}

impl OutputDuplication for DxgiDuplication {
    fn acquire_next_frame(&mut self, timeout: Duration) -> CaptureResult<AcquireOutcome> {
        if self.leased {
            return Err(CaptureError::InvalidState(
                "previous frame was not released".into(),
            ));
        }
        let timeout_ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        let mut info = DXGI_OUTDUPL_FRAME_INFO::default();
        let mut resource: Option<IDXGIResource> = None;
        if let Err(error) =
            unsafe { self.duplication.AcquireNextFrame(timeout_ms, &mut info, &mut resource) }
        {
            if error.code() == DXGI_ERROR_WAIT_TIMEOUT {
                return Ok(AcquireOutcome::NoNewFrame);
            }
            if error.code() == DXGI_ERROR_ACCESS_LOST {
                return Err(CaptureError::AccessLost);
            }
            return Err(platform_error(error, "AcquireNextFrame failed"));
        }
        self.leased = true;

        let mut metadata_size = info.TotalMetadataBufferSize;
        self.desktop = match resource {
            Some(resource) => Some(
                resource
                    .cast::<ID3D11Resource>()
                    .context("failed to cast acquired IDXGIResource to ID3D11Resource")
                    .map_err(CaptureError::Platform)?,
            ),
            None => {
                // Nothing to copy; the source treats it like an empty frame.
                metadata_size = 0;
                None
            }
        };
        Ok(AcquireOutcome::Frame(FrameInfo {
            metadata_size,
            last_present_time: info.LastPresentTime,
            accumulated_frames: info.AccumulatedFrames,
        }))
    }

    fn copy_to_staging(&mut self) -> CaptureResult<()> {
        let desktop = self
            .desktop
            .as_ref()
            .ok_or_else(|| CaptureError::InvalidState("no desktop frame is leased".into()))?;
        let left = u32::try_from(self.local.x).map_err(|_| CaptureError::BufferOverflow)?;
        let top = u32::try_from(self.local.y).map_err(|_| CaptureError::BufferOverflow)?;
        let source_box = D3D11_BOX {
            left,
            top,
            front: 0,
            right: left
                .checked_add(self.local.width)
                .ok_or(CaptureError::BufferOverflow)?,
            bottom: top
                .checked_add(self.local.height)
                .ok_or(CaptureError::BufferOverflow)?,
            back: 1,
        };
        unsafe {
            self.context.CopySubresourceRegion(
                &self.staging,
                0,
                0,
                0,
                0,
                desktop,
                0,
                Some(&source_box),
            );
        }
        Ok(())
    }

    fn release_frame(&mut self) -> CaptureResult<()> {
        if !self.leased {
            return Ok(());
        }
        self.desktop = None;
        self.leased = false;
        match unsafe { self.duplication.ReleaseFrame() } {
            Ok(()) => Ok(()),
            Err(error) if error.code() == DXGI_ERROR_ACCESS_LOST => Err(CaptureError::AccessLost),
            Err(error) => Err(platform_error(error, "ReleaseFrame failed")),
        }
    }

    fn read_staging(&mut self, visit: &mut StagingVisitor<'_>) -> CaptureResult<()> {
        let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
        unsafe {
            self.context
                .Map(&self.staging, 0, D3D11_MAP_READ, 0, Some(&mut mapped))
        }
        .map_err(|e| platform_error(e, "failed to map staging texture"))?;

        let stride = mapped.RowPitch as usize;
        let row_len = self.local.width as usize * 4;
        let len = stride
            .checked_mul(self.local.height as usize - 1)
            .and_then(|rows| rows.checked_add(row_len));
        let result = match len {
            Some(len) if !mapped.pData.is_null() => {
                let bytes = unsafe { std::slice::from_raw_parts(mapped.pData as *const u8, len) };
                visit(StagingView {
                    width: self.local.width,
                    height: self.local.height,
                    stride,
                    bytes,
                })
            }
            _ => Err(CaptureError::BufferOverflow),
        };
        unsafe {
            self.context.Unmap(&self.staging, 0);
        }
        result
    }
}

impl Drop for DxgiDuplication {
    fn drop(&mut self) {
        if self.leased {
            unsafe {
                let _ = self.duplication.ReleaseFrame();
            }
        }
    }
}
