pub(crate) mod d3d11;
pub(crate) mod duplication;
pub(crate) mod gdi;

use anyhow::Context;
use windows::Win32::Foundation::{LUID, POINT};
use windows::Win32::Graphics::Dxgi::{
    CreateDXGIFactory1, DXGI_ERROR_NOT_FOUND, IDXGIAdapter, IDXGIFactory1, IDXGIOutput,
};
use windows::Win32::Graphics::Gdi::{MONITOR_DEFAULTTOPRIMARY, MonitorFromPoint};
use windows::core::Interface;

use crate::backend::{
    DesktopBlitter, DisplayPlatform, OutputDuplication, PlatformCapabilities,
};
use crate::error::{CaptureError, CaptureResult};
use crate::output::OutputId;
use crate::region::{OutputGeometry, Rectangle};

pub(crate) struct ResolvedOutput {
    pub geometry: OutputGeometry,
    pub adapter: IDXGIAdapter,
    pub output: IDXGIOutput,
}

fn luid_to_u64(luid: LUID) -> u64 {
    (u64::from(luid.HighPart as u32) << 32) | u64::from(luid.LowPart)
}

fn utf16z_to_string(raw: &[u16]) -> String {
    let len = raw.iter().position(|c| *c == 0).unwrap_or(raw.len());
    String::from_utf16_lossy(&raw[..len])
}

/// Every output attached to the desktop, adapter by adapter.
pub(crate) fn enumerate_resolved() -> CaptureResult<Vec<ResolvedOutput>> {
    let factory: IDXGIFactory1 = unsafe { CreateDXGIFactory1() }
        .context("CreateDXGIFactory1 failed")
        .map_err(CaptureError::Platform)?;
    let primary = unsafe { MonitorFromPoint(POINT { x: 0, y: 0 }, MONITOR_DEFAULTTOPRIMARY) };

    let mut outputs = Vec::new();
    let mut adapter_idx = 0u32;
    loop {
        let adapter1 = match unsafe { factory.EnumAdapters1(adapter_idx) } {
            Ok(a) => a,
            Err(e) if e.code() == DXGI_ERROR_NOT_FOUND => break,
            Err(e) => {
                return Err(CaptureError::Platform(
                    anyhow::Error::from(e).context(format!("EnumAdapters1({adapter_idx}) failed")),
                ));
            }
        };
        let adapter_desc = unsafe { adapter1.GetDesc1() }
            .context("IDXGIAdapter1::GetDesc1 failed")
            .map_err(CaptureError::Platform)?;
        let adapter_luid = luid_to_u64(adapter_desc.AdapterLuid);
        let adapter: IDXGIAdapter = adapter1
            .cast()
            .context("failed to cast IDXGIAdapter1 to IDXGIAdapter")
            .map_err(CaptureError::Platform)?;

        let mut output_idx = 0u32;
        loop {
            let output = match unsafe { adapter.EnumOutputs(output_idx) } {
                Ok(o) => o,
                Err(e) if e.code() == DXGI_ERROR_NOT_FOUND => break,
                Err(e) => {
                    return Err(CaptureError::Platform(anyhow::Error::from(e).context(
                        format!("EnumOutputs({output_idx}) on adapter {adapter_idx} failed"),
                    )));
                }
            };
            let desc = unsafe { output.GetDesc() }
                .context("IDXGIOutput::GetDesc failed")
                .map_err(CaptureError::Platform)?;

            if desc.AttachedToDesktop.as_bool() {
                let rect = desc.DesktopCoordinates;
                let bounds = Rectangle::new(
                    rect.left,
                    rect.top,
                    u32::try_from(rect.right - rect.left).unwrap_or(0),
                    u32::try_from(rect.bottom - rect.top).unwrap_or(0),
                )?;
                let id = OutputId::new(
                    adapter_idx,
                    output_idx,
                    adapter_luid,
                    utf16z_to_string(&desc.DeviceName),
                    desc.Monitor == primary,
                );
                outputs.push(ResolvedOutput {
                    geometry: OutputGeometry { output: id, bounds },
                    adapter: adapter.clone(),
                    output,
                });
            }
            output_idx += 1;
        }
        adapter_idx += 1;
    }
    Ok(outputs)
}

/// DXGI output enumeration, desktop duplication and GDI blits.
pub(crate) struct DxgiPlatform;

impl DxgiPlatform {
    pub(crate) fn new() -> CaptureResult<Self> {
        Ok(Self)
    }
}

impl DisplayPlatform for DxgiPlatform {
    fn name(&self) -> &str {
        "dxgi"
    }

    fn capabilities(&self) -> PlatformCapabilities {
        PlatformCapabilities {
            duplicate: true,
            blit: true,
        }
    }

    fn enumerate_outputs(&self) -> CaptureResult<Vec<OutputGeometry>> {
        Ok(enumerate_resolved()?
            .into_iter()
            .map(|resolved| resolved.geometry)
            .collect())
    }

    fn open_duplication(
        &self,
        output: &OutputGeometry,
        local: Rectangle,
    ) -> CaptureResult<Box<dyn OutputDuplication>> {
        let resolved = enumerate_resolved()?
            .into_iter()
            .find(|candidate| candidate.geometry.output == output.output)
            .ok_or_else(|| {
                CaptureError::InvalidRegion(format!("output {} is no longer attached", output.output))
            })?;
        Ok(Box::new(duplication::DxgiDuplication::open(&resolved, local)?))
    }

    fn open_blitter(&self) -> CaptureResult<Box<dyn DesktopBlitter>> {
        Ok(Box::new(gdi::GdiBlitter::new()?))
    }
}
