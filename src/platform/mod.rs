use std::sync::Arc;

use crate::backend::DisplayPlatform;
#[cfg(not(target_os = "windows"))]
use crate::backend::{OutputDuplication, PlatformCapabilities};
use crate::error::CaptureResult;
#[cfg(not(target_os = "windows"))]
use crate::error::CaptureError;
#[cfg(not(target_os = "windows"))]
use crate::region::{OutputGeometry, Rectangle};

pub mod virtual_desktop;

#[cfg(target_os = "windows")]
pub(crate) mod windows;

#[cfg(not(target_os = "windows"))]
fn unsupported_error() -> CaptureError {
    CaptureError::Platform(anyhow::anyhow!(
        "screen capture is only supported on Windows"
    ))
}

#[cfg(not(target_os = "windows"))]
struct UnsupportedPlatform;

#[cfg(not(target_os = "windows"))]
impl DisplayPlatform for UnsupportedPlatform {
    fn name(&self) -> &str {
        "unsupported"
    }

    fn capabilities(&self) -> PlatformCapabilities {
        PlatformCapabilities::default()
    }

    fn enumerate_outputs(&self) -> CaptureResult<Vec<OutputGeometry>> {
        Err(unsupported_error())
    }

    fn open_duplication(
        &self,
        _output: &OutputGeometry,
        _local: Rectangle,
    ) -> CaptureResult<Box<dyn OutputDuplication>> {
        Err(unsupported_error())
    }
}

#[cfg(target_os = "windows")]
pub(crate) fn build_platform() -> CaptureResult<Arc<dyn DisplayPlatform>> {
    Ok(Arc::new(windows::DxgiPlatform::new()?))
}

#[cfg(not(target_os = "windows"))]
pub(crate) fn build_platform() -> CaptureResult<Arc<dyn DisplayPlatform>> {
    Ok(Arc::new(UnsupportedPlatform))
}
