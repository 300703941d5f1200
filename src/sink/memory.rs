use std::sync::{Arc, Mutex};

use super::{ActionSink, SinkOutcome};
use crate::error::{CaptureError, CaptureResult};

/// Growable byte buffer shared between a sink and its owner.
#[derive(Clone, Debug, Default)]
pub struct SharedBytes(Arc<Mutex<Vec<u8>>>);

impl SharedBytes {
    pub fn append(&self, bytes: &[u8]) -> CaptureResult<()> {
        self.0
            .lock()
            .map_err(|_| CaptureError::InvalidState("shared buffer poisoned".into()))?
            .extend_from_slice(bytes);
        Ok(())
    }

    pub fn snapshot(&self) -> CaptureResult<Vec<u8>> {
        self.0
            .lock()
            .map(|bytes| bytes.clone())
            .map_err(|_| CaptureError::InvalidState("shared buffer poisoned".into()))
    }

    pub fn len(&self) -> usize {
        self.0.lock().map(|bytes| bytes.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Collects the encoded capture in memory.
pub struct MemorySink {
    name: String,
    bytes: SharedBytes,
    pausable: bool,
}

impl MemorySink {
    pub fn new(name: impl Into<String>, bytes: SharedBytes) -> Self {
        Self {
            name: name.into(),
            bytes,
            pausable: false,
        }
    }

    pub fn pausable(mut self) -> Self {
        self.pausable = true;
        self
    }
}

impl ActionSink for MemorySink {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_pause(&self) -> bool {
        self.pausable
    }

    fn write(&mut self, bytes: &[u8]) -> CaptureResult<()> {
        self.bytes.append(bytes)
    }

    fn commit(&mut self) -> CaptureResult<SinkOutcome> {
        Ok(SinkOutcome {
            uri: Some(format!("memory://{}", self.name)),
            thumbnail: None,
        })
    }
}
