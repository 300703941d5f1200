//! Delivery of one still capture to many sinks.
//!
//! Bitmap sinks run on the calling thread. Every streamed sink gets its own
//! worker thread that copies the shared encoded buffer in chunks. A
//! [`CompletionTracker`] counts finished sinks and fires the release
//! callback exactly once, after the last one.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{error, info, warn};

use crate::bitmap::BitmapData;
use crate::error::CaptureError;
use crate::sink::{SinkDelivery, SinkHandle, SinkOutcome, SinkState};

/// Three-way aggregate of a capture's sinks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FanOutOutcome {
    AllSucceeded,
    SomeFailed,
    AllFailed,
}

impl FanOutOutcome {
    pub fn classify(total: usize, failed: usize) -> Self {
        if failed == 0 {
            Self::AllSucceeded
        } else if failed >= total {
            Self::AllFailed
        } else {
            Self::SomeFailed
        }
    }
}

#[derive(Debug)]
pub struct SinkReport {
    pub name: String,
    pub state: SinkState,
    pub error: Option<CaptureError>,
    pub outcome: Option<SinkOutcome>,
    pub bytes_written: u64,
}

#[derive(Debug, Default)]
pub struct FanOutReport {
    pub sinks: Vec<SinkReport>,
}

impl FanOutReport {
    pub fn from_handles(handles: &[SinkHandle]) -> Self {
        Self {
            sinks: handles.iter().map(SinkHandle::report).collect(),
        }
    }

    pub fn outcome(&self) -> FanOutOutcome {
        let failed = self
            .sinks
            .iter()
            .filter(|sink| sink.state != SinkState::Success)
            .count();
        FanOutOutcome::classify(self.sinks.len(), failed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &SinkReport> {
        self.sinks
            .iter()
            .filter(|sink| sink.state != SinkState::Success)
    }

    /// Emit the user-facing aggregate once.
    pub fn log(&self, capture: &str) {
        let total = self.sinks.len();
        match self.outcome() {
            FanOutOutcome::AllSucceeded => info!(capture, sinks = total, "capture delivered"),
            FanOutOutcome::SomeFailed => {
                let failed: Vec<&str> = self.failures().map(|sink| sink.name.as_str()).collect();
                warn!(capture, sinks = total, ?failed, "capture partially delivered");
            }
            FanOutOutcome::AllFailed => error!(capture, sinks = total, "capture delivery failed"),
        }
    }
}

type ReleaseFn = Box<dyn FnOnce() + Send>;

/// Counts outstanding sinks over a shared read-only payload.
pub struct CompletionTracker<P> {
    payload: P,
    remaining: AtomicUsize,
    release: Mutex<Option<ReleaseFn>>,
}

impl<P: Send + Sync + 'static> CompletionTracker<P> {
    /// With `count == 0` the release callback runs immediately.
    pub fn new(payload: P, count: usize, release: impl FnOnce() + Send + 'static) -> Arc<Self> {
        let tracker = Arc::new(Self {
            payload,
            remaining: AtomicUsize::new(count),
            release: Mutex::new(Some(Box::new(release))),
        });
        if count == 0 {
            tracker.fire();
        }
        tracker
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    /// A token that counts one sink down when dropped, including during a
    /// panic unwind.
    pub fn guard(self: &Arc<Self>) -> CompletionGuard<P> {
        CompletionGuard {
            tracker: Arc::clone(self),
        }
    }

    fn finish_one(&self) {
        let previous = self.remaining.fetch_sub(1, Ordering::AcqRel);
        if previous == 1 {
            self.fire();
        }
    }

    fn fire(&self) {
        let release = match self.release.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(release) = release {
            release();
        }
    }
}

pub struct CompletionGuard<P: Send + Sync + 'static> {
    tracker: Arc<CompletionTracker<P>>,
}

impl<P: Send + Sync + 'static> CompletionGuard<P> {
    pub fn payload(&self) -> &P {
        self.tracker.payload()
    }
}

impl<P: Send + Sync + 'static> Drop for CompletionGuard<P> {
    fn drop(&mut self) {
        self.tracker.finish_one();
    }
}

/// What a still capture distributes: the encoded bytes for streamed sinks
/// and the locked bitmap for bitmap sinks.
pub struct StillPayload {
    pub bytes: Arc<[u8]>,
    pub bitmap: BitmapData,
}

enum Slot {
    Done(SinkHandle),
    Worker {
        name: String,
        handle: JoinHandle<SinkHandle>,
    },
}

/// In-flight delivery. [`FanOutHandle::join`] waits for every worker.
pub struct FanOutHandle {
    slots: Vec<Slot>,
}

impl FanOutHandle {
    pub fn join(self) -> FanOutReport {
        let handles: Vec<SinkHandle> = self
            .slots
            .into_iter()
            .map(|slot| match slot {
                Slot::Done(handle) => handle,
                Slot::Worker { name, handle } => handle
                    .join()
                    .unwrap_or_else(|_| SinkHandle::failed(name, CaptureError::WorkerDead)),
            })
            .collect();
        FanOutReport::from_handles(&handles)
    }
}

fn deliver_stream(sink: &mut SinkHandle, bytes: &[u8]) {
    if sink.set_length(bytes.len() as u64).is_err() {
        return;
    }
    for chunk in bytes.chunks(sink.buffer_size()) {
        if sink.write(chunk).is_err() {
            return;
        }
    }
    // Commit failures are recorded on the handle.
    let _ = sink.commit();
}

fn deliver_bitmap(sink: &mut SinkHandle, bitmap: &BitmapData) {
    if sink.set_bitmap_data(bitmap).is_ok() {
        let _ = sink.commit();
    }
}

/// Deliver `payload` to every live sink. `release` runs once the last
/// sink has finished with the payload, on whichever thread finished it.
pub fn fan_out(
    sinks: Vec<SinkHandle>,
    payload: StillPayload,
    release: impl FnOnce() + Send + 'static,
) -> FanOutHandle {
    let live = sinks.iter().filter(|sink| sink.is_live()).count();
    let tracker = CompletionTracker::new(payload, live, release);

    let mut slots = Vec::with_capacity(sinks.len());
    let mut local = Vec::new();
    for (index, mut sink) in sinks.into_iter().enumerate() {
        if !sink.is_live() {
            slots.push(Slot::Done(sink));
            continue;
        }
        match sink.delivery() {
            SinkDelivery::Bitmap => {
                local.push(index);
                slots.push(Slot::Done(sink));
            }
            SinkDelivery::Stream => {
                let name = sink.name().to_string();
                let guard = tracker.guard();
                let spawned = std::thread::Builder::new()
                    .name(format!("captain-sink-{index}"))
                    .spawn(move || {
                        let bytes = Arc::clone(&guard.payload().bytes);
                        deliver_stream(&mut sink, &bytes);
                        drop(guard);
                        sink
                    });
                match spawned {
                    Ok(handle) => slots.push(Slot::Worker { name, handle }),
                    Err(err) => {
                        // The closure, its guard and the sink were dropped.
                        slots.push(Slot::Done(SinkHandle::failed(name, CaptureError::Io(err))));
                    }
                }
            }
        }
    }

    for index in local {
        if let Slot::Done(sink) = &mut slots[index] {
            let guard = tracker.guard();
            deliver_bitmap(sink, &guard.payload().bitmap);
        }
    }

    FanOutHandle { slots }
}
