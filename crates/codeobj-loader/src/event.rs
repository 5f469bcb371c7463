//! Completion notifications attached to launches

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::runtime::{CompletionHandle, QueueHandle, Runtime};

/// Which timestamp of a dispatch an event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventRole {
    /// Start of kernel execution
    Start,
    /// End of kernel execution
    Stop,
}

struct LeaseInner {
    handle: CompletionHandle,
    runtime: Option<Weak<dyn Runtime>>,
}

impl Drop for LeaseInner {
    fn drop(&mut self) {
        let Some(runtime) = self.runtime.as_ref().and_then(Weak::upgrade) else {
            return;
        };
        if let Err(err) = runtime.release_completion(self.handle) {
            tracing::warn!(handle = %self.handle, error = %err, "failed to release completion signal");
        }
    }
}

/// Shared ownership of a dispatch's completion signal.
///
/// The runtime may reclaim the signal once the last clone is dropped. Events
/// keep a clone for as long as they stay attached.
#[derive(Clone)]
pub struct CompletionLease {
    inner: Arc<LeaseInner>,
}

impl CompletionLease {
    /// Lease over `handle`, released back to `runtime` on last drop.
    pub fn new(handle: CompletionHandle, runtime: Weak<dyn Runtime>) -> Self {
        Self {
            inner: Arc::new(LeaseInner {
                handle,
                runtime: Some(runtime),
            }),
        }
    }

    /// Lease that releases nothing on drop.
    pub fn unmanaged(handle: CompletionHandle) -> Self {
        Self {
            inner: Arc::new(LeaseInner { handle, runtime: None }),
        }
    }

    pub fn handle(&self) -> CompletionHandle {
        self.inner.handle
    }
}

impl fmt::Debug for CompletionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionLease")
            .field("handle", &self.inner.handle)
            .field("holders", &Arc::strong_count(&self.inner))
            .finish()
    }
}

/// Receives the completion signal of a dispatch.
pub trait CompletionEvent: Send + Sync {
    /// Clone `completion` to keep the signal alive past the launch call.
    fn attach(&self, completion: &CompletionLease, queue: QueueHandle, role: EventRole);
}

/// What an [`Event`] was last attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRecord {
    pub handle: CompletionHandle,
    pub queue: QueueHandle,
    pub role: EventRole,
}

#[derive(Debug)]
struct Attachment {
    record: EventRecord,
    _lease: CompletionLease,
}

/// Event that remembers its most recent attachment.
///
/// Holds the attached signal until re-attached or dropped.
#[derive(Debug, Default)]
pub struct Event {
    attachment: Mutex<Option<Attachment>>,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self) -> Option<EventRecord> {
        self.attachment.lock().as_ref().map(|a| a.record)
    }

    pub fn is_attached(&self) -> bool {
        self.attachment.lock().is_some()
    }

    /// Forget the attachment, releasing its signal.
    pub fn reset(&self) {
        self.attachment.lock().take();
    }
}

impl CompletionEvent for Event {
    fn attach(&self, completion: &CompletionLease, queue: QueueHandle, role: EventRole) {
        let handle = completion.handle();
        tracing::trace!(%handle, %queue, ?role, "completion_attached");
        let previous = self.attachment.lock().replace(Attachment {
            record: EventRecord { handle, queue, role },
            _lease: completion.clone(),
        });
        drop(previous);
    }
}
