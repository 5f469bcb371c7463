//! Launch geometry and the hooks surrounding each dispatch

use crate::device::Device;
use crate::dispatch::Dim3;
use crate::error::{ModuleError, Result};
use crate::event::CompletionEvent;
use crate::runtime::QueueHandle;

/// Geometry of one launch, normalized to total work-items per dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchGeometry {
    /// Total work-items per dimension
    pub grid: Dim3,
    /// Work-items per workgroup
    pub block: Dim3,
    /// Dynamic group-segment bytes on top of the kernel's static requirement
    pub dynamic_shared_mem: usize,
}

impl LaunchGeometry {
    pub fn from_total_grid(grid: Dim3, block: Dim3, dynamic_shared_mem: usize) -> Self {
        Self {
            grid,
            block,
            dynamic_shared_mem,
        }
    }

    /// Geometry for `blocks` workgroups of `block` work-items each.
    pub fn from_block_count(blocks: Dim3, block: Dim3, dynamic_shared_mem: usize) -> Result<Self> {
        let grid = blocks.checked_mul(block).ok_or_else(|| {
            ModuleError::invalid_value(format!(
                "{blocks:?} blocks of {block:?} work-items exceed the grid size range"
            ))
        })?;
        Ok(Self::from_total_grid(grid, block, dynamic_shared_mem))
    }

    pub fn workgroups(&self) -> Dim3 {
        let div = |g: u32, b: u32| if b == 0 { 0 } else { g.div_ceil(b) };
        Dim3::new(
            div(self.grid.x, self.block.x),
            div(self.grid.y, self.block.y),
            div(self.grid.z, self.block.z),
        )
    }
}

/// Calls made around every dispatch by the surrounding runtime.
pub trait LaunchHooks: Send + Sync {
    /// Choose the queue to submit to. `requested` is the queue the caller
    /// named, if any.
    ///
    /// `geometry` is a copy of the caller's launch, and the packet has
    /// already been built from the original. Rewrites are bookkeeping only
    /// and are what [`LaunchHooks::post_launch`] receives.
    fn pre_launch(
        &self,
        device: &Device,
        requested: Option<QueueHandle>,
        geometry: &mut LaunchGeometry,
        kernel: &str,
    ) -> Result<QueueHandle>;

    /// Called exactly once after every successful `pre_launch`, whether or
    /// not the dispatch that followed succeeded.
    fn post_launch(&self, kernel: &str, queue: QueueHandle, geometry: &LaunchGeometry);
}

/// Runs [`LaunchHooks::post_launch`] when dropped.
pub(crate) struct PostLaunch<'a> {
    hooks: &'a dyn LaunchHooks,
    kernel: &'a str,
    queue: QueueHandle,
    geometry: LaunchGeometry,
}

impl<'a> PostLaunch<'a> {
    pub(crate) fn new(hooks: &'a dyn LaunchHooks, kernel: &'a str, queue: QueueHandle, geometry: LaunchGeometry) -> Self {
        Self {
            hooks,
            kernel,
            queue,
            geometry,
        }
    }
}

impl Drop for PostLaunch<'_> {
    fn drop(&mut self) {
        self.hooks.post_launch(self.kernel, self.queue, &self.geometry);
    }
}

/// Submits to the requested queue, or the device's default queue.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultLaunchHooks;

impl LaunchHooks for DefaultLaunchHooks {
    fn pre_launch(
        &self,
        device: &Device,
        requested: Option<QueueHandle>,
        geometry: &mut LaunchGeometry,
        kernel: &str,
    ) -> Result<QueueHandle> {
        let queue = requested.unwrap_or(device.default_queue);
        tracing::trace!(
            kernel,
            device = device.id,
            %queue,
            grid = ?geometry.grid.as_array(),
            block = ?geometry.block.as_array(),
            "pre_launch"
        );
        Ok(queue)
    }

    fn post_launch(&self, kernel: &str, queue: QueueHandle, _geometry: &LaunchGeometry) {
        tracing::trace!(kernel, %queue, "post_launch");
    }
}

/// Total-grid launch request with optional completion notifications.
///
/// ```rust
/// use codeobj_loader::{Dim3, Event, GlobalLaunch};
///
/// let done = Event::new();
/// let launch = GlobalLaunch::new(Dim3::linear(1024), Dim3::linear(256))
///     .shared_mem(512)
///     .stop_event(&done);
/// assert_eq!(launch.grid.x, 1024);
/// ```
#[derive(Clone, Copy)]
pub struct GlobalLaunch<'a> {
    pub grid: Dim3,
    pub block: Dim3,
    pub shared_mem_bytes: usize,
    pub queue: Option<QueueHandle>,
    pub start_event: Option<&'a dyn CompletionEvent>,
    pub stop_event: Option<&'a dyn CompletionEvent>,
}

impl<'a> GlobalLaunch<'a> {
    pub fn new(grid: Dim3, block: Dim3) -> Self {
        Self {
            grid,
            block,
            shared_mem_bytes: 0,
            queue: None,
            start_event: None,
            stop_event: None,
        }
    }

    pub fn shared_mem(mut self, bytes: usize) -> Self {
        self.shared_mem_bytes = bytes;
        self
    }

    pub fn queue(mut self, queue: QueueHandle) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Notify `event` with the dispatch's start-of-execution role.
    pub fn start_event(mut self, event: &'a dyn CompletionEvent) -> Self {
        self.start_event = Some(event);
        self
    }

    /// Notify `event` with the dispatch's end-of-execution role.
    pub fn stop_event(mut self, event: &'a dyn CompletionEvent) -> Self {
        self.stop_event = Some(event);
        self
    }

    pub fn wants_completion(&self) -> bool {
        self.start_event.is_some() || self.stop_event.is_some()
    }

    pub(crate) fn geometry(&self) -> LaunchGeometry {
        LaunchGeometry::from_total_grid(self.grid, self.block, self.shared_mem_bytes)
    }
}

impl std::fmt::Debug for GlobalLaunch<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalLaunch")
            .field("grid", &self.grid)
            .field("block", &self.block)
            .field("shared_mem_bytes", &self.shared_mem_bytes)
            .field("queue", &self.queue)
            .field("start_event", &self.start_event.is_some())
            .field("stop_event", &self.stop_event.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::runtime::AgentHandle;

    #[test]
    fn block_count_multiplies_into_total_grid() {
        let geometry = LaunchGeometry::from_block_count(Dim3::new(4, 2, 1), Dim3::new(32, 8, 1), 0).unwrap();
        assert_eq!(geometry.grid, Dim3::new(128, 16, 1));
        assert_eq!(geometry.workgroups(), Dim3::new(4, 2, 1));
    }

    #[test]
    fn block_count_overflow_is_invalid_value() {
        let err = LaunchGeometry::from_block_count(Dim3::linear(u32::MAX), Dim3::linear(2), 0).unwrap_err();
        assert!(matches!(err, ModuleError::InvalidValue(_)));
    }

    #[test]
    fn default_hooks_prefer_requested_queue() {
        let device = Device::new(0, AgentHandle(1), QueueHandle(10));
        let mut geometry = LaunchGeometry::from_total_grid(Dim3::linear(64), Dim3::linear(64), 0);
        let hooks = DefaultLaunchHooks;

        assert_eq!(
            hooks.pre_launch(&device, None, &mut geometry, "k").unwrap(),
            QueueHandle(10)
        );
        assert_eq!(
            hooks.pre_launch(&device, Some(QueueHandle(7)), &mut geometry, "k").unwrap(),
            QueueHandle(7)
        );
    }

    #[derive(Default)]
    struct CountingHooks {
        post: parking_lot::Mutex<Vec<(String, QueueHandle)>>,
    }

    impl LaunchHooks for CountingHooks {
        fn pre_launch(&self, device: &Device, _: Option<QueueHandle>, _: &mut LaunchGeometry, _: &str) -> Result<QueueHandle> {
            Ok(device.default_queue)
        }

        fn post_launch(&self, kernel: &str, queue: QueueHandle, _: &LaunchGeometry) {
            self.post.lock().push((kernel.to_string(), queue));
        }
    }

    #[test]
    fn post_launch_guard_fires_once_on_drop() {
        let hooks = CountingHooks::default();
        let geometry = LaunchGeometry::from_total_grid(Dim3::linear(64), Dim3::linear(64), 0);
        {
            let _guard = PostLaunch::new(&hooks, "k", QueueHandle(3), geometry);
            assert!(hooks.post.lock().is_empty());
        }
        assert_eq!(*hooks.post.lock(), vec![("k".to_string(), QueueHandle(3))]);
    }

    #[test]
    fn global_launch_tracks_requested_events() {
        let stop = Event::new();
        let plain = GlobalLaunch::new(Dim3::linear(8), Dim3::linear(8));
        assert!(!plain.wants_completion());

        let timed = plain.stop_event(&stop);
        assert!(timed.wants_completion());
        assert!(timed.start_event.is_none());
    }
}
