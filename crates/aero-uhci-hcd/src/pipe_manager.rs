use std::sync::{Arc, Mutex, MutexGuard};

use crate::pipe::{DeviceInfo, EndpointInfo, Pipe};
use crate::resources::ResourceManager;
use crate::schedule::Schedule;
use crate::Result;

/// Creates pipes and fans controller interrupts out to the open ones.
pub struct PipeManager {
    resources: Arc<dyn ResourceManager>,
    schedule: Arc<Schedule>,
    default_max_packet_size: u16,
    open_pipes: Mutex<Vec<Arc<Pipe>>>,
}

impl PipeManager {
    pub fn new(
        resources: Arc<dyn ResourceManager>,
        schedule: Arc<Schedule>,
        default_max_packet_size: u16,
    ) -> Arc<Self> {
        Arc::new(Self {
            resources,
            schedule,
            default_max_packet_size,
            open_pipes: Mutex::new(Vec::new()),
        })
    }

    fn lock_pipes(&self) -> MutexGuard<'_, Vec<Arc<Pipe>>> {
        self.open_pipes
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    pub fn schedule(&self) -> &Arc<Schedule> {
        &self.schedule
    }

    /// Create a closed pipe for `endpoint` of `device`.
    pub fn create_pipe(
        self: &Arc<Self>,
        device: DeviceInfo,
        endpoint: EndpointInfo,
    ) -> Result<Arc<Pipe>> {
        let pipe = Pipe::new(
            self.resources.clone(),
            self.schedule.clone(),
            Arc::downgrade(self),
            device,
            endpoint,
            self.default_max_packet_size,
        )?;
        Ok(Arc::new(pipe))
    }

    pub fn open_pipe_count(&self) -> usize {
        self.lock_pipes().len()
    }

    /// Run completion processing on every open pipe.
    ///
    /// The pipe list is snapshotted first so no pipe lock is taken while the list is held; a pipe
    /// closing concurrently still sees one last (harmless) call.
    pub fn handle_interrupt(&self) {
        let pipes = self.lock_pipes().clone();
        for pipe in pipes {
            pipe.handle_interrupt();
        }
    }

    pub(crate) fn register(&self, pipe: &Arc<Pipe>) {
        let mut pipes = self.lock_pipes();
        if !pipes.iter().any(|p| Arc::ptr_eq(p, pipe)) {
            pipes.push(pipe.clone());
        }
    }

    pub(crate) fn unregister(&self, pipe: &Pipe) {
        self.lock_pipes()
            .retain(|p| !std::ptr::eq(Arc::as_ptr(p), pipe));
    }
}
