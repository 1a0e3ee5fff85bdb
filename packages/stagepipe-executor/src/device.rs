//! Device runtime
//!
//! The executor talks to an accelerator through two traits: a runtime that
//! creates ordered work streams, and the streams themselves, which can record
//! and wait on events. `EmulatedDevice` implements both on host threads:
//! every stream is a dedicated worker draining a channel in order.

use crate::error::{ExecutorError, Result};
use crossbeam_channel::{unbounded, Sender};
use parking_lot::{Condvar, Mutex};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error};

pub type StreamWork = Box<dyn FnOnce() + Send>;

/// Completion marker recorded on a stream
///
/// Each `record` starts a new generation; `synchronize` waits until the
/// latest recorded generation has been signaled. An event that was never
/// recorded is complete.
#[derive(Debug, Clone, Default)]
pub struct DeviceEvent {
    inner: Arc<EventInner>,
}

#[derive(Debug, Default)]
struct EventInner {
    state: Mutex<EventState>,
    cond: Condvar,
}

#[derive(Debug, Default)]
struct EventState {
    recorded: u64,
    completed: u64,
}

impl DeviceEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new generation and return it
    pub fn begin(&self) -> u64 {
        let mut st = self.inner.state.lock();
        st.recorded += 1;
        st.recorded
    }

    pub fn complete(&self, generation: u64) {
        let mut st = self.inner.state.lock();
        if generation > st.completed {
            st.completed = generation;
        }
        self.inner.cond.notify_all();
    }

    pub fn is_complete(&self) -> bool {
        let st = self.inner.state.lock();
        st.completed >= st.recorded
    }

    /// Block until the latest recorded generation completes
    pub fn synchronize(&self) {
        let mut st = self.inner.state.lock();
        let target = st.recorded;
        while st.completed < target {
            self.inner.cond.wait(&mut st);
        }
    }

    fn wait_for(&self, generation: u64) {
        let mut st = self.inner.state.lock();
        while st.completed < generation {
            self.inner.cond.wait(&mut st);
        }
    }
}

/// Ordered queue of device work
pub trait DeviceStream: Send + Sync {
    fn id(&self) -> usize;

    fn enqueue(&self, work: StreamWork) -> Result<()>;

    /// Mark the event complete once all work enqueued so far has run
    fn record(&self, event: &DeviceEvent) -> Result<()> {
        let generation = event.begin();
        let event = event.clone();
        self.enqueue(Box::new(move || event.complete(generation)))
    }

    /// Make later work on this stream wait for the event's current generation
    fn wait(&self, event: &DeviceEvent) -> Result<()> {
        let generation = event.inner.state.lock().recorded;
        let event = event.clone();
        self.enqueue(Box::new(move || event.wait_for(generation)))
    }

    /// Block the caller until all enqueued work has run
    fn synchronize(&self);
}

pub trait DeviceRuntime: Send + Sync {
    fn device_id(&self) -> u32;

    fn create_stream(&self) -> Result<Arc<dyn DeviceStream>>;

    /// Wait for every stream of the device
    fn synchronize(&self) -> Result<()>;
}

/// One event per queue slot
#[derive(Debug, Clone, Default)]
pub struct EventList {
    events: Vec<DeviceEvent>,
}

impl EventList {
    pub fn new(size: usize) -> Self {
        Self {
            events: (0..size).map(|_| DeviceEvent::new()).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn get(&self, idx: usize) -> Option<&DeviceEvent> {
        if self.events.is_empty() {
            None
        } else {
            self.events.get(idx % self.events.len())
        }
    }
}

#[derive(Debug, Default)]
struct Pending {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Pending {
    fn add(&self) {
        *self.count.lock() += 1;
    }

    fn done(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.cond.notify_all();
        }
    }

    fn wait_idle(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.cond.wait(&mut count);
        }
    }
}

/// Host-thread stream of an `EmulatedDevice`
pub struct EmulatedStream {
    id: usize,
    sender: Mutex<Option<Sender<StreamWork>>>,
    pending: Arc<Pending>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl EmulatedStream {
    fn spawn(device_id: u32, id: usize) -> Result<Self> {
        let (tx, rx) = unbounded::<StreamWork>();
        let pending = Arc::new(Pending::default());
        let worker_pending = Arc::clone(&pending);
        let handle = std::thread::Builder::new()
            .name(format!("device{}-stream{}", device_id, id))
            .spawn(move || {
                for work in rx {
                    if catch_unwind(AssertUnwindSafe(work)).is_err() {
                        error!("Work item panicked on device stream {}", id);
                    }
                    worker_pending.done();
                }
            })
            .map_err(|e| ExecutorError::Device(format!("Failed to start stream: {}", e)))?;
        Ok(Self {
            id,
            sender: Mutex::new(Some(tx)),
            pending,
            handle: Mutex::new(Some(handle)),
        })
    }

    fn close(&self) {
        self.sender.lock().take();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl DeviceStream for EmulatedStream {
    fn id(&self) -> usize {
        self.id
    }

    fn enqueue(&self, work: StreamWork) -> Result<()> {
        let sender = self.sender.lock();
        let sender = sender
            .as_ref()
            .ok_or_else(|| ExecutorError::Device(format!("Stream {} is closed", self.id)))?;
        self.pending.add();
        sender.send(work).map_err(|_| {
            self.pending.done();
            ExecutorError::Device(format!("Stream {} worker is gone", self.id))
        })
    }

    fn synchronize(&self) {
        self.pending.wait_idle();
    }
}

impl Drop for EmulatedStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// Accelerator stand-in backed by host threads
pub struct EmulatedDevice {
    device_id: u32,
    streams: Mutex<Vec<Arc<EmulatedStream>>>,
    next_stream: AtomicUsize,
}

impl EmulatedDevice {
    pub fn new(device_id: u32) -> Self {
        Self {
            device_id,
            streams: Mutex::new(Vec::new()),
            next_stream: AtomicUsize::new(0),
        }
    }

    pub fn num_streams(&self) -> usize {
        self.streams.lock().len()
    }
}

impl DeviceRuntime for EmulatedDevice {
    fn device_id(&self) -> u32 {
        self.device_id
    }

    fn create_stream(&self) -> Result<Arc<dyn DeviceStream>> {
        let id = self.next_stream.fetch_add(1, Ordering::SeqCst);
        let stream = Arc::new(EmulatedStream::spawn(self.device_id, id)?);
        self.streams.lock().push(Arc::clone(&stream));
        debug!(device = self.device_id, stream = id, "Created emulated stream");
        Ok(stream)
    }

    fn synchronize(&self) -> Result<()> {
        let streams: Vec<_> = self.streams.lock().iter().cloned().collect();
        for stream in streams {
            stream.synchronize();
        }
        Ok(())
    }
}

impl Drop for EmulatedDevice {
    fn drop(&mut self) {
        for stream in self.streams.lock().drain(..) {
            stream.close();
        }
    }
}
