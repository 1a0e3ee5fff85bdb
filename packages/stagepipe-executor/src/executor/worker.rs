//! Dedicated stage thread
//!
//! Work items are executed in submission order. Errors and panics raised by
//! work items are captured and re-raised on the submitting side through
//! `check_for_errors`. After `force_stop`, queued items are dropped unrun.

use crate::error::{ExecutorError, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, trace};

pub type Work = Box<dyn FnOnce() -> Result<()> + Send>;

pub struct WorkerThread {
    name: String,
    sender: Mutex<Option<Sender<Work>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    init_rx: Mutex<Option<Receiver<bool>>>,
    init_ok: Mutex<Option<bool>>,
    running: Arc<AtomicBool>,
    errors: Arc<Mutex<VecDeque<String>>>,
}

impl WorkerThread {
    /// Spawn the thread. `init` runs first on the new thread; the worker
    /// only accepts work if it returns true.
    pub fn spawn<F>(name: impl Into<String>, init: F) -> Result<Self>
    where
        F: FnOnce() -> bool + Send + 'static,
    {
        let name = name.into();
        let (tx, rx) = unbounded::<Work>();
        let (init_tx, init_rx) = bounded::<bool>(1);
        let running = Arc::new(AtomicBool::new(true));
        let errors = Arc::new(Mutex::new(VecDeque::new()));

        let thread_running = Arc::clone(&running);
        let thread_errors = Arc::clone(&errors);
        let thread_name = name.clone();
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let ok = catch_unwind(AssertUnwindSafe(init)).unwrap_or(false);
                let _ = init_tx.send(ok);
                if !ok {
                    return;
                }
                for work in rx {
                    if !thread_running.load(Ordering::SeqCst) {
                        trace!("{}: dropping work after stop", thread_name);
                        continue;
                    }
                    let message = match catch_unwind(AssertUnwindSafe(work)) {
                        Ok(Ok(())) => continue,
                        Ok(Err(e)) => e.to_string(),
                        Err(panic) => panic_message(panic.as_ref()),
                    };
                    error!("{}: {}", thread_name, message);
                    thread_errors.lock().push_back(message);
                }
                debug!("{} exiting", thread_name);
            })
            .map_err(|e| ExecutorError::Worker(format!("Failed to spawn {}: {}", name, e)))?;

        Ok(Self {
            name,
            sender: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
            init_rx: Mutex::new(Some(init_rx)),
            init_ok: Mutex::new(None),
            running,
            errors,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Block until the thread finished its init closure
    pub fn wait_for_init(&self) -> bool {
        let mut init_ok = self.init_ok.lock();
        if let Some(ok) = *init_ok {
            return ok;
        }
        let ok = self
            .init_rx
            .lock()
            .take()
            .map(|rx| rx.recv().unwrap_or(false))
            .unwrap_or(false);
        *init_ok = Some(ok);
        ok
    }

    pub fn do_work(&self, work: Work) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(ExecutorError::StopSignaled);
        }
        let sender = self.sender.lock();
        let sender = sender
            .as_ref()
            .ok_or_else(|| ExecutorError::Worker(format!("{} is shut down", self.name)))?;
        sender
            .send(work)
            .map_err(|_| ExecutorError::Worker(format!("{} exited", self.name)))
    }

    /// Re-raise the oldest captured error
    pub fn check_for_errors(&self) -> Result<()> {
        match self.errors.lock().pop_front() {
            Some(message) => Err(ExecutorError::Worker(format!(
                "Error in thread {}: {}",
                self.name, message
            ))),
            None => Ok(()),
        }
    }

    /// Stop running queued work; the thread keeps draining the channel
    pub fn force_stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Close the channel and join the thread
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.sender.lock().take();
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                error!("{} panicked while shutting down", self.name);
            }
        }
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic: {}", s)
    } else {
        "panic with a non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_runs_work_in_order() {
        let worker = WorkerThread::spawn("test worker", || true).unwrap();
        assert!(worker.wait_for_init());
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let log = Arc::clone(&log);
            worker
                .do_work(Box::new(move || {
                    log.lock().push(i);
                    Ok(())
                }))
                .unwrap();
        }
        worker.shutdown();
        assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_failed_init() {
        let worker = WorkerThread::spawn("bad init", || false).unwrap();
        assert!(!worker.wait_for_init());
        assert!(!worker.wait_for_init());
    }

    #[test]
    fn test_errors_and_panics_are_captured() {
        let worker = WorkerThread::spawn("failing", || true).unwrap();
        worker
            .do_work(Box::new(|| Err(ExecutorError::Internal("bad".into()))))
            .unwrap();
        worker.do_work(Box::new(|| panic!("exploded"))).unwrap();
        worker.shutdown();

        let first = worker.check_for_errors().unwrap_err();
        assert!(first.to_string().contains("bad"));
        let second = worker.check_for_errors().unwrap_err();
        assert!(second.to_string().contains("panic: exploded"));
        assert!(worker.check_for_errors().is_ok());
    }

    #[test]
    fn test_force_stop_drops_pending_work() {
        let worker = WorkerThread::spawn("stopped", || true).unwrap();
        worker.wait_for_init();
        worker.force_stop();
        let ran = Arc::new(AtomicUsize::new(0));
        assert!(worker.do_work(Box::new(|| Ok(()))).is_err());
        let r = Arc::clone(&ran);
        let _ = worker.do_work(Box::new(move || {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        worker.shutdown();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
