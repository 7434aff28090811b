use std::{
    io,
    sync::{Mutex, MutexGuard, PoisonError},
    thread,
};

use log::{debug, warn};

/// Locks a mutex, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A named background thread that is joined when dropped.
#[derive(Debug)]
pub(crate) struct Worker {
    name: String,
    thread: Option<thread::JoinHandle<()>>,
}

impl Worker {
    pub fn spawn<F>(name: impl Into<String>, f: F) -> io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let thread = thread::Builder::new().name(name.clone()).spawn(f)?;
        debug!("worker {name} started");

        Ok(Self {
            name,
            thread: Some(thread),
        })
    }

    pub fn join(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };

        // a worker can end up dropping its own handle; never self-join
        if thread.thread().id() == thread::current().id() {
            return;
        }

        match thread.join() {
            Ok(()) => debug!("worker {} stopped", self.name),
            Err(_) => warn!("worker {} panicked", self.name),
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.join();
    }
}
