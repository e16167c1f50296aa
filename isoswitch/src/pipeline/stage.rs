//! Bounded stage queues and their worker threads.

use flume::{Receiver, RecvTimeoutError, Sender, TrySendError};
use isoswitch_core::options::{OverflowPolicy, StageOptions};
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, trace};

/// How often idle workers look at the stop flag.
const STOP_POLL: Duration = Duration::from_millis(100);

/// Producer side of a stage queue.
pub(crate) struct StageQueue<T> {
    name: &'static str,
    tx: Sender<T>,
    overflow: OverflowPolicy,
}

impl<T> Clone for StageQueue<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
            overflow: self.overflow,
        }
    }
}

impl<T> StageQueue<T> {
    /// Create a queue and its consumer half.
    pub(crate) fn new(name: &'static str, options: &StageOptions) -> (Self, Receiver<T>) {
        let (tx, rx) = flume::bounded(options.capacity.max(1));
        (
            Self {
                name,
                tx,
                overflow: options.overflow,
            },
            rx,
        )
    }

    #[inline]
    pub(crate) const fn name(&self) -> &'static str {
        self.name
    }

    /// Raw sender, for async producers.
    pub(crate) fn sender(&self) -> Sender<T> {
        self.tx.clone()
    }

    #[inline]
    pub(crate) const fn overflow(&self) -> OverflowPolicy {
        self.overflow
    }

    /// Hand an item to the stage, from a worker thread.
    ///
    /// Gives the item back when the queue is full under `Reject` or the
    /// stage has shut down.
    pub(crate) fn submit(&self, item: T) -> Result<(), T> {
        match self.overflow {
            OverflowPolicy::Block => self.tx.send(item).map_err(|e| e.into_inner()),
            OverflowPolicy::Reject => self.tx.try_send(item).map_err(|e| match e {
                TrySendError::Full(item) | TrySendError::Disconnected(item) => item,
            }),
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.tx.len()
    }
}

/// Worker threads draining one stage.
pub(crate) struct StageWorkers {
    name: &'static str,
    handles: Vec<JoinHandle<()>>,
}

impl StageWorkers {
    /// Spawn `workers` threads calling `handler` for every queued item.
    ///
    /// A panicking handler loses only the item it was processing.
    pub(crate) fn spawn<T, H>(
        name: &'static str,
        rx: Receiver<T>,
        workers: usize,
        stop: Arc<AtomicBool>,
        handler: H,
    ) -> io::Result<Self>
    where
        T: Send + 'static,
        H: Fn(T) + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        let count = workers.max(1);
        let mut handles = Vec::with_capacity(count);
        for i in 0..count {
            let rx = rx.clone();
            let stop = Arc::clone(&stop);
            let handler = Arc::clone(&handler);
            let handle = thread::Builder::new()
                .name(format!("isoswitch-{name}-{i}"))
                .spawn(move || worker_loop(name, i, &rx, &stop, &*handler))?;
            handles.push(handle);
        }
        debug!("[Stage {}] Started {} workers", name, count);
        Ok(Self { name, handles })
    }

    /// Wait for every worker to exit. The stop flag must be set first.
    pub(crate) fn join(self) {
        let current = thread::current().id();
        for handle in self.handles {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
        debug!("[Stage {}] Stopped", self.name);
    }
}

fn worker_loop<T, H>(name: &'static str, id: usize, rx: &Receiver<T>, stop: &AtomicBool, handler: &H)
where
    H: Fn(T),
{
    trace!("[Stage {}] Worker {} running", name, id);
    while !stop.load(Ordering::Acquire) {
        match rx.recv_timeout(STOP_POLL) {
            Ok(item) => {
                if catch_unwind(AssertUnwindSafe(|| handler(item))).is_err() {
                    error!("[Stage {}] Worker {} handler panicked; message lost", name, id);
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    trace!("[Stage {}] Worker {} exiting", name, id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_reject_gives_item_back_when_full() {
        let options = StageOptions::new(1, 1, OverflowPolicy::Reject);
        let (queue, _rx) = StageQueue::<u32>::new("test", &options);
        assert!(queue.submit(1).is_ok());
        assert_eq!(queue.submit(2), Err(2));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_workers_survive_panics() {
        let options = StageOptions::new(16, 2, OverflowPolicy::Block);
        let (queue, rx) = StageQueue::<u32>::new("panicky", &options);
        let stop = Arc::new(AtomicBool::new(false));
        let handled = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&handled);
        let workers = StageWorkers::spawn("panicky", rx, 2, Arc::clone(&stop), move |n: u32| {
            assert_ne!(n, 3, "boom");
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        for n in 0..6 {
            queue.submit(n).unwrap();
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while handled.load(Ordering::SeqCst) < 5 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(handled.load(Ordering::SeqCst), 5);

        stop.store(true, Ordering::Release);
        workers.join();
    }
}
