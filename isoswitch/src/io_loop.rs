//! I/O loop group.
//!
//! ## Architecture:
//!
//! ```text
//! Gateway / sockets               I/O threads (e.g., 4 loops)
//! ┌──────────────┐               ┌──────────────────────────────┐
//! │   IoLoops    │───spawn──────▶│ Loop 0 (compio runtime)      │
//! │              │               │ - listener accept, pumps ... │
//! │  round robin │───spawn──────▶│ Loop 1 (compio runtime)      │
//! └──────────────┘               │ - client drivers, pumps ...  │
//!                                └──────────────────────────────┘
//! ```
//!
//! Each loop owns one compio runtime on its own OS thread. Work is shipped
//! as a `Send` closure that builds the (possibly `!Send`) future on the
//! target loop, where it runs as a detached local task. One loop multiplexes
//! many connections.

use flume::{Receiver, Sender};
use futures::future::LocalBoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, trace};

type IoJob = Box<dyn FnOnce() -> LocalBoxFuture<'static, ()> + Send>;

/// Fixed group of I/O loop threads.
pub struct IoLoops {
    loops: RwLock<Vec<Sender<IoJob>>>,
    next: AtomicUsize,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl IoLoops {
    /// Start `count` loops (at least one).
    pub fn new(count: usize) -> io::Result<Self> {
        let count = count.max(1);
        debug!("[IoLoops] Starting {} loop threads", count);

        let mut loops = Vec::with_capacity(count);
        let mut threads = Vec::with_capacity(count);
        for i in 0..count {
            let (tx, rx) = flume::unbounded();
            let handle = thread::Builder::new()
                .name(format!("isoswitch-io-{i}"))
                .spawn(move || loop_thread(i, rx))?;
            loops.push(tx);
            threads.push(handle);
        }

        Ok(Self {
            loops: RwLock::new(loops),
            next: AtomicUsize::new(0),
            threads: Mutex::new(threads),
        })
    }

    /// Number of running loops (0 after shutdown).
    pub fn len(&self) -> usize {
        self.loops.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.read().is_empty()
    }

    /// Run a task on the next loop (round-robin).
    ///
    /// `make` is called on the loop thread to build the future.
    pub fn spawn<F, Fut>(&self, make: F) -> io::Result<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        let loops = self.loops.read();
        if loops.is_empty() {
            return Err(io::Error::other("I/O loops shut down"));
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % loops.len();
        let job: IoJob = Box::new(move || make().boxed_local());
        loops[idx]
            .send(job)
            .map_err(|_| io::Error::other(format!("I/O loop {idx} is gone")))
    }

    /// Stop every loop and wait for the threads. Running tasks are dropped.
    pub fn shutdown(&self) {
        self.loops.write().clear();
        let threads = std::mem::take(&mut *self.threads.lock());
        let current = thread::current().id();
        for handle in threads {
            // A loop cannot join itself (last reference dropped on a loop thread)
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for IoLoops {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn loop_thread(loop_id: usize, rx: Receiver<IoJob>) {
    debug!("[IoLoop {}] Starting", loop_id);

    let rt = match compio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("[IoLoop {}] Failed to create runtime: {}", loop_id, e);
            return;
        }
    };

    rt.block_on(async move {
        while let Ok(job) = rx.recv_async().await {
            trace!("[IoLoop {}] Spawning task", loop_id);
            compio::runtime::spawn(job()).detach();
        }
        debug!("[IoLoop {}] Channel closed, exiting", loop_id);
    });

    debug!("[IoLoop {}] Stopped", loop_id);
}
