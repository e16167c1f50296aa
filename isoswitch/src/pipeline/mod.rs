//! Staged routing pipeline.
//!
//! ```text
//!  I/O loops ──▶ receive ──┬──▶ inbound  ──▶ opposite-role transport
//!                          ├──▶ outbound ──▶ request origin
//!                          └──────────────────────┐
//!           (any failure, from any stage) ──▶ unroutable (logged)
//! ```
//!
//! Every stage is a bounded flume queue drained by its own worker threads.
//! Messages are owned by exactly one stage at a time.

mod router;
mod stage;

pub use router::Unroutable;

use arc_swap::ArcSwap;
use isoswitch_core::correlation::CorrelationStore;
use isoswitch_core::error::Result;
use isoswitch_core::message::Message;
use isoswitch_core::metadata::Metadata;
use isoswitch_core::options::GatewayOptions;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::registry::TransportRegistry;
use crate::socket::Ingress;
use router::Router;
use stage::{StageQueue, StageWorkers};

/// Running pipeline: four stages and their workers.
pub struct Pipeline {
    ingress: Ingress,
    stop: Arc<AtomicBool>,
    workers: Mutex<Vec<StageWorkers>>,
}

impl Pipeline {
    /// Create the stage queues and spawn their workers.
    pub fn start(
        options: &GatewayOptions,
        metadata: Arc<ArcSwap<Metadata>>,
        registry: Arc<TransportRegistry>,
        correlations: Arc<CorrelationStore>,
    ) -> Result<Self> {
        let (receive, receive_rx) = StageQueue::<Message>::new("receive", &options.receive);
        let (inbound, inbound_rx) = StageQueue::new("inbound", &options.inbound);
        let (outbound, outbound_rx) = StageQueue::new("outbound", &options.outbound);
        let (unroutable, unroutable_rx) = StageQueue::new("unroutable", &options.unroutable);

        let router = Arc::new(Router {
            metadata,
            registry,
            correlations,
            inbound,
            outbound,
            unroutable,
        });
        let stop = Arc::new(AtomicBool::new(false));
        let pipeline = Self {
            ingress: Ingress::new(receive.sender(), receive.overflow()),
            stop: Arc::clone(&stop),
            workers: Mutex::new(Vec::with_capacity(4)),
        };

        // On error the partially started pipeline is dropped, which stops it.
        let r = Arc::clone(&router);
        pipeline.add_workers(StageWorkers::spawn(
            "receive",
            receive_rx,
            options.receive.workers,
            Arc::clone(&stop),
            move |msg| r.receive(msg),
        )?);
        let r = Arc::clone(&router);
        pipeline.add_workers(StageWorkers::spawn(
            "inbound",
            inbound_rx,
            options.inbound.workers,
            Arc::clone(&stop),
            move |msg| r.route_inbound(msg),
        )?);
        let r = Arc::clone(&router);
        pipeline.add_workers(StageWorkers::spawn(
            "outbound",
            outbound_rx,
            options.outbound.workers,
            Arc::clone(&stop),
            move |msg| r.route_outbound(msg),
        )?);
        pipeline.add_workers(StageWorkers::spawn(
            "unroutable",
            unroutable_rx,
            options.unroutable.workers,
            Arc::clone(&stop),
            |item: Unroutable| router::log_unroutable(&item),
        )?);

        debug!("[Pipeline] Started");
        Ok(pipeline)
    }

    fn add_workers(&self, workers: StageWorkers) {
        self.workers.lock().push(workers);
    }

    /// Producer handle for connection readers.
    pub fn ingress(&self) -> Ingress {
        self.ingress.clone()
    }

    /// Stop every worker. Messages still queued are discarded.
    pub fn shutdown(&self) {
        if self.stop.swap(true, Ordering::AcqRel) {
            return;
        }
        let workers = std::mem::take(&mut *self.workers.lock());
        for stage in workers {
            stage.join();
        }
        debug!("[Pipeline] Stopped");
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}
