//! Feeds the workflow log into registered projections.

use event_store::EventStore;
use futures_util::StreamExt;
use tokio::sync::Mutex;

use crate::Result;
use crate::projection::{Checkpoint, InstanceEvent, Projection};

/// Streams the global log into projections, tracking a checkpoint per
/// projection.
///
/// Each entry is decoded once and offered to every projection whose
/// checkpoint has not passed it. Entries of other streams only move the
/// checkpoints. Catch-up runs are serialized, so concurrent callers never
/// deliver the same entry twice.
pub struct ProjectionProcessor<S: EventStore> {
    store: S,
    projections: Vec<Box<dyn Projection>>,
    checkpoints: Mutex<Vec<Checkpoint>>,
}

impl<S: EventStore> ProjectionProcessor<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            projections: Vec::new(),
            checkpoints: Mutex::new(Vec::new()),
        }
    }

    /// Registers a projection starting from the beginning of the log.
    pub fn register(&mut self, projection: Box<dyn Projection>) {
        self.projections.push(projection);
        self.checkpoints.get_mut().push(Checkpoint::zero());
    }

    pub fn projection_count(&self) -> usize {
        self.projections.len()
    }

    /// Current checkpoint of every projection, in registration order.
    pub async fn checkpoints(&self) -> Vec<(&'static str, Checkpoint)> {
        let checkpoints = self.checkpoints.lock().await;
        self.projections
            .iter()
            .zip(checkpoints.iter())
            .map(|(p, cp)| (p.name(), *cp))
            .collect()
    }

    /// Delivers every log entry some projection has not seen yet.
    ///
    /// A projection that fails keeps its checkpoint at the failing entry and
    /// the error is returned; the next run retries from there.
    #[tracing::instrument(skip(self))]
    pub async fn run_catch_up(&self) -> Result<()> {
        let mut checkpoints = self.checkpoints.lock().await;
        let Some(low_water) = checkpoints.iter().min().copied() else {
            return Ok(());
        };

        let mut stream = self.store.read_all().await?;
        let mut offset = Checkpoint::zero();
        let mut delivered = 0u64;

        while let Some(entry) = stream.next().await {
            let envelope = entry?;
            if offset < low_water {
                offset = offset.next();
                continue;
            }

            let decoded = InstanceEvent::decode(&envelope)?;
            for (projection, checkpoint) in self.projections.iter().zip(checkpoints.iter_mut()) {
                if *checkpoint > offset {
                    continue;
                }
                if let Some(event) = &decoded {
                    projection.apply(event).await?;
                    delivered += 1;
                    metrics::counter!("projections_events_processed", "projection" => projection.name())
                        .increment(1);
                }
                *checkpoint = checkpoint.next();
            }
            offset = offset.next();
        }

        tracing::debug!(log_entries = offset.offset(), delivered, "catch-up complete");
        Ok(())
    }

    /// Resets every projection and replays the whole log.
    #[tracing::instrument(skip(self))]
    pub async fn rebuild_all(&self) -> Result<()> {
        {
            let mut checkpoints = self.checkpoints.lock().await;
            for (projection, checkpoint) in self.projections.iter().zip(checkpoints.iter_mut()) {
                projection.reset().await?;
                *checkpoint = Checkpoint::zero();
            }
        }
        self.run_catch_up().await
    }
}
