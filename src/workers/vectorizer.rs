//! Embeds chunks that have no vector binding yet.
use crate::db::SharedDb;
use crate::db::models::{CycleDelta, WorkerKind};
use crate::embedder::Embedder;
use crate::error::{ItemError, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Default, Serialize)]
pub struct VectorizerPass {
    pub cycle_id: Option<String>,
    pub embedded: usize,
    pub failed: usize,
    pub errors: Vec<ItemError>,
}

pub struct Vectorizer {
    db: SharedDb,
    embedder: Arc<dyn Embedder>,
    project_id: Option<i64>,
    batch_size: usize,
    poll_interval: Duration,
}

impl Vectorizer {
    pub fn new(
        db: SharedDb,
        embedder: Arc<dyn Embedder>,
        batch_size: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            db,
            embedder,
            project_id: None,
            batch_size: batch_size.max(1),
            poll_interval,
        }
    }

    /// Restricts the worker to one project.
    pub fn for_project(mut self, project_id: i64) -> Self {
        self.project_id = Some(project_id);
        self
    }

    /// Embeds up to one batch of pending chunks. Chunks that fail stay pending and move
    /// behind untried ones, so a failing head cannot starve the queue. No cycle is
    /// opened when there is nothing to do.
    pub async fn run_pass(&self, cancel: &CancellationToken) -> Result<VectorizerPass> {
        let (pending, cycle_id) = {
            let mut db = self.db.lock().await;
            let pending = db.pending_chunks(self.project_id, self.batch_size)?;
            if pending.is_empty() {
                return Ok(VectorizerPass::default());
            }
            let cycle_id = db.start_cycle(WorkerKind::Vectorizer, pending.len() as i64)?;
            (pending, cycle_id)
        };

        let mut pass = VectorizerPass {
            cycle_id: Some(cycle_id.clone()),
            ..Default::default()
        };

        for chunk in &pending {
            if cancel.is_cancelled() {
                debug!("Vectorizer pass cancelled");
                break;
            }
            let started = Instant::now();
            let outcome = match self.embedder.embed(&chunk.text) {
                Ok(handle) => {
                    let mut db = self.db.lock().await;
                    db.bind_chunk_vector(chunk.id, &handle.vector_id, &handle.model, handle.dim)
                }
                Err(e) => Err(e.into()),
            };

            let mut delta = CycleDelta {
                processing_time: started.elapsed().as_secs_f64(),
                ..Default::default()
            };
            match outcome {
                Ok(()) => {
                    pass.embedded += 1;
                    delta.processed = 1;
                }
                Err(e) => {
                    warn!(chunk_id = chunk.id, "Failed to embed chunk: {e}");
                    pass.failed += 1;
                    delta.failed = 1;
                    pass.errors.push(ItemError::new(Some(chunk.file_id), None, &e));
                    if let Err(e) = self.db.lock().await.record_embed_failure(chunk.id) {
                        warn!(chunk_id = chunk.id, "Failed to record embedding attempt: {e}");
                    }
                }
            }
            if let Err(e) = self.db.lock().await.update_cycle(&cycle_id, delta) {
                warn!(cycle_id = %cycle_id, "Failed to update vectorizer cycle: {e}");
            }
        }

        self.db.lock().await.end_cycle(&cycle_id)?;
        info!(
            cycle_id = %cycle_id,
            embedded = pass.embedded,
            failed = pass.failed,
            model = self.embedder.model_name(),
            "Vectorizer pass finished"
        );
        Ok(pass)
    }

    /// Poll loop; exits when `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        info!(batch_size = self.batch_size, "Vectorizer started");
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.run_pass(&cancel).await {
                        error!("Vectorizer pass failed: {e}");
                    }
                }
            }
        }
        info!("Vectorizer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::db::models::{ChunkDraft, EntityType};
    use crate::embedder::mock::MockEmbedder;

    async fn seeded(texts: &[&str]) -> (SharedDb, i64) {
        let mut db = Db::open_in_memory().unwrap();
        let pid = db.get_or_create_project("/proj", None).unwrap();
        let fid = db.add_file("/proj/a.py", 3, 1.0, false, pid).unwrap();
        let drafts: Vec<_> = texts
            .iter()
            .enumerate()
            .map(|(i, t)| ChunkDraft {
                chunk_uuid: format!("u{i}"),
                chunk_type: "code".into(),
                text: t.to_string(),
                ordinal: i as i64,
                entity_type: Some(EntityType::File),
                entity_id: Some(fid),
            })
            .collect();
        db.sync_file_chunks(fid, pid, &drafts).unwrap();
        (db.into_shared(), fid)
    }

    #[tokio::test]
    async fn test_pass_binds_vectors_and_records_cycle() {
        let (db, fid) = seeded(&["def a(): pass", "  "]).await;
        let vectorizer = Vectorizer::new(
            db.clone(),
            Arc::new(MockEmbedder::default()),
            10,
            Duration::from_secs(1),
        );

        let pass = vectorizer.run_pass(&CancellationToken::new()).await.unwrap();
        assert_eq!(pass.embedded, 1);
        // whitespace-only text is rejected by the embedder
        assert_eq!(pass.failed, 1);

        let guard = db.lock().await;
        let entries = guard.vector_entries_for_file(fid).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].model, "mock-embedder");

        let cycle = guard.get_cycle(pass.cycle_id.as_deref().unwrap()).unwrap();
        assert!(!cycle.is_open());
        assert_eq!(cycle.files_processed, 1);
        assert_eq!(cycle.files_failed, 1);
        assert_eq!(guard.pending_chunks(None, 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_pass_still_closes_cycle() {
        let (db, _) = seeded(&["x = 1"]).await;
        let vectorizer = Vectorizer::new(
            db.clone(),
            Arc::new(MockEmbedder::default()),
            10,
            Duration::from_secs(1),
        );
        let token = CancellationToken::new();
        token.cancel();

        let pass = vectorizer.run_pass(&token).await.unwrap();
        assert_eq!(pass.embedded, 0);
        let guard = db.lock().await;
        assert_eq!(guard.open_cycle_count(WorkerKind::Vectorizer).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failing_chunks_yield_to_untried_ones() {
        let (db, fid) = seeded(&[" ", "  ", "def b(): pass", "def c(): pass"]).await;
        let vectorizer = Vectorizer::new(
            db.clone(),
            Arc::new(MockEmbedder::default()),
            2,
            Duration::from_secs(1),
        );

        let first = vectorizer.run_pass(&CancellationToken::new()).await.unwrap();
        assert_eq!((first.embedded, first.failed), (0, 2));

        let second = vectorizer.run_pass(&CancellationToken::new()).await.unwrap();
        assert_eq!((second.embedded, second.failed), (2, 0));

        let guard = db.lock().await;
        assert_eq!(guard.vector_entries_for_file(fid).unwrap().len(), 2);
        let pending = guard.pending_chunks(None, 10).unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().all(|c| c.text.trim().is_empty()));
    }

    #[tokio::test]
    async fn test_idle_pass_opens_no_cycle() {
        let (db, _) = seeded(&[]).await;
        let vectorizer = Vectorizer::new(
            db.clone(),
            Arc::new(MockEmbedder::default()),
            10,
            Duration::from_secs(1),
        );
        let pass = vectorizer.run_pass(&CancellationToken::new()).await.unwrap();
        assert!(pass.cycle_id.is_none());
        assert!(db.lock().await.get_current(WorkerKind::Vectorizer).unwrap().is_none());
    }
}
