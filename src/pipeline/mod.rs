//! The three-phase generation pipeline.
//!
//! Phases run strictly in order — subtopics, prompts, preference pairs —
//! and each is skipped on resume when the checkpoint says it already
//! finished. Whatever happens, the shutdown path writes a final
//! checkpoint and closes the dataset writer.

use std::sync::Arc;

use tokio::sync::Mutex as TokioMutex;

use crate::{
    checkpoint::Checkpoint,
    client::CompletionApi,
    config::AppConfig,
    judge::Judge,
    prelude::*,
    ui::Ui,
    writer::DatasetWriter,
};

pub mod pairs;
pub mod prompts;
pub mod subtopics;
#[cfg(test)]
pub(crate) mod testing;

/// The read-only context phases share.
#[derive(Clone)]
pub(crate) struct PhaseCtx {
    pub config: Arc<AppConfig>,
    pub api: Arc<dyn CompletionApi>,
    pub cancel: CancellationToken,
    pub ui: Ui,
}

/// What a finished run reports back to the CLI.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub total_jobs: usize,
    pub success_count: u64,
    pub failure_count: u64,
    pub average_job_seconds: f64,
}

/// The assembled pipeline for one session.
pub struct Pipeline {
    pub config: Arc<AppConfig>,
    pub api: Arc<dyn CompletionApi>,
    pub writer: Arc<TokioMutex<dyn DatasetWriter>>,
    pub judge: Option<Arc<Judge>>,
    pub checkpoint: Checkpoint,
    pub checkpoint_path: PathBuf,
    pub ui: Ui,
    pub cancel: CancellationToken,
}

impl Pipeline {
    /// Run all phases, then flush state no matter how they went.
    pub async fn run(mut self) -> Result<RunSummary> {
        let outcome = self.run_phases().await;
        let flush = self.shutdown_flush().await;

        let summary = RunSummary {
            total_jobs: self.checkpoint.jobs.len(),
            success_count: self.checkpoint.stats.success_count,
            failure_count: self.checkpoint.stats.failure_count,
            average_job_seconds: self.checkpoint.stats.average_job_seconds(),
        };
        match outcome {
            Ok(()) => {
                flush?;
                Ok(summary)
            }
            Err(err) => {
                if let Err(flush_err) = flush {
                    warn!(error = ?flush_err, "shutdown flush failed after run error");
                }
                Err(err)
            }
        }
    }

    async fn run_phases(&mut self) -> Result<()> {
        let ctx = self.phase_ctx();

        if self.checkpoint.subtopics_complete {
            info!(
                count = self.checkpoint.subtopics.len(),
                "resuming with persisted subtopics"
            );
        } else {
            let subtopics = subtopics::run(&ctx).await?;
            self.checkpoint.subtopics = subtopics;
            self.checkpoint.subtopics_complete = true;
            save_checkpoint_logged(&self.checkpoint, &self.checkpoint_path);
        }

        if self.checkpoint.prompts_complete {
            info!(
                count = self.checkpoint.jobs.len(),
                "resuming with persisted jobs"
            );
        } else {
            let jobs = prompts::run(&ctx, &self.checkpoint.subtopics).await?;
            self.checkpoint.stats.total_prompts = jobs.len() as u64;
            self.checkpoint.jobs = jobs;
            self.checkpoint.prompts_complete = true;
            save_checkpoint_logged(&self.checkpoint, &self.checkpoint_path);
        }

        let pending = self.checkpoint.pending_jobs();
        if pending.is_empty() {
            info!("all jobs are already complete; nothing to generate");
            return Ok(());
        }
        info!(
            pending = pending.len(),
            total = self.checkpoint.jobs.len(),
            "dispatching preference-pair jobs"
        );
        let phase = pairs::PairPhase {
            ctx,
            judge: self.judge.clone(),
            writer: self.writer.clone(),
            checkpoint: &mut self.checkpoint,
            checkpoint_path: self.checkpoint_path.as_path(),
        };
        pairs::run(phase, pending).await
    }

    /// The deferred path: one last synchronous checkpoint write (its
    /// failure is surfaced) and a writer close.
    async fn shutdown_flush(&mut self) -> Result<()> {
        self.checkpoint
            .save(&self.checkpoint_path)
            .context("final checkpoint write failed")?;
        self.writer
            .lock()
            .await
            .close()
            .await
            .context("failed to close dataset writer")?;
        Ok(())
    }

    fn phase_ctx(&self) -> PhaseCtx {
        PhaseCtx {
            config: self.config.clone(),
            api: self.api.clone(),
            cancel: self.cancel.clone(),
            ui: self.ui.clone(),
        }
    }
}

/// Mid-run checkpoint writes are best-effort; only the shutdown write may
/// fail the process.
pub(crate) fn save_checkpoint_logged(checkpoint: &Checkpoint, path: &Path) {
    if let Err(err) = checkpoint.save(path) {
        warn!(error = ?err, "checkpoint write failed; continuing");
    }
}
