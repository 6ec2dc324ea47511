//! Durable run state for crash recovery and resume.
//!
//! The checkpoint is a single JSON record, written atomically
//! (write-temp-then-rename) by exactly one task: the phase-3 result
//! collector, or the orchestrator between phases. On-disk state is always
//! either the previous checkpoint or the new one, never a torn mix.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;

use crate::prelude::*;

/// Bumped when the on-disk layout changes incompatibly.
pub const CHECKPOINT_VERSION: u32 = 2;

/// One unit of phase-3 work. Jobs are created in phase 2, assigned dense
/// ids in a deterministic order, and never mutated afterwards — resume
/// depends on the ids matching across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationJob {
    pub id: u64,
    pub topic: String,
    pub subtopic: String,
    pub prompt: String,
}

/// Persistent run state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    /// The config file this run was started from. A resume against a
    /// different config is refused.
    pub config_path: PathBuf,
    pub topic: String,
    pub subtopics_complete: bool,
    pub prompts_complete: bool,
    pub subtopics: Vec<String>,
    pub jobs: Vec<GenerationJob>,
    pub completed_jobs: BTreeSet<u64>,
    pub stats: SessionStats,
}

impl Checkpoint {
    pub fn new(config_path: PathBuf, topic: String) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            config_path,
            topic,
            subtopics_complete: false,
            prompts_complete: false,
            subtopics: Vec::new(),
            jobs: Vec::new(),
            completed_jobs: BTreeSet::new(),
            stats: SessionStats::new(),
        }
    }

    /// Load a checkpoint if one exists at `path`.
    pub fn load(path: &Path) -> Result<Option<Checkpoint>> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read checkpoint {:?}", path));
            }
        };
        let checkpoint: Checkpoint = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse checkpoint {:?}", path))?;
        checkpoint.check_integrity()?;
        Ok(Some(checkpoint))
    }

    /// Write the checkpoint atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = path
            .parent()
            .with_context(|| format!("checkpoint path {:?} has no parent", path))?;
        let mut temp = NamedTempFile::new_in(dir)
            .context("failed to create checkpoint temp file")?;
        serde_json::to_writer_pretty(&mut temp, self)
            .context("failed to serialize checkpoint")?;
        temp.as_file()
            .sync_all()
            .context("failed to sync checkpoint")?;
        temp.persist(path)
            .with_context(|| format!("failed to persist checkpoint {:?}", path))?;
        Ok(())
    }

    /// Does this checkpoint belong to the given inputs?
    pub fn matches(&self, config_path: &Path, topic: &str) -> bool {
        self.version == CHECKPOINT_VERSION
            && self.config_path == config_path
            && self.topic == topic
    }

    pub fn mark_job_complete(&mut self, id: u64) {
        self.completed_jobs.insert(id);
    }

    /// The jobs phase 3 still has to run.
    pub fn pending_jobs(&self) -> Vec<GenerationJob> {
        self.jobs
            .iter()
            .filter(|job| !self.completed_jobs.contains(&job.id))
            .cloned()
            .collect()
    }

    fn check_integrity(&self) -> Result<()> {
        if self.version != CHECKPOINT_VERSION {
            bail!(
                "checkpoint version {} is not supported (expected {})",
                self.version,
                CHECKPOINT_VERSION
            );
        }
        if self.prompts_complete && !self.subtopics_complete {
            bail!("corrupt checkpoint: prompts complete before subtopics");
        }
        let job_count = self.jobs.len() as u64;
        if let Some(&max) = self.completed_jobs.iter().next_back() {
            if max >= job_count {
                bail!(
                    "corrupt checkpoint: completed job id {} out of range 0..{}",
                    max,
                    job_count
                );
            }
        }
        Ok(())
    }
}

/// Monotonic session counters.
///
/// On resume the wall-clock start resets but success/failure counts carry
/// across, so throughput averages describe the current process while
/// totals describe the whole session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    pub started_at: DateTime<Utc>,
    pub success_count: u64,
    pub failure_count: u64,
    /// Total jobs created in phase 2.
    pub total_prompts: u64,
    /// Accumulated per-job durations, for averaging.
    pub total_job_seconds: f64,
}

impl SessionStats {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            success_count: 0,
            failure_count: 0,
            total_prompts: 0,
            total_job_seconds: 0.0,
        }
    }

    pub fn record_success(&mut self, duration: std::time::Duration) {
        self.success_count += 1;
        self.total_job_seconds += duration.as_secs_f64();
    }

    pub fn record_failure(&mut self) {
        self.failure_count += 1;
    }

    pub fn average_job_seconds(&self) -> f64 {
        if self.success_count == 0 {
            0.0
        } else {
            self.total_job_seconds / self.success_count as f64
        }
    }

    /// Called on resume.
    pub fn reset_clock(&mut self) {
        self.started_at = Utc::now();
    }
}

impl Default for SessionStats {
    fn default() -> Self {
        Self::new()
    }
}
