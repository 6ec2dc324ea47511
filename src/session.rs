//! Session directories: the unit of resume.
//!
//! A session directory holds everything one run produces: the checkpoint,
//! a backup of the config it was started with, and the output dataset.
//! Resuming means reopening the directory by name.

use chrono::Utc;

use crate::prelude::*;

const CHECKPOINT_FILE: &str = "checkpoint.json";
const DATASET_FILE: &str = "dataset.jsonl";
const CONFIG_BACKUP_FILE: &str = "config.toml";

/// One session directory.
#[derive(Debug, Clone)]
pub struct Session {
    pub name: String,
    pub dir: PathBuf,
}

impl Session {
    /// Create a fresh, timestamped session directory under `output_root`.
    pub fn create(output_root: &Path, topic: &str) -> Result<Session> {
        let name = format!(
            "{}-{}",
            slugify(topic),
            Utc::now().format("%Y%m%d-%H%M%S")
        );
        let dir = output_root.join(&name);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create session directory {:?}", dir))?;
        info!(session = %name, "created session directory");
        Ok(Session { name, dir })
    }

    /// Reopen an existing session directory for resume.
    pub fn open(output_root: &Path, name: &str) -> Result<Session> {
        let dir = output_root.join(name);
        if !dir.is_dir() {
            bail!("session directory {:?} does not exist", dir);
        }
        Ok(Session {
            name: name.to_owned(),
            dir,
        })
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.dir.join(CHECKPOINT_FILE)
    }

    pub fn dataset_path(&self) -> PathBuf {
        self.dir.join(DATASET_FILE)
    }

    pub fn config_backup_path(&self) -> PathBuf {
        self.dir.join(CONFIG_BACKUP_FILE)
    }

    /// Copy the run config into the session, so the session stays
    /// reproducible even if the original file is edited later.
    pub fn back_up_config(&self, source: &Path) -> Result<()> {
        std::fs::copy(source, self.config_backup_path())
            .with_context(|| format!("failed to back up config {:?}", source))?;
        Ok(())
    }
}

/// A filesystem-safe slug of the topic, for readable directory names.
fn slugify(topic: &str) -> String {
    let mut slug = String::with_capacity(topic.len());
    let mut last_dash = false;
    for c in topic.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash && !slug.is_empty() {
            slug.push('-');
            last_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    if slug.is_empty() {
        slug.push_str("session");
    }
    slug.truncate(40);
    slug
}
