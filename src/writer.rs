//! Dataset output.
//!
//! The pipeline treats the writer as a narrow sink: append a record and
//! get its index back, patch a judge result onto an earlier index, flush,
//! close. The JSONL implementation journals every record to disk as it is
//! written; judge updates land in memory and are folded into a rewrite on
//! the next flush, so the file always ends up in its final judged form.

use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncWriteExt as _, BufWriter},
};

use crate::{config::DatasetMode, judge::JudgeResult, prelude::*};

/// One preference tuple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreferenceRecord {
    pub topic: String,
    pub subtopic: String,
    pub prompt: String,
    pub chosen: String,
    pub rejected: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub judge: Option<JudgeResult>,
}

/// The sink the pipeline writes into.
#[async_trait]
pub trait DatasetWriter: Send + Sync {
    /// Append a record; returns its stable index.
    async fn write_record(&mut self, record: PreferenceRecord) -> Result<usize>;

    /// Attach a judge result to an earlier record.
    async fn update_record(&mut self, index: usize, judge: JudgeResult) -> Result<()>;

    async fn flush(&mut self) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Line-delimited JSON on disk.
pub struct JsonlDatasetWriter {
    path: PathBuf,
    mode: DatasetMode,
    records: Vec<PreferenceRecord>,
    out: Option<BufWriter<File>>,
    /// A judge update arrived after its line was journaled; the file
    /// needs a rewrite.
    dirty: bool,
}

impl JsonlDatasetWriter {
    /// Open (or create) a dataset file. Existing records are loaded back
    /// so that indices stay stable across a resume.
    pub async fn open(path: PathBuf, mode: DatasetMode) -> Result<Self> {
        let records = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(|line| {
                    let value: Value = serde_json::from_str(line).with_context(|| {
                        format!("corrupt dataset line in {:?}: {:?}", path, line)
                    })?;
                    record_from_json(value, mode)
                })
                .collect::<Result<Vec<_>>>()?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read dataset {:?}", path));
            }
        };
        if !records.is_empty() {
            info!(count = records.len(), "reloaded existing dataset records");
        }
        let out = Self::append_handle(&path).await?;
        Ok(Self {
            path,
            mode,
            records,
            out: Some(out),
            dirty: false,
        })
    }

    async fn append_handle(path: &Path) -> Result<BufWriter<File>> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("failed to open dataset {:?}", path))?;
        Ok(BufWriter::new(file))
    }

    /// Rewrite the whole file from the in-memory table, atomically.
    async fn rewrite(&mut self) -> Result<()> {
        self.out = None;
        let mut content = String::new();
        for record in &self.records {
            let line = serde_json::to_string(&record_to_json(record, self.mode))
                .context("failed to serialize dataset record")?;
            content.push_str(&line);
            content.push('\n');
        }
        let temp = self.path.with_extension("jsonl.tmp");
        tokio::fs::write(&temp, content)
            .await
            .with_context(|| format!("failed to write dataset temp file {:?}", temp))?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .with_context(|| format!("failed to replace dataset {:?}", self.path))?;
        self.out = Some(Self::append_handle(&self.path).await?);
        self.dirty = false;
        Ok(())
    }

    fn out(&mut self) -> Result<&mut BufWriter<File>> {
        self.out.as_mut().context("dataset writer is closed")
    }
}

#[async_trait]
impl DatasetWriter for JsonlDatasetWriter {
    async fn write_record(&mut self, record: PreferenceRecord) -> Result<usize> {
        let line = serde_json::to_string(&record_to_json(&record, self.mode))
            .context("failed to serialize dataset record")?;
        let out = self.out()?;
        out.write_all(line.as_bytes())
            .await
            .context("failed to write dataset record")?;
        out.write_all(b"\n")
            .await
            .context("failed to write dataset record")?;
        // Journal semantics: a record that was acknowledged is on disk.
        out.flush().await.context("failed to flush dataset")?;
        let index = self.records.len();
        self.records.push(record);
        Ok(index)
    }

    async fn update_record(&mut self, index: usize, judge: JudgeResult) -> Result<()> {
        let record = self
            .records
            .get_mut(index)
            .with_context(|| format!("no dataset record at index {}", index))?;
        record.judge = Some(judge);
        self.dirty = true;
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if self.dirty {
            self.rewrite().await
        } else if self.out.is_some() {
            self.out()?.flush().await.context("failed to flush dataset")
        } else {
            Ok(())
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.flush().await?;
        if let Some(mut out) = self.out.take() {
            out.flush().await.context("failed to flush dataset")?;
            out.into_inner()
                .sync_all()
                .await
                .context("failed to sync dataset")?;
        }
        Ok(())
    }
}

/// Shape a record for the configured dataset mode.
fn record_to_json(record: &PreferenceRecord, mode: DatasetMode) -> Value {
    match mode {
        DatasetMode::Standard => {
            serde_json::to_value(record).expect("record serialization cannot fail")
        }
        DatasetMode::Conversational => {
            let mut value = serde_json::json!({
                "topic": record.topic,
                "subtopic": record.subtopic,
                "prompt": [{"role": "user", "content": record.prompt}],
                "chosen": [{"role": "assistant", "content": record.chosen}],
                "rejected": [{"role": "assistant", "content": record.rejected}],
            });
            if let Some(judge) = &record.judge {
                value["judge"] =
                    serde_json::to_value(judge).expect("judge serialization cannot fail");
            }
            value
        }
    }
}

/// Parse a journaled line back into a record, for resume.
fn record_from_json(value: Value, mode: DatasetMode) -> Result<PreferenceRecord> {
    match mode {
        DatasetMode::Standard => {
            serde_json::from_value(value).context("corrupt dataset record")
        }
        DatasetMode::Conversational => {
            let text = |field: &str| -> Result<String> {
                value
                    .get(field)
                    .and_then(|messages| messages.get(0))
                    .and_then(|message| message.get("content"))
                    .and_then(Value::as_str)
                    .map(ToOwned::to_owned)
                    .with_context(|| format!("corrupt dataset record field {:?}", field))
            };
            let judge = match value.get("judge") {
                Some(judge) => Some(
                    serde_json::from_value(judge.clone())
                        .context("corrupt judge block in dataset record")?,
                ),
                None => None,
            };
            Ok(PreferenceRecord {
                topic: value
                    .get("topic")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned(),
                subtopic: value
                    .get("subtopic")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned(),
                prompt: text("prompt")?,
                chosen: text("chosen")?,
                rejected: text("rejected")?,
                judge,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::judge::{CriterionScore, JudgeResult};
    use std::collections::BTreeMap;

    fn record(n: usize) -> PreferenceRecord {
        PreferenceRecord {
            topic: "tea".to_owned(),
            subtopic: "green".to_owned(),
            prompt: format!("prompt {}", n),
            chosen: format!("good {}", n),
            rejected: format!("bad {}", n),
            judge: None,
        }
    }

    fn judge_result() -> JudgeResult {
        let score = |s: f64| CriterionScore {
            score: s,
            reasoning: "because".to_owned(),
        };
        JudgeResult::new(
            BTreeMap::from([("clarity".to_owned(), score(4.0))]),
            BTreeMap::from([("clarity".to_owned(), score(2.0))]),
        )
    }

    #[tokio::test]
    async fn test_write_then_reload_keeps_indices_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dataset.jsonl");

        let mut writer = JsonlDatasetWriter::open(path.clone(), DatasetMode::Standard)
            .await
            .unwrap();
        assert_eq!(writer.write_record(record(0)).await.unwrap(), 0);
        assert_eq!(writer.write_record(record(1)).await.unwrap(), 1);
        writer.close().await.unwrap();

        let mut reopened = JsonlDatasetWriter::open(path, DatasetMode::Standard)
            .await
            .unwrap();
        assert_eq!(reopened.write_record(record(2)).await.unwrap(), 2);
        reopened.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_judge_update_lands_on_disk_after_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dataset.jsonl");

        let mut writer = JsonlDatasetWriter::open(path.clone(), DatasetMode::Standard)
            .await
            .unwrap();
        writer.write_record(record(0)).await.unwrap();
        writer.write_record(record(1)).await.unwrap();
        writer.update_record(0, judge_result()).await.unwrap();
        writer.close().await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<Value> = raw
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["judge"]["margin"], 2.0);
        assert!(lines[1].get("judge").is_none());
    }

    #[tokio::test]
    async fn test_update_out_of_range_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dataset.jsonl");
        let mut writer = JsonlDatasetWriter::open(path, DatasetMode::Standard)
            .await
            .unwrap();
        assert!(writer.update_record(5, judge_result()).await.is_err());
    }

    #[tokio::test]
    async fn test_conversational_mode_wraps_messages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dataset.jsonl");

        let mut writer =
            JsonlDatasetWriter::open(path.clone(), DatasetMode::Conversational)
                .await
                .unwrap();
        writer.write_record(record(0)).await.unwrap();
        writer.close().await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let line: Value = serde_json::from_str(raw.lines().next().unwrap()).unwrap();
        assert_eq!(line["prompt"][0]["role"], "user");
        assert_eq!(line["prompt"][0]["content"], "prompt 0");
        assert_eq!(line["chosen"][0]["role"], "assistant");
        assert_eq!(line["rejected"][0]["content"], "bad 0");

        // And it reloads.
        let reopened = JsonlDatasetWriter::open(path, DatasetMode::Conversational)
            .await
            .unwrap();
        assert_eq!(reopened.records.len(), 1);
        assert_eq!(reopened.records[0].prompt, "prompt 0");
    }
}
