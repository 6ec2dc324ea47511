//! Declarative run configuration, loaded from TOML.

use std::{collections::BTreeMap, time::Duration};

use crate::{
    prelude::*,
    retry::Retries,
    template::{self, TemplateRole},
};

/// Everything a run needs: counts, endpoints, limits, and templates.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    pub generation: GenerationConfig,
    pub models: ModelsConfig,
    /// Provider-wide rate limits, keyed by provider name.
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderLimits>,
    pub templates: Templates,
}

/// The chat endpoints a run talks to.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelsConfig {
    /// Generates subtopics, prompts, and chosen responses.
    pub main: ModelConfig,
    /// Generates rejected responses.
    pub rejected: ModelConfig,
    /// Scores preference pairs. Optional.
    pub judge: Option<ModelConfig>,
}

/// One chat-completion endpoint and its sampling/limit knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    pub base_url: String,
    pub name: String,
    #[serde(default = "defaults::temperature")]
    pub temperature: f32,
    /// Lower temperature used only for JSON-producing calls, where
    /// creative sampling mostly produces broken output.
    #[serde(default)]
    pub structure_temperature: Option<f32>,
    #[serde(default = "defaults::top_p")]
    pub top_p: f32,
    #[serde(default = "defaults::max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "defaults::context_size")]
    pub context_size: u32,
    /// Requests per minute allowed against this model.
    #[serde(default = "defaults::rpm")]
    pub rpm: usize,
    #[serde(default = "defaults::max_backoff_seconds")]
    pub max_backoff_seconds: u64,
    /// `-1` means retry until cancelled.
    #[serde(default)]
    pub max_retries: Retries,
    #[serde(default = "defaults::http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    /// Only meaningful on the judge model.
    #[serde(default)]
    pub judge_timeout_seconds: Option<u64>,
    /// Ask the server for `response_format = json_object`.
    #[serde(default)]
    pub json_mode: bool,
    /// Read the response as an SSE stream instead of one JSON body.
    #[serde(default)]
    pub use_streaming: bool,
}

impl ModelConfig {
    /// The identity used for model-level rate limiting.
    pub fn identity(&self) -> String {
        format!("{}|{}", self.base_url, self.name)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_seconds)
    }

    pub fn judge_timeout(&self) -> Duration {
        Duration::from_secs(
            self.judge_timeout_seconds
                .unwrap_or(defaults::JUDGE_TIMEOUT_SECONDS),
        )
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_seconds)
    }

    /// A copy tuned for JSON-producing calls: `structure_temperature`
    /// replaces `temperature` when set.
    pub fn for_structured_output(&self) -> ModelConfig {
        let mut spec = self.clone();
        if let Some(temperature) = spec.structure_temperature {
            spec.temperature = temperature;
        }
        spec
    }
}

/// Counts, concurrency, and resume behavior.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenerationConfig {
    /// The seed topic everything fans out from.
    pub topic: String,
    pub num_subtopics: usize,
    pub num_prompts_per_subtopic: usize,
    #[serde(default = "defaults::concurrency")]
    pub concurrency: usize,
    /// Multiplicative over-ask applied to generation requests to absorb
    /// duplicates and undershoot.
    #[serde(default = "defaults::over_generation_buffer")]
    pub over_generation_buffer: f64,
    /// Per-request cap on subtopic asks. `0` disables chunking.
    #[serde(default = "defaults::subtopic_chunk_size")]
    pub subtopic_chunk_size: usize,
    /// Cap on the exclusion list passed back on a retry, keeping the most
    /// recent entries.
    #[serde(default = "defaults::max_exclusion_list_size")]
    pub max_exclusion_list_size: usize,
    /// Checkpoint after this many successful jobs.
    #[serde(default = "defaults::checkpoint_interval")]
    pub checkpoint_interval: usize,
    /// Resume this session directory instead of starting fresh.
    #[serde(default)]
    pub resume_session: Option<String>,
    #[serde(default)]
    pub dataset_mode: DatasetMode,
}

/// Shape of the emitted dataset records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetMode {
    /// Flat `prompt` / `chosen` / `rejected` string fields.
    #[default]
    Standard,
    /// Chat-message lists, as preference-tuning toolchains expect them.
    Conversational,
}

/// A provider-wide request budget shared by every model on that provider.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderLimits {
    pub rpm: usize,
    /// Burst capacity as a percentage of the RPM, 1..=50.
    #[serde(default = "defaults::burst_percent")]
    pub burst_percent: u32,
}

/// Prompt templates, keyed by role. See [`template`] for the allowed
/// variables per role.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Templates {
    pub subtopic: String,
    pub prompt: String,
    pub chosen: String,
    pub rejected: String,
    pub judge: Option<String>,
    #[serde(default)]
    pub subtopic_system: Option<String>,
    #[serde(default)]
    pub prompt_system: Option<String>,
    #[serde(default)]
    pub chosen_system: Option<String>,
    #[serde(default)]
    pub rejected_system: Option<String>,
    #[serde(default)]
    pub judge_system: Option<String>,
}

impl AppConfig {
    /// Load and parse a TOML config file.
    pub async fn load(path: &Path) -> Result<AppConfig> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file {:?}", path))?;
        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {:?}", path))
    }

    /// Check ranges and template rules. Everything wrong with the config
    /// should surface here, before any request is made.
    pub fn validate(&self) -> Result<()> {
        let generation = &self.generation;
        if generation.topic.trim().is_empty() {
            bail!("generation.topic must not be empty");
        }
        if generation.num_subtopics == 0 {
            bail!("generation.num_subtopics must be at least 1");
        }
        if generation.num_prompts_per_subtopic == 0 {
            bail!("generation.num_prompts_per_subtopic must be at least 1");
        }
        if generation.concurrency == 0 {
            bail!("generation.concurrency must be at least 1");
        }
        if generation.over_generation_buffer < 0.0 {
            bail!("generation.over_generation_buffer must not be negative");
        }
        if generation.checkpoint_interval == 0 {
            bail!("generation.checkpoint_interval must be at least 1");
        }

        for (role, spec) in self.model_specs() {
            if spec.base_url.trim().is_empty() {
                bail!("models.{}.base_url must not be empty", role);
            }
            if spec.name.trim().is_empty() {
                bail!("models.{}.name must not be empty", role);
            }
            if !(0.0..=2.0).contains(&spec.temperature) {
                bail!("models.{}.temperature must be within 0.0..=2.0", role);
            }
            if let Some(temperature) = spec.structure_temperature {
                if !(0.0..=2.0).contains(&temperature) {
                    bail!(
                        "models.{}.structure_temperature must be within 0.0..=2.0",
                        role
                    );
                }
            }
            if !(0.0..=1.0).contains(&spec.top_p) {
                bail!("models.{}.top_p must be within 0.0..=1.0", role);
            }
            if spec.rpm == 0 {
                bail!("models.{}.rpm must be at least 1", role);
            }
            if spec.max_tokens > spec.context_size {
                bail!(
                    "models.{}.max_tokens ({}) exceeds context_size ({})",
                    role,
                    spec.max_tokens,
                    spec.context_size
                );
            }
        }

        for (name, limits) in &self.providers {
            if limits.rpm == 0 {
                bail!("providers.{}.rpm must be at least 1", name);
            }
            if !(1..=50).contains(&limits.burst_percent) {
                bail!("providers.{}.burst_percent must be within 1..=50", name);
            }
        }

        self.validate_templates()
    }

    fn validate_templates(&self) -> Result<()> {
        let templates = &self.templates;
        let mut checks: Vec<(TemplateRole, &str)> = vec![
            (TemplateRole::Subtopic, templates.subtopic.as_str()),
            (TemplateRole::Prompt, templates.prompt.as_str()),
            (TemplateRole::Chosen, templates.chosen.as_str()),
            (TemplateRole::Rejected, templates.rejected.as_str()),
        ];
        for (role, system) in [
            (TemplateRole::Subtopic, &templates.subtopic_system),
            (TemplateRole::Prompt, &templates.prompt_system),
            (TemplateRole::Chosen, &templates.chosen_system),
            (TemplateRole::Rejected, &templates.rejected_system),
            (TemplateRole::Judge, &templates.judge_system),
        ] {
            if let Some(text) = system {
                checks.push((role, text.as_str()));
            }
        }

        if self.models.judge.is_some() {
            let rubric = templates
                .judge
                .as_deref()
                .context("models.judge is configured but templates.judge is missing")?;
            checks.push((TemplateRole::Judge, rubric));
        } else if templates.judge.is_some() {
            warn!("templates.judge is set but models.judge is not; it will be ignored");
        }

        for (role, text) in checks {
            template::validate(role, text)?;
        }
        Ok(())
    }

    fn model_specs(&self) -> Vec<(&'static str, &ModelConfig)> {
        let mut specs = vec![
            ("main", &self.models.main),
            ("rejected", &self.models.rejected),
        ];
        if let Some(judge) = &self.models.judge {
            specs.push(("judge", judge));
        }
        specs
    }
}

mod defaults {
    pub const JUDGE_TIMEOUT_SECONDS: u64 = 100;

    pub fn temperature() -> f32 {
        0.8
    }

    pub fn top_p() -> f32 {
        0.95
    }

    pub fn max_tokens() -> u32 {
        4096
    }

    pub fn context_size() -> u32 {
        32768
    }

    pub fn rpm() -> usize {
        60
    }

    pub fn max_backoff_seconds() -> u64 {
        120
    }

    pub fn http_timeout_seconds() -> u64 {
        120
    }

    pub fn concurrency() -> usize {
        4
    }

    pub fn over_generation_buffer() -> f64 {
        0.15
    }

    pub fn subtopic_chunk_size() -> usize {
        30
    }

    pub fn max_exclusion_list_size() -> usize {
        50
    }

    pub fn checkpoint_interval() -> usize {
        10
    }

    pub fn burst_percent() -> u32 {
        15
    }
}
