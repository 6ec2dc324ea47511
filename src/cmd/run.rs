//! The `run` subcommand: generate (or resume) a dataset.

use std::sync::Arc;

use clap::Args;
use tokio::sync::Mutex as TokioMutex;

use crate::{
    checkpoint::Checkpoint,
    client::{ChatClient, CompletionApi},
    config::AppConfig,
    judge::Judge,
    pipeline::Pipeline,
    prelude::*,
    rate_limit::RateLimiterPool,
    session::Session,
    ui::Ui,
    writer::JsonlDatasetWriter,
};

/// Run command line arguments.
#[derive(Debug, Args)]
pub struct RunOpts {
    /// Run configuration, in TOML format.
    #[clap(short = 'c', long = "config")]
    pub config_path: PathBuf,

    /// Root directory for session output.
    #[clap(short = 'o', long = "output-dir", default_value = "sessions")]
    pub output_dir: PathBuf,

    /// Resume a previous session by directory name. Overrides
    /// `generation.resume_session` in the config.
    #[clap(long)]
    pub resume: Option<String>,
}

/// Run the `run` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_run(ui: &Ui, cancel: CancellationToken, opts: &RunOpts) -> Result<()> {
    let config = AppConfig::load(&opts.config_path).await?;
    config.validate()?;
    let config = Arc::new(config);

    let resume_session = opts
        .resume
        .clone()
        .or_else(|| config.generation.resume_session.clone());
    let session = match &resume_session {
        Some(name) => {
            info!(session = %name, "resuming session");
            Session::open(&opts.output_dir, name)?
        }
        None => {
            let session = Session::create(&opts.output_dir, &config.generation.topic)?;
            session.back_up_config(&opts.config_path)?;
            session
        }
    };

    let checkpoint = match Checkpoint::load(&session.checkpoint_path())? {
        Some(mut checkpoint) => {
            if !checkpoint.matches(&opts.config_path, &config.generation.topic) {
                bail!(
                    "checkpoint in session {:?} was created from different inputs; \
                     refusing to resume",
                    session.name
                );
            }
            info!(
                completed = checkpoint.completed_jobs.len(),
                total = checkpoint.jobs.len(),
                "loaded checkpoint"
            );
            checkpoint.stats.reset_clock();
            checkpoint
        }
        None => Checkpoint::new(
            opts.config_path.clone(),
            config.generation.topic.clone(),
        ),
    };

    let limiter = Arc::new(RateLimiterPool::new());
    let api: Arc<dyn CompletionApi> =
        Arc::new(ChatClient::new(limiter, config.providers.clone())?);
    let judge = match &config.models.judge {
        Some(spec) => {
            let rubric = config
                .templates
                .judge
                .clone()
                .context("judge model configured without a rubric template")?;
            Some(Arc::new(Judge::new(
                api.clone(),
                spec.clone(),
                rubric,
                config.templates.judge_system.clone(),
            )))
        }
        None => None,
    };
    let writer = JsonlDatasetWriter::open(
        session.dataset_path(),
        config.generation.dataset_mode,
    )
    .await?;

    let pipeline = Pipeline {
        config,
        api,
        writer: Arc::new(TokioMutex::new(writer)),
        judge,
        checkpoint,
        checkpoint_path: session.checkpoint_path(),
        ui: ui.clone(),
        cancel,
    };
    let summary = pipeline.run().await?;

    info!(
        session = %session.name,
        jobs = summary.total_jobs,
        succeeded = summary.success_count,
        failed = summary.failure_count,
        avg_job_seconds = summary.average_job_seconds,
        "run finished"
    );
    Ok(())
}
