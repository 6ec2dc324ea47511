//! The `check` subcommand: validate a config and show the resolved plan.

use clap::Args;

use crate::{config::AppConfig, prelude::*, provider::provider_for};

/// Check command line arguments.
#[derive(Debug, Args)]
pub struct CheckOpts {
    /// Run configuration, in TOML format.
    #[clap(short = 'c', long = "config")]
    pub config_path: PathBuf,
}

/// Run the `check` subcommand.
pub async fn cmd_check(opts: &CheckOpts) -> Result<()> {
    let config = AppConfig::load(&opts.config_path).await?;
    config.validate()?;

    let generation = &config.generation;
    let target_pairs = generation.num_subtopics * generation.num_prompts_per_subtopic;
    println!("Configuration OK: {:?}", opts.config_path);
    println!();
    println!("Topic:        {}", generation.topic);
    println!(
        "Plan:         {} subtopics x {} prompts = {} preference pairs (best effort)",
        generation.num_subtopics, generation.num_prompts_per_subtopic, target_pairs
    );
    println!(
        "Concurrency:  {} workers, checkpoint every {} jobs",
        generation.concurrency, generation.checkpoint_interval
    );
    println!("Dataset mode: {:?}", generation.dataset_mode);
    println!();

    let mut models = vec![("main", &config.models.main), ("rejected", &config.models.rejected)];
    if let Some(judge) = &config.models.judge {
        models.push(("judge", judge));
    }
    for (role, spec) in models {
        let provider = provider_for(&spec.base_url);
        let provider_limit = match config.providers.get(provider) {
            Some(limits) => format!(" (provider {:?} capped at {} rpm)", provider, limits.rpm),
            None => String::new(),
        };
        println!(
            "Model {:<9} {} @ {} [{} rpm{}{}]",
            format!("{}:", role),
            spec.name,
            spec.base_url,
            spec.rpm,
            if spec.use_streaming { ", streaming" } else { "" },
            provider_limit,
        );
    }
    if config.models.judge.is_none() {
        println!("Model judge:    (not configured)");
    }
    Ok(())
}
