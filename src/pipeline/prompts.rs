//! Phase 2: prompt generation.
//!
//! One structured call per subtopic, run with bounded parallelism. The
//! resulting job list is deterministic: jobs for subtopic *i* precede
//! those for subtopic *i+1*, and job ids are assigned densely in that
//! order. Resume depends on this ordering being reproducible.

use std::collections::BTreeMap;

use futures::{StreamExt as _, TryStreamExt as _};

use crate::{
    checkpoint::GenerationJob, json_repair, prelude::*, template, wire::ChatMessage,
};

use super::PhaseCtx;

/// Generate prompts for every subtopic and assemble the job list.
pub(crate) async fn run(
    ctx: &PhaseCtx,
    subtopics: &[String],
) -> Result<Vec<GenerationJob>> {
    let generation = &ctx.config.generation;
    let bar = ctx
        .ui
        .phase_bar("generating prompts", subtopics.len() as u64);

    let calls = subtopics.iter().map(|subtopic| {
        let ctx = ctx.clone();
        let bar = bar.clone();
        let subtopic = subtopic.clone();
        async move {
            let prompts = prompts_for_subtopic(&ctx, &subtopic).await?;
            bar.inc(1);
            Ok::<_, anyhow::Error>(prompts)
        }
    });
    // `buffered` preserves input order, which is what makes job ids
    // deterministic.
    let per_subtopic: Vec<Vec<String>> = futures::stream::iter(calls)
        .buffered(generation.concurrency)
        .try_collect()
        .await?;
    bar.finish_with_message("generated prompts");

    let mut jobs = Vec::new();
    for (subtopic, prompts) in subtopics.iter().zip(per_subtopic) {
        for prompt in prompts {
            jobs.push(GenerationJob {
                id: jobs.len() as u64,
                topic: generation.topic.clone(),
                subtopic: subtopic.clone(),
                prompt,
            });
        }
    }
    info!(jobs = jobs.len(), "assembled generation jobs");
    Ok(jobs)
}

/// One structured call asking for this subtopic's prompts.
async fn prompts_for_subtopic(ctx: &PhaseCtx, subtopic: &str) -> Result<Vec<String>> {
    let generation = &ctx.config.generation;
    let templates = &ctx.config.templates;
    let target = generation.num_prompts_per_subtopic;
    let bindings = BTreeMap::from([
        ("topic", generation.topic.clone()),
        ("subtopic", subtopic.to_owned()),
        ("count", target.to_string()),
    ]);

    let mut messages = Vec::with_capacity(2);
    if let Some(system) = &templates.prompt_system {
        messages.push(ChatMessage::system(template::render(system, &bindings)));
    }
    messages.push(ChatMessage::user(template::render(
        &templates.prompt,
        &bindings,
    )));

    let reply = ctx
        .api
        .chat_completion_structured(&ctx.config.models.main, &messages, &ctx.cancel)
        .await
        .with_context(|| format!("prompt generation failed for subtopic {:?}", subtopic))?;
    let mut prompts = json_repair::parse_string_array(&reply.content, 1)
        .with_context(|| format!("prompt response for subtopic {:?} was unusable", subtopic))?;

    if prompts.len() != target {
        warn!(
            subtopic,
            got = prompts.len(),
            want = target,
            "prompt count mismatch"
        );
        prompts.truncate(target);
    }
    Ok(prompts)
}
