//! Phase 1: subtopic generation.
//!
//! The target count is reconciled against noisy model output by
//! over-asking, deduplicating case-insensitively, and retrying once with
//! an exclusion list of what was already collected. Undershoot after the
//! retry is logged, not fatal.

use std::collections::{BTreeMap, HashSet};

use crate::{json_repair, prelude::*, template, wire::ChatMessage};

use super::PhaseCtx;

/// Generate the subtopic list.
pub(crate) async fn run(ctx: &PhaseCtx) -> Result<Vec<String>> {
    let generation = &ctx.config.generation;
    let target = generation.num_subtopics;
    let request_count = buffered_count(target, generation.over_generation_buffer);

    let spinner = ctx.ui.spinner("generating subtopics");
    let collected = request_batch(ctx, request_count, &[]).await?;
    let mut unique = dedup_case_insensitive(collected);

    if unique.len() < target {
        info!(
            have = unique.len(),
            target, "subtopic undershoot; retrying once with an exclusion list"
        );
        let missing = target - unique.len();
        let retry_count = buffered_count(missing, generation.over_generation_buffer);
        let exclusions =
            exclusion_tail(&unique, generation.max_exclusion_list_size).to_vec();
        match request_batch(ctx, retry_count, &exclusions).await {
            Ok(more) => {
                unique.extend(more);
                unique = dedup_case_insensitive(unique);
            }
            Err(err) => {
                warn!(error = %err, "subtopic retry failed; keeping what was collected");
            }
        }
    }

    unique.truncate(target);
    spinner.finish_with_message(format!("generated {} subtopics", unique.len()));

    if unique.is_empty() {
        bail!("no subtopics were generated");
    }
    if unique.len() < target {
        warn!(
            achieved = unique.len(),
            target, "finishing phase with fewer subtopics than configured"
        );
    }
    Ok(unique)
}

/// `target`, padded by the over-generation buffer.
fn buffered_count(target: usize, buffer: f64) -> usize {
    (target as f64 * (1.0 + buffer)).ceil() as usize
}

/// Ask for `total` subtopics, split into chunks when chunking is enabled.
/// A chunk failure after at least one success degrades to the partial
/// result; a failure on the first chunk fails the phase.
async fn request_batch(
    ctx: &PhaseCtx,
    total: usize,
    exclusions: &[String],
) -> Result<Vec<String>> {
    let chunk_size = match ctx.config.generation.subtopic_chunk_size {
        0 => total,
        size => size.min(total),
    };

    let mut collected = Vec::with_capacity(total);
    let mut remaining = total;
    while remaining > 0 {
        let ask = chunk_size.min(remaining);
        match request_chunk(ctx, ask, exclusions).await {
            Ok(items) => collected.extend(items),
            Err(err) if !collected.is_empty() => {
                warn!(
                    error = %err,
                    collected = collected.len(),
                    "subtopic chunk failed; continuing with partial results"
                );
                break;
            }
            Err(err) => return Err(err),
        }
        remaining -= ask;
    }
    Ok(collected)
}

/// One structured call asking for `count` subtopics.
async fn request_chunk(
    ctx: &PhaseCtx,
    count: usize,
    exclusions: &[String],
) -> Result<Vec<String>> {
    let templates = &ctx.config.templates;
    let bindings = BTreeMap::from([
        ("topic", ctx.config.generation.topic.clone()),
        ("count", count.to_string()),
        ("exclude_subtopics", exclusions.join(", ")),
    ]);

    let mut messages = Vec::with_capacity(2);
    if let Some(system) = &templates.subtopic_system {
        messages.push(ChatMessage::system(template::render(system, &bindings)));
    }
    messages.push(ChatMessage::user(template::render(
        &templates.subtopic,
        &bindings,
    )));

    let reply = ctx
        .api
        .chat_completion_structured(&ctx.config.models.main, &messages, &ctx.cancel)
        .await
        .context("subtopic generation call failed")?;
    json_repair::parse_string_array(&reply.content, 1)
        .context("subtopic response was not a usable string array")
}

/// Drop case-folded duplicates, keeping the first occurrence (and its
/// casing) in order.
pub(crate) fn dedup_case_insensitive(items: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.trim().to_lowercase()))
        .collect()
}

/// The last `max` entries: recent items are the ones worth telling the
/// model not to repeat, and the cap bounds the prompt size.
pub(crate) fn exclusion_tail(items: &[String], max: usize) -> &[String] {
    &items[items.len().saturating_sub(max)..]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_dedup_is_case_insensitive_and_order_preserving() {
        let deduped = dedup_case_insensitive(strings(&["x", "X", "y", "y", "z", "w"]));
        assert_eq!(deduped, strings(&["x", "y", "z", "w"]));
    }

    #[test]
    fn test_dedup_keeps_first_casing() {
        let deduped = dedup_case_insensitive(strings(&["Green Tea", "green tea"]));
        assert_eq!(deduped, strings(&["Green Tea"]));
    }

    #[test]
    fn test_exclusion_tail_keeps_most_recent() {
        let items = strings(&["a", "b", "c", "d"]);
        assert_eq!(exclusion_tail(&items, 2), &strings(&["c", "d"])[..]);
        assert_eq!(exclusion_tail(&items, 10), &items[..]);
        assert!(exclusion_tail(&items, 0).is_empty());
    }

    #[test]
    fn test_buffered_count_rounds_up() {
        assert_eq!(buffered_count(3, 0.5), 5);
        assert_eq!(buffered_count(3, 1.0), 6);
        assert_eq!(buffered_count(10, 0.15), 12);
        assert_eq!(buffered_count(10, 0.0), 10);
    }
}
