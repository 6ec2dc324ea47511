//! Phase 3: preference-pair generation.
//!
//! A fixed pool of symmetric workers consumes jobs from one unbounded
//! channel. Within a job the ordering is strict — chosen call, rejected
//! call, then judge — but jobs interleave freely across workers. A single
//! collector owns the checkpoint and the record writes; judge results
//! arrive asynchronously through a bounded update channel drained by one
//! updater task.

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::{Mutex as TokioMutex, mpsc, oneshot};

use crate::{
    checkpoint::{Checkpoint, GenerationJob},
    client::CompletionApi,
    config::{AppConfig, ModelConfig},
    judge::{Judge, JudgeResult},
    prelude::*,
    template,
    wire::ChatMessage,
    writer::{DatasetWriter, PreferenceRecord},
};

use super::{PhaseCtx, save_checkpoint_logged};

/// Bound on outstanding judge updates. Keeps a slow judge from building an
/// unbounded backlog of finished evaluations.
const JUDGE_UPDATE_CAPACITY: usize = 100;

/// Everything phase 3 needs. The checkpoint stays exclusively owned by the
/// collector for the duration of the phase.
pub(crate) struct PairPhase<'a> {
    pub ctx: PhaseCtx,
    pub judge: Option<Arc<Judge>>,
    pub writer: Arc<TokioMutex<dyn DatasetWriter>>,
    pub checkpoint: &'a mut Checkpoint,
    pub checkpoint_path: &'a Path,
}

/// State shared by the workers.
struct WorkerCtx {
    config: Arc<AppConfig>,
    api: Arc<dyn CompletionApi>,
    judge: Option<Arc<Judge>>,
    updates_tx: Option<mpsc::Sender<(usize, JudgeResult)>>,
    cancel: CancellationToken,
}

/// A finished pair, before the collector has written it.
struct CompletedPair {
    chosen: String,
    rejected: String,
    /// Present when a judge task is waiting to learn the record index.
    index_tx: Option<oneshot::Sender<usize>>,
}

/// What a worker hands the collector.
struct JobOutcome {
    job: GenerationJob,
    result: Result<CompletedPair>,
    duration: Duration,
}

/// Run the pending jobs to completion (or cancellation).
pub(crate) async fn run(phase: PairPhase<'_>, pending: Vec<GenerationJob>) -> Result<()> {
    let PairPhase {
        ctx,
        judge,
        writer,
        checkpoint,
        checkpoint_path,
    } = phase;
    let concurrency = ctx.config.generation.concurrency;
    let interval = ctx.config.generation.checkpoint_interval;
    let bar = ctx
        .ui
        .phase_bar("generating preference pairs", pending.len() as u64);

    let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
    let jobs_rx = Arc::new(TokioMutex::new(jobs_rx));
    let (results_tx, mut results_rx) = mpsc::unbounded_channel();
    let (updates_tx, updates_rx) = mpsc::channel(JUDGE_UPDATE_CAPACITY);

    let updater = judge
        .is_some()
        .then(|| tokio::spawn(updater_loop(updates_rx, writer.clone())));
    let updates_tx = judge.is_some().then_some(updates_tx);

    let worker_ctx = Arc::new(WorkerCtx {
        config: ctx.config.clone(),
        api: ctx.api.clone(),
        judge,
        updates_tx,
        cancel: ctx.cancel.clone(),
    });

    // Enqueue everything up front and close the channel; workers exit
    // when it drains.
    for job in pending {
        let _ = jobs_tx.send(job);
    }
    drop(jobs_tx);

    let mut workers = Vec::with_capacity(concurrency);
    for worker_id in 0..concurrency {
        workers.push(tokio::spawn(worker_loop(
            worker_id,
            worker_ctx.clone(),
            jobs_rx.clone(),
            results_tx.clone(),
        )));
    }
    // Workers and judge tasks hold their own handles; ours would keep the
    // result and update channels from ever closing.
    drop(results_tx);
    drop(worker_ctx);

    // Collector: the only task that touches the checkpoint or writes
    // records.
    let mut successes_since_checkpoint = 0usize;
    let mut collect_error: Option<anyhow::Error> = None;
    while let Some(outcome) = results_rx.recv().await {
        match outcome.result {
            Ok(CompletedPair {
                chosen,
                rejected,
                index_tx,
            }) => {
                let record = PreferenceRecord {
                    topic: outcome.job.topic.clone(),
                    subtopic: outcome.job.subtopic.clone(),
                    prompt: outcome.job.prompt.clone(),
                    chosen,
                    rejected,
                    judge: None,
                };
                let index = match writer.lock().await.write_record(record).await {
                    Ok(index) => index,
                    Err(err) => {
                        // A broken sink fails the run; stop the workers.
                        collect_error =
                            Some(err.context("failed to write dataset record"));
                        ctx.cancel.cancel();
                        break;
                    }
                };
                if let Some(index_tx) = index_tx {
                    let _ = index_tx.send(index);
                }
                checkpoint.mark_job_complete(outcome.job.id);
                checkpoint.stats.record_success(outcome.duration);
                successes_since_checkpoint += 1;
                if successes_since_checkpoint >= interval {
                    save_checkpoint_logged(checkpoint, checkpoint_path);
                    successes_since_checkpoint = 0;
                }
            }
            Err(err) => {
                checkpoint.stats.record_failure();
                warn!(job = outcome.job.id, error = ?err, "job failed");
            }
        }
        bar.inc(1);
    }

    // Shutdown ordering: workers first, then the updater, so every judge
    // result that will ever arrive has been applied before the phase ends.
    for worker in workers {
        let _ = worker.await;
    }
    if let Some(updater) = updater {
        let _ = updater.await;
    }
    bar.finish_with_message("generated preference pairs");

    if let Some(err) = collect_error {
        return Err(err);
    }
    save_checkpoint_logged(checkpoint, checkpoint_path);
    Ok(())
}

async fn worker_loop(
    worker_id: usize,
    ctx: Arc<WorkerCtx>,
    jobs: Arc<TokioMutex<mpsc::UnboundedReceiver<GenerationJob>>>,
    results: mpsc::UnboundedSender<JobOutcome>,
) {
    loop {
        let job = {
            let mut jobs = jobs.lock().await;
            tokio::select! {
                _ = ctx.cancel.cancelled() => None,
                job = jobs.recv() => job,
            }
        };
        let Some(job) = job else { break };
        let started = Instant::now();
        let result = process_job(&ctx, &job).await;
        let outcome = JobOutcome {
            job,
            result,
            duration: started.elapsed(),
        };
        if results.send(outcome).is_err() {
            break;
        }
    }
    debug!(worker = worker_id, "worker exiting");
}

/// One job: chosen, then rejected, then (optionally) kick off the judge.
async fn process_job(ctx: &WorkerCtx, job: &GenerationJob) -> Result<CompletedPair> {
    if ctx.cancel.is_cancelled() {
        bail!("run cancelled");
    }
    let templates = &ctx.config.templates;
    let bindings = BTreeMap::from([
        ("topic", job.topic.clone()),
        ("subtopic", job.subtopic.clone()),
        ("prompt", job.prompt.clone()),
    ]);

    let chosen = generate_response(
        ctx,
        &ctx.config.models.main,
        &templates.chosen,
        templates.chosen_system.as_deref(),
        &bindings,
    )
    .await
    .context("chosen generation failed")?;
    let rejected = generate_response(
        ctx,
        &ctx.config.models.rejected,
        &templates.rejected,
        templates.rejected_system.as_deref(),
        &bindings,
    )
    .await
    .context("rejected generation failed")?;

    let index_tx = match (&ctx.judge, &ctx.updates_tx) {
        (Some(judge), Some(updates_tx)) => Some(spawn_judge_task(
            job,
            judge.clone(),
            updates_tx.clone(),
            ctx.cancel.clone(),
            chosen.clone(),
            rejected.clone(),
        )),
        _ => None,
    };

    Ok(CompletedPair {
        chosen,
        rejected,
        index_tx,
    })
}

async fn generate_response(
    ctx: &WorkerCtx,
    spec: &ModelConfig,
    template_text: &str,
    system: Option<&str>,
    bindings: &BTreeMap<&str, String>,
) -> Result<String> {
    let mut messages = Vec::with_capacity(2);
    if let Some(system) = system {
        messages.push(ChatMessage::system(template::render(system, bindings)));
    }
    messages.push(ChatMessage::user(template::render(template_text, bindings)));

    let reply = ctx
        .api
        .chat_completion(spec, &messages, &ctx.cancel)
        .await?;
    if reply.content.trim().is_empty() {
        bail!("model returned an empty response");
    }
    Ok(reply.content)
}

/// Launch the judge in its own task. The returned sender carries the
/// record index from the collector once the pair has been written; the
/// task forwards the finished evaluation onto the bounded update channel.
fn spawn_judge_task(
    job: &GenerationJob,
    judge: Arc<Judge>,
    updates_tx: mpsc::Sender<(usize, JudgeResult)>,
    cancel: CancellationToken,
    chosen: String,
    rejected: String,
) -> oneshot::Sender<usize> {
    let (index_tx, index_rx) = oneshot::channel();
    let job_id = job.id;
    let prompt = job.prompt.clone();
    tokio::spawn(async move {
        match judge.evaluate(&cancel, &prompt, &chosen, &rejected).await {
            Ok(result) => match index_rx.await {
                Ok(index) => {
                    if updates_tx.send((index, result)).await.is_err() {
                        warn!(job = job_id, "judge updater is gone; scores dropped");
                    }
                }
                Err(_) => {
                    debug!(job = job_id, "pair was never written; judge result dropped");
                }
            },
            Err(err) => {
                warn!(
                    job = job_id,
                    error = ?err,
                    "judge evaluation failed; record stays unjudged"
                );
            }
        }
    });
    index_tx
}

/// Apply judge results to their records, in arrival order, until every
/// sender is gone.
async fn updater_loop(
    mut updates: mpsc::Receiver<(usize, JudgeResult)>,
    writer: Arc<TokioMutex<dyn DatasetWriter>>,
) {
    while let Some((index, result)) = updates.recv().await {
        if let Err(err) = writer.lock().await.update_record(index, result).await {
            warn!(index, error = ?err, "failed to apply judge scores");
        }
    }
    debug!("judge updater drained");
}
