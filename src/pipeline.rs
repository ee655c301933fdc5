use crate::buckets::{self, BucketRow};
use crate::capture_merger::{CaptureMerger, MergeOutcome};
use crate::config::{CaptureSpec, RunPlan};
use crate::report::{self, CaptureReport, GlobalReport, RunReport};
use crate::unioner::{StreamUnioner, UnionInput, UnionOutcome};
use crate::MergeError;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::thread;
use std::time::Instant;
use tracing::{debug, error, info, warn};

enum WorkerMessage {
    Done(usize, MergeOutcome),
    Failed(usize, MergeError),
}

/// Merge every configured capture on a pool of `plan.workers` threads.
///
/// All captures run to completion even if one fails; the first failure (by
/// capture order) is returned afterwards.
pub fn merge_all(plan: &RunPlan) -> Result<Vec<MergeOutcome>, MergeError> {
    let started = Instant::now();
    let (job_tx, job_rx) = unbounded::<&CaptureSpec>();
    let (result_tx, result_rx) = unbounded::<WorkerMessage>();

    for spec in &plan.captures {
        // receiver is alive in this scope
        let _ = job_tx.send(spec);
    }
    drop(job_tx);

    thread::scope(|scope| {
        for worker_id in 0..plan.workers {
            let rx = job_rx.clone();
            let tx = result_tx.clone();
            scope.spawn(move || worker_loop(worker_id, rx, tx, plan));
        }
    });
    drop(result_tx);

    let mut outcomes: Vec<Option<MergeOutcome>> = plan.captures.iter().map(|_| None).collect();
    let mut failures: Vec<(usize, MergeError)> = Vec::new();
    for message in result_rx.iter() {
        match message {
            WorkerMessage::Done(index, outcome) => outcomes[index] = Some(outcome),
            WorkerMessage::Failed(index, e) => failures.push((index, e)),
        }
    }

    if !failures.is_empty() {
        failures.sort_by_key(|(index, _)| *index);
        for (index, e) in &failures {
            error!(capture = %plan.captures[*index].name, error = %e, "capture merge failed");
        }
        let (_, first) = failures.swap_remove(0);
        return Err(first);
    }

    let outcomes: Vec<MergeOutcome> = outcomes.into_iter().flatten().collect();
    if outcomes.len() != plan.captures.len() {
        return Err(MergeError::Other(format!(
            "{} of {} capture merges reported back",
            outcomes.len(),
            plan.captures.len()
        )));
    }
    info!(
        captures = outcomes.len(),
        workers = plan.workers,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "all captures merged"
    );
    Ok(outcomes)
}

fn worker_loop(worker_id: usize, jobs: Receiver<&CaptureSpec>, results: Sender<WorkerMessage>, plan: &RunPlan) {
    for spec in jobs.iter() {
        debug!(worker = worker_id, capture = %spec.name, "worker picked up capture");
        let message = match CaptureMerger::new(spec, &plan.merge).run() {
            Ok(outcome) => WorkerMessage::Done(spec.index, outcome),
            Err(e) => WorkerMessage::Failed(spec.index, e),
        };
        if results.send(message).is_err() {
            break;
        }
    }
}

/// Merge a single capture by name.
pub fn merge_one(plan: &RunPlan, name: &str) -> Result<MergeOutcome, MergeError> {
    let spec = plan
        .capture(name)
        .ok_or_else(|| MergeError::Config(format!("capture {:?} is not configured", name)))?;
    CaptureMerger::new(spec, &plan.merge).run()
}

/// Build the global timeline from every capture artifact.
pub fn union(plan: &RunPlan) -> Result<UnionOutcome, MergeError> {
    let inputs = plan
        .captures
        .iter()
        .map(|c| UnionInput {
            index: c.index,
            name: c.name.clone(),
            artifact: c.artifact.clone(),
        })
        .collect();
    StreamUnioner::new(inputs, &plan.global_artifact, plan.merge.zstd_level).run()
}

/// Derive the full report by scanning existing artifacts only.
pub fn build_report(plan: &RunPlan) -> Result<RunReport, MergeError> {
    let captures = plan
        .captures
        .iter()
        .map(|c| report::scan_capture_artifact(&c.name, &c.artifact))
        .collect::<Result<Vec<_>, _>>()?;
    let unique_count = report::count_unique_posts(&plan.global_artifact)?;
    assemble(plan, captures, unique_count)
}

/// Merge, union and report in one pass; the report is written to
/// `plan.report_path`.
pub fn run_all(plan: &RunPlan) -> Result<RunReport, MergeError> {
    let merged = merge_all(plan)?;
    for outcome in &merged {
        debug!(capture = %outcome.capture, stats = ?outcome.stats, "merge stats");
    }
    let unioned = union(plan)?;
    let report = assemble(plan, unioned.captures, unioned.unique_count)?;
    report.write_json(&plan.report_path)?;
    info!(path = %plan.report_path.display(), "report written");
    Ok(report)
}

fn assemble(plan: &RunPlan, captures: Vec<CaptureReport>, unique_count: u64) -> Result<RunReport, MergeError> {
    let broad = plan.broad_capture.map(|index| &captures[index]);
    let global = GlobalReport::new(unique_count, &captures, broad);
    let buckets = bucket_rows(plan)?;
    Ok(RunReport {
        app_name: plan.app_name.clone(),
        captures,
        global,
        buckets,
    })
}

fn bucket_rows(plan: &RunPlan) -> Result<Vec<BucketRow>, MergeError> {
    let Some(index) = plan.broad_capture else {
        return Ok(Vec::new());
    };
    let broad = &plan.captures[index];
    if !broad.artifact.exists() {
        warn!(capture = %broad.name, error = %MergeError::MissingArtifact(broad.artifact.clone()), "no bucketed completeness");
        return Ok(Vec::new());
    }
    buckets::bucketize(&broad.artifact, &plan.global_artifact, plan.bucket_ms, plan.bucket_origin_ms)
}
