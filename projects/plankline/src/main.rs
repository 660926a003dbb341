mod cancel;
mod classify;
mod cli;
mod config;
mod error;
mod pipeline;
mod run_artifacts;
mod run_context;
mod video;

use anyhow::{bail, Context, Result};
use cancel::CancelToken;
use classify::dispatcher::{
    audit_classification, discover_work_items, ClassificationDispatcher, ResultLocator, WorkItem,
};
use classify::invoke::{detect_gpu_count, ExternalClassifier};
use classify::slots::ResourceSlotPool;
use cli::{Args, ClassifyArgs, Command, SegmentArgs};
use config::PipelineConfig;
use std::sync::Arc;

fn main() -> Result<()> {
    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt::init();

    let args = Args::parse_args();

    let mut config = match &args.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        tracing::warn!("Interrupt received, draining in-flight work");
        handler_token.cancel();
    })
    .context("Failed to install Ctrl-C handler")?;

    match &args.command {
        Command::Segment(seg) => {
            seg.apply(&mut config);
            config.validate()?;
            run_segment(seg, Arc::new(config), &cancel)
        }
        Command::Classify(cls) => {
            cls.apply(&mut config);
            config.validate()?;
            run_classify(cls, &config, &cancel)
        }
    }
}

fn run_segment(args: &SegmentArgs, config: Arc<PipelineConfig>, cancel: &CancelToken) -> Result<()> {
    let videos = run_context::list_videos(&args.video_root, &config.segmentation.video_extensions);
    if videos.is_empty() {
        tracing::warn!(
            "No videos with extensions {:?} under {:?}",
            config.segmentation.video_extensions,
            args.video_root
        );
        return Ok(());
    }
    run_context::write_config_snapshot(&args.output_root, "segment", &config)?;
    tracing::info!("Segmenting {} video(s) into {:?}", videos.len(), args.output_root);

    let reports = pipeline::orchestrator::segment_videos(
        &videos,
        config,
        &args.output_root,
        cancel,
        args.force,
    );

    let failed: Vec<_> = reports.iter().filter(|r| r.is_failed()).collect();
    let skipped = reports.iter().filter(|r| r.skipped).count();
    let crops: usize = reports
        .iter()
        .filter(|r| !r.skipped)
        .map(|r| r.counts.crops_written)
        .sum();
    tracing::info!(
        "Segmentation finished: {} video(s), {} skipped, {} failed, {} new crops",
        reports.len(),
        skipped,
        failed.len(),
        crops
    );

    let audit = run_context::audit_segmentation(&videos, &args.output_root);
    tracing::info!(
        "Output reconciliation: {}/{} complete, {} failed, {} incomplete, {} missing",
        audit.completed.len(),
        audit.expected,
        audit.failed.len(),
        audit.incomplete.len(),
        audit.missing.len()
    );
    if !audit.is_reconciled() {
        tracing::warn!(
            "Videos without a complete run: {:?}",
            audit.incomplete.iter().chain(&audit.missing).collect::<Vec<_>>()
        );
    }
    if !failed.is_empty() {
        for report in &failed {
            tracing::error!("{} ({:?}): {:?}", report.video_id, report.video_path, report.state);
        }
        bail!(
            "{} video(s) could not be segmented: {}",
            failed.len(),
            failed
                .iter()
                .map(|r| r.video_id.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
    Ok(())
}

fn run_classify(args: &ClassifyArgs, config: &PipelineConfig, cancel: &CancelToken) -> Result<()> {
    let cls = &config.classification;
    let num_gpus = match cls.num_gpus {
        Some(n) => n,
        None => detect_gpu_count().unwrap_or_else(|| {
            tracing::warn!("Could not detect GPUs with nvidia-smi, assuming 1");
            1
        }),
    };

    let all_items = discover_work_items(&args.segment_root, &args.output_root, &cls.result_extension)
        .with_context(|| format!("Failed to list runs under {:?}", args.segment_root))?;
    if all_items.is_empty() {
        tracing::warn!("No completed segmentation runs found under {:?}", args.segment_root);
        return Ok(());
    }
    let (done, items): (Vec<WorkItem>, Vec<WorkItem>) = all_items
        .iter()
        .cloned()
        .partition(|item| !args.force && item.is_classified());
    if !done.is_empty() {
        tracing::info!("{} run(s) already classified, skipping", done.len());
    }
    if items.is_empty() {
        return Ok(());
    }
    run_context::write_config_snapshot(&args.output_root, "classify", config)?;
    tracing::info!("Classifying {} run(s) on {} GPU(s)", items.len(), num_gpus);

    let dispatcher = ClassificationDispatcher::new(
        ExternalClassifier::new(cls, &args.output_root),
        ResourceSlotPool::new(num_gpus, cls.instances_per_gpu),
        ResultLocator::from_config(cls),
        cls.max_retries,
    );
    let reports = dispatcher.dispatch(items, cancel);
    tracing::debug!("Slot pool after dispatch: {:?}", dispatcher.pool().snapshot());

    let failed: Vec<_> = reports.iter().filter(|r| r.result.is_err()).collect();
    tracing::info!(
        "Classification finished: {} item(s), {} failed",
        reports.len(),
        failed.len()
    );

    let audit = audit_classification(&all_items);
    tracing::info!(
        "Output reconciliation: {}/{} runs classified",
        audit.classified.len(),
        audit.expected
    );
    if !audit.missing.is_empty() {
        tracing::warn!("Runs without a classification result: {:?}", audit.missing);
    }
    if !failed.is_empty() {
        bail!(
            "{} item(s) failed classification: {}",
            failed.len(),
            failed
                .iter()
                .map(|r| r.id.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
    Ok(())
}
