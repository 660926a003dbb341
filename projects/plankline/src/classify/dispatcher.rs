use crate::cancel::CancelToken;
use crate::classify::slots::ResourceSlotPool;
use crate::config::ClassificationConfig;
use crate::error::ClassifyError;
use crate::run_context;
use anyhow::Result;
use crossbeam::channel;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

/// One directory of crops to classify and where its result must end up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub id: String,
    pub images: PathBuf,
    pub result_path: PathBuf,
}

impl WorkItem {
    /// The relocated result from an earlier session is already in place.
    pub fn is_classified(&self) -> bool {
        self.result_path.is_file()
    }
}

/// Runs a classifier over one work item on one GPU.
pub trait Classifier: Sync {
    fn invoke(&self, item: &WorkItem, gpu_id: usize, cancel: &CancelToken)
        -> Result<(), ClassifyError>;
}

/// Where the classifier leaves its artifact, and how long to wait for it.
#[derive(Debug, Clone)]
pub struct ResultLocator {
    pub dir: PathBuf,
    pub extension: String,
    pub wait: Duration,
    pub poll_interval: Duration,
}

impl ResultLocator {
    pub fn from_config(config: &ClassificationConfig) -> Self {
        let dir = match &config.working_dir {
            Some(base) if config.result_dir.is_relative() => base.join(&config.result_dir),
            _ => config.result_dir.clone(),
        };
        Self {
            dir,
            extension: config.result_extension.clone(),
            wait: config.result_wait(),
            poll_interval: config.poll_interval(),
        }
    }

    /// Result files for `id` already present, with their modification times.
    /// Taken before the classifier runs so leftovers are never mistaken for
    /// its output.
    pub fn baseline(&self, id: &str) -> HashMap<PathBuf, Option<SystemTime>> {
        self.candidates(id)
            .into_iter()
            .map(|path| {
                let modified = fs::metadata(&path).and_then(|m| m.modified()).ok();
                (path, modified)
            })
            .collect()
    }

    /// First file (by path) in the result tree that names `id` as a whole
    /// token, carries the configured extension, and is new or rewritten
    /// since `baseline`.
    pub fn find(&self, id: &str, baseline: &HashMap<PathBuf, Option<SystemTime>>) -> Option<PathBuf> {
        self.candidates(id).into_iter().find(|path| match baseline.get(path) {
            None => true,
            Some(before) => {
                let now = fs::metadata(path).and_then(|m| m.modified()).ok();
                now != *before
            }
        })
    }

    fn candidates(&self, id: &str) -> Vec<PathBuf> {
        let mut matches: Vec<PathBuf> = walkdir::WalkDir::new(&self.dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| {
                let path = e.path();
                let ext_ok = path
                    .extension()
                    .and_then(|s| s.to_str())
                    .map(|ext| ext.eq_ignore_ascii_case(&self.extension))
                    .unwrap_or(false);
                let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
                ext_ok && names_item(stem, id)
            })
            .map(|e| e.path().to_path_buf())
            .collect();
        matches.sort();
        matches
    }

    /// Polls until a fresh artifact shows up, the wait runs out, or `cancel` fires.
    pub fn wait_for(
        &self,
        id: &str,
        baseline: &HashMap<PathBuf, Option<SystemTime>>,
        cancel: &CancelToken,
    ) -> Result<PathBuf, ClassifyError> {
        let deadline = Instant::now() + self.wait;
        loop {
            if let Some(path) = self.find(id, baseline) {
                return Ok(path);
            }
            if cancel.is_cancelled() {
                return Err(ClassifyError::Cancelled { item: id.to_string() });
            }
            if Instant::now() >= deadline {
                return Err(ClassifyError::MissingResult {
                    item: id.to_string(),
                    dir: self.dir.clone(),
                });
            }
            thread::sleep(self.poll_interval);
        }
    }
}

/// Characters that can continue an id, so `v1` never matches inside `v10`
/// and `cam1` never matches inside `cam1-0001`.
fn is_id_char(c: char) -> bool {
    c.is_alphanumeric() || c == '-' || c == '.'
}

/// Whether `stem` contains `id` delimited on both sides.
fn names_item(stem: &str, id: &str) -> bool {
    if id.is_empty() {
        return false;
    }
    stem.match_indices(id).any(|(start, _)| {
        let before = stem[..start].chars().next_back();
        let after = stem[start + id.len()..].chars().next();
        !before.map(is_id_char).unwrap_or(false) && !after.map(is_id_char).unwrap_or(false)
    })
}

/// Outcome of one work item.
#[derive(Debug)]
pub struct ItemReport {
    pub id: String,
    pub gpu_id: Option<usize>,
    pub attempts: usize,
    pub result: Result<PathBuf, ClassifyError>,
}

/// Fans work items out over the GPU slots of a pool.
///
/// Items complete in any order; a failing item is reported and never blocks
/// its siblings. Each item holds its slot from the first attempt until its
/// result is relocated.
pub struct ClassificationDispatcher<C> {
    classifier: C,
    pool: ResourceSlotPool,
    locator: ResultLocator,
    max_retries: usize,
}

impl<C: Classifier> ClassificationDispatcher<C> {
    pub fn new(
        classifier: C,
        pool: ResourceSlotPool,
        locator: ResultLocator,
        max_retries: usize,
    ) -> Self {
        Self {
            classifier,
            pool,
            locator,
            max_retries,
        }
    }

    pub fn pool(&self) -> &ResourceSlotPool {
        &self.pool
    }

    /// Processes every item and returns one report per item, sorted by id.
    pub fn dispatch(&self, items: Vec<WorkItem>, cancel: &CancelToken) -> Vec<ItemReport> {
        if items.is_empty() {
            return Vec::new();
        }

        let pb = ProgressBar::new(items.len() as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} items ({eta}) {msg}")
        {
            pb.set_style(style.progress_chars("#>-"));
        }

        let dispatch_workers = self.pool.capacity().min(items.len());
        let (job_tx, job_rx) = channel::unbounded::<WorkItem>();
        for item in items {
            let _ = job_tx.send(item);
        }
        drop(job_tx);
        let (report_tx, report_rx) = channel::unbounded::<ItemReport>();

        thread::scope(|scope| {
            for worker_id in 0..dispatch_workers {
                let job_rx = job_rx.clone();
                let report_tx = report_tx.clone();
                let pb = pb.clone();
                scope.spawn(move || {
                    tracing::debug!("Spawning new dispatch worker {}", worker_id);
                    for item in job_rx.iter() {
                        let report = self.run_item(&item, cancel);
                        match &report.result {
                            Ok(path) => tracing::info!("{}: result stored at {:?}", report.id, path),
                            Err(e) => tracing::warn!("{}: classification failed: {}", report.id, e),
                        }
                        pb.inc(1);
                        let _ = report_tx.send(report);
                    }
                    tracing::debug!("Dispatch worker {} finished gracefully", worker_id);
                });
            }
        });
        drop(report_tx);
        pb.finish_with_message("Done");

        let mut reports: Vec<ItemReport> = report_rx.iter().collect();
        reports.sort_by(|a, b| a.id.cmp(&b.id));
        reports
    }

    fn run_item(&self, item: &WorkItem, cancel: &CancelToken) -> ItemReport {
        let slot = match self.pool.acquire_cancellable(cancel) {
            Some(slot) => slot,
            None => {
                return ItemReport {
                    id: item.id.clone(),
                    gpu_id: None,
                    attempts: 0,
                    result: Err(ClassifyError::Cancelled {
                        item: item.id.clone(),
                    }),
                }
            }
        };
        let gpu_id = slot.gpu_id();

        let mut attempts = 0;
        let result = loop {
            attempts += 1;
            tracing::info!("{}: classifying on gpu {} (attempt {})", item.id, gpu_id, attempts);
            let baseline = self.locator.baseline(&item.id);
            let outcome = self
                .classifier
                .invoke(item, gpu_id, cancel)
                .and_then(|()| self.locator.wait_for(&item.id, &baseline, cancel))
                .and_then(|found| relocate(&item.id, &found, &item.result_path));

            match outcome {
                Err(e) if e.is_retryable() && attempts <= self.max_retries => {
                    tracing::warn!("{}: attempt {} failed, retrying: {}", item.id, attempts, e);
                }
                other => break other,
            }
        };
        slot.release();

        ItemReport {
            id: item.id.clone(),
            gpu_id: Some(gpu_id),
            attempts,
            result,
        }
    }
}

fn relocate(id: &str, found: &Path, dest: &Path) -> Result<PathBuf, ClassifyError> {
    let relocate_err = |source| ClassifyError::Relocate {
        item: id.to_string(),
        dest: dest.to_path_buf(),
        source,
    };
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(relocate_err)?;
    }
    run_context::move_file(found, dest).map_err(relocate_err)?;
    Ok(dest.to_path_buf())
}

/// One work item per completed segmentation run under `segment_root`.
///
/// Runs that crashed, were cancelled, failed, or stopped on a decode error
/// hold a partial crop set and are left out.
pub fn discover_work_items(
    segment_root: &Path,
    classification_root: &Path,
    result_extension: &str,
) -> Result<Vec<WorkItem>> {
    let mut items = Vec::new();
    for run in run_context::list_runs(segment_root)? {
        if !run.is_complete() {
            match &run.summary {
                None => tracing::warn!("{}: run never finished, not classifying", run.run_id),
                Some(summary) => tracing::warn!(
                    "{}: run is {:?} (cancelled: {}, decode error: {:?}), not classifying",
                    run.run_id,
                    summary.state,
                    summary.cancelled,
                    summary.decode_error
                ),
            }
            continue;
        }
        items.push(WorkItem {
            result_path: classification_root.join(format!("{}.{}", run.run_id, result_extension)),
            id: run.run_id,
            images: run.output_dir,
        });
    }
    Ok(items)
}

/// How the classification output lines up with the work items.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ClassificationAudit {
    pub expected: usize,
    pub classified: Vec<String>,
    pub missing: Vec<String>,
}

pub fn audit_classification(items: &[WorkItem]) -> ClassificationAudit {
    let mut audit = ClassificationAudit {
        expected: items.len(),
        ..Default::default()
    };
    for item in items {
        if item.is_classified() {
            audit.classified.push(item.id.clone());
        } else {
            audit.missing.push(item.id.clone());
        }
    }
    audit
}
