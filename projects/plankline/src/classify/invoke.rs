// External classifier process invocation

use crate::cancel::CancelToken;
use crate::classify::dispatcher::{Classifier, WorkItem};
use crate::config::ClassificationConfig;
use crate::error::ClassifyError;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

const CHILD_POLL: Duration = Duration::from_millis(50);

/// Runs the configured classifier executable once per work item.
///
/// The command line is built from an explicit argument list, never through a
/// shell. stdout and stderr are appended to `<log_dir>/<id>.log`.
#[derive(Debug, Clone)]
pub struct ExternalClassifier {
    program: PathBuf,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    result_dir: PathBuf,
    log_dir: PathBuf,
    timeout: Option<Duration>,
}

impl ExternalClassifier {
    pub fn new(config: &ClassificationConfig, log_dir: &Path) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            working_dir: config.working_dir.clone(),
            result_dir: config.result_dir.clone(),
            log_dir: log_dir.to_path_buf(),
            timeout: config.invocation_timeout(),
        }
    }

    /// Substitutes `{images}`, `{gpu}`, `{id}` and `{result_dir}` in every argument.
    pub fn render_args(&self, item: &WorkItem, gpu_id: usize) -> Vec<String> {
        let images = item.images.display().to_string();
        let result_dir = self.result_dir.display().to_string();
        let gpu = gpu_id.to_string();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{images}", &images)
                    .replace("{gpu}", &gpu)
                    .replace("{id}", &item.id)
                    .replace("{result_dir}", &result_dir)
            })
            .collect()
    }

    pub fn log_path(&self, item: &WorkItem) -> PathBuf {
        self.log_dir.join(format!("{}.log", item.id))
    }

    fn spawn(&self, item: &WorkItem, gpu_id: usize) -> Result<Child, ClassifyError> {
        let spawn_err = |source| ClassifyError::Spawn {
            item: item.id.clone(),
            source,
        };

        fs::create_dir_all(&self.log_dir).map_err(spawn_err)?;
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(item))
            .map_err(spawn_err)?;
        let log_err = log.try_clone().map_err(spawn_err)?;

        let args = self.render_args(item, gpu_id);
        tracing::debug!("{}: {:?} {:?} (gpu {})", item.id, self.program, args, gpu_id);

        let mut command = Command::new(&self.program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        command.spawn().map_err(spawn_err)
    }
}

impl Classifier for ExternalClassifier {
    fn invoke(
        &self,
        item: &WorkItem,
        gpu_id: usize,
        cancel: &CancelToken,
    ) -> Result<(), ClassifyError> {
        let mut child = self.spawn(item, gpu_id)?;
        let started = Instant::now();

        loop {
            match child.try_wait() {
                Ok(Some(status)) if status.success() => return Ok(()),
                Ok(Some(status)) => {
                    return Err(ClassifyError::ExitStatus {
                        item: item.id.clone(),
                        status: status.to_string(),
                    })
                }
                Ok(None) => {}
                Err(e) => {
                    kill(&mut child, &item.id);
                    return Err(ClassifyError::ExitStatus {
                        item: item.id.clone(),
                        status: format!("unknown ({})", e),
                    });
                }
            }

            if cancel.is_cancelled() {
                kill(&mut child, &item.id);
                return Err(ClassifyError::Cancelled {
                    item: item.id.clone(),
                });
            }
            if let Some(limit) = self.timeout {
                if started.elapsed() >= limit {
                    kill(&mut child, &item.id);
                    return Err(ClassifyError::Timeout {
                        item: item.id.clone(),
                        secs: limit.as_secs(),
                    });
                }
            }

            std::thread::sleep(CHILD_POLL);
        }
    }
}

fn kill(child: &mut Child, item: &str) {
    if let Err(e) = child.kill() {
        tracing::warn!("{}: failed to kill classifier process: {}", item, e);
    }
    // Reap so the child does not linger as a zombie
    let _ = child.wait();
}

/// Counts NVIDIA devices via `nvidia-smi -L`; `None` when the tool is
/// missing, fails, or lists no devices.
pub fn detect_gpu_count() -> Option<usize> {
    let output = Command::new("nvidia-smi").arg("-L").output().ok()?;
    if !output.status.success() {
        return None;
    }
    let count = count_gpus(&String::from_utf8_lossy(&output.stdout));
    (count > 0).then_some(count)
}

fn count_gpus(listing: &str) -> usize {
    listing.lines().filter(|line| line.contains("UUID")).count()
}
