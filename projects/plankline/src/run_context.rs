use crate::config::PipelineConfig;
use crate::run_artifacts::RunSummary;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const METADATA_FILE: &str = "metadata.json";

/// Contents of `<output_root>/<video_id>/metadata.json`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct VideoMetadata {
    pub original_name: String,
    pub source_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<RunSummary>,
    #[serde(skip)]
    pub output_dir: PathBuf,
}

impl VideoMetadata {
    /// The run finished over the whole source video.
    pub fn is_complete(&self) -> bool {
        self.summary.as_ref().map(|s| s.is_complete()).unwrap_or(false)
    }
}

/// Video files under `video_root` whose extension is in `extensions`
/// (case-insensitive), sorted by path.
pub fn list_videos(video_root: &Path, extensions: &[String]) -> Vec<PathBuf> {
    let mut videos: Vec<PathBuf> = WalkDir::new(video_root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .and_then(|s| s.to_str())
                .map(|ext| extensions.iter().any(|want| want.eq_ignore_ascii_case(ext)))
                .unwrap_or(false)
        })
        .map(|e| e.path().to_path_buf())
        .collect();
    videos.sort();
    videos
}

/// The video id is the file stem of the source video.
pub fn video_id_for(video_path: &Path) -> Option<String> {
    video_path
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

/// Video ids claimed by more than one input file, with the files claiming them.
pub fn duplicate_ids(videos: &[PathBuf]) -> BTreeMap<String, Vec<PathBuf>> {
    let mut by_id: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    for video in videos {
        if let Some(id) = video_id_for(video) {
            by_id.entry(id).or_default().push(video.clone());
        }
    }
    by_id.retain(|_, paths| paths.len() > 1);
    by_id
}

/// Creates a fresh run directory for a video, replacing any previous run and
/// any error marker left by an earlier failed attempt.
pub fn create_run(output_root: &Path, video_path: &Path, video_id: &str) -> Result<VideoMetadata> {
    let marker = error_marker_path(output_root, video_id);
    if marker.exists() {
        fs::remove_file(&marker).with_context(|| format!("Failed to remove {:?}", marker))?;
    }
    let output_dir = output_root.join(video_id);
    if output_dir.exists() {
        tracing::info!("Replacing previous output for {}", video_id);
        fs::remove_dir_all(&output_dir)
            .with_context(|| format!("Failed to clear {:?}", output_dir))?;
    }
    fs::create_dir_all(&output_dir)
        .with_context(|| format!("Failed to create {:?}", output_dir))?;

    let metadata = VideoMetadata {
        original_name: video_path
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| video_id.to_string()),
        source_path: video_path.to_path_buf(),
        created_at: Utc::now(),
        run_id: video_id.to_string(),
        summary: None,
        output_dir,
    };
    save_metadata(&metadata)?;

    Ok(metadata)
}

pub fn write_summary(metadata: &mut VideoMetadata, summary: RunSummary) -> Result<()> {
    metadata.summary = Some(summary);
    save_metadata(metadata)
}

fn save_metadata(metadata: &VideoMetadata) -> Result<()> {
    let metadata_path = metadata.output_dir.join(METADATA_FILE);
    let content = serde_json::to_string_pretty(metadata)?;
    fs::write(&metadata_path, content)
        .with_context(|| format!("Failed to write {:?}", metadata_path))?;
    Ok(())
}

/// Reads `<output_root>/<video_id>/metadata.json` if the run exists.
pub fn load_run(output_root: &Path, video_id: &str) -> Result<Option<VideoMetadata>> {
    let output_dir = output_root.join(video_id);
    let metadata_path = output_dir.join(METADATA_FILE);
    if !metadata_path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(&metadata_path)?;
    let mut metadata: VideoMetadata = serde_json::from_str(&content)
        .with_context(|| format!("Malformed {:?}", metadata_path))?;
    metadata.output_dir = output_dir;
    Ok(Some(metadata))
}

/// Every run directory under `output_root` holding a metadata.json, sorted by run id.
pub fn list_runs(output_root: &Path) -> Result<Vec<VideoMetadata>> {
    let mut runs = Vec::new();

    if !output_root.exists() {
        return Ok(runs);
    }

    for entry in fs::read_dir(output_root)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            let metadata_path = path.join(METADATA_FILE);
            if metadata_path.exists() {
                let content = fs::read_to_string(&metadata_path)?;
                let mut metadata: VideoMetadata = serde_json::from_str(&content)
                    .with_context(|| format!("Malformed {:?}", metadata_path))?;
                metadata.output_dir = path.clone();
                runs.push(metadata);
            }
        }
    }

    runs.sort_by(|a, b| a.run_id.cmp(&b.run_id));
    Ok(runs)
}

pub fn error_marker_path(output_root: &Path, video_id: &str) -> PathBuf {
    output_root.join(format!("{}_error.txt", video_id))
}

/// Writes `<output_root>/<video_id>_error.txt` holding the failure reason.
pub fn write_error_marker(output_root: &Path, video_id: &str, reason: &str) -> Result<PathBuf> {
    fs::create_dir_all(output_root)?;
    let path = error_marker_path(output_root, video_id);
    fs::write(&path, format!("{}\n", reason))
        .with_context(|| format!("Failed to write {:?}", path))?;
    Ok(path)
}

/// Moves a source video into `quarantine_dir`, keeping its file name.
pub fn quarantine(video_path: &Path, quarantine_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(quarantine_dir)?;
    let file_name = video_path
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("Invalid video path: {:?}", video_path))?;
    let dest = quarantine_dir.join(file_name);
    move_file(video_path, &dest).with_context(|| format!("Failed to move {:?}", video_path))?;
    Ok(dest)
}

/// Rename, falling back to copy and delete across filesystems.
pub fn move_file(src: &Path, dest: &Path) -> io::Result<()> {
    match fs::rename(src, dest) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(src, dest)?;
            fs::remove_file(src)
        }
    }
}

/// How the segmentation output root lines up with the input videos.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SegmentationAudit {
    pub expected: usize,
    /// Runs whose summary covers the whole video
    pub completed: Vec<String>,
    /// Videos with an error marker
    pub failed: Vec<String>,
    /// Run directories left by an interrupted, truncated or crashed run
    pub incomplete: Vec<String>,
    /// Videos with no output at all
    pub missing: Vec<String>,
}

impl SegmentationAudit {
    pub fn is_reconciled(&self) -> bool {
        self.incomplete.is_empty() && self.missing.is_empty()
    }
}

/// Classifies every input video by what the output root holds for it.
pub fn audit_segmentation(videos: &[PathBuf], output_root: &Path) -> SegmentationAudit {
    let mut audit = SegmentationAudit {
        expected: videos.len(),
        ..Default::default()
    };
    for video in videos {
        let Some(id) = video_id_for(video) else {
            audit.missing.push(video.display().to_string());
            continue;
        };
        match load_run(output_root, &id) {
            Ok(Some(run)) if run.is_complete() => audit.completed.push(id),
            _ if error_marker_path(output_root, &id).exists() => audit.failed.push(id),
            Ok(Some(_)) | Err(_) => audit.incomplete.push(id),
            Ok(None) => audit.missing.push(id),
        }
    }
    audit
}

/// Records the effective configuration for this session as
/// `<output_root>/config-<session>.json` and returns the session id.
pub fn write_config_snapshot(output_root: &Path, command: &str, config: &PipelineConfig) -> Result<String> {
    fs::create_dir_all(output_root)?;
    let session_id = Utc::now().format("%Y%m%dT%H%M%S%.3fZ").to_string();
    let snapshot = serde_json::json!({
        "session_id": session_id,
        "command": command,
        "config": config,
    });
    let path = output_root.join(format!("config-{}.json", session_id));
    fs::write(&path, serde_json::to_string_pretty(&snapshot)?)
        .with_context(|| format!("Failed to write {:?}", path))?;
    tracing::info!("Session {} config written to {:?}", session_id, path);
    Ok(session_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::crop::tests::scratch_dir;
    use crate::pipeline::types::{FrameCounts, VideoState};

    #[test]
    fn test_list_videos_filters_and_sorts() {
        let root = scratch_dir("ctx-list");
        fs::create_dir_all(root.join("nested")).unwrap();
        for name in ["b.avi", "a.AVI", "nested/c.avi", "notes.txt", "d.mp4"] {
            fs::write(root.join(name), b"x").unwrap();
        }

        let videos = list_videos(&root, &["avi".to_string()]);
        let names: Vec<String> = videos
            .iter()
            .map(|p| p.strip_prefix(&root).unwrap().display().to_string())
            .collect();
        assert_eq!(names, vec!["a.AVI", "b.avi", "nested/c.avi"]);

        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_create_run_replaces_previous_output() {
        let root = scratch_dir("ctx-replace");
        let video = Path::new("/data/cam1-0001.avi");

        let first = create_run(&root, video, "cam1-0001").unwrap();
        fs::write(first.output_dir.join("stale.png"), b"old").unwrap();

        let second = create_run(&root, video, "cam1-0001").unwrap();
        assert!(!second.output_dir.join("stale.png").exists());
        assert!(second.output_dir.join(METADATA_FILE).exists());
        assert_eq!(second.original_name, "cam1-0001.avi");

        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_list_runs_reads_summaries() {
        let root = scratch_dir("ctx-runs");
        let mut b = create_run(&root, Path::new("b.avi"), "b").unwrap();
        create_run(&root, Path::new("a.avi"), "a").unwrap();
        fs::create_dir_all(root.join("not-a-run")).unwrap();

        let counts = FrameCounts {
            frames_read: 3,
            frames_processed: 3,
            ..Default::default()
        };
        write_summary(
            &mut b,
            RunSummary {
                state: VideoState::Completed,
                counts: counts.clone(),
                elapsed_secs: 1.5,
                cancelled: false,
                decode_error: None,
            },
        )
        .unwrap();

        let runs = list_runs(&root).unwrap();
        let ids: Vec<&str> = runs.iter().map(|r| r.run_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(runs[0].summary.is_none());
        let summary = runs[1].summary.as_ref().unwrap();
        assert_eq!(summary.state, VideoState::Completed);
        assert_eq!(summary.counts, counts);
        assert_eq!(runs[1].output_dir, root.join("b"));

        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_config_snapshot_is_written() {
        let root = scratch_dir("ctx-snapshot");
        let session = write_config_snapshot(&root, "segment", &PipelineConfig::default()).unwrap();
        let content = fs::read_to_string(root.join(format!("config-{}.json", session))).unwrap();
        let value: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(value["command"], "segment");
        assert_eq!(value["config"]["concurrency"]["queue_capacity"], 64);
        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_video_id_is_file_stem() {
        assert_eq!(video_id_for(Path::new("/x/cam1-0042.avi")).as_deref(), Some("cam1-0042"));
        assert_eq!(video_id_for(Path::new("/")), None);
    }

    fn complete(run: &mut VideoMetadata) {
        write_summary(
            run,
            RunSummary {
                state: VideoState::Completed,
                counts: FrameCounts::default(),
                elapsed_secs: 0.1,
                cancelled: false,
                decode_error: None,
            },
        )
        .unwrap();
    }

    #[test]
    fn test_duplicate_stems_are_reported() {
        let videos = vec![
            PathBuf::from("/raw/transect1/cam0.avi"),
            PathBuf::from("/raw/transect1/cam1.avi"),
            PathBuf::from("/raw/transect2/cam0.avi"),
        ];
        let dups = duplicate_ids(&videos);
        assert_eq!(dups.len(), 1);
        assert_eq!(
            dups["cam0"],
            vec![
                PathBuf::from("/raw/transect1/cam0.avi"),
                PathBuf::from("/raw/transect2/cam0.avi")
            ]
        );
        assert!(duplicate_ids(&videos[..2]).is_empty());
    }

    #[test]
    fn test_create_run_clears_stale_error_marker() {
        let root = scratch_dir("ctx-marker");
        let marker = write_error_marker(&root, "cam1", "corrupt input").unwrap();
        create_run(&root, Path::new("/raw/cam1.avi"), "cam1").unwrap();
        assert!(!marker.exists());
        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_audit_segmentation_buckets() {
        let root = scratch_dir("ctx-audit");
        let videos: Vec<PathBuf> = ["done", "broken", "crashed", "untouched"]
            .iter()
            .map(|id| PathBuf::from(format!("/raw/{}.avi", id)))
            .collect();

        let mut done = create_run(&root, &videos[0], "done").unwrap();
        complete(&mut done);
        write_error_marker(&root, "broken", "corrupt input").unwrap();
        create_run(&root, &videos[2], "crashed").unwrap();

        let audit = audit_segmentation(&videos, &root);
        assert_eq!(audit.expected, 4);
        assert_eq!(audit.completed, vec!["done"]);
        assert_eq!(audit.failed, vec!["broken"]);
        assert_eq!(audit.incomplete, vec!["crashed"]);
        assert_eq!(audit.missing, vec!["untouched"]);
        assert!(!audit.is_reconciled());

        assert!(load_run(&root, "done").unwrap().unwrap().is_complete());
        assert!(!load_run(&root, "crashed").unwrap().unwrap().is_complete());
        assert!(load_run(&root, "untouched").unwrap().is_none());

        fs::remove_dir_all(&root).ok();
    }
}
