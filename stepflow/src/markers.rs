//! Step markers
//!
//! A marker is emitted on every step status transition. UIs render them; the
//! run directory keeps the latest marker of every step as one JSON file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::state::StepStatus;
use crate::workflow::StepType;

/// Directory inside a run directory holding marker files
pub const MARKERS_DIR: &str = "markers";

/// Observable record of one step transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepMarker {
    pub workflow_name: String,
    pub step_name: String,
    pub status: StepStatus,
    pub output: Option<Value>,
    pub step_index: usize,
    pub total_steps: usize,
    /// True for steps an embedded workflow runs before its fragment
    pub is_pre_prompt_step: bool,
    pub step_type: StepType,
    /// Where the step's workflow was loaded from
    pub step_source: String,
    pub error: Option<String>,
    pub hidden: bool,
    pub embedded_workflow_name: Option<String>,
}

/// Observer of step markers
pub trait MarkerSink: Send + Sync {
    fn emit(&self, marker: &StepMarker);
}

fn slug(name: &str) -> String {
    name.replace('/', "__")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '[' | ']' | '.') { c } else { '_' })
        .collect()
}

/// Writes `markers/NNN_<step>.json`, one file per step, overwritten on each
/// transition. `NNN` is the order in which steps were first seen.
///
/// Numbering continues from the marker files already in the directory, so a
/// resumed run keeps updating the same files.
pub struct FileMarkerSink {
    dir: PathBuf,
    seen: Mutex<HashMap<String, usize>>,
}

impl FileMarkerSink {
    pub fn new(run_dir: &Path) -> Self {
        let dir = run_dir.join(MARKERS_DIR);
        let seen = existing_sequence(&dir);
        Self {
            dir,
            seen: Mutex::new(seen),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write(&self, marker: &StepMarker) -> std::io::Result<()> {
        let seq = {
            let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
            let next = seen.values().max().map_or(0, |n| n + 1);
            *seen.entry(marker.step_name.clone()).or_insert(next)
        };
        std::fs::create_dir_all(&self.dir)?;
        let path = self
            .dir
            .join(format!("{:03}_{}.json", seq, slug(&marker.step_name)));
        let json = serde_json::to_vec_pretty(marker)?;
        std::fs::write(path, json)
    }
}

/// Step name to sequence number for the marker files in `dir`
fn existing_sequence(dir: &Path) -> HashMap<String, usize> {
    let mut seen = HashMap::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return seen;
    };
    for path in entries.flatten().map(|e| e.path()) {
        let Some(seq) = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| stem.split_once('_'))
            .and_then(|(prefix, _)| prefix.parse::<usize>().ok())
        else {
            continue;
        };
        let marker = std::fs::read_to_string(&path)
            .ok()
            .and_then(|content| serde_json::from_str::<StepMarker>(&content).ok());
        match marker {
            Some(marker) => {
                seen.insert(marker.step_name, seq);
            }
            None => tracing::warn!("Ignoring unreadable marker file {}", path.display()),
        }
    }
    seen
}

impl MarkerSink for FileMarkerSink {
    fn emit(&self, marker: &StepMarker) {
        if let Err(e) = self.write(marker) {
            tracing::warn!("Failed to write marker for {}: {}", marker.step_name, e);
        }
    }
}

/// Keeps every marker in memory (tests, embedding UIs)
#[derive(Default)]
pub struct CollectingMarkerSink {
    markers: Mutex<Vec<StepMarker>>,
}

impl CollectingMarkerSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every marker in emission order
    pub fn markers(&self) -> Vec<StepMarker> {
        self.markers.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Most recent marker of a step
    pub fn latest(&self, step_name: &str) -> Option<StepMarker> {
        self.markers()
            .into_iter()
            .rev()
            .find(|m| m.step_name == step_name)
    }
}

impl MarkerSink for CollectingMarkerSink {
    fn emit(&self, marker: &StepMarker) {
        self.markers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(marker.clone());
    }
}

/// Read back the marker files of a run directory, in first-seen order
pub fn read_markers(run_dir: &Path) -> std::io::Result<Vec<StepMarker>> {
    let dir = run_dir.join(MARKERS_DIR);
    let mut paths: Vec<PathBuf> = std::fs::read_dir(&dir)?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    let mut markers = Vec::new();
    for path in paths {
        let content = std::fs::read_to_string(&path)?;
        let marker = serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        markers.push(marker);
    }
    Ok(markers)
}
