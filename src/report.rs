//! `build-report.json`: per-stage outcome of a pipeline run.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::fs;
use std::path::Path;
use time::OffsetDateTime;

use crate::error::Phase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageStatus {
    /// Never reached.
    Pending,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    /// 1-based manifest position.
    pub index: usize,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub status: StageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_phase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at_utc: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at_utc: Option<String>,
}

impl StageRecord {
    pub fn pending(index: usize, kind: &str, name: Option<&str>) -> Self {
        Self {
            index,
            kind: kind.to_string(),
            name: name.map(str::to_string),
            status: StageStatus::Pending,
            failed_phase: None,
            started_at_utc: None,
            finished_at_utc: None,
        }
    }

    pub fn start(&mut self) {
        self.status = StageStatus::Running;
        self.started_at_utc = Some(now_utc_compact());
    }

    pub fn finish(&mut self) {
        self.status = StageStatus::Succeeded;
        self.finished_at_utc = Some(now_utc_compact());
    }

    pub fn fail(&mut self, phase: Phase) {
        self.status = StageStatus::Failed;
        self.failed_phase = Some(phase.to_string());
        if self.started_at_utc.is_none() {
            self.started_at_utc = Some(now_utc_compact());
        }
        self.finished_at_utc = Some(now_utc_compact());
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub name: String,
    pub version: String,
    pub architecture: String,
    pub status: String,
    pub started_at_utc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at_utc: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub stages: Vec<StageRecord>,
}

impl BuildReport {
    pub fn succeeded(&self) -> bool {
        self.status == "success"
    }

    pub fn stage(&self, index: usize) -> Option<&StageRecord> {
        self.stages.iter().find(|s| s.index == index)
    }
}

pub fn now_utc_compact() -> String {
    let now = OffsetDateTime::now_utc();
    format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}Z",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

pub fn write_report(path: &Path, report: &BuildReport) -> Result<()> {
    write_json_atomic(path, report)
        .with_context(|| format!("writing build report '{}'", path.display()))
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("path without parent '{}'", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("creating parent directory '{}'", parent.display()))?;
    let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
    let payload = serde_json::to_vec_pretty(value).context("serializing build report")?;
    fs::write(&tmp, payload).with_context(|| format!("writing temp file '{}'", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| {
        format!(
            "renaming temp file '{}' to '{}'",
            tmp.display(),
            path.display()
        )
    })?;
    Ok(())
}
