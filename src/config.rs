use crate::run_store::compute_fan_in;
use crate::snowflake::MAX_SEQUENCE;
use crate::MergeError;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const ARCHIVE_DIR_ENV: &str = "CONFLUENCE_ARCHIVE_DIR";
pub const DEFAULT_DROP_OFFSET_MS: i64 = 5_000;
pub const DEFAULT_BUCKET_MS: i64 = 3_600_000;
const READ_BUF_BYTES: usize = 64 * 1024;

fn default_drop_offset_ms() -> i64 {
    DEFAULT_DROP_OFFSET_MS
}

fn default_bucket_ms() -> i64 {
    DEFAULT_BUCKET_MS
}

/// Run manifest, loaded from JSON.
///
/// ```json
/// {
///   "app_name": "covid",
///   "archive_dir": "../data/covid_out",
///   "captures": [{ "name": "1" }, { "name": "2" }, { "name": "all" }],
///   "broad_capture": "all"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub app_name: String,
    #[serde(default)]
    pub archive_dir: Option<PathBuf>,
    pub captures: Vec<CaptureEntry>,
    #[serde(default)]
    pub broad_capture: Option<String>,
    #[serde(default = "default_drop_offset_ms")]
    pub drop_offset_ms: i64,
    #[serde(default = "default_bucket_ms")]
    pub bucket_ms: i64,
    #[serde(default)]
    pub bucket_origin_ms: Option<i64>,
    #[serde(default)]
    pub merge: MergeSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureEntry {
    pub name: String,
    #[serde(default)]
    pub drop_tag: Option<String>,
    #[serde(default)]
    pub shard_dir: Option<PathBuf>,
    #[serde(default)]
    pub artifact: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeSettings {
    pub spill_threshold: usize,
    pub fan_in: usize,
    pub zstd_level: i32,
    pub workers: Option<usize>,
}

impl Default for MergeSettings {
    fn default() -> Self {
        Self {
            spill_threshold: 4_000_000,
            fan_in: 64,
            zstd_level: 3,
            workers: None,
        }
    }
}

impl RunManifest {
    pub fn load(path: &Path) -> Result<Self, MergeError> {
        let text = fs::read_to_string(path)
            .map_err(|e| MergeError::Config(format!("cannot read manifest {}: {}", path.display(), e)))?;
        let manifest: RunManifest = serde_json::from_str(&text)?;
        Ok(manifest)
    }
}

/// Tuning shared by every capture merge in a run.
#[derive(Debug, Clone)]
pub struct MergeConfig {
    pub drop_offset_ms: i64,
    pub spill_threshold: usize,
    pub fan_in: usize,
    pub read_buf_bytes: usize,
    pub zstd_level: i32,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self::from_settings(DEFAULT_DROP_OFFSET_MS, &MergeSettings::default())
    }
}

impl MergeConfig {
    pub fn from_settings(drop_offset_ms: i64, settings: &MergeSettings) -> Self {
        let fan_in = compute_fan_in(settings.fan_in.saturating_mul(READ_BUF_BYTES), READ_BUF_BYTES);
        Self {
            drop_offset_ms,
            spill_threshold: settings.spill_threshold.max(1),
            fan_in,
            read_buf_bytes: READ_BUF_BYTES,
            zstd_level: settings.zstd_level,
        }
    }
}

/// Everything one capture merge needs to know about its capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSpec {
    pub index: usize,
    pub name: String,
    pub drop_tag: String,
    pub shard_dir: PathBuf,
    pub artifact: PathBuf,
}

/// A validated manifest with every path resolved.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub app_name: String,
    pub archive_dir: PathBuf,
    pub captures: Vec<CaptureSpec>,
    pub broad_capture: Option<usize>,
    pub global_artifact: PathBuf,
    pub report_path: PathBuf,
    pub bucket_ms: i64,
    pub bucket_origin_ms: Option<i64>,
    pub merge: MergeConfig,
    pub workers: usize,
}

impl RunPlan {
    /// Resolve a manifest. `archive_override` beats the environment, which
    /// beats the manifest's own `archive_dir`.
    pub fn resolve(manifest: &RunManifest, archive_override: Option<&Path>) -> Result<Self, MergeError> {
        let archive_dir = archive_override
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(ARCHIVE_DIR_ENV).map(PathBuf::from))
            .or_else(|| manifest.archive_dir.clone())
            .unwrap_or_else(|| PathBuf::from(format!("./{}_out", manifest.app_name)));

        if manifest.app_name.trim().is_empty() {
            return Err(MergeError::Config("app_name is empty".to_string()));
        }
        if manifest.captures.is_empty() {
            return Err(MergeError::Config("no captures configured".to_string()));
        }
        if manifest.captures.len() > MAX_SEQUENCE as usize + 1 {
            return Err(MergeError::Config(format!(
                "{} captures configured, at most {} fit a synthetic key",
                manifest.captures.len(),
                MAX_SEQUENCE as usize + 1
            )));
        }
        if manifest.drop_offset_ms <= 0 {
            return Err(MergeError::Config(format!(
                "drop_offset_ms must be positive, got {}",
                manifest.drop_offset_ms
            )));
        }
        if manifest.bucket_ms <= 0 {
            return Err(MergeError::Config(format!("bucket_ms must be positive, got {}", manifest.bucket_ms)));
        }

        let mut names = FxHashSet::default();
        let app = &manifest.app_name;
        let global_artifact = archive_dir.join(format!("complete_ts_{}.zst", app));
        let mut artifacts = FxHashSet::default();
        artifacts.insert(global_artifact.clone());
        let mut captures = Vec::with_capacity(manifest.captures.len());
        for (index, entry) in manifest.captures.iter().enumerate() {
            if entry.name.is_empty() || entry.name.contains(',') {
                return Err(MergeError::Config(format!("invalid capture name {:?}", entry.name)));
            }
            if !names.insert(entry.name.as_str()) {
                return Err(MergeError::Config(format!("duplicate capture name {:?}", entry.name)));
            }
            let capture_dir = archive_dir.join(format!("{}_{}", app, entry.name));
            let drop_tag = entry
                .drop_tag
                .clone()
                .unwrap_or_else(|| format!("ratemsg_{}", entry.name));
            if drop_tag.is_empty() || drop_tag.contains(',') {
                return Err(MergeError::Config(format!("invalid drop tag {:?}", drop_tag)));
            }
            let artifact = entry
                .artifact
                .clone()
                .unwrap_or_else(|| capture_dir.join(format!("ts_{}_{}.zst", app, entry.name)));
            if !artifacts.insert(artifact.clone()) {
                return Err(MergeError::Config(format!(
                    "capture {:?} writes to {}, which another artifact already uses",
                    entry.name,
                    artifact.display()
                )));
            }
            captures.push(CaptureSpec {
                index,
                name: entry.name.clone(),
                drop_tag,
                shard_dir: entry
                    .shard_dir
                    .clone()
                    .unwrap_or_else(|| capture_dir.join("timestamp")),
                artifact,
            });
        }

        let broad_capture = match &manifest.broad_capture {
            Some(name) => Some(
                captures
                    .iter()
                    .position(|c| &c.name == name)
                    .ok_or_else(|| MergeError::Config(format!("broad capture {:?} is not configured", name)))?,
            ),
            None => None,
        };

        let parallelism = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        let workers = manifest
            .merge
            .workers
            .unwrap_or(parallelism)
            .clamp(1, captures.len());

        Ok(Self {
            app_name: app.clone(),
            global_artifact,
            report_path: archive_dir.join(format!("report_{}.json", app)),
            archive_dir,
            captures,
            broad_capture,
            bucket_ms: manifest.bucket_ms,
            bucket_origin_ms: manifest.bucket_origin_ms,
            merge: MergeConfig::from_settings(manifest.drop_offset_ms, &manifest.merge),
            workers,
        })
    }

    pub fn capture(&self, name: &str) -> Option<&CaptureSpec> {
        self.captures.iter().find(|c| c.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(json: &str) -> RunManifest {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn resolves_default_layout() {
        let m = manifest(r#"{"app_name":"covid","captures":[{"name":"1"},{"name":"all"}],"broad_capture":"all"}"#);
        let plan = RunPlan::resolve(&m, Some(Path::new("/data/covid_out"))).unwrap();

        assert_eq!(plan.captures.len(), 2);
        let all = plan.capture("all").unwrap();
        assert_eq!(all.index, 1);
        assert_eq!(all.drop_tag, "ratemsg_all");
        assert_eq!(all.shard_dir, PathBuf::from("/data/covid_out/covid_all/timestamp"));
        assert_eq!(all.artifact, PathBuf::from("/data/covid_out/covid_all/ts_covid_all.zst"));
        assert_eq!(plan.global_artifact, PathBuf::from("/data/covid_out/complete_ts_covid.zst"));
        assert_eq!(plan.broad_capture, Some(1));
        assert_eq!(plan.merge.drop_offset_ms, DEFAULT_DROP_OFFSET_MS);
        assert_eq!(plan.bucket_ms, DEFAULT_BUCKET_MS);
        assert!(plan.workers >= 1 && plan.workers <= 2);
    }

    #[test]
    fn explicit_overrides_win() {
        let m = manifest(
            r#"{"app_name":"yt","captures":[{"name":"a","drop_tag":"limit_a","shard_dir":"/s/a","artifact":"/o/a.zst"}],
                "drop_offset_ms":250,"merge":{"fan_in":1000,"workers":8}}"#,
        );
        let plan = RunPlan::resolve(&m, Some(Path::new("/x"))).unwrap();
        let a = &plan.captures[0];
        assert_eq!(a.drop_tag, "limit_a");
        assert_eq!(a.shard_dir, PathBuf::from("/s/a"));
        assert_eq!(a.artifact, PathBuf::from("/o/a.zst"));
        assert_eq!(plan.merge.drop_offset_ms, 250);
        assert_eq!(plan.merge.fan_in, 128);
        assert_eq!(plan.workers, 1);
    }

    #[test]
    fn rejects_invalid_manifests() {
        let bad = [
            r#"{"app_name":"x","captures":[]}"#,
            r#"{"app_name":"x","captures":[{"name":"1"},{"name":"1"}]}"#,
            r#"{"app_name":"x","captures":[{"name":"1"}],"broad_capture":"all"}"#,
            r#"{"app_name":"x","captures":[{"name":"1"}],"drop_offset_ms":0}"#,
            r#"{"app_name":"x","captures":[{"name":"1"}],"bucket_ms":-5}"#,
            r#"{"app_name":"","captures":[{"name":"1"}]}"#,
            r#"{"app_name":"x","captures":[{"name":"a,b"}]}"#,
            r#"{"app_name":"x","captures":[{"name":"1","artifact":"/o/a.zst"},{"name":"2","artifact":"/o/a.zst"}]}"#,
            r#"{"app_name":"x","captures":[{"name":"1","artifact":"/x/complete_ts_x.zst"}]}"#,
        ];
        for json in bad {
            assert!(
                matches!(RunPlan::resolve(&manifest(json), Some(Path::new("/x"))), Err(MergeError::Config(_))),
                "{} should be rejected",
                json
            );
        }
    }
}
