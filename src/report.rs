use crate::buckets::BucketRow;
use crate::estimator::TrackFold;
use crate::record::Record;
use crate::shard;
use crate::MergeError;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufRead, BufWriter, Write};
use std::path::Path;
use tracing::warn;

/// Completeness tuple for a single capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureReport {
    pub name: String,
    pub captured_count: u64,
    pub drop_event_count: u64,
    pub estimated_missing: u64,
    pub estimated_total: u64,
    pub sampling_rate: Option<f64>,
}

impl CaptureReport {
    pub fn from_counts(name: &str, captured_count: u64, drop_event_count: u64, estimated_missing: u64) -> Self {
        let estimated_total = captured_count.saturating_add(estimated_missing);
        Self {
            name: name.to_string(),
            captured_count,
            drop_event_count,
            estimated_missing,
            estimated_total,
            sampling_rate: ratio(captured_count, estimated_total),
        }
    }
}

/// Cross-capture bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalReport {
    pub unique_count: u64,
    pub estimated_upper_bound_total: u64,
    pub sampling_rate_lower_bound: Option<f64>,
    pub broad_capture: Option<String>,
    pub broad_estimated_total: Option<u64>,
    pub broad_sampling_rate: Option<f64>,
}

impl GlobalReport {
    /// Upper bound assumes every capture's missing posts are disjoint from
    /// everything else observed or missed.
    pub fn new(unique_count: u64, captures: &[CaptureReport], broad: Option<&CaptureReport>) -> Self {
        let missing = captures
            .iter()
            .fold(0u64, |acc, c| acc.saturating_add(c.estimated_missing));
        let upper = unique_count.saturating_add(missing);
        Self {
            unique_count,
            estimated_upper_bound_total: upper,
            sampling_rate_lower_bound: ratio(unique_count, upper),
            broad_capture: broad.map(|b| b.name.clone()),
            broad_estimated_total: broad.map(|b| b.estimated_total),
            broad_sampling_rate: broad.and_then(|b| ratio(unique_count, b.estimated_total)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub app_name: String,
    pub captures: Vec<CaptureReport>,
    pub global: GlobalReport,
    #[serde(default)]
    pub buckets: Vec<BucketRow>,
}

impl RunReport {
    pub fn write_json(&self, path: &Path) -> Result<(), MergeError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    pub fn print(&self) {
        for c in &self.captures {
            println!(
                "[confluence] capture {}_{: <4} {: >10} retrieved, {: >7} drop events, {: >10} missing, {: >10} estimated, {} sampling rate",
                self.app_name,
                c.name,
                c.captured_count,
                c.drop_event_count,
                c.estimated_missing,
                c.estimated_total,
                percent(c.sampling_rate)
            );
        }
        let g = &self.global;
        println!(
            "[confluence] union   {: <9} {: >10} unique, {: >10} upper bound, {} sampling rate lower bound",
            self.app_name,
            g.unique_count,
            g.estimated_upper_bound_total,
            percent(g.sampling_rate_lower_bound)
        );
        if let (Some(name), Some(total)) = (&g.broad_capture, g.broad_estimated_total) {
            println!(
                "[confluence] union vs broad capture {}: {} estimated total, {} sampling rate",
                name,
                total,
                percent(g.broad_sampling_rate)
            );
        }
    }
}

pub fn ratio(numerator: u64, denominator: u64) -> Option<f64> {
    if denominator == 0 {
        None
    } else {
        Some(numerator as f64 / denominator as f64)
    }
}

fn percent(rate: Option<f64>) -> String {
    match rate {
        Some(r) => format!("{:>6.2}%", 100.0 * r),
        None => "   n/a".to_string(),
    }
}

/// Recompute a capture's tuple from its artifact alone.
///
/// A missing artifact counts as an empty capture.
pub fn scan_capture_artifact(name: &str, path: &Path) -> Result<CaptureReport, MergeError> {
    if !path.exists() {
        warn!(capture = %name, error = %MergeError::MissingArtifact(path.to_path_buf()), "treating capture as empty");
        return Ok(CaptureReport::from_counts(name, 0, 0, 0));
    }
    let mut posts = 0u64;
    let mut fold = TrackFold::default();
    for_each_record(path, |record| match record {
        Record::Post { .. } => posts += 1,
        Record::Drop { track, .. } => fold.push(track),
    })?;
    Ok(CaptureReport::from_counts(name, posts, fold.observed(), fold.total()))
}

/// Count the posts of a global timeline artifact.
pub fn count_unique_posts(path: &Path) -> Result<u64, MergeError> {
    if !path.exists() {
        return Err(MergeError::MissingArtifact(path.to_path_buf()));
    }
    let mut count = 0u64;
    for_each_record(path, |record| {
        if !record.is_drop() {
            count += 1;
        }
    })?;
    Ok(count)
}

/// Stream every well-formed record of an artifact, skipping malformed lines.
pub fn for_each_record<F>(path: &Path, mut f: F) -> Result<(), MergeError>
where
    F: FnMut(Record),
{
    let reader = shard::open_lines(path)?;
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match Record::parse(&line) {
            Ok(record) => f(record),
            Err(e) => warn!(artifact = %path.display(), line = idx + 1, error = %e, "skipping line"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_tuple_arithmetic() {
        let c = CaptureReport::from_counts("1", 80, 3, 20);
        assert_eq!(c.estimated_total, 100);
        assert_eq!(c.sampling_rate, Some(0.8));

        let empty = CaptureReport::from_counts("2", 0, 0, 0);
        assert_eq!(empty.sampling_rate, None);
    }

    #[test]
    fn global_bounds_are_ordered() {
        let captures = vec![
            CaptureReport::from_counts("1", 80, 3, 20),
            CaptureReport::from_counts("all", 90, 5, 30),
        ];
        let g = GlobalReport::new(120, &captures, captures.last());
        assert_eq!(g.estimated_upper_bound_total, 170);
        assert!(g.unique_count <= g.estimated_upper_bound_total);
        assert_eq!(g.broad_estimated_total, Some(120));
        assert_eq!(g.broad_sampling_rate, Some(1.0));
        assert_eq!(g.sampling_rate_lower_bound, Some(120.0 / 170.0));
    }
}
