use crate::estimator::{Continuity, TrackFold};
use crate::record::Record;
use crate::report::{for_each_record, ratio};
use crate::snowflake;
use crate::MergeError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};

/// Upper bound on the number of rows a bucket table may hold.
pub const MAX_BUCKETS: usize = 1_000_000;

/// A fixed number of half-open buckets `[origin + k*width, origin + (k+1)*width)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketGrid {
    pub origin_ms: i64,
    pub width_ms: i64,
    pub buckets: usize,
}

impl BucketGrid {
    pub fn new(origin_ms: i64, width_ms: i64, buckets: usize) -> Self {
        Self {
            origin_ms,
            width_ms: width_ms.max(1),
            buckets: buckets.min(MAX_BUCKETS),
        }
    }

    /// Grid from `origin_ms` through the bucket holding `last_ms`, capped at
    /// [`MAX_BUCKETS`].
    pub fn spanning(origin_ms: i64, last_ms: i64, width_ms: i64) -> Self {
        let width_ms = width_ms.max(1);
        let offset = i128::from(last_ms) - i128::from(origin_ms);
        let buckets = if offset < 0 {
            0
        } else {
            usize::try_from(offset / i128::from(width_ms) + 1).unwrap_or(usize::MAX)
        };
        Self::new(origin_ms, width_ms, buckets)
    }

    /// `first_ms` rounded down to a multiple of `width_ms`.
    pub fn align(first_ms: i64, width_ms: i64) -> i64 {
        let width_ms = width_ms.max(1);
        first_ms.div_euclid(width_ms) * width_ms
    }

    pub fn index_of(&self, timestamp_ms: i64) -> Option<usize> {
        let offset = timestamp_ms.checked_sub(self.origin_ms)?;
        if offset < 0 {
            return None;
        }
        let idx = usize::try_from(offset / self.width_ms).ok()?;
        (idx < self.buckets).then_some(idx)
    }

    pub fn start_of(&self, index: usize) -> i64 {
        let step = i64::try_from(index).unwrap_or(i64::MAX).saturating_mul(self.width_ms);
        self.origin_ms.saturating_add(step)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketRow {
    pub start_ms: i64,
    pub captured: u64,
    pub missing: u64,
    pub estimated_total: u64,
    pub union_captured: u64,
    pub sampling_rate: Option<f64>,
    pub union_sampling_rate: Option<f64>,
}

/// Per-bucket post counts and drop folds for one capture timeline.
///
/// Records must arrive in timeline order. Each bucket's fold is seeded with
/// the last track value seen before it, since a connection's counter does not
/// reset at a reporting boundary.
#[derive(Debug, Clone)]
pub struct CaptureBuckets {
    grid: BucketGrid,
    captured: Vec<u64>,
    missing: Vec<u64>,
    current: Option<(usize, TrackFold)>,
    last_track: Option<u64>,
}

impl CaptureBuckets {
    pub fn new(grid: BucketGrid) -> Self {
        Self {
            grid,
            captured: Vec::new(),
            missing: Vec::new(),
            current: None,
            last_track: None,
        }
    }

    pub fn observe(&mut self, record: &Record) {
        match record {
            Record::Post { timestamp_ms, .. } => {
                if let Some(idx) = self.grid.index_of(*timestamp_ms) {
                    grow(&mut self.captured, idx);
                    self.captured[idx] += 1;
                }
            }
            Record::Drop { timestamp_ms, track, .. } => {
                if let Some(idx) = self.grid.index_of(*timestamp_ms) {
                    self.push_track(idx, *track);
                }
                self.last_track = Some(*track);
            }
        }
    }

    fn push_track(&mut self, idx: usize, track: u64) {
        if let Some((current, fold)) = &mut self.current {
            if idx <= *current {
                fold.push(track);
                return;
            }
        }
        self.close_current();
        let mut fold = TrackFold::new(Continuity::carried(self.last_track));
        fold.push(track);
        self.current = Some((idx, fold));
    }

    fn close_current(&mut self) {
        if let Some((idx, fold)) = self.current.take() {
            grow(&mut self.missing, idx);
            self.missing[idx] = self.missing[idx].saturating_add(fold.total());
        }
    }

    /// Per-bucket (captured, missing) counts.
    pub fn finish(mut self) -> (Vec<u64>, Vec<u64>) {
        self.close_current();
        (self.captured, self.missing)
    }
}

fn grow(counts: &mut Vec<u64>, idx: usize) {
    if counts.len() <= idx {
        counts.resize(idx + 1, 0);
    }
}

/// Assemble one row per grid bucket from a capture's counts and the union's.
pub fn rows(grid: BucketGrid, captured: &[u64], missing: &[u64], union_captured: &[u64]) -> Vec<BucketRow> {
    (0..grid.buckets)
        .map(|idx| {
            let c = captured.get(idx).copied().unwrap_or(0);
            let m = missing.get(idx).copied().unwrap_or(0);
            let u = union_captured.get(idx).copied().unwrap_or(0);
            let total = c.saturating_add(m);
            BucketRow {
                start_ms: grid.start_of(idx),
                captured: c,
                missing: m,
                estimated_total: total,
                union_captured: u,
                sampling_rate: ratio(c, total),
                union_sampling_rate: ratio(u, total),
            }
        })
        .collect()
}

/// Bucketed completeness of the broad capture against the global timeline.
///
/// Without an explicit origin the grid starts at the earliest timestamp,
/// rounded down to the bucket width. Records whose timestamp the id clock
/// cannot represent are left out.
pub fn bucketize(
    broad_artifact: &Path,
    global_artifact: &Path,
    width_ms: i64,
    origin_ms: Option<i64>,
) -> Result<Vec<BucketRow>, MergeError> {
    let mut span: Option<(i64, i64)> = None;
    let mut out_of_range = 0u64;
    let mut widen = |ts: i64| {
        if snowflake::timestamp_in_range(ts) {
            span = Some(span.map_or((ts, ts), |(lo, hi)| (lo.min(ts), hi.max(ts))));
        } else {
            out_of_range += 1;
        }
    };
    for_each_record(broad_artifact, |record| widen(record.timestamp_ms()))?;
    for_each_record(global_artifact, |record| {
        if let Record::Post { timestamp_ms, .. } = record {
            widen(timestamp_ms);
        }
    })?;
    if out_of_range > 0 {
        warn!(records = out_of_range, "ignoring records outside the id clock");
    }
    let Some((first, last)) = span else {
        info!(artifact = %broad_artifact.display(), "broad capture is empty, no buckets");
        return Ok(Vec::new());
    };

    let origin = origin_ms.unwrap_or_else(|| BucketGrid::align(first, width_ms));
    let grid = BucketGrid::spanning(origin, last, width_ms);
    if grid.buckets == MAX_BUCKETS {
        warn!(origin = grid.origin_ms, width = grid.width_ms, max = MAX_BUCKETS, "bucket table truncated");
    }

    let mut broad = CaptureBuckets::new(grid);
    for_each_record(broad_artifact, |record| {
        if snowflake::timestamp_in_range(record.timestamp_ms()) {
            broad.observe(&record);
        }
    })?;
    let (captured, missing) = broad.finish();

    let mut union_captured = Vec::new();
    for_each_record(global_artifact, |record| {
        if let Record::Post { timestamp_ms, .. } = record {
            if let Some(idx) = grid.index_of(timestamp_ms) {
                grow(&mut union_captured, idx);
                union_captured[idx] += 1;
            }
        }
    })?;

    let rows = rows(grid, &captured, &missing, &union_captured);
    debug!(buckets = rows.len(), origin = grid.origin_ms, width = grid.width_ms, "bucketed completeness");
    Ok(rows)
}
