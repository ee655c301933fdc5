use crate::config::{CaptureSpec, MergeConfig};
use crate::estimator::TrackFold;
use crate::record::Record;
use crate::report::CaptureReport;
use crate::run_store::{KeyKind, RunStore, StagedEntry, TimelineKey};
use crate::shard::{self, ArtifactWriter};
use crate::snowflake;
use crate::MergeError;
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::collections::hash_map::Entry;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    pub shards_read: u64,
    pub shards_skipped: u64,
    pub lines_read: u64,
    pub malformed_lines: u64,
    pub codec_errors: u64,
    pub duplicate_posts: u64,
    pub timestamp_mismatches: u64,
    pub duplicate_drop_keys: u64,
    pub foreign_drop_tags: u64,
    pub spilled_runs: u64,
    pub posts_written: u64,
    pub drops_written: u64,
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub capture: String,
    pub artifact: PathBuf,
    pub stats: MergeStats,
    pub report: CaptureReport,
}

/// Merges every timestamp shard of one capture into its sorted, deduplicated
/// timeline artifact.
pub struct CaptureMerger<'a> {
    spec: &'a CaptureSpec,
    config: &'a MergeConfig,
}

impl<'a> CaptureMerger<'a> {
    pub fn new(spec: &'a CaptureSpec, config: &'a MergeConfig) -> Self {
        Self { spec, config }
    }

    pub fn run(&self) -> Result<MergeOutcome, MergeError> {
        let shards = shard::discover_shards(&self.spec.shard_dir);
        self.merge_shards(&shards)
    }

    /// Merge an explicit list of shards, processed in the order given.
    pub fn merge_shards(&self, shards: &[PathBuf]) -> Result<MergeOutcome, MergeError> {
        let spec = self.spec;
        info!(capture = %spec.name, shards = shards.len(), "merging capture");

        let mut staging = Staging::new(spec, self.config)?;
        for path in shards {
            match shard::read_shard_lines(path) {
                Ok(lines) => {
                    staging.stats.shards_read += 1;
                    for (line_no, line) in lines {
                        staging.ingest_line(path, line_no, &line)?;
                    }
                }
                Err(e) if e.is_recoverable() => {
                    staging.stats.shards_skipped += 1;
                    warn!(capture = %spec.name, error = %e, "skipping unreadable shard");
                }
                Err(e) => return Err(e),
            }
        }

        let (store, remainder, mut stats) = staging.into_parts();

        let mut writer = ArtifactWriter::create(&spec.artifact, self.config.zstd_level)?;
        let mut fold = TrackFold::default();
        let mut duplicates = DuplicateTally::default();

        store.merge_first_seen(
            remainder,
            self.config.fan_in,
            |entry| {
                let record = match entry.key.kind {
                    KeyKind::Post => {
                        stats.posts_written += 1;
                        Record::Post { timestamp_ms: entry.timestamp_ms, id: entry.key.id }
                    }
                    KeyKind::Drop => {
                        stats.drops_written += 1;
                        fold.push(entry.track);
                        Record::Drop {
                            timestamp_ms: snowflake::timestamp_of(entry.key.id),
                            tag: spec.drop_tag.clone(),
                            track: entry.track,
                        }
                    }
                };
                writer.write_record(&record)
            },
            |kept, dropped| duplicates.record(&spec.name, kept, dropped),
        )?;
        writer.finish()?;

        stats.duplicate_posts += duplicates.posts;
        stats.timestamp_mismatches += duplicates.mismatches;
        stats.duplicate_drop_keys += duplicates.drops;

        let report = CaptureReport::from_counts(&spec.name, stats.posts_written, stats.drops_written, fold.total());
        info!(
            capture = %spec.name,
            posts = stats.posts_written,
            drops = stats.drops_written,
            duplicates = stats.duplicate_posts,
            skipped_shards = stats.shards_skipped,
            malformed = stats.malformed_lines,
            "capture merged"
        );

        Ok(MergeOutcome {
            capture: spec.name.clone(),
            artifact: spec.artifact.clone(),
            stats,
            report,
        })
    }
}

/// In-memory key map that spills sorted runs once it grows past the budget.
struct Staging<'a> {
    spec: &'a CaptureSpec,
    config: &'a MergeConfig,
    buffer: FxHashMap<TimelineKey, StagedEntry>,
    store: RunStore,
    next_seq: u64,
    stats: MergeStats,
    duplicates: DuplicateTally,
}

impl<'a> Staging<'a> {
    fn new(spec: &'a CaptureSpec, config: &'a MergeConfig) -> Result<Self, MergeError> {
        Ok(Self {
            spec,
            config,
            buffer: FxHashMap::default(),
            store: RunStore::new(scratch_dir_for(&spec.artifact), config.read_buf_bytes)?,
            next_seq: 0,
            stats: MergeStats::default(),
            duplicates: DuplicateTally::default(),
        })
    }

    fn ingest_line(&mut self, path: &Path, line_no: usize, line: &str) -> Result<(), MergeError> {
        self.stats.lines_read += 1;
        let record = match Record::parse(line) {
            Ok(record) => record,
            Err(e) => {
                self.stats.malformed_lines += 1;
                warn!(capture = %self.spec.name, shard = %path.display(), line = line_no, error = %e, "skipping line");
                return Ok(());
            }
        };

        let entry = match record {
            Record::Post { timestamp_ms, id } => {
                if !snowflake::timestamp_in_range(timestamp_ms) {
                    self.stats.codec_errors += 1;
                    let e = MergeError::CodecRange(format!("post timestamp {} outside the id clock", timestamp_ms));
                    warn!(capture = %self.spec.name, shard = %path.display(), line = line_no, error = %e, "skipping post");
                    return Ok(());
                }
                StagedEntry {
                    key: TimelineKey::post(id),
                    seq: self.next_seq,
                    timestamp_ms,
                    track: 0,
                }
            }
            Record::Drop { timestamp_ms, tag, track } => {
                if tag != self.spec.drop_tag {
                    self.stats.foreign_drop_tags += 1;
                    debug!(capture = %self.spec.name, tag = %tag, expected = %self.spec.drop_tag, "drop tag differs");
                }
                let key = match snowflake::synthetic_key(timestamp_ms, self.spec.index, self.config.drop_offset_ms) {
                    Ok(key) => key,
                    Err(e) => {
                        self.stats.codec_errors += 1;
                        warn!(capture = %self.spec.name, shard = %path.display(), line = line_no, error = %e, "cannot place drop event");
                        return Ok(());
                    }
                };
                StagedEntry {
                    key: TimelineKey::drop_event(key),
                    seq: self.next_seq,
                    timestamp_ms,
                    track,
                }
            }
        };
        self.next_seq += 1;

        match self.buffer.entry(entry.key) {
            Entry::Occupied(kept) => self.duplicates.record(&self.spec.name, kept.get(), &entry),
            Entry::Vacant(slot) => {
                slot.insert(entry);
            }
        }

        if self.buffer.len() >= self.config.spill_threshold {
            let batch: Vec<StagedEntry> = self.buffer.drain().map(|(_, e)| e).collect();
            debug!(capture = %self.spec.name, entries = batch.len(), "spilling sorted run");
            self.store.spill(batch)?;
        }
        Ok(())
    }

    fn into_parts(self) -> (RunStore, Vec<StagedEntry>, MergeStats) {
        let mut stats = self.stats;
        stats.duplicate_posts += self.duplicates.posts;
        stats.timestamp_mismatches += self.duplicates.mismatches;
        stats.duplicate_drop_keys += self.duplicates.drops;
        stats.spilled_runs = self.store.runs().len() as u64;
        (self.store, self.buffer.into_values().collect(), stats)
    }
}

#[derive(Debug, Default)]
struct DuplicateTally {
    posts: u64,
    mismatches: u64,
    drops: u64,
}

impl DuplicateTally {
    fn record(&mut self, capture: &str, kept: &StagedEntry, dropped: &StagedEntry) {
        match kept.key.kind {
            KeyKind::Post => {
                self.posts += 1;
                if kept.timestamp_ms != dropped.timestamp_ms {
                    self.mismatches += 1;
                    warn!(
                        capture = %capture,
                        id = kept.key.id,
                        kept = kept.timestamp_ms,
                        discarded = dropped.timestamp_ms,
                        "duplicate post with differing timestamps"
                    );
                }
            }
            KeyKind::Drop => {
                self.drops += 1;
                debug!(capture = %capture, arrival = dropped.timestamp_ms, "drop event collides with an earlier one");
            }
        }
    }
}

fn scratch_dir_for(artifact: &Path) -> PathBuf {
    let mut name = artifact.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".runs");
    artifact.with_file_name(name)
}
