use crate::estimator::TrackFold;
use crate::record::Record;
use crate::report::CaptureReport;
use crate::shard::{self, ArtifactWriter};
use crate::snowflake::PostId;
use crate::MergeError;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io::{BufRead, Lines};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// One capture timeline fed into the union.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnionInput {
    pub index: usize,
    pub name: String,
    pub artifact: PathBuf,
}

#[derive(Debug, Clone)]
pub struct UnionOutcome {
    pub artifact: PathBuf,
    pub unique_count: u64,
    pub duplicate_posts: u64,
    pub timestamp_mismatches: u64,
    /// Per-capture tuples recomputed while reading, in input order.
    pub captures: Vec<CaptureReport>,
}

/// Sequential reader over one capture artifact that yields posts only.
///
/// Drop lines are folded into the capture's estimate as they stream past.
struct TimelineCursor {
    name: String,
    path: PathBuf,
    lines: Option<Lines<Box<dyn BufRead + Send>>>,
    line_no: usize,
    last_id: Option<PostId>,
    posts: u64,
    fold: TrackFold,
}

impl TimelineCursor {
    fn open(input: &UnionInput) -> Result<Self, MergeError> {
        let lines = if input.artifact.exists() {
            Some(shard::open_lines(&input.artifact)?.lines())
        } else {
            warn!(
                capture = %input.name,
                error = %MergeError::MissingArtifact(input.artifact.clone()),
                "capture contributes no posts"
            );
            None
        };
        Ok(Self {
            name: input.name.clone(),
            path: input.artifact.clone(),
            lines,
            line_no: 0,
            last_id: None,
            posts: 0,
            fold: TrackFold::default(),
        })
    }

    fn next_post(&mut self) -> Result<Option<(PostId, i64)>, MergeError> {
        let Some(lines) = self.lines.as_mut() else {
            return Ok(None);
        };
        for line in lines {
            let line = line?;
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            match Record::parse(&line) {
                Ok(Record::Post { timestamp_ms, id }) => {
                    if let Some(previous) = self.last_id {
                        if id <= previous {
                            return Err(MergeError::OutOfOrder {
                                path: self.path.clone(),
                                previous,
                                current: id,
                            });
                        }
                    }
                    self.last_id = Some(id);
                    self.posts += 1;
                    return Ok(Some((id, timestamp_ms)));
                }
                Ok(Record::Drop { track, .. }) => self.fold.push(track),
                Err(e) => {
                    warn!(capture = %self.name, artifact = %self.path.display(), line = self.line_no, error = %e, "skipping line");
                }
            }
        }
        if self.posts == 0 {
            warn!(capture = %self.name, artifact = %self.path.display(), "capture artifact holds no posts");
        }
        self.lines = None;
        Ok(None)
    }

    fn report(&self) -> CaptureReport {
        CaptureReport::from_counts(&self.name, self.posts, self.fold.observed(), self.fold.total())
    }
}

/// K-way merge of sorted capture timelines into the global timeline.
pub struct StreamUnioner {
    inputs: Vec<UnionInput>,
    output: PathBuf,
    zstd_level: i32,
}

impl StreamUnioner {
    pub fn new(inputs: Vec<UnionInput>, output: &Path, zstd_level: i32) -> Self {
        Self {
            inputs,
            output: output.to_path_buf(),
            zstd_level,
        }
    }

    pub fn run(&self) -> Result<UnionOutcome, MergeError> {
        info!(captures = self.inputs.len(), output = %self.output.display(), "building global timeline");

        let mut cursors = self
            .inputs
            .iter()
            .map(TimelineCursor::open)
            .collect::<Result<Vec<_>, _>>()?;

        // min-heap over (id, capture index); the slot locates the cursor
        let mut heap: BinaryHeap<Reverse<(PostId, usize, usize, i64)>> = BinaryHeap::with_capacity(cursors.len());
        for (slot, cursor) in cursors.iter_mut().enumerate() {
            if let Some((id, ts)) = cursor.next_post()? {
                heap.push(Reverse((id, self.inputs[slot].index, slot, ts)));
            }
        }

        let mut writer = ArtifactWriter::create(&self.output, self.zstd_level)?;
        let mut last: Option<(PostId, i64)> = None;
        let mut unique_count = 0u64;
        let mut duplicate_posts = 0u64;
        let mut timestamp_mismatches = 0u64;

        while let Some(Reverse((id, capture_index, slot, ts))) = heap.pop() {
            match last {
                Some((last_id, last_ts)) if last_id == id => {
                    duplicate_posts += 1;
                    if last_ts != ts {
                        timestamp_mismatches += 1;
                        warn!(id, kept = last_ts, discarded = ts, capture = capture_index, "captures disagree on post timestamp");
                    }
                }
                _ => {
                    writer.write_record(&Record::Post { timestamp_ms: ts, id })?;
                    unique_count += 1;
                    last = Some((id, ts));
                }
            }
            if let Some((next_id, next_ts)) = cursors[slot].next_post()? {
                heap.push(Reverse((next_id, capture_index, slot, next_ts)));
            }
        }
        writer.finish()?;

        let captures: Vec<CaptureReport> = cursors.iter().map(TimelineCursor::report).collect();
        for c in &captures {
            debug!(capture = %c.name, posts = c.captured_count, drops = c.drop_event_count, "cursor exhausted");
        }
        info!(unique = unique_count, duplicates = duplicate_posts, "global timeline written");

        Ok(UnionOutcome {
            artifact: self.output.clone(),
            unique_count,
            duplicate_posts,
            timestamp_mismatches,
            captures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_plain(dir: &Path, name: &str, lines: &[&str]) -> PathBuf {
        let path = dir.join(name);
        let mut body = lines.join("\n");
        body.push('\n');
        fs::write(&path, body).unwrap();
        path
    }

    fn input(index: usize, name: &str, artifact: PathBuf) -> UnionInput {
        UnionInput { index, name: name.to_string(), artifact }
    }

    #[test]
    fn cursor_skips_drops_and_folds_them() {
        let tmp = TempDir::new().unwrap();
        let path = write_plain(tmp.path(), "a.txt", &["1,100", "2,ratemsg_a,5", "3,300", "4,ratemsg_a,9"]);
        let mut cursor = TimelineCursor::open(&input(0, "a", path)).unwrap();
        assert_eq!(cursor.next_post().unwrap(), Some((100, 1)));
        assert_eq!(cursor.next_post().unwrap(), Some((300, 3)));
        assert_eq!(cursor.next_post().unwrap(), None);
        assert_eq!(cursor.next_post().unwrap(), None);
        let report = cursor.report();
        assert_eq!(report.captured_count, 2);
        assert_eq!(report.drop_event_count, 2);
        assert_eq!(report.estimated_missing, 9);
    }

    #[test]
    fn cursor_rejects_descending_ids() {
        let tmp = TempDir::new().unwrap();
        let path = write_plain(tmp.path(), "bad.txt", &["1,300", "2,100"]);
        let mut cursor = TimelineCursor::open(&input(0, "bad", path)).unwrap();
        assert!(cursor.next_post().unwrap().is_some());
        assert!(matches!(
            cursor.next_post(),
            Err(MergeError::OutOfOrder { previous: 300, current: 100, .. })
        ));
    }

    #[test]
    fn ids_of_different_width_compare_numerically() {
        let tmp = TempDir::new().unwrap();
        let a = write_plain(tmp.path(), "a.txt", &["1,99", "5,1000"]);
        let b = write_plain(tmp.path(), "b.txt", &["2,100"]);
        let out = tmp.path().join("out.zst");
        let outcome = StreamUnioner::new(vec![input(0, "a", a), input(1, "b", b)], &out, 0)
            .run()
            .unwrap();
        assert_eq!(outcome.unique_count, 3);
        let text = String::from_utf8(zstd::decode_all(fs::File::open(&out).unwrap()).unwrap()).unwrap();
        assert_eq!(text, "1,99\n2,100\n5,1000\n");
    }
}
