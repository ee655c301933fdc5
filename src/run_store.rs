use crate::snowflake::PostId;
use crate::MergeError;
use bincode::{Decode, Encode};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Drop events sort ahead of posts sharing the same numeric key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode)]
pub enum KeyKind {
    Drop,
    Post,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode)]
pub struct TimelineKey {
    pub id: PostId,
    pub kind: KeyKind,
}

impl TimelineKey {
    pub fn post(id: PostId) -> Self {
        Self { id, kind: KeyKind::Post }
    }

    pub fn drop_event(synthetic: PostId) -> Self {
        Self { id: synthetic, kind: KeyKind::Drop }
    }
}

/// A timeline entry waiting to be written, tagged with its ingest order.
///
/// `timestamp_ms` is the reported timestamp for posts and the arrival time
/// for drop events; `track` is zero for posts.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct StagedEntry {
    pub key: TimelineKey,
    pub seq: u64,
    pub timestamp_ms: i64,
    pub track: u64,
}

impl StagedEntry {
    fn order(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key).then(self.seq.cmp(&other.seq))
    }
}

/// Clamp fan-in to a sane range: clamp(budget / read_buf, 8, 128)
pub fn compute_fan_in(budget_bytes: usize, read_buf_bytes: usize) -> usize {
    if read_buf_bytes == 0 {
        return 8;
    }
    (budget_bytes / read_buf_bytes).clamp(8, 128)
}

/// Sorted run of staged entries on disk
#[derive(Clone, Debug)]
pub struct Run {
    path: PathBuf,
    read_buf_bytes: usize,
}

impl Run {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn iter(&self) -> Result<RunIterator, MergeError> {
        Ok(RunIterator {
            reader: BufReader::with_capacity(self.read_buf_bytes, File::open(&self.path)?),
        })
    }
}

pub struct RunIterator {
    reader: BufReader<File>,
}

impl Iterator for RunIterator {
    type Item = Result<StagedEntry, MergeError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.reader.fill_buf() {
            Ok(buf) if buf.is_empty() => return None,
            Ok(_) => {}
            Err(e) => return Some(Err(MergeError::Io(e))),
        }
        Some(
            bincode::decode_from_std_read(&mut self.reader, bincode::config::standard())
                .map_err(MergeError::from),
        )
    }
}

/// Scratch directory of sorted spill runs for one capture merge.
///
/// The directory is removed when the store is dropped.
pub struct RunStore {
    dir: PathBuf,
    runs: Vec<Run>,
    counter: usize,
    read_buf_bytes: usize,
}

impl RunStore {
    pub fn new(dir: PathBuf, read_buf_bytes: usize) -> Result<Self, MergeError> {
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(Self {
            dir,
            runs: Vec::new(),
            counter: 0,
            read_buf_bytes: read_buf_bytes.max(4096),
        })
    }

    pub fn runs(&self) -> &[Run] {
        &self.runs
    }

    fn next_path(&mut self, prefix: &str) -> Result<PathBuf, MergeError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("{}-{:06}.run", prefix, self.counter));
        self.counter += 1;
        Ok(path)
    }

    /// Sort a batch by (key, seq) and write it out as a new run.
    pub fn spill(&mut self, mut entries: Vec<StagedEntry>) -> Result<(), MergeError> {
        if entries.is_empty() {
            return Ok(());
        }
        entries.sort_unstable_by(|a, b| a.order(b));
        let path = self.next_path("spill")?;
        let run = write_run(path, self.read_buf_bytes, entries.into_iter().map(Ok))?;
        self.runs.push(run);
        Ok(())
    }

    /// Merge every run plus the in-memory remainder, keeping the earliest
    /// ingested entry per key.
    ///
    /// `emit` receives each surviving entry in key order; `duplicate` receives
    /// the kept entry and the discarded one.
    pub fn merge_first_seen<E, D>(
        mut self,
        mut remainder: Vec<StagedEntry>,
        fan_in: usize,
        mut emit: E,
        mut duplicate: D,
    ) -> Result<(), MergeError>
    where
        E: FnMut(&StagedEntry) -> Result<(), MergeError>,
        D: FnMut(&StagedEntry, &StagedEntry),
    {
        let fan_in = fan_in.max(2);
        remainder.sort_unstable_by(|a, b| a.order(b));

        // Leave one slot for the in-memory remainder in the final pass
        while self.runs.len() + 1 > fan_in {
            let pending = std::mem::take(&mut self.runs);
            let mut next_pass = Vec::new();
            for chunk in pending.chunks(fan_in) {
                let sources = chunk
                    .iter()
                    .map(|r| r.iter().map(|it| Box::new(it) as Source))
                    .collect::<Result<Vec<_>, _>>()?;
                let path = self.next_path("chunk")?;
                let run = write_run(path, self.read_buf_bytes, MergeIter::new(sources)?)?;
                for merged in chunk {
                    let _ = fs::remove_file(merged.path());
                }
                next_pass.push(run);
            }
            self.runs = next_pass;
        }

        let mut sources = self
            .runs
            .iter()
            .map(|r| r.iter().map(|it| Box::new(it) as Source))
            .collect::<Result<Vec<_>, _>>()?;
        sources.push(Box::new(remainder.into_iter().map(Ok::<StagedEntry, MergeError>)));

        let mut last: Option<StagedEntry> = None;
        for entry in MergeIter::new(sources)? {
            let entry = entry?;
            if let Some(kept) = &last {
                if kept.key == entry.key {
                    duplicate(kept, &entry);
                    continue;
                }
            }
            emit(&entry)?;
            last = Some(entry);
        }
        Ok(())
    }
}

impl Drop for RunStore {
    fn drop(&mut self) {
        if self.dir.exists() {
            let _ = fs::remove_dir_all(&self.dir);
        }
    }
}

type Source = Box<dyn Iterator<Item = Result<StagedEntry, MergeError>>>;

fn write_run(
    path: PathBuf,
    read_buf_bytes: usize,
    entries: impl Iterator<Item = Result<StagedEntry, MergeError>>,
) -> Result<Run, MergeError> {
    let mut writer = BufWriter::new(File::create(&path)?);
    for entry in entries {
        bincode::encode_into_std_write(entry?, &mut writer, bincode::config::standard())?;
    }
    writer.flush()?;
    Ok(Run { path, read_buf_bytes })
}

#[derive(Eq, PartialEq)]
struct HeapItem {
    key: TimelineKey,
    seq: u64,
    source_idx: usize,
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse for min-heap
        other
            .key
            .cmp(&self.key)
            .then(other.seq.cmp(&self.seq))
            .then(other.source_idx.cmp(&self.source_idx))
    }
}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Streaming k-way merge of sorted sources by (key, seq). No dedup.
struct MergeIter {
    sources: Vec<Source>,
    current: Vec<Option<StagedEntry>>,
    heap: BinaryHeap<HeapItem>,
}

impl MergeIter {
    fn new(mut sources: Vec<Source>) -> Result<Self, MergeError> {
        let mut current = Vec::with_capacity(sources.len());
        let mut heap = BinaryHeap::with_capacity(sources.len());
        for (idx, source) in sources.iter_mut().enumerate() {
            let head = source.next().transpose()?;
            if let Some(entry) = &head {
                heap.push(HeapItem { key: entry.key, seq: entry.seq, source_idx: idx });
            }
            current.push(head);
        }
        Ok(Self { sources, current, heap })
    }
}

impl Iterator for MergeIter {
    type Item = Result<StagedEntry, MergeError>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.heap.pop()?;
        let entry = self.current[item.source_idx].take()?;
        match self.sources[item.source_idx].next().transpose() {
            Ok(Some(next)) => {
                self.heap.push(HeapItem { key: next.key, seq: next.seq, source_idx: item.source_idx });
                self.current[item.source_idx] = Some(next);
            }
            Ok(None) => {}
            Err(e) => return Some(Err(e)),
        }
        Some(Ok(entry))
    }
}
