use crate::record::Record;
use crate::MergeError;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

const READ_BUF_BYTES: usize = 64 * 1024;

/// List every shard file below `dir`, sorted by path.
///
/// A missing directory yields no shards. Unreadable entries are logged and
/// skipped.
pub fn discover_shards(dir: &Path) -> Vec<PathBuf> {
    if !dir.exists() {
        warn!(dir = %dir.display(), "shard directory does not exist");
        return Vec::new();
    }

    let mut shards = Vec::new();
    for entry in WalkDir::new(dir).follow_links(true) {
        match entry {
            Ok(entry) if entry.file_type().is_file() => shards.push(entry.into_path()),
            Ok(_) => {}
            Err(e) => warn!(dir = %dir.display(), error = %e, "skipping unreadable shard entry"),
        }
    }
    shards.sort();
    shards
}

pub fn is_compressed(path: &Path) -> bool {
    path.extension().map_or(false, |ext| ext == "zst")
}

/// Open a text file for line reading, decompressing `.zst` files on the fly.
pub fn open_lines(path: &Path) -> std::io::Result<Box<dyn BufRead + Send>> {
    let file = File::open(path)?;
    if is_compressed(path) {
        let decoder = zstd::Decoder::new(file)?;
        Ok(Box::new(BufReader::with_capacity(READ_BUF_BYTES, decoder)))
    } else {
        Ok(Box::new(BufReader::with_capacity(READ_BUF_BYTES, file)))
    }
}

/// Read a whole shard, returning each line with its 1-based line number.
///
/// Any I/O failure (missing file, truncated or corrupt compression) fails the
/// shard as a whole so a partially read shard never contributes records.
pub fn read_shard_lines(path: &Path) -> Result<Vec<(usize, String)>, MergeError> {
    let shard_err = |source| MergeError::ShardRead {
        path: path.to_path_buf(),
        source,
    };
    let reader = open_lines(path).map_err(shard_err)?;
    let mut lines = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.map_err(shard_err)?;
        if line.trim().is_empty() {
            continue;
        }
        lines.push((idx + 1, line));
    }
    Ok(lines)
}

/// Compressed line writer that only becomes visible at `path` on [`finish`].
///
/// Output goes to `<path>.tmp`; a writer dropped before `finish` deletes its
/// temporary file, so an artifact on disk is always complete.
///
/// [`finish`]: ArtifactWriter::finish
pub struct ArtifactWriter {
    path: PathBuf,
    temp_path: PathBuf,
    encoder: Option<zstd::Encoder<'static, BufWriter<File>>>,
    lines: u64,
}

impl ArtifactWriter {
    pub fn create(path: &Path, level: i32) -> Result<Self, MergeError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let temp_path = temp_path_for(path);
        let file = File::create(&temp_path)?;
        let encoder = zstd::Encoder::new(BufWriter::new(file), level)?;
        Ok(Self {
            path: path.to_path_buf(),
            temp_path,
            encoder: Some(encoder),
            lines: 0,
        })
    }

    pub fn write_record(&mut self, record: &Record) -> Result<(), MergeError> {
        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| MergeError::Other("artifact writer already finished".to_string()))?;
        writeln!(encoder, "{}", record)?;
        self.lines += 1;
        Ok(())
    }

    /// Flush, sync and atomically move the artifact into place.
    pub fn finish(mut self) -> Result<u64, MergeError> {
        let encoder = self
            .encoder
            .take()
            .ok_or_else(|| MergeError::Other("artifact writer already finished".to_string()))?;
        let mut writer = encoder.finish()?;
        writer.flush()?;
        let file = writer.into_inner().map_err(|e| MergeError::Io(e.into_error()))?;
        file.sync_all()?;
        drop(file);
        fs::rename(&self.temp_path, &self.path)?;
        debug!(path = %self.path.display(), lines = self.lines, "artifact finalized");
        Ok(self.lines)
    }
}

impl Drop for ArtifactWriter {
    fn drop(&mut self) {
        if self.encoder.take().is_some() {
            let _ = fs::remove_file(&self.temp_path);
        }
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unfinished_writer_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("ts_demo_1.zst");
        {
            let mut writer = ArtifactWriter::create(&path, 3).unwrap();
            writer.write_record(&Record::Post { timestamp_ms: 1, id: 100 }).unwrap();
        }
        assert!(!path.exists());
        assert!(!temp_path_for(&path).exists());
    }

    #[test]
    fn finished_artifact_reads_back_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ts_demo_1.zst");
        let mut writer = ArtifactWriter::create(&path, 3).unwrap();
        writer.write_record(&Record::Post { timestamp_ms: 1, id: 100 }).unwrap();
        writer.write_record(&Record::Drop { timestamp_ms: 2, tag: "ratemsg_1".into(), track: 7 }).unwrap();
        assert_eq!(writer.finish().unwrap(), 2);

        let lines: Vec<(usize, String)> = read_shard_lines(&path).unwrap();
        assert_eq!(lines, vec![(1, "1,100".to_string()), (2, "2,ratemsg_1,7".to_string())]);
    }

    #[test]
    fn discovers_nested_shards_sorted() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("2020-03-24")).unwrap();
        fs::write(dir.path().join("2020-03-24").join("01.txt"), "1,2\n").unwrap();
        fs::write(dir.path().join("00.txt"), "1,2\n").unwrap();
        let shards = discover_shards(dir.path());
        assert_eq!(shards, vec![dir.path().join("00.txt"), dir.path().join("2020-03-24").join("01.txt")]);
        assert!(discover_shards(&dir.path().join("missing")).is_empty());
    }

    #[test]
    fn corrupt_compressed_shard_is_a_shard_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.zst");
        fs::write(&path, b"definitely not zstd").unwrap();
        assert!(matches!(read_shard_lines(&path), Err(MergeError::ShardRead { .. })));
    }
}
