use confluence::capture_merger::CaptureMerger;
use confluence::config::{CaptureSpec, MergeConfig};
use confluence::snowflake;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const BASE: i64 = 1_600_000_000_000;

fn post_id(ts: i64, seq: u16) -> u64 {
    snowflake::encode(ts, 1, 3, seq).unwrap()
}

fn write_shard(dir: &Path, name: &str, lines: &[String]) -> PathBuf {
    let path = dir.join(name);
    let body = lines.join("\n") + "\n";
    if name.ends_with(".zst") {
        let mut encoder = zstd::Encoder::new(File::create(&path).unwrap(), 3).unwrap();
        encoder.write_all(body.as_bytes()).unwrap();
        encoder.finish().unwrap();
    } else {
        fs::write(&path, body).unwrap();
    }
    path
}

fn read_artifact(path: &Path) -> String {
    String::from_utf8(zstd::decode_all(File::open(path).unwrap()).unwrap()).unwrap()
}

fn spec(root: &Path, index: usize) -> CaptureSpec {
    CaptureSpec {
        index,
        name: "a".to_string(),
        drop_tag: "ratemsg_a".to_string(),
        shard_dir: root.join("covid_a").join("timestamp"),
        artifact: root.join("covid_a").join("ts_covid_a.zst"),
    }
}

/// Two overlapping shards: post A appears in both, a drop event lands between
/// A and B.
fn overlapping_shards(shard_dir: &Path) -> (u64, u64, Vec<PathBuf>) {
    fs::create_dir_all(shard_dir).unwrap();
    let a = post_id(BASE, 0);
    let b = post_id(BASE + 10_000, 0);
    let first = write_shard(
        shard_dir,
        "2020-09-13_12.txt",
        &[format!("{},{}", BASE + 100, a), format!("{},ratemsg_a,7", BASE + 7_000)],
    );
    let second = write_shard(
        shard_dir,
        "2020-09-13_13.txt.zst",
        &[format!("{},{}", BASE + 10_050, b), format!("{},{}", BASE + 100, a)],
    );
    (a, b, vec![first, second])
}

#[test]
fn merges_dedups_and_places_drop_events() {
    let tmp = TempDir::new().unwrap();
    let spec = spec(tmp.path(), 0);
    let (a, b, _) = overlapping_shards(&spec.shard_dir);
    let config = MergeConfig::default();

    let outcome = CaptureMerger::new(&spec, &config).run().unwrap();

    let expected = format!(
        "{},{}\n{},ratemsg_a,7\n{},{}\n",
        BASE + 100,
        a,
        BASE + 7_000 - config.drop_offset_ms,
        BASE + 10_050,
        b
    );
    assert_eq!(read_artifact(&spec.artifact), expected);
    assert_eq!(outcome.stats.shards_read, 2);
    assert_eq!(outcome.stats.posts_written, 2);
    assert_eq!(outcome.stats.drops_written, 1);
    assert_eq!(outcome.stats.duplicate_posts, 1);
    assert_eq!(outcome.stats.timestamp_mismatches, 0);
    assert_eq!(outcome.report.captured_count, 2);
    assert_eq!(outcome.report.estimated_missing, 7);
    assert_eq!(outcome.report.estimated_total, 9);

    // no temporary or scratch files left next to the artifact
    let leftovers: Vec<_> = fs::read_dir(spec.artifact.parent().unwrap())
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .filter(|n| n.ends_with(".tmp") || n.ends_with(".runs"))
        .collect();
    assert!(leftovers.is_empty(), "leftovers: {:?}", leftovers);
}

#[test]
fn output_is_independent_of_shard_order() {
    let tmp = TempDir::new().unwrap();
    let spec = spec(tmp.path(), 2);
    let (_, _, shards) = overlapping_shards(&spec.shard_dir);
    let config = MergeConfig::default();
    let merger = CaptureMerger::new(&spec, &config);

    merger.merge_shards(&shards).unwrap();
    let forward = fs::read(&spec.artifact).unwrap();

    let reversed: Vec<PathBuf> = shards.iter().rev().cloned().collect();
    merger.merge_shards(&reversed).unwrap();
    let backward = fs::read(&spec.artifact).unwrap();

    assert_eq!(forward, backward);
}

#[test]
fn skips_corrupt_shards_and_malformed_lines() {
    let tmp = TempDir::new().unwrap();
    let spec = spec(tmp.path(), 0);
    fs::create_dir_all(&spec.shard_dir).unwrap();
    let id = post_id(BASE, 5);
    write_shard(
        &spec.shard_dir,
        "good.txt",
        &[
            format!("{},{}", BASE + 3, id),
            "not a record".to_string(),
            "1,2,3,4".to_string(),
            "abc,123".to_string(),
            format!("{},ratemsg_b,4", BASE + 9),
        ],
    );
    fs::write(spec.shard_dir.join("broken.txt.zst"), b"definitely not zstd").unwrap();

    let outcome = CaptureMerger::new(&spec, &MergeConfig::default()).run().unwrap();

    assert_eq!(outcome.stats.shards_read, 1);
    assert_eq!(outcome.stats.shards_skipped, 1);
    assert_eq!(outcome.stats.malformed_lines, 3);
    assert_eq!(outcome.stats.foreign_drop_tags, 1);
    assert_eq!(outcome.stats.posts_written, 1);
    assert_eq!(outcome.stats.drops_written, 1);
    // drop lines always carry the capture's own tag
    assert!(read_artifact(&spec.artifact).contains(",ratemsg_a,4"));
}

#[test]
fn spilling_matches_in_memory_merge() {
    let tmp = TempDir::new().unwrap();
    let spec = spec(tmp.path(), 1);
    fs::create_dir_all(&spec.shard_dir).unwrap();

    // Interleaved shards with heavy overlap and a few resets in the counter
    for shard in 0..6i64 {
        let mut lines = Vec::new();
        for i in 0..200i64 {
            let ts = BASE + (i * 7 + shard * 31) % 1_500 * 10;
            lines.push(format!("{},{}", ts, post_id(ts, 0)));
            if i % 40 == 0 {
                lines.push(format!("{},ratemsg_a,{}", ts + 1, (i + shard) % 90));
            }
        }
        write_shard(&spec.shard_dir, &format!("shard_{}.txt", shard), &lines);
    }

    let in_memory = MergeConfig::default();
    let expected = CaptureMerger::new(&spec, &in_memory).run().unwrap();
    let expected_text = read_artifact(&spec.artifact);

    let spilling = MergeConfig {
        spill_threshold: 16,
        fan_in: 3,
        ..MergeConfig::default()
    };
    let spilled = CaptureMerger::new(&spec, &spilling).run().unwrap();

    assert!(spilled.stats.spilled_runs > 3);
    assert_eq!(read_artifact(&spec.artifact), expected_text);
    assert_eq!(spilled.stats.posts_written, expected.stats.posts_written);
    assert_eq!(spilled.report, expected.report);
    assert!(!spec.artifact.with_file_name("ts_covid_a.zst.runs").exists());
}

#[test]
fn missing_shard_directory_yields_empty_artifact() {
    let tmp = TempDir::new().unwrap();
    let spec = spec(tmp.path(), 0);
    let outcome = CaptureMerger::new(&spec, &MergeConfig::default()).run().unwrap();
    assert_eq!(outcome.stats.shards_read, 0);
    assert_eq!(read_artifact(&spec.artifact), "");
    assert_eq!(outcome.report.sampling_rate, None);
}

#[test]
fn differing_timestamps_keep_the_first_processed() {
    let tmp = TempDir::new().unwrap();
    let spec = spec(tmp.path(), 0);
    fs::create_dir_all(&spec.shard_dir).unwrap();
    let a = post_id(BASE, 0);
    let early = write_shard(&spec.shard_dir, "early.txt", &[format!("{},{}", BASE + 100, a)]);
    let late = write_shard(&spec.shard_dir, "late.txt", &[format!("{},{}", BASE + 250, a)]);
    let config = MergeConfig::default();
    let merger = CaptureMerger::new(&spec, &config);

    let forward = merger.merge_shards(&[early.clone(), late.clone()]).unwrap();
    assert_eq!(read_artifact(&spec.artifact), format!("{},{}\n", BASE + 100, a));
    assert_eq!(forward.stats.duplicate_posts, 1);
    assert_eq!(forward.stats.timestamp_mismatches, 1);
    assert_eq!(forward.stats.posts_written, 1);

    let backward = merger.merge_shards(&[late, early]).unwrap();
    assert_eq!(read_artifact(&spec.artifact), format!("{},{}\n", BASE + 250, a));
    assert_eq!(backward.stats.duplicate_posts, 1);
    assert_eq!(backward.stats.timestamp_mismatches, 1);
}

#[test]
fn timestamps_outside_the_id_clock_are_codec_errors() {
    let tmp = TempDir::new().unwrap();
    let spec = spec(tmp.path(), 0);
    fs::create_dir_all(&spec.shard_dir).unwrap();
    let id = post_id(BASE, 1);
    write_shard(
        &spec.shard_dir,
        "h0.txt",
        &[
            format!("0,{}", id),
            format!("{},{}", BASE, id + 1),
            format!("9000000000000000000,{}", id + 2),
            "1000,ratemsg_a,5".to_string(),
            "9000000000000000000,ratemsg_a,6".to_string(),
        ],
    );

    let outcome = CaptureMerger::new(&spec, &MergeConfig::default()).run().unwrap();

    assert_eq!(read_artifact(&spec.artifact), format!("{},{}\n", BASE, id + 1));
    assert_eq!(outcome.stats.codec_errors, 4);
    assert_eq!(outcome.stats.malformed_lines, 0);
    assert_eq!(outcome.stats.posts_written, 1);
    assert_eq!(outcome.stats.drops_written, 0);
    assert_eq!(outcome.report.estimated_missing, 0);
}

#[test]
fn drop_events_in_the_same_millisecond_keep_the_first() {
    let tmp = TempDir::new().unwrap();
    let spec = spec(tmp.path(), 0);
    fs::create_dir_all(&spec.shard_dir).unwrap();
    write_shard(
        &spec.shard_dir,
        "h0.txt",
        &[format!("{},ratemsg_a,3", BASE + 5_000), format!("{},ratemsg_a,9", BASE + 5_000)],
    );
    let config = MergeConfig::default();

    let outcome = CaptureMerger::new(&spec, &config).run().unwrap();

    assert_eq!(
        read_artifact(&spec.artifact),
        format!("{},ratemsg_a,3\n", BASE + 5_000 - config.drop_offset_ms)
    );
    assert_eq!(outcome.stats.duplicate_drop_keys, 1);
    assert_eq!(outcome.stats.drops_written, 1);
    assert_eq!(outcome.stats.duplicate_posts, 0);
    assert_eq!(outcome.report.estimated_missing, 3);
}
