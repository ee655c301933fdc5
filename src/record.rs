use crate::snowflake::PostId;
use crate::MergeError;
use std::fmt;

/// One line of a timestamp shard or of a merged timeline artifact.
///
/// `ts,id` is a genuine post, `ts,tag,track` is a drop event. Shards and
/// artifacts share the shape, only the meaning of a drop's timestamp differs
/// (arrival time in shards, synthetic-key time in artifacts).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Post { timestamp_ms: i64, id: PostId },
    Drop { timestamp_ms: i64, tag: String, track: u64 },
}

impl Record {
    pub fn parse(line: &str) -> Result<Self, MergeError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let fields: Vec<&str> = line.split(',').collect();
        match fields.as_slice() {
            [ts, id] => Ok(Record::Post {
                timestamp_ms: parse_field(ts, "timestamp")?,
                id: parse_field(id, "post id")?,
            }),
            [ts, tag, track] => {
                if tag.is_empty() {
                    return Err(MergeError::MalformedRecord(format!("empty drop tag in {:?}", line)));
                }
                Ok(Record::Drop {
                    timestamp_ms: parse_field(ts, "timestamp")?,
                    tag: (*tag).to_string(),
                    track: parse_field(track, "track")?,
                })
            }
            _ => Err(MergeError::MalformedRecord(format!(
                "expected 2 or 3 fields, found {} in {:?}",
                fields.len(),
                line
            ))),
        }
    }

    pub fn timestamp_ms(&self) -> i64 {
        match self {
            Record::Post { timestamp_ms, .. } | Record::Drop { timestamp_ms, .. } => *timestamp_ms,
        }
    }

    pub fn is_drop(&self) -> bool {
        matches!(self, Record::Drop { .. })
    }
}

fn parse_field<T: std::str::FromStr>(raw: &str, what: &str) -> Result<T, MergeError> {
    raw.trim()
        .parse()
        .map_err(|_| MergeError::MalformedRecord(format!("non-numeric {} {:?}", what, raw)))
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Record::Post { timestamp_ms, id } => write!(f, "{},{}", timestamp_ms, id),
            Record::Drop { timestamp_ms, tag, track } => write!(f, "{},{},{}", timestamp_ms, tag, track),
        }
    }
}
