use std::fmt;
use std::path::PathBuf;

#[derive(Debug)]
pub enum MergeError {
    ShardRead { path: PathBuf, source: std::io::Error },
    MalformedRecord(String),
    CodecRange(String),
    MissingArtifact(PathBuf),
    OutOfOrder { path: PathBuf, previous: u64, current: u64 },
    Serialization(Box<bincode::error::EncodeError>),
    Deserialization(Box<bincode::error::DecodeError>),
    Json(serde_json::Error),
    Io(std::io::Error),
    Config(String),
    Other(String),
}

impl fmt::Display for MergeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeError::ShardRead { path, source } => {
                write!(f, "Shard read error in {}: {}", path.display(), source)
            }
            MergeError::MalformedRecord(e) => write!(f, "Malformed record: {}", e),
            MergeError::CodecRange(e) => write!(f, "Codec range error: {}", e),
            MergeError::MissingArtifact(p) => write!(f, "Missing artifact: {}", p.display()),
            MergeError::OutOfOrder { path, previous, current } => write!(
                f,
                "Out of order key in {}: {} follows {}",
                path.display(),
                current,
                previous
            ),
            MergeError::Serialization(e) => write!(f, "Serialization error: {}", e),
            MergeError::Deserialization(e) => write!(f, "Deserialization error: {}", e),
            MergeError::Json(e) => write!(f, "JSON error: {}", e),
            MergeError::Io(e) => write!(f, "IO error: {}", e),
            MergeError::Config(e) => write!(f, "Config error: {}", e),
            MergeError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for MergeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MergeError::ShardRead { source, .. } => Some(source),
            MergeError::Io(e) => Some(e),
            MergeError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl MergeError {
    /// Errors that skip a record or a shard instead of aborting the run.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            MergeError::ShardRead { .. }
                | MergeError::MalformedRecord(_)
                | MergeError::CodecRange(_)
                | MergeError::MissingArtifact(_)
        )
    }
}

impl From<bincode::error::EncodeError> for MergeError {
    fn from(err: bincode::error::EncodeError) -> Self {
        MergeError::Serialization(Box::new(err))
    }
}

impl From<bincode::error::DecodeError> for MergeError {
    fn from(err: bincode::error::DecodeError) -> Self {
        MergeError::Deserialization(Box::new(err))
    }
}

impl From<serde_json::Error> for MergeError {
    fn from(err: serde_json::Error) -> Self {
        MergeError::Json(err)
    }
}

impl From<std::io::Error> for MergeError {
    fn from(err: std::io::Error) -> Self {
        MergeError::Io(err)
    }
}

impl From<String> for MergeError {
    fn from(err: String) -> Self {
        MergeError::Other(err)
    }
}

impl From<&str> for MergeError {
    fn from(err: &str) -> Self {
        MergeError::Other(err.to_string())
    }
}
