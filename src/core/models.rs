use serde::{Deserialize, Serialize};
use std::fmt;

/// Sentinels wrapped around stderr chunks when both streams are merged onto one channel.
pub const ERROR_OPEN: &str = "<!--:error-->";
pub const ERROR_CLOSE: &str = "<!--error:-->";

/// A backup job as handed to the runner. Nothing here is validated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    /// Source directory being backed up.
    #[serde(default)]
    pub path: String,
    /// Destination archive URL (`file://`, `sftp://`, ...).
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing)]
    pub passphrase: String,
    /// Extra flags passed through to duplicity verbatim.
    #[serde(default)]
    pub cli_options: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupMode {
    /// Let duplicity decide (incremental when a chain exists).
    #[default]
    Incremental,
    Full,
}

impl BackupMode {
    /// The duplicity action word, if any. Incremental runs pass none.
    pub fn action(&self) -> Option<&'static str> {
        match self {
            Self::Incremental => None,
            Self::Full => Some("full"),
        }
    }
}

/// One line of `list-current-files` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub dir: String,
    pub name: String,
}

impl FileEntry {
    pub fn from_path(path: &str) -> Self {
        let (dir, name) = match path.rsplit_once('/') {
            Some((dir, name)) => (dir, name),
            None => (".", path),
        };

        Self {
            path: path.to_string(),
            dir: dir.to_string(),
            name: name.to_string(),
        }
    }
}

/// Fields scraped from `collection-status` and a dry-run incremental.
/// Every field is empty when its pattern did not match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub chain_start_time: String,
    pub chain_end_time: String,
    pub backup_sets: String,
    pub backup_volumes: String,
    pub source_files: String,
    pub source_file_size: String,
}

impl StatusReport {
    /// True when nothing matched.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    Stdout,
    Stderr,
}

/// A raw chunk of subprocess output, in arrival order for its stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    pub stream: Stream,
    pub text: String,
}

impl OutputChunk {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            stream: Stream::Stdout,
            text: text.into(),
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self {
            stream: Stream::Stderr,
            text: text.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.stream == Stream::Stderr
    }

    /// Single-channel form: stdout verbatim, stderr wrapped in the error sentinels.
    pub fn tagged(&self) -> String {
        match self.stream {
            Stream::Stdout => self.text.clone(),
            Stream::Stderr => format!("{ERROR_OPEN}{}{ERROR_CLOSE}", self.text),
        }
    }
}

impl fmt::Display for OutputChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tagged())
    }
}
