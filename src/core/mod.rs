pub mod command;
pub mod error;
pub mod models;
pub mod parser;
pub mod runner;

pub use command::{CommandBuilder, Invocation};
pub use error::{Outcome, RunError};
pub use models::{BackupMode, FileEntry, JobDescriptor, OutputChunk, StatusReport, Stream};
pub use parser::{DuplicityParser, OutputParser};
pub use runner::{DuplicityRunner, OutputSink, RunnerConfig};
