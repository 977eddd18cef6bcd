//! Argument construction for every duplicity invocation.
//!
//! Nothing here runs a process. Each builder returns an [`Invocation`]: the
//! program, an argument vector and the environment it needs. Arguments are
//! handed to the OS as a vector, so path and URL values are never re-parsed
//! by a shell. Only the free-form `cli_options` string is tokenised, using
//! POSIX shell word rules.

use std::fmt;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;

use super::error::RunError;
use super::models::{BackupMode, JobDescriptor};

/// One argument. Operands are the user-supplied path/URL values and render quoted.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Arg {
    Flag(String),
    Operand(String),
}

impl Arg {
    fn value(&self) -> &str {
        match self {
            Arg::Flag(v) | Arg::Operand(v) => v,
        }
    }
}

/// A fully built duplicity command line plus its environment.
#[derive(Clone)]
pub struct Invocation {
    program: String,
    args: Vec<Arg>,
    passphrase: String,
    temp_dir: PathBuf,
}

impl Invocation {
    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> Vec<&str> {
        self.args.iter().map(Arg::value).collect()
    }

    /// The duplicity action (first argument that is not an operand), if any.
    pub fn action(&self) -> Option<&str> {
        match self.args.first() {
            Some(Arg::Flag(action)) => Some(action),
            _ => None,
        }
    }

    /// Build the tokio command with piped output and `PASSPHRASE`/`TMPDIR` set.
    /// The child leads its own process group so it can be signalled as a unit.
    pub fn to_command(&self) -> Command {
        let mut std_cmd = std::process::Command::new(&self.program);
        std_cmd
            .args(self.args())
            .env("PASSPHRASE", &self.passphrase)
            .env("TMPDIR", &self.temp_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let mut cmd = Command::from(std_cmd);
        cmd.kill_on_drop(true);
        cmd
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            match arg {
                Arg::Flag(v) => write!(f, " {v}")?,
                Arg::Operand(v) => write!(f, " \"{v}\"")?,
            }
        }
        Ok(())
    }
}

// The passphrase must never reach a log line through `{:?}`.
impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("command", &self.to_string())
            .field("temp_dir", &self.temp_dir)
            .finish_non_exhaustive()
    }
}

/// Builds invocations for one runner configuration.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    program: String,
    verbosity: String,
    temp_dir: PathBuf,
}

impl CommandBuilder {
    pub fn new(program: impl Into<String>, verbosity: impl Into<String>, temp_dir: PathBuf) -> Self {
        Self {
            program: program.into(),
            verbosity: verbosity.into(),
            temp_dir,
        }
    }

    /// `duplicity [full] "<path>" "<url>" <cli_options> --verbosity <level>`
    pub fn backup(&self, job: &JobDescriptor, mode: BackupMode) -> Result<Invocation, RunError> {
        let mut args = Vec::new();
        if let Some(action) = mode.action() {
            args.push(Arg::Flag(action.to_string()));
        }
        args.push(Arg::Operand(job.path.clone()));
        args.push(Arg::Operand(job.url.clone()));
        self.finish(job, args, &[])
    }

    /// `duplicity restore --file-to-restore "<file>" "<url>" "<dest>" <cli_options> --verbosity <level>`
    pub fn restore_file(
        &self,
        job: &JobDescriptor,
        source_path: &str,
        dest_path: &str,
    ) -> Result<Invocation, RunError> {
        let args = vec![
            Arg::Flag("restore".into()),
            Arg::Flag("--file-to-restore".into()),
            Arg::Operand(source_path.to_string()),
            Arg::Operand(job.url.clone()),
            Arg::Operand(dest_path.to_string()),
        ];
        self.finish(job, args, &[])
    }

    /// `duplicity restore "<url>" "<dest>" <cli_options> --verbosity <level>`
    pub fn restore_tree(&self, job: &JobDescriptor, dest_path: &str) -> Result<Invocation, RunError> {
        let args = vec![
            Arg::Flag("restore".into()),
            Arg::Operand(job.url.clone()),
            Arg::Operand(dest_path.to_string()),
        ];
        self.finish(job, args, &[])
    }

    /// `duplicity list-current-files <url> <cli_options> --verbosity <level>`
    pub fn list_current_files(&self, job: &JobDescriptor) -> Result<Invocation, RunError> {
        let args = vec![
            Arg::Flag("list-current-files".into()),
            Arg::Flag(job.url.clone()),
        ];
        self.finish(job, args, &[])
    }

    /// `collection-status` followed by a dry-run `incremental`, run in order.
    /// The second only runs when the first succeeded.
    pub fn status(&self, job: &JobDescriptor) -> Result<[Invocation; 2], RunError> {
        let collection = self.finish(
            job,
            vec![
                Arg::Flag("collection-status".into()),
                Arg::Flag(job.url.clone()),
            ],
            &[],
        )?;
        let dry_run = self.finish(
            job,
            vec![
                Arg::Flag("incremental".into()),
                Arg::Flag(job.path.clone()),
                Arg::Flag(job.url.clone()),
            ],
            &["--dry-run"],
        )?;
        Ok([collection, dry_run])
    }

    fn finish(
        &self,
        job: &JobDescriptor,
        mut args: Vec<Arg>,
        trailing: &[&str],
    ) -> Result<Invocation, RunError> {
        args.extend(split_cli_options(&job.cli_options)?.into_iter().map(Arg::Flag));
        args.push(Arg::Flag("--verbosity".into()));
        args.push(Arg::Flag(self.verbosity.clone()));
        args.extend(trailing.iter().map(|t| Arg::Flag(t.to_string())));

        Ok(Invocation {
            program: self.program.clone(),
            args,
            passphrase: job.passphrase.clone(),
            temp_dir: self.temp_dir.clone(),
        })
    }
}

/// Tokenise the pass-through options string with shell word rules.
pub fn split_cli_options(options: &str) -> Result<Vec<String>, RunError> {
    shlex::split(options).ok_or_else(|| {
        RunError::InvalidCliOptions(format!("unbalanced quoting or escaping in '{options}'"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> CommandBuilder {
        CommandBuilder::new("duplicity", "notice", PathBuf::from("/tmp"))
    }

    fn job(cli_options: &str) -> JobDescriptor {
        JobDescriptor {
            path: "/home/me/My Documents".into(),
            url: "file:///mnt/backup".into(),
            passphrase: "s3cr3t".into(),
            cli_options: cli_options.into(),
        }
    }

    #[test]
    fn incremental_backup_has_no_action_word() {
        let inv = builder().backup(&job(""), BackupMode::Incremental).unwrap();
        assert_eq!(inv.args(), vec![
            "/home/me/My Documents",
            "file:///mnt/backup",
            "--verbosity",
            "notice"
        ]);
        assert_eq!(inv.action(), None);
        assert_eq!(
            inv.to_string(),
            r#"duplicity "/home/me/My Documents" "file:///mnt/backup" --verbosity notice"#
        );
    }

    #[test]
    fn full_backup_appends_cli_options_before_verbosity() {
        let inv = builder()
            .backup(&job("--exclude '**/.cache' --volsize 50"), BackupMode::Full)
            .unwrap();
        assert_eq!(inv.args(), vec![
            "full",
            "/home/me/My Documents",
            "file:///mnt/backup",
            "--exclude",
            "**/.cache",
            "--volsize",
            "50",
            "--verbosity",
            "notice"
        ]);
        assert_eq!(inv.action(), Some("full"));
    }

    #[test]
    fn restore_file_shape() {
        let inv = builder()
            .restore_file(&job(""), "docs/a.txt", "/tmp/out/a.txt")
            .unwrap();
        assert_eq!(
            inv.to_string(),
            r#"duplicity restore --file-to-restore "docs/a.txt" "file:///mnt/backup" "/tmp/out/a.txt" --verbosity notice"#
        );
    }

    #[test]
    fn restore_tree_shape() {
        let inv = builder().restore_tree(&job("--force"), "/tmp/out").unwrap();
        assert_eq!(
            inv.to_string(),
            r#"duplicity restore "file:///mnt/backup" "/tmp/out" --force --verbosity notice"#
        );
    }

    #[test]
    fn operands_appear_exactly_once_and_quoted() {
        let j = job("");
        let b = builder();
        let rendered = [
            b.backup(&j, BackupMode::Full).unwrap().to_string(),
            b.restore_file(&j, "x", "/dest").unwrap().to_string(),
            b.restore_tree(&j, "/dest").unwrap().to_string(),
        ];
        for line in &rendered {
            assert_eq!(line.matches("\"file:///mnt/backup\"").count(), 1, "{line}");
            assert_eq!(line.matches("file:///mnt/backup").count(), 1, "{line}");
        }
    }

    #[test]
    fn list_uses_bare_url() {
        let inv = builder().list_current_files(&job("")).unwrap();
        assert_eq!(
            inv.to_string(),
            "duplicity list-current-files file:///mnt/backup --verbosity notice"
        );
    }

    #[test]
    fn status_is_collection_status_then_dry_run() {
        let [collection, dry_run] = builder().status(&job("--s3-use-new-style")).unwrap();
        assert_eq!(collection.args(), vec![
            "collection-status",
            "file:///mnt/backup",
            "--s3-use-new-style",
            "--verbosity",
            "notice"
        ]);
        assert_eq!(dry_run.args(), vec![
            "incremental",
            "/home/me/My Documents",
            "file:///mnt/backup",
            "--s3-use-new-style",
            "--verbosity",
            "notice",
            "--dry-run"
        ]);
    }

    #[test]
    fn shell_metacharacters_stay_literal() {
        let inv = builder().backup(&job("; rm -rf /"), BackupMode::Full).unwrap();
        assert!(inv.args().contains(&";"));
        assert!(inv.args().contains(&"rm"));
    }

    #[test]
    fn unbalanced_quotes_are_rejected() {
        let err = builder()
            .backup(&job("--exclude 'oops"), BackupMode::Full)
            .unwrap_err();
        assert!(matches!(err, RunError::InvalidCliOptions(_)));
    }

    #[test]
    fn debug_does_not_leak_passphrase() {
        let inv = builder().backup(&job(""), BackupMode::Full).unwrap();
        assert!(!format!("{inv:?}").contains("s3cr3t"));
    }

    #[test]
    fn custom_verbosity_is_used() {
        let b = CommandBuilder::new("/opt/duplicity", "info", PathBuf::from("/var/tmp"));
        let inv = b.restore_tree(&job(""), "/out").unwrap();
        assert_eq!(inv.program(), "/opt/duplicity");
        assert_eq!(inv.args().last(), Some(&"info"));
    }
}
