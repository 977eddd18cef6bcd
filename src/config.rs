use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::core::JobDescriptor;
use crate::core::runner::{DEFAULT_MAX_OUTPUT_BYTES, DEFAULT_VERBOSITY, RunnerConfig};
use crate::logging::LogConfig;

pub const DEFAULT_CONFIG_FILE: &str = "dupctl.toml";
pub const ENV_PREFIX: &str = "DUPCTL_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Program spawned for every duplicity invocation.
    pub duplicity_bin: String,
    pub verbosity: String,
    /// Combined stdout+stderr cap per operation.
    pub max_output_bytes: usize,
    /// Exported to duplicity as `TMPDIR`.
    pub temp_dir: PathBuf,
    pub log_json: bool,
    pub verbose: bool,
    #[serde(default)]
    pub job: JobDescriptor,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            duplicity_bin: "duplicity".to_string(),
            verbosity: DEFAULT_VERBOSITY.to_string(),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            temp_dir: std::env::temp_dir(),
            log_json: false,
            verbose: false,
            job: JobDescriptor::default(),
        }
    }
}

impl AppConfig {
    /// Layer defaults, the TOML file, `DUPCTL_*` env vars and finally CLI overrides.
    ///
    /// A missing file is not an error. Nested keys use `__` in env vars,
    /// e.g. `DUPCTL_JOB__PASSPHRASE`.
    pub fn new<T: Serialize>(config_file: Option<&Path>, cli_overrides: Option<&T>) -> Result<Self> {
        let file = config_file.unwrap_or(Path::new(DEFAULT_CONFIG_FILE));

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        if let Some(overrides) = cli_overrides {
            figment = figment.merge(Serialized::globals(overrides));
        }

        figment
            .extract()
            .with_context(|| format!("Failed to load configuration (file: {})", file.display()))
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            program: self.duplicity_bin.clone(),
            verbosity: self.verbosity.clone(),
            max_output_bytes: self.max_output_bytes,
            temp_dir: self.temp_dir.clone(),
        }
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            json: self.log_json,
            verbose: self.verbose,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[derive(Serialize)]
    struct Overrides {
        #[serde(skip_serializing_if = "Option::is_none")]
        verbosity: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        verbose: Option<bool>,
    }

    #[test]
    fn defaults_without_any_source() {
        Jail::expect_with(|_jail| {
            let config = AppConfig::new(None, None::<&Overrides>).expect("config");
            assert_eq!(config.duplicity_bin, "duplicity");
            assert_eq!(config.verbosity, "notice");
            assert_eq!(config.max_output_bytes, 1024 * 1000);
            assert_eq!(config.job, JobDescriptor::default());
            Ok(())
        });
    }

    #[test]
    fn file_then_env_then_cli() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "dupctl.toml",
                r#"
                verbosity = "info"
                max_output_bytes = 2048

                [job]
                path = "/home/me"
                url = "file:///mnt/backup"
                cli_options = "--no-encryption"
                "#,
            )?;
            jail.set_env("DUPCTL_JOB__PASSPHRASE", "from-env");
            jail.set_env("DUPCTL_MAX_OUTPUT_BYTES", "4096");

            let overrides = Overrides {
                verbosity: Some("debug".into()),
                verbose: None,
            };
            let config = AppConfig::new(None, Some(&overrides)).expect("config");

            assert_eq!(config.verbosity, "debug");
            assert_eq!(config.max_output_bytes, 4096);
            assert!(!config.verbose);
            assert_eq!(config.job.path, "/home/me");
            assert_eq!(config.job.url, "file:///mnt/backup");
            assert_eq!(config.job.cli_options, "--no-encryption");
            assert_eq!(config.job.passphrase, "from-env");
            Ok(())
        });
    }

    #[test]
    fn explicit_config_path() {
        Jail::expect_with(|jail| {
            jail.create_file("other.toml", r#"duplicity_bin = "/opt/bin/duplicity""#)?;
            let config = AppConfig::new(Some(Path::new("other.toml")), None::<&Overrides>)
                .expect("config");
            assert_eq!(config.runner_config().program, "/opt/bin/duplicity");
            Ok(())
        });
    }

    #[test]
    fn bad_types_are_reported() {
        Jail::expect_with(|jail| {
            jail.create_file("dupctl.toml", r#"max_output_bytes = "lots""#)?;
            assert!(AppConfig::new(None, None::<&Overrides>).is_err());
            Ok(())
        });
    }
}
