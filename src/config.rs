//! Settings file and resolution against the command line
//!
//! Values come from, in order of precedence: command line flags, the TOML
//! file given with `--config`, built-in defaults.

use std::fs;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use podtail_k8s::LabelSelector;
use podtail_logs::DEFAULT_BUFFER;
use podtail_output::OutputFormat;

use crate::cli::{Args, parse_since};

const DEFAULT_SINCE: Duration = Duration::from_secs(1);
const DEFAULT_IGNORE: &str = "podtail.ignore=true";
const DEFAULT_LOG_LEVEL: &str = "error";

/// Contents of the settings file
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub since: Option<String>,
    pub buffer: Option<usize>,
    pub output: Option<OutputFormat>,
    pub color: Option<bool>,
    pub containers: Option<Vec<String>>,
    pub ignore: Option<Vec<String>>,
    pub timestamps: Option<bool>,
    pub log_level: Option<String>,
    pub log_file: Option<PathBuf>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }
}

/// Effective settings after merging flags, file and defaults
#[derive(Debug)]
pub struct Settings {
    pub since: Duration,
    pub buffer: usize,
    pub output: OutputFormat,
    pub color: bool,
    pub containers: Vec<String>,
    pub ignore: Vec<LabelSelector>,
    pub timestamps: bool,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
}

impl Settings {
    /// Read the settings file named by `--config`, if any, and merge
    pub fn load(args: &Args) -> Result<Self> {
        let file = match &args.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::merge(args, file, std::io::stdout().is_terminal())
    }

    pub fn merge(args: &Args, file: FileConfig, terminal: bool) -> Result<Self> {
        let since = match (args.since, file.since) {
            (Some(since), _) => since,
            (None, Some(text)) => parse_since(&text)
                .map_err(anyhow::Error::msg)
                .context("invalid 'since' in config file")?,
            (None, None) => DEFAULT_SINCE,
        };

        let ignore = if !args.ignore.is_empty() {
            args.ignore.clone()
        } else {
            let texts = file
                .ignore
                .unwrap_or_else(|| vec![DEFAULT_IGNORE.to_string()]);
            texts
                .iter()
                .map(|s| s.parse::<LabelSelector>())
                .collect::<Result<Vec<_>, _>>()
                .context("invalid 'ignore' selector in config file")?
        };

        let containers = if args.containers.is_empty() {
            file.containers.unwrap_or_default()
        } else {
            args.containers.clone()
        };

        Ok(Self {
            since,
            buffer: args.buffer.or(file.buffer).unwrap_or(DEFAULT_BUFFER),
            output: args.output.or(file.output).unwrap_or_default(),
            color: !args.no_color && file.color.unwrap_or(terminal),
            containers,
            ignore,
            timestamps: args.timestamps || file.timestamps.unwrap_or(false),
            log_level: args
                .log_level
                .clone()
                .or(file.log_level)
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            log_file: args.log_file.clone().or(file.log_file),
        })
    }

    /// Lookback in whole seconds; the log API needs at least one
    pub fn since_seconds(&self) -> i64 {
        i64::try_from(self.since.as_secs()).unwrap_or(i64::MAX).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn args(extra: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("podtail").chain(extra.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::merge(&args(&[]), FileConfig::default(), false).unwrap();
        assert_eq!(settings.since, DEFAULT_SINCE);
        assert_eq!(settings.buffer, DEFAULT_BUFFER);
        assert_eq!(settings.output, OutputFormat::Default);
        assert!(!settings.color);
        assert!(!settings.timestamps);
        assert_eq!(settings.log_level, "error");
        assert_eq!(settings.log_file, None);
        assert_eq!(settings.ignore.len(), 1);
        assert_eq!(settings.ignore[0].to_string(), DEFAULT_IGNORE);
    }

    #[test]
    fn test_file_values_apply() {
        let file: FileConfig = toml::from_str(
            r#"
            since = "1m"
            buffer = 100
            output = "json-pretty"
            color = false
            containers = ["app"]
            ignore = []
            timestamps = true
            log_level = "debug"
            log_file = "/tmp/podtail.log"
            "#,
        )
        .unwrap();

        let settings = Settings::merge(&args(&[]), file, true).unwrap();
        assert_eq!(settings.log_file, Some(PathBuf::from("/tmp/podtail.log")));
        assert_eq!(settings.since, Duration::from_secs(60));
        assert_eq!(settings.buffer, 100);
        assert_eq!(settings.output, OutputFormat::JsonPretty);
        assert!(!settings.color);
        assert_eq!(settings.containers, vec!["app"]);
        assert!(settings.ignore.is_empty());
        assert!(settings.timestamps);
        assert_eq!(settings.log_level, "debug");
    }

    #[test]
    fn test_flags_override_file() {
        let file: FileConfig = toml::from_str(
            r#"
            since = "1m"
            buffer = 100
            output = "raw"
            containers = ["app"]
            log_file = "/tmp/podtail.log"
            "#,
        )
        .unwrap();

        let settings = Settings::merge(
            &args(&[
                "--since",
                "5s",
                "--buffer",
                "10",
                "-o",
                "json",
                "-c",
                "proxy",
                "--no-color",
                "--log-file",
                "debug.log",
            ]),
            file,
            true,
        )
        .unwrap();
        assert_eq!(settings.since_seconds(), 5);
        assert_eq!(settings.buffer, 10);
        assert_eq!(settings.output, OutputFormat::Json);
        assert_eq!(settings.containers, vec!["proxy"]);
        assert!(!settings.color);
        assert_eq!(settings.log_file, Some(PathBuf::from("debug.log")));
    }

    #[test]
    fn test_bad_file_values() {
        let file: FileConfig = toml::from_str(r#"since = "soon""#).unwrap();
        assert!(Settings::merge(&args(&[]), file, false).is_err());

        assert!(toml::from_str::<FileConfig>(r#"output = "yaml""#).is_err());
        assert!(toml::from_str::<FileConfig>(r#"colour = true"#).is_err());
    }

    #[test]
    fn test_zero_since_rounds_up() {
        let settings = Settings::merge(&args(&["--since", "0s"]), FileConfig::default(), false).unwrap();
        assert_eq!(settings.since_seconds(), 1);
    }
}
