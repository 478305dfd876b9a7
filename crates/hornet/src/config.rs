//! Daemon configuration.
//!
//! Loaded from a TOML file into a typed tree; every leaf has a default so
//! a minimal file stays minimal. Validation is a separate pass that
//! reports every problem it finds rather than stopping at the first.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::fileinfo::CommandTemplate;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration:\n{}", .problems.join("\n"))]
    Invalid { problems: Vec<String> },
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub hash: HashConfig,
    #[serde(default)]
    pub mover: MoverConfig,
    #[serde(default)]
    pub shipper: ShipperConfig,
    #[serde(default)]
    pub amqp: AmqpConfig,
    #[serde(default)]
    pub slack: SlackConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct WatcherConfig {
    #[serde(default)]
    pub active: bool,
    pub dir: Option<PathBuf>,
    #[serde(default)]
    pub dirs: Vec<PathBuf>,
    /// Directory names excluded from recursive descent.
    #[serde(default)]
    pub ignore_dirs: Vec<String>,
    /// Quiet period in seconds before a file is submitted.
    #[serde(default = "default_file_wait_time")]
    pub file_wait_time: u64,
}

impl WatcherConfig {
    /// Configured roots, `dir` first, deduplicated.
    pub fn roots(&self) -> Vec<PathBuf> {
        let mut seen = HashSet::new();
        self.dir
            .iter()
            .chain(self.dirs.iter())
            .filter(|p| seen.insert((*p).clone()))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SchedulerConfig {
    /// Capacity of every inter-stage queue.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    /// Seconds between pipeline summaries; 0 disables them.
    #[serde(default = "default_summary_interval")]
    pub summary_interval: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            queue_size: default_queue_size(),
            summary_interval: default_summary_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TypeConfig {
    pub name: String,
    /// Filename suffix, written without the leading dot.
    pub match_extension: Option<String>,
    /// Anchored regular expression; named captures become metadata
    /// payload fields.
    pub match_regexp: Option<String>,
    #[serde(default)]
    pub do_hash: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClassifierConfig {
    #[serde(default)]
    pub types: Vec<TypeConfig>,
    /// Extra base paths for sub-path resolution, after the watcher roots.
    #[serde(default)]
    pub base_paths: Vec<PathBuf>,
    /// Per-file cap on queued jobs.
    #[serde(default = "default_max_jobs")]
    pub max_jobs: usize,
    /// Routing target for metadata requests.
    #[serde(default)]
    pub send_to: String,
    #[serde(default)]
    pub send_file_info: bool,
    /// Seconds to wait for the bus sender before giving up.
    #[serde(default = "default_wait_for_sender")]
    pub wait_for_sender: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        ClassifierConfig {
            types: Vec::new(),
            base_paths: Vec::new(),
            max_jobs: default_max_jobs(),
            send_to: String::new(),
            send_file_info: false,
            wait_for_sender: default_wait_for_sender(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct JobConfig {
    pub name: String,
    pub file_type: String,
    pub command: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WorkersConfig {
    #[serde(default = "default_n_workers")]
    pub n_workers: usize,
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        WorkersConfig {
            n_workers: default_n_workers(),
            jobs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HashConfig {
    /// When true, a hashing failure is fatal for the file.
    #[serde(default = "default_true")]
    pub required: bool,
    /// External hashing tool; empty selects the built-in MD5
    /// implementation.
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub cmd_opt: String,
}

impl Default for HashConfig {
    fn default() -> Self {
        HashConfig {
            required: true,
            command: String::new(),
            cmd_opt: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct MoverConfig {
    /// Warm root. The sub-path of each file is mirrored beneath it.
    #[serde(default)]
    pub dest_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct ShipperConfig {
    #[serde(default)]
    pub active: bool,
    /// Cold root, local or on the remote host.
    #[serde(default)]
    pub dest_dir: PathBuf,
    /// Remote host; empty ships locally.
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub username: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AmqpConfig {
    #[serde(default)]
    pub active: bool,
    #[serde(default = "default_broker")]
    pub broker: String,
    #[serde(default = "default_amqp_port")]
    pub port: u16,
    #[serde(default = "default_exchange")]
    pub exchange: String,
    #[serde(default = "default_queue")]
    pub queue: String,
    #[serde(default)]
    pub use_auth: bool,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        AmqpConfig {
            active: false,
            broker: default_broker(),
            port: default_amqp_port(),
            exchange: default_exchange(),
            queue: default_queue(),
            use_auth: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SlackConfig {
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub alerts_channel: String,
    #[serde(default)]
    pub notices_channel: String,
    #[serde(default = "default_slack_username")]
    pub username: String,
}

impl Default for SlackConfig {
    fn default() -> Self {
        SlackConfig {
            active: false,
            alerts_channel: String::new(),
            notices_channel: String::new(),
            username: default_slack_username(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
        }
    }
}

fn default_file_wait_time() -> u64 {
    5
}

fn default_queue_size() -> usize {
    25
}

fn default_summary_interval() -> u64 {
    60
}

fn default_max_jobs() -> usize {
    10
}

fn default_wait_for_sender() -> u64 {
    1
}

fn default_n_workers() -> usize {
    4
}

fn default_true() -> bool {
    true
}

fn default_broker() -> String {
    "localhost".to_string()
}

fn default_amqp_port() -> u16 {
    5672
}

fn default_exchange() -> String {
    "requests".to_string()
}

fn default_queue() -> String {
    "hornet".to_string()
}

fn default_slack_username() -> String {
    "hornet".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load a configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// Check the sanity of the whole tree, collecting every problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.scheduler.queue_size == 0 {
            problems.push("scheduler.queue-size must be > 0".to_string());
        }
        if self.workers.n_workers == 0 {
            problems.push("workers.n-workers must be > 0".to_string());
        }

        if self.watcher.active && self.watcher.roots().is_empty() {
            problems.push("watcher is active but no watch directories were specified".to_string());
        }

        if self.classifier.types.is_empty() {
            problems.push("no classifier types were provided".to_string());
        }
        for (index, type_config) in self.classifier.types.iter().enumerate() {
            if type_config.name.is_empty() {
                problems.push(format!("classifier type {index} is missing its name"));
            }
            if type_config.match_extension.is_none() && type_config.match_regexp.is_none() {
                problems.push(format!(
                    "classifier type <{}> has no tests in use",
                    type_config.name
                ));
            }
            if let Some(pattern) = &type_config.match_regexp {
                if let Err(err) = Regex::new(pattern) {
                    problems.push(format!("invalid regular expression <{pattern}>: {err}"));
                }
            }
        }

        for job in &self.workers.jobs {
            if let Err(err) = CommandTemplate::parse(&job.command) {
                problems.push(format!("job <{}>: {err}", job.name));
            }
            if !self
                .classifier
                .types
                .iter()
                .any(|t| t.name == job.file_type)
            {
                problems.push(format!(
                    "job <{}> names unknown file type <{}>",
                    job.name, job.file_type
                ));
            }
        }

        if self.mover.dest_dir.as_os_str().is_empty() {
            problems.push("mover.dest-dir is not set".to_string());
        }
        if self.shipper.active && self.shipper.dest_dir.as_os_str().is_empty() {
            problems.push("shipper is active but shipper.dest-dir is not set".to_string());
        }

        if self.amqp.active {
            if self.amqp.broker.is_empty() {
                problems.push("amqp.broker is not set".to_string());
            }
            if self.amqp.exchange.is_empty() {
                problems.push("amqp.exchange is not set".to_string());
            }
            if self.amqp.queue.is_empty() {
                problems.push("amqp.queue is not set".to_string());
            }
        }
        if self.classifier.send_file_info && !self.amqp.active {
            problems.push(
                "classifier.send-file-info requires the AMQP bus to be active".to_string(),
            );
        }
        if self.classifier.send_file_info && self.classifier.send_to.is_empty() {
            problems.push("classifier.send-file-info requires classifier.send-to".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid { problems })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
            [watcher]
            active = true
            dir = "/data/hot"

            [[classifier.types]]
            name = "raw"
            match-extension = "dat"
            do-hash = true

            [mover]
            dest-dir = "/data/warm"
        "#
    }

    #[test]
    fn minimal_config_parses_and_validates() {
        let config: Config = toml::from_str(minimal_toml()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.scheduler.queue_size, 25);
        assert_eq!(config.workers.n_workers, 4);
        assert_eq!(config.watcher.file_wait_time, 5);
        assert!(config.hash.required);
        assert!(!config.amqp.active);
    }

    #[test]
    fn watcher_roots_merge_and_deduplicate() {
        let config: Config = toml::from_str(
            r#"
                [watcher]
                active = true
                dir = "/a"
                dirs = ["/b", "/a"]
                [[classifier.types]]
                name = "raw"
                match-extension = "dat"
                [mover]
                dest-dir = "/warm"
            "#,
        )
        .unwrap();
        assert_eq!(
            config.watcher.roots(),
            vec![PathBuf::from("/a"), PathBuf::from("/b")]
        );
    }

    #[test]
    fn type_without_tests_is_invalid() {
        let config: Config = toml::from_str(
            r#"
                [[classifier.types]]
                name = "raw"
                [mover]
                dest-dir = "/warm"
            "#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("no tests in use"));
    }

    #[test]
    fn bad_regex_and_bad_job_are_both_reported() {
        let config: Config = toml::from_str(
            r#"
                [[classifier.types]]
                name = "raw"
                match-regexp = "["
                [[workers.jobs]]
                name = "broken"
                file-type = "nope"
                command = "echo {{.Bogus}}"
                [mover]
                dest-dir = "/warm"
            "#,
        )
        .unwrap();
        let message = config.validate().unwrap_err().to_string();
        assert!(message.contains("invalid regular expression"));
        assert!(message.contains("unknown template field"));
        assert!(message.contains("unknown file type"));
    }

    #[test]
    fn zero_queue_size_is_invalid() {
        let config: Config = toml::from_str(
            r#"
                [scheduler]
                queue-size = 0
                [[classifier.types]]
                name = "raw"
                match-extension = "dat"
                [mover]
                dest-dir = "/warm"
            "#,
        )
        .unwrap();
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("queue-size"));
    }

    #[test]
    fn send_file_info_requires_active_bus() {
        let config: Config = toml::from_str(
            r#"
                [[classifier.types]]
                name = "raw"
                match-extension = "dat"
                [classifier]
                send-file-info = true
                send-to = "database"
                [mover]
                dest-dir = "/warm"
            "#,
        )
        .unwrap();
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("AMQP bus"));
    }

    #[test]
    fn empty_watcher_roots_are_fatal_when_active() {
        let config: Config = toml::from_str(
            r#"
                [watcher]
                active = true
                [[classifier.types]]
                name = "raw"
                match-extension = "dat"
                [mover]
                dest-dir = "/warm"
            "#,
        )
        .unwrap();
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("no watch directories"));
    }
}
