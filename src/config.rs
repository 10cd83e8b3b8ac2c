use clap::{Arg, ArgMatches, Command};
use clap::parser::ValueSource;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::pipeline::TaskKind;
use crate::watcher::WatcherKind;

// Default values as constants
pub const DEFAULT_CONFIG_PATH: &str = "/etc/killswitch/config.toml";
pub const DEFAULT_IDENTIFIER: &str = "K";
pub const DEFAULT_DISMOUNT_TIMEOUT: u64 = 15;
pub const DEFAULT_ENCRYPTED_DISMOUNT_TIMEOUT: u64 = 30;
pub const DEFAULT_ENCRYPTED_DISMOUNT_COMMAND: &str = "veracrypt --text --non-interactive -d";
pub const DEFAULT_CUSTOM_COMMAND_TIMEOUT: u64 = 30;
pub const DEFAULT_OVERWRITE_PASSES: u32 = 10;
pub const DEFAULT_SHUTDOWN_MODE: &str = "immediate";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_LOG_FILE: &str = "/var/log/killswitch.log";
pub const DEFAULT_VERBOSE: bool = false;
pub const DEFAULT_USE_SYSLOG: bool = true;
pub const DEFAULT_SYSLOG_FACILITY: &str = "daemon";
pub const DEFAULT_JSON_EVENTS: bool = false;

// String representations for numeric defaults (for clap)
const DEFAULT_DISMOUNT_TIMEOUT_STR: &str = "15";
const DEFAULT_ENCRYPTED_DISMOUNT_TIMEOUT_STR: &str = "30";
const DEFAULT_CUSTOM_COMMAND_TIMEOUT_STR: &str = "30";
const DEFAULT_OVERWRITE_PASSES_STR: &str = "10";
const DEFAULT_POLL_INTERVAL_MS_STR: &str = "1000";

/// Upper bound for every time budget and for the poll interval.
pub const MAX_BUDGET: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownMode {
    /// Orderly `shutdown -h now`.
    Immediate,
    /// `poweroff -f`, skipping service shutdown.
    Forced,
}

impl FromStr for ShutdownMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "immediate" => Ok(ShutdownMode::Immediate),
            "forced" | "force" => Ok(ShutdownMode::Forced),
            other => Err(format!("unknown shutdown mode '{}' (expected immediate or forced)", other)),
        }
    }
}

impl std::fmt::Display for ShutdownMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownMode::Immediate => write!(f, "immediate"),
            ShutdownMode::Forced => write!(f, "forced"),
        }
    }
}

/// Everything one armed run needs. Captured by value when a watcher is
/// armed and never changed afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct Configuration {
    pub identifier: String,
    pub tasks: BTreeSet<TaskKind>,
    pub custom_commands: Vec<String>,
    pub processes: Vec<String>,
    pub files: Vec<PathBuf>,
    /// Devices or mount points to dismount; empty means every removable volume.
    pub volumes: Vec<String>,
    pub dismount_timeout: Duration,
    pub encrypted_dismount_timeout: Duration,
    pub encrypted_dismount_command: String,
    pub custom_command_timeout: Duration,
    pub overwrite_passes: u32,
    pub shutdown_mode: ShutdownMode,
    pub poll_interval: Duration,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            identifier: DEFAULT_IDENTIFIER.to_string(),
            tasks: BTreeSet::new(),
            custom_commands: Vec::new(),
            processes: Vec::new(),
            files: Vec::new(),
            volumes: Vec::new(),
            dismount_timeout: Duration::from_secs(DEFAULT_DISMOUNT_TIMEOUT),
            encrypted_dismount_timeout: Duration::from_secs(DEFAULT_ENCRYPTED_DISMOUNT_TIMEOUT),
            encrypted_dismount_command: DEFAULT_ENCRYPTED_DISMOUNT_COMMAND.to_string(),
            custom_command_timeout: Duration::from_secs(DEFAULT_CUSTOM_COMMAND_TIMEOUT),
            overwrite_passes: DEFAULT_OVERWRITE_PASSES,
            shutdown_mode: ShutdownMode::Immediate,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }
}

impl Configuration {
    pub fn with_tasks<I: IntoIterator<Item = TaskKind>>(mut self, tasks: I) -> Self {
        self.tasks = tasks.into_iter().collect();
        self
    }

    /// Checked when a watcher is armed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tasks.is_empty() {
            return Err(ConfigError::NoTaskSelected);
        }
        if self.identifier.trim().is_empty() {
            return Err(ConfigError::InvalidValue { field: "identifier", reason: "must not be empty".into() });
        }

        let durations = [
            ("dismount_timeout", self.dismount_timeout),
            ("encrypted_dismount_timeout", self.encrypted_dismount_timeout),
            ("custom_command_timeout", self.custom_command_timeout),
            ("poll_interval", self.poll_interval),
        ];
        for (field, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::InvalidValue { field, reason: "must be greater than zero".into() });
            }
            if value > MAX_BUDGET {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: format!("must not exceed {}s", MAX_BUDGET.as_secs()),
                });
            }
        }

        if self.overwrite_passes == 0 {
            return Err(ConfigError::InvalidValue { field: "overwrite_passes", reason: "must be greater than zero".into() });
        }
        Ok(())
    }
}

/// Verify a file can be written, creating it if it doesn't exist
pub fn verify_writable(path: &Path) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            return Err(format!("Parent directory does not exist: {}", parent.display()).into());
        }
    }

    match OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
    {
        Ok(_) => Ok(()),
        Err(e) => {
            let msg = match e.kind() {
                ErrorKind::PermissionDenied => format!("Permission denied writing to file: {}", path.display()),
                _ => format!("Cannot write to file {}: {}", path.display(), e),
            };
            Err(msg.into())
        }
    }
}

/// Verify configuration paths are accessible
pub fn verify_config_paths(config: &SwitchConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if let Some(log_file) = &config.log_file {
        verify_writable(log_file)
            .map_err(|e| format!("Log file error: {}", e))?;
    }

    if config.arm.is_empty() {
        return Err("No watcher to arm (use --arm identifier and/or --arm inventory)".into());
    }

    Ok(())
}

/// Split a `;`-delimited list, trimming entries and dropping blanks.
pub fn parse_delimited_list(list: &str) -> Vec<String> {
    list.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Macro to check and override config values from command line
macro_rules! override_if_present {
    // For string values
    ($matches:expr, $option:expr, $target:expr, string) => {
        if $matches.value_source($option) == Some(ValueSource::CommandLine) {
            if let Some(value) = $matches.get_one::<String>($option) {
                $target = Some(value.to_string());
            }
        }
    };

    // For boolean flags with 'no-' version
    ($matches:expr, $option:expr, $target:expr, flag-yn) => {
        if $matches.value_source($option) == Some(ValueSource::CommandLine) {
            $target = Some(true);
        } else if $matches.value_source(concat!("no-", $option)) == Some(ValueSource::CommandLine) {
            $target = Some(false);
        }
    };

    // For Vec<String>
    ($matches:expr, $option:expr, $target:expr, vec_string) => {
        if $matches.value_source($option) == Some(ValueSource::CommandLine) {
            if let Some(values) = $matches.get_many::<String>($option) {
                $target = Some(values.map(|s| s.to_string()).collect());
            }
        }
    };

    // For ';'-delimited lists, possibly given several times
    ($matches:expr, $option:expr, $target:expr, delimited) => {
        if $matches.value_source($option) == Some(ValueSource::CommandLine) {
            if let Some(values) = $matches.get_many::<String>($option) {
                $target = Some(values.flat_map(|s| parse_delimited_list(s)).collect());
            }
        }
    };

    // For values clap already parsed
    ($matches:expr, $option:expr, $target:expr, $type:ty) => {
        if $matches.value_source($option) == Some(ValueSource::CommandLine) {
            if let Some(value) = $matches.get_one::<$type>($option) {
                $target = Some(*value);
            }
        }
    };
}

/// Configuration file structure for TOML parsing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    pub identifier: Option<String>,
    pub tasks: Option<Vec<String>>,
    pub commands: Option<Vec<String>>,
    pub processes: Option<Vec<String>>,
    pub files: Option<Vec<String>>,
    pub volumes: Option<Vec<String>>,
    pub dismount_timeout: Option<u64>,
    pub encrypted_dismount_timeout: Option<u64>,
    pub encrypted_dismount_command: Option<String>,
    pub custom_command_timeout: Option<u64>,
    pub overwrite_passes: Option<u32>,
    pub shutdown_mode: Option<String>,
    pub poll_interval_ms: Option<u64>,
    pub arm: Option<Vec<String>>,
    pub log_file: Option<String>,
    pub verbose: Option<bool>,
    pub use_syslog: Option<bool>,
    pub syslog_facility: Option<String>,
    pub json_events: Option<bool>,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            identifier: Some(DEFAULT_IDENTIFIER.to_string()),
            tasks: Some(vec![
                TaskKind::DismountRemovable.to_string(),
                TaskKind::LockComputer.to_string(),
            ]),
            commands: Some(Vec::new()),
            processes: Some(Vec::new()),
            files: Some(Vec::new()),
            volumes: Some(Vec::new()),
            dismount_timeout: Some(DEFAULT_DISMOUNT_TIMEOUT),
            encrypted_dismount_timeout: Some(DEFAULT_ENCRYPTED_DISMOUNT_TIMEOUT),
            encrypted_dismount_command: Some(DEFAULT_ENCRYPTED_DISMOUNT_COMMAND.to_string()),
            custom_command_timeout: Some(DEFAULT_CUSTOM_COMMAND_TIMEOUT),
            overwrite_passes: Some(DEFAULT_OVERWRITE_PASSES),
            shutdown_mode: Some(DEFAULT_SHUTDOWN_MODE.to_string()),
            poll_interval_ms: Some(DEFAULT_POLL_INTERVAL_MS),
            arm: Some(vec![WatcherKind::Identifier.to_string()]),
            log_file: Some(DEFAULT_LOG_FILE.to_string()),
            verbose: Some(DEFAULT_VERBOSE),
            use_syslog: Some(DEFAULT_USE_SYSLOG),
            syslog_facility: Some(DEFAULT_SYSLOG_FACILITY.to_string()),
            json_events: Some(DEFAULT_JSON_EVENTS),
        }
    }
}

/// Runtime configuration of the daemon
#[derive(Debug, Clone)]
pub struct SwitchConfig {
    pub response: Configuration,
    pub arm: Vec<WatcherKind>,
    pub log_file: Option<PathBuf>,
    pub verbose: bool,
    pub use_syslog: bool,
    pub syslog_facility: String,
    pub json_events: bool,
}

/// Builder for merging configuration from file and command line
pub struct ConfigBuilder {
    config_file: Option<ConfigFile>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config_file: None,
        }
    }

    pub fn load_config_file(mut self, path: &str) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let content = std::fs::read_to_string(path)?;
        let config: ConfigFile = toml::from_str(&content)?;
        self.config_file = Some(config);
        Ok(self)
    }

    pub fn save_config_file(self, path: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut output = String::from("# Kill Switch Configuration File\n");
        output.push_str("# \n");
        output.push_str(&toml::to_string_pretty(&self.config_file)?);
        fs::write(path, output)?;
        Ok(())
    }

    pub fn merge_command_line(mut self, matches: &ArgMatches) -> Self {
        if let Some(file_config) = &mut self.config_file {
            // Override config file values with command line arguments if provided

            // String overrides
            override_if_present!(matches, "identifier", file_config.identifier, string);
            override_if_present!(matches, "encrypted-command", file_config.encrypted_dismount_command, string);
            override_if_present!(matches, "shutdown-mode", file_config.shutdown_mode, string);
            override_if_present!(matches, "log-file", file_config.log_file, string);
            override_if_present!(matches, "syslog-facility", file_config.syslog_facility, string);

            // Numeric overrides
            override_if_present!(matches, "dismount-timeout", file_config.dismount_timeout, u64);
            override_if_present!(matches, "encrypted-timeout", file_config.encrypted_dismount_timeout, u64);
            override_if_present!(matches, "command-timeout", file_config.custom_command_timeout, u64);
            override_if_present!(matches, "passes", file_config.overwrite_passes, u32);
            override_if_present!(matches, "poll-interval", file_config.poll_interval_ms, u64);

            // Boolean flags
            override_if_present!(matches, "verbose", file_config.verbose, flag-yn);
            override_if_present!(matches, "syslog", file_config.use_syslog, flag-yn);
            override_if_present!(matches, "json-events", file_config.json_events, flag-yn);

            // Vector overrides
            override_if_present!(matches, "task", file_config.tasks, vec_string);
            override_if_present!(matches, "command", file_config.commands, vec_string);
            override_if_present!(matches, "process", file_config.processes, vec_string);
            override_if_present!(matches, "arm", file_config.arm, vec_string);
            override_if_present!(matches, "files", file_config.files, delimited);
            override_if_present!(matches, "volumes", file_config.volumes, delimited);
        } else {
            // No config file, create one from command line args
            let mut file_config = ConfigFile::default();
            file_config.log_file = None;

            if let Some(identifier) = matches.get_one::<String>("identifier") {
                file_config.identifier = Some(identifier.to_string());
            }

            if let Some(tasks) = matches.get_many::<String>("task") {
                file_config.tasks = Some(tasks.map(|s| s.to_string()).collect());
            }

            if let Some(commands) = matches.get_many::<String>("command") {
                file_config.commands = Some(commands.map(|s| s.to_string()).collect());
            }

            if let Some(processes) = matches.get_many::<String>("process") {
                file_config.processes = Some(processes.map(|s| s.to_string()).collect());
            }

            if let Some(files) = matches.get_many::<String>("files") {
                file_config.files = Some(files.flat_map(|s| parse_delimited_list(s)).collect());
            }

            if let Some(volumes) = matches.get_many::<String>("volumes") {
                file_config.volumes = Some(volumes.flat_map(|s| parse_delimited_list(s)).collect());
            }

            if let Some(timeout) = matches.get_one::<u64>("dismount-timeout") {
                file_config.dismount_timeout = Some(*timeout);
            }

            if let Some(timeout) = matches.get_one::<u64>("encrypted-timeout") {
                file_config.encrypted_dismount_timeout = Some(*timeout);
            }

            if let Some(command) = matches.get_one::<String>("encrypted-command") {
                file_config.encrypted_dismount_command = Some(command.to_string());
            }

            if let Some(timeout) = matches.get_one::<u64>("command-timeout") {
                file_config.custom_command_timeout = Some(*timeout);
            }

            if let Some(passes) = matches.get_one::<u32>("passes") {
                file_config.overwrite_passes = Some(*passes);
            }

            if let Some(mode) = matches.get_one::<String>("shutdown-mode") {
                file_config.shutdown_mode = Some(mode.to_string());
            }

            if let Some(interval) = matches.get_one::<u64>("poll-interval") {
                file_config.poll_interval_ms = Some(*interval);
            }

            if let Some(arm) = matches.get_many::<String>("arm") {
                file_config.arm = Some(arm.map(|s| s.to_string()).collect());
            }

            if let Some(path) = matches.get_one::<String>("log-file") {
                file_config.log_file = Some(path.to_string());
            }

            if matches.get_flag("verbose") {
                file_config.verbose = Some(true);
            }

            if matches.get_flag("no-syslog") {
                file_config.use_syslog = Some(false);
            }

            if let Some(facility) = matches.get_one::<String>("syslog-facility") {
                file_config.syslog_facility = Some(facility.to_string());
            }

            if matches.get_flag("json-events") {
                file_config.json_events = Some(true);
            }

            self.config_file = Some(file_config);
        }

        self
    }

    pub fn build(self) -> Result<SwitchConfig, Box<dyn std::error::Error + Send + Sync>> {
        let file_config = self.config_file.unwrap_or_default();

        let tasks = file_config.tasks
            .unwrap_or_default()
            .iter()
            .map(|t| t.parse::<TaskKind>())
            .collect::<Result<BTreeSet<_>, _>>()?;

        let arm = file_config.arm
            .unwrap_or_else(|| vec![WatcherKind::Identifier.to_string()])
            .iter()
            .map(|w| w.parse::<WatcherKind>())
            .collect::<Result<Vec<_>, _>>()?;
        let mut unique_arm = Vec::new();
        for kind in arm {
            if !unique_arm.contains(&kind) {
                unique_arm.push(kind);
            }
        }

        let response = Configuration {
            identifier: file_config.identifier.unwrap_or_else(|| DEFAULT_IDENTIFIER.to_string()),
            tasks,
            custom_commands: clean_list(file_config.commands),
            processes: clean_list(file_config.processes),
            files: clean_list(file_config.files).into_iter().map(PathBuf::from).collect(),
            volumes: clean_list(file_config.volumes),
            dismount_timeout: Duration::from_secs(file_config.dismount_timeout.unwrap_or(DEFAULT_DISMOUNT_TIMEOUT)),
            encrypted_dismount_timeout: Duration::from_secs(
                file_config.encrypted_dismount_timeout.unwrap_or(DEFAULT_ENCRYPTED_DISMOUNT_TIMEOUT),
            ),
            encrypted_dismount_command: file_config.encrypted_dismount_command
                .unwrap_or_else(|| DEFAULT_ENCRYPTED_DISMOUNT_COMMAND.to_string()),
            custom_command_timeout: Duration::from_secs(
                file_config.custom_command_timeout.unwrap_or(DEFAULT_CUSTOM_COMMAND_TIMEOUT),
            ),
            overwrite_passes: file_config.overwrite_passes.unwrap_or(DEFAULT_OVERWRITE_PASSES),
            shutdown_mode: file_config.shutdown_mode
                .as_deref()
                .unwrap_or(DEFAULT_SHUTDOWN_MODE)
                .parse()?,
            poll_interval: Duration::from_millis(file_config.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS)),
        };

        // Bad budgets fail here rather than at arm time
        match response.validate() {
            Ok(()) | Err(ConfigError::NoTaskSelected) => {}
            Err(e) => return Err(e.into()),
        }

        Ok(SwitchConfig {
            response,
            arm: unique_arm,
            log_file: file_config.log_file.map(PathBuf::from),
            verbose: file_config.verbose.unwrap_or(DEFAULT_VERBOSE),
            use_syslog: file_config.use_syslog.unwrap_or(DEFAULT_USE_SYSLOG),
            syslog_facility: file_config.syslog_facility.unwrap_or_else(|| DEFAULT_SYSLOG_FACILITY.to_string()),
            json_events: file_config.json_events.unwrap_or(DEFAULT_JSON_EVENTS),
        })
    }
}

fn clean_list(list: Option<Vec<String>>) -> Vec<String> {
    list.unwrap_or_default()
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Generate example configuration file content
pub fn generate_example_config() -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
    let example_config = ConfigFile::default();

    let mut output = String::from("# Kill Switch Configuration File\n");
    output.push_str("# \n");
    output.push_str("# This is an example configuration with default values.\n");
    output.push_str("# Tasks: dismount-encrypted, dismount-removable, end-processes, delete-files,\n");
    output.push_str("#        overwrite-files, turn-off-screen, lock-computer, shutdown\n");
    output.push_str("# Watchers (arm): identifier, inventory\n");
    output.push_str("# Command line arguments will override these settings.\n\n");

    output.push_str(&toml::to_string_pretty(&example_config)?);

    Ok(output)
}

/// Whether a config file should be loaded: always when given explicitly,
/// otherwise only if the default file exists.
pub fn config_file_requested(matches: &ArgMatches) -> Option<String> {
    let path = matches.get_one::<String>("config")?;
    if matches.value_source("config") == Some(ValueSource::CommandLine) || File::open(path).is_ok() {
        Some(path.clone())
    } else {
        None
    }
}

/// Build the command line interface
pub fn build_cli() -> Command {
    Command::new("killswitch")
        .version("1.0")
        .about("Dead man's switch for removable storage: runs a response when a USB drive is pulled")
        .arg(Arg::new("config")
             .short('c')
             .long("config")
             .value_name("FILE")
             .help("Configuration file path (TOML format)")
             .default_value(DEFAULT_CONFIG_PATH))
        .arg(Arg::new("generate-config")
             .long("generate-config")
             .value_name("FILE")
             .help(format!("Generate example configuration file (defaults to {})", DEFAULT_CONFIG_PATH))
             .num_args(0..=1)
             .default_missing_value(DEFAULT_CONFIG_PATH)
             .action(clap::ArgAction::Set))
        .arg(Arg::new("merge-config")
             .long("merge-config")
             .help("Merge configuration file with command line and exit")
             .action(clap::ArgAction::SetTrue))
        .arg(Arg::new("identifier")
             .short('i')
             .long("identifier")
             .value_name("LABEL")
             .help("Label of the volume whose removal trips the switch")
             .default_value(DEFAULT_IDENTIFIER))
        .arg(Arg::new("arm")
             .short('a')
             .long("arm")
             .value_name("WATCHER")
             .help("Watcher to arm: identifier or inventory (repeatable)")
             .action(clap::ArgAction::Append))
        .arg(Arg::new("task")
             .short('t')
             .long("task")
             .value_name("TASK")
             .help("Task to run when triggered (repeatable)")
             .action(clap::ArgAction::Append))
        .arg(Arg::new("command")
             .long("command")
             .value_name("COMMAND")
             .help("Custom shell command to run when triggered (repeatable)")
             .action(clap::ArgAction::Append))
        .arg(Arg::new("process")
             .long("process")
             .value_name("NAME")
             .help("Process to kill when triggered (repeatable)")
             .action(clap::ArgAction::Append))
        .arg(Arg::new("files")
             .long("files")
             .value_name("PATHS")
             .help("Files to delete or overwrite, separated by ';'")
             .action(clap::ArgAction::Append))
        .arg(Arg::new("volumes")
             .long("volumes")
             .value_name("VOLUMES")
             .help("Devices or mount points to dismount, separated by ';' (default: all removable)")
             .action(clap::ArgAction::Append))
        .arg(Arg::new("dismount-timeout")
             .long("dismount-timeout")
             .value_name("SECONDS")
             .help("Time budget for dismounting removable volumes")
             .value_parser(clap::value_parser!(u64))
             .default_value(DEFAULT_DISMOUNT_TIMEOUT_STR))
        .arg(Arg::new("encrypted-timeout")
             .long("encrypted-timeout")
             .value_name("SECONDS")
             .help("Time budget for dismounting encrypted volumes")
             .value_parser(clap::value_parser!(u64))
             .default_value(DEFAULT_ENCRYPTED_DISMOUNT_TIMEOUT_STR))
        .arg(Arg::new("encrypted-command")
             .long("encrypted-command")
             .value_name("COMMAND")
             .help("Command that dismounts all encrypted volumes")
             .default_value(DEFAULT_ENCRYPTED_DISMOUNT_COMMAND))
        .arg(Arg::new("command-timeout")
             .long("command-timeout")
             .value_name("SECONDS")
             .help("Time budget for each custom command")
             .value_parser(clap::value_parser!(u64))
             .default_value(DEFAULT_CUSTOM_COMMAND_TIMEOUT_STR))
        .arg(Arg::new("passes")
             .long("passes")
             .value_name("COUNT")
             .help("Overwrite passes for overwrite-files")
             .value_parser(clap::value_parser!(u32))
             .default_value(DEFAULT_OVERWRITE_PASSES_STR))
        .arg(Arg::new("shutdown-mode")
             .long("shutdown-mode")
             .value_name("MODE")
             .help("immediate (shutdown -h now) or forced (poweroff -f)")
             .default_value(DEFAULT_SHUTDOWN_MODE))
        .arg(Arg::new("poll-interval")
             .long("poll-interval")
             .value_name("MILLISECONDS")
             .help("Watcher tick interval")
             .value_parser(clap::value_parser!(u64))
             .default_value(DEFAULT_POLL_INTERVAL_MS_STR))
        .arg(Arg::new("log-file")
             .long("log-file")
             .value_name("FILE")
             .help("Log to this file instead of syslog"))
        .arg(Arg::new("verbose")
             .short('v')
             .long("verbose")
             .help("Verbose output")
             .action(clap::ArgAction::SetTrue))
        .arg(Arg::new("no-verbose")
             .long("no-verbose")
             .help("Disable verbose output")
             .action(clap::ArgAction::SetTrue)
             .conflicts_with("verbose"))
        .arg(Arg::new("syslog")
             .long("syslog")
             .help("Enable syslog logging")
             .action(clap::ArgAction::SetTrue))
        .arg(Arg::new("no-syslog")
             .long("no-syslog")
             .help("Disable syslog logging")
             .action(clap::ArgAction::SetTrue)
             .conflicts_with("syslog"))
        .arg(Arg::new("syslog-facility")
             .long("syslog-facility")
             .value_name("FACILITY")
             .help("Syslog facility (daemon, user, local0-local7)")
             .default_value(DEFAULT_SYSLOG_FACILITY))
        .arg(Arg::new("json-events")
             .long("json-events")
             .help("Print events as JSON lines on stdout")
             .action(clap::ArgAction::SetTrue))
        .arg(Arg::new("no-json-events")
             .long("no-json-events")
             .help("Print events as plain text")
             .action(clap::ArgAction::SetTrue)
             .conflicts_with("json-events"))
        .arg(Arg::new("list-volumes")
             .long("list-volumes")
             .help("List mounted volumes with their classification and exit")
             .action(clap::ArgAction::SetTrue))
        .arg(Arg::new("check-identifier")
             .long("check-identifier")
             .help("Report whether the identifier volume is mounted and exit")
             .action(clap::ArgAction::SetTrue))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    /// Helper function to create a test config file
    fn create_test_config_file(dir: &TempDir, content: &str) -> PathBuf {
        let config_path = dir.path().join("test_config.toml");
        fs::write(&config_path, content).unwrap();
        config_path
    }

    /// Helper function to parse command line args
    fn parse_args(args: Vec<&str>) -> ArgMatches {
        let cmd = build_cli();
        cmd.try_get_matches_from(args).unwrap()
    }

    fn build_from(config_path: &Path, args: Vec<&str>) -> SwitchConfig {
        let matches = parse_args(args);
        ConfigBuilder::new()
            .load_config_file(config_path.to_str().unwrap())
            .unwrap()
            .merge_command_line(&matches)
            .build()
            .unwrap()
    }

    #[test]
    fn test_file_values_are_loaded() {
        let temp_dir = TempDir::new().unwrap();
        let config_content = r#"
            identifier = "VAULT"
            tasks = ["shutdown", "delete-files", "dismount-removable"]
            files = ["/tmp/a.txt", "  ", "/tmp/b.txt"]
            processes = ["firefox"]
            shutdown_mode = "forced"
            overwrite_passes = 3
            arm = ["identifier", "inventory", "identifier"]
        "#;
        let config_path = create_test_config_file(&temp_dir, config_content);

        let config = build_from(&config_path, vec!["killswitch", "--config", config_path.to_str().unwrap()]);

        assert_eq!(config.response.identifier, "VAULT");
        let tasks: Vec<TaskKind> = config.response.tasks.iter().copied().collect();
        assert_eq!(tasks, vec![TaskKind::DismountRemovable, TaskKind::DeleteFiles, TaskKind::Shutdown]);
        assert_eq!(config.response.files, vec![PathBuf::from("/tmp/a.txt"), PathBuf::from("/tmp/b.txt")]);
        assert_eq!(config.response.processes, vec!["firefox"]);
        assert_eq!(config.response.shutdown_mode, ShutdownMode::Forced);
        assert_eq!(config.response.overwrite_passes, 3);
        assert_eq!(config.arm, vec![WatcherKind::Identifier, WatcherKind::Inventory]);
    }

    #[test]
    fn test_command_line_overrides_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_content = r#"
            identifier = "VAULT"
            tasks = ["lock-computer"]
            dismount_timeout = 20
            custom_command_timeout = 45
            verbose = false
        "#;
        let config_path = create_test_config_file(&temp_dir, config_content);

        let config = build_from(&config_path, vec![
            "killswitch",
            "--config", config_path.to_str().unwrap(),
            "--identifier", "KEY",
            "--task", "end-processes",
            "--task", "turn-off-screen",
            "--dismount-timeout", "5",
            "--verbose",
        ]);

        assert_eq!(config.response.identifier, "KEY");
        assert_eq!(config.response.tasks.len(), 2);
        assert!(config.response.tasks.contains(&TaskKind::EndProcesses));
        assert_eq!(config.response.dismount_timeout, Duration::from_secs(5));
        // untouched by the command line
        assert_eq!(config.response.custom_command_timeout, Duration::from_secs(45));
        assert!(config.verbose);
    }

    #[test]
    fn test_delimited_lists_from_command_line() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = create_test_config_file(&temp_dir, "files = [\"/old\"]\n");

        let config = build_from(&config_path, vec![
            "killswitch",
            "--config", config_path.to_str().unwrap(),
            "--files", "/home/a/secret.txt; /home/a/keys.kdbx;",
            "--files", "/tmp/c",
            "--volumes", "/dev/sdb1;/media/alice/STICK",
        ]);

        assert_eq!(config.response.files, vec![
            PathBuf::from("/home/a/secret.txt"),
            PathBuf::from("/home/a/keys.kdbx"),
            PathBuf::from("/tmp/c"),
        ]);
        assert_eq!(config.response.volumes, vec!["/dev/sdb1", "/media/alice/STICK"]);
    }

    #[test]
    fn test_no_config_file_with_cli_args() {
        let args = vec![
            "killswitch",
            "--task", "shutdown",
            "--arm", "inventory",
            "--passes", "4",
            "--no-syslog",
            "--json-events",
        ];
        let matches = parse_args(args);

        let config = ConfigBuilder::new()
            .merge_command_line(&matches)
            .build()
            .unwrap();

        assert_eq!(config.response.tasks.iter().copied().collect::<Vec<_>>(), vec![TaskKind::Shutdown]);
        assert_eq!(config.arm, vec![WatcherKind::Inventory]);
        assert_eq!(config.response.overwrite_passes, 4);
        assert_eq!(config.response.identifier, DEFAULT_IDENTIFIER);
        assert!(!config.use_syslog);
        assert!(config.json_events);
        assert_eq!(config.log_file, None);
    }

    #[test]
    fn test_unknown_task_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = create_test_config_file(&temp_dir, "tasks = [\"format-disk\"]\n");
        let matches = parse_args(vec!["killswitch", "--config", config_path.to_str().unwrap()]);

        let result = ConfigBuilder::new()
            .load_config_file(config_path.to_str().unwrap())
            .unwrap()
            .merge_command_line(&matches)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_budget_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = create_test_config_file(&temp_dir, "tasks = [\"shutdown\"]\npoll_interval_ms = 0\n");
        let matches = parse_args(vec!["killswitch", "--config", config_path.to_str().unwrap()]);

        let result = ConfigBuilder::new()
            .load_config_file(config_path.to_str().unwrap())
            .unwrap()
            .merge_command_line(&matches)
            .build();
        let message = result.err().unwrap().to_string();
        assert!(message.contains("poll_interval"));
    }

    #[test]
    fn test_oversized_budget_is_rejected() {
        let mut config = Configuration::default().with_tasks([TaskKind::DismountRemovable, TaskKind::Shutdown]);
        config.dismount_timeout = Duration::from_secs(i64::MAX as u64);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "dismount_timeout", .. })
        ));

        config.dismount_timeout = MAX_BUDGET;
        assert_eq!(config.validate(), Ok(()));

        let temp_dir = TempDir::new().unwrap();
        let config_path = create_test_config_file(&temp_dir, "tasks = [\"shutdown\"]\ncustom_command_timeout = 86400\n");
        let matches = parse_args(vec!["killswitch", "--config", config_path.to_str().unwrap()]);
        let result = ConfigBuilder::new()
            .load_config_file(config_path.to_str().unwrap())
            .unwrap()
            .merge_command_line(&matches)
            .build();
        let message = result.err().unwrap().to_string();
        assert!(message.contains("custom_command_timeout"));
        assert!(message.contains("3600"));
    }

    #[test]
    fn test_unparsable_numbers_are_rejected() {
        for (flag, value) in [("--passes", "abc"), ("--dismount-timeout", "-5"), ("--poll-interval", "1s")] {
            let result = build_cli().try_get_matches_from(vec!["killswitch", "-t", "shutdown", flag, value]);
            assert!(result.is_err(), "{} {} was accepted", flag, value);
        }

        let matches = parse_args(vec!["killswitch", "-t", "shutdown", "--passes", "3"]);
        let config = ConfigBuilder::new().merge_command_line(&matches).build().unwrap();
        assert_eq!(config.response.overwrite_passes, 3);
    }

    #[test]
    fn test_empty_selection_builds_but_does_not_validate() {
        let matches = parse_args(vec!["killswitch"]);
        let config = ConfigBuilder::new().merge_command_line(&matches).build().unwrap();

        // the example defaults select tasks, so clear them
        let response = config.response.with_tasks(Vec::new());
        assert_eq!(response.validate(), Err(ConfigError::NoTaskSelected));
    }

    #[test]
    fn test_generated_example_round_trips() {
        let example = generate_example_config().unwrap();
        let parsed: ConfigFile = toml::from_str(&example).unwrap();
        assert_eq!(parsed.identifier.as_deref(), Some(DEFAULT_IDENTIFIER));
        assert_eq!(parsed.arm, Some(vec!["identifier".to_string()]));
    }

    #[test]
    fn test_parse_delimited_list() {
        assert_eq!(parse_delimited_list("a; b ;;c"), vec!["a", "b", "c"]);
        assert!(parse_delimited_list(" ; ").is_empty());
    }

    #[test]
    fn test_shutdown_mode_parsing() {
        assert_eq!("Immediate".parse::<ShutdownMode>().unwrap(), ShutdownMode::Immediate);
        assert_eq!("forced".parse::<ShutdownMode>().unwrap(), ShutdownMode::Forced);
        assert!("reboot".parse::<ShutdownMode>().is_err());
    }

    #[test]
    fn test_explicit_config_path_is_always_requested() {
        let matches = parse_args(vec!["killswitch", "--config", "/nonexistent/ks.toml"]);
        assert_eq!(config_file_requested(&matches), Some("/nonexistent/ks.toml".to_string()));

        let temp_dir = TempDir::new().unwrap();
        let config_path = create_test_config_file(&temp_dir, "identifier = \"K\"\n");
        let matches = parse_args(vec!["killswitch", "-c", config_path.to_str().unwrap()]);
        assert_eq!(config_file_requested(&matches).as_deref(), config_path.to_str());
    }
}
