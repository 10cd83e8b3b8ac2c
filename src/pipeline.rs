//! The response pipeline: the fixed-order, failure-isolated sequence of
//! actions run once per trigger.

use std::collections::HashSet;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::classifier::{VolumeClass, VolumeClassifier};
use crate::config::{Configuration, ShutdownMode};
use crate::desktop::{self, DesktopEnvironment};
use crate::device::MountRecord;
use crate::error::KillSwitchError;
use crate::host::{EraseMethod, Host, UnmountMode};
use crate::logger::EventLog;
use crate::watcher::WatcherKind;
use crate::worker::{bounded, bounded_io, deadline_after, ENUMERATION_LIMIT};

pub const PROCESS_KILL_LIMIT: Duration = Duration::from_secs(5);
pub const FILE_DELETE_LIMIT: Duration = Duration::from_secs(10);
pub const DESKTOP_COMMAND_LIMIT: Duration = Duration::from_secs(5);
pub const SHUTDOWN_LIMIT: Duration = Duration::from_secs(10);
pub const OVERWRITE_FLOOR: Duration = Duration::from_secs(30);
pub const OVERWRITE_CEILING: Duration = Duration::from_secs(3600);
/// Upper bound for one unmount call, plain or lazy.
pub const UNMOUNT_CALL_LIMIT: Duration = Duration::from_secs(5);

/// Task kinds in execution order. `Shutdown` always runs last, after any
/// custom commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    DismountEncrypted,
    DismountRemovable,
    EndProcesses,
    DeleteFiles,
    OverwriteFiles,
    TurnOffScreen,
    LockComputer,
    Shutdown,
}

impl TaskKind {
    pub const ALL: [TaskKind; 8] = [
        TaskKind::DismountEncrypted,
        TaskKind::DismountRemovable,
        TaskKind::EndProcesses,
        TaskKind::DeleteFiles,
        TaskKind::OverwriteFiles,
        TaskKind::TurnOffScreen,
        TaskKind::LockComputer,
        TaskKind::Shutdown,
    ];

    pub fn name(self) -> &'static str {
        match self {
            TaskKind::DismountEncrypted => "dismount-encrypted",
            TaskKind::DismountRemovable => "dismount-removable",
            TaskKind::EndProcesses => "end-processes",
            TaskKind::DeleteFiles => "delete-files",
            TaskKind::OverwriteFiles => "overwrite-files",
            TaskKind::TurnOffScreen => "turn-off-screen",
            TaskKind::LockComputer => "lock-computer",
            TaskKind::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('_', "-");
        let kind = match normalized.as_str() {
            "dismount-encrypted-volumes" => Some(TaskKind::DismountEncrypted),
            "dismount-removable-volumes" => Some(TaskKind::DismountRemovable),
            "system-shutdown" => Some(TaskKind::Shutdown),
            name => TaskKind::ALL.into_iter().find(|k| k.name() == name),
        };
        kind.ok_or_else(|| format!("unknown task '{}'", s.trim()))
    }
}

/// One entry in a run: a built-in task or a custom command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Step {
    Task(TaskKind),
    Command(String),
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Task(kind) => write!(f, "{}", kind),
            Step::Command(command) => write!(f, "command `{}`", command),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskOutcome {
    Success,
    Failure(String),
    TimedOut,
    /// Nothing to do.
    Skipped(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub step: Step,
    pub outcome: TaskOutcome,
    pub duration: Duration,
}

impl TaskResult {
    pub fn kind(&self) -> Option<TaskKind> {
        match self.step {
            Step::Task(kind) => Some(kind),
            Step::Command(_) => None,
        }
    }
}

/// Why a run was started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerContext {
    pub watcher: WatcherKind,
    pub reason: String,
}

impl TriggerContext {
    pub fn new(watcher: WatcherKind, reason: impl Into<String>) -> Self {
        Self { watcher, reason: reason.into() }
    }
}

/// What a successful task body reports.
enum TaskSummary {
    Done(String),
    Nothing(String),
}

/// Per-run scratch state.
#[derive(Default)]
struct RunState {
    desktop: Option<DesktopEnvironment>,
}

/// Erase budget for a file of `size` bytes: one second per MiB per pass.
pub fn overwrite_limit(size: u64, passes: u32) -> Duration {
    let mib = size.div_ceil(1024 * 1024);
    let secs = mib
        .saturating_mul(u64::from(passes))
        .clamp(OVERWRITE_FLOOR.as_secs(), OVERWRITE_CEILING.as_secs());
    Duration::from_secs(secs)
}

fn shutdown_commands(mode: ShutdownMode) -> &'static [&'static str] {
    match mode {
        ShutdownMode::Immediate => &["shutdown -h now"],
        ShutdownMode::Forced => &["poweroff -f"],
    }
}

fn exit_failure(code: Option<i32>, stderr: &str) -> KillSwitchError {
    let status = match code {
        Some(code) => format!("exit code {}", code),
        None => "terminated by signal".to_string(),
    };
    let stderr = stderr.trim();
    if stderr.is_empty() {
        KillSwitchError::TaskExecution(status)
    } else {
        KillSwitchError::TaskExecution(format!("{}: {}", status, stderr))
    }
}

/// Failures and timeouts gathered over the targets of one task.
#[derive(Default)]
struct Tally {
    done: usize,
    failures: Vec<String>,
    timeout: Option<KillSwitchError>,
}

impl Tally {
    fn fail(&mut self, e: KillSwitchError) {
        if e.is_timeout() {
            if self.timeout.is_none() {
                self.timeout = Some(e);
            } else {
                self.failures.push(e.to_string());
            }
        } else {
            self.failures.push(e.to_string());
        }
    }

    fn finish(self, done: String, nothing: &str) -> Result<TaskSummary, KillSwitchError> {
        if !self.failures.is_empty() {
            let mut reasons = self.failures;
            if let Some(timeout) = self.timeout {
                reasons.push(timeout.to_string());
            }
            return Err(KillSwitchError::TaskExecution(reasons.join("; ")));
        }
        if let Some(timeout) = self.timeout {
            return Err(timeout);
        }
        if self.done == 0 {
            return Ok(TaskSummary::Nothing(nothing.to_string()));
        }
        Ok(TaskSummary::Done(done))
    }
}

pub struct ResponsePipeline {
    host: Arc<dyn Host>,
    classifier: Arc<VolumeClassifier>,
    events: EventLog,
    unmount_limit: Duration,
}

impl ResponsePipeline {
    pub fn new(host: Arc<dyn Host>, classifier: Arc<VolumeClassifier>, events: EventLog) -> Self {
        Self { host, classifier, events, unmount_limit: UNMOUNT_CALL_LIMIT }
    }

    /// Cap each unmount call at `limit` instead of `UNMOUNT_CALL_LIMIT`.
    pub fn with_unmount_limit(mut self, limit: Duration) -> Self {
        self.unmount_limit = limit;
        self
    }

    /// Run every selected task, then the custom commands, then shutdown.
    /// Never fails: each step's failure is recorded in its `TaskResult`.
    pub async fn run(&self, config: &Configuration, trigger: &TriggerContext) -> Vec<TaskResult> {
        let started = Instant::now();
        self.events.log_warning(&format!(
            "Kill switch triggered by {} watcher: {}",
            trigger.watcher, trigger.reason
        ));

        let mut state = RunState::default();
        let mut results = Vec::new();

        for kind in config.tasks.iter().copied().filter(|k| *k != TaskKind::Shutdown) {
            results.push(self.run_task(kind, config, &mut state).await);
        }

        for command in &config.custom_commands {
            results.push(self.run_custom_command(command, config.custom_command_timeout).await);
        }

        if config.tasks.contains(&TaskKind::Shutdown) {
            results.push(self.run_task(TaskKind::Shutdown, config, &mut state).await);
        }

        self.log_summary(&results, started.elapsed());
        results
    }

    async fn run_task(&self, kind: TaskKind, config: &Configuration, state: &mut RunState) -> TaskResult {
        self.events.log_info(&format!("Running task {}", kind));
        let started = Instant::now();

        let result = match kind {
            TaskKind::DismountEncrypted => self.dismount_encrypted(config).await,
            TaskKind::DismountRemovable => self.dismount_removable(config).await,
            TaskKind::EndProcesses => self.end_processes(&config.processes).await,
            TaskKind::DeleteFiles => self.delete_files(&config.files).await,
            TaskKind::OverwriteFiles => self.overwrite_files(&config.files, config.overwrite_passes).await,
            TaskKind::TurnOffScreen => {
                let de = self.desktop(state).await;
                self.first_success("screen off", &de.screen_off_commands(), DESKTOP_COMMAND_LIMIT).await
            }
            TaskKind::LockComputer => {
                let de = self.desktop(state).await;
                self.first_success("lock", &de.lock_commands(), DESKTOP_COMMAND_LIMIT).await
            }
            TaskKind::Shutdown => {
                self.first_success("shutdown", shutdown_commands(config.shutdown_mode), SHUTDOWN_LIMIT).await
            }
        };

        self.record(Step::Task(kind), result, started.elapsed())
    }

    async fn run_custom_command(&self, command: &str, limit: Duration) -> TaskResult {
        self.events.log_info(&format!("Running custom command: {}", command));
        let started = Instant::now();

        let host = self.host.clone();
        let owned = command.to_string();
        let result = match bounded_io(command, limit, move || host.run_command(&owned, limit)).await {
            Ok(output) if output.success() => Ok(TaskSummary::Done("exit code 0".to_string())),
            Ok(output) => Err(exit_failure(output.code, &output.stderr)),
            Err(e) => Err(e),
        };

        self.record(Step::Command(command.to_string()), result, started.elapsed())
    }

    fn record(&self, step: Step, result: Result<TaskSummary, KillSwitchError>, duration: Duration) -> TaskResult {
        let outcome = match result {
            Ok(TaskSummary::Done(detail)) => {
                self.events.log_info(&format!("Task {} completed: {}", step, detail));
                TaskOutcome::Success
            }
            Ok(TaskSummary::Nothing(reason)) => {
                self.events.log_info(&format!("Task {} skipped: {}", step, reason));
                TaskOutcome::Skipped(reason)
            }
            Err(e) if e.is_timeout() => {
                self.events.log_warning(&format!("Task {} timed out: {}", step, e));
                TaskOutcome::TimedOut
            }
            Err(e) => {
                self.events.log_error(&format!("Task {} failed: {}", step, e));
                TaskOutcome::Failure(e.to_string())
            }
        };

        TaskResult { step, outcome, duration }
    }

    fn log_summary(&self, results: &[TaskResult], elapsed: Duration) {
        let (mut succeeded, mut skipped, mut failed, mut timed_out) = (0, 0, 0, 0);
        for result in results {
            match result.outcome {
                TaskOutcome::Success => succeeded += 1,
                TaskOutcome::Skipped(_) => skipped += 1,
                TaskOutcome::Failure(_) => failed += 1,
                TaskOutcome::TimedOut => timed_out += 1,
            }
        }

        self.events.log_info(&format!(
            "Response finished in {:.1}s: {} succeeded, {} skipped, {} failed, {} timed out",
            elapsed.as_secs_f64(),
            succeeded,
            skipped,
            failed,
            timed_out
        ));
    }

    async fn dismount_encrypted(&self, config: &Configuration) -> Result<TaskSummary, KillSwitchError> {
        let host = self.host.clone();
        let command = config.encrypted_dismount_command.clone();
        let limit = config.encrypted_dismount_timeout;

        let output = bounded_io("encrypted volume dismount", limit, move || host.run_command(&command, limit)).await?;
        if output.success() {
            Ok(TaskSummary::Done("encrypted volumes dismounted".to_string()))
        } else {
            Err(exit_failure(output.code, &output.stderr))
        }
    }

    /// Mounted volumes eligible for dismount: the allow-list when one is
    /// configured, otherwise every volume classified as removable.
    async fn dismount_candidates(&self, config: &Configuration) -> Result<Vec<MountRecord>, KillSwitchError> {
        let host = self.host.clone();
        let classifier = self.classifier.clone();
        let allow: HashSet<String> = config.volumes.iter().cloned().collect();

        let mounts = bounded("volume enumeration", ENUMERATION_LIMIT, move || -> io::Result<Vec<MountRecord>> {
            if !allow.is_empty() {
                let mounts = host.mount_table()?;
                return Ok(mounts
                    .into_iter()
                    .filter(|m| allow.contains(&m.device) || allow.contains(&m.mount_point))
                    .collect());
            }

            classifier.refresh();
            let mounts = host.mount_table()?;
            Ok(mounts
                .into_iter()
                .filter(|m| classifier.classify_mount(m) == VolumeClass::Removable)
                .collect())
        })
        .await?;

        mounts.map_err(|e| KillSwitchError::Enumeration(format!("mount table: {}", e)))
    }

    async fn dismount_removable(&self, config: &Configuration) -> Result<TaskSummary, KillSwitchError> {
        let deadline = deadline_after(config.dismount_timeout);
        let candidates = self.dismount_candidates(config).await?;

        let mut tally = Tally::default();
        for volume in &candidates {
            if Instant::now() >= deadline {
                tally.fail(KillSwitchError::timeout("dismount removable volumes", config.dismount_timeout));
                break;
            }

            match self.dismount_volume(volume, deadline).await {
                Ok(mode) => {
                    self.events.log_info(&format!(
                        "Dismounted {} from {}{}",
                        volume.device,
                        volume.mount_point,
                        if mode == UnmountMode::Lazy { " (lazy)" } else { "" }
                    ));
                    tally.done += 1;
                }
                Err(e) if e.is_timeout() => {
                    self.events.log_warning(&format!("Dismount of {} timed out", volume.mount_point));
                    tally.fail(e);
                }
                Err(e) => {
                    self.events.log_error(&e.to_string());
                    tally.fail(e);
                }
            }
        }

        let done = format!("{} of {} volumes dismounted", tally.done, candidates.len());
        tally.finish(done, "no removable volume mounted")
    }

    /// Plain unmount, then lazy unmount if the volume is busy or the plain
    /// call hangs. Each call gets at most `unmount_limit`.
    async fn dismount_volume(&self, volume: &MountRecord, deadline: Instant) -> Result<UnmountMode, KillSwitchError> {
        let target = PathBuf::from(&volume.mount_point);
        let call_limit = || deadline.saturating_duration_since(Instant::now()).min(self.unmount_limit);

        let first = {
            let host = self.host.clone();
            let target = target.clone();
            let operation = format!("unmount {}", volume.mount_point);
            bounded(&operation, call_limit(), move || host.unmount(&target, UnmountMode::Normal)).await
        };
        let normal_error = match first {
            Ok(Ok(())) => return Ok(UnmountMode::Normal),
            Ok(Err(e)) => KillSwitchError::from(e),
            Err(e) => e,
        };
        log::debug!("plain unmount of {} failed ({}), retrying lazily", volume.mount_point, normal_error);

        let limit = call_limit();
        if limit.is_zero() {
            return Err(normal_error);
        }

        let host = self.host.clone();
        let operation = format!("lazy unmount {}", volume.mount_point);
        match bounded(&operation, limit, move || host.unmount(&target, UnmountMode::Lazy)).await? {
            Ok(()) => Ok(UnmountMode::Lazy),
            Err(e) => Err(KillSwitchError::Dismount {
                mount_point: volume.mount_point.clone(),
                reason: format!("{} (plain unmount: {})", e, normal_error),
            }),
        }
    }

    async fn end_processes(&self, processes: &[String]) -> Result<TaskSummary, KillSwitchError> {
        if processes.is_empty() {
            return Ok(TaskSummary::Nothing("no processes configured".to_string()));
        }

        let mut tally = Tally::default();
        let mut killed = 0;
        for name in processes {
            let host = self.host.clone();
            let owned = name.clone();
            match bounded_io(&format!("kill {}", name), PROCESS_KILL_LIMIT, move || host.kill_matching(&owned)).await {
                Ok(0) => {
                    self.events.log_info(&format!("No running process matches {}", name));
                }
                Ok(n) => {
                    self.events.log_info(&format!("Killed {} process(es) matching {}", n, name));
                    killed += n;
                    tally.done += 1;
                }
                Err(e) => tally.fail(e),
            }
        }

        tally.finish(format!("{} process(es) killed", killed), "no matching process running")
    }

    async fn delete_files(&self, files: &[PathBuf]) -> Result<TaskSummary, KillSwitchError> {
        if files.is_empty() {
            return Ok(TaskSummary::Nothing("no files configured".to_string()));
        }

        let mut tally = Tally::default();
        for path in files {
            let host = self.host.clone();
            let owned = path.clone();
            let operation = format!("delete {}", path.display());
            match bounded_io(&operation, FILE_DELETE_LIMIT, move || host.remove_file(&owned)).await {
                Ok(()) => {
                    self.events.log_info(&format!("Deleted {}", path.display()));
                    tally.done += 1;
                }
                Err(KillSwitchError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                    self.events.log_warning(&format!("File not found, skipping: {}", path.display()));
                }
                Err(e) => tally.fail(e),
            }
        }

        let done = format!("{} of {} files deleted", tally.done, files.len());
        tally.finish(done, "no listed file exists")
    }

    async fn overwrite_files(&self, files: &[PathBuf], passes: u32) -> Result<TaskSummary, KillSwitchError> {
        if files.is_empty() {
            return Ok(TaskSummary::Nothing("no files configured".to_string()));
        }

        let mut tally = Tally::default();
        for path in files {
            let host = self.host.clone();
            let owned = path.clone();
            let size = match bounded_io("stat", ENUMERATION_LIMIT, move || host.file_size(&owned)).await {
                Ok(Some(size)) => size,
                Ok(None) => {
                    self.events.log_warning(&format!("File not found, skipping: {}", path.display()));
                    continue;
                }
                Err(e) => {
                    tally.fail(e);
                    continue;
                }
            };

            let limit = overwrite_limit(size, passes);
            let host = self.host.clone();
            let owned = path.clone();
            let operation = format!("overwrite {}", path.display());
            match bounded_io(&operation, limit, move || host.secure_erase(&owned, passes, limit)).await {
                Ok(EraseMethod::Shred) => {
                    self.events.log_info(&format!("Overwrote {} ({} passes)", path.display(), passes));
                    tally.done += 1;
                }
                Ok(EraseMethod::Overwrite) => {
                    self.events.log_warning(&format!(
                        "shred unavailable, overwrote {} with random data ({} passes)",
                        path.display(),
                        passes
                    ));
                    tally.done += 1;
                }
                Err(KillSwitchError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                    self.events.log_warning(&format!("File not found, skipping: {}", path.display()));
                }
                Err(e) => tally.fail(e),
            }
        }

        let done = format!("{} of {} files overwritten", tally.done, files.len());
        tally.finish(done, "no listed file exists")
    }

    /// Detected once per run.
    async fn desktop(&self, state: &mut RunState) -> DesktopEnvironment {
        if let Some(de) = state.desktop {
            return de;
        }

        let host = self.host.clone();
        let de = bounded("desktop detection", ENUMERATION_LIMIT, move || {
            desktop::detect(|key| host.env_var(key), |name| host.process_running(name))
        })
        .await
        .unwrap_or_else(|e| {
            self.events.log_warning(&format!("Desktop detection failed: {}", e));
            DesktopEnvironment::Unknown
        });

        log::debug!("desktop environment: {:?}", de);
        state.desktop = Some(de);
        de
    }

    /// Try `commands` in order and stop at the first one that exits 0.
    async fn first_success(&self, what: &str, commands: &[&str], limit: Duration) -> Result<TaskSummary, KillSwitchError> {
        let mut failures = Vec::new();

        for &command in commands {
            let host = self.host.clone();
            let owned = command.to_string();
            match bounded_io(command, limit, move || host.run_command(&owned, limit)).await {
                Ok(output) if output.success() => {
                    return Ok(TaskSummary::Done(format!("{} via `{}`", what, command)));
                }
                Ok(output) => {
                    log::debug!("{} candidate `{}` failed: {}", what, command, exit_failure(output.code, &output.stderr));
                    failures.push(command);
                }
                Err(e) => {
                    log::debug!("{} candidate `{}` failed: {}", what, command, e);
                    failures.push(command);
                }
            }
        }

        Err(KillSwitchError::TaskExecution(format!(
            "no {} mechanism succeeded (tried {})",
            what,
            failures.len()
        )))
    }
}
