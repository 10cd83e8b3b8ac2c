use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{LevelFilter, error, info, warn};
use serde::{Deserialize, Serialize};
use syslog::{BasicLogger, Facility, Formatter3164};

use crate::config::SwitchConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Warning,
    Error,
}

/// One log-worthy engine event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Seconds since the UNIX epoch.
    pub timestamp: u64,
    pub level: EventLevel,
    pub message: String,
}

impl Event {
    pub fn now(level: EventLevel, message: impl Into<String>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Event { timestamp, level, message: message.into() }
    }
}

/// Receiver for every event the engine emits. Display and persistence are
/// up to the implementation.
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: &Event);
}

/// Cheap, cloneable handle the engine components log through.
#[derive(Clone)]
pub struct EventLog {
    sink: Arc<dyn EventSink>,
}

impl EventLog {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }

    pub fn log_info(&self, message: &str) {
        self.sink.on_event(&Event::now(EventLevel::Info, message));
    }

    pub fn log_warning(&self, message: &str) {
        self.sink.on_event(&Event::now(EventLevel::Warning, message));
    }

    pub fn log_error(&self, message: &str) {
        self.sink.on_event(&Event::now(EventLevel::Error, message));
    }
}

fn forward(event: &Event) {
    match event.level {
        EventLevel::Info => info!("{}", event.message),
        EventLevel::Warning => warn!("{}", event.message),
        EventLevel::Error => error!("{}", event.message),
    }
}

fn syslog_facility(name: &str) -> Facility {
    match name {
        "daemon" => Facility::LOG_DAEMON,
        "user" => Facility::LOG_USER,
        "local0" => Facility::LOG_LOCAL0,
        "local1" => Facility::LOG_LOCAL1,
        "local2" => Facility::LOG_LOCAL2,
        "local3" => Facility::LOG_LOCAL3,
        "local4" => Facility::LOG_LOCAL4,
        "local5" => Facility::LOG_LOCAL5,
        "local6" => Facility::LOG_LOCAL6,
        "local7" => Facility::LOG_LOCAL7,
        _ => Facility::LOG_DAEMON,
    }
}

/// Process logger: installs the file or syslog backend for the `log` facade
/// and echoes events to the console.
pub struct Logger {
    verbose: bool,
}

impl Logger {
    pub fn new(config: &SwitchConfig) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        if let Some(ref path) = config.log_file {
            simple_logging::log_to_file(path, LevelFilter::Info)
                .map_err(|e| format!("cannot log to {} - {}", path.display(), e))?;
            info!("logging to {}", path.display());
        } else if config.use_syslog {
            let formatter = Formatter3164 {
                facility: syslog_facility(&config.syslog_facility),
                hostname: None,
                process: "killswitch".into(),
                pid: std::process::id(),
            };

            let logger = syslog::unix(formatter)
                .map_err(|e| format!("impossible to connect to syslog: {:?}", e))?;
            log::set_boxed_logger(Box::new(BasicLogger::new(logger)))
                .map(|()| log::set_max_level(LevelFilter::Info))?;
        }

        Ok(Logger { verbose: config.verbose })
    }

    /// A logger that only echoes to the console, for tools that must not
    /// touch the process-wide `log` backend.
    pub fn console(verbose: bool) -> Self {
        Logger { verbose }
    }

    pub fn log_info(&self, message: &str) {
        if self.verbose {
            println!("INFO: {}", message);
        }

        info!("{}", message);
    }

    pub fn log_error(&self, message: &str) {
        eprintln!("ERROR: {}", message);

        error!("{}", message);
    }

    pub fn log_warning(&self, message: &str) {
        println!("WARNING: {}", message);

        warn!("{}", message);
    }
}

impl EventSink for Logger {
    fn on_event(&self, event: &Event) {
        match event.level {
            EventLevel::Info => self.log_info(&event.message),
            EventLevel::Warning => self.log_warning(&event.message),
            EventLevel::Error => self.log_error(&event.message),
        }
    }
}

/// Writes each event as one JSON object per line on stdout, for a front-end
/// reading the daemon's output. Events are still forwarded to the `log`
/// backend.
pub struct JsonLinesSink;

impl EventSink for JsonLinesSink {
    fn on_event(&self, event: &Event) {
        forward(event);
        match serde_json::to_string(event) {
            Ok(line) => {
                let stdout = std::io::stdout();
                let mut out = stdout.lock();
                let _ = writeln!(out, "{}", line);
                let _ = out.flush();
            }
            Err(e) => error!("cannot encode event: {}", e),
        }
    }
}

/// Keeps every event in memory.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.message).collect()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.events().iter().any(|e| e.message.contains(needle))
    }
}

impl EventSink for MemorySink {
    fn on_event(&self, event: &Event) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).push(event.clone());
    }
}
