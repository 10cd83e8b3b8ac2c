use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio::time::interval;

use killswitch::config::{build_cli, config_file_requested};
use killswitch::{ConfigBuilder, generate_example_config, DEFAULT_CONFIG_PATH};
use killswitch::verify_config_paths;
use killswitch::{Engine, EventLog, EventSink, InventoryPoller, JsonLinesSink, Logger, SystemHost, VolumeClassifier};
use killswitch::{Host, WatcherKind, WatcherState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let matches = build_cli().get_matches();

    // Handle config file generation
    if let Some(path) = matches.get_one::<String>("generate-config") {
        let example_config = generate_example_config()?;
        let path = Path::new(path);

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| format!("Failed to create directory {}: {}", parent.display(), e))?;
            }
        }

        std::fs::write(path, example_config)
            .map_err(|e| format!("Failed to write config file {}: {}", path.display(), e))?;

        println!("Generated example configuration file: {}", path.display());
        println!("Edit this file to select the identifier and the tasks to run.");

        return Ok(());
    }

    // Build configuration from config file + command line
    let mut config_builder = ConfigBuilder::new();

    if let Some(config_path) = config_file_requested(&matches) {
        config_builder = config_builder.load_config_file(&config_path)
            .map_err(|e| format!("Failed to load config file '{}': {}", config_path, e))?;
        println!("Loaded configuration from: {}", config_path);
    }

    if matches.get_flag("merge-config") {
        let path = matches.get_one::<String>("config")
            .cloned()
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
        config_builder.merge_command_line(&matches).save_config_file(&path)?;
        return Ok(());
    }

    let config = config_builder
        .merge_command_line(&matches)
        .build()?;

    let host: Arc<dyn Host> = Arc::new(SystemHost::new());

    if matches.get_flag("list-volumes") {
        let events = EventLog::new(Arc::new(Logger::console(config.verbose)));
        let poller = InventoryPoller::new(host.clone(), events.clone());
        let classifier = VolumeClassifier::new(host, events);

        for volume in poller.mounted_volumes().await {
            println!("{:<10} {} on {} ({})",
                     classifier.classify_mount(&volume).to_string(),
                     volume.device,
                     volume.mount_point,
                     volume.fstype);
        }
        return Ok(());
    }

    if matches.get_flag("check-identifier") {
        let events = EventLog::new(Arc::new(Logger::console(config.verbose)));
        let poller = InventoryPoller::new(host, events);
        let label = &config.response.identifier;

        if poller.identifier_present(label).await {
            println!("Identifier volume {} is mounted.", label);
        } else {
            println!("Identifier volume {} is NOT mounted; arming now would trigger immediately.", label);
        }
        return Ok(());
    }

    verify_config_paths(&config)?;

    let logger = Logger::new(&config)?;
    let sink: Arc<dyn EventSink> = if config.json_events {
        Arc::new(JsonLinesSink)
    } else {
        Arc::new(logger)
    };

    let engine = Engine::new(host, sink);
    for kind in &config.arm {
        engine.arm(*kind, config.response.clone())
            .map_err(|e| format!("Cannot arm {} watcher: {}", kind, e))?;
    }

    let mut usr1 = signal(SignalKind::user_defined1())?;
    let mut usr2 = signal(SignalKind::user_defined2())?;
    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    let mut check = interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = usr1.recv() => {
                if engine.request_disarm_signal(WatcherKind::Identifier) == WatcherState::Disarmed {
                    println!("Identifier watcher disarmed.");
                }
            }
            _ = usr2.recv() => {
                if engine.request_disarm_signal(WatcherKind::Inventory) == WatcherState::Disarmed {
                    println!("Inventory watcher disarmed.");
                }
            }
            _ = term.recv() => break,
            _ = int.recv() => break,
            _ = check.tick() => {
                if !engine.any_armed() {
                    break;
                }
            }
        }
    }

    engine.shutdown().await;

    // workers abandoned after a timeout would otherwise hold up runtime shutdown
    std::process::exit(0);
}
