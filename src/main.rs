//! CLI entry point for the debug sandbox (sdbg).

use std::process::ExitCode;

use sandbox_debug::cli::Cli;
use sandbox_debug::config::{load_config, load_default_config};
use sandbox_debug::manager::SandboxManager;
use sandbox_debug::utils::{init_debug_logging, CancellationToken};

fn main() -> ExitCode {
    let cli = Cli::parse_args();

    // Initialize logging
    init_debug_logging(cli.debug);

    // Load configuration
    let config = match cli.get_settings_path() {
        Some(path) if path.exists() => match load_config(&path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error loading config from {:?}: {}", path, e);
                return ExitCode::from(1);
            }
        },
        _ => match load_default_config() {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error loading default config: {}", e);
                return ExitCode::from(1);
            }
        },
    };
    let config = cli.apply_overrides(config);

    // Get command to execute
    let command = match cli.get_command(&config) {
        Ok(cmd) => cmd,
        Err(e) => {
            eprintln!("Invalid command: {}", e);
            return ExitCode::from(1);
        }
    };

    let cancel = match CancellationToken::interruptible() {
        Ok(token) => token,
        Err(e) => {
            eprintln!("Failed to install SIGINT handler: {}", e);
            return ExitCode::from(1);
        }
    };

    let mut manager = match SandboxManager::new(config) {
        Ok(manager) => manager.with_cancellation(cancel),
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            return ExitCode::from(1);
        }
    };

    // Build the namespaces around this process
    if let Err(e) = manager.prepare() {
        eprintln!("Failed to set up sandbox: {}", e);
        return ExitCode::from(1);
    }

    match manager.run(&command) {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(e) => {
            eprintln!("Failed to execute command: {}", e);
            ExitCode::from(1)
        }
    }
}
