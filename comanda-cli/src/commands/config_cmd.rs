use clap::{Args, Subcommand, ValueEnum};
use std::fs;
use std::io::Write;

use crate::config::Config;

#[derive(Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Args)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub command: ConfigSubcommand,
}

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Show current configuration values
    Show {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Initialize configuration file
    Init,
}

const DEFAULT_CONFIG: &str = r#"# comanda configuration

# Sync server (http, https, ws or wss)
# server_url: https://api.example.com

# Workspace (cart) id attached to every request
# workspace: ""

# Where the saved session is kept (default: platform data dir)
# data_dir: ~/.local/share/comanda

sync:
  # Staff role override, e.g. Cozinha
  # role: Cozinha
  probe_interval_secs: 15
  tuning:
    refresh_timeout_ms: 10000
    ack_timeout_ms: 7000
    guard_cooldown_ms: 280
    row_cooldown_ms: 700
    editor_throttle_ms: 100
  reconnect:
    initial_delay_ms: 1000
    max_delay_ms: 30000
    jitter: 0.5
    connect_timeout_ms: 20000

printer:
  # Network printer, "host" or "host:port" (default port 9100)
  # device: 192.168.0.50
  width: 32
"#;

impl ConfigCommand {
    pub fn run(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            ConfigSubcommand::Show { format } => {
                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(config)?);
                    }
                    OutputFormat::Text => {
                        println!("Configuration");
                        println!("=============\n");

                        if let Some(path) = &config.config_file {
                            println!("Config file: {}", path.display());
                        } else {
                            println!(
                                "Config file: {} (not found)",
                                Config::default_config_path().display()
                            );
                        }
                        println!();

                        println!(
                            "server_url: {}",
                            config.server_url.value.as_deref().unwrap_or("(not set)")
                        );
                        println!("  source: {}", config.server_url.source);
                        println!();

                        println!(
                            "workspace: {}",
                            config.workspace.value.as_deref().unwrap_or("(not set)")
                        );
                        println!("  source: {}", config.workspace.source);
                        println!();

                        println!("data_dir: {}", config.data_dir.value.display());
                        println!("  source: {}", config.data_dir.source);
                        println!();

                        let tuning = &config.sync.tuning;
                        println!(
                            "role: {}",
                            config.sync.role.as_deref().unwrap_or("(from session)")
                        );
                        println!(
                            "timeouts: refresh {}ms, ack {}ms",
                            tuning.refresh_timeout_ms, tuning.ack_timeout_ms
                        );
                        println!(
                            "cooldowns: action {}ms, row {}ms, editor {}ms",
                            tuning.guard_cooldown_ms,
                            tuning.row_cooldown_ms,
                            tuning.editor_throttle_ms
                        );
                        println!(
                            "printer: {}",
                            config.printer.device.as_deref().unwrap_or("(not set)")
                        );
                    }
                }
                Ok(())
            }

            ConfigSubcommand::Init => {
                let config_path = Config::default_config_path();

                if config_path.exists() {
                    println!("Config file already exists: {}", config_path.display());
                    println!("Use 'comanda config show' to view current configuration.");
                    return Ok(());
                }

                if let Some(parent) = config_path.parent() {
                    fs::create_dir_all(parent)?;
                }

                let mut file = fs::File::create(&config_path)?;
                file.write_all(DEFAULT_CONFIG.as_bytes())?;

                println!("Created config file: {}", config_path.display());
                println!("\nEdit this file to customize your settings.");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_parses() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("config.yaml");
        fs::write(&path, DEFAULT_CONFIG).unwrap();

        let config = Config::load(Some(path)).unwrap();
        assert_eq!(config.sync.tuning, comanda_core::SyncTuning::default());
        assert_eq!(config.sync.reconnect, comanda_core::ReconnectPolicy::default());
        assert_eq!(config.printer.width, Some(32));
    }
}
