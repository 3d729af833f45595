mod auth;
mod config_cmd;
mod list;
mod mutate;
mod options_cmd;
mod print_cmd;
mod watch;

pub use auth::{logout, whoami, LoginCommand};
pub use config_cmd::ConfigCommand;
pub use list::ListCommand;
pub use mutate::MutateCommand;
pub use options_cmd::OptionsCommand;
pub use print_cmd::PrintTestCommand;
pub use watch::WatchCommand;

use std::time::Duration;

use comanda_core::{CollectionKind, CollectionStore, PrinterError, SyncError, SyncPhase};
use tokio::time::{timeout_at, Instant};

use crate::engine::EngineError;

/// Parses a collection name for clap.
pub(crate) fn parse_kind(name: &str) -> Result<CollectionKind, String> {
    CollectionKind::by_name(name).ok_or_else(|| {
        format!(
            "Unknown collection '{}'. Valid options: {}",
            name,
            CollectionKind::builtin_names().join(", ")
        )
    })
}

/// Parses `field=value` for clap.
pub(crate) fn parse_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((field, value)) if !field.trim().is_empty() => {
            Ok((field.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("Expected FIELD=VALUE, got '{}'", raw)),
    }
}

/// Reads a `--set` value as JSON when it parses, otherwise as a string.
pub(crate) fn pair_value(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

/// Waits until `store` shows a snapshot.
pub(crate) async fn wait_for_snapshot(
    store: &CollectionStore,
    limit: Duration,
) -> Result<(), CommandError> {
    let deadline = Instant::now() + limit;
    let mut changes = store.changes();
    loop {
        match store.phase() {
            SyncPhase::Synced { stale: false } => return Ok(()),
            SyncPhase::Synced { stale: true } if !store.is_empty() => {
                tracing::warn!("showing a stale snapshot");
                return Ok(());
            }
            SyncPhase::Synced { stale: true } => return Err(SyncError::Timeout.into()),
            _ => {}
        }
        match timeout_at(deadline, changes.changed()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) | Err(_) => return Err(SyncError::Timeout.into()),
        }
    }
}

/// Errors from commands that talk to the server
#[derive(Debug)]
pub enum CommandError {
    RuntimeError(std::io::Error),
    Engine(EngineError),
    Sync(SyncError),
    Printer(PrinterError),
    InvalidInput(String),
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::RuntimeError(e) => write!(f, "Runtime error: {}", e),
            CommandError::Engine(e) => write!(f, "{}", e),
            CommandError::Sync(e) => write!(f, "{}", e.user_message()),
            CommandError::Printer(e) => write!(f, "{}", e),
            CommandError::InvalidInput(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CommandError::RuntimeError(e) => Some(e),
            CommandError::Engine(e) => Some(e),
            CommandError::Sync(e) => Some(e),
            CommandError::Printer(e) => Some(e),
            CommandError::InvalidInput(_) => None,
        }
    }
}

impl From<EngineError> for CommandError {
    fn from(e: EngineError) -> Self {
        CommandError::Engine(e)
    }
}

impl From<SyncError> for CommandError {
    fn from(e: SyncError) -> Self {
        CommandError::Sync(e)
    }
}

impl From<PrinterError> for CommandError {
    fn from(e: PrinterError) -> Self {
        CommandError::Printer(e)
    }
}

/// Runs `future` on a fresh tokio runtime.
pub(crate) fn block_on<F, T>(future: F) -> Result<T, CommandError>
where
    F: std::future::Future<Output = Result<T, CommandError>>,
{
    let rt = tokio::runtime::Runtime::new().map_err(CommandError::RuntimeError)?;
    rt.block_on(future)
}
