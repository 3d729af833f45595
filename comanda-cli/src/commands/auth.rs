//! Session commands: login, logout and whoami.

use chrono::{Duration as ChronoDuration, Utc};
use clap::Args;
use comanda_core::{Credentials, StorageError};
use std::io::{self, BufRead, Write};

use crate::config::Config;
use crate::engine::credential_store;

/// Save a session for a staff member
#[derive(Args)]
pub struct LoginCommand {
    /// Staff username
    #[arg(long, short)]
    username: String,

    /// Session token (read from stdin when omitted)
    #[arg(long)]
    token: Option<String>,

    /// Staff role (e.g. "Cozinha", "Admin")
    #[arg(long, short, default_value = "")]
    role: String,

    /// Workspace (cart) id
    #[arg(long, short)]
    workspace: Option<String>,

    /// Hours until the session expires; never expires when omitted
    #[arg(long)]
    expires_in_hours: Option<i64>,
}

impl LoginCommand {
    pub fn run(&self, config: &Config) -> Result<(), AuthError> {
        let token = match &self.token {
            Some(token) => token.clone(),
            None => prompt_token()?,
        };
        let workspace = self
            .workspace
            .clone()
            .or_else(|| config.workspace.value.clone())
            .unwrap_or_default();

        let mut credentials = Credentials::new(self.username.trim(), token.trim())
            .with_role(self.role.trim())
            .with_workspace(workspace);
        if let Some(hours) = self.expires_in_hours {
            if hours <= 0 {
                return Err(AuthError::InvalidInput(
                    "expiry must be at least one hour".to_string(),
                ));
            }
            credentials = credentials.with_expiry(Utc::now() + ChronoDuration::hours(hours));
        }

        credential_store(config).save(&credentials)?;
        tracing::info!(user = %credentials.username, "session saved");
        println!("Logged in as {}.", credentials.username);
        Ok(())
    }
}

fn prompt_token() -> Result<String, AuthError> {
    print!("Token: ");
    io::stdout().flush()?;
    let mut token = String::new();
    io::stdin().lock().read_line(&mut token)?;
    Ok(token.trim().to_string())
}

/// Forget the saved session
pub fn logout(config: &Config) -> Result<(), AuthError> {
    let store = credential_store(config);
    let was_logged_in = store.load().is_some();
    store.clear()?;
    if was_logged_in {
        println!("Logged out.");
    } else {
        println!("Not logged in.");
    }
    Ok(())
}

/// Show the saved session
pub fn whoami(config: &Config) -> Result<(), AuthError> {
    let Some(credentials) = credential_store(config).load() else {
        println!("Not logged in. Run 'comanda login' to save a session.");
        return Ok(());
    };

    println!("User:      {}", credentials.username);
    if !credentials.role.is_empty() {
        println!("Role:      {}", credentials.role);
    }
    if !credentials.workspace.is_empty() {
        println!("Workspace: {}", credentials.workspace);
    }
    println!("Token:     {}", mask(&credentials.token));
    match credentials.expires_at {
        Some(at) => {
            let left = (at - Utc::now()).num_minutes().max(0);
            println!(
                "Expires:   {} ({}h{:02}m left)",
                at.format("%Y-%m-%d %H:%M UTC"),
                left / 60,
                left % 60
            );
        }
        None => println!("Expires:   never"),
    }
    Ok(())
}

fn mask(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() > 8 {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", head, tail)
    } else {
        "****".to_string()
    }
}

/// Errors that can occur in session commands
#[derive(Debug)]
pub enum AuthError {
    IoError(io::Error),
    Storage(StorageError),
    InvalidInput(String),
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::IoError(e) => write!(f, "I/O error: {}", e),
            AuthError::Storage(e) => write!(f, "{}", e),
            AuthError::InvalidInput(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for AuthError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AuthError::IoError(e) => Some(e),
            AuthError::Storage(e) => Some(e),
            AuthError::InvalidInput(_) => None,
        }
    }
}

impl From<io::Error> for AuthError {
    fn from(e: io::Error) -> Self {
        AuthError::IoError(e)
    }
}

impl From<StorageError> for AuthError {
    fn from(e: StorageError) -> Self {
        AuthError::Storage(e)
    }
}
