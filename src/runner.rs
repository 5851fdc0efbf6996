//! Runner indirection: how a game executable actually gets invoked.
//!
//! A closed set of variants behind one capability surface: build the final
//! argument vector, contribute environment variables, and optionally know
//! how to force-stop the layer underneath the game. Per-runner option
//! metadata stays in configuration (`config::RunnerConfig`); this module
//! holds only launch behavior.

use tokio::process::Command;
use tracing::{info, warn};

use crate::config::RunnerConfig;

/// Compatibility layer a game launches through.
#[derive(Debug, Clone, Default)]
pub enum Runner {
    /// Plain native executable, no indirection.
    #[default]
    Native,
    /// Wine (or a Proton build) with an optional prefix.
    Wine(WineRunner),
    /// Generic emulator/interpreter invoked as a command prefix.
    Prefixed { prefix_args: Vec<String> },
}

#[derive(Debug, Clone, Default)]
pub struct WineRunner {
    pub prefix: Option<String>,
    pub binary: Option<String>,
}

impl Runner {
    pub fn from_config(config: Option<&RunnerConfig>) -> Self {
        match config {
            None | Some(RunnerConfig::Native) => Self::Native,
            Some(RunnerConfig::Wine { prefix, binary }) => Self::Wine(WineRunner {
                prefix: prefix.clone(),
                binary: binary.clone(),
            }),
            Some(RunnerConfig::Command { prefix_args }) => Self::Prefixed {
                prefix_args: prefix_args.clone(),
            },
        }
    }

    /// The final argument vector: the configured executable command with
    /// any runner indirection prepended.
    pub fn build_launch_command(&self, exec: Vec<String>) -> Vec<String> {
        match self {
            Self::Native => exec,
            Self::Wine(wine) => {
                let mut argv = vec![wine.binary.clone().unwrap_or_else(|| "wine".to_string())];
                argv.extend(exec);
                argv
            }
            Self::Prefixed { prefix_args } => {
                let mut argv = prefix_args.clone();
                argv.extend(exec);
                argv
            }
        }
    }

    /// Environment variables the runner itself requires.
    pub fn launch_env(&self) -> Vec<(String, String)> {
        match self {
            Self::Wine(wine) => wine
                .prefix
                .iter()
                .map(|prefix| ("WINEPREFIX".to_string(), prefix.clone()))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Runner-specific force stop, run before the death watch starts.
    /// Returns whether the runner did anything.
    pub async fn force_stop(&self) -> bool {
        match self {
            Self::Wine(wine) => {
                // Ask wineserver to tear the prefix down; the wine service
                // processes exit much faster on their own than under kill.
                let mut command = Command::new("wineserver");
                command.arg("-k");
                if let Some(prefix) = &wine.prefix {
                    command.env("WINEPREFIX", prefix);
                }
                match command.status().await {
                    Ok(status) => {
                        info!(success = status.success(), "asked wineserver to shut down");
                        status.success()
                    }
                    Err(err) => {
                        warn!(error = %err, "could not run wineserver -k");
                        false
                    }
                }
            }
            _ => false,
        }
    }
}
