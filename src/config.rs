//! Configuration management for gamemon.
//!
//! This module defines the structure of a game definition file
//! (`game.toml`) and provides functionality to load and parse it. The
//! file carries the already-resolved launch parameters: gamemon does not
//! implement a configuration cascade, it consumes the result of one.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// How often the lifecycle monitor re-derives the live process set.
pub const DEFAULT_HEARTBEAT_MS: u64 = 2000;
/// Sessions shorter than this are flagged as suspicious and not counted
/// toward play time. A heuristic, hence configurable.
pub const DEFAULT_SHORT_SESSION_SECS: u64 = 5;
/// Forced-stop death watch: total window and poll interval.
pub const DEFAULT_DEATH_WATCH_SECS: u64 = 5;
pub const DEFAULT_DEATH_WATCH_INTERVAL_MS: u64 = 500;

/// Top-level structure of a `game.toml` definition.
#[derive(Debug, Clone, Deserialize)]
pub struct GameConfig {
    /// Display name of the game.
    pub name: String,
    /// Command line of the game executable, shell-words syntax.
    pub exec: String,
    /// Working directory; created on demand, falls back to /tmp.
    pub working_dir: Option<String>,
    /// Environment variables for the game. Non-string values are coerced
    /// with a warning at build time.
    pub env: Option<HashMap<String, toml::Value>>,
    /// Run the game inside a terminal emulator.
    pub terminal: Option<bool>,
    /// Terminal emulator executable to use (default: xterm).
    pub terminal_app: Option<String>,
    /// Process names to force-monitor, whitespace separated.
    pub include_processes: Option<String>,
    /// Process names to ignore, whitespace separated.
    pub exclude_processes: Option<String>,
    /// Path watched during the run; if it disappears the game is
    /// force-stopped (e.g. a controller device node).
    pub killswitch: Option<String>,
    /// Command run before the game starts.
    pub prelaunch_command: Option<String>,
    /// Wait for the prelaunch command instead of running it alongside.
    pub prelaunch_wait: Option<bool>,
    /// Command run after the game stops.
    pub postexit_command: Option<String>,
    /// Heartbeat interval in milliseconds.
    pub heartbeat_ms: Option<u64>,
    /// Threshold for the suspiciously-short-session warning, seconds.
    pub short_session_secs: Option<u64>,
    /// Forced-stop: how long to wait for processes to die.
    pub death_watch_secs: Option<u64>,
    /// Forced-stop: poll interval while waiting.
    pub death_watch_interval_ms: Option<u64>,
    /// Disable desktop compositing while the game runs.
    pub disable_compositor: Option<bool>,
    /// Inhibit the screen saver while the game runs.
    pub disable_screen_saver: Option<bool>,
    /// Override for the now-playing marker file location.
    pub now_playing_file: Option<String>,
    /// Runner the game goes through (native when absent).
    pub runner: Option<RunnerConfig>,
    /// Desktop side-effect commands.
    pub effects: Option<EffectsConfig>,
}

/// Which compatibility layer launches the game. A closed set: per-runner
/// option metadata stays plain data here, the launch behavior lives in
/// `runner`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunnerConfig {
    /// Direct native executable.
    Native,
    /// Wine/Proton with an optional prefix and binary override.
    Wine {
        prefix: Option<String>,
        binary: Option<String>,
    },
    /// Any emulator invoked as a command prefix (e.g. an interpreter or
    /// a libretro frontend) ahead of the game path.
    Command { prefix_args: Vec<String> },
}

/// Shell-outs used to restore the desktop around a run. Consumed as
/// opaque command invocations with no feedback loop.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EffectsConfig {
    pub compositor_off: Option<String>,
    pub compositor_on: Option<String>,
    pub screen_saver_inhibit: Option<String>,
    pub screen_saver_uninhibit: Option<String>,
    pub restore_resolution: Option<String>,
}

impl GameConfig {
    /// The resolved argument vector for the game executable.
    pub fn command(&self) -> Result<Vec<String>> {
        let command = shell_words::split(&self.exec)
            .with_context(|| format!("failed to parse exec for {}", self.name))?;
        if command.is_empty() {
            bail!("empty exec command for {}", self.name);
        }
        Ok(command)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms.unwrap_or(DEFAULT_HEARTBEAT_MS))
    }

    pub fn short_session(&self) -> Duration {
        Duration::from_secs(
            self.short_session_secs
                .unwrap_or(DEFAULT_SHORT_SESSION_SECS),
        )
    }

    pub fn death_watch_window(&self) -> Duration {
        Duration::from_secs(self.death_watch_secs.unwrap_or(DEFAULT_DEATH_WATCH_SECS))
    }

    pub fn death_watch_interval(&self) -> Duration {
        Duration::from_millis(
            self.death_watch_interval_ms
                .unwrap_or(DEFAULT_DEATH_WATCH_INTERVAL_MS),
        )
    }
}

/// Loads and parses a game definition from a file path.
pub fn load_config(path: &Path) -> Result<GameConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read game definition {}", path.display()))?;
    let config: GameConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse game definition {}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_definition() {
        let raw = r#"
name = "Example Quest"
exec = "'C:/Games/Example Quest/quest.exe' --windowed"
working_dir = "/games/example-quest"
terminal = false
include_processes = "quest-helper"
exclude_processes = "launcher.exe updater.exe"
killswitch = "/dev/input/js0"
prelaunch_command = "/usr/bin/gamemoderun"
postexit_command = "/usr/bin/notify-send done"
heartbeat_ms = 1000
short_session_secs = 3
disable_compositor = true

[env]
DXVK_HUD = "fps"
WINEESYNC = 1

[runner]
kind = "wine"
prefix = "/games/pfx"

[effects]
compositor_off = "qdbus org.kde.KWin /Compositor suspend"
compositor_on = "qdbus org.kde.KWin /Compositor resume"
"#;
        let config: GameConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.name, "Example Quest");
        let command = config.command().unwrap();
        assert_eq!(command[0], "C:/Games/Example Quest/quest.exe");
        assert_eq!(command[1], "--windowed");
        assert_eq!(config.heartbeat(), Duration::from_millis(1000));
        assert_eq!(config.short_session(), Duration::from_secs(3));
        assert_eq!(config.death_watch_window(), Duration::from_secs(5));
        assert!(matches!(
            config.runner,
            Some(RunnerConfig::Wine { ref prefix, .. }) if prefix.as_deref() == Some("/games/pfx")
        ));
        let env = config.env.unwrap();
        assert_eq!(env.get("WINEESYNC"), Some(&toml::Value::Integer(1)));
    }

    #[test]
    fn rejects_empty_exec() {
        let config: GameConfig = toml::from_str("name = \"x\"\nexec = \"\"").unwrap();
        assert!(config.command().is_err());
    }

    #[test]
    fn defaults_apply_when_fields_absent() {
        let config: GameConfig = toml::from_str("name = \"x\"\nexec = \"true\"").unwrap();
        assert_eq!(config.heartbeat(), Duration::from_millis(2000));
        assert_eq!(config.short_session(), Duration::from_secs(5));
        assert_eq!(config.death_watch_interval(), Duration::from_millis(500));
    }
}
