//! Generates the script used to run a game inside a terminal emulator.
//!
//! Running from a script file is the only reliable way to set environment
//! variables for the command alone (not for the terminal application) and
//! to keep the terminal window open until the game actually exits.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};

/// Writes a `/bin/sh` script that enters the working directory, exports
/// the launch environment and `exec`s the command. Returns the script
/// path.
pub fn write_terminal_script(
    command: &[String],
    cwd: &str,
    env: &std::collections::HashMap<String, String>,
) -> Result<PathBuf> {
    // Sorted for a stable script; makes failures reproducible.
    let mut exports: BTreeMap<&str, &str> = env
        .iter()
        .map(|(key, value)| (key.as_str(), value.as_str()))
        .collect();
    exports.insert("TERM", "xterm");

    let mut script = String::from("#!/bin/sh\n");
    writeln!(script, "cd \"{}\"", cwd)?;
    for (key, value) in exports {
        writeln!(script, "export {}=\"{}\"", key, value)?;
    }
    let quoted: Vec<String> = command
        .iter()
        .map(|token| format!("\"{}\"", token))
        .collect();
    writeln!(script, "exec {}", quoted.join(" "))?;
    writeln!(script, "exit $?")?;

    let path = std::env::temp_dir().join("gamemon-run-in-term.sh");
    fs::write(&path, script)
        .with_context(|| format!("failed to write terminal script {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o744))?;
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn script_exports_environment_and_execs_command() {
        let mut env = HashMap::new();
        env.insert("GAMEMON_RUN_UUID".to_string(), "abc".to_string());
        let command = vec!["wine".to_string(), "game.exe".to_string()];
        let path = write_terminal_script(&command, "/games/foo", &env).unwrap();
        let script = fs::read_to_string(&path).unwrap();
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains("cd \"/games/foo\""));
        assert!(script.contains("export GAMEMON_RUN_UUID=\"abc\""));
        assert!(script.contains("export TERM=\"xterm\""));
        assert!(script.contains("exec \"wine\" \"game.exe\""));
    }

    #[cfg(unix)]
    #[test]
    fn script_is_executable() {
        use std::os::unix::fs::PermissionsExt;
        let path = write_terminal_script(&["true".to_string()], "/tmp", &HashMap::new()).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o100, 0o100);
    }
}
