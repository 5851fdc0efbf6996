//! Launching and owning one game process for the lifetime of a run.
//!
//! The owned child is always the wrapper helper, never the game itself:
//! terminals and compatibility layers re-exec freely, so the PID returned
//! by spawn is only a handle for signal delivery. Liveness of the actual
//! game is the lifecycle monitor's business (`monitor`), and the real exit
//! code comes back out-of-band through a side file keyed by the run token
//! (the wrapper's own exit code can belong to a shell).

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::env::LaunchEnvironment;
use crate::events::Event;
use crate::output::{is_noise, sanitize_text, LogBuffer, LogLine, StreamKind};
use crate::shell;
use crate::stop;

/// Where a run lands when its working directory cannot be created.
pub const FALLBACK_CWD: &str = "/tmp";

/// Upper bound on a single buffered output line; longer lines are cut.
const MAX_LINE_BYTES: usize = 256 * 1024;

const LOG_CAPACITY: usize = 10_000;

/// Setup failures that make a run impossible; everything past setup is
/// reported through `GameCommand::error` instead.
#[derive(Debug, Error)]
pub enum LauncherError {
    #[error("wrapper helper 'gamemon-wrapper' not found next to the executable or on PATH")]
    WrapperMissing,
    #[error("terminal application could not be found: {0}")]
    TerminalMissing(String),
}

/// Lifecycle of one launched command. Transitions only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    NotStarted,
    Running,
    Stopped,
}

/// Caller-overridable shutdown hook. Returning `false` vetoes the rest of
/// the stop sequence; the hook then owns eventual cleanup.
pub type StopFunc = Box<dyn Fn() -> bool + Send + Sync>;

/// Everything needed to start one run.
pub struct LaunchSpec {
    pub title: String,
    pub command: Vec<String>,
    pub env: LaunchEnvironment,
    pub working_dir: Option<String>,
    /// Terminal emulator executable name; `None` runs headless.
    pub terminal: Option<String>,
    pub include_processes: Vec<String>,
    pub exclude_processes: Vec<String>,
}

/// Executes a game command while keeping track of its state.
pub struct GameCommand {
    pub title: String,
    pub env: LaunchEnvironment,
    pub state: RunState,
    /// PID returned by spawn; the wrapper, not necessarily the game.
    pub owned_pid: Option<u32>,
    /// Whether the owned process is believed alive.
    pub is_running: bool,
    /// Spawn-time failure, observed by the heartbeat.
    pub error: Option<String>,
    /// Exit code recovered from the wrapper's side file.
    pub return_code: Option<i32>,
    command: Vec<String>,
    cwd: PathBuf,
    terminal: Option<PathBuf>,
    include_processes: Vec<String>,
    exclude_processes: Vec<String>,
    wrapper: PathBuf,
    stop_func: StopFunc,
    prevent_on_stop: bool,
    logs: Arc<Mutex<LogBuffer>>,
    drain_tasks: Vec<JoinHandle<()>>,
}

impl GameCommand {
    pub fn new(spec: LaunchSpec) -> Result<Self, LauncherError> {
        let wrapper = locate_wrapper()?;
        Self::with_wrapper(spec, wrapper)
    }

    /// Like `new` but with an explicit wrapper path; the seam tests use to
    /// substitute a stand-in wrapper.
    pub fn with_wrapper(spec: LaunchSpec, wrapper: PathBuf) -> Result<Self, LauncherError> {
        let terminal = match &spec.terminal {
            Some(name) => Some(
                find_executable(name).ok_or_else(|| LauncherError::TerminalMissing(name.clone()))?,
            ),
            None => None,
        };
        let cwd = spec
            .working_dir
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(FALLBACK_CWD));
        Ok(Self {
            title: spec.title,
            env: spec.env,
            state: RunState::NotStarted,
            owned_pid: None,
            is_running: false,
            error: None,
            return_code: None,
            command: spec.command,
            cwd,
            terminal,
            include_processes: spec.include_processes,
            exclude_processes: spec.exclude_processes,
            wrapper,
            stop_func: Box::new(|| true),
            prevent_on_stop: false,
            logs: Arc::new(Mutex::new(LogBuffer::new(LOG_CAPACITY))),
            drain_tasks: Vec::new(),
        })
    }

    /// Replaces the shutdown hook (runner-specific cleanup, veto).
    pub fn set_stop_func(&mut self, stop_func: StopFunc) {
        self.stop_func = stop_func;
    }

    pub fn working_dir(&self) -> &Path {
        &self.cwd
    }

    /// The buffered output so far, joined into one string.
    pub fn stdout(&self) -> String {
        self.logs
            .lock()
            .map(|logs| logs.text())
            .unwrap_or_default()
    }

    /// Launch arguments for the wrapper helper, with optional terminal
    /// indirection. The generated terminal script exports the environment
    /// and `exec`s the real command so env scoping stays local to it.
    fn wrapper_command(&self) -> anyhow::Result<Vec<String>> {
        let mut argv = vec![
            self.wrapper.to_string_lossy().into_owned(),
            self.title.clone(),
            self.include_processes.len().to_string(),
            self.exclude_processes.len().to_string(),
        ];
        argv.extend(self.include_processes.iter().cloned());
        argv.extend(self.exclude_processes.iter().cloned());
        match &self.terminal {
            None => argv.extend(self.command.iter().cloned()),
            Some(terminal) => {
                let script = shell::write_terminal_script(
                    &self.command,
                    &self.cwd.to_string_lossy(),
                    &self.env.vars,
                )?;
                argv.push(terminal.to_string_lossy().into_owned());
                argv.push("-e".to_string());
                argv.push(script.to_string_lossy().into_owned());
            }
        }
        Ok(argv)
    }

    fn ensure_cwd(&mut self) {
        if self.cwd.is_dir() {
            return;
        }
        if let Err(err) = std::fs::create_dir_all(&self.cwd) {
            error!(
                error = %err,
                "failed to create working directory {}, falling back to {}",
                self.cwd.display(),
                FALLBACK_CWD
            );
            self.cwd = PathBuf::from(FALLBACK_CWD);
        }
    }

    /// Spawns the wrapper and wires up output draining and the exit
    /// notification. Spawn failures land in `self.error` rather than an
    /// `Err`: the heartbeat observes the field and fails the run.
    pub async fn start(&mut self, events: mpsc::Sender<Event>) {
        self.ensure_cwd();
        let argv = match self.wrapper_command() {
            Ok(argv) => argv,
            Err(err) => {
                error!(error = %err, "could not assemble launch command");
                self.error = Some(err.to_string());
                return;
            }
        };
        debug!(command = ?argv, cwd = %self.cwd.display(), "starting game process");

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .current_dir(&self.cwd)
            .envs(&self.env.vars)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                error!(error = %err, "failed to execute {}", argv.join(" "));
                self.error = Some(err.to_string());
                return;
            }
        };

        self.owned_pid = child.id();
        self.state = RunState::Running;
        self.is_running = true;

        if let Some(stdout) = child.stdout.take() {
            self.drain_tasks.push(tokio::spawn(drain_stream(
                stdout,
                StreamKind::Stdout,
                events.clone(),
                self.logs.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            self.drain_tasks.push(tokio::spawn(drain_stream(
                stderr,
                StreamKind::Stderr,
                events.clone(),
                self.logs.clone(),
            )));
        }

        let exit_tx = events.clone();
        tokio::spawn(async move {
            // Fires exactly once; the receiver may be gone during shutdown.
            let _ = child.wait().await;
            let _ = exit_tx.send(Event::Exited).await;
        });

        let _ = events
            .send(Event::Started {
                pid: self.owned_pid.unwrap_or(0),
            })
            .await;
    }

    /// Handles the owned process's exit notification. Recovers the return
    /// code and runs the stop sequence; returns `false` when a stop is
    /// already in progress or the stop hook vetoed the shutdown.
    pub fn on_exited(&mut self) -> bool {
        if self.prevent_on_stop {
            return false;
        }
        self.return_code = recover_return_code(&self.env.run_token);
        self.is_running = false;
        debug!(
            pid = ?self.owned_pid,
            code = ?self.return_code,
            "owned process terminated"
        );
        self.stop()
    }

    /// Stops the owned process and cleans up the instance. The stop hook
    /// runs first and may veto everything after it (returning `false`);
    /// the hook then owns eventual cleanup. Signalling an already-dead
    /// process is a success condition.
    pub fn stop(&mut self) -> bool {
        self.prevent_on_stop = true;

        if !(self.stop_func)() {
            warn!("stop sequence halted by demand of the stop hook");
            return false;
        }

        if let Some(pid) = self.owned_pid {
            stop::terminate(pid);
        }

        for task in self.drain_tasks.drain(..) {
            task.abort();
        }
        self.is_running = false;
        self.state = RunState::Stopped;
        true
    }
}

/// Reads and deletes the return-code side file written by the wrapper.
/// A missing file means the code is unknown; that is a warning, not an
/// error.
pub fn recover_return_code(run_token: &str) -> Option<i32> {
    let path = return_code_path(run_token);
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(_) => {
            warn!("no return code file at {}", path.display());
            return None;
        }
    };
    if let Err(err) = std::fs::remove_file(&path) {
        warn!(error = %err, "could not remove return code file {}", path.display());
    }
    match text.trim().parse() {
        Ok(code) => Some(code),
        Err(_) => {
            warn!(content = %text.trim(), "return code file held no number");
            None
        }
    }
}

/// Side-file path for a run's recovered exit code.
pub fn return_code_path(run_token: &str) -> PathBuf {
    std::env::temp_dir().join(format!("gamemon-{run_token}"))
}

/// Finds the wrapper helper: next to the current executable first, then
/// on PATH. Without it a run cannot proceed.
pub fn locate_wrapper() -> Result<PathBuf, LauncherError> {
    if let Ok(current) = std::env::current_exe() {
        if let Some(dir) = current.parent() {
            let candidate = dir.join("gamemon-wrapper");
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }
    find_executable("gamemon-wrapper").ok_or(LauncherError::WrapperMissing)
}

/// Resolves an executable name against PATH; an explicit path is accepted
/// as-is when it exists.
pub fn find_executable(name: &str) -> Option<PathBuf> {
    if name.contains('/') {
        let path = PathBuf::from(name);
        return path.is_file().then_some(path);
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Drains one output pipe line by line: permissive decode, noise filter,
/// then dispatch to the ring buffer and the event channel. Ends on pipe
/// hang-up.
async fn drain_stream<R>(
    reader: R,
    stream: StreamKind,
    events: mpsc::Sender<Event>,
    logs: Arc<Mutex<LogBuffer>>,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut raw = Vec::new();
    loop {
        raw.clear();
        match reader.read_until(b'\n', &mut raw).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        if raw.len() > MAX_LINE_BYTES {
            raw.truncate(MAX_LINE_BYTES);
        }
        let decoded = String::from_utf8_lossy(&raw);
        let line = sanitize_text(decoded.trim_end_matches(['\r', '\n']), true);
        if is_noise(&line) {
            continue;
        }
        if let Ok(mut logs) = logs.lock() {
            logs.push(LogLine {
                text: line.clone(),
                stream,
            });
        }
        if events.send(Event::Output { line, stream }).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::UserEnv;
    use uuid::Uuid;

    fn spec(command: &[&str]) -> LaunchSpec {
        LaunchSpec {
            title: "Test Game".to_string(),
            command: command.iter().map(|token| token.to_string()).collect(),
            env: LaunchEnvironment::build(&UserEnv::new()),
            working_dir: Some("/tmp".to_string()),
            terminal: None,
            include_processes: vec!["helper".to_string()],
            exclude_processes: vec!["updater".to_string(), "launcher.exe".to_string()],
        }
    }

    fn fake_wrapper() -> PathBuf {
        let path = std::env::temp_dir().join(format!("gamemon-test-wrapper-{}", Uuid::new_v4()));
        std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        path
    }

    #[test]
    fn return_code_round_trip() {
        let token = Uuid::new_v4().to_string();
        std::fs::write(return_code_path(&token), "42\n").unwrap();
        assert_eq!(recover_return_code(&token), Some(42));
        assert!(!return_code_path(&token).exists());
    }

    #[test]
    fn missing_return_code_file_is_unknown() {
        let token = Uuid::new_v4().to_string();
        assert_eq!(recover_return_code(&token), None);
    }

    #[test]
    fn garbage_return_code_file_is_unknown() {
        let token = Uuid::new_v4().to_string();
        std::fs::write(return_code_path(&token), "not a number").unwrap();
        assert_eq!(recover_return_code(&token), None);
        assert!(!return_code_path(&token).exists());
    }

    #[test]
    fn wrapper_command_carries_process_lists_and_command() {
        let wrapper = fake_wrapper();
        let command = GameCommand::with_wrapper(spec(&["wine", "game.exe"]), wrapper.clone())
            .unwrap();
        let argv = command.wrapper_command().unwrap();
        assert_eq!(argv[0], wrapper.to_string_lossy());
        assert_eq!(argv[1], "Test Game");
        assert_eq!(&argv[2..4], ["1", "2"]);
        assert_eq!(&argv[4..7], ["helper", "updater", "launcher.exe"]);
        assert_eq!(&argv[7..], ["wine", "game.exe"]);
        std::fs::remove_file(wrapper).ok();
    }

    #[test]
    fn terminal_indirection_runs_the_generated_script() {
        let wrapper = fake_wrapper();
        let mut launch = spec(&["./game"]);
        launch.terminal = Some("sh".to_string());
        let command = GameCommand::with_wrapper(launch, wrapper.clone()).unwrap();
        let argv = command.wrapper_command().unwrap();
        assert_eq!(argv[argv.len() - 2], "-e");
        assert!(argv[argv.len() - 1].ends_with("gamemon-run-in-term.sh"));
        std::fs::remove_file(wrapper).ok();
    }

    #[test]
    fn unknown_terminal_is_a_setup_error() {
        let wrapper = fake_wrapper();
        let mut launch = spec(&["./game"]);
        launch.terminal = Some("no-such-terminal-emulator".to_string());
        let result = GameCommand::with_wrapper(launch, wrapper.clone());
        assert!(matches!(result, Err(LauncherError::TerminalMissing(_))));
        std::fs::remove_file(wrapper).ok();
    }

    #[tokio::test]
    async fn spawn_failure_sets_error_instead_of_raising() {
        // The stand-in wrapper exists but is not executable.
        let wrapper = fake_wrapper();
        let mut command = GameCommand::with_wrapper(spec(&["true"]), wrapper.clone()).unwrap();
        let (tx, _rx) = mpsc::channel(16);
        command.start(tx).await;
        assert!(command.error.is_some());
        assert!(!command.is_running);
        assert_eq!(command.state, RunState::NotStarted);
        std::fs::remove_file(wrapper).ok();
    }

    #[test]
    fn stop_hook_veto_halts_the_sequence() {
        let wrapper = fake_wrapper();
        let mut command = GameCommand::with_wrapper(spec(&["true"]), wrapper.clone()).unwrap();
        command.set_stop_func(Box::new(|| false));
        assert!(!command.stop());
        assert_ne!(command.state, RunState::Stopped);
        command.set_stop_func(Box::new(|| true));
        assert!(command.stop());
        assert_eq!(command.state, RunState::Stopped);
        std::fs::remove_file(wrapper).ok();
    }

    #[test]
    fn missing_working_directory_falls_back() {
        let wrapper = fake_wrapper();
        let mut launch = spec(&["true"]);
        launch.working_dir = Some("/proc/definitely/not/creatable".to_string());
        let mut command = GameCommand::with_wrapper(launch, wrapper.clone()).unwrap();
        command.ensure_cwd();
        assert_eq!(command.working_dir(), Path::new(FALLBACK_CWD));
        std::fs::remove_file(wrapper).ok();
    }
}
