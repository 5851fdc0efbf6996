//! Lifecycle monitoring: the heartbeat, liveness decisions and the stop
//! sequence.
//!
//! The heartbeat and the owned process's exit notification are two
//! independent, racing sources for the same fact ("is the game still
//! alive"); both funnel into one idempotent finalization. Liveness itself
//! cannot come from the owned child alone: the live set is re-derived
//! every tick from a `/proc` scan correlated by the run token, restricted
//! to PIDs that appeared after the prelaunch baseline.

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::Result;
use regex::Regex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::GameConfig;
use crate::effects::DesktopEffects;
use crate::env::RUN_TOKEN_VAR;
use crate::events::{Event, RunReport};
use crate::filter::{self, Candidate, ProcessFilter};
use crate::launcher::{self, GameCommand};
use crate::proc::{self, Process, ProcessInfo};
use crate::runner::Runner;
use crate::stop::{self, DeathWatch};

/// Monitor-level run state; only ever advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MonitorState {
    Launching,
    Running,
    Stopped,
}

/// Tuning and collaborator paths for one monitored run.
pub struct MonitorOptions {
    pub heartbeat: Duration,
    /// Sessions below this are flagged, not counted as play time.
    pub short_session: Duration,
    pub death_watch: DeathWatch,
    /// Path whose disappearance forces a stop.
    pub killswitch: Option<PathBuf>,
    /// Marker file holding the running game's display name.
    pub now_playing_path: PathBuf,
    /// Game install directory, used for path-matching live processes.
    pub game_dir: Option<String>,
    pub prelaunch_command: Option<String>,
    pub prelaunch_wait: bool,
    pub postexit_command: Option<String>,
    pub disable_compositor: bool,
    pub disable_screen_saver: bool,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_millis(crate::config::DEFAULT_HEARTBEAT_MS),
            short_session: Duration::from_secs(crate::config::DEFAULT_SHORT_SESSION_SECS),
            death_watch: DeathWatch::default(),
            killswitch: None,
            now_playing_path: std::env::temp_dir().join("gamemon-now-playing.txt"),
            game_dir: None,
            prelaunch_command: None,
            prelaunch_wait: false,
            postexit_command: None,
            disable_compositor: false,
            disable_screen_saver: false,
        }
    }
}

impl MonitorOptions {
    pub fn from_config(config: &GameConfig) -> Self {
        Self {
            heartbeat: config.heartbeat(),
            short_session: config.short_session(),
            death_watch: DeathWatch {
                window: config.death_watch_window(),
                interval: config.death_watch_interval(),
            },
            killswitch: resolve_killswitch(config.killswitch.as_deref()),
            now_playing_path: config
                .now_playing_file
                .clone()
                .map(PathBuf::from)
                .unwrap_or_else(|| std::env::temp_dir().join("gamemon-now-playing.txt")),
            game_dir: config.working_dir.clone(),
            prelaunch_command: config.prelaunch_command.clone(),
            prelaunch_wait: config.prelaunch_wait.unwrap_or(false),
            postexit_command: config.postexit_command.clone(),
            disable_compositor: config.disable_compositor.unwrap_or(false),
            disable_screen_saver: config.disable_screen_saver.unwrap_or(false),
        }
    }
}

/// Refuse a kill switch pointing at a path that already doesn't exist;
/// it would stop the game on the first heartbeat.
fn resolve_killswitch(path: Option<&str>) -> Option<PathBuf> {
    let path = PathBuf::from(path?);
    if path.exists() {
        Some(path)
    } else {
        warn!("kill switch {} does not exist; ignoring", path.display());
        None
    }
}

struct PrelaunchHelper {
    child: tokio::process::Child,
    pid: u32,
}

impl PrelaunchHelper {
    fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn stop(&mut self) {
        stop::terminate(self.pid);
    }
}

/// Watches one run from launch to finalization.
pub struct LifecycleMonitor {
    pub launcher: GameCommand,
    options: MonitorOptions,
    runner: Runner,
    filter: ProcessFilter,
    effects: Box<dyn DesktopEffects>,
    events: mpsc::Sender<Event>,
    state: MonitorState,
    /// PIDs alive just before launch; the baseline for "new" PIDs.
    prelaunch_pids: Option<HashSet<u32>>,
    prelaunch: Option<PrelaunchHelper>,
    started_at: Option<Instant>,
    finalized: bool,
    force_stopping: bool,
    compositor_disabled: bool,
    screen_saver_inhibited: bool,
    degraded_baseline_reported: bool,
}

impl LifecycleMonitor {
    pub fn new(
        launcher: GameCommand,
        runner: Runner,
        filter: ProcessFilter,
        effects: Box<dyn DesktopEffects>,
        options: MonitorOptions,
        events: mpsc::Sender<Event>,
    ) -> Self {
        Self {
            launcher,
            options,
            runner,
            filter,
            effects,
            events,
            state: MonitorState::Launching,
            prelaunch_pids: None,
            prelaunch: None,
            started_at: None,
            finalized: false,
            force_stopping: false,
            compositor_disabled: false,
            screen_saver_inhibited: false,
            degraded_baseline_reported: false,
        }
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.options.heartbeat
    }

    /// Starts the run: baseline snapshot, desktop effects, prelaunch
    /// helper, then the game itself.
    pub async fn launch(&mut self) -> Result<()> {
        self.advance(MonitorState::Launching);

        let baseline = proc::all_pids();
        if baseline.is_empty() {
            error!("no prelaunch PIDs could be obtained; game stop detection may be ineffective");
            self.prelaunch_pids = None;
        } else {
            self.prelaunch_pids = Some(baseline);
        }

        if self.options.disable_compositor {
            self.effects.compositor_off();
            self.compositor_disabled = true;
        }
        if self.options.disable_screen_saver {
            self.screen_saver_inhibited = self.effects.screen_saver_inhibit(&self.launcher.title);
        }

        self.start_prelaunch().await;

        self.launcher.start(self.events.clone()).await;
        if let Some(spawn_error) = self.launcher.error.clone() {
            self.fail_run(spawn_error);
            return Ok(());
        }

        self.started_at = Some(Instant::now());
        self.advance(MonitorState::Running);

        if let Err(err) = std::fs::write(&self.options.now_playing_path, &self.launcher.title) {
            warn!(error = %err, "could not write now-playing marker");
        }
        Ok(())
    }

    async fn start_prelaunch(&mut self) {
        let Some(command_line) = self.options.prelaunch_command.clone() else {
            return;
        };
        let argv = match shell_words::split(&command_line) {
            Ok(argv) if !argv.is_empty() => argv,
            Ok(_) => return,
            Err(err) => {
                warn!(error = %err, "unparseable prelaunch command");
                return;
            }
        };
        if launcher::find_executable(&argv[0]).is_none() {
            warn!(command = %argv[0], "prelaunch command not found");
            return;
        }
        let mut command = tokio::process::Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .envs(&self.launcher.env.vars)
            .stdin(Stdio::null());
        if self.launcher.working_dir().is_dir() {
            command.current_dir(self.launcher.working_dir());
        }
        if self.options.prelaunch_wait {
            info!(command = %command_line, "running prelaunch command to completion");
            match command.status().await {
                Ok(status) if !status.success() => {
                    warn!(code = ?status.code(), "prelaunch command failed");
                }
                Ok(_) => {}
                Err(err) => warn!(error = %err, "prelaunch command did not run"),
            }
        } else {
            info!(command = %command_line, "prelaunch command launched in the background");
            match command.spawn() {
                Ok(child) => {
                    let pid = child.id().unwrap_or(0);
                    self.prelaunch = Some(PrelaunchHelper { child, pid });
                }
                Err(err) => warn!(error = %err, "prelaunch command did not start"),
            }
        }
    }

    /// One heartbeat. Returns whether the scheduler should keep ticking.
    /// Tick-internal errors are logged here so the event loop never dies.
    pub fn beat(&mut self) -> bool {
        if self.finalized {
            return false;
        }
        match self.tick() {
            Ok(keep_ticking) => keep_ticking,
            Err(err) => {
                error!(error = %err, "heartbeat tick failed");
                true
            }
        }
    }

    fn tick(&mut self) -> Result<bool> {
        if let Some(spawn_error) = self.launcher.error.clone() {
            self.fail_run(spawn_error);
            return Ok(false);
        }

        // The kill switch is typically a device node (a controller); its
        // disappearance forces the game down.
        if let Some(killswitch) = &self.options.killswitch {
            if !killswitch.exists() {
                warn!(
                    "kill switch {} no longer present, force quitting the game",
                    killswitch.display()
                );
                self.force_stop();
                return Ok(false);
            }
        }

        let Some(game_pids) = self.game_pids() else {
            // Cannot compute the live set. That is "unknown", not "dead":
            // fall back to the owned process alone.
            if !self.launcher.is_running {
                debug!("owned process gone and live set unknown; treating the run as over");
                self.on_game_quit();
                return Ok(false);
            }
            return Ok(true);
        };

        if let Some(prelaunch) = &mut self.prelaunch {
            if prelaunch.is_running()
                && game_pids.len() == 1
                && game_pids.contains(&prelaunch.pid)
            {
                // Only the prelaunch helper is alive: the game has not
                // started yet, not stopped.
                return Ok(true);
            }
        }

        if !self.launcher.is_running && game_pids.is_empty() {
            debug!("game process tree has wound down");
            self.on_game_quit();
            return Ok(false);
        }
        Ok(true)
    }

    /// The live PID set for this run, or `None` when the prelaunch
    /// baseline is unavailable and the set cannot be computed safely.
    fn game_pids(&mut self) -> Option<HashSet<u32>> {
        let Some(baseline) = self.prelaunch_pids.as_ref().filter(|pids| !pids.is_empty()) else {
            if !self.degraded_baseline_reported {
                error!("no prelaunch PID baseline; the game's PIDs cannot be computed");
                self.degraded_baseline_reported = true;
            }
            return None;
        };
        let owned_pid = self.launcher.is_running.then_some(self.launcher.owned_pid).flatten();
        Some(scan_game_pids(
            baseline,
            self.options.game_dir.as_deref(),
            &self.launcher.env.run_token,
            owned_pid,
            &self.filter,
        ))
    }

    /// Handles the OS notification that the owned process exited. The
    /// process tree may well live on; the heartbeat keeps deciding.
    pub fn handle_exited(&mut self) {
        if !self.launcher.on_exited() {
            info!("full shutdown prevented");
            return;
        }
        // Fast path: when nothing else is alive, finalize without waiting
        // for the next heartbeat.
        match self.game_pids() {
            Some(pids) if pids.is_empty() => self.on_game_quit(),
            None if !self.launcher.is_running => self.on_game_quit(),
            _ => {}
        }
    }

    /// User- or UI-initiated graceful stop.
    pub fn request_stop(&mut self) {
        if self.state == MonitorState::Stopped {
            debug!("game already stopped");
            return;
        }
        info!("stopping {}", self.launcher.title);
        if self.launcher.stop() {
            self.on_game_quit();
        }
    }

    /// Forced stop: runner hook, bounded death watch, SIGKILL survivors,
    /// then finalize no matter what. Runs off the event loop and rejoins
    /// it through `Event::ForceStopDone`.
    pub fn force_stop(&mut self) {
        if self.force_stopping || self.finalized {
            return;
        }
        self.force_stopping = true;
        let runner = self.runner.clone();
        let death_watch = self.options.death_watch;
        let probe = self.stop_pid_probe();
        let events = self.events.clone();
        tokio::spawn(async move {
            runner.force_stop().await;
            let survivors = stop::death_watch(death_watch, &probe).await;
            if !survivors.is_empty() {
                warn!(?survivors, "processes survived the death watch; sending SIGKILL");
                stop::kill_survivors(&survivors);
            }
            // Finalize regardless; the frontend must not hang waiting for
            // a process the OS refuses to report on.
            let _ = events.send(Event::ForceStopDone).await;
        });
    }

    /// A standalone probe for the death watch: the same scan as
    /// `game_pids`, over data captured at call time.
    fn stop_pid_probe(&self) -> impl Fn() -> HashSet<u32> + Send + 'static {
        let baseline = self.prelaunch_pids.clone();
        let game_dir = self.options.game_dir.clone();
        let run_token = self.launcher.env.run_token.clone();
        let filter = self.filter.clone();
        let owned_pid = self.launcher.owned_pid;
        move || match baseline.as_ref().filter(|pids| !pids.is_empty()) {
            Some(baseline) => scan_game_pids(
                baseline,
                game_dir.as_deref(),
                &run_token,
                owned_pid,
                &filter,
            ),
            None => owned_pid
                .map(Process::new)
                .filter(|process| process.is_alive())
                .map(|process| HashSet::from([process.pid]))
                .unwrap_or_default(),
        }
    }

    /// Restores the environment and emits the terminal event. Idempotent:
    /// racing triggers (heartbeat vs. exit notification vs. force stop)
    /// finalize exactly once.
    pub fn on_game_quit(&mut self) {
        if self.finalized {
            debug!("stop sequence already finalized");
            return;
        }
        self.finalized = true;

        if let Some(prelaunch) = &mut self.prelaunch {
            if prelaunch.is_running() {
                info!("stopping prelaunch helper");
                prelaunch.stop();
            }
        }
        if self.screen_saver_inhibited {
            self.effects.screen_saver_uninhibit();
            self.screen_saver_inhibited = false;
        }
        if self.launcher.is_running {
            self.launcher.stop();
        }
        self.run_postexit();
        self.effects.restore_resolution();
        if self.compositor_disabled {
            self.effects.compositor_on();
            self.compositor_disabled = false;
        }
        if self.options.now_playing_path.exists() {
            if let Err(err) = std::fs::remove_file(&self.options.now_playing_path) {
                warn!(error = %err, "could not remove now-playing marker");
            }
        }

        self.advance(MonitorState::Stopped);

        let duration = self.started_at.map(|at| at.elapsed()).unwrap_or_default();
        let short_session = duration < self.options.short_session;
        if short_session && self.started_at.is_some() {
            warn!(
                seconds = duration.as_secs(),
                "the game ran for a very short time, did it crash?"
            );
        }
        debug!(
            "{} has run for {} seconds",
            self.launcher.title,
            duration.as_secs()
        );

        let report = RunReport {
            duration,
            return_code: self.launcher.return_code,
            short_session,
            diagnostic: diagnose_exit(self.launcher.return_code, &self.launcher.stdout()),
        };
        if self.events.try_send(Event::Stopped(report)).is_err() {
            warn!("terminal run event could not be delivered");
        }
    }

    fn run_postexit(&self) {
        let Some(command_line) = self.options.postexit_command.clone() else {
            return;
        };
        let argv = match shell_words::split(&command_line) {
            Ok(argv) if !argv.is_empty() => argv,
            Ok(_) => return,
            Err(err) => {
                warn!(error = %err, "unparseable post-exit command");
                return;
            }
        };
        if launcher::find_executable(&argv[0]).is_none() {
            warn!(command = %argv[0], "post-exit command not found");
            return;
        }
        info!(command = %command_line, "running post-exit command");
        let vars = self.launcher.env.vars.clone();
        tokio::spawn(async move {
            let status = tokio::process::Command::new(&argv[0])
                .args(&argv[1..])
                .envs(&vars)
                .status()
                .await;
            match status {
                Ok(status) if !status.success() => {
                    warn!(code = ?status.code(), "post-exit command failed");
                }
                Ok(_) => {}
                Err(err) => warn!(error = %err, "post-exit command did not run"),
            }
        });
    }

    fn fail_run(&mut self, error: String) {
        error!(error = %error, "error launching the game");
        if self
            .events
            .try_send(Event::Failed {
                error: error.clone(),
            })
            .is_err()
        {
            warn!("launch failure event could not be delivered");
        }
        self.on_game_quit();
    }

    fn advance(&mut self, next: MonitorState) {
        if next > self.state {
            self.state = next;
        } else if next < self.state {
            warn!(
                ?next,
                current = ?self.state,
                "ignoring backwards state transition"
            );
        }
    }
}

/// Scans `/proc` for this run's live processes: PIDs that appeared after
/// the baseline, whose command line points into the game directory (or a
/// known sandbox wrapper) and whose environment carries the run token.
fn scan_game_pids(
    baseline: &HashSet<u32>,
    game_dir: Option<&str>,
    run_token: &str,
    owned_pid: Option<u32>,
    filter: &ProcessFilter,
) -> HashSet<u32> {
    let new_pids = &proc::all_pids() - baseline;
    let candidates: Vec<Candidate> = new_pids
        .into_iter()
        .map(|pid| {
            let info = ProcessInfo::read(pid);
            Candidate {
                pid,
                name: info.name,
                cmdline: info.cmdline,
                run_token: info.environ.get(RUN_TOKEN_VAR).cloned(),
            }
        })
        .collect();
    let owned = owned_pid
        .map(Process::new)
        .filter(|process| process.is_alive())
        .map(|process| (process.pid, process.name().unwrap_or_default()));
    filter::select_game_pids(
        &candidates,
        game_dir,
        run_token,
        owned.as_ref().map(|(pid, name)| (*pid, name.as_str())),
        filter,
    )
}

/// Translates known exit-code/output pairs into actionable messages.
/// Best effort: no match simply means no special message.
fn diagnose_exit(return_code: Option<i32>, stdout: &str) -> Option<String> {
    match return_code? {
        127 => {
            let pattern = Regex::new("error while loading shared lib").ok()?;
            let line = stdout.lines().find(|line| pattern.is_match(line))?;
            Some(format!("Error: missing shared library.\n{line}"))
        }
        1 => {
            let pattern = Regex::new("maybe the wrong wineserver").ok()?;
            stdout.lines().any(|line| pattern.is_match(line)).then(|| {
                "Error: a different Wine version is already using the same Wine prefix."
                    .to_string()
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::NoopEffects;
    use crate::env::{LaunchEnvironment, UserEnv};
    use crate::launcher::LaunchSpec;
    use std::path::PathBuf;
    use uuid::Uuid;

    fn fake_wrapper() -> PathBuf {
        let path = std::env::temp_dir().join(format!("gamemon-test-wrapper-{}", Uuid::new_v4()));
        let script = "#!/bin/sh\nshift 3\n\"$@\"\ncode=$?\n\
                      echo \"$code\" > \"${TMPDIR:-/tmp}/gamemon-$GAMEMON_RUN_UUID\"\n\
                      exit $code\n";
        std::fs::write(&path, script).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    fn test_monitor(
        command: &[&str],
        wrapper: PathBuf,
        options: MonitorOptions,
    ) -> (LifecycleMonitor, mpsc::Receiver<Event>) {
        let spec = LaunchSpec {
            title: "Test Game".to_string(),
            command: command.iter().map(|token| token.to_string()).collect(),
            env: LaunchEnvironment::build(&UserEnv::new()),
            working_dir: Some("/tmp".to_string()),
            terminal: None,
            include_processes: Vec::new(),
            exclude_processes: Vec::new(),
        };
        let launcher = GameCommand::with_wrapper(spec, wrapper).unwrap();
        let (tx, rx) = mpsc::channel(64);
        let monitor = LifecycleMonitor::new(
            launcher,
            Runner::Native,
            ProcessFilter::default(),
            Box::new(NoopEffects),
            options,
            tx,
        );
        (monitor, rx)
    }

    fn scratch_now_playing() -> PathBuf {
        std::env::temp_dir().join(format!("gamemon-test-np-{}", Uuid::new_v4()))
    }

    fn count_stopped(rx: &mut mpsc::Receiver<Event>) -> usize {
        let mut stopped = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, Event::Stopped(_)) {
                stopped += 1;
            }
        }
        stopped
    }

    #[test]
    fn states_are_ordered_forward() {
        assert!(MonitorState::Launching < MonitorState::Running);
        assert!(MonitorState::Running < MonitorState::Stopped);
    }

    #[tokio::test]
    async fn finalization_is_idempotent() {
        let wrapper = fake_wrapper();
        let options = MonitorOptions {
            now_playing_path: scratch_now_playing(),
            ..MonitorOptions::default()
        };
        let (mut monitor, mut rx) = test_monitor(&["true"], wrapper.clone(), options);
        // Race simulation: heartbeat-detected death, the OS exit
        // notification and a second explicit quit all land.
        monitor.on_game_quit();
        monitor.handle_exited();
        monitor.on_game_quit();
        assert_eq!(count_stopped(&mut rx), 1);
        assert_eq!(monitor.state(), MonitorState::Stopped);
        assert!(!monitor.beat());
        std::fs::remove_file(wrapper).ok();
    }

    #[tokio::test]
    async fn state_never_regresses_after_stop() {
        let wrapper = fake_wrapper();
        let options = MonitorOptions {
            now_playing_path: scratch_now_playing(),
            ..MonitorOptions::default()
        };
        let (mut monitor, _rx) = test_monitor(&["true"], wrapper.clone(), options);
        monitor.on_game_quit();
        assert_eq!(monitor.state(), MonitorState::Stopped);
        monitor.advance(MonitorState::Running);
        assert_eq!(monitor.state(), MonitorState::Stopped);
        std::fs::remove_file(wrapper).ok();
    }

    #[tokio::test]
    async fn vetoed_stop_defers_finalization() {
        let wrapper = fake_wrapper();
        let options = MonitorOptions {
            now_playing_path: scratch_now_playing(),
            ..MonitorOptions::default()
        };
        let (mut monitor, mut rx) = test_monitor(&["true"], wrapper.clone(), options);
        monitor.launcher.set_stop_func(Box::new(|| false));
        monitor.request_stop();
        assert_eq!(count_stopped(&mut rx), 0);
        assert_ne!(monitor.state(), MonitorState::Stopped);
        // The hook releases its veto; the next stop goes through.
        monitor.launcher.set_stop_func(Box::new(|| true));
        monitor.request_stop();
        assert_eq!(count_stopped(&mut rx), 1);
        assert_eq!(monitor.state(), MonitorState::Stopped);
        std::fs::remove_file(wrapper).ok();
    }

    #[tokio::test]
    async fn vanished_killswitch_forces_a_bounded_stop() {
        let wrapper = fake_wrapper();
        let options = MonitorOptions {
            now_playing_path: scratch_now_playing(),
            killswitch: Some(PathBuf::from("/tmp/gamemon-test-killswitch-gone")),
            death_watch: DeathWatch {
                window: Duration::from_millis(100),
                interval: Duration::from_millis(50),
            },
            ..MonitorOptions::default()
        };
        let (mut monitor, mut rx) = test_monitor(&["true"], wrapper.clone(), options);
        assert!(!monitor.beat());
        let event = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Some(Event::ForceStopDone) => break Event::ForceStopDone,
                    Some(_) => continue,
                    None => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("force stop did not complete in time");
        assert!(matches!(event, Event::ForceStopDone));
        monitor.on_game_quit();
        assert_eq!(count_stopped(&mut rx), 1);
        std::fs::remove_file(wrapper).ok();
    }

    #[tokio::test]
    async fn short_lived_run_reaches_stopped_with_recovered_code() {
        let wrapper = fake_wrapper();
        let now_playing = scratch_now_playing();
        let options = MonitorOptions {
            heartbeat: Duration::from_millis(100),
            now_playing_path: now_playing.clone(),
            ..MonitorOptions::default()
        };
        let (mut monitor, mut rx) =
            test_monitor(&["sh", "-c", "exit 42"], wrapper.clone(), options);
        monitor.launch().await.unwrap();
        assert_eq!(monitor.state(), MonitorState::Running);
        let saw_running = monitor.launcher.is_running;
        assert_eq!(
            std::fs::read_to_string(&now_playing).unwrap(),
            "Test Game"
        );

        let mut heartbeat = tokio::time::interval(monitor.heartbeat_interval());
        let started = tokio::time::Instant::now();
        let report = loop {
            assert!(
                started.elapsed() < Duration::from_secs(20),
                "run did not stop in time"
            );
            tokio::select! {
                _ = heartbeat.tick() => {
                    monitor.beat();
                }
                event = rx.recv() => match event.expect("event channel closed") {
                    Event::Exited => monitor.handle_exited(),
                    Event::Stopped(report) => break report,
                    _ => {}
                }
            }
        };

        assert!(saw_running);
        assert_eq!(report.return_code, Some(42));
        assert!(report.short_session);
        assert_eq!(monitor.state(), MonitorState::Stopped);
        assert!(!now_playing.exists());
        std::fs::remove_file(wrapper).ok();
    }

    #[test]
    fn diagnoses_missing_shared_library() {
        let stdout = "starting\nfoo: error while loading shared libraries: libGL.so.1\n";
        let message = diagnose_exit(Some(127), stdout).unwrap();
        assert!(message.contains("missing shared library"));
        assert!(message.contains("libGL.so.1"));
    }

    #[test]
    fn diagnoses_wine_prefix_conflict() {
        let stdout = "wine: a wine server is running, maybe the wrong wineserver\n";
        let message = diagnose_exit(Some(1), stdout).unwrap();
        assert!(message.contains("Wine prefix"));
    }

    #[test]
    fn unknown_exits_have_no_diagnosis() {
        assert_eq!(diagnose_exit(None, "anything"), None);
        assert_eq!(diagnose_exit(Some(0), "error while loading shared lib"), None);
        assert_eq!(diagnose_exit(Some(127), "clean output"), None);
    }
}
