//! gamemon-wrapper: the indirection helper every game is started through.
//!
//! The wrapper makes itself a child subreaper so double-forked game
//! processes reparent here instead of to PID 1, forwards SIGTERM/SIGINT to
//! the monitored part of the tree, waits until that tree has wound down
//! and records the innermost command's exit code in a side file keyed by
//! the run token. Its argv doubles as documentation in `ps` output:
//!
//!   gamemon-wrapper TITLE N_INCLUDE N_EXCLUDE [include...] [exclude...] cmd [args...]

#[cfg(unix)]
fn main() {
    unix::run();
}

#[cfg(not(unix))]
fn main() {
    eprintln!("gamemon-wrapper is only supported on unix platforms");
    std::process::exit(1);
}

#[cfg(unix)]
mod unix {
    use std::process::{exit, Command};
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::time::Duration;

    use gamemon::env::RUN_TOKEN_VAR;
    use gamemon::filter::ProcessFilter;
    use gamemon::proc::Process;

    const POLL_INTERVAL: Duration = Duration::from_millis(250);

    static PENDING_SIGNAL: AtomicI32 = AtomicI32::new(0);

    extern "C" fn on_signal(signal: libc::c_int) {
        PENDING_SIGNAL.store(signal, Ordering::SeqCst);
    }

    /// A subreaper fulfills the role of init(1) for its descendants: when
    /// an intermediate process exits, its orphans reparent to the nearest
    /// living ancestor subreaper instead of PID 1, so this process can
    /// still enumerate and reap them.
    fn set_child_subreaper() {
        let result = unsafe {
            libc::prctl(
                libc::PR_SET_CHILD_SUBREAPER,
                1 as libc::c_ulong,
                0 as libc::c_ulong,
                0 as libc::c_ulong,
                0 as libc::c_ulong,
            )
        };
        if result == -1 {
            eprintln!("gamemon-wrapper: PR_SET_CHILD_SUBREAPER failed, process watching may be unreliable");
        }
    }

    fn parse_args() -> Result<(ProcessFilter, Vec<String>), String> {
        let mut args = std::env::args().skip(1);
        // The title is only there so `ps` shows which game this tree is.
        let _title = args.next().ok_or("missing title argument")?;
        let include_count: usize = args
            .next()
            .ok_or("missing include count")?
            .parse()
            .map_err(|_| "include count is not a number")?;
        let exclude_count: usize = args
            .next()
            .ok_or("missing exclude count")?
            .parse()
            .map_err(|_| "exclude count is not a number")?;
        let rest: Vec<String> = args.collect();
        if rest.len() <= include_count + exclude_count {
            return Err("missing command".to_string());
        }
        let include = &rest[..include_count];
        let exclude = &rest[include_count..include_count + exclude_count];
        let command = rest[include_count + exclude_count..].to_vec();
        Ok((ProcessFilter::new(include, exclude), command))
    }

    /// Live, monitored descendants of this process. A nameless process is
    /// counted: it cannot be proven excluded.
    fn monitored_children(filter: &ProcessFilter) -> Vec<u32> {
        Process::myself()
            .descendants()
            .into_iter()
            .filter(|process| process.is_alive())
            .filter(|process| {
                process
                    .name()
                    .map_or(true, |name| filter.is_monitored(&name))
            })
            .map(|process| process.pid)
            .collect()
    }

    fn forward_pending_signal(filter: &ProcessFilter) {
        let signal = PENDING_SIGNAL.swap(0, Ordering::SeqCst);
        if signal == 0 {
            return;
        }
        for pid in monitored_children(filter) {
            unsafe {
                libc::kill(pid as libc::c_int, signal);
            }
        }
    }

    /// Reaps any zombie descendants without blocking.
    fn reap_zombies() {
        loop {
            let mut status = 0;
            let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
            if pid <= 0 {
                break;
            }
        }
    }

    fn exit_code(status: std::process::ExitStatus) -> i32 {
        use std::os::unix::process::ExitStatusExt;
        status
            .code()
            .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
    }

    fn write_return_code(code: i32) {
        let Ok(run_token) = std::env::var(RUN_TOKEN_VAR) else {
            eprintln!("gamemon-wrapper: {RUN_TOKEN_VAR} not set; exit code not recorded");
            return;
        };
        let path = std::env::temp_dir().join(format!("gamemon-{run_token}"));
        if let Err(err) = std::fs::write(&path, code.to_string()) {
            eprintln!(
                "gamemon-wrapper: could not write return code to {}: {err}",
                path.display()
            );
        }
    }

    pub fn run() {
        set_child_subreaper();
        let (filter, command) = match parse_args() {
            Ok(parsed) => parsed,
            Err(message) => {
                eprintln!("gamemon-wrapper: {message}");
                exit(2);
            }
        };

        unsafe {
            libc::signal(libc::SIGTERM, on_signal as libc::sighandler_t);
            libc::signal(libc::SIGINT, on_signal as libc::sighandler_t);
        }

        let mut child = match Command::new(&command[0]).args(&command[1..]).spawn() {
            Ok(child) => child,
            Err(err) => {
                eprintln!("gamemon-wrapper: failed to execute {}: {err}", command[0]);
                write_return_code(127);
                exit(127);
            }
        };

        // Phase one: the direct child is alive. Only targeted waits here,
        // so its exit status is not stolen by a stray reap.
        let code = loop {
            forward_pending_signal(&filter);
            match child.try_wait() {
                Ok(Some(status)) => break exit_code(status),
                Ok(None) => std::thread::sleep(POLL_INTERVAL),
                Err(err) => {
                    eprintln!("gamemon-wrapper: wait failed: {err}");
                    break 0;
                }
            }
        };

        // Phase two: the command is gone, but the tree it spawned may not
        // be. Keep reaping until no monitored process remains.
        while !monitored_children(&filter).is_empty() {
            forward_pending_signal(&filter);
            reap_zombies();
            std::thread::sleep(POLL_INTERVAL);
        }
        reap_zombies();

        write_return_code(code);
        exit(code);
    }
}
