//! Deciding which processes belong to a game run.
//!
//! Liveness detection cannot rely on the directly-owned child alone: games
//! re-exec through terminals and wrappers, Proton trees reparent to the
//! wrapper's subreaper, and helpers get spawned from worker threads. The
//! filter reconciles a candidate PID set against the run's correlation
//! token, the game's install directory and the user's include/exclude
//! lists.

use std::collections::HashSet;

use anyhow::Result;

/// Processes that are considered sufficiently self-managing by the
/// monitoring system. These are not counted as game processes when deciding
/// whether a game is still running, and gamemon never sends signals to
/// them. Wine games exit faster when the wine services tear themselves
/// down.
pub const SYSTEM_PROCESSES: &[&str] = &[
    "wineserver",
    "services.exe",
    "winedevice.exe",
    "plugplay.exe",
    "explorer.exe",
    "wineconsole",
    "svchost.exe",
    "rpcss.exe",
    "rundll32.exe",
    "mscorsvw.exe",
    "iexplore.exe",
    "start.exe",
    "winedbg.exe",
];

/// The kernel reports process names truncated to 15 bytes (TASK_COMM_LEN
/// minus the terminator); user-supplied names must be truncated the same
/// way before comparing.
pub const COMM_NAME_MAX: usize = 15;

/// Truncates a process name the way `/proc/<pid>/stat` reports it.
pub fn truncate_comm(name: &str) -> String {
    name.chars().take(COMM_NAME_MAX).collect()
}

/// Include/exclude reconciliation for process names.
///
/// The unmonitored set is `(exclude ∪ SYSTEM_PROCESSES) − include`, so an
/// explicit include wins over both the user exclude list and the fixed
/// system denylist.
#[derive(Debug, Clone)]
pub struct ProcessFilter {
    unmonitored: HashSet<String>,
}

impl Default for ProcessFilter {
    fn default() -> Self {
        Self::new(&[], &[])
    }
}

impl ProcessFilter {
    pub fn new(include: &[String], exclude: &[String]) -> Self {
        let include: HashSet<String> = include.iter().map(|name| truncate_comm(name)).collect();
        let mut unmonitored: HashSet<String> =
            exclude.iter().map(|name| truncate_comm(name)).collect();
        unmonitored.extend(SYSTEM_PROCESSES.iter().map(|name| truncate_comm(name)));
        Self {
            unmonitored: &unmonitored - &include,
        }
    }

    /// Builds a filter from whitespace-separated name lists, the form they
    /// take in configuration files.
    pub fn from_strings(include: &str, exclude: &str) -> Result<Self> {
        let include = shell_words::split(include)?;
        let exclude = shell_words::split(exclude)?;
        Ok(Self::new(&include, &exclude))
    }

    /// Whether a process with this name counts toward game liveness.
    pub fn is_monitored(&self, name: &str) -> bool {
        !self.unmonitored.contains(&truncate_comm(name))
    }
}

/// One candidate from a `/proc` scan, reduced to the fields the selection
/// algorithm needs.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub pid: u32,
    pub name: String,
    pub cmdline: String,
    /// Value of the correlation variable in the process environment, when
    /// readable.
    pub run_token: Option<String>,
}

/// Computes the authoritative "this game's processes" set from a candidate
/// scan.
///
/// A candidate counts when its command line mentions the game directory
/// (or a known sandboxing wrapper) AND its environment carries the run
/// token. Intersecting the two avoids over-matching unrelated processes
/// that share a directory name and under-matching processes whose environ
/// could not be read. The owned PID is unioned in when still alive, then
/// the name filter drops excluded processes.
pub fn select_game_pids(
    candidates: &[Candidate],
    game_dir: Option<&str>,
    run_token: &str,
    owned: Option<(u32, &str)>,
    filter: &ProcessFilter,
) -> HashSet<u32> {
    let path_matched: HashSet<u32> = candidates
        .iter()
        .filter(|candidate| {
            game_dir.is_some_and(|dir| !dir.is_empty() && candidate.cmdline.contains(dir))
                || candidate.cmdline.contains("pressure-vessel")
        })
        .map(|candidate| candidate.pid)
        .collect();
    let token_matched: HashSet<u32> = candidates
        .iter()
        .filter(|candidate| candidate.run_token.as_deref() == Some(run_token))
        .map(|candidate| candidate.pid)
        .collect();

    let mut pids: HashSet<u32> = (&path_matched & &token_matched)
        .into_iter()
        .filter(|pid| {
            candidates
                .iter()
                .find(|candidate| candidate.pid == *pid)
                .is_none_or(|candidate| {
                    candidate.name.is_empty() || filter.is_monitored(&candidate.name)
                })
        })
        .collect();

    if let Some((pid, name)) = owned {
        if filter.is_monitored(name) {
            pids.insert(pid);
        }
    }
    pids
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(pid: u32, name: &str, cmdline: &str, token: Option<&str>) -> Candidate {
        Candidate {
            pid,
            name: name.to_string(),
            cmdline: cmdline.to_string(),
            run_token: token.map(str::to_string),
        }
    }

    #[test]
    fn truncates_to_kernel_comm_length() {
        assert_eq!(truncate_comm("averyverylongprocessname"), "averyverylongpr");
        assert_eq!(truncate_comm("short"), "short");
    }

    #[test]
    fn filter_matches_truncated_names() {
        let filter = ProcessFilter::new(&[], &["averyverylongprocessname".to_string()]);
        // The kernel only ever reports the first 15 characters.
        assert!(!filter.is_monitored("averyverylongpr"));
        assert!(filter.is_monitored("unrelated"));
    }

    #[test]
    fn system_processes_are_unmonitored_by_default() {
        let filter = ProcessFilter::default();
        assert!(!filter.is_monitored("wineserver"));
        let filter = ProcessFilter::new(&[], &[]);
        assert!(!filter.is_monitored("services.exe"));
        assert!(filter.is_monitored("game.exe"));
    }

    #[test]
    fn include_overrides_system_denylist() {
        let filter = ProcessFilter::new(&["wineserver".to_string()], &[]);
        assert!(filter.is_monitored("wineserver"));
    }

    #[test]
    fn selection_is_intersection_of_path_and_token_matches() {
        let token = "token-1";
        let candidates = vec![
            candidate(1, "a", "/games/foo/a", None),
            candidate(2, "b", "/games/foo/b", Some(token)),
            candidate(3, "c", "/games/foo/c", Some(token)),
            candidate(4, "d", "/elsewhere/d", Some(token)),
        ];
        let filter = ProcessFilter::new(&[], &[]);
        let pids = select_game_pids(&candidates, Some("/games/foo"), token, None, &filter);
        assert_eq!(pids, HashSet::from([2, 3]));
    }

    #[test]
    fn sandbox_wrapper_counts_as_path_matched() {
        let token = "token-2";
        let candidates = vec![candidate(
            7,
            "pv-adverb",
            "pressure-vessel-adverb --foo",
            Some(token),
        )];
        let filter = ProcessFilter::new(&[], &[]);
        let pids = select_game_pids(&candidates, Some("/games/foo"), token, None, &filter);
        assert_eq!(pids, HashSet::from([7]));
    }

    #[test]
    fn exclude_drops_matched_candidates() {
        let token = "token-3";
        let candidates = vec![
            candidate(1, "game", "/games/foo/game", Some(token)),
            candidate(2, "helper", "/games/foo/helper", Some(token)),
        ];
        let filter = ProcessFilter::new(&[], &["helper".to_string()]);
        let pids = select_game_pids(&candidates, Some("/games/foo"), token, None, &filter);
        assert_eq!(pids, HashSet::from([1]));
    }

    #[test]
    fn include_restores_denylisted_candidates() {
        let token = "token-4";
        let candidates = vec![candidate(
            9,
            "wineserver",
            "/games/foo/wineserver",
            Some(token),
        )];
        let excluded = ProcessFilter::new(&[], &[]);
        let included = ProcessFilter::new(&["wineserver".to_string()], &[]);
        assert!(
            select_game_pids(&candidates, Some("/games/foo"), token, None, &excluded).is_empty()
        );
        assert_eq!(
            select_game_pids(&candidates, Some("/games/foo"), token, None, &included),
            HashSet::from([9])
        );
    }

    #[test]
    fn owned_pid_is_unioned_unless_excluded() {
        // The owned process needs no path or token match of its own.
        let filter = ProcessFilter::new(&[], &[]);
        let pids = select_game_pids(&[], None, "token", Some((42, "gamemon-wrapper")), &filter);
        assert_eq!(pids, HashSet::from([42]));

        let filter = ProcessFilter::new(&[], &["gamemon-wrapper".to_string()]);
        let pids = select_game_pids(&[], None, "token", Some((42, "gamemon-wrapper")), &filter);
        assert!(pids.is_empty());
    }
}
