//! Read-only `/proc` introspection.
//!
//! Every read here is best-effort: processes exit between enumeration and
//! detail reads all the time, so a vanished PID yields empty data rather
//! than an error. Child enumeration is thread-aware because some runtimes
//! spawn helper processes from worker threads, and a walk over the main
//! thread alone undercounts them.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;

/// A handle to a single OS process, identified by PID.
///
/// Holding a `Process` does not imply the process still exists; all
/// accessors re-read `/proc` and report absence as `None` or empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Process {
    pub pid: u32,
}

impl Process {
    pub fn new(pid: u32) -> Self {
        Self { pid }
    }

    /// Returns the current process.
    pub fn myself() -> Self {
        Self::new(std::process::id())
    }

    fn proc_path(&self, leaf: &str) -> PathBuf {
        PathBuf::from(format!("/proc/{}/{}", self.pid, leaf))
    }

    fn read_stat(&self) -> Option<String> {
        fs::read_to_string(self.proc_path("stat")).ok()
    }

    /// Executable name as the kernel reports it (the `comm` field,
    /// truncated to 15 bytes by the kernel itself).
    pub fn name(&self) -> Option<String> {
        let stat = self.read_stat()?;
        let start = stat.find('(')? + 1;
        let end = stat.rfind(')')?;
        if start > end {
            return None;
        }
        Some(stat[start..end].to_string())
    }

    /// One character from "RSDZTW"; `Z` marks a zombie that should not be
    /// counted as alive.
    pub fn state(&self) -> Option<char> {
        let stat = self.read_stat()?;
        let rest = &stat[stat.rfind(')')? + 1..];
        rest.split_whitespace().next()?.chars().next()
    }

    /// Whether the process exists and is not a zombie.
    pub fn is_alive(&self) -> bool {
        matches!(self.state(), Some(state) if state != 'Z')
    }

    /// Command line with NUL separators flattened to spaces. Empty for a
    /// process that has exited or whose cmdline is unreadable.
    pub fn cmdline(&self) -> Option<String> {
        let raw = fs::read(self.proc_path("cmdline")).ok()?;
        if raw.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&raw).replace('\0', " ");
        Some(text.trim_end().to_string())
    }

    /// Environment block of the process. Unreadable (permissions, exited)
    /// yields an empty map.
    pub fn environ(&self) -> HashMap<String, String> {
        let mut vars = HashMap::new();
        let Ok(raw) = fs::read(self.proc_path("environ")) else {
            return vars;
        };
        for entry in raw.split(|byte| *byte == 0) {
            if entry.is_empty() {
                continue;
            }
            let text = String::from_utf8_lossy(entry);
            if let Some((key, value)) = text.split_once('=') {
                vars.insert(key.to_string(), value.to_string());
            }
        }
        vars
    }

    /// Thread ids of this process, from `/proc/<pid>/task`.
    pub fn thread_ids(&self) -> Vec<u32> {
        let Ok(entries) = fs::read_dir(self.proc_path("task")) else {
            return Vec::new();
        };
        entries
            .flatten()
            .filter_map(|entry| entry.file_name().to_string_lossy().parse().ok())
            .collect()
    }

    fn children_of_thread(&self, tid: u32) -> Vec<u32> {
        let path = format!("/proc/{}/task/{}/children", self.pid, tid);
        let Ok(content) = fs::read_to_string(path) else {
            return Vec::new();
        };
        content
            .split_whitespace()
            .filter_map(|pid| pid.parse().ok())
            .collect()
    }

    /// Direct children, unioned over every thread of the process.
    pub fn children(&self) -> Vec<Process> {
        let mut seen = HashSet::new();
        let mut children = Vec::new();
        for tid in self.thread_ids() {
            for pid in self.children_of_thread(tid) {
                if seen.insert(pid) {
                    children.push(Process::new(pid));
                }
            }
        }
        children
    }

    /// Recursive closure of `children`, not including the process itself.
    pub fn descendants(&self) -> Vec<Process> {
        let mut result = Vec::new();
        let mut stack = self.children();
        let mut seen: HashSet<u32> = stack.iter().map(|process| process.pid).collect();
        while let Some(process) = stack.pop() {
            for child in process.children() {
                if seen.insert(child.pid) {
                    stack.push(child);
                }
            }
            result.push(process);
        }
        result
    }
}

/// A point-in-time detail read for one PID. Fields are empty when the
/// process disappeared between enumeration and this read.
#[derive(Debug, Clone, Default)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub cmdline: String,
    pub environ: HashMap<String, String>,
}

impl ProcessInfo {
    pub fn read(pid: u32) -> Self {
        let process = Process::new(pid);
        Self {
            pid,
            name: process.name().unwrap_or_default(),
            cmdline: process.cmdline().unwrap_or_default(),
            environ: process.environ(),
        }
    }
}

/// Every PID currently known to the kernel.
pub fn all_pids() -> HashSet<u32> {
    let Ok(entries) = fs::read_dir("/proc") else {
        return HashSet::new();
    };
    entries
        .flatten()
        .filter_map(|entry| entry.file_name().to_string_lossy().parse().ok())
        .collect()
}
