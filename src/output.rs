//! Output handling and buffering for game logs.
//!
//! Game output is drained non-blocking from the wrapper's merged pipe,
//! decoded permissively, filtered for known noise and kept in a bounded
//! ring buffer so a chatty game cannot grow memory without limit.

use std::collections::VecDeque;

use strip_ansi_escapes::strip;

/// Indicates the source stream of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// A single line of output from the game process tree.
#[derive(Debug, Clone)]
pub struct LogLine {
    pub text: String,
    pub stream: StreamKind,
}

/// A fixed-capacity ring buffer for storing `LogLine`s.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    max_lines: usize,
    lines: VecDeque<LogLine>,
}

impl LogBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines,
            lines: VecDeque::with_capacity(max_lines.min(1024)),
        }
    }

    /// Adds a line to the buffer.
    ///
    /// Returns `true` if an old line was dropped to make room.
    pub fn push(&mut self, line: LogLine) -> bool {
        let mut dropped = false;
        self.lines.push_back(line);
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
            dropped = true;
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogLine> {
        self.lines.iter()
    }

    /// The buffered text as one string, for diagnostics that search the
    /// whole output.
    pub fn text(&self) -> String {
        let mut text = String::new();
        for line in &self.lines {
            text.push_str(&line.text);
            text.push('\n');
        }
        text
    }
}

/// Filter out messages we don't want to keep or show to the user.
///
/// These lines come from GStreamer, gamemode and VR plumbing underneath
/// basically every Wine game and carry no signal about the game itself.
pub fn is_noise(line: &str) -> bool {
    line.contains("GStreamer-WARNING **")
        || line.contains("Bad file descriptor")
        || line.contains("'libgamemodeauto.so.0' from LD_PRELOAD")
        || line.contains("Unable to read VR Path Registry")
        || line.contains("winemenubuilder.exe")
}

/// Sanitizes text for display, optionally stripping ANSI escape codes.
/// Invalid UTF-8 sequences are replaced.
pub fn sanitize_text(text: &str, strip_ansi: bool) -> String {
    if !strip_ansi {
        return text.to_string();
    }
    let stripped = strip(text.as_bytes());
    String::from_utf8_lossy(&stripped).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(text: &str) -> LogLine {
        LogLine {
            text: text.into(),
            stream: StreamKind::Stdout,
        }
    }

    #[test]
    fn log_buffer_drops_oldest() {
        let mut buffer = LogBuffer::new(2);
        buffer.push(line("a"));
        buffer.push(line("b"));
        let dropped = buffer.push(line("c"));
        assert!(dropped);
        let lines: Vec<String> = buffer.iter().map(|entry| entry.text.clone()).collect();
        assert_eq!(lines, vec!["b", "c"]);
    }

    #[test]
    fn buffer_text_joins_lines() {
        let mut buffer = LogBuffer::new(8);
        buffer.push(line("first"));
        buffer.push(line("second"));
        assert_eq!(buffer.text(), "first\nsecond\n");
    }

    #[test]
    fn known_noise_is_filtered() {
        assert!(is_noise("(game:123): GStreamer-WARNING **: 01:02:03 failed"));
        assert!(is_noise(
            "ERROR: ld.so: object 'libgamemodeauto.so.0' from LD_PRELOAD cannot be preloaded"
        ));
        assert!(is_noise("Unable to read VR Path Registry from /home/user"));
        assert!(is_noise("winemenubuilder.exe exited"));
        assert!(!is_noise("Loaded save slot 3"));
    }

    #[test]
    fn sanitize_strips_ansi_codes() {
        assert_eq!(sanitize_text("\x1b[31mred\x1b[0m", true), "red");
        assert_eq!(
            sanitize_text("\x1b[31mred\x1b[0m", false),
            "\x1b[31mred\x1b[0m"
        );
    }
}
