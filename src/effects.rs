//! Desktop side effects around a run.
//!
//! Compositor toggling, screen-saver inhibition and resolution restore are
//! external collaborators: gamemon only fires the configured commands and
//! never inspects their output. The trait seam keeps the lifecycle monitor
//! testable without touching the desktop.

use shell_words::split;
use tracing::{debug, warn};

use crate::config::EffectsConfig;

/// Side effects applied before a run and restored, in fixed order, before
/// the terminal run event fires.
pub trait DesktopEffects: Send {
    fn compositor_off(&mut self) {}
    fn compositor_on(&mut self) {}
    /// Returns whether an inhibition was actually taken (and therefore
    /// must be released later).
    fn screen_saver_inhibit(&mut self, _game: &str) -> bool {
        false
    }
    fn screen_saver_uninhibit(&mut self) {}
    fn restore_resolution(&mut self) {}
}

/// Does nothing; for headless use and tests.
#[derive(Debug, Default)]
pub struct NoopEffects;

impl DesktopEffects for NoopEffects {}

/// Runs user-configured commands, detached, for each effect.
#[derive(Debug)]
pub struct CommandEffects {
    config: EffectsConfig,
}

impl CommandEffects {
    pub fn new(config: EffectsConfig) -> Self {
        Self { config }
    }

    fn run(&self, command_line: Option<&String>) -> bool {
        let Some(command_line) = command_line else {
            return false;
        };
        let argv = match split(command_line) {
            Ok(argv) if !argv.is_empty() => argv,
            Ok(_) => return false,
            Err(err) => {
                warn!(error = %err, command = %command_line, "unparseable effect command");
                return false;
            }
        };
        debug!(command = %command_line, "running desktop effect command");
        // Fire and forget; effects must never stall the event loop.
        tokio::spawn(async move {
            match tokio::process::Command::new(&argv[0]).args(&argv[1..]).status().await {
                Ok(status) if !status.success() => {
                    warn!(command = %argv[0], code = ?status.code(), "effect command failed");
                }
                Ok(_) => {}
                Err(err) => warn!(command = %argv[0], error = %err, "effect command did not run"),
            }
        });
        true
    }
}

impl DesktopEffects for CommandEffects {
    fn compositor_off(&mut self) {
        self.run(self.config.compositor_off.as_ref());
    }

    fn compositor_on(&mut self) {
        self.run(self.config.compositor_on.as_ref());
    }

    fn screen_saver_inhibit(&mut self, _game: &str) -> bool {
        self.run(self.config.screen_saver_inhibit.as_ref())
    }

    fn screen_saver_uninhibit(&mut self) {
        self.run(self.config.screen_saver_uninhibit.as_ref());
    }

    fn restore_resolution(&mut self) {
        self.run(self.config.restore_resolution.as_ref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_effects_do_nothing() {
        let mut effects = CommandEffects::new(EffectsConfig::default());
        assert!(!effects.screen_saver_inhibit("Example Quest"));
        effects.compositor_off();
        effects.compositor_on();
    }

    #[tokio::test]
    async fn configured_inhibit_reports_taken() {
        let mut effects = CommandEffects::new(EffectsConfig {
            screen_saver_inhibit: Some("true".to_string()),
            ..EffectsConfig::default()
        });
        assert!(effects.screen_saver_inhibit("Example Quest"));
    }
}
