//! Builds the environment handed to a launched game.
//!
//! The builder injects the per-run correlation token and sanitizes
//! user-supplied variables: a key containing `=` would corrupt the exec
//! environment block, a missing value is meaningless, and non-string
//! values (numbers, booleans straight out of a TOML table) are coerced.
//! The OS-inherited environment is deliberately not merged here; the exec
//! site overlays these variables on the inherited block, so the builder's
//! keys win.

use std::collections::HashMap;

use tracing::warn;
use uuid::Uuid;

/// Environment variable carrying the run token. Wrappers and helper
/// scripts must propagate it unchanged for process correlation to work.
pub const RUN_TOKEN_VAR: &str = "GAMEMON_RUN_UUID";

/// User-supplied environment entries as they come out of configuration: a
/// value may be any TOML type, or absent entirely.
pub type UserEnv = HashMap<String, Option<toml::Value>>;

/// The final variable set for a run, plus the token generated for it.
#[derive(Debug, Clone)]
pub struct LaunchEnvironment {
    pub vars: HashMap<String, String>,
    pub run_token: String,
}

impl LaunchEnvironment {
    /// Sanitizes `user_env` and injects a fresh run token. The caller's
    /// map is never mutated, and a new token is generated on every call.
    pub fn build(user_env: &UserEnv) -> Self {
        let run_token = Uuid::new_v4().to_string();
        let mut vars = HashMap::new();

        for (key, value) in user_env {
            if key.contains('=') {
                warn!(key = %key, "environment variable name contains '='; skipping");
                continue;
            }
            match value {
                None => {
                    warn!(key = %key, "environment variable has no value; skipping");
                }
                Some(toml::Value::String(text)) => {
                    vars.insert(key.clone(), text.clone());
                }
                Some(other) => {
                    warn!(
                        key = %key,
                        value = %other,
                        "environment variable value is not a string; converting"
                    );
                    vars.insert(key.clone(), coerce(other));
                }
            }
        }

        // Wrapper and terminal scripts run from arbitrary working
        // directories and still need to resolve tools.
        if !vars.contains_key("PATH") {
            if let Ok(path) = std::env::var("PATH") {
                vars.insert("PATH".to_string(), path);
            }
        }

        vars.insert(RUN_TOKEN_VAR.to_string(), run_token.clone());
        Self { vars, run_token }
    }
}

fn coerce(value: &toml::Value) -> String {
    match value {
        toml::Value::String(text) => text.clone(),
        toml::Value::Integer(number) => number.to_string(),
        toml::Value::Float(number) => number.to_string(),
        toml::Value::Boolean(flag) => flag.to_string(),
        other => other.to_string(),
    }
}
