use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};

fn default_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_command_prefix() -> String {
    "!/".to_string()
}

fn default_recovery_prompt() -> String {
    "Your previous response was empty. Please provide a complete response.".to_string()
}

/// On-disk TOML configuration (spec.md §9 "config is TOML, not code"),
/// layered under CLI flags and environment variables at startup.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FileConfig {
    pub addr: String,
    pub command_prefix: String,
    pub disable_auth: bool,
    pub disable_commands: bool,
    pub disable_interactive_commands: bool,
    pub default_backend: Option<String>,
    pub thinking_budget: Option<u32>,
    pub auth_keys: Vec<String>,
    pub backends: HashMap<String, BackendEntry>,
    pub capture_file: Option<PathBuf>,
    pub capture_max_bytes: u64,
    pub capture_max_files: u32,
    pub capture_total_max_bytes: u64,
    pub capture_truncate_bytes: usize,
    pub recovery_prompt: String,
    /// Gates `JsonRepairMiddleware` (spec.md §4.9 middleware-3, "optional,
    /// config-gated"). TOML-only; off by default.
    pub json_repair_enabled: bool,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            command_prefix: default_command_prefix(),
            disable_auth: false,
            disable_commands: false,
            disable_interactive_commands: false,
            default_backend: None,
            thinking_budget: None,
            auth_keys: Vec::new(),
            backends: HashMap::new(),
            capture_file: None,
            capture_max_bytes: 10 * 1024 * 1024,
            capture_max_files: 5,
            capture_total_max_bytes: 100 * 1024 * 1024,
            capture_truncate_bytes: 64 * 1024,
            recovery_prompt: default_recovery_prompt(),
            json_repair_enabled: false,
        }
    }
}

/// One configured backend: its base URL, adapter kind, and API keys (multiple
/// keys round-robin under the `mk`/`km` failover policies, spec.md §4.5).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendEntry {
    pub kind: String,
    pub base_url: String,
    #[serde(default)]
    pub keys: Vec<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("parsing config file {}", path.display()))
    }
}

/// Reads a key's environment family per spec.md §6 `<BACKEND>_API_KEY[_N]`:
/// `OPENAI_API_KEY`, `OPENAI_API_KEY_2`, `OPENAI_API_KEY_3`, ...
pub fn env_api_keys(backend: &str) -> Vec<String> {
    let prefix = format!("{}_API_KEY", backend.to_uppercase());
    let mut keys = Vec::new();
    if let Ok(v) = std::env::var(&prefix) {
        if !v.is_empty() {
            keys.push(v);
        }
    }
    let mut n = 2;
    loop {
        match std::env::var(format!("{prefix}_{n}")) {
            Ok(v) if !v.is_empty() => {
                keys.push(v);
                n += 1;
            }
            _ => break,
        }
    }
    keys
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Interactive LLM reverse proxy")]
pub struct Args {
    /// Path to a TOML config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Address to bind the HTTP service to
    #[arg(long)]
    pub addr: Option<String>,

    /// In-band command prefix override
    #[arg(long, env = "COMMAND_PREFIX")]
    pub command_prefix: Option<String>,

    /// Disable bearer-token auth entirely
    #[arg(long, env = "DISABLE_AUTH")]
    pub disable_auth: bool,

    /// Disable in-band command processing entirely
    #[arg(long, env = "DISABLE_COMMANDS")]
    pub disable_commands: bool,

    /// Disable only the interactive subset of commands
    #[arg(long, env = "DISABLE_INTERACTIVE_COMMANDS")]
    pub disable_interactive_commands: bool,

    /// Backend used when no session override or qualified model is given
    #[arg(long, env = "DEFAULT_BACKEND")]
    pub default_backend: Option<String>,

    /// CLI/env override for reasoning effort; gates `reasoning-effort` and
    /// `thinking-budget` in-band commands (spec.md §4.4, §6).
    #[arg(long, env = "THINKING_BUDGET")]
    pub thinking_budget: Option<u32>,

    /// File to append wire-capture records to
    #[arg(long)]
    pub capture_file: Option<PathBuf>,
}

/// Applies CLI/env overrides on top of a loaded (or default) file config.
/// Precedence: CLI flag / explicit env var > config file > built-in default.
pub fn resolve_config(args: &Args) -> Result<FileConfig> {
    let mut config = match &args.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };

    if let Some(addr) = &args.addr {
        config.addr = addr.clone();
    }
    if let Some(prefix) = &args.command_prefix {
        config.command_prefix = prefix.clone();
    }
    if args.disable_auth {
        config.disable_auth = true;
    }
    if args.disable_commands {
        config.disable_commands = true;
    }
    if args.disable_interactive_commands {
        config.disable_interactive_commands = true;
    }
    if let Some(backend) = &args.default_backend {
        config.default_backend = Some(backend.clone());
    }
    if let Some(budget) = args.thinking_budget {
        config.thinking_budget = Some(budget);
    }
    if let Some(capture_file) = &args.capture_file {
        config.capture_file = Some(capture_file.clone());
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_flag_overrides_file_default() {
        let args = Args {
            config: None,
            addr: Some("127.0.0.1:9000".to_string()),
            command_prefix: None,
            disable_auth: false,
            disable_commands: false,
            disable_interactive_commands: false,
            default_backend: None,
            thinking_budget: None,
            capture_file: None,
        };
        let config = resolve_config(&args).unwrap();
        assert_eq!(config.addr, "127.0.0.1:9000");
        assert_eq!(config.command_prefix, "!/");
    }

    #[test]
    fn env_api_keys_stops_at_first_gap() {
        std::env::set_var("TESTBACKEND_API_KEY", "k1");
        std::env::set_var("TESTBACKEND_API_KEY_2", "k2");
        std::env::remove_var("TESTBACKEND_API_KEY_3");
        let keys = env_api_keys("testbackend");
        assert_eq!(keys, vec!["k1".to_string(), "k2".to_string()]);
        std::env::remove_var("TESTBACKEND_API_KEY");
        std::env::remove_var("TESTBACKEND_API_KEY_2");
    }
}
