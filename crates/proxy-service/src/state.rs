use parking_lot::RwLock;
use proxy_core::command::ApplicationState;

use crate::config::FileConfig;

/// The service's `ApplicationState` implementation (spec.md §4.4). Holds the
/// process-wide knobs command handlers may read, and the mutable pieces a
/// handler can persist back out via `save_config`.
pub struct ServiceState {
    config: RwLock<FileConfig>,
    functional_backends: Vec<String>,
    config_path: Option<std::path::PathBuf>,
}

impl ServiceState {
    pub fn new(config: FileConfig, functional_backends: Vec<String>, config_path: Option<std::path::PathBuf>) -> Self {
        Self {
            config: RwLock::new(config),
            functional_backends,
            config_path,
        }
    }

    pub fn snapshot(&self) -> FileConfig {
        self.config.read().clone()
    }
}

impl ApplicationState for ServiceState {
    fn command_prefix(&self) -> String {
        self.config.read().command_prefix.clone()
    }

    fn redaction_enabled(&self) -> bool {
        true
    }

    fn functional_backends(&self) -> Vec<String> {
        self.functional_backends.clone()
    }

    fn project_name(&self) -> &str {
        env!("CARGO_PKG_NAME")
    }

    fn project_version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn thinking_budget_cli_override(&self) -> Option<u32> {
        self.config.read().thinking_budget
    }

    fn save_config(&self, key: &str, value: &str) -> bool {
        {
            let mut config = self.config.write();
            match key {
                "default-backend" => config.default_backend = Some(value.to_string()),
                "command-prefix" => config.command_prefix = value.to_string(),
                _ => return false,
            }
        }
        let Some(path) = &self.config_path else {
            return false;
        };
        let config = self.config.read().clone();
        match toml::to_string_pretty(&config) {
            Ok(text) => std::fs::write(path, text).is_ok(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_config_without_a_path_updates_memory_but_reports_unbound() {
        let state = ServiceState::new(FileConfig::default(), vec!["openai".to_string()], None);
        assert!(!state.save_config("default-backend", "openai"));
        assert_eq!(state.snapshot().default_backend, Some("openai".to_string()));
    }

    #[test]
    fn unknown_key_is_rejected() {
        let state = ServiceState::new(FileConfig::default(), vec![], None);
        assert!(!state.save_config("nonsense", "x"));
    }
}
