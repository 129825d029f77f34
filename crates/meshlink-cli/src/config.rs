//! Configuration loading.

use meshlink_types::MessagingConfig;
use std::path::Path;
use tracing::{info, warn};

/// Load the messaging config from a TOML file.
///
/// Missing, unreadable or malformed files fall back to defaults.
pub fn load_config(path: Option<&Path>) -> MessagingConfig {
    let Some(path) = path else {
        return MessagingConfig::default();
    };
    if !path.exists() {
        info!(path = %path.display(), "Config file not found, using defaults");
        return MessagingConfig::default();
    }

    match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str::<MessagingConfig>(&contents) {
            Ok(config) => {
                info!(path = %path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                warn!(
                    error = %e,
                    path = %path.display(),
                    "Failed to parse config, using defaults"
                );
                MessagingConfig::default()
            }
        },
        Err(e) => {
            warn!(
                error = %e,
                path = %path.display(),
                "Failed to read config file, using defaults"
            );
            MessagingConfig::default()
        }
    }
}
