//! Hub settings from a TOML file.
//!
//! Every section is optional; anything left out keeps its default.
//!
//! ```toml
//! instance_id = "hub-eu-1"
//!
//! [latency]
//! percentile = 99.0
//! safety_factor = 2.0
//!
//! [circuit_breaker]
//! failure_threshold = 3
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use tether_protocol::config::HubConfig;

/// Load and validate. `None` means built-in defaults.
pub fn load(path: Option<&Path>) -> Result<HubConfig> {
    let config = match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            parse(&raw).with_context(|| format!("failed to load config file {}", path.display()))?
        }
        None => HubConfig::default(),
    };
    Ok(config)
}

pub fn parse(raw: &str) -> Result<HubConfig> {
    let config: HubConfig = toml::from_str(raw).context("malformed hub configuration")?;
    config.validate().context("invalid hub configuration")?;
    Ok(config)
}

/// Config for the `index`-th in-process instance. All but the first get a
/// suffixed instance id.
pub fn for_instance(base: &HubConfig, index: u16) -> HubConfig {
    let mut config = base.clone();
    if index > 0 {
        config.instance_id = format!("{}-{}", base.instance_id, index);
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config = parse(
            r#"
            instance_id = "hub-eu-1"

            [circuit_breaker]
            failure_threshold = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.instance_id, "hub-eu-1");
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.circuit_breaker.success_threshold, 2);
        assert_eq!(config.latency.max_timeout_ms, 60_000);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = parse(
            r#"
            [latency]
            min_timeout_ms = 90000
            "#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("invalid hub configuration"));
    }

    #[test]
    fn extra_instances_get_distinct_ids() {
        let base = HubConfig::with_instance_id("hub");
        assert_eq!(for_instance(&base, 0).instance_id, "hub");
        assert_eq!(for_instance(&base, 2).instance_id, "hub-2");
    }
}
