use serde::Deserialize;

/// Root configuration. Loaded from environment variables with the prefix
/// `WAYFINDER__` and an optional TOML config file.
#[derive(Debug, Clone, Deserialize)]
pub struct WayfinderConfig {
    #[serde(default = "default_app_id")]
    pub app_id: String,
    #[serde(default)]
    pub player: PlayerConfig,
    #[serde(default)]
    pub targeting: TargetingConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub analytics: AnalyticsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlayerConfig {
    /// Longest run of transparently skipped nodes before the flow errors.
    #[serde(default = "default_max_skip_chain")]
    pub max_skip_chain: usize,
    /// Capacity of the command channel feeding a spawned player.
    #[serde(default = "default_command_buffer")]
    pub command_buffer: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetingConfig {
    #[serde(default = "default_selector_timeout_ms")]
    pub selector_timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_retry_transient")]
    pub retry_transient: bool,
    /// Custom endpoint for `analytics` actions that declare none.
    #[serde(default)]
    pub analytics_endpoint: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalyticsConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

// Default functions
fn default_app_id() -> String {
    "local-app".to_string()
}
fn default_max_skip_chain() -> usize {
    32
}
fn default_command_buffer() -> usize {
    64
}
fn default_selector_timeout_ms() -> u64 {
    3000
}
fn default_poll_interval_ms() -> u64 {
    100
}
fn default_request_timeout_ms() -> u64 {
    5000
}
fn default_retry_transient() -> bool {
    true
}
fn default_batch_size() -> usize {
    100
}
fn default_flush_interval_ms() -> u64 {
    1000
}
fn default_channel_capacity() -> usize {
    10_000
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            max_skip_chain: default_max_skip_chain(),
            command_buffer: default_command_buffer(),
        }
    }
}

impl Default for TargetingConfig {
    fn default() -> Self {
        Self {
            selector_timeout_ms: default_selector_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            retry_transient: default_retry_transient(),
            analytics_endpoint: None,
        }
    }
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for WayfinderConfig {
    fn default() -> Self {
        Self {
            app_id: default_app_id(),
            player: PlayerConfig::default(),
            targeting: TargetingConfig::default(),
            dispatch: DispatchConfig::default(),
            analytics: AnalyticsConfig::default(),
        }
    }
}

impl WayfinderConfig {
    /// Load configuration from environment variables and an optional config file.
    pub fn load(file: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }
        let builder = builder.add_source(
            config::Environment::with_prefix("WAYFINDER")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WayfinderConfig::default();
        assert_eq!(config.targeting.selector_timeout_ms, 3000);
        assert_eq!(config.player.max_skip_chain, 32);
        assert!(config.dispatch.retry_transient);
        assert!(config.dispatch.analytics_endpoint.is_none());
    }

    #[test]
    fn test_partial_section_falls_back_to_defaults() {
        let config: WayfinderConfig = serde_json::from_value(serde_json::json!({
            "app_id": "acme",
            "targeting": { "selector_timeout_ms": 500 }
        }))
        .unwrap();
        assert_eq!(config.app_id, "acme");
        assert_eq!(config.targeting.selector_timeout_ms, 500);
        assert_eq!(config.targeting.poll_interval_ms, 100);
        assert_eq!(config.analytics.batch_size, 100);
    }
}
