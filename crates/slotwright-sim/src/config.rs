use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use validator::Validate;

use slotwright_core::size::SizeOverrides;
use slotwright_core::{Breakpoint, LifecycleConfig};

fn default_log_level() -> LevelFilter {
    LevelFilter::Info
}

fn default_breakpoint() -> Breakpoint {
    Breakpoint::Desktop
}

fn default_container() -> String {
    "ad-slot-container".to_string()
}

fn default_run_secs() -> u64 {
    95
}

fn default_viewable_after_ms() -> u64 {
    1000
}

fn default_latency_ms() -> u64 {
    50
}

fn default_aps_price() -> f64 {
    1.5
}

fn default_prebid_price() -> f64 {
    1.25
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: LevelFilter,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// One slot placeholder on the simulated page.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PlaceholderConfig {
    #[validate(length(min = 1))]
    pub name: String,
    /// Space-separated wrapper classes, outermost first; each class is one
    /// nested element. Empty places the slot directly in the body.
    #[serde(default = "default_container")]
    pub container: String,
    /// Caller-supplied sizes merged over the configured defaults.
    #[serde(default)]
    pub extra_sizes: Option<SizeOverrides>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct PageConfig {
    #[serde(default = "default_breakpoint")]
    pub breakpoint: Breakpoint,
    /// Delay between a fill and the ad server's viewable signal.
    #[serde(default = "default_viewable_after_ms")]
    pub viewable_after_ms: u64,
    /// Hide the document for this window, `[from_secs, until_secs]`.
    #[serde(default)]
    pub hidden_window: Option<(u64, u64)>,
    #[validate(length(min = 1), nested)]
    pub placeholders: Vec<PlaceholderConfig>,
}

/// Simulated demand and ad server behaviour.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct MarketConfig {
    #[serde(default = "default_aps_price")]
    #[validate(range(min = 0.0))]
    pub aps_price: f64,
    #[serde(default = "default_prebid_price")]
    #[validate(range(min = 0.0))]
    pub prebid_price: f64,
    #[serde(default = "default_latency_ms")]
    #[validate(range(max = 10000))]
    pub latency_ms: u64,
    /// Slot ids the ad server never fills.
    #[serde(default)]
    pub unfilled: HashSet<String>,
    #[serde(default)]
    pub ineligible_line_items: HashSet<u64>,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            aps_price: default_aps_price(),
            prebid_price: default_prebid_price(),
            latency_ms: default_latency_ms(),
            unfilled: HashSet::new(),
            ineligible_line_items: HashSet::new(),
        }
    }
}

impl MarketConfig {
    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SimConfig {
    /// Run on a paused clock that jumps straight to the next timer.
    #[serde(default)]
    pub virtual_time: bool,
    #[serde(default = "default_run_secs")]
    #[validate(range(min = 1))]
    pub run_secs: u64,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[validate(nested)]
    pub page: PageConfig,
    #[serde(default)]
    #[validate(nested)]
    pub market: MarketConfig,
    #[serde(default)]
    #[validate(nested)]
    pub lifecycle: LifecycleConfig,
}

impl SimConfig {
    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        let cfg: SimConfig = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }
}
