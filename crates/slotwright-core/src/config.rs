use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use validator::Validate;

use crate::error::ConfigError;
use crate::size::{AdSize, SizeMapping};

/// Shortest refresh interval the ad server tolerates.
pub const MIN_REFRESH_INTERVAL_SECS: u64 = 30;

fn default_ad_unit_path() -> String {
    "/1234/site".to_string()
}

fn default_dom_id_prefix() -> String {
    "dfp-ad".to_string()
}

fn default_label_height() -> u32 {
    24
}

fn default_true() -> bool {
    true
}

fn default_refresh_interval() -> u64 {
    MIN_REFRESH_INTERVAL_SECS
}

fn default_size_sensitive_slots() -> Vec<String> {
    vec!["top-above-nav".to_string(), "fronts-banner".to_string()]
}

fn default_passback_sizes() -> Vec<AdSize> {
    vec![
        AdSize::new(620, 350),
        AdSize::new(300, 197),
        AdSize::new(550, 310),
    ]
}

fn default_empty_sample_rate() -> f64 {
    0.0001
}

fn default_partner_timeout_ms() -> u64 {
    1500
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RefreshConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_refresh_interval")]
    #[validate(range(min = 30))]
    pub interval_secs: u64,
    /// Slot names (or `name-` prefixes) whose refresh keeps the current size.
    #[serde(default = "default_size_sensitive_slots")]
    pub size_sensitive_slots: Vec<String>,
    /// Sizes that a nested creative may replace with something else.
    #[serde(default = "default_passback_sizes")]
    pub passback_sizes: Vec<AdSize>,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_refresh_interval(),
            size_sensitive_slots: default_size_sensitive_slots(),
            passback_sizes: default_passback_sizes(),
        }
    }
}

impl RefreshConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn is_size_sensitive(&self, slot_name: &str) -> bool {
        self.size_sensitive_slots.iter().any(|name| {
            slot_name == name
                || slot_name
                    .strip_prefix(name.as_str())
                    .is_some_and(|rest| rest.starts_with('-'))
        })
    }

    pub fn is_passback_size(&self, size: &AdSize) -> bool {
        self.passback_sizes.contains(size)
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct DiagnosticsConfig {
    /// Share of empty responses reported for triage.
    #[serde(default = "default_empty_sample_rate")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub empty_response_sample_rate: f64,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            empty_response_sample_rate: default_empty_sample_rate(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ApsConfig {
    #[validate(length(min = 1))]
    pub pub_id: String,
    #[serde(default = "default_partner_timeout_ms")]
    #[validate(range(min = 1, max = 10000))]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct PrebidConfig {
    #[serde(default = "default_partner_timeout_ms")]
    #[validate(range(min = 1, max = 10000))]
    pub timeout_ms: u64,
    #[serde(default)]
    pub page_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct PartnersConfig {
    #[serde(default)]
    #[validate(nested)]
    pub aps: Option<ApsConfig>,
    #[serde(default)]
    #[validate(nested)]
    pub prebid: Option<PrebidConfig>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct LifecycleConfig {
    #[serde(default = "default_ad_unit_path")]
    #[validate(length(min = 1))]
    pub ad_unit_path: String,
    #[serde(default = "default_dom_id_prefix")]
    #[validate(length(min = 1))]
    pub dom_id_prefix: String,
    #[serde(default = "default_label_height")]
    #[validate(range(max = 200))]
    pub label_height: u32,
    #[serde(default)]
    pub page_targeting: BTreeMap<String, Vec<String>>,
    /// Default size mapping per slot name.
    #[serde(default)]
    pub slots: BTreeMap<String, SizeMapping>,
    #[serde(default)]
    #[validate(nested)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    #[validate(nested)]
    pub diagnostics: DiagnosticsConfig,
    #[serde(default)]
    #[validate(nested)]
    pub partners: PartnersConfig,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            ad_unit_path: default_ad_unit_path(),
            dom_id_prefix: default_dom_id_prefix(),
            label_height: default_label_height(),
            page_targeting: BTreeMap::new(),
            slots: BTreeMap::new(),
            refresh: RefreshConfig::default(),
            diagnostics: DiagnosticsConfig::default(),
            partners: PartnersConfig::default(),
        }
    }
}

impl LifecycleConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let cfg: LifecycleConfig = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn default_sizes(&self, slot_name: &str) -> Option<&SizeMapping> {
        self.slots.get(slot_name)
    }

    /// DOM id generated for a slot name, `<prefix>--<name>`.
    pub fn slot_dom_id(&self, slot_name: &str) -> String {
        format!("{}--{}", self.dom_id_prefix, slot_name)
    }
}
