//! Collaborators the lifecycle consumes or produces to.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

use crate::error::{AdServerError, LineItemError};
use crate::size::{AdSize, ViewportSizes};

/// Feature name attached to every error report.
pub const REPORT_FEATURE: &str = "commercial";

/// Named instants recorded on the [`MetricsSink`].
pub mod marks {
    pub const DEFINITION_START: &str = "slot-definition-start";
    pub const DEFINITION_END: &str = "slot-definition-end";
    pub const BID_REQUEST_START: &str = "bid-request-start";
    pub const BID_REQUEST_END: &str = "bid-request-end";
    pub const RENDER_START: &str = "render-start";
    pub const RENDER_END: &str = "render-end";
    pub const SLOT_ONLOAD: &str = "slot-onload";
    pub const FIRST_VIEWABLE: &str = "first-viewable";
}

/// Everything the ad server needs to prepare a slot for auction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlotDefinition {
    pub ad_unit_path: String,
    pub slot_id: String,
    pub sizes: Vec<AdSize>,
    pub size_mapping: Vec<ViewportSizes>,
    pub targeting: BTreeMap<String, Vec<String>>,
}

/// The ad-serving tag library.
#[async_trait(?Send)]
pub trait AdServer {
    /// Resolves once the slot is ready for auction.
    async fn define_slot(&self, definition: SlotDefinition) -> Result<(), AdServerError>;
    fn set_targeting(&self, slot_id: &str, key: &str, values: &[String]);
    fn clear_targeting(&self, slot_id: &str, key: &str);
    fn display(&self, slot_id: &str);
    fn refresh(&self, slot_id: &str);
    fn destroy_slot(&self, slot_id: &str);
}

/// Write-only timing collector.
pub trait MetricsSink {
    fn mark(&self, event: &str, origin: Option<&str>);
}

/// Write-only error sink.
pub trait ErrorReporter {
    fn report(
        &self,
        error: &dyn std::error::Error,
        feature: &str,
        tags: &[(&str, &str)],
        extras: &serde_json::Value,
    );
}

/// Consent and feature-flag gate, asked once per slot before definition.
pub trait ConsentGate {
    fn may_load(&self, slot_name: &str) -> bool;
}

/// Source of line item ids whose creatives must never be refreshed.
#[async_trait(?Send)]
pub trait LineItemSource {
    async fn refresh_ineligible_line_items(&self) -> Result<HashSet<u64>, LineItemError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogMetrics;

impl MetricsSink for LogMetrics {
    fn mark(&self, event: &str, origin: Option<&str>) {
        log::trace!("mark {} origin={}", event, origin.unwrap_or("-"));
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(
        &self,
        error: &dyn std::error::Error,
        feature: &str,
        tags: &[(&str, &str)],
        extras: &serde_json::Value,
    ) {
        log::error!(
            "[{}] {} tags={:?} extras={}",
            feature,
            error,
            tags,
            extras
        );
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl ConsentGate for AllowAll {
    fn may_load(&self, _slot_name: &str) -> bool {
        true
    }
}

/// A fixed set of ineligible line items.
#[derive(Debug, Default, Clone)]
pub struct StaticLineItems(pub HashSet<u64>);

#[async_trait(?Send)]
impl LineItemSource for StaticLineItems {
    async fn refresh_ineligible_line_items(&self) -> Result<HashSet<u64>, LineItemError> {
        Ok(self.0.clone())
    }
}
