//! Render completion: empty/filled classification and DOM finalization.

use phf::phf_map;
use rand::Rng;
use std::collections::BTreeSet;
use std::rc::Rc;

use crate::config::LifecycleConfig;
use crate::dom::{Document, NodeId};
use crate::error::{EmptyResponse, RenderError};
use crate::ports::{marks, AdServer, ErrorReporter, MetricsSink, REPORT_FEATURE};
use crate::registry::SharedRegistry;
use crate::size::AdSize;
use crate::slot::SlotPhase;

pub const RENDERED_CLASS: &str = "ad-slot--rendered";
pub const FLUID_CLASS: &str = "ad-slot--fluid";
pub const COLLAPSED_CLASS: &str = "ad-slot--collapse";
pub const CONTAINER_CLASS: &str = "ad-slot-container";
pub const TOP_BANNER_CONTAINER_CLASS: &str = "top-banner-ad-container";

/// Presentation classes keyed by rendered size.
static SIZE_CLASSES: phf::Map<&'static str, &'static str> = phf_map! {
    "300,250" => "ad-slot--mpu-banner-ad",
    "300,600" => "ad-slot--halfpage ad-slot--tall",
    "160,600" => "ad-slot--skyscraper ad-slot--tall",
    "728,90" => "ad-slot--leaderboard",
    "970,250" => "ad-slot--billboard",
    "320,50" => "ad-slot--mobile-sticky",
    "88,71" => "ad-slot--merchandising",
};

/// Delegate event fired when the ad server finished rendering a slot.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotRenderEndedEvent {
    pub slot_id: String,
    pub is_empty: bool,
    pub size: Option<AdSize>,
    pub line_item_id: Option<u64>,
    pub creative_id: Option<u64>,
    pub is_out_of_page: bool,
}

impl SlotRenderEndedEvent {
    pub fn empty(slot_id: impl Into<String>) -> Self {
        Self {
            slot_id: slot_id.into(),
            is_empty: true,
            size: None,
            line_item_id: None,
            creative_id: None,
            is_out_of_page: false,
        }
    }

    pub fn filled(slot_id: impl Into<String>, size: AdSize, line_item_id: Option<u64>) -> Self {
        Self {
            slot_id: slot_id.into(),
            is_empty: false,
            size: Some(size),
            line_item_id,
            creative_id: None,
            is_out_of_page: false,
        }
    }
}

#[derive(Clone)]
pub struct RenderPipeline {
    config: Rc<LifecycleConfig>,
    registry: SharedRegistry,
    document: Rc<dyn Document>,
    ad_server: Rc<dyn AdServer>,
    metrics: Rc<dyn MetricsSink>,
    reporter: Rc<dyn ErrorReporter>,
}

impl RenderPipeline {
    pub fn new(
        config: Rc<LifecycleConfig>,
        registry: SharedRegistry,
        document: Rc<dyn Document>,
        ad_server: Rc<dyn AdServer>,
        metrics: Rc<dyn MetricsSink>,
        reporter: Rc<dyn ErrorReporter>,
    ) -> Self {
        Self {
            config,
            registry,
            document,
            ad_server,
            metrics,
            reporter,
        }
    }

    /// Finalize a render cycle. Waits for the slot's readiness first and always
    /// settles the slot's rendered handle. Returns whether content was detected.
    pub async fn handle(&self, event: SlotRenderEndedEvent) -> bool {
        let ready = match self.registry.borrow().get(&event.slot_id) {
            Some(slot) => slot.ready(),
            None => {
                log::warn!("Render: event for unknown slot '{}'", event.slot_id);
                return false;
            }
        };
        ready.await;

        let id = event.slot_id.clone();
        self.metrics.mark(marks::RENDER_START, Some(&id));
        let rendered = if event.is_empty {
            self.finish_empty(&id);
            false
        } else {
            match self.finish_filled(&event) {
                Ok(rendered) => rendered,
                Err(e) => {
                    log::error!("Render: could not finalize '{}': {}", id, e);
                    self.reporter.report(
                        &e,
                        REPORT_FEATURE,
                        &[("slot", id.as_str())],
                        &serde_json::Value::Null,
                    );
                    if let Some(slot) = self.registry.borrow_mut().get_mut(&id) {
                        slot.is_rendered = false;
                        slot.resolve_rendered(false);
                    }
                    false
                }
            }
        };
        self.metrics.mark(marks::RENDER_END, Some(&id));
        rendered
    }

    fn finish_empty(&self, id: &str) {
        let node = {
            let mut registry = self.registry.borrow_mut();
            let Some(slot) = registry.get_mut(id) else {
                return;
            };
            slot.is_empty = Some(true);
            slot.is_rendered = false;
            slot.phase = SlotPhase::Empty;
            slot.resolve_rendered(false);
            slot.node
        };

        let target = self.removal_target(node);
        if let Err(e) = self.document.remove(target) {
            log::warn!("Render: could not remove empty slot '{}': {}", id, e);
        }
        self.registry.borrow_mut().remove(id);
        self.ad_server.destroy_slot(id);
        log::info!("Render: '{}' came back empty and was removed", id);

        let rate = self.config.diagnostics.empty_response_sample_rate;
        if rand::thread_rng().gen::<f64>() < rate {
            let keywords = self.config.page_targeting.get("k").cloned().unwrap_or_default();
            self.reporter.report(
                &EmptyResponse {
                    slot_id: id.to_string(),
                },
                REPORT_FEATURE,
                &[("slot", id)],
                &serde_json::json!({
                    "adUnitPath": self.config.ad_unit_path,
                    "keywords": keywords,
                }),
            );
        }
    }

    /// The element to detach for an empty slot: the top banner container or the
    /// direct ad container when the slot sits in one, otherwise the slot itself.
    pub fn removal_target(&self, node: NodeId) -> NodeId {
        match self.document.parent(node) {
            Some(parent) if self.document.has_class(parent, CONTAINER_CLASS) => self
                .document
                .closest(parent, TOP_BANNER_CONTAINER_CLASS)
                .unwrap_or(parent),
            _ => node,
        }
    }

    fn finish_filled(&self, event: &SlotRenderEndedEvent) -> Result<bool, RenderError> {
        let id = &event.slot_id;
        let (node, size, previous) = {
            let mut registry = self.registry.borrow_mut();
            let slot = registry
                .get_mut(id)
                .ok_or_else(|| RenderError::SlotNotFound(id.clone()))?;
            slot.is_empty = Some(false);
            if !slot.has_partner_size {
                if let Some(size) = event.size {
                    slot.negotiated_size = Some(size);
                }
            }
            slot.line_item_id = event.line_item_id;
            (
                slot.node,
                slot.negotiated_size,
                slot.presentation_classes.clone(),
            )
        };

        let has_content = self
            .document
            .embedded_frame(node)
            .is_some_and(|frame| self.document.is_displayed(frame));
        let applied = self.apply_presentation(node, size, event.is_out_of_page, &previous)?;
        if has_content {
            self.document.add_class(node, RENDERED_CLASS)?;
        }

        let mut registry = self.registry.borrow_mut();
        let slot = registry
            .get_mut(id)
            .ok_or_else(|| RenderError::SlotNotFound(id.clone()))?;
        slot.presentation_classes = applied;
        slot.is_rendered = has_content;
        slot.phase = SlotPhase::Filled;
        slot.resolve_rendered(has_content);
        log::debug!(
            "Render: '{}' filled at {} (content: {})",
            id,
            size.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string()),
            has_content
        );
        Ok(has_content)
    }

    /// Bring the slot's size-driven classes and styles in line with `size`,
    /// returning the classes now applied.
    fn apply_presentation(
        &self,
        node: NodeId,
        size: Option<AdSize>,
        is_out_of_page: bool,
        previous: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>, RenderError> {
        let doc = &self.document;
        let mut wanted: BTreeSet<String> = BTreeSet::new();
        match size {
            Some(s) if s.is_fluid() => {
                wanted.insert(FLUID_CLASS.to_string());
                if let Some(frame) = doc.embedded_frame(node) {
                    doc.remove_style(frame, "vertical-align")?;
                }
            }
            Some(s) if !is_out_of_page && (s == AdSize::OUT_OF_PAGE || s == AdSize::EMPTY) => {
                wanted.insert(COLLAPSED_CLASS.to_string());
            }
            Some(s) => {
                if let Some(classes) = SIZE_CLASSES.get(s.to_string().as_str()) {
                    wanted.extend(classes.split_whitespace().map(str::to_string));
                }
            }
            None => {}
        }

        let collapse = wanted.contains(COLLAPSED_CLASS);
        if collapse != previous.contains(COLLAPSED_CLASS) {
            self.set_collapsed(node, collapse)?;
        }
        for stale in previous.difference(&wanted) {
            doc.remove_class(node, stale)?;
        }
        for class in wanted.difference(previous) {
            doc.add_class(node, class)?;
        }
        Ok(wanted)
    }

    fn set_collapsed(&self, node: NodeId, collapsed: bool) -> Result<(), RenderError> {
        let doc = &self.document;
        let mut targets = vec![node];
        if let Some(parent) = doc
            .parent(node)
            .filter(|p| doc.has_class(*p, CONTAINER_CLASS))
        {
            targets.push(parent);
        }
        for target in targets {
            if collapsed {
                doc.set_style(target, "display", "none")?;
            } else {
                doc.remove_style(target, "display")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::MemoryDocument;
    use crate::error::AdServerError;
    use crate::ports::{LogMetrics, SlotDefinition};
    use crate::registry::SlotRegistry;
    use crate::size::SizeMapping;
    use crate::slot::Slot;
    use async_trait::async_trait;
    use futures::executor::block_on;
    use futures::FutureExt;
    use std::cell::RefCell;

    struct NullAdServer;

    #[async_trait(?Send)]
    impl AdServer for NullAdServer {
        async fn define_slot(&self, _: SlotDefinition) -> Result<(), AdServerError> {
            Ok(())
        }
        fn set_targeting(&self, _: &str, _: &str, _: &[String]) {}
        fn clear_targeting(&self, _: &str, _: &str) {}
        fn display(&self, _: &str) {}
        fn refresh(&self, _: &str) {}
        fn destroy_slot(&self, _: &str) {}
    }

    #[derive(Default)]
    struct RecordingReporter {
        reports: RefCell<Vec<(String, serde_json::Value)>>,
    }

    impl ErrorReporter for RecordingReporter {
        fn report(
            &self,
            error: &dyn std::error::Error,
            _feature: &str,
            _tags: &[(&str, &str)],
            extras: &serde_json::Value,
        ) {
            self.reports
                .borrow_mut()
                .push((error.to_string(), extras.clone()));
        }
    }

    struct Fixture {
        doc: Rc<MemoryDocument>,
        registry: SharedRegistry,
        reporter: Rc<RecordingReporter>,
        pipeline: RenderPipeline,
    }

    fn fixture() -> Fixture {
        fixture_with(LifecycleConfig::default())
    }

    fn fixture_with(config: LifecycleConfig) -> Fixture {
        let doc = Rc::new(MemoryDocument::new());
        let registry = SlotRegistry::shared();
        let reporter = Rc::new(RecordingReporter::default());
        let pipeline = RenderPipeline::new(
            Rc::new(config),
            registry.clone(),
            doc.clone(),
            Rc::new(NullAdServer),
            Rc::new(LogMetrics),
            reporter.clone(),
        );
        Fixture {
            doc,
            registry,
            reporter,
            pipeline,
        }
    }

    fn sampled_config(rate: f64) -> LifecycleConfig {
        let mut config = LifecycleConfig::default();
        config.diagnostics.empty_response_sample_rate = rate;
        config
            .page_targeting
            .insert("k".to_string(), vec!["politics".to_string(), "uk".to_string()]);
        config
    }

    fn register(f: &Fixture, id: &str, node: NodeId) {
        let slot = Slot::new(
            id.to_string(),
            id.to_string(),
            node,
            SizeMapping::new(),
            1,
            async { true }.boxed_local().shared(),
        );
        f.registry.borrow_mut().insert(slot);
    }

    #[test]
    fn removal_target_climbs_to_banner_container() {
        let f = fixture();
        let banner = f
            .doc
            .append_element(f.doc.body(), "div", &[TOP_BANNER_CONTAINER_CLASS])
            .unwrap();
        let container = f
            .doc
            .append_element(banner, "div", &[CONTAINER_CLASS])
            .unwrap();
        let slot = f.doc.append_element(container, "div", &[]).unwrap();
        let loose = f.doc.append_element(f.doc.body(), "div", &[]).unwrap();

        assert_eq!(f.pipeline.removal_target(slot), banner);
        assert_eq!(f.pipeline.removal_target(loose), loose);
    }

    #[test]
    fn presentation_classes_are_diffed_between_sizes() {
        let f = fixture();
        let node = f.doc.append_element(f.doc.body(), "div", &[]).unwrap();
        register(&f, "dfp-ad--right", node);

        let first = SlotRenderEndedEvent::filled("dfp-ad--right", AdSize::HALF_PAGE, None);
        assert!(!block_on(f.pipeline.handle(first)));
        assert!(f.doc.has_class(node, "ad-slot--tall"));

        let second = SlotRenderEndedEvent::filled("dfp-ad--right", AdSize::MPU, Some(9));
        block_on(f.pipeline.handle(second));
        assert!(!f.doc.has_class(node, "ad-slot--tall"));
        assert!(!f.doc.has_class(node, "ad-slot--halfpage"));
        assert!(f.doc.has_class(node, "ad-slot--mpu-banner-ad"));
        let registry = f.registry.borrow();
        let slot = registry.get("dfp-ad--right").unwrap();
        assert_eq!(slot.line_item_id(), Some(9));
        assert_eq!(slot.negotiated_size(), Some(AdSize::MPU));
    }

    #[test]
    fn placeholder_size_collapses_slot_and_container() {
        let f = fixture();
        let container = f
            .doc
            .append_element(f.doc.body(), "div", &[CONTAINER_CLASS])
            .unwrap();
        let node = f.doc.append_element(container, "div", &[]).unwrap();
        register(&f, "dfp-ad--merch", node);

        let event = SlotRenderEndedEvent::filled("dfp-ad--merch", AdSize::EMPTY, None);
        block_on(f.pipeline.handle(event));
        assert_eq!(f.doc.style(node, "display").as_deref(), Some("none"));
        assert_eq!(f.doc.style(container, "display").as_deref(), Some("none"));
    }

    #[test]
    fn fluid_strips_frame_alignment() {
        let f = fixture();
        let node = f.doc.append_element(f.doc.body(), "div", &[]).unwrap();
        let frame = f.doc.append_element(node, "iframe", &[]).unwrap();
        f.doc.set_style(frame, "vertical-align", "bottom").unwrap();
        register(&f, "dfp-ad--fluid", node);

        let event = SlotRenderEndedEvent::filled("dfp-ad--fluid", AdSize::FLUID, None);
        assert!(block_on(f.pipeline.handle(event)));
        assert!(f.doc.has_class(node, FLUID_CLASS));
        assert!(f.doc.has_class(node, RENDERED_CLASS));
        assert_eq!(f.doc.style(frame, "vertical-align"), None);
    }

    #[test]
    fn dom_failure_degrades_to_not_rendered() {
        let f = fixture();
        register(&f, "dfp-ad--ghost", NodeId(999));
        let rendered = f.registry.borrow().get("dfp-ad--ghost").unwrap().rendered();

        let event = SlotRenderEndedEvent::filled("dfp-ad--ghost", AdSize::MPU, None);
        assert!(!block_on(f.pipeline.handle(event)));
        assert!(!block_on(rendered));
        assert!(!f.registry.borrow().is_loaded("dfp-ad--ghost"));

        let reports = f.reporter.reports.borrow();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].1, serde_json::Value::Null);
    }

    #[test]
    fn sampled_empty_response_reports_unit_and_keywords() {
        let f = fixture_with(sampled_config(1.0));
        let node = f.doc.append_element(f.doc.body(), "div", &[]).unwrap();
        register(&f, "dfp-ad--inline3", node);

        assert!(!block_on(f.pipeline.handle(SlotRenderEndedEvent::empty("dfp-ad--inline3"))));
        let reports = f.reporter.reports.borrow();
        assert_eq!(reports.len(), 1);
        let (message, extras) = &reports[0];
        assert!(message.contains("dfp-ad--inline3"), "{}", message);
        assert_eq!(extras["adUnitPath"], "/1234/site");
        assert_eq!(extras["keywords"], serde_json::json!(["politics", "uk"]));
    }

    #[test]
    fn empty_response_is_never_reported_at_zero_rate() {
        let f = fixture_with(sampled_config(0.0));
        for i in 0..50 {
            let id = format!("dfp-ad--inline{}", i);
            let node = f.doc.append_element(f.doc.body(), "div", &[]).unwrap();
            register(&f, &id, node);
            block_on(f.pipeline.handle(SlotRenderEndedEvent::empty(id)));
        }
        assert!(f.registry.borrow().is_empty());
        assert!(f.reporter.reports.borrow().is_empty());
    }

    #[test]
    fn partner_size_is_kept() {
        let f = fixture();
        let node = f.doc.append_element(f.doc.body(), "div", &[]).unwrap();
        register(&f, "dfp-ad--top", node);
        {
            let mut registry = f.registry.borrow_mut();
            let slot = registry.get_mut("dfp-ad--top").unwrap();
            slot.has_partner_size = true;
            slot.negotiated_size = Some(AdSize::LEADERBOARD);
        }
        let event = SlotRenderEndedEvent::filled("dfp-ad--top", AdSize::BILLBOARD, None);
        block_on(f.pipeline.handle(event));
        assert_eq!(
            f.registry.borrow().get("dfp-ad--top").unwrap().negotiated_size(),
            Some(AdSize::LEADERBOARD)
        );
    }
}
