//! Turns DOM placeholders into registered, auction-ready slots.

use futures::FutureExt;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::config::LifecycleConfig;
use crate::dom::{Document, NodeId};
use crate::error::ConfigurationError;
use crate::ports::{marks, AdServer, ErrorReporter, MetricsSink, SlotDefinition, REPORT_FEATURE};
use crate::registry::SharedRegistry;
use crate::size::{parse_size_list, Breakpoint, SizeMapping, SizeOverrides};
use crate::slot::{Slot, SlotReady};

/// Marker class carried by every slot element.
pub const SLOT_MARKER_CLASS: &str = "js-ad-slot";

/// Slots whose stale element is removed before re-definition.
const STALE_GUARDED_SLOTS: &[&str] = &["top-above-nav"];

/// A freshly registered slot.
#[derive(Clone)]
pub struct DefinedSlot {
    pub id: String,
    pub ready: SlotReady,
}

pub struct SlotDefiner {
    config: Rc<LifecycleConfig>,
    registry: SharedRegistry,
    document: Rc<dyn Document>,
    ad_server: Rc<dyn AdServer>,
    metrics: Rc<dyn MetricsSink>,
    reporter: Rc<dyn ErrorReporter>,
}

impl SlotDefiner {
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

    /// Declared slot name of a placeholder.
    pub fn slot_name(&self, placeholder: NodeId) -> Result<String, ConfigurationError> {
        self.document
            .attribute(placeholder, "data-name")
            .filter(|n| !n.trim().is_empty())
            .ok_or(ConfigurationError::MissingName(placeholder))
    }

    /// Default sizes for the slot name, then `extra`, then the placeholder's own
    /// `data-<breakpoint>` attributes.
    pub fn effective_sizes(
        &self,
        name: &str,
        placeholder: NodeId,
        extra: Option<&SizeOverrides>,
    ) -> SizeMapping {
        let mut sizes = self.config.default_sizes(name).cloned().unwrap_or_default();
        if let Some(extra) = extra {
            sizes = sizes.merge(extra);
        }
        let from_attributes: SizeOverrides = Breakpoint::ALL
            .iter()
            .filter_map(|bp| {
                self.document
                    .attribute(placeholder, &bp.data_attribute())
                    .map(|raw| (bp.name().to_string(), parse_size_list(&raw)))
            })
            .collect();
        sizes.merge(&from_attributes)
    }

    pub fn define(
        &self,
        placeholder: NodeId,
        extra: Option<&SizeOverrides>,
    ) -> Result<DefinedSlot, ConfigurationError> {
        let name = self.slot_name(placeholder)?;
        let generated_id = self.config.slot_dom_id(&name);
        let id = self
            .document
            .id_of(placeholder)
            .unwrap_or_else(|| generated_id.clone());

        self.metrics.mark(marks::DEFINITION_START, Some(&id));

        let sizes = self.effective_sizes(&name, placeholder, extra);
        if sizes.is_empty() {
            log::error!("Define: slot '{}' has no usable size mapping", id);
            return Err(ConfigurationError::NoSizes { slot_id: id });
        }

        if STALE_GUARDED_SLOTS.contains(&name.as_str()) {
            self.remove_stale_element(&generated_id, placeholder);
        }
        self.prepare_element(placeholder, &id, &name);

        let mut registry = self.registry.borrow_mut();
        let test_group = registry.allocate_test_group(&id);
        let definition = SlotDefinition {
            ad_unit_path: self.config.ad_unit_path.clone(),
            slot_id: id.clone(),
            sizes: sizes.all_sizes(),
            size_mapping: sizes.viewport_mapping(),
            targeting: BTreeMap::from([
                ("slot".to_string(), vec![name.clone()]),
                ("testgroup".to_string(), vec![test_group.to_string()]),
            ]),
        };
        let ready = self.prepare_in_ad_server(definition);

        let mut slot = Slot::new(
            id.clone(),
            name.clone(),
            placeholder,
            sizes,
            test_group,
            ready.clone(),
        );
        slot.refresh_disabled = self
            .document
            .attribute(placeholder, "data-refresh")
            .is_some_and(|v| v == "false");
        if registry.insert(slot).is_some() {
            log::info!("Define: replaced existing registration for '{}'", id);
        }
        log::debug!(
            "Define: registered '{}' ({}) in test group {}",
            id,
            name,
            test_group
        );

        Ok(DefinedSlot { id, ready })
    }

    fn remove_stale_element(&self, generated_id: &str, placeholder: NodeId) {
        if let Some(stale) = self
            .document
            .element_by_id(generated_id)
            .filter(|node| *node != placeholder)
        {
            log::warn!("Define: removing stale element for '{}'", generated_id);
            if let Err(e) = self.document.remove(stale) {
                log::warn!("Define: could not remove stale element: {}", e);
            }
        }
    }

    fn prepare_element(&self, node: NodeId, id: &str, name: &str) {
        let doc = &self.document;
        let result = doc
            .set_attribute(node, "id", id)
            .and_then(|_| doc.add_class(node, SLOT_MARKER_CLASS))
            .and_then(|_| doc.add_class(node, "ad-slot"))
            .and_then(|_| doc.add_class(node, &format!("ad-slot--{}", name)))
            .and_then(|_| match doc.attribute(node, "data-label") {
                Some(_) => Ok(()),
                None => doc.set_attribute(node, "data-label", "true"),
            });
        if let Err(e) = result {
            log::warn!("Define: could not decorate '{}': {}", id, e);
        }
    }

    fn prepare_in_ad_server(&self, definition: SlotDefinition) -> SlotReady {
        let ad_server = self.ad_server.clone();
        let metrics = self.metrics.clone();
        let reporter = self.reporter.clone();
        async move {
            let id = definition.slot_id.clone();
            match ad_server.define_slot(definition).await {
                Ok(()) => {
                    metrics.mark(marks::DEFINITION_END, Some(&id));
                    true
                }
                Err(e) => {
                    log::error!("Define: ad server rejected '{}': {}", id, e);
                    reporter.report(
                        &e,
                        REPORT_FEATURE,
                        &[("slot", id.as_str())],
                        &serde_json::Value::Null,
                    );
                    false
                }
            }
        }
        .boxed_local()
        .shared()
    }
}
