//! One page instance: wires the lifecycle components to their collaborators
//! and exposes the inbound ad-server events.

use futures::future::join_all;
use std::cell::Cell;
use std::rc::Rc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::auction::{BidOrchestrator, BidPartner, BidsSettled};
use crate::config::LifecycleConfig;
use crate::define::{DefinedSlot, SlotDefiner};
use crate::dom::{Document, NodeId};
use crate::error::ConfigurationError;
use crate::ports::{
    marks, AdServer, AllowAll, ConsentGate, ErrorReporter, LineItemSource, LogMetrics,
    LogReporter, MetricsSink, StaticLineItems,
};
use crate::registry::{SharedRegistry, SlotRegistry};
use crate::render::{RenderPipeline, SlotRenderEndedEvent};
use crate::size::{AdSize, Breakpoint, SizeOverrides};
use crate::slot::Rendered;
use crate::viewability::{RefreshOutcome, ViewabilityRefreshScheduler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

/// Page-level facts the components consult.
#[derive(Debug)]
pub struct PageState {
    breakpoint: Cell<Breakpoint>,
    page_skin: Cell<bool>,
    visibility: watch::Sender<Visibility>,
}

impl PageState {
    pub fn new(breakpoint: Breakpoint) -> Self {
        let (visibility, _) = watch::channel(Visibility::Visible);
        Self {
            breakpoint: Cell::new(breakpoint),
            page_skin: Cell::new(false),
            visibility,
        }
    }

    pub fn breakpoint(&self) -> Breakpoint {
        self.breakpoint.get()
    }

    pub fn set_breakpoint(&self, breakpoint: Breakpoint) {
        self.breakpoint.set(breakpoint);
    }

    pub fn has_page_skin(&self) -> bool {
        self.page_skin.get()
    }

    pub fn set_page_skin(&self, active: bool) {
        self.page_skin.set(active);
    }

    pub fn visibility(&self) -> Visibility {
        *self.visibility.borrow()
    }

    pub fn is_hidden(&self) -> bool {
        self.visibility() == Visibility::Hidden
    }

    pub fn set_visibility(&self, visibility: Visibility) {
        self.visibility.send_replace(visibility);
    }

    /// Resolves as soon as the document is visible; immediately if it already is.
    pub async fn wait_until_visible(&self) {
        let mut rx = self.visibility.subscribe();
        let _ = rx.wait_for(|v| *v == Visibility::Visible).await;
    }
}

/// External collaborators of a page. Defaults log metrics and errors, allow
/// every slot and treat no line item as refresh-ineligible.
pub struct Collaborators {
    pub document: Rc<dyn Document>,
    pub ad_server: Rc<dyn AdServer>,
    pub partners: Vec<Rc<dyn BidPartner>>,
    pub metrics: Rc<dyn MetricsSink>,
    pub reporter: Rc<dyn ErrorReporter>,
    pub consent: Rc<dyn ConsentGate>,
    pub line_items: Rc<dyn LineItemSource>,
}

impl Collaborators {
    pub fn new(document: Rc<dyn Document>, ad_server: Rc<dyn AdServer>) -> Self {
        Self {
            document,
            ad_server,
            partners: Vec::new(),
            metrics: Rc::new(LogMetrics),
            reporter: Rc::new(LogReporter),
            consent: Rc::new(AllowAll),
            line_items: Rc::new(StaticLineItems::default()),
        }
    }

    pub fn with_partner(mut self, partner: Rc<dyn BidPartner>) -> Self {
        self.partners.push(partner);
        self
    }

    pub fn with_metrics(mut self, metrics: Rc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_reporter(mut self, reporter: Rc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_consent(mut self, consent: Rc<dyn ConsentGate>) -> Self {
        self.consent = consent;
        self
    }

    pub fn with_line_items(mut self, line_items: Rc<dyn LineItemSource>) -> Self {
        self.line_items = line_items;
        self
    }
}

/// Result of asking the page to load a placeholder.
#[derive(Clone)]
pub enum LoadOutcome {
    /// The consent gate refused the slot; nothing was defined.
    Blocked,
    /// Slot defined and bidding; resolves with whether the first render showed content.
    Loading(Rendered),
}

impl LoadOutcome {
    pub fn is_blocked(&self) -> bool {
        matches!(self, LoadOutcome::Blocked)
    }
}

/// Slot lifecycle for one document. Must be driven from a
/// [`tokio::task::LocalSet`].
pub struct Page {
    config: Rc<LifecycleConfig>,
    registry: SharedRegistry,
    state: Rc<PageState>,
    ad_server: Rc<dyn AdServer>,
    metrics: Rc<dyn MetricsSink>,
    consent: Rc<dyn ConsentGate>,
    definer: SlotDefiner,
    orchestrator: Rc<BidOrchestrator>,
    render: RenderPipeline,
    scheduler: ViewabilityRefreshScheduler,
}

impl Page {
    pub fn new(config: LifecycleConfig, breakpoint: Breakpoint, collaborators: Collaborators) -> Self {
        let config = Rc::new(config);
        let registry = SlotRegistry::shared();
        let state = Rc::new(PageState::new(breakpoint));
        let Collaborators {
            document,
            ad_server,
            partners,
            metrics,
            reporter,
            consent,
            line_items,
        } = collaborators;
        let partner_count = partners.len();

        let definer = SlotDefiner::new(
            config.clone(),
            registry.clone(),
            document.clone(),
            ad_server.clone(),
            metrics.clone(),
            reporter.clone(),
        );
        let orchestrator = Rc::new(BidOrchestrator::new(
            config.clone(),
            registry.clone(),
            state.clone(),
            ad_server.clone(),
            metrics.clone(),
            reporter.clone(),
            partners,
        ));
        let render = RenderPipeline::new(
            config.clone(),
            registry.clone(),
            document.clone(),
            ad_server.clone(),
            metrics.clone(),
            reporter.clone(),
        );
        let scheduler = ViewabilityRefreshScheduler::new(
            config.clone(),
            registry.clone(),
            state.clone(),
            document,
            ad_server.clone(),
            orchestrator.clone(),
            metrics.clone(),
            reporter,
            line_items,
        );
        log::info!(
            "Page: ready at breakpoint {} with {} partner(s)",
            breakpoint,
            partner_count
        );
        Self {
            config,
            registry,
            state,
            ad_server,
            metrics,
            consent,
            definer,
            orchestrator,
            render,
            scheduler,
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn state(&self) -> &PageState {
        &self.state
    }

    pub fn orchestrator(&self) -> &BidOrchestrator {
        &self.orchestrator
    }

    /// Define one placeholder and start its first bid cycle.
    pub fn load_slot(
        &self,
        placeholder: NodeId,
        extra: Option<&SizeOverrides>,
    ) -> Result<LoadOutcome, ConfigurationError> {
        let mut outcomes = self.load_slots_with(&[(placeholder, extra)])?;
        Ok(outcomes.pop().unwrap_or(LoadOutcome::Blocked))
    }

    /// Define several placeholders and bid for all of them in a single cycle.
    /// A configuration error aborts the whole batch before any bidding starts.
    pub fn load_slots(&self, placeholders: &[NodeId]) -> Result<Vec<LoadOutcome>, ConfigurationError> {
        let batch: Vec<(NodeId, Option<&SizeOverrides>)> =
            placeholders.iter().map(|node| (*node, None)).collect();
        self.load_slots_with(&batch)
    }

    /// Batch load where each placeholder may carry caller-supplied extra sizes.
    pub fn load_slots_with(
        &self,
        placeholders: &[(NodeId, Option<&SizeOverrides>)],
    ) -> Result<Vec<LoadOutcome>, ConfigurationError> {
        let mut outcomes = Vec::with_capacity(placeholders.len());
        let mut defined: Vec<DefinedSlot> = Vec::new();
        for (node, extra) in placeholders {
            let name = match self.definer.slot_name(*node) {
                Ok(name) => name,
                Err(e) => {
                    self.abandon(&defined);
                    return Err(e);
                }
            };
            if !self.consent.may_load(&name) {
                log::info!("Page: consent gate blocked slot '{}'", name);
                outcomes.push(LoadOutcome::Blocked);
                continue;
            }
            match self.definer.define(*node, *extra) {
                Ok(slot) => {
                    let rendered = self
                        .registry
                        .borrow()
                        .get(&slot.id)
                        .map(|s| s.rendered());
                    if let Some(rendered) = rendered {
                        outcomes.push(LoadOutcome::Loading(rendered));
                    }
                    defined.push(slot);
                }
                Err(e) => {
                    self.abandon(&defined);
                    return Err(e);
                }
            }
        }
        if !defined.is_empty() {
            self.start_bidding(defined);
        }
        Ok(outcomes)
    }

    fn abandon(&self, defined: &[DefinedSlot]) {
        for slot in defined {
            log::warn!("Page: abandoning '{}' from a failed batch", slot.id);
            self.registry.borrow_mut().remove(&slot.id);
            self.ad_server.destroy_slot(&slot.id);
        }
    }

    /// Wait for every slot's readiness, bid for the ready ones, then display.
    fn start_bidding(&self, defined: Vec<DefinedSlot>) {
        let registry = self.registry.clone();
        let orchestrator = self.orchestrator.clone();
        let ad_server = self.ad_server.clone();
        tokio::task::spawn_local(async move {
            let ready = join_all(defined.iter().map(|slot| slot.ready.clone())).await;
            let mut biddable = Vec::new();
            for (slot, ok) in defined.into_iter().zip(ready) {
                if ok {
                    biddable.push(slot.id);
                } else if let Some(s) = registry.borrow_mut().get_mut(&slot.id) {
                    s.resolve_rendered(false);
                }
            }
            if biddable.is_empty() {
                return;
            }
            orchestrator.request_bids(&biddable).await;
            for id in &biddable {
                if registry.borrow().contains(id) {
                    ad_server.display(id);
                }
            }
        });
    }

    /// Start a bid cycle for already defined slots.
    pub fn request_bids(&self, slot_ids: &[String]) -> BidsSettled {
        self.orchestrator.request_bids(slot_ids)
    }

    /// Handle for the current render cycle of `slot_id`.
    pub fn rendered(&self, slot_id: &str) -> Option<Rendered> {
        self.registry.borrow().get(slot_id).map(|s| s.rendered())
    }

    pub fn on_slot_render_ended(&self, event: SlotRenderEndedEvent) -> JoinHandle<bool> {
        let render = self.render.clone();
        tokio::task::spawn_local(async move { render.handle(event).await })
    }

    pub fn on_impression_viewable(&self, slot_id: &str) -> JoinHandle<RefreshOutcome> {
        let scheduler = self.scheduler.clone();
        let slot_id = slot_id.to_string();
        tokio::task::spawn_local(async move { scheduler.handle_viewable(&slot_id).await })
    }

    pub fn on_slot_onload(&self, slot_id: &str) {
        self.metrics.mark(marks::SLOT_ONLOAD, Some(slot_id));
    }

    pub fn on_partner_bid_won(&self, slot_id: &str, size: AdSize) {
        self.orchestrator.bid_won(slot_id, size);
    }

    pub fn set_document_hidden(&self, hidden: bool) {
        let visibility = if hidden {
            Visibility::Hidden
        } else {
            Visibility::Visible
        };
        log::debug!("Page: document is now {:?}", visibility);
        self.state.set_visibility(visibility);
    }

    pub fn set_page_skin(&self, active: bool) {
        self.state.set_page_skin(active);
    }

    pub fn set_breakpoint(&self, breakpoint: Breakpoint) {
        self.state.set_breakpoint(breakpoint);
    }

    /// Veto any refresh of `slot_id`, including one already scheduled.
    pub fn disable_refresh(&self, slot_id: &str) {
        if let Some(slot) = self.registry.borrow_mut().get_mut(slot_id) {
            slot.refresh_disabled = true;
            slot.should_refresh = false;
            log::debug!("Page: refresh disabled for '{}'", slot_id);
        }
    }
}
