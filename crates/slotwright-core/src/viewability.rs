//! First-viewable handling and the one-shot refresh timer.

use std::collections::HashSet;
use std::rc::Rc;
use tokio::sync::OnceCell;

use crate::auction::BidOrchestrator;
use crate::config::LifecycleConfig;
use crate::dom::{Document, NodeId};
use crate::page::PageState;
use crate::ports::{marks, AdServer, ErrorReporter, LineItemSource, MetricsSink, REPORT_FEATURE};
use crate::registry::SharedRegistry;
use crate::size::AdSize;
use crate::slot::SlotPhase;

/// How a viewable signal played out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Slot unknown or not freshly filled; nothing was done.
    Ignored,
    /// Viewable handled, but the slot may not refresh.
    Ineligible,
    /// Refresh was vetoed or the slot went away while the timer ran.
    Cancelled,
    Refreshed,
}

#[derive(Clone)]
pub struct ViewabilityRefreshScheduler {
    config: Rc<LifecycleConfig>,
    registry: SharedRegistry,
    page: Rc<PageState>,
    document: Rc<dyn Document>,
    ad_server: Rc<dyn AdServer>,
    orchestrator: Rc<BidOrchestrator>,
    metrics: Rc<dyn MetricsSink>,
    reporter: Rc<dyn ErrorReporter>,
    line_items: Rc<dyn LineItemSource>,
    ineligible: Rc<OnceCell<HashSet<u64>>>,
}

impl ViewabilityRefreshScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Rc<LifecycleConfig>,
        registry: SharedRegistry,
        page: Rc<PageState>,
        document: Rc<dyn Document>,
        ad_server: Rc<dyn AdServer>,
        orchestrator: Rc<BidOrchestrator>,
        metrics: Rc<dyn MetricsSink>,
        reporter: Rc<dyn ErrorReporter>,
        line_items: Rc<dyn LineItemSource>,
    ) -> Self {
        Self {
            config,
            registry,
            page,
            document,
            ad_server,
            orchestrator,
            metrics,
            reporter,
            line_items,
            ineligible: Rc::new(OnceCell::new()),
        }
    }

    /// Handle the delegate's impression-viewable signal. Only the first signal
    /// after a fill counts; the returned future covers the whole refresh wait.
    pub async fn handle_viewable(&self, slot_id: &str) -> RefreshOutcome {
        let (node, size, line_item) = {
            let mut registry = self.registry.borrow_mut();
            let Some(slot) = registry.get_mut(slot_id) else {
                log::debug!("Viewability: unknown slot '{}'", slot_id);
                return RefreshOutcome::Ignored;
            };
            if slot.phase != SlotPhase::Filled || !slot.is_rendered {
                log::debug!(
                    "Viewability: ignoring signal for '{}' in {:?}",
                    slot_id,
                    slot.phase
                );
                return RefreshOutcome::Ignored;
            }
            slot.phase = SlotPhase::Viewable;
            (slot.node, slot.negotiated_size, slot.line_item_id)
        };
        self.metrics.mark(marks::FIRST_VIEWABLE, Some(slot_id));
        self.stabilize_height(slot_id, node, size);

        let blocked_line_item = match line_item {
            Some(id) => self.ineligible_line_items().await.contains(&id),
            None => false,
        };
        let eligible = self.size_allows_refresh(size) && !blocked_line_item;
        {
            let mut registry = self.registry.borrow_mut();
            let Some(slot) = registry.get_mut(slot_id) else {
                return RefreshOutcome::Cancelled;
            };
            slot.should_refresh = eligible && !slot.refresh_disabled;
            if !slot.should_refresh {
                log::debug!("Viewability: '{}' is not refresh eligible", slot_id);
                return RefreshOutcome::Ineligible;
            }
            slot.phase = SlotPhase::RefreshPending;
        }

        tokio::time::sleep(self.config.refresh.interval()).await;
        if !self.still_wanted(slot_id) {
            return RefreshOutcome::Cancelled;
        }

        if self.page.is_hidden() {
            if let Some(slot) = self.registry.borrow_mut().get_mut(slot_id) {
                slot.phase = SlotPhase::RefreshDeferred;
            }
            log::info!("Viewability: deferring refresh of '{}' until visible", slot_id);
            self.page.wait_until_visible().await;
            if !self.still_wanted(slot_id) {
                return RefreshOutcome::Cancelled;
            }
        }

        self.refresh(slot_id).await;
        RefreshOutcome::Refreshed
    }

    /// Proxy and passback-capable sizes never refresh, nor does anything under a
    /// page skin or with refresh switched off.
    fn size_allows_refresh(&self, size: Option<AdSize>) -> bool {
        let Some(size) = size else {
            return false;
        };
        self.config.refresh.enabled
            && !size.is_proxy()
            && !self.config.refresh.is_passback_size(&size)
            && !self.page.has_page_skin()
    }

    fn stabilize_height(&self, slot_id: &str, node: NodeId, size: Option<AdSize>) {
        let Some(size) = size else {
            return;
        };
        if size.is_proxy() || self.config.refresh.is_passback_size(&size) {
            return;
        }
        let min_height = format!("{}px", size.height() + self.config.label_height);
        if let Err(e) = self.document.set_style(node, "min-height", &min_height) {
            log::warn!("Viewability: could not fix height of '{}': {}", slot_id, e);
        }
    }

    /// Fetched once per page; a failed fetch counts as "nothing ineligible".
    async fn ineligible_line_items(&self) -> &HashSet<u64> {
        self.ineligible
            .get_or_init(|| async {
                match self.line_items.refresh_ineligible_line_items().await {
                    Ok(ids) => {
                        log::debug!("Viewability: {} refresh-ineligible line items", ids.len());
                        ids
                    }
                    Err(e) => {
                        log::error!("Viewability: {}", e);
                        self.reporter.report(
                            &e,
                            REPORT_FEATURE,
                            &[],
                            &serde_json::Value::Null,
                        );
                        HashSet::new()
                    }
                }
            })
            .await
    }

    fn still_wanted(&self, slot_id: &str) -> bool {
        let wanted = self
            .registry
            .borrow()
            .get(slot_id)
            .is_some_and(|slot| slot.should_refresh && !slot.refresh_disabled);
        if !wanted {
            log::debug!("Viewability: refresh of '{}' no longer wanted", slot_id);
        }
        wanted
    }

    async fn refresh(&self, slot_id: &str) {
        {
            let mut registry = self.registry.borrow_mut();
            let Some(slot) = registry.get_mut(slot_id) else {
                return;
            };
            slot.begin_render_cycle();
            slot.refresh_count += 1;
            log::info!(
                "Viewability: refreshing '{}' (refresh #{})",
                slot_id,
                slot.refresh_count
            );
        }
        self.orchestrator.refresh_bids(slot_id).await;
        if !self.registry.borrow().contains(slot_id) {
            return;
        }
        self.ad_server
            .set_targeting(slot_id, "refreshed", &["true".to_string()]);
        self.ad_server.refresh(slot_id);
    }
}
