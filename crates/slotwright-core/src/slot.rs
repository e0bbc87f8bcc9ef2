//! The per-placement lifecycle record.

use futures::future::{LocalBoxFuture, Shared};
use futures::FutureExt;
use std::collections::BTreeSet;
use std::fmt;
use tokio::sync::oneshot;

use crate::dom::NodeId;
use crate::size::{AdSize, SizeMapping};

/// Resolves with `true` once the ad server prepared the slot for auction.
pub type SlotReady = Shared<LocalBoxFuture<'static, bool>>;

/// Resolves with whether the current render cycle produced visible content.
pub type Rendered = Shared<LocalBoxFuture<'static, bool>>;

/// Resolves when the bid cycle a slot takes part in has settled.
pub type BidHandle = Shared<LocalBoxFuture<'static, ()>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotPhase {
    Defined,
    BidsRequested,
    Filled,
    Viewable,
    RefreshPending,
    RefreshDeferred,
    Empty,
}

pub struct Slot {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) node: NodeId,
    pub(crate) sizes: SizeMapping,
    pub(crate) test_group: u8,
    pub(crate) phase: SlotPhase,
    pub(crate) negotiated_size: Option<AdSize>,
    pub(crate) is_empty: Option<bool>,
    pub(crate) is_rendered: bool,
    pub(crate) should_refresh: bool,
    pub(crate) refresh_disabled: bool,
    pub(crate) has_partner_size: bool,
    pub(crate) in_flight: Option<BidHandle>,
    pub(crate) line_item_id: Option<u64>,
    pub(crate) presentation_classes: BTreeSet<String>,
    /// Targeting keys set from partner bids in the last cycle.
    pub(crate) partner_keys: BTreeSet<String>,
    pub(crate) refresh_count: u32,
    pub(crate) ready: SlotReady,
    rendered: Rendered,
    render_tx: Option<oneshot::Sender<bool>>,
}

impl Slot {
    pub(crate) fn new(
        id: String,
        name: String,
        node: NodeId,
        sizes: SizeMapping,
        test_group: u8,
        ready: SlotReady,
    ) -> Self {
        let (render_tx, rendered) = render_channel();
        Self {
            id,
            name,
            node,
            sizes,
            test_group,
            phase: SlotPhase::Defined,
            negotiated_size: None,
            is_empty: None,
            is_rendered: false,
            should_refresh: false,
            refresh_disabled: false,
            has_partner_size: false,
            in_flight: None,
            line_item_id: None,
            presentation_classes: BTreeSet::new(),
            partner_keys: BTreeSet::new(),
            refresh_count: 0,
            ready,
            rendered,
            render_tx: Some(render_tx),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn sizes(&self) -> &SizeMapping {
        &self.sizes
    }

    pub fn test_group(&self) -> u8 {
        self.test_group
    }

    pub fn phase(&self) -> SlotPhase {
        self.phase
    }

    pub fn negotiated_size(&self) -> Option<AdSize> {
        self.negotiated_size
    }

    /// `None` until the first auction outcome is known.
    pub fn is_empty(&self) -> Option<bool> {
        self.is_empty
    }

    pub fn is_rendered(&self) -> bool {
        self.is_rendered
    }

    pub fn should_refresh(&self) -> bool {
        self.should_refresh
    }

    pub fn has_partner_size(&self) -> bool {
        self.has_partner_size
    }

    pub fn has_bid_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn line_item_id(&self) -> Option<u64> {
        self.line_item_id
    }

    pub fn presentation_classes(&self) -> &BTreeSet<String> {
        &self.presentation_classes
    }

    pub fn refresh_count(&self) -> u32 {
        self.refresh_count
    }

    pub fn ready(&self) -> SlotReady {
        self.ready.clone()
    }

    /// Handle for the current render cycle.
    pub fn rendered(&self) -> Rendered {
        self.rendered.clone()
    }

    /// Resolve the current render cycle. Later calls in the same cycle are ignored.
    pub(crate) fn resolve_rendered(&mut self, rendered: bool) {
        if let Some(tx) = self.render_tx.take() {
            let _ = tx.send(rendered);
        }
    }

    /// Start a fresh render cycle ahead of a refresh.
    pub(crate) fn begin_render_cycle(&mut self) {
        let (render_tx, rendered) = render_channel();
        self.render_tx = Some(render_tx);
        self.rendered = rendered;
        self.is_rendered = false;
        self.has_partner_size = false;
        self.phase = SlotPhase::BidsRequested;
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("node", &self.node)
            .field("phase", &self.phase)
            .field("negotiated_size", &self.negotiated_size)
            .field("is_empty", &self.is_empty)
            .field("is_rendered", &self.is_rendered)
            .field("should_refresh", &self.should_refresh)
            .field("has_partner_size", &self.has_partner_size)
            .field("in_flight", &self.in_flight.is_some())
            .field("line_item_id", &self.line_item_id)
            .finish_non_exhaustive()
    }
}

fn render_channel() -> (oneshot::Sender<bool>, Rendered) {
    let (tx, rx) = oneshot::channel();
    let rendered = rx.map(|r| r.unwrap_or(false)).boxed_local().shared();
    (tx, rendered)
}
