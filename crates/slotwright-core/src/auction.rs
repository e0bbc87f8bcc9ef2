//! Header-bidding orchestration.
//!
//! Each call to [`BidOrchestrator::request_bids`] starts one bid cycle for the
//! slots that are not already bidding. A cycle sends one request to every
//! configured partner; requests to the same partner go through that partner's
//! [`PartnerQueue`], so they never overlap. Partner failures and timeouts turn
//! into "no bid" and never stop the cycle from settling.

use async_trait::async_trait;
use futures::future::{join_all, LocalBoxFuture};
use futures::FutureExt;
use serde::Serialize;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::rc::Rc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::LifecycleConfig;
use crate::error::PartnerError;
use crate::page::PageState;
use crate::ports::{marks, AdServer, ErrorReporter, MetricsSink, REPORT_FEATURE};
use crate::queue::PartnerQueue;
use crate::registry::SharedRegistry;
use crate::size::AdSize;
use crate::slot::{BidHandle, Slot, SlotPhase, SlotReady};

fn new_id() -> String {
    Uuid::now_v7().simple().to_string()
}

/// One slot inside a partner request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BidSlot {
    pub slot_id: String,
    pub name: String,
    pub sizes: Vec<AdSize>,
    pub test_group: u8,
}

/// Partner-neutral bid request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BidRequest {
    pub auction_id: String,
    pub slots: Vec<BidSlot>,
    pub targeting: BTreeMap<String, Vec<String>>,
    pub is_refresh: bool,
}

/// A bid returned by a partner for one slot.
#[derive(Debug, Clone, PartialEq)]
pub struct PartnerBid {
    pub slot_id: String,
    pub size: AdSize,
    /// Plain CPM when the partner discloses it.
    pub price: Option<f64>,
    /// Key-values to hand to the ad server for this slot.
    pub targeting: Vec<(String, String)>,
}

/// A header-bidding demand partner.
#[async_trait(?Send)]
pub trait BidPartner {
    fn name(&self) -> &str;
    /// Auction budget; a partner still silent after this is a "no bid".
    fn timeout(&self) -> Duration;
    async fn request_bids(&self, request: &BidRequest) -> Result<Vec<PartnerBid>, PartnerError>;
}

struct PartnerLane {
    partner: Rc<dyn BidPartner>,
    queue: PartnerQueue,
}

/// A future that resolves once every requested slot has settled its bids.
pub type BidsSettled = LocalBoxFuture<'static, ()>;

pub struct BidOrchestrator {
    config: Rc<LifecycleConfig>,
    registry: SharedRegistry,
    page: Rc<PageState>,
    ad_server: Rc<dyn AdServer>,
    metrics: Rc<dyn MetricsSink>,
    reporter: Rc<dyn ErrorReporter>,
    lanes: Vec<Rc<PartnerLane>>,
}

impl BidOrchestrator {
    pub fn new(
        config: Rc<LifecycleConfig>,
        registry: SharedRegistry,
        page: Rc<PageState>,
        ad_server: Rc<dyn AdServer>,
        metrics: Rc<dyn MetricsSink>,
        reporter: Rc<dyn ErrorReporter>,
        partners: Vec<Rc<dyn BidPartner>>,
    ) -> Self {
        let lanes = partners
            .into_iter()
            .map(|partner| {
                Rc::new(PartnerLane {
                    queue: PartnerQueue::new(partner.name()),
                    partner,
                })
            })
            .collect();
        Self {
            config,
            registry,
            page,
            ad_server,
            metrics,
            reporter,
            lanes,
        }
    }

    /// Queue of the named partner, for inspection.
    pub fn partner_queue(&self, name: &str) -> Option<&PartnerQueue> {
        self.lanes
            .iter()
            .find(|lane| lane.partner.name() == name)
            .map(|lane| &lane.queue)
    }

    /// Request bids for `slot_ids`. Slots already carrying an in-flight request
    /// are not re-requested; the returned future waits for their existing cycle.
    pub fn request_bids(&self, slot_ids: &[String]) -> BidsSettled {
        let breakpoint = self.page.breakpoint();
        let mut waits: Vec<BidHandle> = Vec::new();
        let mut fresh: Vec<(BidSlot, SlotReady)> = Vec::new();
        {
            let registry = self.registry.borrow();
            for id in slot_ids {
                match registry.get(id) {
                    None => log::warn!("Bidding: unknown slot '{}'", id),
                    Some(slot) => match &slot.in_flight {
                        Some(handle) => {
                            log::debug!("Bidding: '{}' already has bids in flight", id);
                            waits.push(handle.clone());
                        }
                        None => fresh.push((
                            BidSlot {
                                slot_id: slot.id.clone(),
                                name: slot.name.clone(),
                                sizes: slot.sizes.resolve(breakpoint),
                                test_group: slot.test_group,
                            },
                            slot.ready(),
                        )),
                    },
                }
            }
        }
        if !fresh.is_empty() {
            waits.push(self.start_cycle(fresh, false));
        }
        join_all(waits).map(|_| ()).boxed_local()
    }

    /// Refresh variant for one rendered slot. Size-sensitive slots with more
    /// than one candidate keep their current concrete size; with none, the
    /// slot is left out of every partner request.
    pub fn refresh_bids(&self, slot_id: &str) -> BidsSettled {
        let breakpoint = self.page.breakpoint();
        let entry = {
            let registry = self.registry.borrow();
            let Some(slot) = registry.get(slot_id) else {
                log::warn!("Bidding: cannot refresh unknown slot '{}'", slot_id);
                return async {}.boxed_local();
            };
            if let Some(handle) = &slot.in_flight {
                return handle.clone().boxed_local();
            }
            let sizes = slot.sizes.resolve(breakpoint);
            let bid_slot = BidSlot {
                slot_id: slot.id.clone(),
                name: slot.name.clone(),
                sizes: self.refresh_sizes(slot, sizes),
                test_group: slot.test_group,
            };
            (bid_slot, slot.ready())
        };
        self.start_cycle(vec![entry], true).boxed_local()
    }

    fn refresh_sizes(&self, slot: &Slot, sizes: Vec<AdSize>) -> Vec<AdSize> {
        if !self.config.refresh.is_size_sensitive(&slot.name) || sizes.len() <= 1 {
            return sizes;
        }
        match slot.negotiated_size {
            Some(size) if size.is_concrete() => vec![size],
            _ => {
                log::debug!(
                    "Bidding: '{}' has no concrete size, skipping partners on refresh",
                    slot.id
                );
                Vec::new()
            }
        }
    }

    /// Notification that a partner's creative won the ad server auction.
    pub fn bid_won(&self, slot_id: &str, size: AdSize) {
        let mut registry = self.registry.borrow_mut();
        match registry.get_mut(slot_id) {
            Some(slot) => {
                slot.has_partner_size = true;
                slot.negotiated_size = Some(size);
                log::debug!("Bidding: partner won '{}' at {}", slot_id, size);
            }
            None => log::warn!("Bidding: bid won for unknown slot '{}'", slot_id),
        }
    }

    fn start_cycle(&self, entries: Vec<(BidSlot, SlotReady)>, is_refresh: bool) -> BidHandle {
        let (slots, readies): (Vec<BidSlot>, Vec<SlotReady>) = entries.into_iter().unzip();
        let request = BidRequest {
            auction_id: new_id(),
            slots,
            targeting: self.config.page_targeting.clone(),
            is_refresh,
        };
        let slot_ids: Vec<String> = request.slots.iter().map(|s| s.slot_id.clone()).collect();
        let ctx = CycleContext {
            registry: self.registry.clone(),
            ad_server: self.ad_server.clone(),
            metrics: self.metrics.clone(),
            reporter: self.reporter.clone(),
            lanes: self.lanes.clone(),
        };
        let handle = run_cycle(ctx, request, readies).boxed_local().shared();
        // Settles even if every caller drops its future.
        tokio::task::spawn_local(handle.clone());

        let mut registry = self.registry.borrow_mut();
        for id in &slot_ids {
            if let Some(slot) = registry.get_mut(id) {
                // A partner that stays silent this cycle must not keep its old bid.
                for key in std::mem::take(&mut slot.partner_keys) {
                    self.ad_server.clear_targeting(id, &key);
                }
                slot.in_flight = Some(handle.clone());
                slot.phase = SlotPhase::BidsRequested;
            }
        }
        handle
    }
}

#[derive(Clone)]
struct CycleContext {
    registry: SharedRegistry,
    ad_server: Rc<dyn AdServer>,
    metrics: Rc<dyn MetricsSink>,
    reporter: Rc<dyn ErrorReporter>,
    lanes: Vec<Rc<PartnerLane>>,
}

/// Bids go out only for slots the ad server finished preparing.
async fn run_cycle(ctx: CycleContext, request: BidRequest, readies: Vec<SlotReady>) {
    for slot in &request.slots {
        ctx.metrics.mark(marks::BID_REQUEST_START, Some(&slot.slot_id));
    }
    log::info!(
        "Bidding: auction '{}' for {} slot(s){}",
        request.auction_id,
        request.slots.len(),
        if request.is_refresh { " (refresh)" } else { "" }
    );

    let ready = join_all(readies).await;
    let biddable = BidRequest {
        slots: request
            .slots
            .iter()
            .zip(ready)
            .filter(|(s, ok)| *ok && !s.sizes.is_empty())
            .map(|(s, _)| s.clone())
            .collect(),
        ..request.clone()
    };

    let calls: Vec<_> = if biddable.slots.is_empty() {
        Vec::new()
    } else {
        let shared_request = Rc::new(biddable);
        ctx.lanes
            .iter()
            .map(|lane| {
                let job = call_partner(ctx.clone(), lane.clone(), shared_request.clone());
                lane.queue.submit(job)
            })
            .collect()
    };
    join_all(calls).await;

    let mut registry = ctx.registry.borrow_mut();
    for slot in &request.slots {
        if let Some(s) = registry.get_mut(&slot.slot_id) {
            s.in_flight = None;
        }
        ctx.metrics.mark(marks::BID_REQUEST_END, Some(&slot.slot_id));
    }
}

/// One partner call, run as a queue job. Targeting is applied to the ad server
/// before the job completes so the next queued call observes it.
async fn call_partner(ctx: CycleContext, lane: Rc<PartnerLane>, request: Rc<BidRequest>) {
    let partner = &lane.partner;
    let name = partner.name().to_string();
    let budget = partner.timeout();
    let call = AssertUnwindSafe(partner.request_bids(&request)).catch_unwind();

    let bids = match tokio::time::timeout(budget, call).await {
        Err(_) => {
            let err = PartnerError::Timeout {
                partner: name.clone(),
                budget_ms: budget.as_millis() as u64,
            };
            log::warn!("Bidding: {} for auction '{}'", err, request.auction_id);
            Vec::new()
        }
        Ok(Err(_panic)) => {
            let err = PartnerError::Panicked {
                partner: name.clone(),
            };
            report_partner_error(&ctx, &err, &request);
            Vec::new()
        }
        Ok(Ok(Err(err))) => {
            report_partner_error(&ctx, &err, &request);
            Vec::new()
        }
        Ok(Ok(Ok(bids))) => bids,
    };

    log::debug!(
        "Bidding: {} returned {} bid(s) for auction '{}'",
        name,
        bids.len(),
        request.auction_id
    );
    for bid in bids {
        if !request.slots.iter().any(|s| s.slot_id == bid.slot_id) {
            log::warn!("Bidding: {} bid on unrequested slot '{}'", name, bid.slot_id);
            continue;
        }
        let mut registry = ctx.registry.borrow_mut();
        let Some(slot) = registry.get_mut(&bid.slot_id) else {
            continue;
        };
        for (key, value) in &bid.targeting {
            ctx.ad_server
                .set_targeting(&bid.slot_id, key, std::slice::from_ref(value));
            slot.partner_keys.insert(key.clone());
        }
    }
}

fn report_partner_error(ctx: &CycleContext, err: &PartnerError, request: &BidRequest) {
    log::error!("Bidding: {} for auction '{}'", err, request.auction_id);
    let slots: Vec<&str> = request.slots.iter().map(|s| s.slot_id.as_str()).collect();
    ctx.reporter.report(
        err,
        REPORT_FEATURE,
        &[("auction", request.auction_id.as_str())],
        &serde_json::json!({ "slots": slots, "refresh": request.is_refresh }),
    );
}

/// Prebid "dense" price granularity: 0.01 up to 3, 0.05 up to 8, 0.50 up to
/// 20, capped at 20.
pub fn price_bucket(cpm: f64) -> String {
    let cpm = cpm.max(0.0);
    let (increment, cap) = if cpm <= 3.0 {
        (0.01, 3.0)
    } else if cpm <= 8.0 {
        (0.05, 8.0)
    } else {
        (0.50, 20.0)
    };
    let capped = cpm.min(cap);
    let bucket = ((capped / increment) + 1e-9).floor() * increment;
    format!("{:.2}", bucket)
}
