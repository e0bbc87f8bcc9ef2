//! In-process stand-ins for the bid endpoints and the ad server.
//!
//! Partners always bid at a fixed price on a standard size. The ad server
//! mediates on the targeting it was handed: highest price wins, first on tie.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::Rc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use slotwright_core::aps::{
    parse_aps_size, ApsBidRequest, ApsBidResponse, ApsContextual, ApsSlotResponse, ApsTransport,
};
use slotwright_core::dom::{Document, MemoryDocument};
use slotwright_core::error::{AdServerError, PartnerError};
use slotwright_core::openrtb::{Bid, Imp, MediaType, OpenRTBRequest, OpenRTBResponse, SeatBid};
use slotwright_core::ports::{AdServer, SlotDefinition};
use slotwright_core::prebid::OpenRtbTransport;
use slotwright_core::{AdSize, SlotRenderEndedEvent};

fn new_id() -> String {
    Uuid::now_v7().simple().to_string()
}

pub fn is_standard_size(size: &AdSize) -> bool {
    matches!(
        (size.width(), size.height()),
        (300, 250)
            | (320, 50)
            | (728, 90)
            | (160, 600)
            | (300, 50)
            | (300, 600)
            | (970, 250)
            | (468, 60)
            | (336, 280)
            | (320, 100)
    )
}

/// First standard size on offer, or an MPU.
pub fn standard_or_default(sizes: impl IntoIterator<Item = AdSize>) -> AdSize {
    sizes
        .into_iter()
        .find(is_standard_size)
        .unwrap_or(AdSize::MPU)
}

/// The mock encodes APS prices as base64 of the decimal price.
pub fn encode_aps_price(price: f64) -> String {
    STANDARD.encode(format!("{:.2}", price).as_bytes())
}

pub fn decode_aps_price(encoded: &str) -> anyhow::Result<f64> {
    let decoded = STANDARD
        .decode(encoded)
        .with_context(|| format!("Failed to base64 decode price '{}'", encoded))?;
    let price = std::str::from_utf8(&decoded).context("Decoded price is not UTF-8")?;
    price
        .parse::<f64>()
        .with_context(|| format!("Failed to parse price '{}' as f64", price))
}

// ============================================================================
// Partners
// ============================================================================

pub struct MockAps {
    pub price: f64,
    pub latency: Duration,
}

#[async_trait(?Send)]
impl ApsTransport for MockAps {
    async fn fetch_bids(&self, request: ApsBidRequest) -> Result<ApsBidResponse, PartnerError> {
        tokio::time::sleep(self.latency).await;
        let slots = request
            .slots
            .into_iter()
            .map(|slot| {
                let size = standard_or_default(slot.sizes.iter().map(|[w, h]| AdSize::new(*w, *h)));
                let wxh = format!("{}x{}", size.width(), size.height());
                ApsSlotResponse {
                    crid: Some(format!("slotwright-aps-{}", slot.slot_id)),
                    slot_id: slot.slot_id,
                    size: wxh.clone(),
                    fif: Some("1".to_string()),
                    amzniid: Some(new_id()),
                    amznbid: Some(encode_aps_price(self.price)),
                    amznp: Some("1".to_string()),
                    amznsz: Some(wxh),
                    amznactt: Some("OPEN".to_string()),
                }
            })
            .collect();
        Ok(ApsBidResponse {
            contextual: ApsContextual {
                slots,
                status: Some("ok".to_string()),
            },
        })
    }
}

pub struct MockPrebid {
    pub price: f64,
    pub latency: Duration,
}

fn imp_size(imp: &Imp) -> AdSize {
    let offered = imp
        .banner
        .as_ref()
        .and_then(|b| b.format.as_ref())
        .into_iter()
        .flatten()
        .filter_map(|f| Some(AdSize::new(u32::try_from(f.w).ok()?, u32::try_from(f.h).ok()?)));
    standard_or_default(offered)
}

#[async_trait(?Send)]
impl OpenRtbTransport for MockPrebid {
    async fn auction(&self, request: OpenRTBRequest) -> Result<OpenRTBResponse, PartnerError> {
        tokio::time::sleep(self.latency).await;
        let bid = request
            .imp
            .iter()
            .map(|imp| {
                let size = imp_size(imp);
                Bid {
                    id: new_id(),
                    impid: imp.id.clone(),
                    price: self.price,
                    crid: Some(format!("slotwright-{}", imp.id)),
                    w: Some(i64::from(size.width())),
                    h: Some(i64::from(size.height())),
                    mtype: Some(MediaType::Banner),
                    adomain: Some(vec!["example.com".to_string()]),
                    ..Default::default()
                }
            })
            .collect();
        Ok(OpenRTBResponse {
            id: request.id,
            cur: Some("USD".to_string()),
            seatbid: vec![SeatBid {
                seat: Some("slotwright".to_string()),
                bid,
            }],
            ..Default::default()
        })
    }
}

// ============================================================================
// Ad server
// ============================================================================

/// Line item ids the mock attributes to each winning source.
pub const APS_LINE_ITEM: u64 = 5001;
pub const PREBID_LINE_ITEM: u64 = 5002;

/// Delegate callbacks the mock ad server raises.
#[derive(Debug, Clone, PartialEq)]
pub enum AdEvent {
    PartnerWon { slot_id: String, size: AdSize },
    RenderEnded(SlotRenderEndedEvent),
    Viewable(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Winner {
    pub size: AdSize,
    pub price: f64,
    pub line_item_id: u64,
    pub from_aps: bool,
}

pub struct MockAdServer {
    document: Rc<MemoryDocument>,
    latency: Duration,
    unfilled: HashSet<String>,
    defined: RefCell<HashSet<String>>,
    targeting: RefCell<HashMap<String, BTreeMap<String, Vec<String>>>>,
    events: UnboundedSender<AdEvent>,
}

impl MockAdServer {
    pub fn new(
        document: Rc<MemoryDocument>,
        latency: Duration,
        unfilled: HashSet<String>,
        events: UnboundedSender<AdEvent>,
    ) -> Self {
        Self {
            document,
            latency,
            unfilled,
            defined: RefCell::new(HashSet::new()),
            targeting: RefCell::new(HashMap::new()),
            events,
        }
    }

    fn value(&self, slot_id: &str, key: &str) -> Option<String> {
        self.targeting
            .borrow()
            .get(slot_id)
            .and_then(|kv| kv.get(key))
            .and_then(|v| v.first().cloned())
    }

    fn aps_bid(&self, slot_id: &str) -> anyhow::Result<Option<Winner>> {
        let (Some(encoded), Some(size)) =
            (self.value(slot_id, "amznbid"), self.value(slot_id, "amznsz"))
        else {
            return Ok(None);
        };
        let price = decode_aps_price(&encoded)?;
        let size = parse_aps_size(&size).ok_or_else(|| anyhow!("Bad amznsz '{}'", size))?;
        Ok(Some(Winner {
            size,
            price,
            line_item_id: APS_LINE_ITEM,
            from_aps: true,
        }))
    }

    fn prebid_bid(&self, slot_id: &str) -> anyhow::Result<Option<Winner>> {
        let (Some(bucket), Some(size)) =
            (self.value(slot_id, "hb_pb"), self.value(slot_id, "hb_size"))
        else {
            return Ok(None);
        };
        let price = bucket
            .parse::<f64>()
            .with_context(|| format!("Bad hb_pb '{}'", bucket))?;
        let size = parse_aps_size(&size).ok_or_else(|| anyhow!("Bad hb_size '{}'", size))?;
        Ok(Some(Winner {
            size,
            price,
            line_item_id: PREBID_LINE_ITEM,
            from_aps: false,
        }))
    }

    /// Highest price wins; on a tie the earlier source keeps it.
    pub fn mediate(&self, slot_id: &str) -> anyhow::Result<Option<Winner>> {
        let mut winner: Option<Winner> = None;
        for candidate in [self.aps_bid(slot_id)?, self.prebid_bid(slot_id)?]
            .into_iter()
            .flatten()
        {
            if winner.map_or(true, |w| candidate.price > w.price) {
                winner = Some(candidate);
            }
        }
        Ok(winner)
    }

    fn serve(&self, slot_id: &str) {
        if !self.defined.borrow().contains(slot_id) {
            log::warn!("AdServer: ignoring request for undefined slot '{}'", slot_id);
            return;
        }
        let winner = if self.unfilled.contains(slot_id) {
            None
        } else {
            match self.mediate(slot_id) {
                Ok(winner) => winner,
                Err(e) => {
                    log::error!("AdServer: mediation failed for '{}': {:#}", slot_id, e);
                    None
                }
            }
        };

        let Some(winner) = winner else {
            log::info!("AdServer: no fill for '{}'", slot_id);
            self.emit(AdEvent::RenderEnded(SlotRenderEndedEvent::empty(slot_id)));
            return;
        };
        log::info!(
            "AdServer: '{}' won by line item {} at ${:.2} ({})",
            slot_id,
            winner.line_item_id,
            winner.price,
            winner.size
        );
        if let Some(node) = self.document.element_by_id(slot_id) {
            for child in self.document.children(node) {
                if self.document.tag(child).as_deref() == Some("iframe") {
                    if let Err(e) = self.document.remove(child) {
                        log::warn!("AdServer: could not clear old creative: {}", e);
                    }
                }
            }
            if let Err(e) = self.document.append_element(node, "iframe", &[]) {
                log::warn!("AdServer: could not inject creative: {}", e);
            }
        }
        if winner.from_aps {
            self.emit(AdEvent::PartnerWon {
                slot_id: slot_id.to_string(),
                size: winner.size,
            });
        }
        self.emit(AdEvent::RenderEnded(SlotRenderEndedEvent::filled(
            slot_id,
            winner.size,
            Some(winner.line_item_id),
        )));
        self.emit(AdEvent::Viewable(slot_id.to_string()));
    }

    fn emit(&self, event: AdEvent) {
        if self.events.send(event).is_err() {
            log::debug!("AdServer: event receiver closed");
        }
    }
}

#[async_trait(?Send)]
impl AdServer for MockAdServer {
    async fn define_slot(&self, definition: SlotDefinition) -> Result<(), AdServerError> {
        tokio::time::sleep(self.latency).await;
        log::debug!(
            "AdServer: defined '{}' at {} with {} size(s)",
            definition.slot_id,
            definition.ad_unit_path,
            definition.sizes.len()
        );
        self.targeting
            .borrow_mut()
            .insert(definition.slot_id.clone(), definition.targeting);
        self.defined.borrow_mut().insert(definition.slot_id);
        Ok(())
    }

    fn set_targeting(&self, slot_id: &str, key: &str, values: &[String]) {
        self.targeting
            .borrow_mut()
            .entry(slot_id.to_string())
            .or_default()
            .insert(key.to_string(), values.to_vec());
    }

    fn clear_targeting(&self, slot_id: &str, key: &str) {
        if let Some(targeting) = self.targeting.borrow_mut().get_mut(slot_id) {
            targeting.remove(key);
        }
    }

    fn display(&self, slot_id: &str) {
        self.serve(slot_id);
    }

    fn refresh(&self, slot_id: &str) {
        self.serve(slot_id);
    }

    fn destroy_slot(&self, slot_id: &str) {
        self.defined.borrow_mut().remove(slot_id);
        self.targeting.borrow_mut().remove(slot_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn ad_server() -> (MockAdServer, mpsc::UnboundedReceiver<AdEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let server = MockAdServer::new(
            Rc::new(MemoryDocument::new()),
            Duration::ZERO,
            HashSet::new(),
            tx,
        );
        (server, rx)
    }

    fn set(server: &MockAdServer, key: &str, value: &str) {
        server.set_targeting("slot", key, &[value.to_string()]);
    }

    #[test]
    fn aps_price_decodes_back() {
        assert_eq!(encode_aps_price(2.5), "Mi41MA==");
        assert_eq!(decode_aps_price("Mi41MA==").unwrap(), 2.5);
        assert!(decode_aps_price("not base64!").is_err());
    }

    #[test]
    fn standard_size_falls_back_to_mpu() {
        assert_eq!(
            standard_or_default([AdSize::new(1, 1), AdSize::LEADERBOARD]),
            AdSize::LEADERBOARD
        );
        assert_eq!(standard_or_default([AdSize::new(88, 71)]), AdSize::MPU);
    }

    #[test]
    fn highest_price_wins_and_ties_go_to_aps() {
        let (server, _rx) = ad_server();
        set(&server, "amznbid", &encode_aps_price(1.5));
        set(&server, "amznsz", "300x600");
        set(&server, "hb_pb", "2.00");
        set(&server, "hb_size", "300x250");
        let winner = server.mediate("slot").unwrap().unwrap();
        assert_eq!(winner.line_item_id, PREBID_LINE_ITEM);
        assert_eq!(winner.size, AdSize::MPU);

        set(&server, "hb_pb", "1.50");
        let winner = server.mediate("slot").unwrap().unwrap();
        assert!(winner.from_aps);
        assert_eq!(winner.size, AdSize::HALF_PAGE);
    }

    #[test]
    fn no_targeting_means_no_winner() {
        let (server, _rx) = ad_server();
        assert_eq!(server.mediate("slot").unwrap(), None);
        set(&server, "amznbid", "garbage");
        set(&server, "amznsz", "300x250");
        assert!(server.mediate("slot").is_err());
    }

    #[tokio::test]
    async fn undefined_slots_are_not_served() {
        let (server, mut rx) = ad_server();
        server.display("slot");
        assert!(rx.try_recv().is_err());

        server
            .define_slot(SlotDefinition {
                ad_unit_path: "/1234/site".to_string(),
                slot_id: "slot".to_string(),
                sizes: vec![AdSize::MPU],
                size_mapping: vec![],
                targeting: BTreeMap::new(),
            })
            .await
            .unwrap();
        server.display("slot");
        assert_eq!(
            rx.try_recv().unwrap(),
            AdEvent::RenderEnded(SlotRenderEndedEvent::empty("slot"))
        );
    }

    #[tokio::test]
    async fn mock_aps_bids_on_a_standard_size() {
        let aps = MockAps {
            price: 3.0,
            latency: Duration::ZERO,
        };
        let response = aps
            .fetch_bids(ApsBidRequest {
                pub_id: "5555".to_string(),
                slots: vec![slotwright_core::aps::ApsSlot {
                    slot_id: "dfp-ad--inline1".to_string(),
                    sizes: vec![[88, 71], [300, 600]],
                    slot_name: None,
                }],
                page_url: None,
                timeout: None,
            })
            .await
            .unwrap();
        let slot = &response.contextual.slots[0];
        assert!(slot.is_filled());
        assert_eq!(slot.amznsz.as_deref(), Some("300x600"));
        assert_eq!(decode_aps_price(slot.amznbid.as_deref().unwrap()).unwrap(), 3.0);
    }
}
