//! Prebid partner speaking OpenRTB 2.x to a prebid server.

use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::Duration;
use url::Url;
use validator::Validate;

use crate::auction::{price_bucket, BidPartner, BidRequest, PartnerBid};
use crate::config::PrebidConfig;
use crate::error::PartnerError;
use crate::openrtb::{Banner, Bid, Format, Imp, OpenRTBRequest, OpenRTBResponse, Site};

pub const PARTNER_NAME: &str = "prebid";

/// Network hop to the prebid server auction endpoint.
#[async_trait(?Send)]
pub trait OpenRtbTransport {
    async fn auction(&self, request: OpenRTBRequest) -> Result<OpenRTBResponse, PartnerError>;
}

pub struct PrebidPartner<T> {
    config: PrebidConfig,
    transport: T,
}

impl<T: OpenRtbTransport> PrebidPartner<T> {
    pub fn new(config: PrebidConfig, transport: T) -> Self {
        Self { config, transport }
    }

    fn site(&self, request: &BidRequest) -> Site {
        let domain = self
            .config
            .page_url
            .as_deref()
            .and_then(|raw| match Url::parse(raw) {
                Ok(url) => url.host_str().map(str::to_string),
                Err(e) => {
                    log::warn!("Bidding: invalid prebid page_url '{}': {}", raw, e);
                    None
                }
            });
        let keywords = request
            .targeting
            .get("k")
            .filter(|k| !k.is_empty())
            .map(|k| k.join(","));
        Site {
            domain,
            page: self.config.page_url.clone(),
            keywords,
        }
    }

    /// One imp per slot carrying its concrete sizes; slots without any are left out.
    pub fn build_request(&self, request: &BidRequest) -> OpenRTBRequest {
        let imp = request
            .slots
            .iter()
            .filter_map(|slot| {
                let format: Vec<Format> = slot
                    .sizes
                    .iter()
                    .filter(|s| s.is_concrete())
                    .map(|s| Format::from(*s))
                    .collect();
                if format.is_empty() {
                    return None;
                }
                Some(Imp {
                    id: slot.slot_id.clone(),
                    tagid: Some(slot.name.clone()),
                    banner: Some(Banner {
                        format: Some(format),
                        ..Default::default()
                    }),
                    ext: Some(serde_json::json!({ "testgroup": slot.test_group })),
                    ..Default::default()
                })
            })
            .collect();
        OpenRTBRequest {
            id: request.auction_id.clone(),
            imp,
            tmax: i64::try_from(self.config.timeout_ms).ok(),
            cur: Some(vec!["USD".to_string()]),
            site: Some(self.site(request)),
            ..Default::default()
        }
    }

    /// Highest price per imp; on a tie the first bid seen wins.
    pub fn bids_from_response(response: OpenRTBResponse) -> Vec<PartnerBid> {
        let mut order: Vec<String> = Vec::new();
        let mut best: HashMap<String, (String, Bid)> = HashMap::new();
        for seat in response.seatbid {
            let bidder = seat.seat.unwrap_or_else(|| PARTNER_NAME.to_string());
            for bid in seat.bid {
                let replace = match best.get(&bid.impid) {
                    Some((_, current)) => {
                        bid.price.partial_cmp(&current.price) == Some(Ordering::Greater)
                    }
                    None => {
                        order.push(bid.impid.clone());
                        true
                    }
                };
                if replace {
                    best.insert(bid.impid.clone(), (bidder.clone(), bid));
                }
            }
        }

        order
            .into_iter()
            .filter_map(|impid| {
                let (bidder, bid) = best.remove(&impid)?;
                let Some(size) = bid.size() else {
                    log::warn!("Bidding: {} bid for '{}' has no size", bidder, impid);
                    return None;
                };
                let targeting = vec![
                    ("hb_pb".to_string(), price_bucket(bid.price)),
                    ("hb_bidder".to_string(), bidder),
                    ("hb_size".to_string(), format!("{}x{}", size.width(), size.height())),
                    ("hb_adid".to_string(), bid.adid.clone().unwrap_or(bid.id)),
                ];
                Some(PartnerBid {
                    slot_id: impid,
                    size,
                    price: Some(bid.price),
                    targeting,
                })
            })
            .collect()
    }
}

#[async_trait(?Send)]
impl<T: OpenRtbTransport> BidPartner for PrebidPartner<T> {
    fn name(&self) -> &str {
        PARTNER_NAME
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    async fn request_bids(&self, request: &BidRequest) -> Result<Vec<PartnerBid>, PartnerError> {
        let ortb = self.build_request(request);
        if ortb.imp.is_empty() {
            return Ok(Vec::new());
        }
        ortb.validate().map_err(|e| PartnerError::InvalidRequest {
            partner: PARTNER_NAME.to_string(),
            reason: e.to_string(),
        })?;
        let response = self.transport.auction(ortb).await?;
        Ok(Self::bids_from_response(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auction::BidSlot;
    use crate::openrtb::SeatBid;
    use crate::size::AdSize;
    use std::collections::BTreeMap;

    struct Unused;

    #[async_trait(?Send)]
    impl OpenRtbTransport for Unused {
        async fn auction(&self, _: OpenRTBRequest) -> Result<OpenRTBResponse, PartnerError> {
            Err(PartnerError::Transport {
                partner: PARTNER_NAME.to_string(),
                reason: "unused".to_string(),
            })
        }
    }

    fn partner() -> PrebidPartner<Unused> {
        PrebidPartner::new(
            PrebidConfig {
                timeout_ms: 1200,
                page_url: Some("https://www.example.com/news/story".to_string()),
            },
            Unused,
        )
    }

    fn bid(impid: &str, price: f64, id: &str) -> Bid {
        Bid {
            id: id.to_string(),
            impid: impid.to_string(),
            price,
            w: Some(300),
            h: Some(250),
            ..Default::default()
        }
    }

    #[test]
    fn request_has_one_imp_per_biddable_slot() {
        let request = BidRequest {
            auction_id: "auction-1".to_string(),
            slots: vec![
                BidSlot {
                    slot_id: "dfp-ad--inline1".to_string(),
                    name: "inline1".to_string(),
                    sizes: vec![AdSize::MPU, AdSize::FLUID],
                    test_group: 12,
                },
                BidSlot {
                    slot_id: "dfp-ad--fluid".to_string(),
                    name: "fluid".to_string(),
                    sizes: vec![AdSize::FLUID],
                    test_group: 13,
                },
            ],
            targeting: BTreeMap::from([(
                "k".to_string(),
                vec!["politics".to_string(), "uk".to_string()],
            )]),
            is_refresh: false,
        };
        let ortb = partner().build_request(&request);
        assert_eq!(ortb.id, "auction-1");
        assert_eq!(ortb.tmax, Some(1200));
        assert_eq!(ortb.imp.len(), 1);
        let imp = &ortb.imp[0];
        assert_eq!(imp.tagid.as_deref(), Some("inline1"));
        let format = imp.banner.as_ref().unwrap().format.as_ref().unwrap();
        assert_eq!((format[0].w, format[0].h), (300, 250));
        assert_eq!(format.len(), 1);

        let site = ortb.site.unwrap();
        assert_eq!(site.domain.as_deref(), Some("www.example.com"));
        assert_eq!(site.keywords.as_deref(), Some("politics,uk"));
        assert!(ortb_validates(&partner().build_request(&request)));
    }

    fn ortb_validates(req: &OpenRTBRequest) -> bool {
        req.validate().is_ok()
    }

    #[test]
    fn best_bid_per_imp_first_wins_ties() {
        let response = OpenRTBResponse {
            id: "auction-1".to_string(),
            seatbid: vec![
                SeatBid {
                    seat: Some("alpha".to_string()),
                    bid: vec![bid("a", 1.50, "x1"), bid("b", 2.00, "x2")],
                },
                SeatBid {
                    seat: Some("beta".to_string()),
                    bid: vec![bid("a", 2.75, "y1"), bid("b", 2.00, "y2")],
                },
            ],
            ..Default::default()
        };
        let bids = PrebidPartner::<Unused>::bids_from_response(response);
        assert_eq!(bids.len(), 2);
        assert_eq!(bids[0].slot_id, "a");
        assert_eq!(bids[0].price, Some(2.75));
        assert!(bids[0]
            .targeting
            .contains(&("hb_bidder".to_string(), "beta".to_string())));
        assert!(bids[0]
            .targeting
            .contains(&("hb_pb".to_string(), "2.75".to_string())));
        assert_eq!(bids[1].slot_id, "b");
        assert!(bids[1]
            .targeting
            .contains(&("hb_adid".to_string(), "x2".to_string())));
        assert!(bids[1]
            .targeting
            .contains(&("hb_size".to_string(), "300x250".to_string())));
    }

    #[test]
    fn sizeless_bids_are_dropped() {
        let mut sizeless = bid("a", 3.0, "z");
        sizeless.w = None;
        let response = OpenRTBResponse {
            seatbid: vec![SeatBid {
                seat: None,
                bid: vec![sizeless],
            }],
            ..Default::default()
        };
        assert!(PrebidPartner::<Unused>::bids_from_response(response).is_empty());
    }
}
