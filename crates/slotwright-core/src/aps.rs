//! Amazon Publisher Services (APS) TAM partner.
//!
//! Wire types follow the `/e/dtb/bid` request and response format. The network
//! hop lives behind [`ApsTransport`]; [`ApsPartner`] turns a partner-neutral
//! [`BidRequest`] into an APS request and the response into targeting.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

use crate::auction::{BidPartner, BidRequest, PartnerBid};
use crate::config::ApsConfig;
use crate::error::PartnerError;
use crate::size::AdSize;

pub const PARTNER_NAME: &str = "aps";

// ============================================================================
// Request
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ApsBidRequest {
    #[serde(rename = "pubId")]
    #[validate(length(min = 1))]
    pub pub_id: String,

    #[validate(length(min = 1))]
    pub slots: Vec<ApsSlot>,

    #[serde(rename = "pageUrl", skip_serializing_if = "Option::is_none")]
    pub page_url: Option<String>,

    /// Timeout in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApsSlot {
    #[serde(rename = "slotID")]
    pub slot_id: String,

    /// Ad sizes [[width, height], ...]
    pub sizes: Vec<[u32; 2]>,

    #[serde(rename = "slotName", skip_serializing_if = "Option::is_none")]
    pub slot_name: Option<String>,
}

// ============================================================================
// Response
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApsBidResponse {
    pub contextual: ApsContextual,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApsContextual {
    #[serde(default)]
    pub slots: Vec<ApsSlotResponse>,

    /// Response status ("ok", "error", etc.)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// One slot of an APS response. Targeting keys come back as flat fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApsSlotResponse {
    #[serde(rename = "slotID")]
    pub slot_id: String,

    /// Creative size (e.g., "300x250")
    pub size: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub crid: Option<String>,

    /// Fill indicator flag ("1" = filled, "0" = no fill)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fif: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub amzniid: Option<String>,

    /// Encoded bid price, opaque to the page
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amznbid: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub amznp: Option<String>,

    /// Size in WxH format (e.g., "300x250")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amznsz: Option<String>,

    /// Auction context type ("OPEN", "PRIVATE", etc.)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amznactt: Option<String>,
}

impl ApsSlotResponse {
    pub fn is_filled(&self) -> bool {
        self.fif.as_deref() == Some("1")
    }

    /// `amzn*` key-values present on this slot.
    pub fn targeting(&self) -> Vec<(String, String)> {
        [
            ("amzniid", &self.amzniid),
            ("amznbid", &self.amznbid),
            ("amznp", &self.amznp),
            ("amznsz", &self.amznsz),
            ("amznactt", &self.amznactt),
        ]
        .into_iter()
        .filter_map(|(key, value)| value.as_ref().map(|v| (key.to_string(), v.clone())))
        .collect()
    }
}

/// Parse an APS "WxH" size.
pub fn parse_aps_size(size: &str) -> Option<AdSize> {
    let (w, h) = size.split_once('x')?;
    Some(AdSize::new(w.trim().parse().ok()?, h.trim().parse().ok()?))
}

// ============================================================================
// Partner
// ============================================================================

/// Network hop to the APS bid endpoint.
#[async_trait(?Send)]
pub trait ApsTransport {
    async fn fetch_bids(&self, request: ApsBidRequest) -> Result<ApsBidResponse, PartnerError>;
}

pub struct ApsPartner<T> {
    config: ApsConfig,
    page_url: Option<String>,
    transport: T,
}

impl<T: ApsTransport> ApsPartner<T> {
    pub fn new(config: ApsConfig, page_url: Option<String>, transport: T) -> Self {
        Self {
            config,
            page_url,
            transport,
        }
    }

    /// APS only accepts concrete sizes; slots left without any are omitted.
    pub fn build_request(&self, request: &BidRequest) -> ApsBidRequest {
        let slots = request
            .slots
            .iter()
            .filter_map(|slot| {
                let sizes: Vec<[u32; 2]> = slot
                    .sizes
                    .iter()
                    .filter(|s| s.is_concrete())
                    .map(|s| [s.width(), s.height()])
                    .collect();
                if sizes.is_empty() {
                    return None;
                }
                Some(ApsSlot {
                    slot_id: slot.slot_id.clone(),
                    sizes,
                    slot_name: Some(slot.name.clone()),
                })
            })
            .collect();
        ApsBidRequest {
            pub_id: self.config.pub_id.clone(),
            slots,
            page_url: self.page_url.clone(),
            timeout: Some(self.config.timeout_ms),
        }
    }

    pub fn bids_from_response(response: ApsBidResponse) -> Vec<PartnerBid> {
        response
            .contextual
            .slots
            .into_iter()
            .filter(ApsSlotResponse::is_filled)
            .filter_map(|slot| {
                let Some(size) = parse_aps_size(&slot.size) else {
                    log::warn!(
                        "Bidding: aps returned unparseable size '{}' for '{}'",
                        slot.size,
                        slot.slot_id
                    );
                    return None;
                };
                Some(PartnerBid {
                    targeting: slot.targeting(),
                    slot_id: slot.slot_id,
                    size,
                    price: None,
                })
            })
            .collect()
    }
}

#[async_trait(?Send)]
impl<T: ApsTransport> BidPartner for ApsPartner<T> {
    fn name(&self) -> &str {
        PARTNER_NAME
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    async fn request_bids(&self, request: &BidRequest) -> Result<Vec<PartnerBid>, PartnerError> {
        let aps_request = self.build_request(request);
        if aps_request.slots.is_empty() {
            return Ok(Vec::new());
        }
        aps_request
            .validate()
            .map_err(|e| PartnerError::InvalidRequest {
                partner: PARTNER_NAME.to_string(),
                reason: e.to_string(),
            })?;
        let response = self.transport.fetch_bids(aps_request).await?;
        Ok(Self::bids_from_response(response))
    }
}
