use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use validator::{Validate, ValidationError, ValidationErrors};

use crate::size::AdSize;

// OpenRTB 2.x MarkupType for Bid.mtype
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
pub enum MediaType {
    Banner = 1,
    Video = 2,
    Audio = 3,
    Native = 4,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, Validate)]
pub struct OpenRTBRequest {
    #[validate(length(min = 1))]
    pub id: String,
    #[validate(length(min = 1))]
    #[validate(nested)]
    pub imp: Vec<Imp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tmax: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cur: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site: Option<Site>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ext: Option<serde_json::Value>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Imp {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub banner: Option<Banner>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tagid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bidfloor: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ext: Option<serde_json::Value>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Banner {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub w: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub h: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<Vec<Format>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pos: Option<i64>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, Validate)]
pub struct Format {
    #[validate(range(min = 1))]
    pub w: i64,
    #[validate(range(min = 1))]
    pub h: i64,
}

impl From<AdSize> for Format {
    fn from(size: AdSize) -> Self {
        Self {
            w: i64::from(size.width()),
            h: i64::from(size.height()),
        }
    }
}

impl Validate for Imp {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if self.id.trim().is_empty() {
            let mut error = ValidationError::new("required");
            error.message = Some("imp.id must be non-empty".into());
            errors.add("id", error);
        }

        let formats = self
            .banner
            .as_ref()
            .and_then(|b| b.format.as_ref())
            .map_or(0, Vec::len);
        if formats == 0 {
            let mut error = ValidationError::new("missing_format");
            error.message = Some("imp requires a banner with at least one format".into());
            errors.add("banner", error);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Site {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keywords: Option<String>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct OpenRTBResponse {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cur: Option<String>,
    #[serde(default)]
    pub seatbid: Vec<SeatBid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nbr: Option<i64>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct SeatBid {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seat: Option<String>,
    pub bid: Vec<Bid>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Bid {
    pub id: String,
    pub impid: String,
    pub price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adm: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub w: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub h: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtype: Option<MediaType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adomain: Option<Vec<String>>,
}

impl Bid {
    /// Creative size, when both dimensions are present and non-negative.
    pub fn size(&self) -> Option<AdSize> {
        let w = u32::try_from(self.w?).ok()?;
        let h = u32::try_from(self.h?).ok()?;
        Some(AdSize::new(w, h))
    }
}
