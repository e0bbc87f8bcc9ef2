pub mod aps;
pub mod auction;
pub mod config;
pub mod define;
pub mod dom;
pub mod error;
pub mod openrtb;
pub mod page;
pub mod ports;
pub mod prebid;
pub mod queue;
pub mod registry;
pub mod render;
pub mod size;
pub mod slot;
pub mod viewability;

pub use auction::{BidOrchestrator, BidPartner, BidRequest, BidSlot, PartnerBid};
pub use config::LifecycleConfig;
pub use dom::{Document, MemoryDocument, NodeId};
pub use page::{Collaborators, LoadOutcome, Page, Visibility};
pub use render::SlotRenderEndedEvent;
pub use size::{AdSize, Breakpoint, SizeMapping};
pub use slot::{Slot, SlotPhase};
pub use viewability::RefreshOutcome;
