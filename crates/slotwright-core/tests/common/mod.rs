#![allow(dead_code)]

use async_trait::async_trait;
use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;
use std::time::Duration;

use slotwright_core::dom::{Document, MemoryDocument, NodeId};
use slotwright_core::error::{AdServerError, PartnerError};
use slotwright_core::page::Collaborators;
use slotwright_core::ports::{AdServer, ErrorReporter, MetricsSink, SlotDefinition};
use slotwright_core::{
    AdSize, BidPartner, BidRequest, Breakpoint, LifecycleConfig, Page, PartnerBid, SizeMapping,
};

#[derive(Debug, Clone, PartialEq)]
pub enum AdCall {
    Define(SlotDefinition),
    Targeting(String, String, Vec<String>),
    ClearTargeting(String, String),
    Display(String),
    Refresh(String),
    Destroy(String),
}

#[derive(Default)]
pub struct FakeAdServer {
    pub calls: RefCell<Vec<AdCall>>,
    pub reject: RefCell<HashSet<String>>,
}

impl FakeAdServer {
    pub fn definitions(&self) -> Vec<SlotDefinition> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|c| match c {
                AdCall::Define(d) => Some(d.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, wanted: &AdCall) -> usize {
        self.calls.borrow().iter().filter(|c| *c == wanted).count()
    }

    /// Current value of a targeting key, `None` when never set or cleared.
    pub fn targeting(&self, slot_id: &str, key: &str) -> Option<Vec<String>> {
        self.calls.borrow().iter().rev().find_map(|c| match c {
            AdCall::Targeting(s, k, v) if s == slot_id && k == key => Some(Some(v.clone())),
            AdCall::ClearTargeting(s, k) if s == slot_id && k == key => Some(None),
            _ => None,
        })?
    }
}

#[async_trait(?Send)]
impl AdServer for FakeAdServer {
    async fn define_slot(&self, definition: SlotDefinition) -> Result<(), AdServerError> {
        let rejected = self.reject.borrow().contains(&definition.slot_id);
        self.calls.borrow_mut().push(AdCall::Define(definition));
        if rejected {
            return Err(AdServerError("slot rejected".to_string()));
        }
        Ok(())
    }

    fn set_targeting(&self, slot_id: &str, key: &str, values: &[String]) {
        self.calls.borrow_mut().push(AdCall::Targeting(
            slot_id.to_string(),
            key.to_string(),
            values.to_vec(),
        ));
    }

    fn clear_targeting(&self, slot_id: &str, key: &str) {
        self.calls
            .borrow_mut()
            .push(AdCall::ClearTargeting(slot_id.to_string(), key.to_string()));
    }

    fn display(&self, slot_id: &str) {
        self.calls
            .borrow_mut()
            .push(AdCall::Display(slot_id.to_string()));
    }

    fn refresh(&self, slot_id: &str) {
        self.calls
            .borrow_mut()
            .push(AdCall::Refresh(slot_id.to_string()));
    }

    fn destroy_slot(&self, slot_id: &str) {
        self.calls
            .borrow_mut()
            .push(AdCall::Destroy(slot_id.to_string()));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    Bid,
    /// Bids on the first request, then stays silent past the timeout.
    BidOnce,
    Fail,
    Panic,
}

/// Partner that answers after `delay` according to its script, logging the
/// start and end of every call to a shared event log.
pub struct ScriptedPartner {
    pub name: String,
    pub timeout: Duration,
    pub delay: Duration,
    pub script: Script,
    pub requests: RefCell<Vec<BidRequest>>,
    pub log: Rc<RefCell<Vec<String>>>,
}

impl ScriptedPartner {
    pub fn new(name: &str, script: Script, log: Rc<RefCell<Vec<String>>>) -> Self {
        Self {
            name: name.to_string(),
            timeout: Duration::from_millis(500),
            delay: Duration::from_millis(20),
            script,
            requests: RefCell::new(Vec::new()),
            log,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn request_count(&self) -> usize {
        self.requests.borrow().len()
    }
}

#[async_trait(?Send)]
impl BidPartner for ScriptedPartner {
    fn name(&self) -> &str {
        &self.name
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn request_bids(&self, request: &BidRequest) -> Result<Vec<PartnerBid>, PartnerError> {
        self.requests.borrow_mut().push(request.clone());
        let ids: Vec<&str> = request.slots.iter().map(|s| s.slot_id.as_str()).collect();
        self.log
            .borrow_mut()
            .push(format!("{} start {}", self.name, ids.join(",")));
        let stalled = self.script == Script::BidOnce && self.request_count() > 1;
        let delay = if stalled { self.timeout * 4 } else { self.delay };
        tokio::time::sleep(delay).await;
        self.log
            .borrow_mut()
            .push(format!("{} end {}", self.name, ids.join(",")));

        match self.script {
            Script::Bid | Script::BidOnce => Ok(request
                .slots
                .iter()
                .filter_map(|slot| {
                    slot.sizes.first().map(|size| PartnerBid {
                        slot_id: slot.slot_id.clone(),
                        size: *size,
                        price: Some(1.0),
                        targeting: vec![(format!("{}_pb", self.name), "1.00".to_string())],
                    })
                })
                .collect()),
            Script::Fail => Err(PartnerError::Transport {
                partner: self.name.clone(),
                reason: "connection reset".to_string(),
            }),
            Script::Panic => panic!("{} blew up", self.name),
        }
    }
}

#[derive(Default)]
pub struct RecordingMetrics {
    pub marks: RefCell<Vec<(String, Option<String>)>>,
}

impl RecordingMetrics {
    pub fn count(&self, event: &str, origin: &str) -> usize {
        self.marks
            .borrow()
            .iter()
            .filter(|(e, o)| e == event && o.as_deref() == Some(origin))
            .count()
    }
}

impl MetricsSink for RecordingMetrics {
    fn mark(&self, event: &str, origin: Option<&str>) {
        self.marks
            .borrow_mut()
            .push((event.to_string(), origin.map(str::to_string)));
    }
}

#[derive(Default)]
pub struct RecordingReporter {
    pub reports: RefCell<Vec<String>>,
}

impl ErrorReporter for RecordingReporter {
    fn report(
        &self,
        error: &dyn std::error::Error,
        feature: &str,
        _tags: &[(&str, &str)],
        _extras: &serde_json::Value,
    ) {
        self.reports
            .borrow_mut()
            .push(format!("{}: {}", feature, error));
    }
}

pub struct Harness {
    pub page: Page,
    pub doc: Rc<MemoryDocument>,
    pub ad_server: Rc<FakeAdServer>,
    pub metrics: Rc<RecordingMetrics>,
    pub reporter: Rc<RecordingReporter>,
}

pub fn config() -> LifecycleConfig {
    let mut config = LifecycleConfig::default();
    config.slots.insert(
        "inline1".to_string(),
        SizeMapping::new()
            .with(Breakpoint::Mobile, vec![AdSize::MPU])
            .with(Breakpoint::Desktop, vec![AdSize::MPU, AdSize::HALF_PAGE]),
    );
    config.slots.insert(
        "inline2".to_string(),
        SizeMapping::new().with(Breakpoint::Mobile, vec![AdSize::MPU]),
    );
    config.slots.insert(
        "top-above-nav".to_string(),
        SizeMapping::new().with(
            Breakpoint::Desktop,
            vec![AdSize::LEADERBOARD, AdSize::BILLBOARD],
        ),
    );
    config
}

pub fn harness(partners: Vec<Rc<dyn BidPartner>>) -> Harness {
    harness_with(config(), partners, |c| c)
}

pub fn harness_with(
    config: LifecycleConfig,
    partners: Vec<Rc<dyn BidPartner>>,
    customize: impl FnOnce(Collaborators) -> Collaborators,
) -> Harness {
    let doc = Rc::new(MemoryDocument::new());
    let ad_server = Rc::new(FakeAdServer::default());
    let metrics = Rc::new(RecordingMetrics::default());
    let reporter = Rc::new(RecordingReporter::default());

    let mut collaborators = Collaborators::new(doc.clone(), ad_server.clone())
        .with_metrics(metrics.clone())
        .with_reporter(reporter.clone());
    for partner in partners {
        collaborators = collaborators.with_partner(partner);
    }
    let page = Page::new(config, Breakpoint::Desktop, customize(collaborators));
    Harness {
        page,
        doc,
        ad_server,
        metrics,
        reporter,
    }
}

/// A slot placeholder wrapped in an ad container, appended to the body.
pub fn placeholder(doc: &MemoryDocument, name: &str, attrs: &[(&str, &str)]) -> NodeId {
    let container = doc
        .append_element(doc.body(), "div", &["ad-slot-container"])
        .unwrap();
    let node = doc.append_element(container, "div", &[]).unwrap();
    doc.set_attribute(node, "data-name", name).unwrap();
    for (key, value) in attrs {
        doc.set_attribute(node, key, value).unwrap();
    }
    node
}

/// Simulate the creative frame the ad server injects on fill.
pub fn inject_creative(doc: &MemoryDocument, node: NodeId) -> NodeId {
    doc.append_element(node, "iframe", &[]).unwrap()
}

pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}
