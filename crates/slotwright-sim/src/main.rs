//! Drives one simulated page through the slot lifecycle against mock demand
//! and a mock ad server.
//!
//! Usage: `slotwright-sim [config.toml]`. Without an argument the bundled
//! `sim.toml` is used.

mod config;
mod mock;

use anyhow::Context;
use std::rc::Rc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::LocalSet;

use slotwright_core::aps::ApsPartner;
use slotwright_core::dom::{Document, MemoryDocument, NodeId};
use slotwright_core::ports::StaticLineItems;
use slotwright_core::prebid::PrebidPartner;
use slotwright_core::{Collaborators, LoadOutcome, Page};

use crate::config::{PlaceholderConfig, SimConfig};
use crate::mock::{AdEvent, MockAdServer, MockAps, MockPrebid};

fn load_config() -> anyhow::Result<SimConfig> {
    match std::env::args().nth(1) {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config file {}", path))?;
            SimConfig::from_toml_str(&raw).with_context(|| format!("loading {}", path))
        }
        None => SimConfig::from_toml_str(include_str!("../sim.toml")),
    }
}

fn main() {
    if let Err(err) = run() {
        eprintln!("slotwright-sim failed: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let cfg = load_config()?;
    simple_logger::SimpleLogger::new()
        .with_level(cfg.logging.level)
        .init()?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(cfg.virtual_time)
        .build()?;
    LocalSet::new().block_on(&runtime, simulate(cfg))
}

/// Append each placeholder inside its configured wrapper elements.
fn place_slots(
    doc: &MemoryDocument,
    placeholders: &[PlaceholderConfig],
) -> anyhow::Result<Vec<NodeId>> {
    placeholders
        .iter()
        .map(|placeholder| {
            let mut parent = doc.body();
            for class in placeholder.container.split_whitespace() {
                parent = doc.append_element(parent, "div", &[class])?;
            }
            let node = doc.append_element(parent, "div", &[])?;
            doc.set_attribute(node, "data-name", &placeholder.name)?;
            Ok::<_, anyhow::Error>(node)
        })
        .collect()
}

fn collaborators(
    cfg: &SimConfig,
    doc: Rc<MemoryDocument>,
    ad_server: Rc<MockAdServer>,
) -> Collaborators {
    let latency = cfg.market.latency();
    let partners = &cfg.lifecycle.partners;
    let mut collaborators = Collaborators::new(doc, ad_server).with_line_items(Rc::new(
        StaticLineItems(cfg.market.ineligible_line_items.clone()),
    ));
    if let Some(aps) = partners.aps.clone() {
        let page_url = partners.prebid.as_ref().and_then(|p| p.page_url.clone());
        collaborators = collaborators.with_partner(Rc::new(ApsPartner::new(
            aps,
            page_url,
            MockAps {
                price: cfg.market.aps_price,
                latency,
            },
        )));
    }
    if let Some(prebid) = partners.prebid.clone() {
        collaborators = collaborators.with_partner(Rc::new(PrebidPartner::new(
            prebid,
            MockPrebid {
                price: cfg.market.prebid_price,
                latency,
            },
        )));
    }
    collaborators
}

async fn simulate(cfg: SimConfig) -> anyhow::Result<()> {
    let doc = Rc::new(MemoryDocument::new());
    let (events, mut inbox) = mpsc::unbounded_channel();
    let ad_server = Rc::new(MockAdServer::new(
        doc.clone(),
        cfg.market.latency(),
        cfg.market.unfilled.clone(),
        events,
    ));
    let page = Rc::new(Page::new(
        cfg.lifecycle.clone(),
        cfg.page.breakpoint,
        collaborators(&cfg, doc.clone(), ad_server),
    ));

    let viewable_after = Duration::from_millis(cfg.page.viewable_after_ms);
    let driver = {
        let page = page.clone();
        tokio::task::spawn_local(async move {
            while let Some(event) = inbox.recv().await {
                match event {
                    AdEvent::PartnerWon { slot_id, size } => {
                        page.on_partner_bid_won(&slot_id, size);
                    }
                    AdEvent::RenderEnded(event) => {
                        let filled = !event.is_empty;
                        let slot_id = event.slot_id.clone();
                        let _render = page.on_slot_render_ended(event);
                        if filled {
                            page.on_slot_onload(&slot_id);
                        }
                    }
                    AdEvent::Viewable(slot_id) => {
                        let page = page.clone();
                        tokio::task::spawn_local(async move {
                            tokio::time::sleep(viewable_after).await;
                            match page.on_impression_viewable(&slot_id).await {
                                Ok(outcome) => {
                                    log::info!("Sim: '{}' viewable -> {:?}", slot_id, outcome)
                                }
                                Err(e) => log::error!("Sim: viewable task failed: {}", e),
                            }
                        });
                    }
                }
            }
        })
    };

    if let Some((from, until)) = cfg.page.hidden_window {
        let page = page.clone();
        tokio::task::spawn_local(async move {
            tokio::time::sleep(Duration::from_secs(from)).await;
            page.set_document_hidden(true);
            tokio::time::sleep(Duration::from_secs(until.saturating_sub(from))).await;
            page.set_document_hidden(false);
        });
    }

    let placeholders = &cfg.page.placeholders;
    let nodes = place_slots(&doc, placeholders)?;
    let batch: Vec<_> = nodes
        .iter()
        .zip(placeholders)
        .map(|(node, p)| (*node, p.extra_sizes.as_ref()))
        .collect();
    let outcomes = page.load_slots_with(&batch)?;
    for (name, outcome) in placeholders.iter().map(|p| &p.name).zip(outcomes) {
        match outcome {
            LoadOutcome::Blocked => log::info!("Sim: '{}' blocked", name),
            LoadOutcome::Loading(rendered) => {
                let name = name.clone();
                tokio::task::spawn_local(async move {
                    log::info!("Sim: '{}' rendered: {}", name, rendered.await);
                });
            }
        }
    }

    tokio::time::sleep(Duration::from_secs(cfg.run_secs)).await;
    driver.abort();

    let registry = page.registry();
    let registry = registry.borrow();
    log::info!("Sim: {} slot(s) registered after {}s", registry.len(), cfg.run_secs);
    for id in registry.ids() {
        if let Some(slot) = registry.get(&id) {
            log::info!(
                "Sim: '{}' phase={:?} size={} refreshes={}",
                id,
                slot.phase(),
                slot.negotiated_size()
                    .map_or_else(|| "-".to_string(), |s| s.to_string()),
                slot.refresh_count()
            );
        }
    }
    Ok(())
}
