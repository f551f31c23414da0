// ── Horadus Engine ─────────────────────────────────────────────────────────
// Domain services for the ingest-to-trend-update pipeline.
//
// Data flow:
//   collector → raw item (pending) → dedup → embedding → cluster (event)
//   → tier-1 relevance → tier-2 extraction → trend evidence + log-odds
//   update → snapshots / outcomes + calibration

pub mod calibration;
pub mod cluster;
pub mod collect;
pub mod context;
pub mod cost;
pub mod credibility;
pub mod dedup;
pub mod embedding;
pub mod feedback;
pub mod freshness;
pub mod lifecycle;
pub mod llm;
pub mod observability;
pub mod pipeline;
pub mod semantic_cache;
pub mod similarity;
pub mod store;
pub mod tier1;
pub mod tier2;
pub mod trend;
pub mod webhook;

#[cfg(test)]
pub(crate) mod testutil;
