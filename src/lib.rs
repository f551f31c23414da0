// Horadus — geopolitical intelligence engine.
//
// Ingests news and open-source feeds, filters and classifies items with
// two tiers of LLM inference, clusters items into events, and tracks
// per-trend probabilities with a log-odds engine (evidence aggregation,
// time decay, calibration).
//
// Layering:
//   atoms    — pure types, constants, and the canonical error enum
//   config   — env-first settings
//   engine   — domain services over the shared SQLite store
//   workers  — periodic scheduling + task retry/dead-letter runtime

pub mod atoms;
pub mod config;
pub mod engine;
pub mod logger;
pub mod workers;

pub use atoms::error::{EngineError, EngineResult};
pub use config::Settings;
pub use engine::context::EngineContext;
