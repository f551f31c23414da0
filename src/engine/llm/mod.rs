// Horadus — LLM Invocation Stack
//
// Module layout:
//   safety    — token estimation, truncation, untrusted-content wrapping
//   pricing   — per-model USD pricing with prefix matching
//   provider  — ChatBackend trait + OpenAI-compatible HTTP client
//               (chat-completions and responses API shapes)
//   failover  — per-route retries with jittered backoff + secondary failover
//   policy    — budget check + strict-schema fallback + usage accounting

pub mod failover;
pub mod policy;
pub mod pricing;
pub mod provider;
pub mod safety;
