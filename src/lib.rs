mod client;
mod config;
mod debounce;
mod dedup;
mod guard;
mod handler;
mod identity;
mod server;
mod state;
#[cfg(test)]
mod test_support;

// Re-export public API
pub use client::{
    DedupClient, ResponseDeduplicator, UpstreamError, UpstreamRequest, UpstreamResponse,
};
pub use config::{DedupConfig, DedupScope, FlightdeckConfig};
pub use debounce::DebounceGuard;
pub use dedup::RequestDeduplicator;
pub use guard::{CooldownGuard, DEFAULT_DELAY, SignatureGuard};
pub use identity::{Identity, normalize_path, signature};
pub use server::{router, run_server};
pub use state::AppState;
