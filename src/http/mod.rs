//! HTTP API for local control of the link
//!
//! - GET /health - Health check
//! - GET /link/status - Connectivity, recording states and in-flight transfers
//! - POST /link/recording-state - Report a local recording state change
//! - POST /link/lifecycle - Report the host app's lifecycle phase
//! - POST /link/sync - Offer a recording on disk to the peer
//! - POST /link/sync/:recording_id/cancel - Cancel an in-flight transfer

mod handlers;
mod routes;
mod state;

pub use routes::create_router;
pub use state::AppState;
