//! HTTP API for the annotation market.
//!
//! ## Endpoints
//!
//! - `GET /api/health` - Health check (public)
//! - `GET /api/me` - Authenticated identity
//! - `PUT /api/connection` - Connect a labeling tool
//! - `/api/projects` - Import, sync, budget and publish projects
//! - `/api/tasks` - Browse and claim tasks
//! - `/api/assignments` - Accept, start, submit, cancel, approve, reject
//! - `/api/settlements` - Payouts, retry, reconcile, refund
//! - `/api/wallet` - Payout wallet
//! - `/api/audit` - Audit trail

mod account;
mod assignments;
mod auth;
mod projects;
mod routes;
mod settlements;
mod tasks;
pub mod types;

pub use auth::issue_jwt;
pub use routes::{router, serve, AppState};
pub use types::*;
