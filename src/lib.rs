//! # Annotation Market
//!
//! Task assignment and USDC settlement engine for a crowdsourced annotation
//! marketplace.
//!
//! Researchers import projects from a labeling tool (Label Studio), fund them
//! with a budget and publish them. Annotators claim tasks, submit results and
//! get paid in USDC when the researcher approves.
//!
//! ## Task Flow
//! ```text
//!   available ──claim──▶ assigned ──▶ accepted ──▶ in_progress ──▶ submitted
//!       ▲                   │            │              │             │
//!       └────── cancel ─────┴────────────┴──────────────┘             │
//!       └────── reject ◀──────────────────────────────────────────────┤
//!                                                                     ▼
//!                                           approve ─▶ settlement ─▶ approved
//! ```
//! An assignment becomes `approved` only after its settlement transaction
//! reached `completed`.
//!
//! ## Modules
//! - `market`: the marketplace engine (lifecycle, catalog, reconciler)
//! - `settlement`: settlement processor and transfer clients
//! - `store`: storage traits with SQLite and in-memory backends
//! - `source`: labeling-tool client
//! - `audit`: append-only audit trail
//! - `api`: HTTP layer

pub mod api;
pub mod audit;
pub mod config;
pub mod error;
pub mod identity;
pub mod market;
pub mod model;
pub mod money;
pub mod settlement;
pub mod source;
pub mod store;
pub mod wallet;

pub use config::Config;
pub use error::MarketError;
pub use market::Marketplace;
