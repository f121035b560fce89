//! Fairwager - Provably Fair Randomness and Treasury Settlement
//!
//! Commits to a secret seed before asking an external randomness provider
//! for a value, verifies every fulfillment against that commitment, and
//! settles stakes, payouts and refunds on an append-only custodial ledger.
//!
//! The chain-facing collaborators sit behind traits in [`chain`]; the
//! in-memory implementation drives tests and `--simulate` mode.

pub mod api;
pub mod chain;
pub mod commitment;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod factory;
pub mod metrics;
pub mod resolver;
pub mod retry;
pub mod store;
pub mod subscription;
pub mod tracker;
pub mod treasury;
pub mod types;
pub mod workers;

pub use config::{ConfigLoader, WagerConfig};
pub use coordinator::{FrontEndResult, GameRequest, GameTicket, SettlementCoordinator};
pub use errors::{ErrorClass, WagerError, WagerResult};
pub use factory::{Engine, EngineFactory};
pub use types::{Address, Amount, RandomnessRequest, RequestId, RequestState, TreasuryEntry};
