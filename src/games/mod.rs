//! Game rules: seed commitments, outcome generation and payout computation

pub mod outcome;
pub mod payout;
pub mod types;
pub mod vrf_engine;

pub use outcome::{resolve, CrashParams};
pub use payout::{compute_payouts, refund_plan, FeeSchedule};
pub use types::*;
pub use vrf_engine::{verify_reveal, HashChainSeedSource, SeedSource, VrfSeedSource};
