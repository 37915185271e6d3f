//! Roundhouse - provably fair round engine
//!
//! Runs timed wagering rounds for three games: a rising multiplier that
//! crashes (`crash`), a coin flip (`flip`) and a stake-weighted pool
//! (`pool`). Each round commits to a seed when it opens, accepts bets until
//! its lock time, reveals the seed, derives the outcome and settles payouts
//! against a ledger.
//!
//! ```text
//! Scheduler ──tick──▶ RoundEngine ──▶ RoundRegistry (active + history)
//!                          │
//!              one actor task per round ──▶ LedgerAdapter ──▶ Ledger
//!                          │
//!                       EventBus ──▶ /ws subscribers
//! ```

pub mod api;
pub mod clock;
pub mod config;
pub mod engine;
pub mod errors;
pub mod events;
pub mod games;
pub mod ledger;
pub mod registry;
pub mod replay;
pub mod round;
pub mod scheduler;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigLoader, EngineConfig};
pub use engine::{EngineSettings, GameSettings, RoundEngine, RoundHandle, SettleStatus};
pub use errors::{EngineError, EngineResult, ErrorCategory};
pub use events::{EventBus, EventPayload, RoundEvent};
pub use games::{GameKind, Multiplier, Outcome, Participant, PayoutPlan, Prediction};
pub use ledger::{InMemoryLedger, Ledger, LedgerAdapter};
pub use round::{RoundPhase, RoundRules, RoundView};
pub use scheduler::Scheduler;
