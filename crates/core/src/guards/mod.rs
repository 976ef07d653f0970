//! Pre-flight guards: cost caps, phase deadlines and idempotent replay.

pub mod cost;
pub mod idempotency;
pub mod time;

pub use cost::{BudgetHitHook, CostGuard, CostGuardError, GuardContext};
pub use idempotency::{IdempotencyCache, Reuse};
pub use time::{Deadlines, Phase, TimeGuard, TimeGuardError};
