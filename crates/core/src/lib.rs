pub mod cache;
pub mod clock;
pub mod config;
pub mod domain;
pub mod errors;
pub mod guards;
pub mod metrics;
pub mod pricing;
pub mod resume;
pub mod signing;

pub use cache::{CacheEntryInfo, TtlCache};
pub use clock::{system_clock, Clock, ManualClock, SystemClock};
pub use config::{ConfigError, GatewayConfig, LoadOptions};
pub use domain::request::{Limits, PhaseTimeouts, RequestEnvelope, ValidationError};
pub use domain::response::{
    AttemptRecord, AttemptStatus, BreakerState, ResponseBuilder, ResponseEnvelope, ResponseStatus,
    ToolExecutionSummary, ToolKind, Usage,
};
pub use errors::{ApplicationError, ErrorCode, GuardErrorPayload, InterfaceError};
pub use guards::{
    BudgetHitHook, CostGuard, CostGuardError, GuardContext, IdempotencyCache, Phase, Reuse,
    TimeGuard, TimeGuardError,
};
pub use metrics::{MetricsRegistry, MetricsSnapshot, Summary};
pub use pricing::{naive_token_estimate, ModelPrice, PriceTable, DEFAULT_MODEL};
