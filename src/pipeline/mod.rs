//! Relay processing pipeline.
//!
//! Every fetched message flows through:
//! 1. `MessageSource::fetch_new()`: source-specific I/O
//! 2. `IdempotencyLedger`: claim + processed check
//! 3. `RuleMatcher::resolve()`: subject key → rule
//! 4. `ForwardDispatcher::forward()`: bounded retry against the sink
//! 5. Audit entry + processed mark

pub mod dispatcher;
pub mod ledger;
pub mod matcher;
pub mod metrics;
pub mod runner;
pub mod types;

pub use dispatcher::{ForwardDispatcher, Sleeper, TokioSleeper};
pub use ledger::{DispatchClaim, IdempotencyLedger};
pub use matcher::{RuleMatcher, extract_key};
pub use metrics::{MetricsSnapshot, RelayMetrics};
pub use runner::CycleRunner;
pub use types::{Attachment, CycleSummary, Message, MessageSink, MessageSource};
