//! Forward dispatcher: bounded retry around a `MessageSink`.
//!
//! Rate-limited sends back off `attempt²` seconds (1s, 4s) and retry, up to
//! three attempts in total. Any other sink error fails at once.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::ForwardError;
use crate::pipeline::types::{Message, MessageSink};

/// Total send attempts per forward.
pub const MAX_ATTEMPTS: u32 = 3;

/// Backoff before retrying after failed attempt number `attempt` (1-based).
pub fn backoff_for(attempt: u32) -> Duration {
    Duration::from_secs(u64::from(attempt) * u64::from(attempt))
}

/// Async sleep, injectable so retry tests do not wait on the clock.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Real sleeper backed by `tokio::time::sleep`.
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

pub struct ForwardDispatcher {
    sink: Arc<dyn MessageSink>,
    sleeper: Arc<dyn Sleeper>,
    max_attempts: u32,
}

impl ForwardDispatcher {
    pub fn new(sink: Arc<dyn MessageSink>) -> Self {
        Self::with_sleeper(sink, Arc::new(TokioSleeper))
    }

    pub fn with_sleeper(sink: Arc<dyn MessageSink>, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            sink,
            sleeper,
            max_attempts: MAX_ATTEMPTS,
        }
    }

    /// Deliver `message` to `target`.
    pub async fn forward(&self, message: &Message, target: &str) -> Result<(), ForwardError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.sink.send(message, target).await {
                Ok(()) => {
                    info!(message_id = %message.id, target, attempt, "Message forwarded");
                    return Ok(());
                }
                Err(e) if e.is_rate_limited() && attempt < self.max_attempts => {
                    let delay = backoff_for(attempt);
                    warn!(
                        message_id = %message.id,
                        attempt,
                        delay_secs = delay.as_secs(),
                        error = %e,
                        "Sink rate limited, backing off"
                    );
                    self.sleeper.sleep(delay).await;
                }
                Err(e) => {
                    warn!(message_id = %message.id, target, attempt, error = %e, "Forward failed");
                    return Err(ForwardError {
                        attempts: attempt,
                        last: e,
                    });
                }
            }
        }
    }
}
