//! Connect, attempt, classify, retry.
//!
//! Shared by every connected device operation. A failure whose text
//! matches a transient pattern (the device reporting it is busy) is retried
//! on the same link after an exponential backoff; any other failure drops
//! the link so the next attempt reconnects.

use std::fmt::Display;
use std::time::Duration;

use prometheus::Counter;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::RetryConfig;
use crate::transport::{OpGuard, Transport, TransportError};

/// How a failed attempt is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Device busy; keep the link and back off.
    Transient,
    /// Anything else; invalidate the link.
    Fatal,
}

/// Exhausted-retry outcome, tagged by the kind of the last failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RetryError {
    #[error("{last}")]
    Transient { attempts: u32, last: String },

    #[error("{last}")]
    Fatal { attempts: u32, last: String },

    #[error("Base station not connected: {last}")]
    NotConnected { attempts: u32, last: String },
}

impl RetryError {
    /// Whether retrying later may succeed without intervention.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Transient { attempts, .. }
            | Self::Fatal { attempts, .. }
            | Self::NotConnected { attempts, .. } => *attempts,
        }
    }
}

/// Collaborators for one retried operation.
pub trait ConnectedOps: Send {
    type Output: Send;
    type Error: Display + Send;

    /// Make sure the link is usable.
    fn connect(&mut self) -> impl std::future::Future<Output = Result<(), Self::Error>> + Send;

    /// Whether the link is marked connected after `connect`.
    fn is_connected(&self) -> bool;

    /// Run the operation once.
    fn attempt(
        &mut self,
    ) -> impl std::future::Future<Output = Result<Self::Output, Self::Error>> + Send;

    /// Drop the link so the next attempt reconnects.
    fn invalidate(&mut self);

    /// Explicit classification. `None` defers to the policy's text patterns.
    fn classify(&self, _err: &Self::Error) -> Option<FailureClass> {
        None
    }
}

/// Retry schedule and transient-error patterns.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub settle_delay: Duration,
    pub transient_patterns: Vec<String>,
    transient_retries: Option<Counter>,
}

impl RetryPolicy {
    pub fn from_config(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts,
            backoff_base: cfg.backoff_base,
            backoff_cap: cfg.backoff_cap,
            settle_delay: cfg.settle_delay,
            transient_patterns: cfg.transient_patterns.clone(),
            transient_retries: None,
        }
    }

    /// Count transient failures on `counter`.
    pub fn with_transient_counter(mut self, counter: Counter) -> Self {
        self.transient_retries = Some(counter);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_transient_patterns(mut self, patterns: Vec<String>) -> Self {
        self.transient_patterns = patterns;
        self
    }

    /// Classifies an error by its text.
    pub fn classify(&self, message: &str) -> FailureClass {
        if self
            .transient_patterns
            .iter()
            .any(|p| !p.is_empty() && message.contains(p.as_str()))
        {
            FailureClass::Transient
        } else {
            FailureClass::Fatal
        }
    }

    /// Backoff before `attempt` after a transient failure:
    /// `min(cap, base * 2^(attempt-1))`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.backoff_base
            .checked_mul(1u32 << exp)
            .map_or(self.backoff_cap, |d| d.min(self.backoff_cap))
    }

    /// Runs `ops` until it succeeds or attempts are exhausted.
    pub async fn run<C: ConnectedOps>(
        &self,
        label: &str,
        ops: &mut C,
    ) -> Result<C::Output, RetryError> {
        let max = self.max_attempts.max(1);
        let mut last: Option<RetryError> = None;
        let mut last_transient = false;

        for attempt in 1..=max {
            if attempt > 1 {
                info!(op = label, "retry {attempt}/{max}");
            }

            if last_transient {
                tokio::time::sleep(self.backoff_for(attempt)).await;
            }

            let connected = match ops.connect().await {
                Ok(()) if ops.is_connected() => Ok(()),
                Ok(()) => Err("link not marked connected".to_string()),
                Err(e) => Err(e.to_string()),
            };
            if let Err(msg) = connected {
                warn!(op = label, attempt, error = %msg, "base station not connected");
                last = Some(RetryError::NotConnected {
                    attempts: attempt,
                    last: msg,
                });
                tokio::time::sleep(self.settle_delay).await;
                continue;
            }

            match ops.attempt().await {
                Ok(out) => return Ok(out),
                Err(e) => {
                    let msg = e.to_string();
                    let class = ops.classify(&e).unwrap_or_else(|| self.classify(&msg));
                    warn!(op = label, attempt, error = %msg, ?class, "operation failed");

                    last_transient = class == FailureClass::Transient;
                    last = Some(if last_transient {
                        if let Some(c) = &self.transient_retries {
                            c.inc();
                        }
                        RetryError::Transient {
                            attempts: attempt,
                            last: msg,
                        }
                    } else {
                        ops.invalidate();
                        RetryError::Fatal {
                            attempts: attempt,
                            last: msg,
                        }
                    });

                    tokio::time::sleep(self.settle_delay).await;
                }
            }
        }

        Err(last.unwrap_or(RetryError::Fatal {
            attempts: max,
            last: "operation failed".to_string(),
        }))
    }
}

/// One device operation run on the locked link.
pub trait LinkOperation<T: Transport>: Send {
    type Output: Send;

    fn run(
        &mut self,
        transport: &mut T,
    ) -> impl std::future::Future<Output = Result<Self::Output, TransportError>> + Send;
}

/// [`ConnectedOps`] over a held operation lock.
pub struct LinkOps<'a, T: Transport, Op> {
    guard: OpGuard<'a, T>,
    op: Op,
}

impl<'a, T: Transport, Op: LinkOperation<T>> LinkOps<'a, T, Op> {
    pub fn new(guard: OpGuard<'a, T>, op: Op) -> Self {
        Self { guard, op }
    }

    /// Release the lock and hand back the operation.
    pub fn into_inner(self) -> Op {
        self.op
    }
}

impl<T: Transport, Op: LinkOperation<T>> ConnectedOps for LinkOps<'_, T, Op> {
    type Output = Op::Output;
    type Error = TransportError;

    async fn connect(&mut self) -> Result<(), TransportError> {
        self.guard.ensure_connected().await.map(|_| ())
    }

    fn is_connected(&self) -> bool {
        self.guard.is_connected()
    }

    async fn attempt(&mut self) -> Result<Op::Output, TransportError> {
        self.op.run(self.guard.transport_mut()).await
    }

    fn invalidate(&mut self) {
        self.guard.mark_disconnected();
    }
}
