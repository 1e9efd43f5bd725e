//! Transaction factories and the retry driver.
//!
//! A [`TransactionFactory`] starts transactions of one family with a fixed
//! configuration. [`TransactionFactory::atomically`] runs a closure until it
//! commits:
//!
//! - read/write conflicts and `retry` back off and run the closure again
//! - speculative failures relax the family and run again right away
//! - every other error aborts and is returned to the caller
//!
//! After `max_retries` attempts the driver gives up with `TooManyRetries`.

use crate::speculative::{SpeculativeConfiguration, SpeculativeShape};
use crate::stm::StmShared;
use crate::transaction::Transaction;
use std::fmt;
use std::sync::Arc;
use tessera_concurrency::{BackoffPolicy, ExponentialBackoff};
use tessera_core::{Result, StmError, TransactionConfig};
use tracing::{debug, trace, warn};

/// Starts transactions of one family.
#[derive(Clone)]
pub struct TransactionFactory {
    stm: Arc<StmShared>,
    config: Arc<TransactionConfig>,
    family: Arc<str>,
    speculative: Arc<SpeculativeConfiguration>,
    backoff: Arc<dyn BackoffPolicy>,
}

impl TransactionFactory {
    pub(crate) fn new(
        stm: Arc<StmShared>,
        config: Arc<TransactionConfig>,
        family: Arc<str>,
        speculative: Arc<SpeculativeConfiguration>,
    ) -> Self {
        let backoff = Arc::new(ExponentialBackoff::from(&config.backoff));
        TransactionFactory {
            stm,
            config,
            family,
            speculative,
            backoff,
        }
    }

    /// Replace the backoff used between conflicting attempts.
    pub fn with_backoff<B: BackoffPolicy + 'static>(mut self, backoff: B) -> Self {
        self.backoff = Arc::new(backoff);
        self
    }

    /// Configuration of every transaction this factory starts.
    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    /// Family name.
    pub fn family_name(&self) -> &str {
        &self.family
    }

    /// Current speculative shape of the family.
    pub fn speculative_shape(&self) -> SpeculativeShape {
        self.speculative.shape()
    }

    /// Start a transaction for a caller-managed lifecycle.
    pub fn new_transaction(&self) -> Transaction {
        self.start(1)
    }

    fn start(&self, attempt: u32) -> Transaction {
        let speculative = self
            .config
            .speculative_config_enabled
            .then(|| Arc::clone(&self.speculative));
        Transaction::new(
            Arc::clone(&self.stm),
            Arc::clone(&self.config),
            Arc::clone(&self.family),
            speculative,
            attempt,
        )
    }

    /// Run `f` in a fresh transaction per attempt until one commits.
    ///
    /// `f` may run several times and must not have side effects outside the
    /// transaction. A `Retry` returned by [`Transaction::retry`] re-runs `f`
    /// after a backoff.
    pub fn atomically<R, F>(&self, mut f: F) -> Result<R>
    where
        F: FnMut(&mut Transaction) -> Result<R>,
    {
        let max_attempts = self.config.max_retries;
        for attempt in 1..=max_attempts {
            let mut tx = self.start(attempt);
            let outcome = f(&mut tx).and_then(|value| tx.commit().map(|_| value));
            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            tx.abort_if_alive();

            match err {
                StmError::ReadWriteConflict { reason } => {
                    debug!(family = %self.family, attempt, %reason, "conflict, retrying");
                    self.backoff.delay(attempt);
                }
                // the failed transaction already relaxed the family
                StmError::SpeculativeConfiguration(failure) => {
                    trace!(family = %self.family, attempt, %failure, "speculative failure, retrying");
                }
                StmError::Retry => {
                    trace!(family = %self.family, attempt, "retry requested");
                    self.backoff.delay(attempt);
                }
                other => return Err(other),
            }
        }

        warn!(family = %self.family, attempts = max_attempts, "transaction gave up");
        Err(StmError::TooManyRetries {
            family: self.family.to_string(),
            attempts: max_attempts,
        })
    }
}

impl fmt::Debug for TransactionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionFactory")
            .field("family", &self.family)
            .field("shape", &self.speculative.shape())
            .field("config", &self.config)
            .finish()
    }
}
