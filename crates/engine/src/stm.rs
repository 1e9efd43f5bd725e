//! The STM instance.
//!
//! An [`Stm`] owns everything refs and transactions share: the global
//! conflict counter, the commit clock, ref ids, the default configuration,
//! the registry of speculative family configurations and metrics counters.
//! Cloning an `Stm` is cheap; clones share the same state.
//!
//! # Example
//!
//! ```ignore
//! let stm = Stm::new();
//! let from = stm.new_ref(100);
//! let to = stm.new_ref(0);
//!
//! stm.atomically(|tx| {
//!     from.alter(tx, |v| v - 10)?;
//!     to.alter(tx, |v| v + 10)?;
//!     Ok(())
//! })?;
//! ```

use crate::factory::TransactionFactory;
use crate::reference::{Ref, TxValue};
use crate::speculative::{SpeculativeConfiguration, SpeculativeShape};
use crate::transaction::Transaction;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tessera_concurrency::{GlobalConflictCounter, TransactionManager};
use tessera_core::{RefId, Result, StmConfig, TransactionConfig};
use tracing::{debug, info};

/// Family used by [`Stm::begin`] and [`Stm::atomically`].
pub const DEFAULT_FAMILY: &str = "default";

// ============================================================================
// Metrics
// ============================================================================

/// Lock-free counters updated by transactions and atomic ref operations.
#[derive(Debug, Default)]
pub(crate) struct MetricsRecorder {
    started: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
    conflicts: AtomicU64,
    speculative_failures: AtomicU64,
}

impl MetricsRecorder {
    #[inline]
    pub(crate) fn record_start(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_commit(&self) {
        self.committed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_abort(&self) {
        self.aborted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_speculative_failure(&self) {
        self.speculative_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> StmMetrics {
        let committed = self.committed.load(Ordering::Relaxed);
        let aborted = self.aborted.load(Ordering::Relaxed);
        let finished = committed + aborted;
        StmMetrics {
            transactions_started: self.started.load(Ordering::Relaxed),
            transactions_committed: committed,
            transactions_aborted: aborted,
            conflicts: self.conflicts.load(Ordering::Relaxed),
            speculative_failures: self.speculative_failures.load(Ordering::Relaxed),
            commit_rate: if finished == 0 {
                0.0
            } else {
                committed as f64 / finished as f64
            },
        }
    }
}

/// STM metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct StmMetrics {
    /// Transactions started
    pub transactions_started: u64,
    /// Transactions committed, plus atomic ref updates
    pub transactions_committed: u64,
    /// Transactions aborted, for any reason
    pub transactions_aborted: u64,
    /// Read/write conflicts detected
    pub conflicts: u64,
    /// Attempts that broke their family's speculative assumptions
    pub speculative_failures: u64,
    /// Commit success rate (0.0 - 1.0)
    pub commit_rate: f64,
}

// ============================================================================
// Shared state
// ============================================================================

pub(crate) struct StmShared {
    conflict_counter: GlobalConflictCounter,
    manager: TransactionManager,
    next_ref_id: AtomicU64,
    next_anonymous_family: AtomicU64,
    config: StmConfig,
    default_config: Arc<TransactionConfig>,
    default_family: Arc<str>,
    families: DashMap<String, Arc<SpeculativeConfiguration>>,
    metrics: MetricsRecorder,
}

impl StmShared {
    fn new(config: StmConfig) -> Self {
        StmShared {
            conflict_counter: GlobalConflictCounter::new(),
            manager: TransactionManager::default(),
            next_ref_id: AtomicU64::new(1),
            next_anonymous_family: AtomicU64::new(1),
            default_config: Arc::new(config.transaction.clone()),
            default_family: Arc::from(DEFAULT_FAMILY),
            config,
            families: DashMap::new(),
            metrics: MetricsRecorder::default(),
        }
    }

    #[inline]
    pub(crate) fn next_ref_id(&self) -> RefId {
        RefId(self.next_ref_id.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub(crate) fn config(&self) -> &StmConfig {
        &self.config
    }

    #[inline]
    pub(crate) fn manager(&self) -> &TransactionManager {
        &self.manager
    }

    #[inline]
    pub(crate) fn conflict_counter(&self) -> &GlobalConflictCounter {
        &self.conflict_counter
    }

    #[inline]
    pub(crate) fn metrics(&self) -> &MetricsRecorder {
        &self.metrics
    }

    /// Speculative configuration of `family`, created on first use.
    fn family(&self, family: &str) -> Arc<SpeculativeConfiguration> {
        if let Some(existing) = self.families.get(family) {
            return Arc::clone(existing.value());
        }
        let entry = self.families.entry(family.to_string()).or_insert_with(|| {
            debug!(family, "registered transaction family");
            Arc::new(SpeculativeConfiguration::new(family))
        });
        Arc::clone(entry.value())
    }

    fn anonymous_family_name(&self) -> String {
        let n = self.next_anonymous_family.fetch_add(1, Ordering::Relaxed);
        format!("anonymous-{}", n)
    }
}

// ============================================================================
// Stm
// ============================================================================

/// Software transactional memory instance.
#[derive(Clone)]
pub struct Stm {
    shared: Arc<StmShared>,
    default_factory: TransactionFactory,
}

impl Stm {
    /// Create an STM with the default configuration.
    pub fn new() -> Self {
        Stm::from_validated(StmConfig::default())
    }

    /// Create an STM with `config`.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if the configuration is inconsistent.
    pub fn with_config(config: StmConfig) -> Result<Self> {
        config.validate()?;
        Ok(Stm::from_validated(config))
    }

    /// Start building an STM.
    pub fn builder() -> StmBuilder {
        StmBuilder::new()
    }

    fn from_validated(config: StmConfig) -> Self {
        let shared = Arc::new(StmShared::new(config));
        let family = Arc::clone(&shared.default_family);
        let speculative = shared.family(&family);
        let default_factory = TransactionFactory::new(
            Arc::clone(&shared),
            Arc::clone(&shared.default_config),
            family,
            speculative,
        );
        info!(
            spin_count = shared.config.transaction.spin_count,
            max_retries = shared.config.transaction.max_retries,
            lock_level = ?shared.config.transaction.pessimistic_lock_level,
            "stm created"
        );
        Stm {
            shared,
            default_factory,
        }
    }

    pub(crate) fn shared(&self) -> &Arc<StmShared> {
        &self.shared
    }

    /// STM-wide configuration.
    pub fn config(&self) -> &StmConfig {
        &self.shared.config
    }

    // ------------------------------------------------------------------------
    // Refs
    // ------------------------------------------------------------------------

    /// Create a committed ref. Writes of an equal value are not published.
    pub fn new_ref<T: TxValue + PartialEq>(&self, value: T) -> Ref<T> {
        Ref::new(self, value)
    }

    /// Create a committed ref for a value type without equality.
    pub fn new_ref_unchecked<T: TxValue>(&self, value: T) -> Ref<T> {
        Ref::new_unchecked(self, value)
    }

    // ------------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------------

    /// Start a transaction with the default configuration.
    ///
    /// Transactions started here are not speculative: they start with
    /// unbounded capacity and never fail with `SpeculativeConfiguration`.
    pub fn begin(&self) -> Transaction {
        Transaction::new(
            Arc::clone(&self.shared),
            Arc::clone(&self.shared.default_config),
            Arc::clone(&self.shared.default_family),
            None,
            1,
        )
    }

    /// Start a non-speculative transaction with `config`.
    pub fn begin_with(&self, config: TransactionConfig) -> Result<Transaction> {
        config.validate()?;
        let family: Arc<str> = match &config.family_name {
            Some(name) => Arc::from(name.as_str()),
            None => Arc::clone(&self.shared.default_family),
        };
        Ok(Transaction::new(
            Arc::clone(&self.shared),
            Arc::new(config),
            family,
            None,
            1,
        ))
    }

    /// Create a factory for a transaction family.
    ///
    /// Factories with the same `family_name` share one speculative
    /// configuration. Without a name the factory gets a family of its own.
    pub fn transaction_factory(&self, config: TransactionConfig) -> Result<TransactionFactory> {
        config.validate()?;
        let name = match &config.family_name {
            Some(name) => name.clone(),
            None => self.shared.anonymous_family_name(),
        };
        let speculative = self.shared.family(&name);
        Ok(TransactionFactory::new(
            Arc::clone(&self.shared),
            Arc::new(config),
            Arc::from(name),
            speculative,
        ))
    }

    /// Run `f` in a transaction of the default family, retrying on conflicts.
    pub fn atomically<R, F>(&self, f: F) -> Result<R>
    where
        F: FnMut(&mut Transaction) -> Result<R>,
    {
        self.default_factory.atomically(f)
    }

    /// Factory behind [`Stm::atomically`].
    pub fn default_factory(&self) -> &TransactionFactory {
        &self.default_factory
    }

    // ------------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------------

    /// Latest commit version.
    pub fn current_version(&self) -> u64 {
        self.shared.manager.current_version()
    }

    /// Number of conflict signals raised so far.
    pub fn conflict_count(&self) -> u64 {
        self.shared.conflict_counter.count()
    }

    /// Current speculative shape of `family`, if it has been registered.
    pub fn speculative_shape(&self, family: &str) -> Option<SpeculativeShape> {
        self.shared.families.get(family).map(|c| c.shape())
    }

    /// Snapshot of the metrics counters.
    pub fn metrics(&self) -> StmMetrics {
        self.shared.metrics.snapshot()
    }
}

impl Default for Stm {
    fn default() -> Self {
        Stm::new()
    }
}

impl fmt::Debug for Stm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stm")
            .field("version", &self.current_version())
            .field("conflicts", &self.conflict_count())
            .field("families", &self.shared.families.len())
            .finish()
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for STM configuration.
///
/// # Example
///
/// ```ignore
/// let stm = Stm::builder()
///     .spin_count(64)
///     .max_retries(100)
///     .build()?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct StmBuilder {
    config: StmConfig,
}

impl StmBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        StmBuilder::default()
    }

    /// Start from a complete configuration.
    pub fn config(mut self, config: StmConfig) -> Self {
        self.config = config;
        self
    }

    /// Load the configuration from a TOML document.
    pub fn toml(self, s: &str) -> Result<Self> {
        Ok(self.config(StmConfig::from_toml_str(s)?))
    }

    /// Default configuration for transactions.
    pub fn transaction_config(mut self, config: TransactionConfig) -> Self {
        self.config.transaction = config;
        self
    }

    /// Spins on a locked orec before giving up.
    pub fn spin_count(mut self, spin_count: u32) -> Self {
        self.config.transaction.spin_count = spin_count;
        self
    }

    /// Attempts made by `atomically` before failing with `TooManyRetries`.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.config.transaction.max_retries = max_retries;
        self
    }

    /// Whether transactions track reads by default.
    pub fn automatic_read_tracking(mut self, enabled: bool) -> Self {
        self.config.transaction.automatic_read_tracking = enabled;
        self
    }

    /// Whether the retry driver learns speculative shapes.
    pub fn speculative_config(mut self, enabled: bool) -> Self {
        self.config.transaction.speculative_config_enabled = enabled;
        self
    }

    /// Validate the configuration and create the STM.
    pub fn build(self) -> Result<Stm> {
        Stm::with_config(self.config)
    }
}
