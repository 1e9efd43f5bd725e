//! Transaction and STM configuration.
//!
//! Configurations are plain serde structs so they can be embedded in a host
//! application's config file. [`StmConfig::from_toml_str`] parses the TOML
//! form:
//!
//! ```toml
//! [transaction]
//! automatic_read_tracking = true
//! prevent_write_skew = true
//! max_retries = 50
//!
//! [transaction.backoff]
//! max_delay_us = 500
//! ```

use crate::error::{Result, StmError};
use crate::types::LockMode;
use serde::{Deserialize, Serialize};

/// Default number of spins before giving up on a locked orec.
pub const DEFAULT_SPIN_COUNT: u32 = 16;

/// Default maximum number of attempts made by the retry driver.
pub const DEFAULT_MAX_RETRIES: u32 = 1000;

/// Default size of the largest speculative fixed-capacity transaction.
pub const DEFAULT_MAX_FIXED_LENGTH_SIZE: usize = 20;

/// Default longest poor man's conflict scan before read tracking is required.
pub const DEFAULT_MAX_POOR_MANS_SCAN_LENGTH: usize = 20;

// ============================================================================
// PessimisticLockLevel
// ============================================================================

/// Locks taken up front when refs are opened, instead of at prepare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PessimisticLockLevel {
    /// Fully optimistic
    #[default]
    LockNone,
    /// Read-lock every ref that is read or written
    ReadLockReads,
    /// Write-lock every ref opened for write
    WriteLockWrites,
    /// Write-lock every ref that is read or written
    WriteLockReads,
    /// Commit-lock every ref opened for write
    CommitLockWrites,
    /// Commit-lock every ref that is read or written
    CommitLockReads,
}

impl PessimisticLockLevel {
    /// Minimum lock mode for a ref opened for read.
    pub fn read_lock_mode(self) -> LockMode {
        match self {
            PessimisticLockLevel::LockNone
            | PessimisticLockLevel::WriteLockWrites
            | PessimisticLockLevel::CommitLockWrites => LockMode::None,
            PessimisticLockLevel::ReadLockReads => LockMode::Read,
            PessimisticLockLevel::WriteLockReads => LockMode::Write,
            PessimisticLockLevel::CommitLockReads => LockMode::Commit,
        }
    }

    /// Minimum lock mode for a ref opened for write.
    pub fn write_lock_mode(self) -> LockMode {
        match self {
            PessimisticLockLevel::LockNone => LockMode::None,
            PessimisticLockLevel::ReadLockReads => LockMode::Read,
            PessimisticLockLevel::WriteLockWrites | PessimisticLockLevel::WriteLockReads => {
                LockMode::Write
            }
            PessimisticLockLevel::CommitLockWrites | PessimisticLockLevel::CommitLockReads => {
                LockMode::Commit
            }
        }
    }
}

// ============================================================================
// BackoffConfig
// ============================================================================

/// Parameters of the exponential backoff used between retry attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Attempts that only yield the thread before sleeping starts
    pub yield_attempts: u32,
    /// First sleep, in microseconds
    pub min_delay_us: u64,
    /// Upper bound for a single sleep, in microseconds
    pub max_delay_us: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            yield_attempts: 4,
            min_delay_us: 1,
            max_delay_us: 1_000,
        }
    }
}

// ============================================================================
// TransactionConfig
// ============================================================================

/// Per-family transaction configuration.
///
/// Built with the `with_*` methods:
///
/// ```ignore
/// let config = TransactionConfig::default()
///     .with_family_name("transfer")
///     .with_automatic_read_tracking(true)
///     .with_prevent_write_skew(true);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// Family name; transactions of one family share speculative state
    pub family_name: Option<String>,
    /// Explicitly read-only: writes fail with `Readonly`
    pub readonly: bool,
    /// Only refs whose value actually changed are published
    pub dirty_check_enabled: bool,
    /// Plain reads arrive on the orec so updates signal conflicts
    pub automatic_read_tracking: bool,
    /// Read-lock every read at prepare (needs read tracking)
    pub prevent_write_skew: bool,
    /// Attempts the retry driver makes before giving up
    pub max_retries: u32,
    /// Whether `retry` may block the transaction
    pub blocking_allowed: bool,
    /// Locks taken eagerly on open
    pub pessimistic_lock_level: PessimisticLockLevel,
    /// Spins on a locked orec before a conflict is reported
    pub spin_count: u32,
    /// Start transactions in the family's speculative (cheapest) shape
    pub speculative_config_enabled: bool,
    /// Largest speculative fixed-capacity size before going unbounded
    pub max_fixed_length_size: usize,
    /// Longest poor man's conflict scan before read tracking is required
    pub max_poor_mans_conflict_scan_length: usize,
    /// Backoff between retry attempts
    pub backoff: BackoffConfig,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        TransactionConfig {
            family_name: None,
            readonly: false,
            dirty_check_enabled: true,
            automatic_read_tracking: false,
            prevent_write_skew: false,
            max_retries: DEFAULT_MAX_RETRIES,
            blocking_allowed: true,
            pessimistic_lock_level: PessimisticLockLevel::LockNone,
            spin_count: DEFAULT_SPIN_COUNT,
            speculative_config_enabled: true,
            max_fixed_length_size: DEFAULT_MAX_FIXED_LENGTH_SIZE,
            max_poor_mans_conflict_scan_length: DEFAULT_MAX_POOR_MANS_SCAN_LENGTH,
            backoff: BackoffConfig::default(),
        }
    }
}

impl TransactionConfig {
    /// Set the family name.
    pub fn with_family_name(mut self, name: impl Into<String>) -> Self {
        self.family_name = Some(name.into());
        self
    }

    /// Mark transactions as explicitly read-only.
    pub fn with_readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    /// Enable or disable the dirty check.
    pub fn with_dirty_check(mut self, enabled: bool) -> Self {
        self.dirty_check_enabled = enabled;
        self
    }

    /// Enable or disable automatic read tracking.
    pub fn with_automatic_read_tracking(mut self, enabled: bool) -> Self {
        self.automatic_read_tracking = enabled;
        self
    }

    /// Enable or disable write-skew prevention.
    pub fn with_prevent_write_skew(mut self, enabled: bool) -> Self {
        self.prevent_write_skew = enabled;
        self
    }

    /// Set the maximum number of attempts.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Allow or forbid blocking `retry`.
    pub fn with_blocking_allowed(mut self, allowed: bool) -> Self {
        self.blocking_allowed = allowed;
        self
    }

    /// Set the pessimistic lock level.
    pub fn with_pessimistic_lock_level(mut self, level: PessimisticLockLevel) -> Self {
        self.pessimistic_lock_level = level;
        self
    }

    /// Set the spin count.
    pub fn with_spin_count(mut self, spin_count: u32) -> Self {
        self.spin_count = spin_count;
        self
    }

    /// Enable or disable speculative configuration.
    pub fn with_speculative_config(mut self, enabled: bool) -> Self {
        self.speculative_config_enabled = enabled;
        self
    }

    /// Set the largest fixed-capacity speculative size.
    pub fn with_max_fixed_length_size(mut self, size: usize) -> Self {
        self.max_fixed_length_size = size;
        self
    }

    /// Set the poor man's conflict scan limit.
    pub fn with_max_poor_mans_conflict_scan_length(mut self, length: usize) -> Self {
        self.max_poor_mans_conflict_scan_length = length;
        self
    }

    /// Set the backoff parameters.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Minimum lock mode for reads under this configuration.
    #[inline]
    pub fn read_lock_mode(&self) -> LockMode {
        self.pessimistic_lock_level.read_lock_mode()
    }

    /// Minimum lock mode for writes under this configuration.
    #[inline]
    pub fn write_lock_mode(&self) -> LockMode {
        self.pessimistic_lock_level.write_lock_mode()
    }

    /// Whether reads are locked at prepare to rule out write skew.
    #[inline]
    pub fn write_skew_check_enabled(&self) -> bool {
        self.prevent_write_skew && self.automatic_read_tracking
    }

    /// Reject configurations that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(StmError::InvalidConfig("max_retries must be at least 1".into()));
        }
        if self.max_fixed_length_size == 0 {
            return Err(StmError::InvalidConfig(
                "max_fixed_length_size must be at least 1".into(),
            ));
        }
        if self.max_fixed_length_size > u32::MAX as usize / 2 {
            return Err(StmError::InvalidConfig(format!(
                "max_fixed_length_size {} is too large",
                self.max_fixed_length_size
            )));
        }
        if self.backoff.min_delay_us > self.backoff.max_delay_us {
            return Err(StmError::InvalidConfig(format!(
                "backoff min_delay_us ({}) exceeds max_delay_us ({})",
                self.backoff.min_delay_us, self.backoff.max_delay_us
            )));
        }
        if self.prevent_write_skew && !self.automatic_read_tracking {
            return Err(StmError::InvalidConfig(
                "prevent_write_skew requires automatic_read_tracking".into(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// StmConfig
// ============================================================================

/// Configuration of an STM instance.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StmConfig {
    /// Defaults for transactions started without an explicit configuration
    pub transaction: TransactionConfig,
}

impl StmConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: StmConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the embedded transaction defaults.
    pub fn validate(&self) -> Result<()> {
        self.transaction.validate()
    }
}
