//! Speculative configuration shared by a transaction family.
//!
//! Every family starts optimistic: read-only, no read tracking and room for a
//! single tranlocal. When an attempt breaks one of these assumptions it fails
//! with a `SpeculativeConfiguration` error and the family is relaxed, so later
//! attempts (and later transactions of the same family) start with the shape
//! that actually works. Relaxation is monotonic; a family never becomes more
//! optimistic again.
//!
//! The shape is packed into one `AtomicU64` so it can be read without locking:
//!
//! ```text
//! bits 0-31   optimal size (u32::MAX = unbounded)
//! bit  32     read-only
//! bit  33     automatic read tracking
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tessera_core::SpeculativeFailure;
use tracing::info;

/// Size of a family whose transactions may grow without limit.
pub const UNBOUNDED: u32 = u32::MAX;

const SIZE_MASK: u64 = 0xFFFF_FFFF;
const READONLY_BIT: u64 = 1 << 32;
const TRACKING_BIT: u64 = 1 << 33;

/// Decoded speculative shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeculativeShape {
    /// Tranlocal capacity a transaction starts with
    pub optimal_size: u32,
    /// Whether transactions are assumed not to write
    pub is_readonly: bool,
    /// Whether reads arrive on orecs
    pub is_automatic_read_tracking: bool,
}

impl SpeculativeShape {
    /// The most optimistic shape.
    pub const INITIAL: SpeculativeShape = SpeculativeShape {
        optimal_size: 1,
        is_readonly: true,
        is_automatic_read_tracking: false,
    };

    fn pack(self) -> u64 {
        let mut word = self.optimal_size as u64;
        if self.is_readonly {
            word |= READONLY_BIT;
        }
        if self.is_automatic_read_tracking {
            word |= TRACKING_BIT;
        }
        word
    }

    fn unpack(word: u64) -> Self {
        SpeculativeShape {
            optimal_size: (word & SIZE_MASK) as u32,
            is_readonly: word & READONLY_BIT != 0,
            is_automatic_read_tracking: word & TRACKING_BIT != 0,
        }
    }

    /// Shape after learning from `failure`.
    pub fn relaxed(self, failure: SpeculativeFailure) -> Self {
        let mut next = self;
        match failure {
            SpeculativeFailure::ReadonlyViolated => next.is_readonly = false,
            SpeculativeFailure::TransactionTooSmall { required } => {
                next.optimal_size = self.optimal_size.max(required);
            }
            SpeculativeFailure::ReadTrackingRequired => next.is_automatic_read_tracking = true,
        }
        next
    }
}

impl Default for SpeculativeShape {
    fn default() -> Self {
        SpeculativeShape::INITIAL
    }
}

impl fmt::Display for SpeculativeShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.optimal_size == UNBOUNDED {
            write!(f, "size=unbounded")?;
        } else {
            write!(f, "size={}", self.optimal_size)?;
        }
        write!(
            f,
            " readonly={} tracking={}",
            self.is_readonly, self.is_automatic_read_tracking
        )
    }
}

/// Lock-free speculative shape of one transaction family.
pub struct SpeculativeConfiguration {
    family: String,
    word: AtomicU64,
}

impl SpeculativeConfiguration {
    /// Fresh, fully optimistic configuration for `family`.
    pub fn new(family: impl Into<String>) -> Self {
        SpeculativeConfiguration::with_shape(family, SpeculativeShape::INITIAL)
    }

    /// Configuration starting from `shape`.
    pub fn with_shape(family: impl Into<String>, shape: SpeculativeShape) -> Self {
        SpeculativeConfiguration {
            family: family.into(),
            word: AtomicU64::new(shape.pack()),
        }
    }

    /// Family name.
    pub fn family(&self) -> &str {
        &self.family
    }

    /// Current shape.
    #[inline]
    pub fn shape(&self) -> SpeculativeShape {
        SpeculativeShape::unpack(self.word.load(Ordering::Acquire))
    }

    /// Relax the shape after `failure`.
    ///
    /// Returns true if this call changed the shape; false if another thread
    /// already relaxed it at least as far.
    pub fn relax(&self, failure: SpeculativeFailure) -> bool {
        let mut current = self.word.load(Ordering::Acquire);
        loop {
            let shape = SpeculativeShape::unpack(current);
            let next = shape.relaxed(failure);
            if next == shape {
                return false;
            }
            match self.word.compare_exchange_weak(
                current,
                next.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    info!(family = %self.family, %failure, from = %shape, to = %next, "speculative configuration relaxed");
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }
}

impl fmt::Debug for SpeculativeConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpeculativeConfiguration")
            .field("family", &self.family)
            .field("shape", &self.shape())
            .finish()
    }
}
