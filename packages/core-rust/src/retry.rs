//! Transient-error classification.
//!
//! A strategy is a pure predicate over a [`Fault`]: `true` means a retry may
//! succeed, `false` means the fault must be surfaced as is. Strategies hold no
//! state and are shared across every dispatch.

use std::error::Error as StdError;
use std::fmt;

use crate::fault::Fault;

/// Decides whether a failed dispatch is worth another attempt.
pub trait TransientErrorDetectionStrategy: Send + Sync + 'static {
    fn is_transient(&self, fault: &Fault) -> bool;
}

/// Treats every fault as transient.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllTransient;

impl TransientErrorDetectionStrategy for AllTransient {
    fn is_transient(&self, _fault: &Fault) -> bool {
        true
    }
}

/// Treats every fault as permanent. The default strategy.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoneTransient;

impl TransientErrorDetectionStrategy for NoneTransient {
    fn is_transient(&self, _fault: &Fault) -> bool {
        false
    }
}

/// Treats a fault as transient when one of the registered error types appears
/// anywhere in its cause chain.
///
/// ```
/// use courier_core::retry::{TransientByType, TransientErrorDetectionStrategy};
/// use courier_core::Fault;
///
/// #[derive(Debug, thiserror::Error)]
/// #[error("timed out")]
/// struct TimedOut;
///
/// let strategy = TransientByType::new().with::<TimedOut>();
/// assert!(strategy.is_transient(&Fault::new(TimedOut.into())));
/// assert!(!strategy.is_transient(&Fault::msg("bad input")));
/// ```
#[derive(Clone, Default)]
pub struct TransientByType {
    matchers: Vec<(&'static str, fn(&Fault) -> bool)>,
}

impl TransientByType {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `E` to the set of transient error types.
    #[must_use]
    pub fn with<E>(mut self) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        let matcher: fn(&Fault) -> bool = caused_by::<E>;
        self.matchers.push((std::any::type_name::<E>(), matcher));
        self
    }

    /// Names of the registered error types, in registration order.
    pub fn type_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.matchers.iter().map(|(name, _)| *name)
    }
}

impl fmt::Debug for TransientByType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.type_names()).finish()
    }
}

fn caused_by<E>(fault: &Fault) -> bool
where
    E: StdError + Send + Sync + 'static,
{
    fault.is::<E>()
}

impl TransientErrorDetectionStrategy for TransientByType {
    fn is_transient(&self, fault: &Fault) -> bool {
        self.matchers.iter().any(|(_, matches)| matches(fault))
    }
}
