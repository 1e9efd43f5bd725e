//! Transaction lifecycle listeners.

use tessera_core::TransactionEvent;

/// Callback notified at lifecycle points of one transaction.
///
/// Implemented for every `FnMut(TransactionEvent) + Send` closure.
pub trait TransactionListener: Send {
    /// Called with the event that just happened.
    fn notify(&mut self, event: TransactionEvent);
}

impl<F> TransactionListener for F
where
    F: FnMut(TransactionEvent) + Send,
{
    fn notify(&mut self, event: TransactionEvent) {
        self(event)
    }
}
