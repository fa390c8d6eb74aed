//! Cooperative cancellation between sandbox steps.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

/// Set from the SIGINT handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_: nix::libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Shared flag checked between steps of a long sequence.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
    watch_interrupt: bool,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that also reports cancelled once SIGINT has been received.
    /// Installs the handler; SA_RESTART is left off so blocking waits
    /// return early.
    pub fn interruptible() -> nix::Result<Self> {
        let action = SigAction::new(
            SigHandler::Handler(on_sigint),
            SaFlags::empty(),
            SigSet::empty(),
        );
        // SAFETY: the handler only stores to an atomic.
        unsafe { signal::sigaction(Signal::SIGINT, &action) }?;
        Ok(Self {
            flag: Arc::new(AtomicBool::new(false)),
            watch_interrupt: true,
        })
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || (self.watch_interrupt && INTERRUPTED.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_state() {
        let token = CancellationToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());
        token.cancel();
        assert!(other.is_cancelled());
    }

    #[test]
    fn test_plain_token_ignores_interrupt_flag() {
        let token = CancellationToken::new();
        INTERRUPTED.store(true, Ordering::SeqCst);
        let cancelled = token.is_cancelled();
        INTERRUPTED.store(false, Ordering::SeqCst);
        assert!(!cancelled);
    }
}
