use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::{BalerError, Result};

/// One-shot event that any number of threads can fire and wait on.
///
/// Firing is idempotent: the first call releases every waiter, later calls
/// are no-ops. The wake-up is the disconnection of an internal channel, so the
/// signal can also take part in `crossbeam_channel::select!`.
pub struct Signal {
    fired: AtomicBool,
    trigger: Mutex<Option<Sender<()>>>,
    done: Receiver<()>,
}

impl Signal {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(0);
        Self {
            fired: AtomicBool::new(false),
            trigger: Mutex::new(Some(tx)),
            done: rx,
        }
    }

    pub fn fire(&self) {
        self.fired.store(true, Ordering::SeqCst);
        let mut trigger = self.trigger.lock().unwrap_or_else(|p| p.into_inner());
        trigger.take();
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Block until the signal fires.
    pub fn wait(&self) {
        // Nothing is ever sent; recv returns once the sender is dropped.
        let _ = self.done.recv();
    }

    /// Block until the signal fires or `timeout` elapses. Returns whether it fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        match self.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
        }
    }

    /// Receiver that becomes ready (disconnected) when the signal fires.
    pub fn receiver(&self) -> &Receiver<()> {
        &self.done
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared cancellation flag handed to every long-running traversal.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<Signal>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.fire();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.is_fired()
    }

    /// `Err(Cancelled)` once cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(BalerError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn receiver(&self) -> &Receiver<()> {
        self.0.receiver()
    }
}

/// Send `item` unless the token is cancelled first. Returns false when the item
/// was dropped, either because of cancellation or because the receiver is gone.
pub fn send_or_cancel<T>(tx: &Sender<T>, cancel: &CancelToken, item: T) -> bool {
    if cancel.is_cancelled() {
        return false;
    }
    crossbeam_channel::select! {
        send(tx, item) -> res => res.is_ok(),
        recv(cancel.receiver()) -> _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn fire_is_idempotent() {
        let s = Signal::new();
        assert!(!s.is_fired());
        s.fire();
        s.fire();
        assert!(s.is_fired());
        s.wait();
        assert!(s.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn wait_timeout_without_fire() {
        let s = Signal::new();
        assert!(!s.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn fire_from_many_threads_wakes_waiter() {
        let s = Arc::new(Signal::new());
        let waiter = {
            let s = Arc::clone(&s);
            thread::spawn(move || s.wait())
        };
        let firers: Vec<_> = (0..4)
            .map(|_| {
                let s = Arc::clone(&s);
                thread::spawn(move || s.fire())
            })
            .collect();
        for f in firers {
            f.join().unwrap();
        }
        waiter.join().unwrap();
        assert!(s.is_fired());
    }

    #[test]
    fn cancel_unblocks_blocked_sender() {
        let cancel = CancelToken::new();
        let (tx, _rx) = crossbeam_channel::bounded::<u32>(0);
        let sender = {
            let cancel = cancel.clone();
            thread::spawn(move || send_or_cancel(&tx, &cancel, 7))
        };
        thread::sleep(Duration::from_millis(20));
        cancel.cancel();
        assert!(!sender.join().unwrap());
        assert!(cancel.check().is_err());
    }

    #[test]
    fn send_succeeds_when_not_cancelled() {
        let cancel = CancelToken::new();
        let (tx, rx) = crossbeam_channel::bounded(1);
        assert!(send_or_cancel(&tx, &cancel, 1u8));
        assert_eq!(rx.recv().unwrap(), 1);
    }
}
