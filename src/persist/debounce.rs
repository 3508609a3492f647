use std::io;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A trailing-edge debounce timer running on its own thread.
///
/// Each [`notify`](Debouncer::notify) restarts the window; `fire` runs once
/// the window passes without another notification. The thread exits when the
/// `Debouncer` is dropped or `fire` returns false.
pub(crate) struct Debouncer {
    tx: Sender<()>,
    _handle: JoinHandle<()>,
}

impl Debouncer {
    pub(crate) fn spawn<F>(name: String, window: Duration, mut fire: F) -> io::Result<Self>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<()>();
        let handle = thread::Builder::new().name(name).spawn(move || {
            // Idle until the first notification of a burst.
            while rx.recv().is_ok() {
                loop {
                    match rx.recv_timeout(window) {
                        Ok(()) => continue,
                        Err(RecvTimeoutError::Timeout) => break,
                        Err(RecvTimeoutError::Disconnected) => return,
                    }
                }
                if !fire() {
                    return;
                }
            }
        })?;
        Ok(Self {
            tx,
            _handle: handle,
        })
    }

    /// Restart the window. Returns false if the worker has exited.
    pub(crate) fn notify(&self) -> bool {
        self.tx.send(()).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[test]
    fn burst_fires_once_after_window() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        let debouncer = Debouncer::spawn("debounce-test".into(), Duration::from_millis(100), move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
            true
        })
        .unwrap();

        for _ in 0..5 {
            assert!(debouncer.notify());
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        let deadline = Instant::now() + Duration::from_secs(2);
        while fired.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        thread::sleep(Duration::from_millis(150));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn worker_stops_when_fire_declines() {
        let debouncer = Debouncer::spawn("debounce-stop".into(), Duration::from_millis(5), || false).unwrap();
        assert!(debouncer.notify());

        let deadline = Instant::now() + Duration::from_secs(2);
        while debouncer.notify() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!debouncer.notify());
    }
}
