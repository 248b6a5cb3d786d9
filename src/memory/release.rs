//! Controlled release of evicted values.
//!
//! Evicted values can carry resources (file handles, GPU buffers, FFI
//! handles) that must be torn down off the hot path, or on a specific
//! thread. A [`ReleaseExecutor`] is where that teardown happens; the memory
//! tier only decides *which* executor a given value goes to.

use crossbeam::channel::{self, Sender, TrySendError};
use std::thread::JoinHandle;

/// Executes the final drop of an evicted value `V`.
///
/// Implementors must not block the caller for long — the memory tier's
/// mutex is never held while calling into a [`ReleaseExecutor`], but the
/// caller of `set`/`remove`/`trim_*` may still be waiting synchronously on
/// `release()` to return if `release_asynchronously` is false.
pub trait ReleaseExecutor<V>: Send + Sync {
    fn release(&self, value: V);
}

/// Drops the value immediately on the calling thread.
pub struct SynchronousRelease;

impl<V> ReleaseExecutor<V> for SynchronousRelease {
    fn release(&self, value: V) {
        drop(value);
    }
}

/// Hands the value to a dedicated background thread for final drop.
///
/// Backed by a bounded `crossbeam` channel so a release storm cannot grow
/// memory without bound; if the channel is full the value is dropped
/// synchronously on the calling thread instead of blocking, trading a brief
/// hot-path hiccup for guaranteed forward progress.
pub struct BackgroundRelease<V: Send + 'static> {
    tx: Sender<V>,
    _worker: JoinHandle<()>,
}

impl<V: Send + 'static> BackgroundRelease<V> {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = channel::bounded::<V>(capacity.max(1));
        let worker = std::thread::Builder::new()
            .name("tandem-cache-release".to_string())
            .spawn(move || {
                for value in rx.iter() {
                    drop(value);
                }
            })
            .expect("failed to spawn release worker thread");

        Self { tx, _worker: worker }
    }
}

impl<V: Send + 'static> ReleaseExecutor<V> for BackgroundRelease<V> {
    fn release(&self, value: V) {
        match self.tx.try_send(value) {
            Ok(()) => {}
            Err(TrySendError::Full(v)) | Err(TrySendError::Disconnected(v)) => {
                tracing::debug!("release queue unavailable, dropping synchronously");
                drop(v);
            }
        }
    }
}

/// A caller-supplied dispatcher that runs release on a designated thread
/// (typically a host application's UI/main thread). `tandem-cache` has no
/// notion of "the main thread" itself — the embedding application provides
/// the dispatch mechanism (e.g. posting to its own event loop).
pub struct MainThreadRelease<V> {
    dispatch: Box<dyn Fn(V) + Send + Sync>,
}

impl<V> MainThreadRelease<V> {
    pub fn new<F>(dispatch: F) -> Self
    where
        F: Fn(V) + Send + Sync + 'static,
    {
        Self {
            dispatch: Box::new(dispatch),
        }
    }
}

impl<V> ReleaseExecutor<V> for MainThreadRelease<V> {
    fn release(&self, value: V) {
        (self.dispatch)(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn background_release_drops_eventually() {
        let counter = Arc::new(AtomicUsize::new(0));
        struct Dropper(Arc<AtomicUsize>);
        impl Drop for Dropper {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let release = BackgroundRelease::new(16);
        for _ in 0..8 {
            release.release(Dropper(counter.clone()));
        }

        // Give the worker thread a moment; this is a best-effort check,
        // not a hard guarantee about timing.
        std::thread::sleep(std::time::Duration::from_millis(100));
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn main_thread_release_invokes_dispatch() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c2 = counter.clone();
        let release = MainThreadRelease::new(move |_: i32| {
            c2.fetch_add(1, Ordering::SeqCst);
        });
        release.release(42);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
