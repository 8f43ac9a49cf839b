use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};

/// Collapses concurrent calls into one running future whose output every caller receives.
///
/// The slot is claimed on the first poll of [`SingleFlight::run`], so callers joined in the
/// same poll round all share one execution.
pub(crate) struct SingleFlight<T: Clone> {
    inflight: Mutex<Option<(u64, Shared<BoxFuture<'static, T>>)>>,
    generation: AtomicU64,
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new() -> Self {
        Self {
            inflight: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    pub(crate) async fn run<F, Fut>(&self, start: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (id, shared) = {
            let mut slot = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
            match slot.as_ref() {
                Some((id, shared)) => (*id, shared.clone()),
                None => {
                    let id = self.generation.fetch_add(1, Ordering::Relaxed);
                    let shared = start().boxed().shared();
                    *slot = Some((id, shared.clone()));
                    (id, shared)
                }
            }
        };

        let output = shared.await;

        let mut slot = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|(current, _)| *current == id) {
            *slot = None;
        }
        output
    }

    pub(crate) fn is_running(&self) -> bool {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }
}
