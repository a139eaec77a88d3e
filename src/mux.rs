//! I/O multiplexer (spec.md §4.3/§5, C3).
//!
//! Grounded on `original_source/multiplexer/__init__.py` and
//! `dhns/mux.py`'s `Multiplexer.start`/`stop` — a `select()` loop over
//! readers and writers with a ~25ms timeout. `select()` has no tokio
//! equivalent; each endpoint's `read()` already awaits its own socket
//! readiness, so it runs as its own task, while a 25ms ticker drains each
//! endpoint's write queue — the same read/write split, expressed with
//! `tokio::spawn` instead of a single-threaded readiness loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

const WRITE_TICK: Duration = Duration::from_millis(25);

#[async_trait]
pub trait MuxEndpoint: Send + Sync {
    async fn read(&self);
    async fn write(&self);
    async fn wqlen(&self) -> usize;
}

pub struct Mux {
    endpoints: Vec<Arc<dyn MuxEndpoint>>,
    running: Arc<AtomicBool>,
}

impl Default for Mux {
    fn default() -> Self {
        Self::new()
    }
}

impl Mux {
    pub fn new() -> Self {
        Self { endpoints: Vec::new(), running: Arc::new(AtomicBool::new(false)) }
    }

    pub fn add(&mut self, endpoint: Arc<dyn MuxEndpoint>) {
        self.endpoints.push(endpoint);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Runs until `stop()` is called from another task.
    pub async fn start(&self) {
        self.running.store(true, Ordering::SeqCst);

        let read_tasks: Vec<JoinHandle<()>> = self
            .endpoints
            .iter()
            .cloned()
            .map(|endpoint| {
                let running = self.running.clone();
                tokio::spawn(async move {
                    while running.load(Ordering::SeqCst) {
                        endpoint.read().await;
                    }
                })
            })
            .collect();

        let mut tick = tokio::time::interval(WRITE_TICK);
        while self.running.load(Ordering::SeqCst) {
            tick.tick().await;
            for endpoint in &self.endpoints {
                if endpoint.wqlen().await > 0 {
                    endpoint.write().await;
                }
            }
        }

        for task in read_tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingEndpoint {
        writes: AtomicUsize,
        pending: AtomicUsize,
    }

    #[async_trait]
    impl MuxEndpoint for CountingEndpoint {
        async fn read(&self) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        async fn write(&self) {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.pending.store(0, Ordering::SeqCst);
        }

        async fn wqlen(&self) -> usize {
            self.pending.load(Ordering::SeqCst)
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn drains_write_queue_on_tick() {
        let endpoint = Arc::new(CountingEndpoint { writes: AtomicUsize::new(0), pending: AtomicUsize::new(1) });
        let mut mux = Mux::new();
        mux.add(endpoint.clone());

        let running = mux.running.clone();
        let handle = tokio::spawn(async move {
            mux.start().await;
        });

        tokio::time::sleep(Duration::from_millis(80)).await;
        running.store(false, Ordering::SeqCst);
        let _ = tokio::time::timeout(Duration::from_millis(200), handle).await;

        assert!(endpoint.writes.load(Ordering::SeqCst) >= 1);
    }
}
