//! Process-count-gated capture activation.
//!
//! The gate is the only component that starts or stops the capture engine.
//! It keeps one live-instance count per watched process name; the first
//! instance overall opens the socket, the last one to exit closes it. One
//! mutex guards the counters together with the engine, so two concurrent
//! first-starts cannot open two sockets and a stop cannot race an
//! activation.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;

use crate::capture::{CaptureEngine, SocketProvider};

/// Lock-free view of the gate for the status API.
#[derive(Default)]
pub struct GateStatus {
    active: AtomicBool,
    instances: DashMap<String, u32>,
}

impl GateStatus {
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn instance_counts(&self) -> HashMap<String, u32> {
        self.instances
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }
}

struct GateInner<P: SocketProvider> {
    counts: HashMap<String, u32>,
    engine: CaptureEngine<P>,
}

pub struct ProcessGate<P: SocketProvider> {
    inner: Mutex<GateInner<P>>,
    status: Arc<GateStatus>,
    bind_addr: Ipv4Addr,
}

impl<P: SocketProvider> ProcessGate<P> {
    pub fn new(engine: CaptureEngine<P>, bind_addr: Ipv4Addr, status: Arc<GateStatus>) -> Self {
        Self {
            inner: Mutex::new(GateInner {
                counts: HashMap::new(),
                engine,
            }),
            status,
            bind_addr,
        }
    }

    /// A watched process instance appeared. On the 0 -> 1 transition of the
    /// global count the capture engine is started; a setup failure leaves
    /// the engine idle until the next 0 -> 1 transition.
    pub fn on_process_start(&self, name: &str) {
        let mut inner = self.inner.lock().unwrap();

        let total_before: u32 = inner.counts.values().sum();
        let count = {
            let count = inner.counts.entry(name.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        self.status.instances.insert(name.to_string(), count);
        tracing::info!(process = name, instances = count, "watched process started");

        if total_before == 0 {
            match inner.engine.start(self.bind_addr) {
                Ok(()) => self.status.active.store(true, Ordering::Relaxed),
                Err(e) => tracing::error!("cannot start capture: {e}"),
            }
        }
    }

    /// A watched process instance exited. Decrements clamp at zero: an end
    /// signal without a matching start is a no-op and never triggers a stop.
    /// On the 1 -> 0 transition of the global count the engine is stopped.
    pub fn on_process_end(&self, name: &str) {
        let mut inner = self.inner.lock().unwrap();

        let Some(count) = inner.counts.get_mut(name) else {
            tracing::debug!(process = name, "end signal for untracked process");
            return;
        };
        if *count == 0 {
            tracing::debug!(process = name, "end signal with no live instances");
            return;
        }
        *count -= 1;
        let remaining = *count;
        self.status.instances.insert(name.to_string(), remaining);
        tracing::info!(process = name, instances = remaining, "watched process ended");

        let total: u32 = inner.counts.values().sum();
        if total == 0 {
            inner.engine.stop();
            self.status.active.store(false, Ordering::Relaxed);
        }
    }

    /// Force the capture down regardless of counts; used on shutdown.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.engine.stop();
        self.status.active.store(false, Ordering::Relaxed);
    }
}
