//! Process lifecycle event source.
//!
//! Polls the process table and emits one event per appearing or
//! disappearing PID of a watched name. Instances already alive on the first
//! poll are reported as started, so capture begins immediately when the
//! monitored program predates the watcher.

use std::collections::{HashMap, HashSet};

use sysinfo::System;
use tokio::sync::mpsc::Sender;
use tokio::time::{interval, Duration};

/// Lifecycle event for one instance of a watched process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Started(String),
    Ended(String),
}

pub struct ProcessWatcher {
    watched: Vec<String>,
    poll_interval: Duration,
}

impl ProcessWatcher {
    pub fn new(watched: Vec<String>, poll_interval: Duration) -> Self {
        Self {
            watched,
            poll_interval,
        }
    }

    /// Run until the receiving side hangs up.
    pub async fn run(self, tx: Sender<ProcessEvent>) {
        let mut known: HashMap<String, HashSet<u32>> = self
            .watched
            .iter()
            .map(|name| (name.clone(), HashSet::new()))
            .collect();
        let mut ticker = interval(self.poll_interval);

        loop {
            ticker.tick().await;

            let watched = self.watched.clone();
            // The process table scan is blocking work.
            let current = match tokio::task::spawn_blocking(move || snapshot(&watched)).await {
                Ok(current) => current,
                Err(e) => {
                    tracing::error!("process table scan failed: {e}");
                    continue;
                }
            };

            for event in diff_events(&known, &current) {
                if tx.send(event).await.is_err() {
                    return; // nobody is listening anymore
                }
            }
            known = current;
        }
    }
}

/// Current PID sets for each watched name.
fn snapshot(watched: &[String]) -> HashMap<String, HashSet<u32>> {
    let system = System::new_all();

    let mut sets: HashMap<String, HashSet<u32>> = watched
        .iter()
        .map(|name| (name.clone(), HashSet::new()))
        .collect();
    for (pid, process) in system.processes() {
        let name = process.name().to_string_lossy();
        if let Some(pids) = sets.get_mut(name.as_ref()) {
            pids.insert(pid.as_u32());
        }
    }
    sets
}

/// One Started per PID that appeared, one Ended per PID that vanished.
fn diff_events(
    previous: &HashMap<String, HashSet<u32>>,
    current: &HashMap<String, HashSet<u32>>,
) -> Vec<ProcessEvent> {
    let empty = HashSet::new();
    let mut events = Vec::new();

    for (name, pids) in current {
        let before = previous.get(name).unwrap_or(&empty);
        for _ in pids.difference(before) {
            events.push(ProcessEvent::Started(name.clone()));
        }
        for _ in before.difference(pids) {
            events.push(ProcessEvent::Ended(name.clone()));
        }
    }

    events
}
