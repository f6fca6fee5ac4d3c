use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use gitops_core::model::RepositoryStatus;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::git::Repository;
use crate::selector::Selector;

/// Handle for requesting fetches. An empty list means every remote.
#[derive(Clone)]
pub struct Fetcher {
    requests: mpsc::Sender<Vec<String>>,
}

impl Fetcher {
    /// Spawns the fetch loop plus one ticker per polled remote, and queues an
    /// initial fetch of every remote.
    ///
    /// `statuses` receives a snapshot after every cycle that ends with a selection.
    pub fn spawn<R: Repository>(
        selector: Arc<Selector<R>>,
        statuses: mpsc::Sender<RepositoryStatus>,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let (tx, rx) = mpsc::channel(16);
        let mut tasks = Vec::new();

        for remote in selector.remotes() {
            if remote.poll_period_secs == 0 {
                continue;
            }
            let period = Duration::from_secs(remote.poll_period_secs);
            let name = remote.name.clone();
            let tx = tx.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if tx.send(vec![name.clone()]).await.is_err() {
                        return;
                    }
                }
            }));
        }

        // Capacity is 16 and nothing else has been queued yet.
        let _ = tx.try_send(Vec::new());
        tasks.push(tokio::spawn(run(selector, rx, statuses)));

        (Self { requests: tx }, tasks)
    }

    /// Queues a fetch of `remotes`, all of them when empty.
    pub async fn trigger(&self, remotes: Vec<String>) -> Result<()> {
        self.requests
            .send(remotes)
            .await
            .map_err(|_| anyhow!("fetcher is not running"))
    }
}

async fn run<R: Repository>(
    selector: Arc<Selector<R>>,
    mut requests: mpsc::Receiver<Vec<String>>,
    statuses: mpsc::Sender<RepositoryStatus>,
) {
    while let Some(first) = requests.recv().await {
        let mut names = first;
        while let Ok(more) = requests.try_recv() {
            merge(&mut names, more);
        }

        debug!(remotes = ?names, "fetch cycle");
        selector.fetch(&names).await;
        let status = match selector.update().await {
            Ok(status) => status,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "repository update failed");
                continue;
            }
        };

        if status.selected.is_none() {
            continue;
        }
        if statuses.send(status).await.is_err() {
            return;
        }
    }
}

/// Unions two fetch requests; an empty request already covers everything.
fn merge(names: &mut Vec<String>, more: Vec<String>) {
    if names.is_empty() {
        return;
    }
    if more.is_empty() {
        names.clear();
        return;
    }
    for n in more {
        if !names.contains(&n) {
            names.push(n);
        }
    }
}
