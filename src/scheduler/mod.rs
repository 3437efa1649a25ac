//! Backoff Enter scheduler
//!
//! Pasted input sometimes stalls on a "press Enter to paste" prompt. After an
//! input is sent, a campaign of delayed Enter keystrokes is armed for the
//! session. Each delay is measured from arming; when a timer fires the
//! session's state is read again and `\r` is only sent while the CLI still
//! looks stalled (`waiting_confirm` or `unknown`).

use crate::state::CliState;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// What the scheduler needs from a session
#[async_trait]
pub trait BackoffTarget: Send + Sync {
    fn session_id(&self) -> &str;

    async fn cli_state(&self) -> CliState;

    async fn send_enter(&self) -> anyhow::Result<()>;
}

struct Campaign {
    generation: u64,
    remaining: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

type CampaignMap = Arc<Mutex<HashMap<String, Campaign>>>;

pub struct Scheduler {
    delays: Vec<Duration>,
    campaigns: CampaignMap,
    generation: AtomicU64,
}

impl Scheduler {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self {
            delays,
            campaigns: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    /// Arm a campaign for the target's session, replacing any previous one.
    pub fn schedule(&self, target: Arc<dyn BackoffTarget>) {
        if self.delays.is_empty() {
            return;
        }

        let session_id = target.session_id().to_string();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let remaining = Arc::new(AtomicUsize::new(self.delays.len()));

        let mut campaigns = match self.campaigns.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(previous) = campaigns.remove(&session_id) {
            previous.handle.abort();
            tracing::debug!("[Backoff] Replaced campaign for {}", session_id);
        }

        let handle = tokio::spawn(run_campaign(
            target,
            Instant::now(),
            self.delays.clone(),
            generation,
            remaining.clone(),
            self.campaigns.clone(),
        ));

        campaigns.insert(
            session_id.clone(),
            Campaign {
                generation,
                remaining,
                handle,
            },
        );
        tracing::debug!(
            "[Backoff] Armed {} timers for {} (generation {})",
            self.delays.len(),
            session_id,
            generation
        );
    }

    /// Cancel the session's campaign. No-op when none is armed.
    pub fn cancel(&self, session_id: &str) {
        let removed = match self.campaigns.lock() {
            Ok(mut guard) => guard.remove(session_id),
            Err(poisoned) => poisoned.into_inner().remove(session_id),
        };
        if let Some(campaign) = removed {
            campaign.handle.abort();
            tracing::debug!("[Backoff] Cancelled campaign for {}", session_id);
        }
    }

    pub fn cancel_all(&self) {
        let drained: Vec<Campaign> = match self.campaigns.lock() {
            Ok(mut guard) => guard.drain().map(|(_, c)| c).collect(),
            Err(poisoned) => poisoned.into_inner().drain().map(|(_, c)| c).collect(),
        };
        for campaign in drained {
            campaign.handle.abort();
        }
    }

    /// Timers of the current campaign that have not fired yet
    pub fn outstanding(&self, session_id: &str) -> usize {
        match self.campaigns.lock() {
            Ok(guard) => guard
                .get(session_id)
                .map(|c| c.remaining.load(Ordering::SeqCst))
                .unwrap_or(0),
            Err(_) => 0,
        }
    }

    pub fn is_armed(&self, session_id: &str) -> bool {
        self.outstanding(session_id) > 0
    }
}

fn is_current(campaigns: &CampaignMap, session_id: &str, generation: u64) -> bool {
    campaigns
        .lock()
        .map(|guard| {
            guard
                .get(session_id)
                .is_some_and(|c| c.generation == generation)
        })
        .unwrap_or(false)
}

async fn run_campaign(
    target: Arc<dyn BackoffTarget>,
    armed_at: Instant,
    delays: Vec<Duration>,
    generation: u64,
    remaining: Arc<AtomicUsize>,
    campaigns: CampaignMap,
) {
    let session_id = target.session_id().to_string();

    for delay in delays {
        tokio::time::sleep_until(armed_at + delay).await;
        remaining.fetch_sub(1, Ordering::SeqCst);

        // A newer campaign or a cancel raced this fire
        if !is_current(&campaigns, &session_id, generation) {
            return;
        }

        let state = target.cli_state().await;
        if !state.wants_enter() {
            tracing::debug!(
                "[Backoff] {} is {} at {:?}, skipping Enter",
                session_id,
                state,
                delay
            );
            continue;
        }

        tracing::info!(
            "[Backoff] {} still {} after {:?}, sending Enter",
            session_id,
            state,
            delay
        );
        if let Err(e) = target.send_enter().await {
            tracing::warn!("[Backoff] Failed to send Enter to {}: {}", session_id, e);
            break;
        }
    }

    if let Ok(mut guard) = campaigns.lock() {
        if guard
            .get(&session_id)
            .is_some_and(|c| c.generation == generation)
        {
            guard.remove(&session_id);
        }
    }
}
