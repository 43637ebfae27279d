//! Matchmaking queue
//!
//! `MatchQueue` is the in-memory waiting list: O(1) membership through a
//! user index, O(1) uniform random selection over a dense entry vector.
//! `QueueActor` owns one and serializes every mutation, including the periodic
//! staleness sweep, behind a command channel; `QueueHandle` is its client.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::AppError;
use crate::types::UserId;

/// Default age after which an entry without activity is evicted
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(60);

/// Default period of the background sweep
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// A user waiting for a random partner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub user_id: UserId,
    pub display_name: String,
    pub last_activity: Instant,
}

/// Result of atomically taking two users out of the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Both entries were present and are now removed
    Claimed {
        requester: QueueEntry,
        partner: QueueEntry,
    },
    /// The requester is no longer queued (paired by a concurrent request)
    RequesterGone,
    /// The partner is no longer queued; nothing was removed
    PartnerGone,
}

/// Waiting list with unique user ids
#[derive(Debug, Default)]
pub struct MatchQueue {
    entries: Vec<QueueEntry>,
    /// UserId -> position in `entries`
    index: HashMap<UserId, usize>,
}

impl MatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a user, or refresh their timestamp if already present
    ///
    /// Returns true when a new entry was created.
    pub fn enqueue(&mut self, user_id: UserId, display_name: String, now: Instant) -> bool {
        if let Some(&pos) = self.index.get(&user_id) {
            let entry = &mut self.entries[pos];
            entry.last_activity = now;
            entry.display_name = display_name;
            return false;
        }
        self.index.insert(user_id, self.entries.len());
        self.entries.push(QueueEntry {
            user_id,
            display_name,
            last_activity: now,
        });
        true
    }

    /// Refresh a present entry; never inserts
    pub fn touch(&mut self, user_id: UserId, now: Instant) -> bool {
        match self.index.get(&user_id) {
            Some(&pos) => {
                self.entries[pos].last_activity = now;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, user_id: UserId) -> Option<QueueEntry> {
        let pos = self.index.remove(&user_id)?;
        let entry = self.entries.swap_remove(pos);
        if let Some(moved) = self.entries.get(pos) {
            self.index.insert(moved.user_id, pos);
        }
        Some(entry)
    }

    pub fn contains(&self, user_id: UserId) -> bool {
        self.index.contains_key(&user_id)
    }

    pub fn get(&self, user_id: UserId) -> Option<&QueueEntry> {
        self.index.get(&user_id).map(|&pos| &self.entries[pos])
    }

    /// One entry chosen uniformly among everyone except `excluding`
    pub fn pick_candidate<R: Rng + ?Sized>(
        &self,
        excluding: UserId,
        rng: &mut R,
    ) -> Option<&QueueEntry> {
        let skip = self.index.get(&excluding).copied();
        let available = self.entries.len() - usize::from(skip.is_some());
        if available == 0 {
            return None;
        }
        let mut pos = rng.gen_range(0..available);
        if matches!(skip, Some(skip) if pos >= skip) {
            pos += 1;
        }
        self.entries.get(pos)
    }

    /// Snapshot of every entry except `excluding`
    pub fn candidates(&self, excluding: UserId) -> Vec<QueueEntry> {
        self.entries
            .iter()
            .filter(|e| e.user_id != excluding)
            .cloned()
            .collect()
    }

    /// Remove both users, or neither
    pub fn claim_pair(&mut self, requester: UserId, partner: UserId) -> ClaimOutcome {
        if !self.contains(requester) {
            return ClaimOutcome::RequesterGone;
        }
        if requester == partner || !self.contains(partner) {
            return ClaimOutcome::PartnerGone;
        }
        match (self.remove(requester), self.remove(partner)) {
            (Some(requester), Some(partner)) => ClaimOutcome::Claimed { requester, partner },
            // Both presence checks passed above
            _ => ClaimOutcome::PartnerGone,
        }
    }

    /// Put entries back after an aborted pairing
    ///
    /// Entries re-added meanwhile win, since they carry a fresher timestamp.
    pub fn restore(&mut self, entries: impl IntoIterator<Item = QueueEntry>) {
        for entry in entries {
            if self.contains(entry.user_id) {
                continue;
            }
            self.index.insert(entry.user_id, self.entries.len());
            self.entries.push(entry);
        }
    }

    /// Drop every entry with `now - last_activity >= max_age`
    ///
    /// An entry exactly `max_age` old is stale. Returns the evicted user ids.
    pub fn evict_stale(&mut self, now: Instant, max_age: Duration) -> Vec<UserId> {
        let (stale, fresh): (Vec<_>, Vec<_>) = self
            .entries
            .drain(..)
            .partition(|e| now.saturating_duration_since(e.last_activity) >= max_age);
        self.entries = fresh;
        self.reindex();
        stale.into_iter().map(|e| e.user_id).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove everything, returning how many entries were dropped
    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        self.index.clear();
        count
    }

    fn reindex(&mut self) {
        self.index = self
            .entries
            .iter()
            .enumerate()
            .map(|(pos, e)| (e.user_id, pos))
            .collect();
    }
}

/// Staleness policy of the queue actor
#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    pub max_age: Duration,
    pub sweep_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_age: DEFAULT_MAX_AGE,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// Commands sent to the queue actor
#[derive(Debug)]
pub enum QueueCommand {
    Enqueue {
        user_id: UserId,
        display_name: String,
        reply: oneshot::Sender<bool>,
    },
    Touch {
        user_id: UserId,
        reply: oneshot::Sender<bool>,
    },
    PickCandidate {
        excluding: UserId,
        reply: oneshot::Sender<Option<QueueEntry>>,
    },
    Candidates {
        excluding: UserId,
        reply: oneshot::Sender<Vec<QueueEntry>>,
    },
    Remove {
        user_id: UserId,
        reply: oneshot::Sender<Option<QueueEntry>>,
    },
    ClaimPair {
        requester: UserId,
        partner: UserId,
        reply: oneshot::Sender<ClaimOutcome>,
    },
    Restore(Vec<QueueEntry>),
    EvictStale {
        reply: oneshot::Sender<usize>,
    },
    Size(oneshot::Sender<usize>),
    Clear(oneshot::Sender<usize>),
}

/// Actor owning the `MatchQueue`
///
/// Also the sweep worker: the first interval tick fires immediately, so the
/// queue is flushed of stale entries as soon as the process starts.
pub struct QueueActor {
    queue: MatchQueue,
    receiver: mpsc::Receiver<QueueCommand>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
}

impl QueueActor {
    pub fn new(
        receiver: mpsc::Receiver<QueueCommand>,
        clock: Arc<dyn Clock>,
        config: QueueConfig,
    ) -> Self {
        Self {
            queue: MatchQueue::new(),
            receiver,
            clock,
            config,
        }
    }

    /// Create the command channel, spawn the actor, and return its handle
    pub fn spawn(buffer: usize, clock: Arc<dyn Clock>, config: QueueConfig) -> QueueHandle {
        let (tx, rx) = mpsc::channel(buffer);
        tokio::spawn(QueueActor::new(rx, clock, config).run());
        QueueHandle::new(tx)
    }

    pub async fn run(mut self) {
        info!(
            "Matchmaking queue started (max age {:?}, sweep every {:?})",
            self.config.max_age, self.config.sweep_interval
        );

        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                cmd = self.receiver.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                _ = sweep.tick() => {
                    self.evict_stale();
                }
            }
        }

        info!("Matchmaking queue shutting down");
    }

    fn handle_command(&mut self, cmd: QueueCommand) {
        match cmd {
            QueueCommand::Enqueue {
                user_id,
                display_name,
                reply,
            } => {
                let inserted = self.queue.enqueue(user_id, display_name, self.clock.now());
                if inserted {
                    debug!("User {} joined the queue ({} waiting)", user_id, self.queue.len());
                } else {
                    debug!("User {} already queued, activity refreshed", user_id);
                }
                let _ = reply.send(inserted);
            }
            QueueCommand::Touch { user_id, reply } => {
                let _ = reply.send(self.queue.touch(user_id, self.clock.now()));
            }
            QueueCommand::PickCandidate { excluding, reply } => {
                let candidate = self
                    .queue
                    .pick_candidate(excluding, &mut rand::thread_rng())
                    .cloned();
                let _ = reply.send(candidate);
            }
            QueueCommand::Candidates { excluding, reply } => {
                let _ = reply.send(self.queue.candidates(excluding));
            }
            QueueCommand::Remove { user_id, reply } => {
                let _ = reply.send(self.queue.remove(user_id));
            }
            QueueCommand::ClaimPair {
                requester,
                partner,
                reply,
            } => {
                let _ = reply.send(self.queue.claim_pair(requester, partner));
            }
            QueueCommand::Restore(entries) => {
                debug!("Restoring {} queue entries", entries.len());
                self.queue.restore(entries);
            }
            QueueCommand::EvictStale { reply } => {
                let _ = reply.send(self.evict_stale());
            }
            QueueCommand::Size(reply) => {
                let _ = reply.send(self.queue.len());
            }
            QueueCommand::Clear(reply) => {
                let count = self.queue.clear();
                if count > 0 {
                    info!("Queue cleared: removed {} users", count);
                }
                let _ = reply.send(count);
            }
        }
    }

    fn evict_stale(&mut self) -> usize {
        let evicted = self.queue.evict_stale(self.clock.now(), self.config.max_age);
        if !evicted.is_empty() {
            info!("Queue cleanup: removed {} inactive users", evicted.len());
        }
        evicted.len()
    }
}

/// Cloneable handle to the queue actor
#[derive(Debug, Clone)]
pub struct QueueHandle {
    sender: mpsc::Sender<QueueCommand>,
}

impl QueueHandle {
    pub fn new(sender: mpsc::Sender<QueueCommand>) -> Self {
        Self { sender }
    }

    /// Refresh-or-insert; true when a new entry was created
    pub async fn enqueue(&self, user_id: UserId, display_name: String) -> Result<bool, AppError> {
        self.request(|reply| QueueCommand::Enqueue {
            user_id,
            display_name,
            reply,
        })
        .await
    }

    /// Administrative activity refresh; false if the user is not queued
    pub async fn touch(&self, user_id: UserId) -> Result<bool, AppError> {
        self.request(|reply| QueueCommand::Touch { user_id, reply }).await
    }

    /// Uniformly random entry other than `excluding`
    pub async fn pick_candidate(&self, excluding: UserId) -> Result<QueueEntry, AppError> {
        self.request(|reply| QueueCommand::PickCandidate { excluding, reply })
            .await?
            .ok_or_else(|| AppError::NotFound("queue candidate".into()))
    }

    pub async fn candidates(&self, excluding: UserId) -> Result<Vec<QueueEntry>, AppError> {
        self.request(|reply| QueueCommand::Candidates { excluding, reply })
            .await
    }

    /// Remove a user; no-op when absent
    pub async fn remove(&self, user_id: UserId) -> Result<Option<QueueEntry>, AppError> {
        self.request(|reply| QueueCommand::Remove { user_id, reply }).await
    }

    pub async fn claim_pair(
        &self,
        requester: UserId,
        partner: UserId,
    ) -> Result<ClaimOutcome, AppError> {
        self.request(|reply| QueueCommand::ClaimPair {
            requester,
            partner,
            reply,
        })
        .await
    }

    pub async fn restore(&self, entries: Vec<QueueEntry>) -> Result<(), AppError> {
        self.sender
            .send(QueueCommand::Restore(entries))
            .await
            .map_err(|_| AppError::ChannelSend)
    }

    /// On-demand sweep; returns how many entries were evicted
    pub async fn evict_stale(&self) -> Result<usize, AppError> {
        self.request(|reply| QueueCommand::EvictStale { reply }).await
    }

    pub async fn size(&self) -> Result<usize, AppError> {
        self.request(QueueCommand::Size).await
    }

    pub async fn clear(&self) -> Result<usize, AppError> {
        self.request(QueueCommand::Clear).await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> QueueCommand,
    ) -> Result<T, AppError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(make(tx))
            .await
            .map_err(|_| AppError::ChannelSend)?;
        rx.await.map_err(|_| AppError::ChannelSend)
    }
}
