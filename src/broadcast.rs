use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::group::GroupContext;
use crate::member::MemberId;
use crate::message::{GroupMessage, MasterMessage};

#[derive(Debug, Clone)]
struct BufferedBroadcast {
    message: MasterMessage,
    expires_at: Instant,
}

/// Replay buffer for authoritative master broadcasts.
///
/// Every broadcast that left successfully is retained, keyed by its master
/// view id, until it expires, so members that missed it can ask for a resend.
pub struct ReliableBroadcast {
    context: Arc<GroupContext>,
    buffer: Mutex<BTreeMap<u64, BufferedBroadcast>>,
}

impl ReliableBroadcast {
    pub fn new(context: Arc<GroupContext>) -> Self {
        Self {
            context,
            buffer: Mutex::new(BTreeMap::new()),
        }
    }

    /// Multicast `message` and retain it for resends.
    pub async fn broadcast(&self, message: MasterMessage) -> Result<()> {
        self.context
            .transport
            .broadcast(GroupMessage::Master(message.clone()))
            .await?;
        self.record_at(message, Instant::now()).await;
        Ok(())
    }

    pub async fn record_at(&self, message: MasterMessage, now: Instant) {
        let seq = message.master_view_id;
        let expires_at = now + self.context.config.broadcast_expiry();
        self.buffer
            .lock()
            .await
            .insert(seq, BufferedBroadcast { message, expires_at });
        debug!(seq, "retained broadcast for resend");
    }

    /// Buffered message for `seq` if it has not expired at `now`.
    pub async fn lookup_at(&self, seq: u64, now: Instant) -> Option<MasterMessage> {
        self.buffer
            .lock()
            .await
            .get(&seq)
            .filter(|buffered| buffered.expires_at > now)
            .map(|buffered| buffered.message.clone())
    }

    /// Retransmit the broadcast stamped `seq` to `target`. Returns false when
    /// the message is unknown or expired, or the send failed.
    pub async fn resend(&self, target: &MemberId, seq: u64) -> bool {
        let Some(mut message) = self.lookup_at(seq, Instant::now()).await else {
            warn!(member = %target, seq, "cannot resend: message expired or never sent");
            return false;
        };
        message.resend = true;
        match self.context.transport.send(target, GroupMessage::Master(message)).await {
            Ok(()) => {
                info!(member = %target, seq, "resent master broadcast");
                true
            }
            Err(e) => {
                self.context
                    .send_failures
                    .report_send_failure(target.as_str(), "resend", &e);
                false
            }
        }
    }

    /// Drop expired entries, returning how many were removed.
    pub async fn reap_at(&self, now: Instant) -> usize {
        let mut buffer = self.buffer.lock().await;
        let before = buffer.len();
        buffer.retain(|_, buffered| buffered.expires_at > now);
        before - buffer.len()
    }

    pub async fn len(&self) -> usize {
        self.buffer.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn run_reaper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = time::interval(self.context.config.broadcast_reap_interval());
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let reaped = self.reap_at(Instant::now()).await;
                    if reaped > 0 {
                        debug!(reaped, "reaped expired broadcasts");
                    }
                }
            }
        }
        debug!("broadcast reaper stopped");
    }
}
