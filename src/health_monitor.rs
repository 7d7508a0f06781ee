use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::time::{self, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::election::ElectionCommand;
use crate::error::GroupError;
use crate::group::{GroupContext, StopKind};
use crate::member::{MemberAdvertisement, MemberId};
use crate::message::{GroupMessage, HealthMessage, HealthReport, MasterMessage, MasterMessageKind};
use crate::transport::Prober;
use crate::view::{ViewEvent, ViewEventKind};
use crate::view_manager::ViewManager;

// Liveness states a member can report or be assigned
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MemberState {
    Starting,
    Alive,
    Ready,
    AliveAndReady,
    InDoubt,
    Dead,
    PeerStopping,
    ClusterStopping,
    Stopped,
    Unknown,
}

impl MemberState {
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            MemberState::Starting | MemberState::Alive | MemberState::Ready | MemberState::AliveAndReady
        )
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, MemberState::Ready | MemberState::AliveAndReady)
    }

    pub fn is_stopping(&self) -> bool {
        matches!(
            self,
            MemberState::PeerStopping | MemberState::ClusterStopping | MemberState::Stopped
        )
    }

    /// Suspected or confirmed failed.
    pub fn is_failure(&self) -> bool {
        matches!(self, MemberState::InDoubt | MemberState::Dead)
    }

    /// Shutdown and readiness signals are acted upon even when they arrive
    /// behind a newer heartbeat of the same incarnation.
    pub fn bypasses_ordering(&self) -> bool {
        matches!(
            self,
            MemberState::PeerStopping | MemberState::ClusterStopping | MemberState::Ready
        )
    }
}

impl std::fmt::Display for MemberState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberState::Starting => write!(f, "STARTING"),
            MemberState::Alive => write!(f, "ALIVE"),
            MemberState::Ready => write!(f, "READY"),
            MemberState::AliveAndReady => write!(f, "ALIVEANDREADY"),
            MemberState::InDoubt => write!(f, "INDOUBT"),
            MemberState::Dead => write!(f, "DEAD"),
            MemberState::PeerStopping => write!(f, "PEERSTOPPING"),
            MemberState::ClusterStopping => write!(f, "CLUSTERSTOPPING"),
            MemberState::Stopped => write!(f, "STOPPED"),
            MemberState::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Last known liveness of one member.
#[derive(Clone, Debug)]
pub struct HealthEntry {
    pub member: MemberAdvertisement,
    pub state: MemberState,
    pub seq: u64,
    pub last_update: Instant,
}

/// Heartbeat producer and two-phase failure detector.
pub struct HealthMonitor {
    context: Arc<GroupContext>,
    view_manager: Arc<ViewManager>,
    prober: Arc<dyn Prober>,
    commands: mpsc::UnboundedSender<ElectionCommand>,
    cache: Mutex<HashMap<MemberId, HealthEntry>>,
    local_seq: AtomicU64,
    ready: AtomicBool,
    running: AtomicBool,
    stop_lock: Mutex<()>,
    verifier: Notify,
}

impl HealthMonitor {
    pub fn new(
        context: Arc<GroupContext>,
        view_manager: Arc<ViewManager>,
        prober: Arc<dyn Prober>,
        commands: mpsc::UnboundedSender<ElectionCommand>,
    ) -> Self {
        Self {
            context,
            view_manager,
            prober,
            commands,
            cache: Mutex::new(HashMap::new()),
            local_seq: AtomicU64::new(0),
            ready: AtomicBool::new(false),
            running: AtomicBool::new(true),
            stop_lock: Mutex::new(()),
            verifier: Notify::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Liveness the local member advertises on its regular heartbeat.
    pub fn current_state(&self) -> MemberState {
        if self.ready.load(Ordering::SeqCst) {
            MemberState::AliveAndReady
        } else {
            MemberState::Alive
        }
    }

    pub fn local_seq(&self) -> u64 {
        self.local_seq.load(Ordering::SeqCst)
    }

    pub async fn entry(&self, id: &MemberId) -> Option<HealthEntry> {
        self.cache.lock().await.get(id).cloned()
    }

    pub async fn member_state(&self, id: &MemberId) -> Option<MemberState> {
        self.cache.lock().await.get(id).map(|entry| entry.state)
    }

    pub async fn entries(&self) -> Vec<HealthEntry> {
        self.cache.lock().await.values().cloned().collect()
    }

    /// True when this exact incarnation was already declared dead.
    pub async fn is_dead_incarnation(&self, member: &MemberAdvertisement) -> bool {
        self.cache
            .lock()
            .await
            .get(&member.id)
            .map(|entry| entry.state == MemberState::Dead && entry.member.start_time == member.start_time)
            .unwrap_or(false)
    }

    /// Record that `member` is gone without a DEAD report having reached us.
    /// Nothing is broadcast. Returns true when a live or suspected entry of
    /// that incarnation was moved to DEAD.
    pub async fn mark_departed(&self, member: &MemberAdvertisement) -> bool {
        let mut cache = self.cache.lock().await;
        match cache.get_mut(&member.id) {
            Some(entry)
                if entry.member.is_same_incarnation(member)
                    && (entry.state.is_live() || entry.state == MemberState::InDoubt) =>
            {
                entry.state = MemberState::Dead;
                entry.last_update = Instant::now();
                true
            }
            _ => false,
        }
    }

    /// Drop every trace of a member, used when a restart made its entry stale.
    pub async fn purge(&self, id: &MemberId) -> Option<HealthEntry> {
        self.cache.lock().await.remove(id)
    }

    // ---- self reporting ----

    /// Broadcast the local member's state with a fresh sequence number.
    pub async fn report_my_state(&self, state: MemberState) -> Result<()> {
        let _guard = self.stop_lock.lock().await;
        if !self.is_running() {
            return Err(GroupError::ShuttingDown.into());
        }
        self.broadcast_self(state).await;
        Ok(())
    }

    /// The application signals readiness: report READY once, then keep
    /// heartbeating ALIVEANDREADY.
    pub async fn report_joined_and_ready(&self) -> Result<()> {
        self.ready.store(true, Ordering::SeqCst);
        self.report_my_state(MemberState::Ready).await
    }

    async fn broadcast_self(&self, state: MemberState) {
        let local = &self.context.local;
        let seq = self.local_seq.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut cache = self.cache.lock().await;
            cache.insert(
                local.id.clone(),
                HealthEntry {
                    member: local.clone(),
                    state,
                    seq,
                    last_update: Instant::now(),
                },
            );
        }
        trace!(state = %state, seq, "reporting local state");
        self.send_reports(vec![HealthReport {
            member: local.clone(),
            state,
            seq,
        }])
        .await;
    }

    /// Broadcast a state on behalf of another member. The member's own
    /// sequence number is reused, never incremented.
    pub async fn report_other_state(&self, member: &MemberAdvertisement, state: MemberState, seq: u64) {
        debug!(member = %member.id, state = %state, seq, "reporting state on behalf of member");
        self.send_reports(vec![HealthReport {
            member: member.clone(),
            state,
            seq,
        }])
        .await;
    }

    async fn send_reports(&self, reports: Vec<HealthReport>) {
        let master_state = &self.context.master_state;
        let stamp = if master_state.is_master() {
            Some(master_state.master_view_id())
        } else {
            None
        };
        let message = HealthMessage {
            source: self.context.local.id.clone(),
            reports,
            master_view_id: stamp,
        };
        if let Err(e) = self.context.transport.broadcast(GroupMessage::Health(message)).await {
            self.context
                .send_failures
                .report_send_failure("broadcast", "health message", &e);
        }
    }

    /// Heartbeat loop: STARTING once, then the current liveness every interval.
    pub async fn run_reporter(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if let Err(e) = self.report_my_state(MemberState::Starting).await {
            debug!("initial state report skipped: {}", e);
        }
        let mut ticker = time::interval(self.context.config.heartbeat_interval());
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.report_my_state(self.current_state()).await {
                        debug!("heartbeat skipped: {}", e);
                        break;
                    }
                }
            }
        }
        debug!("heartbeat reporter stopped");
    }

    /// Report the stopping state followed by STOPPED, then refuse further
    /// reports. Safe to call more than once.
    pub async fn stop(&self, kind: StopKind) {
        let _guard = self.stop_lock.lock().await;
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let stopping = match kind {
            StopKind::Peer => MemberState::PeerStopping,
            StopKind::Cluster => MemberState::ClusterStopping,
        };
        info!(state = %stopping, "health monitor stopping");
        self.broadcast_self(stopping).await;
        self.broadcast_self(MemberState::Stopped).await;
    }

    // ---- inbound ----

    /// Apply an inbound health message to the cache.
    pub async fn process(&self, message: HealthMessage) {
        for report in message.reports {
            self.process_report(report).await;
        }

        if let Some(stamped) = message.master_view_id {
            let from_master = self.view_manager.is_master(&message.source).await;
            if from_master && !self.context.master_state.is_master() {
                let _ = self.commands.send(ElectionCommand::CheckMissedEvents {
                    master: message.source,
                    master_view_id: stamped,
                });
            }
        }
    }

    async fn process_report(&self, report: HealthReport) {
        let local = &self.context.local;
        if report.member.id == local.id {
            if report.member.start_time == local.start_time && report.state.is_failure() && self.is_running() {
                warn!(state = %report.state, "peer reported the local member as {}, reasserting liveness", report.state);
                if let Err(e) = self.report_my_state(self.current_state()).await {
                    debug!("could not reassert liveness: {}", e);
                }
            }
            return;
        }

        let now = Instant::now();
        let transition = {
            let mut cache = self.cache.lock().await;
            match cache.get_mut(&report.member.id) {
                None => {
                    cache.insert(
                        report.member.id.clone(),
                        HealthEntry {
                            member: report.member.clone(),
                            state: report.state,
                            seq: report.seq,
                            last_update: now,
                        },
                    );
                    Some(MemberState::Unknown)
                }
                Some(cached) if report.member.start_time < cached.member.start_time => {
                    debug!(
                        member = %report.member.id,
                        stale_start = report.member.start_time,
                        cached_start = cached.member.start_time,
                        "discarding report from an older incarnation"
                    );
                    None
                }
                Some(cached) if report.member.start_time > cached.member.start_time => {
                    info!(member = %report.member.id, "health report from a new incarnation");
                    *cached = HealthEntry {
                        member: report.member.clone(),
                        state: report.state,
                        seq: report.seq,
                        last_update: now,
                    };
                    Some(MemberState::Unknown)
                }
                Some(cached) if cached.state == MemberState::Dead => {
                    trace!(member = %report.member.id, "ignoring report for a dead incarnation");
                    None
                }
                Some(cached) if report.seq < cached.seq => {
                    // a member already on its way out never reports a second way out
                    if report.state.bypasses_ordering() && report.state != cached.state && !cached.state.is_stopping() {
                        debug!(
                            member = %report.member.id,
                            state = %report.state,
                            seq = report.seq,
                            cached_seq = cached.seq,
                            "acting on out-of-order report"
                        );
                        let previous = cached.state;
                        cached.state = report.state;
                        cached.last_update = now;
                        Some(previous)
                    } else {
                        trace!(member = %report.member.id, seq = report.seq, "discarding out-of-order report");
                        None
                    }
                }
                Some(cached) if report.seq == cached.seq && report.state == cached.state => None,
                Some(cached) => {
                    let previous = cached.state;
                    cached.member = report.member.clone();
                    cached.state = report.state;
                    cached.seq = report.seq;
                    cached.last_update = now;
                    Some(previous)
                }
            }
        };

        if let Some(previous) = transition {
            self.on_transition(&report.member, previous, report.state).await;
        }
    }

    async fn on_transition(&self, member: &MemberAdvertisement, previous: MemberState, current: MemberState) {
        if previous != current {
            debug!(member = %member.id, from = %previous, to = %current, "member state changed");
        }
        match current {
            state if state.is_live() => {
                if previous == MemberState::InDoubt {
                    self.view_manager
                        .notify_listeners(ViewEvent::new(ViewEventKind::NoLongerInDoubt, member.clone()))
                        .await;
                }
                if state.is_ready() && !previous.is_ready() {
                    self.view_manager
                        .notify_listeners(ViewEvent::new(ViewEventKind::JoinedAndReady, member.clone()))
                        .await;
                }
                if !self.view_manager.contains(&member.id).await {
                    self.query_member(member).await;
                }
            }
            MemberState::InDoubt => {
                if previous != MemberState::InDoubt {
                    self.view_manager
                        .notify_listeners(ViewEvent::new(ViewEventKind::InDoubt, member.clone()))
                        .await;
                }
            }
            MemberState::Dead => self.handle_member_removed(member, ViewEventKind::Failure).await,
            MemberState::PeerStopping => self.handle_member_removed(member, ViewEventKind::PeerStop).await,
            MemberState::ClusterStopping => self.handle_member_removed(member, ViewEventKind::ClusterStop).await,
            MemberState::Stopped => {
                if !previous.is_stopping() {
                    self.handle_member_removed(member, ViewEventKind::PeerStop).await;
                }
            }
            _ => {}
        }
    }

    // Pull a member we hear heartbeats from into the view.
    async fn query_member(&self, member: &MemberAdvertisement) {
        debug!(member = %member.id, "member not in view, sending node query");
        let message = MasterMessage::new(
            self.context.local.clone(),
            self.context.master_state.master_view_id(),
            MasterMessageKind::NodeQuery,
        );
        if let Err(e) = self
            .context
            .transport
            .send(&member.id, GroupMessage::Master(message))
            .await
        {
            self.context
                .send_failures
                .report_send_failure(member.id.as_str(), "node query", &e);
        }
    }

    async fn handle_member_removed(&self, member: &MemberAdvertisement, kind: ViewEventKind) {
        let was_master = self
            .view_manager
            .master()
            .await
            .map(|master| master.is_same_incarnation(member))
            .unwrap_or(false);
        self.view_manager.remove(member).await;
        self.context.send_failures.clear(member.id.as_str());
        self.view_manager
            .notify_listeners(ViewEvent::new(kind, member.clone()))
            .await;
        let _ = self.commands.send(ElectionCommand::MemberRemoved {
            member: member.clone(),
            kind,
            was_master,
        });
    }

    // ---- failure detection ----

    /// Whether the local member may escalate a suspicion about `member`: the
    /// master may, and so may the member that would take over from a
    /// failing master.
    pub async fn may_escalate(&self, member: &MemberAdvertisement) -> bool {
        let master_state = &self.context.master_state;
        if master_state.is_master() {
            return true;
        }
        let local = &self.context.local;
        match self.view_manager.master().await {
            Some(master) if master.id == member.id => {
                self.view_manager
                    .master_candidate_excluding(Some(&member.id))
                    .await
                    .id
                    == local.id
            }
            None if !master_state.discovery_in_progress() => {
                self.view_manager
                    .master_candidate_excluding(Some(&member.id))
                    .await
                    .id
                    == local.id
            }
            _ => false,
        }
    }

    pub async fn is_connected(&self, member: &MemberAdvertisement) -> bool {
        self.prober
            .is_reachable(member, self.context.config.probe_timeout())
            .await
    }

    /// One suspicion pass: members silent for `max_missed_beats` intervals that
    /// also fail the reachability probe become INDOUBT.
    pub async fn detect_suspects(&self) -> Vec<MemberAdvertisement> {
        let config = &self.context.config;
        let interval = config.heartbeat_interval();
        let threshold = config.suspicion_threshold();
        let now = Instant::now();

        let silent: Vec<HealthEntry> = {
            let cache = self.cache.lock().await;
            cache
                .values()
                .filter(|entry| entry.member.id != self.context.local.id)
                .filter(|entry| entry.state.is_live())
                .filter(|entry| now.saturating_duration_since(entry.last_update) >= threshold)
                .cloned()
                .collect()
        };

        let mut suspected = Vec::new();
        for entry in silent {
            let elapsed = now.saturating_duration_since(entry.last_update);
            let missed = elapsed.as_millis() / interval.as_millis().max(1);
            if !self.may_escalate(&entry.member).await {
                trace!(member = %entry.member.id, missed, "missed heartbeats, not authorized to escalate");
                continue;
            }
            if self.is_connected(&entry.member).await {
                debug!(member = %entry.member.id, missed, "missed heartbeats but still reachable");
                continue;
            }
            if let Some(seq) = self.mark_in_doubt(&entry.member).await {
                warn!(member = %entry.member.id, missed, "member is in doubt");
                self.view_manager
                    .notify_listeners(ViewEvent::new(ViewEventKind::InDoubt, entry.member.clone()))
                    .await;
                self.report_other_state(&entry.member, MemberState::InDoubt, seq).await;
                suspected.push(entry.member);
            }
        }

        if !suspected.is_empty() {
            self.verifier.notify_one();
        }
        suspected
    }

    async fn mark_in_doubt(&self, member: &MemberAdvertisement) -> Option<u64> {
        let mut cache = self.cache.lock().await;
        match cache.get_mut(&member.id) {
            Some(entry) if entry.member.is_same_incarnation(member) && entry.state.is_live() => {
                entry.state = MemberState::InDoubt;
                Some(entry.seq)
            }
            _ => None,
        }
    }

    pub async fn run_suspicion_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = time::interval(self.context.config.heartbeat_interval());
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    self.detect_suspects().await;
                }
            }
        }
        debug!("suspicion scanner stopped");
    }

    /// Re-check every suspect this member may escalate; unreachable ones are
    /// declared dead, reachable ones are cleared.
    pub async fn verify_suspects(&self) -> Vec<MemberAdvertisement> {
        let suspects: Vec<HealthEntry> = {
            let cache = self.cache.lock().await;
            cache
                .values()
                .filter(|entry| entry.member.id != self.context.local.id)
                .filter(|entry| entry.state == MemberState::InDoubt)
                .cloned()
                .collect()
        };

        let mut failed = Vec::new();
        for entry in suspects {
            if !self.may_escalate(&entry.member).await {
                continue;
            }
            if self.is_connected(&entry.member).await {
                self.clear_suspicion(&entry.member).await;
            } else if self.assign_failure(&entry.member).await {
                failed.push(entry.member);
            }
        }
        failed
    }

    async fn clear_suspicion(&self, member: &MemberAdvertisement) {
        let seq = {
            let mut cache = self.cache.lock().await;
            match cache.get_mut(&member.id) {
                Some(entry) if entry.member.is_same_incarnation(member) && entry.state == MemberState::InDoubt => {
                    entry.state = MemberState::Alive;
                    entry.last_update = Instant::now();
                    entry.seq
                }
                _ => return,
            }
        };
        info!(member = %member.id, "suspect is reachable again");
        self.view_manager
            .notify_listeners(ViewEvent::new(ViewEventKind::NoLongerInDoubt, member.clone()))
            .await;
        self.report_other_state(member, MemberState::Alive, seq).await;
    }

    /// Declare `member` dead. The transition happens under the cache lock and
    /// loses to a concurrent confirmation. The member's last sequence number
    /// is preserved.
    pub async fn assign_failure(&self, member: &MemberAdvertisement) -> bool {
        let seq = {
            let mut cache = self.cache.lock().await;
            match cache.get_mut(&member.id) {
                Some(entry) if entry.member.is_same_incarnation(member) && entry.state != MemberState::Dead => {
                    entry.state = MemberState::Dead;
                    entry.last_update = Instant::now();
                    entry.seq
                }
                _ => {
                    debug!(member = %member.id, "failure already assigned");
                    return false;
                }
            }
        };
        error!(member = %member.id, seq, "member failure confirmed");
        self.report_other_state(member, MemberState::Dead, seq).await;
        self.handle_member_removed(member, ViewEventKind::Failure).await;
        true
    }

    pub async fn run_failure_verifier(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let grace = self.context.config.verify_timeout();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = self.verifier.notified() => {}
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = time::sleep(grace) => {}
            }
            let failed = self.verify_suspects().await;
            if !failed.is_empty() {
                info!(count = failed.len(), "failure verification declared members dead");
            }
        }
        debug!("failure verifier stopped");
    }

    /// Failure asserted by an external watchdog. Only the master applies it,
    /// and only for members not already failed or stopping.
    pub async fn watchdog_failure(&self, id: &MemberId) -> Result<bool> {
        if !self.context.master_state.is_master() {
            return Err(GroupError::NotMaster.into());
        }
        let entry = self.entry(id).await;
        match entry {
            None => {
                warn!(member = %id, "watchdog reported an unknown member");
                Ok(false)
            }
            Some(entry) if entry.state == MemberState::Dead || entry.state.is_stopping() => {
                debug!(member = %id, state = %entry.state, "watchdog report for a member already gone");
                Ok(false)
            }
            Some(entry) => {
                info!(member = %id, "applying watchdog failure notification");
                Ok(self.assign_failure(&entry.member).await)
            }
        }
    }
}
