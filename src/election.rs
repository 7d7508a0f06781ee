//! Master election and authoritative view distribution.
//!
//! Discovery broadcasts master queries a bounded number of times; without an
//! answer the most senior known member is appointed. The master numbers every
//! authoritative view with a master view id, and members apply those views in
//! order, asking for resends when a heartbeat reveals a gap.

use anyhow::Result;
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::time::{self, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::broadcast::ReliableBroadcast;
use crate::group::GroupContext;
use crate::health_monitor::HealthMonitor;
use crate::member::{confirm_instance_has_restarted, MemberAdvertisement, MemberId};
use crate::message::{GroupMessage, MasterMessage, MasterMessageKind};
use crate::view::{ViewEvent, ViewEventKind};
use crate::view_manager::ViewManager;

/// Election flags shared with the rest of the service. Only the election
/// mutates them.
#[derive(Debug, Default)]
pub struct MasterState {
    is_master: AtomicBool,
    master_assigned: AtomicBool,
    discovery_in_progress: AtomicBool,
    master_view_id: AtomicU64,
    group_startup_complete: AtomicBool,
}

impl MasterState {
    pub fn is_master(&self) -> bool {
        self.is_master.load(Ordering::SeqCst)
    }

    pub fn master_assigned(&self) -> bool {
        self.master_assigned.load(Ordering::SeqCst)
    }

    pub fn discovery_in_progress(&self) -> bool {
        self.discovery_in_progress.load(Ordering::SeqCst)
    }

    /// On the master, the last id it issued. Elsewhere, the last id applied.
    pub fn master_view_id(&self) -> u64 {
        self.master_view_id.load(Ordering::SeqCst)
    }

    pub fn group_startup_complete(&self) -> bool {
        self.group_startup_complete.load(Ordering::SeqCst)
    }

    pub(crate) fn set_is_master(&self, value: bool) {
        self.is_master.store(value, Ordering::SeqCst);
    }

    pub(crate) fn set_master_assigned(&self, value: bool) {
        self.master_assigned.store(value, Ordering::SeqCst);
    }

    pub(crate) fn set_discovery_in_progress(&self, value: bool) {
        self.discovery_in_progress.store(value, Ordering::SeqCst);
    }

    pub(crate) fn set_master_view_id(&self, value: u64) {
        self.master_view_id.store(value, Ordering::SeqCst);
    }

    pub(crate) fn next_master_view_id(&self) -> u64 {
        self.master_view_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn set_group_startup_complete(&self, value: bool) {
        self.group_startup_complete.store(value, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedMasterViewId {
    pub master: MemberId,
    pub seq: u64,
    pub expires_at: Instant,
}

/// Recently applied master view ids, used to drop duplicates and to work out
/// which ids are really missing.
#[derive(Debug, Default)]
pub struct ProcessedMasterViewIds {
    entries: Vec<ProcessedMasterViewId>,
}

impl ProcessedMasterViewIds {
    pub fn record(&mut self, master: &MemberId, seq: u64, expires_at: Instant) {
        if !self.contains(master, seq) {
            self.entries.push(ProcessedMasterViewId {
                master: master.clone(),
                seq,
                expires_at,
            });
        }
    }

    pub fn contains(&self, master: &MemberId, seq: u64) -> bool {
        self.entries
            .iter()
            .any(|entry| &entry.master == master && entry.seq == seq)
    }

    /// Drop expired ids but always keep the newest one.
    pub fn prune(&mut self, now: Instant) {
        let newest = self
            .entries
            .iter()
            .max_by_key(|entry| (entry.expires_at, entry.seq))
            .cloned();
        self.entries.retain(|entry| entry.expires_at > now);
        if let Some(newest) = newest {
            if self.entries.is_empty() {
                self.entries.push(newest);
            }
        }
    }

    pub fn forget_master(&mut self, master: &MemberId) {
        self.entries.retain(|entry| &entry.master != master);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Pending master protocol messages, drained in (source, master view id,
/// arrival) order.
#[derive(Debug, Default)]
pub struct MasterMessageQueue {
    pending: std::sync::Mutex<BTreeMap<(MemberId, u64, u64), MasterMessage>>,
    arrivals: AtomicU64,
    available: Notify,
}

impl MasterMessageQueue {
    fn pending(&self) -> MutexGuard<'_, BTreeMap<(MemberId, u64, u64), MasterMessage>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn push(&self, message: MasterMessage) {
        let arrival = self.arrivals.fetch_add(1, Ordering::SeqCst);
        let key = (message.source.id.clone(), message.master_view_id, arrival);
        self.pending().insert(key, message);
        self.available.notify_one();
    }

    pub fn pop(&self) -> Option<MasterMessage> {
        self.pending().pop_first().map(|(_, message)| message)
    }

    pub fn len(&self) -> usize {
        self.pending().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn next(&self) -> MasterMessage {
        loop {
            if let Some(message) = self.pop() {
                return message;
            }
            self.available.notified().await;
        }
    }
}

/// Work the health monitor hands to the election.
#[derive(Debug, Clone)]
pub enum ElectionCommand {
    MemberRemoved {
        member: MemberAdvertisement,
        kind: ViewEventKind,
        was_master: bool,
    },
    CheckMissedEvents {
        master: MemberId,
        master_view_id: u64,
    },
    ForceElection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SequenceCheck {
    Apply,
    Replay,
    Duplicate,
    Stale,
}

pub struct MasterElection {
    context: Arc<GroupContext>,
    view_manager: Arc<ViewManager>,
    health: Arc<HealthMonitor>,
    broadcast: Arc<ReliableBroadcast>,
    queue: MasterMessageQueue,
    processed: Mutex<ProcessedMasterViewIds>,
    discovered: Notify,
    discovery_lock: Mutex<()>,
    self_commands: mpsc::UnboundedSender<ElectionCommand>,
    commands: Mutex<Option<mpsc::UnboundedReceiver<ElectionCommand>>>,
}

impl MasterElection {
    pub fn new(
        context: Arc<GroupContext>,
        view_manager: Arc<ViewManager>,
        health: Arc<HealthMonitor>,
        broadcast: Arc<ReliableBroadcast>,
        commands: (mpsc::UnboundedSender<ElectionCommand>, mpsc::UnboundedReceiver<ElectionCommand>),
    ) -> Self {
        let (self_commands, receiver) = commands;
        Self {
            context,
            view_manager,
            health,
            broadcast,
            queue: MasterMessageQueue::default(),
            processed: Mutex::new(ProcessedMasterViewIds::default()),
            discovered: Notify::new(),
            discovery_lock: Mutex::new(()),
            self_commands,
            commands: Mutex::new(Some(receiver)),
        }
    }

    fn local(&self) -> &MemberAdvertisement {
        &self.context.local
    }

    fn state(&self) -> &MasterState {
        &self.context.master_state
    }

    // ---- discovery ----

    /// Query for an existing master up to `discovery_attempts` times, then
    /// appoint the most senior known member. Concurrent calls collapse into
    /// the one already running.
    pub async fn discover_master(&self) -> Result<()> {
        let _guard = match self.discovery_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("master discovery already running");
                return Ok(());
            }
        };
        let state = self.state();
        let mut shutdown = self.context.shutdown_signal();
        state.set_discovery_in_progress(true);
        let attempts = self.context.config.discovery_attempts;

        for attempt in 1..=attempts {
            // registered before the checks so an answer racing the query still wakes us
            let discovered = self.discovered.notified();
            if state.master_assigned() || self.context.is_shutting_down() {
                break;
            }
            debug!(attempt, attempts, "querying for master");
            self.send_master_query().await;

            let wait = self.discovery_wait();
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = time::timeout(wait, discovered) => {}
            }
        }

        let result = if !state.master_assigned() && !self.context.is_shutting_down() {
            self.appoint_master().await
        } else {
            Ok(())
        };
        state.set_discovery_in_progress(false);
        result
    }

    fn discovery_wait(&self) -> Duration {
        let base = self.context.config.discovery_timeout();
        let spread = (base.as_millis() as u64 / 10).max(1);
        let jitter = rand::thread_rng().gen_range(0..=spread);
        base + Duration::from_millis(jitter)
    }

    async fn send_master_query(&self) {
        let query = MasterMessage::new(
            self.local().clone(),
            self.state().master_view_id(),
            MasterMessageKind::MasterQuery,
        );
        if let Err(e) = self.context.transport.broadcast(GroupMessage::Master(query)).await {
            self.context
                .send_failures
                .report_send_failure("broadcast", "master query", &e);
        }
    }

    /// Nobody claimed mastership: appoint the most senior known member.
    pub async fn appoint_master(&self) -> Result<()> {
        let candidate = self.view_manager.get_master_candidate().await;
        if candidate.id == self.local().id {
            info!("no master answered, assuming mastership");
            self.become_master().await
        } else {
            info!(candidate = %candidate.id, "no master answered, appointing senior member");
            self.view_manager.set_master(&candidate, true).await;
            self.state().set_master_assigned(true);
            Ok(())
        }
    }

    async fn become_master(&self) -> Result<()> {
        let state = self.state();
        state.set_is_master(true);
        state.set_master_assigned(true);
        self.view_manager.set_master(self.local(), true).await;
        self.discovered.notify_waiters();
        self.announce_master().await
    }

    /// Broadcast a master announcement carrying the full view.
    pub async fn announce_master(&self) -> Result<()> {
        let view = self.view_manager.members().await;
        let seq = self.state().next_master_view_id();
        let announcement = MasterMessage::new(
            self.local().clone(),
            seq,
            MasterMessageKind::MasterAnnouncement {
                view,
                event: Some(ViewEvent::new(ViewEventKind::MasterChange, self.local().clone())),
            },
        );
        info!(seq, "announcing mastership");
        self.broadcast.broadcast(announcement).await
    }

    /// Apply `event` locally and distribute the current view under the next
    /// master view id. Only the master announces views.
    pub async fn announce_view(&self, event: ViewEvent) -> Result<()> {
        if !self.state().is_master() {
            return Ok(());
        }
        let members = self.view_manager.members().await;
        self.view_manager.add_to_view(&members, true, &event).await;
        let seq = self.state().next_master_view_id();
        debug!(seq, event = %event.kind, member = %event.member.id, "announcing view change");
        let change = MasterMessage::new(
            self.local().clone(),
            seq,
            MasterMessageKind::ViewChange { view: members, event },
        );
        self.broadcast.broadcast(change).await
    }

    /// Master only: tell every member the initial group is complete.
    pub async fn announce_group_startup_complete(&self) -> Result<()> {
        if !self.state().is_master() {
            return Err(crate::error::GroupError::NotMaster.into());
        }
        self.state().set_group_startup_complete(true);
        let members = self.view_manager.members().await;
        let message = MasterMessage::new(
            self.local().clone(),
            self.state().master_view_id(),
            MasterMessageKind::GroupStartupComplete { members },
        );
        self.context
            .transport
            .broadcast(GroupMessage::Master(message))
            .await
    }

    // ---- inbound ----

    pub fn enqueue(&self, message: MasterMessage) {
        trace!(kind = message.kind.name(), from = %message.source.id, seq = message.master_view_id, "queued master message");
        self.queue.push(message);
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub async fn run_processor(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                message = self.queue.next() => {
                    self.handle_message(message).await;
                }
            }
        }
        debug!("master message processor stopped");
    }

    /// Process one master protocol message.
    pub async fn handle_message(&self, message: MasterMessage) {
        if message.source.id == self.local().id {
            return;
        }
        if self.health.is_dead_incarnation(&message.source).await {
            debug!(from = %message.source.id, kind = message.kind.name(), "ignoring message from a failed incarnation");
            return;
        }
        trace!(from = %message.source.id, kind = message.kind.name(), seq = message.master_view_id, "processing master message");

        match message.kind.clone() {
            MasterMessageKind::ResendRequest { missed } => self.process_resend_request(&message, missed).await,
            MasterMessageKind::MasterQuery => self.process_master_query(&message).await,
            MasterMessageKind::NodeQuery => self.process_node_query(&message).await,
            MasterMessageKind::NodeResponse => self.process_node_response(&message).await,
            MasterMessageKind::GroupStartupComplete { members } => {
                self.process_group_startup_complete(&message, members).await
            }
            MasterMessageKind::MasterResponse { view, event }
            | MasterMessageKind::MasterAnnouncement { view, event } => {
                self.process_master_view(&message, view, event).await
            }
            MasterMessageKind::MasterCollision => self.process_master_collision(&message).await,
            MasterMessageKind::ViewChange { view, event } => {
                self.process_view_change(&message, view, event).await
            }
        }
    }

    async fn process_resend_request(&self, message: &MasterMessage, missed: Vec<u64>) {
        if !self.state().is_master() {
            debug!(from = %message.source.id, "resend request received but not master");
            return;
        }
        info!(from = %message.source.id, ?missed, "resending missed view changes");
        for seq in missed {
            self.broadcast.resend(&message.source.id, seq).await;
        }
    }

    async fn process_master_query(&self, message: &MasterMessage) {
        let source = &message.source;
        self.check_restart(source).await;
        let added = self.view_manager.add(source).await;

        if self.state().is_master() {
            let view = self.view_manager.members().await;
            let response = MasterMessage::new(
                self.local().clone(),
                self.state().master_view_id(),
                MasterMessageKind::MasterResponse {
                    view,
                    event: Some(ViewEvent::new(ViewEventKind::Add, source.clone())),
                },
            );
            self.send_to(&source.id, response, "master response").await;
            if added {
                self.announce_view_logged(ViewEvent::new(ViewEventKind::Add, source.clone())).await;
            }
        } else {
            self.send_node_response(&source.id).await;
        }
    }

    async fn process_node_query(&self, message: &MasterMessage) {
        let source = &message.source;
        self.check_restart(source).await;
        let added = self.view_manager.add(source).await;
        self.send_node_response(&source.id).await;
        if added && self.state().is_master() {
            self.announce_view_logged(ViewEvent::new(ViewEventKind::Add, source.clone())).await;
        }
    }

    async fn process_node_response(&self, message: &MasterMessage) {
        let source = &message.source;
        self.check_restart(source).await;
        let added = self.view_manager.add(source).await;
        if added && self.state().is_master() {
            self.announce_view_logged(ViewEvent::new(ViewEventKind::Add, source.clone())).await;
        }
    }

    async fn process_group_startup_complete(&self, message: &MasterMessage, members: Vec<MemberAdvertisement>) {
        if !self.view_manager.is_master(&message.source.id).await {
            warn!(from = %message.source.id, "ignoring group startup complete from a non-master");
            return;
        }
        for member in &members {
            self.view_manager.add(member).await;
        }
        self.state().set_group_startup_complete(true);
        info!(members = members.len(), "group startup complete");
    }

    async fn process_master_view(
        &self,
        message: &MasterMessage,
        view: Vec<MemberAdvertisement>,
        event: Option<ViewEvent>,
    ) {
        let source = &message.source;
        self.check_restart(source).await;

        if self.state().is_master() {
            self.resolve_collision(source, true).await;
            return;
        }

        if let Some(current) = self.view_manager.master().await {
            if current.id != source.id && current.is_senior_to(source) && self.state().master_assigned() {
                if self.master_still_alive(&current, &view).await {
                    debug!(from = %source.id, master = %current.id, "ignoring master claim from junior member");
                    return;
                }
                self.abandon_master(&current, source).await;
            }
        }

        let check = self.check_sequence(message).await;
        if check == SequenceCheck::Duplicate || check == SequenceCheck::Stale {
            return;
        }

        self.view_manager.set_master(source, true).await;
        self.state().set_master_assigned(true);
        self.discovered.notify_waiters();

        if !view.iter().any(|member| member.id == self.local().id) {
            info!(master = %source.id, "master view omits the local member, re-announcing");
            self.send_node_response(&source.id).await;
            return;
        }

        // the master change itself was delivered by set_master
        let event = match event {
            Some(event) if event.kind != ViewEventKind::MasterChange => event,
            _ => ViewEvent::new(ViewEventKind::Add, source.clone()),
        };
        if check == SequenceCheck::Replay {
            self.view_manager.notify_listeners(event).await;
        } else {
            self.view_manager.add_to_view(&view, true, &event).await;
        }
    }

    async fn process_master_collision(&self, message: &MasterMessage) {
        let source = &message.source;
        self.check_restart(source).await;
        self.view_manager.add(source).await;
        if self.state().is_master() {
            self.resolve_collision(source, false).await;
        }
    }

    async fn process_view_change(&self, message: &MasterMessage, view: Vec<MemberAdvertisement>, event: ViewEvent) {
        let source = &message.source;
        if !self.view_manager.is_master(&source.id).await {
            debug!(from = %source.id, "ignoring view change from a member that is not master");
            return;
        }
        match self.check_sequence(message).await {
            SequenceCheck::Apply => {
                if !view.iter().any(|member| member.id == self.local().id) {
                    info!(master = %source.id, "view change omits the local member, re-announcing");
                    self.send_node_response(&source.id).await;
                    return;
                }
                self.view_manager.add_to_view(&view, true, &event).await;
            }
            SequenceCheck::Replay => {
                self.view_manager.notify_listeners(event).await;
            }
            SequenceCheck::Duplicate | SequenceCheck::Stale => {}
        }
    }

    /// Decide how an authoritative view from `message.source` relates to what
    /// was already applied, recording it when it is new.
    async fn check_sequence(&self, message: &MasterMessage) -> SequenceCheck {
        let state = self.state();
        let seq = message.master_view_id;
        let master = &message.source.id;
        let now = Instant::now();
        let mut processed = self.processed.lock().await;
        processed.prune(now);
        let expires_at = now + self.context.config.processed_view_expiry();

        if processed.contains(master, seq) {
            trace!(from = %master, seq, "duplicate master view id");
            return SequenceCheck::Duplicate;
        }

        // a master claim starts a new baseline; ids from different masters are unrelated
        let switching = !self.view_manager.is_master(master).await;
        let baseline = !message.resend
            && matches!(
                message.kind,
                MasterMessageKind::MasterAnnouncement { .. } | MasterMessageKind::MasterResponse { .. }
            );
        if state.discovery_in_progress() || switching || baseline {
            processed.record(master, seq, expires_at);
            state.set_master_view_id(seq);
            return SequenceCheck::Apply;
        }

        let last = state.master_view_id();
        if seq > last {
            processed.record(master, seq, expires_at);
            state.set_master_view_id(seq);
            SequenceCheck::Apply
        } else if message.resend {
            processed.record(master, seq, expires_at);
            debug!(from = %master, seq, last, "late resend, delivering its event only");
            SequenceCheck::Replay
        } else {
            debug!(from = %master, seq, last, "discarding stale master view");
            SequenceCheck::Stale
        }
    }

    /// Compare a heartbeat's stamped id with the last applied one and request
    /// every id in between that was never processed, in a single request.
    pub async fn check_for_missed_master_change_events(&self, master: &MemberId, stamped: u64) -> Vec<u64> {
        let state = self.state();
        if state.is_master() || state.discovery_in_progress() {
            return Vec::new();
        }
        let last = state.master_view_id();
        if stamped <= last + 1 {
            return Vec::new();
        }
        let missed: Vec<u64> = {
            let processed = self.processed.lock().await;
            (last + 1..=stamped)
                .filter(|seq| !processed.contains(master, *seq))
                .collect()
        };
        if missed.is_empty() {
            return missed;
        }
        warn!(master = %master, last, stamped, ?missed, "missed master view changes, requesting resend");
        let request = MasterMessage::new(
            self.local().clone(),
            last,
            MasterMessageKind::ResendRequest { missed: missed.clone() },
        );
        self.send_to(master, request, "resend request").await;
        missed
    }

    // Evidence that `master` is still serving: the claimed view lists it, or it
    // heartbeats within the suspicion threshold and answers a probe.
    async fn master_still_alive(&self, master: &MemberAdvertisement, claimed_view: &[MemberAdvertisement]) -> bool {
        if claimed_view.iter().any(|member| member.is_same_incarnation(master)) {
            return true;
        }
        let heartbeating = match self.health.entry(&master.id).await {
            Some(entry) => {
                entry.member.is_same_incarnation(master)
                    && entry.state.is_live()
                    && entry.last_update.elapsed() < self.context.config.suspicion_threshold()
            }
            None => false,
        };
        heartbeating && self.health.is_connected(master).await
    }

    // The master left without its DEAD report reaching us and a junior member
    // took over: drop the old master locally so the claim can be applied.
    async fn abandon_master(&self, master: &MemberAdvertisement, claimant: &MemberAdvertisement) {
        warn!(master = %master.id, claimant = %claimant.id, "master is gone, following the new claim");
        self.view_manager.clear_master().await;
        self.state().set_master_assigned(false);
        self.processed.lock().await.forget_master(&master.id);
        let failed = self.health.mark_departed(master).await;
        self.view_manager.remove(master).await;
        self.context.send_failures.clear(master.id.as_str());
        if failed {
            self.view_manager
                .notify_listeners(ViewEvent::new(ViewEventKind::Failure, master.clone()))
                .await;
        }
    }

    // ---- collisions and restarts ----

    /// Two members both claim mastership: the junior resigns, the senior
    /// re-asserts. `reply` sends our own claim to the other side.
    async fn resolve_collision(&self, other: &MemberAdvertisement, reply: bool) {
        warn!(other = %other.id, "master collision detected");
        if reply {
            let collision = MasterMessage::new(
                self.local().clone(),
                self.state().master_view_id(),
                MasterMessageKind::MasterCollision,
            );
            self.send_to(&other.id, collision, "master collision").await;
        }

        if other.is_senior_to(self.local()) {
            // the senior re-announces once it hears from us; its ids replace ours
            info!(master = %other.id, "resigning mastership to senior member");
            self.state().set_is_master(false);
            self.state().set_master_assigned(false);
            self.view_manager.clear_master().await;
            self.view_manager.add(other).await;
            self.send_node_response(&other.id).await;
        } else {
            self.view_manager.add(other).await;
            if let Err(e) = self.announce_master().await {
                self.context
                    .send_failures
                    .report_send_failure("broadcast", "master announcement", &e);
            }
        }
    }

    /// Detect a member that came back with a newer start time. Its old
    /// incarnation is purged, and when it was master a new election starts.
    pub async fn check_restart(&self, source: &MemberAdvertisement) -> bool {
        let cached = match self.view_manager.get(&source.id).await {
            Some(cached) => Some(cached),
            None => self.health.entry(&source.id).await.map(|entry| entry.member),
        };
        let cached = match cached {
            Some(cached) if confirm_instance_has_restarted(&cached, source) => cached,
            _ => return false,
        };

        let was_master = self
            .view_manager
            .master()
            .await
            .map(|master| master.is_same_incarnation(&cached))
            .unwrap_or(false);
        warn!(
            member = %source.id,
            old_start = cached.start_time,
            new_start = source.start_time,
            was_master,
            "member restarted"
        );
        self.health.purge(&source.id).await;
        self.view_manager.add(source).await;
        if was_master {
            self.processed.lock().await.forget_master(&source.id);
            let _ = self.self_commands.send(ElectionCommand::ForceElection);
        } else if self.state().is_master() {
            self.announce_view_logged(ViewEvent::new(ViewEventKind::Add, source.clone())).await;
        }
        true
    }

    // ---- commands ----

    pub async fn run_command_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut commands = match self.commands.lock().await.take() {
            Some(commands) => commands,
            None => {
                error!("election command loop already running");
                return;
            }
        };
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                command = commands.recv() => match command {
                    Some(command) => self.clone().handle_command(command).await,
                    None => break,
                },
            }
        }
        debug!("election command loop stopped");
    }

    pub async fn handle_command(self: Arc<Self>, command: ElectionCommand) {
        match command {
            ElectionCommand::MemberRemoved { member, kind, was_master } => {
                if was_master && kind != ViewEventKind::ClusterStop {
                    info!(master = %member.id, event = %kind, "master left the group");
                    self.force_election().await;
                } else if self.state().is_master() {
                    self.announce_view_logged(ViewEvent::new(kind, member)).await;
                }
            }
            ElectionCommand::CheckMissedEvents { master, master_view_id } => {
                self.check_for_missed_master_change_events(&master, master_view_id)
                    .await;
            }
            ElectionCommand::ForceElection => self.force_election().await,
        }
    }

    async fn force_election(self: Arc<Self>) {
        if self.context.is_shutting_down() {
            return;
        }
        self.state().set_master_assigned(false);
        self.view_manager.clear_master().await;
        tokio::spawn(async move {
            if let Err(e) = self.discover_master().await {
                error!("master election failed: {:#}", e);
            }
        });
    }

    // ---- helpers ----

    async fn announce_view_logged(&self, event: ViewEvent) {
        if let Err(e) = self.announce_view(event).await {
            self.context
                .send_failures
                .report_send_failure("broadcast", "view change", &e);
        }
    }

    async fn send_node_response(&self, to: &MemberId) {
        let response = MasterMessage::new(
            self.local().clone(),
            self.state().master_view_id(),
            MasterMessageKind::NodeResponse,
        );
        self.send_to(to, response, "node response").await;
    }

    async fn send_to(&self, to: &MemberId, message: MasterMessage, what: &str) {
        if let Err(e) = self.context.transport.send(to, GroupMessage::Master(message)).await {
            self.context
                .send_failures
                .report_send_failure(to.as_str(), what, &e);
        }
    }
}
