use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::group::GroupContext;
use crate::member::{confirm_instance_has_restarted, MemberAdvertisement, MemberId};
use crate::view::{ClusterView, ViewEvent, ViewEventKind, ViewListener};

#[derive(Debug, Default)]
struct ViewState {
    members: BTreeMap<MemberId, MemberAdvertisement>,
    master: Option<MemberAdvertisement>,
    // previous start time of members that restarted, consumed by the next ADD event
    rejoins: HashMap<MemberId, u64>,
    // newest incarnation whose terminal event went out, and when
    delivered_terminal: HashMap<MemberId, (u64, Instant)>,
    // membership as of the last authoritative view, id -> start time
    announced: BTreeMap<MemberId, u64>,
}

/// Owner of the live cluster membership table.
///
/// Every mutation goes through one lock; listeners are invoked after the
/// lock is released with a fresh snapshot.
pub struct ViewManager {
    context: Arc<GroupContext>,
    state: Mutex<ViewState>,
    listeners: RwLock<Vec<ViewListener>>,
    view_id: AtomicU64,
}

impl ViewManager {
    pub fn new(context: Arc<GroupContext>) -> Self {
        let mut members = BTreeMap::new();
        members.insert(context.local.id.clone(), context.local.clone());
        Self {
            context,
            state: Mutex::new(ViewState {
                members,
                ..ViewState::default()
            }),
            listeners: RwLock::new(Vec::new()),
            view_id: AtomicU64::new(0),
        }
    }

    pub fn local(&self) -> &MemberAdvertisement {
        &self.context.local
    }

    /// Insert a member. A known id with a different start time is a restart and
    /// replaces the stale incarnation. Returns whether the table changed.
    pub async fn add(&self, advertisement: &MemberAdvertisement) -> bool {
        let mut state = self.state.lock().await;
        match state.members.get(&advertisement.id).cloned() {
            None => {
                state.members.insert(advertisement.id.clone(), advertisement.clone());
                drop(state);
                self.context.transport.add_remote_peer(advertisement);
                debug!(member = %advertisement.id, "added member to view");
                true
            }
            Some(cached) if confirm_instance_has_restarted(&cached, advertisement) => {
                info!(
                    member = %advertisement.id,
                    old_start = cached.start_time,
                    new_start = advertisement.start_time,
                    "member restarted, replacing stale incarnation"
                );
                state.rejoins.insert(advertisement.id.clone(), cached.start_time);
                state.members.insert(advertisement.id.clone(), advertisement.clone());
                if state
                    .master
                    .as_ref()
                    .map(|master| master.is_same_incarnation(&cached))
                    .unwrap_or(false)
                {
                    state.master = None;
                }
                drop(state);
                self.context.transport.remove_peer(&cached.id);
                self.context.transport.add_remote_peer(advertisement);
                true
            }
            Some(_) => false,
        }
    }

    /// Remove a member on confirmed failure or stop. A newer incarnation of the
    /// same id is left in place.
    pub async fn remove(&self, advertisement: &MemberAdvertisement) -> Option<MemberAdvertisement> {
        let mut state = self.state.lock().await;
        let removable = state
            .members
            .get(&advertisement.id)
            .map(|cached| cached.start_time <= advertisement.start_time)
            .unwrap_or(false);
        if !removable {
            return None;
        }
        let removed = state.members.remove(&advertisement.id);
        state.announced.remove(&advertisement.id);
        drop(state);
        if removed.is_some() {
            self.context.transport.remove_peer(&advertisement.id);
            debug!(member = %advertisement.id, "removed member from view");
        }
        removed
    }

    /// Install `advertisement` as master. No-op when that id already is master.
    pub async fn set_master(&self, advertisement: &MemberAdvertisement, notify: bool) -> bool {
        {
            let mut state = self.state.lock().await;
            if state.master.as_ref().map(|m| m.id == advertisement.id).unwrap_or(false) {
                return false;
            }
            state.master = Some(advertisement.clone());
            let known = state.members.contains_key(&advertisement.id);
            state.members.insert(advertisement.id.clone(), advertisement.clone());
            if !known {
                self.context.transport.add_remote_peer(advertisement);
            }
        }
        info!(master = %advertisement.id, "master is now {}", advertisement);
        if notify {
            self.notify_listeners(ViewEvent::new(ViewEventKind::MasterChange, advertisement.clone()))
                .await;
        }
        true
    }

    pub async fn clear_master(&self) -> Option<MemberAdvertisement> {
        self.state.lock().await.master.take()
    }

    pub async fn master(&self) -> Option<MemberAdvertisement> {
        self.state.lock().await.master.clone()
    }

    pub async fn is_master(&self, id: &MemberId) -> bool {
        self.state
            .lock()
            .await
            .master
            .as_ref()
            .map(|master| &master.id == id)
            .unwrap_or(false)
    }

    pub async fn contains(&self, id: &MemberId) -> bool {
        self.state.lock().await.members.contains_key(id)
    }

    pub async fn get(&self, id: &MemberId) -> Option<MemberAdvertisement> {
        self.state.lock().await.members.get(id).cloned()
    }

    pub async fn members(&self) -> Vec<MemberAdvertisement> {
        self.state.lock().await.members.values().cloned().collect()
    }

    /// Point-in-time copy of the view tagged with a fresh local view id.
    pub async fn get_local_view(&self) -> ClusterView {
        let state = self.state.lock().await;
        let view_id = self.view_id.fetch_add(1, Ordering::SeqCst) + 1;
        ClusterView::new(
            state.members.clone(),
            view_id,
            self.context.master_state.master_view_id(),
            state.master.as_ref().map(|m| m.id.clone()),
        )
    }

    /// Replace the table with `new_view`, keeping the local member. Listeners
    /// hear about it only for authoritative views that changed something or
    /// carry an event other than a plain ADD. A member counts as new to an
    /// authoritative view until an authoritative view has included it, even if
    /// a query round trip put it in the table earlier.
    pub async fn add_to_view(
        &self,
        new_view: &[MemberAdvertisement],
        authoritative: bool,
        event: &ViewEvent,
    ) -> bool {
        let mut added = Vec::new();
        let changed = {
            let mut state = self.state.lock().await;
            let previous = std::mem::take(&mut state.members);
            let mut changed = false;
            for advertisement in new_view {
                match previous.get(&advertisement.id) {
                    Some(known) if known.start_time == advertisement.start_time => {}
                    Some(known) if known.start_time > advertisement.start_time => {
                        // keep the newer incarnation we already know about
                        state.members.insert(known.id.clone(), known.clone());
                        continue;
                    }
                    Some(known) => {
                        state.rejoins.insert(known.id.clone(), known.start_time);
                        changed = true;
                        added.push(advertisement.clone());
                    }
                    None => {
                        changed = true;
                        added.push(advertisement.clone());
                    }
                }
                if authoritative && state.announced.get(&advertisement.id) != Some(&advertisement.start_time) {
                    changed = true;
                }
                state.members.insert(advertisement.id.clone(), advertisement.clone());
            }
            let local = &self.context.local;
            if !state.members.contains_key(&local.id) {
                state.members.insert(local.id.clone(), local.clone());
            }
            if authoritative {
                state.announced = state
                    .members
                    .values()
                    .map(|member| (member.id.clone(), member.start_time))
                    .collect();
            }
            changed
        };

        for advertisement in &added {
            self.context.transport.add_remote_peer(advertisement);
        }

        debug!(
            members = new_view.len(),
            changed,
            authoritative,
            event = %event.kind,
            "applied view"
        );

        if authoritative && (changed || event.kind != ViewEventKind::Add) {
            let event = if event.kind == ViewEventKind::Add {
                let previous = self.take_rejoin(&event.member.id).await;
                event.clone().with_previous_start_time(previous.or(event.previous_start_time))
            } else {
                event.clone()
            };
            self.notify_listeners(event).await;
        }
        changed
    }

    /// The most senior known member, or the local member when none resolves.
    pub async fn get_master_candidate(&self) -> MemberAdvertisement {
        self.master_candidate_excluding(None).await
    }

    /// Like `get_master_candidate` but ignoring one member, used when judging
    /// who takes over from a failing master.
    pub async fn master_candidate_excluding(&self, excluded: Option<&MemberId>) -> MemberAdvertisement {
        let state = self.state.lock().await;
        state
            .members
            .values()
            .filter(|member| Some(&member.id) != excluded)
            .min_by(|a, b| a.seniority_cmp(b))
            .cloned()
            .unwrap_or_else(|| self.context.local.clone())
    }

    /// Consume the rejoin marker recorded when `id` was replaced by a restart.
    pub async fn take_rejoin(&self, id: &MemberId) -> Option<u64> {
        self.state.lock().await.rejoins.remove(id)
    }

    pub fn add_listener(&self, listener: ViewListener) {
        match self.listeners.write() {
            Ok(mut listeners) => listeners.push(listener),
            Err(poisoned) => poisoned.into_inner().push(listener),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().map(|l| l.len()).unwrap_or(0)
    }

    /// Deliver `event` to every listener in registration order.
    ///
    /// Only one terminal event (FAILURE, PEER_STOP or CLUSTER_STOP) is
    /// delivered per member incarnation, and none for an incarnation older
    /// than one already reported. A panicking listener is logged and does not
    /// stop the others.
    pub async fn notify_listeners(&self, event: ViewEvent) -> bool {
        if event.kind.is_terminal() {
            let now = Instant::now();
            let retention = self.context.config.processed_view_expiry();
            let mut state = self.state.lock().await;
            state
                .delivered_terminal
                .retain(|_, (_, delivered_at)| now.saturating_duration_since(*delivered_at) < retention);
            let delivered = state
                .delivered_terminal
                .get(&event.member.id)
                .map(|(start_time, _)| *start_time >= event.member.start_time)
                .unwrap_or(false);
            if delivered {
                debug!(member = %event.member.id, event = %event.kind, "terminal event already delivered");
                return false;
            }
            state
                .delivered_terminal
                .insert(event.member.id.clone(), (event.member.start_time, now));
        }

        let snapshot = self.get_local_view().await;
        let listeners: Vec<ViewListener> = match self.listeners.read() {
            Ok(listeners) => listeners.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };

        info!(
            event = %event.kind,
            member = %event.member.id,
            view_size = snapshot.size(),
            "notifying {} listener(s)",
            listeners.len()
        );

        for (index, listener) in listeners.iter().enumerate() {
            let outcome = catch_unwind(AssertUnwindSafe(|| listener(&event, &snapshot)));
            if outcome.is_err() {
                error!(listener = index, event = %event.kind, "view listener panicked");
            }
        }
        true
    }
}
