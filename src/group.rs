use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broadcast::ReliableBroadcast;
use crate::config::GroupConfig;
use crate::election::{MasterElection, MasterState};
use crate::health_monitor::{HealthMonitor, MemberState};
use crate::logging::FailureReportLimiter;
use crate::member::{MemberAdvertisement, MemberId};
use crate::message::{Envelope, GroupMessage};
use crate::transport::{Prober, Transport};
use crate::view::{ClusterView, ViewListener};
use crate::view_manager::ViewManager;

// How long shutdown waits for background tasks before aborting them
const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// How a member leaves the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopKind {
    /// This member alone is leaving.
    Peer,
    /// The whole group is being shut down.
    Cluster,
}

impl std::fmt::Display for StopKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopKind::Peer => write!(f, "peer"),
            StopKind::Cluster => write!(f, "cluster"),
        }
    }
}

/// State shared by every component of one group member.
pub struct GroupContext {
    pub config: GroupConfig,
    pub local: MemberAdvertisement,
    pub transport: Arc<dyn Transport>,
    pub master_state: MasterState,
    pub send_failures: FailureReportLimiter,
    shutdown: watch::Sender<bool>,
}

impl GroupContext {
    pub fn new(config: GroupConfig, local: MemberAdvertisement, transport: Arc<dyn Transport>) -> Arc<Self> {
        let send_failures = FailureReportLimiter::new(config.failure_report_cooldown());
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            config,
            local,
            transport,
            master_state: MasterState::default(),
            send_failures,
            shutdown,
        })
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub(crate) fn signal_shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

/// One member of a group: membership view, failure detection, master
/// election and view distribution wired together over a transport.
pub struct GroupService {
    context: Arc<GroupContext>,
    view_manager: Arc<ViewManager>,
    health: Arc<HealthMonitor>,
    election: Arc<MasterElection>,
    broadcast: Arc<ReliableBroadcast>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl GroupService {
    pub fn new(
        config: GroupConfig,
        local: MemberAdvertisement,
        transport: Arc<dyn Transport>,
        prober: Arc<dyn Prober>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let context = GroupContext::new(config, local, transport);
        let view_manager = Arc::new(ViewManager::new(context.clone()));
        let broadcast = Arc::new(ReliableBroadcast::new(context.clone()));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let health = Arc::new(HealthMonitor::new(
            context.clone(),
            view_manager.clone(),
            prober,
            commands_tx.clone(),
        ));
        let election = Arc::new(MasterElection::new(
            context.clone(),
            view_manager.clone(),
            health.clone(),
            broadcast.clone(),
            (commands_tx, commands_rx),
        ));

        Ok(Arc::new(Self {
            context,
            view_manager,
            health,
            election,
            broadcast,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }))
    }

    /// Attach to the transport, start every background loop and begin master
    /// discovery.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(
            member = %self.context.local.id,
            group = %self.context.config.group_name,
            "starting group member"
        );

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        self.context.transport.add_message_listener(inbound_tx);

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(
            self.clone().run_dispatcher(inbound_rx, self.context.shutdown_signal()),
        ));
        tasks.push(tokio::spawn(
            self.election.clone().run_processor(self.context.shutdown_signal()),
        ));
        tasks.push(tokio::spawn(
            self.election.clone().run_command_loop(self.context.shutdown_signal()),
        ));
        tasks.push(tokio::spawn(
            self.health.clone().run_reporter(self.context.shutdown_signal()),
        ));
        tasks.push(tokio::spawn(
            self.health.clone().run_suspicion_loop(self.context.shutdown_signal()),
        ));
        tasks.push(tokio::spawn(
            self.health.clone().run_failure_verifier(self.context.shutdown_signal()),
        ));
        tasks.push(tokio::spawn(
            self.broadcast.clone().run_reaper(self.context.shutdown_signal()),
        ));

        let election = self.election.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = election.discover_master().await {
                warn!("initial master discovery failed: {:#}", e);
            }
        }));
        Ok(())
    }

    // Route inbound messages: health traffic straight to the monitor, master
    // traffic through the ordered queue.
    async fn run_dispatcher(
        self: Arc<Self>,
        mut inbound: mpsc::UnboundedReceiver<Envelope>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                envelope = inbound.recv() => match envelope {
                    Some(envelope) => self.dispatch(envelope).await,
                    None => break,
                },
            }
        }
        debug!("dispatcher stopped");
    }

    async fn dispatch(&self, envelope: Envelope) {
        let Envelope { from, message } = envelope;
        match message {
            GroupMessage::Health(health) => {
                if health.source != from {
                    warn!(from = %from, source = %health.source, "dropping health message with mismatched source");
                    return;
                }
                self.health.process(health).await;
            }
            GroupMessage::Master(master) => {
                if master.source.id != from {
                    warn!(from = %from, source = %master.source.id, "dropping master message with mismatched source");
                    return;
                }
                self.election.enqueue(master);
            }
        }
    }

    /// Leave the group: report the stopping state, then stop every loop.
    pub async fn shutdown(&self, kind: StopKind) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(member = %self.context.local.id, kind = %kind, "shutting down group member");
        self.health.stop(kind).await;
        self.context.signal_shutdown();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(TASK_JOIN_TIMEOUT, task).await.is_err() {
                warn!("background task did not stop in time, aborting");
                abort.abort();
            }
        }
        Ok(())
    }

    pub fn context(&self) -> &Arc<GroupContext> {
        &self.context
    }

    pub fn local(&self) -> &MemberAdvertisement {
        &self.context.local
    }

    pub fn view_manager(&self) -> &Arc<ViewManager> {
        &self.view_manager
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn election(&self) -> &Arc<MasterElection> {
        &self.election
    }

    pub fn add_listener(&self, listener: ViewListener) {
        self.view_manager.add_listener(listener);
    }

    pub async fn view(&self) -> ClusterView {
        self.view_manager.get_local_view().await
    }

    pub async fn master(&self) -> Option<MemberAdvertisement> {
        self.view_manager.master().await
    }

    pub fn is_master(&self) -> bool {
        self.context.master_state.is_master()
    }

    pub fn group_startup_complete(&self) -> bool {
        self.context.master_state.group_startup_complete()
    }

    pub async fn member_state(&self, id: &MemberId) -> Option<MemberState> {
        self.health.member_state(id).await
    }

    pub async fn report_joined_and_ready(&self) -> Result<()> {
        self.health.report_joined_and_ready().await
    }

    /// Failure asserted by an external watchdog. Fails with `NotMaster` on any
    /// member other than the master.
    pub async fn watchdog_failure(&self, id: &MemberId) -> Result<bool> {
        self.health.watchdog_failure(id).await
    }

    pub async fn announce_group_startup_complete(&self) -> Result<()> {
        self.election.announce_group_startup_complete().await
    }
}
