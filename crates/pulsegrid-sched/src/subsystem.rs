//! The scheduler subsystem aggregate.
//!
//! One `SchedulerSubsystem` instance, owned by the controller loop, holds
//! everything the controller knows about its scheduler daemon:
//!
//! ```text
//!   FSA actions ──▶ request_start / request_stop / invoke
//!                        │
//!                        ▼
//!   ┌────────────────────────────────────────────────┐
//!   │ SchedulerSubsystem                             │
//!   │   link state (required / connected / session)  │
//!   │   pending query + expectation table            │
//!   │   reply deadline (ReplyWatch)                  │
//!   └────────────────────────────────────────────────┘
//!        │                ▲                 ▲
//!        ▼                │                 │
//!   IPC session      SchedEvent inbox   CibReply routing
//! ```
//!
//! All mutation happens on the controller loop task: IPC callbacks and timer
//! tasks only push [`SchedEvent`]s into the inbox, and the loop feeds them
//! back through [`SchedulerSubsystem::handle_event`]. Supersession is
//! enforced by id checks (query call ids, deadline generations), never by
//! cancelling work in flight.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError};

use pulsegrid_cib::{
    keys, snapshot, CallId, CibConn, CibDocument, CibError, CibReply, CibResult, CibScope,
};
use pulsegrid_fsa::{
    ControllerState, ExitStatus, FsaAction, FsaCause, FsaHandle, FsaInput, SharedClusterView,
};
use pulsegrid_ipc::{
    Envelope, IpcClientConfig, IpcConnect, IpcError, IpcEvent, IpcEventFn, IpcResult, IpcSession,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::config::{SchedConfig, OP_CALC, SYS_CONTROLLER};
use crate::reply::ReplyWatch;

/// The subsystem's inbox. IPC callbacks and timer tasks produce these; the
/// controller loop consumes them.
#[derive(Debug, PartialEq)]
pub enum SchedEvent {
    /// Traffic from the scheduler link.
    Ipc(IpcEvent),
    /// The reply deadline of `generation` elapsed.
    ReplyTimeout { generation: u64 },
    /// The crash-snapshot query `call` used up its grace period.
    SnapshotDeadline { call: CallId },
}

/// Why a cluster-state query was issued; decides where its reply goes.
#[derive(Debug)]
enum CibExpectation {
    /// The query seeds a placement invocation.
    Invoke,
    /// The query captures crash-time state for the named incident.
    CrashSnapshot { correlation: String },
}

pub struct SchedulerSubsystem {
    config: SchedConfig,
    fsa: FsaHandle,
    cluster: SharedClusterView,
    cib: CibConn,
    connector: Arc<dyn IpcConnect>,
    events: mpsc::UnboundedSender<SchedEvent>,

    // Link state. The session handle is exclusively owned here.
    required: bool,
    connected: bool,
    peer_pid: Option<u32>,
    session: Option<Box<dyn IpcSession>>,

    // Invocation state. Only the most recent query is current; earlier
    // replies fail the id check and are dropped.
    pending_query: Option<CallId>,
    cib_expect: HashMap<CallId, CibExpectation>,
    reply: ReplyWatch,
}

impl SchedulerSubsystem {
    pub fn new(
        config: SchedConfig,
        fsa: FsaHandle,
        cluster: SharedClusterView,
        cib: CibConn,
        connector: Arc<dyn IpcConnect>,
    ) -> (Self, mpsc::UnboundedReceiver<SchedEvent>) {
        let (events, inbox) = mpsc::unbounded_channel();
        let reply = ReplyWatch::new(config.reply_timeout, events.clone());
        (
            Self {
                config,
                fsa,
                cluster,
                cib,
                connector,
                events,
                required: false,
                connected: false,
                peer_pid: None,
                session: None,
                pending_query: None,
                cib_expect: HashMap::new(),
                reply,
            },
            inbox,
        )
    }

    /// Sender feeding this subsystem's inbox; timer tasks and the IPC
    /// callback hold clones.
    pub fn event_sender(&self) -> mpsc::UnboundedSender<SchedEvent> {
        self.events.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Whether the scheduler is supposed to be running right now.
    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn peer_pid(&self) -> Option<u32> {
        self.peer_pid
    }

    /// Whether a transmitted request is still waiting for its reply.
    pub fn awaiting_reply(&self) -> bool {
        self.reply.is_armed()
    }

    /// Dispatch one inbox event.
    pub fn handle_event(&mut self, event: SchedEvent) {
        match event {
            SchedEvent::Ipc(IpcEvent::Message(bytes)) => self.on_message(&bytes),
            SchedEvent::Ipc(IpcEvent::Disconnected) => self.on_disconnect(),
            SchedEvent::ReplyTimeout { generation } => self.on_reply_timeout(generation),
            SchedEvent::SnapshotDeadline { call } => self.on_snapshot_deadline(call),
        }
    }

    /// Route a cluster-state reply to whichever expectation issued the call.
    /// The call settles only after its handler ran, so the in-flight gauge
    /// still counts it while the handler checks for concurrent updates.
    pub fn handle_cib_reply(&mut self, reply: CibReply) {
        let CibReply { call, result } = reply;
        match self.cib_expect.remove(&call) {
            Some(CibExpectation::Invoke) => {
                self.on_cib_ready(call, result);
                self.cib.settle(call);
            }
            Some(CibExpectation::CrashSnapshot { correlation }) => {
                self.on_crash_snapshot(&correlation, result);
                self.cib.settle(call);
            }
            None => trace!(call, "cluster state reply for an abandoned query"),
        }
    }

    // ── Connection lifecycle ───────────────────────────────────────────────

    /// Bring the scheduler link up. No-op when already connected; refused
    /// while the controller is stopping. A factory failure is surfaced to
    /// the FSA and not retried here.
    pub fn request_start(&mut self) {
        if self.connected {
            debug!("scheduler link already up");
            return;
        }
        if self.fsa.state() == ControllerState::Stopping {
            info!("ignoring request to connect to the scheduler while shutting down");
            return;
        }
        self.required = true;

        let ipc_config = IpcClientConfig::new(self.config.service.as_str())
            .with_max_rx_bytes(self.config.max_rx_bytes);
        let inbox = self.events.clone();
        let on_event: IpcEventFn = Arc::new(move |event| {
            // The loop may already be gone during shutdown.
            let _ = inbox.send(SchedEvent::Ipc(event));
        });

        match self.connector.connect(&ipc_config, on_event) {
            Ok(session) => {
                self.peer_pid = session.peer_pid();
                self.session = Some(session);
                self.connected = true;
                info!(
                    service = %self.config.service,
                    peer_pid = ?self.peer_pid,
                    "scheduler link established"
                );
            }
            Err(err) => {
                error!(service = %self.config.service, %err, "could not connect to the scheduler");
                self.fsa.register_error(FsaCause::Internal, FsaInput::Fail);
            }
        }
    }

    /// Tear the scheduler link down on purpose. The session close surfaces
    /// as a `Disconnected` event, which lands in the planned branch of
    /// [`Self::on_disconnect`] because `required` is already cleared.
    pub fn request_stop(&mut self) {
        self.reply.disarm("scheduler stop requested");
        self.required = false;
        if let Some(session) = self.session.take() {
            debug!(service = %self.config.service, "closing the scheduler link");
            drop(session);
        }
        self.connected = false;
        self.peer_pid = None;
    }

    /// One inbound frame from the scheduler.
    fn on_message(&mut self, bytes: &[u8]) {
        let envelope = match Envelope::from_bytes(bytes) {
            Ok(envelope) => envelope,
            Err(err) => {
                trace!(%err, len = bytes.len(), "dropping unparseable scheduler message");
                return;
            }
        };
        if self.reply.matches(&envelope.reference) {
            self.reply.disarm("awaited reply arrived");
        } else if envelope.op == OP_CALC {
            // A placement answer for a request nobody is waiting on anymore.
            info!(reference = %envelope.reference, "placement computation is obsolete");
            return;
        }
        self.fsa.route_message(FsaCause::IpcMessage, envelope);
    }

    /// The link closed, by crash or on purpose. Both paths clear the reply
    /// expectation and the link state; only an unplanned loss enters the
    /// crash diagnostics path.
    fn on_disconnect(&mut self) {
        self.reply.disarm("scheduler link closed");
        let last_pid = self.peer_pid.take();
        self.session = None;
        self.connected = false;

        if self.required {
            let correlation = Uuid::new_v4().to_string();
            error!(
                peer_pid = ?last_pid,
                %correlation,
                path = %self.snapshot_path(&correlation).display(),
                "connection to the scheduler failed, saving cluster state for postmortem"
            );
            // The connection-loss escalation is held back until the snapshot
            // query resolves or its grace period ends, so the capture sees
            // the crash-time state first.
            match self.cib.query(CibScope::Local) {
                Ok(call) => {
                    self.cib_expect
                        .insert(call, CibExpectation::CrashSnapshot { correlation });
                    let inbox = self.events.clone();
                    let grace = tokio::time::sleep(self.config.snapshot_grace);
                    tokio::spawn(async move {
                        grace.await;
                        let _ = inbox.send(SchedEvent::SnapshotDeadline { call });
                    });
                }
                Err(err) => {
                    warn!(%err, "crash-time cluster state is unavailable");
                    self.on_crash_snapshot(&correlation, Err(err));
                }
            }
        } else {
            if self.connector.supervises_peers() {
                self.connector.request_peer_stop(&self.config.service);
            }
            info!(service = %self.config.service, "connection to the scheduler released");
        }
        self.fsa.trigger();
    }

    // ── Invocation pipeline ────────────────────────────────────────────────

    /// Recompute cluster placement now. Every gate is a hard refusal; the
    /// function never blocks, it only issues the cluster-state query whose
    /// reply continues in [`Self::on_cib_ready`].
    pub fn invoke(&mut self) {
        if !self.fsa.is_coordinator() {
            error!("placement computation requested on a non-coordinator node");
            return;
        }
        if !self.connected {
            if self.fsa.is_shutting_down() {
                error!("cannot shut down gracefully without a scheduler connection");
                self.fsa
                    .register_input_before(FsaCause::Internal, FsaInput::Terminate);
            } else {
                info!("waiting for the scheduler link before computing placement");
                self.fsa.stall();
                self.fsa.register_action(FsaAction::StartScheduler);
            }
            return;
        }
        let state = self.fsa.state();
        if state != ControllerState::AwaitingPlacement {
            info!(%state, "not invoking the scheduler in this state");
            return;
        }
        if !self.fsa.cib_consistent() {
            error!("refusing to invoke the scheduler without a consistent local cluster state copy");
            self.fsa.register_error(FsaCause::Internal, FsaInput::Election);
            return;
        }

        match self.cib.query(CibScope::Local) {
            Ok(call) => {
                debug!(call, %state, "requesting the current cluster state");
                self.reply.disarm("new invocation cycle");
                self.pending_query = Some(call);
                self.cib_expect.insert(call, CibExpectation::Invoke);
            }
            Err(err) => {
                error!(%err, "could not query the cluster state");
                self.fsa.register_error(FsaCause::Internal, FsaInput::Error);
            }
        }
    }

    /// Continuation of [`Self::invoke`], running when the cluster-state
    /// query answers. Checks are ordered: failures escalate even when the
    /// query is stale, stale ids are silent, and only the current query may
    /// reach the submission branch.
    fn on_cib_ready(&mut self, call: CallId, result: CibResult<CibDocument>) {
        let mut doc = match result {
            Ok(doc) => doc,
            Err(err) => {
                error!(call, %err, "could not retrieve the cluster state");
                self.fsa.register_error(FsaCause::Internal, FsaInput::Error);
                return;
            }
        };
        if self.pending_query != Some(call) {
            trace!(call, current = ?self.pending_query, "skipping superseded cluster state query");
            return;
        }
        if !self.fsa.is_coordinator() || !self.connected {
            debug!("no need to invoke the scheduler anymore");
            return;
        }
        let state = self.fsa.state();
        if state != ControllerState::AwaitingPlacement {
            debug!(%state, "discarding scheduler invocation in this state");
            return;
        }
        // This reply counts as one of them.
        let in_flight = self.cib.in_flight();
        if in_flight > 1 {
            debug!(
                pending = in_flight - 1,
                "re-asking for the cluster state, other updates still in flight"
            );
            let fsa = self.fsa.clone();
            let delay = tokio::time::sleep(self.config.reinvoke_delay);
            tokio::spawn(async move {
                delay.await;
                fsa.register_action(FsaAction::InvokeScheduler);
            });
            return;
        }

        // Authoritative path: this document is what the scheduler will see.
        let (membership_seq, quorum) = self.decorate(&mut doc);
        let payload = match serde_json::to_value(&doc) {
            Ok(payload) => payload,
            Err(err) => {
                error!(%err, "could not serialize cluster state for the scheduler");
                self.fsa.register_error(FsaCause::Internal, FsaInput::Error);
                return;
            }
        };
        let request = Envelope::request(
            OP_CALC,
            SYS_CONTROLLER,
            self.config.service.as_str(),
            payload,
        );
        match self.transmit(&request) {
            Ok(()) => {
                self.reply.arm(request.reference.clone());
                debug!(
                    call,
                    reference = %request.reference,
                    membership_seq,
                    quorum,
                    "scheduler invoked"
                );
            }
            Err(err) => {
                error!(%err, "could not contact the scheduler");
                self.fsa.register_error(FsaCause::Internal, FsaInput::Error);
            }
        }
    }

    /// Stamp coordinator-only facts onto the outbound document and refresh
    /// the node caches from it, it being the freshest authoritative
    /// snapshot. Returns the membership sequence and quorum flag for the
    /// invocation log line.
    fn decorate(&mut self, doc: &mut CibDocument) -> (u64, bool) {
        let mut view = self
            .cluster
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        view.refresh_caches(doc);

        doc.set_attr(keys::DC_UUID, view.node_id());
        let quorum = view.has_quorum();
        doc.set_attr(keys::HAVE_QUORUM, if quorum { "1" } else { "0" });

        // Always force the watchdog property to local reality; a stale
        // persisted value must not survive into a placement run.
        let watchdog = if view.watchdog_present() { "true" } else { "false" };
        if doc.upsert_cluster_property(keys::HAVE_WATCHDOG, watchdog) == 0 {
            trace!(value = watchdog, "watchdog property created in bootstrap options");
        }

        if view.ever_had_quorum() && !quorum {
            doc.set_attr(keys::NO_QUORUM_PANIC, "1");
        }
        (view.membership_seq(), quorum)
    }

    fn transmit(&mut self, request: &Envelope) -> IpcResult<()> {
        let bytes = request.to_bytes()?;
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| IpcError::LinkDown(self.config.service.clone()))?;
        if session.send(&bytes)? == 0 {
            return Err(IpcError::LinkDown(self.config.service.clone()));
        }
        Ok(())
    }

    /// The reply deadline elapsed without the awaited reply.
    fn on_reply_timeout(&mut self, generation: u64) {
        let Some(reference) = self.reply.expire(generation) else {
            trace!(generation, "ignoring a superseded scheduler reply deadline");
            return;
        };
        if self.fsa.is_coordinator() {
            // A coordinator that cannot get scheduling answers must not keep
            // acting as one. Exit now (and likely get fenced) rather than
            // interfere with the election that has to follow.
            error!(
                %reference,
                timeout_ms = self.config.reply_timeout.as_millis() as u64,
                "scheduler did not respond, exiting to force recovery"
            );
            self.fsa.exit(ExitStatus::FatalNoRespawn);
        } else {
            debug!(%reference, "scheduler reply deadline elapsed on a non-coordinator node");
        }
    }

    // ── Crash diagnostics ──────────────────────────────────────────────────

    fn snapshot_path(&self, correlation: &str) -> PathBuf {
        self.config.state_dir.join(format!("pe-core-{correlation}.bz2"))
    }

    /// The crash-snapshot query resolved (or was abandoned). Raises the
    /// deferred connection-loss escalation first in every outcome, then
    /// writes the capture if there is one. Write failure is logged only.
    fn on_crash_snapshot(&mut self, correlation: &str, result: CibResult<CibDocument>) {
        self.fsa.register_error(FsaCause::Internal, FsaInput::Error);
        let doc = match result {
            Ok(doc) => doc,
            Err(err) => {
                warn!(%correlation, %err, "no cluster state captured for the scheduler crash");
                return;
            }
        };
        let path = self.snapshot_path(correlation);
        match snapshot::write_compressed(&doc, &path) {
            Ok(()) => {
                info!(path = %path.display(), "saved cluster state after the scheduler crash");
            }
            Err(err) => {
                error!(
                    path = %path.display(),
                    %err,
                    "could not save cluster state after the scheduler crash"
                );
            }
        }
    }

    /// The grace period for a crash-snapshot query ran out before its
    /// reply. Abandon the expectation so the deferred escalation cannot be
    /// lost; a reply arriving later finds no expectation and is dropped.
    fn on_snapshot_deadline(&mut self, call: CallId) {
        match self.cib_expect.remove(&call) {
            Some(CibExpectation::CrashSnapshot { correlation }) => {
                warn!(call, %correlation, "crash snapshot query did not finish in time");
                self.on_crash_snapshot(&correlation, Err(CibError::Timeout));
                self.cib.settle(call);
            }
            _ => trace!(call, "snapshot grace period elapsed after the reply was handled"),
        }
    }
}
