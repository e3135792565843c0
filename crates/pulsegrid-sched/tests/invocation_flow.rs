//! End-to-end scenarios for the scheduler subsystem: invocation cycles,
//! supersession, the reply deadline, and crash diagnostics, driven through
//! the same channels the controller loop uses.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use pulsegrid_cib::{
    cib_channel, keys, snapshot, CibDocument, CibNode, CibReply, CibRequest, CibResult,
    CibScope, Configuration, NvPair, PropertySet,
};
use pulsegrid_fsa::{
    ClusterView, ControllerState, ExitFn, ExitStatus, FsaAction, FsaCause, FsaEvent, FsaHandle,
    FsaInput, SharedClusterView,
};
use pulsegrid_ipc::{Envelope, LoopbackConnector, LoopbackPeer};
use pulsegrid_sched::{SchedConfig, SchedulerSubsystem, SchedEvent, OP_CALC};
use serde_json::json;
use tokio::sync::mpsc;

struct Harness {
    sub: SchedulerSubsystem,
    inbox: mpsc::UnboundedReceiver<SchedEvent>,
    fsa: FsaHandle,
    fsa_rx: mpsc::UnboundedReceiver<FsaEvent>,
    cluster: SharedClusterView,
    cib_rx: mpsc::UnboundedReceiver<CibRequest>,
    peers: mpsc::UnboundedReceiver<LoopbackPeer>,
    exits: Arc<Mutex<Vec<ExitStatus>>>,
    dir: tempfile::TempDir,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        Self::with_state_dir(dir.path().to_path_buf(), dir)
    }

    fn with_state_dir(state_dir: PathBuf, dir: tempfile::TempDir) -> Self {
        let exits = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&exits);
        let exit: ExitFn = Arc::new(move |status| sink.lock().unwrap().push(status));
        let (fsa, fsa_rx) = FsaHandle::with_exit_handler(exit);
        let cluster = ClusterView::new("grid-a").into_shared();
        let (cib, cib_rx) = cib_channel();
        let (connector, peers) = LoopbackConnector::new();
        let (sub, inbox) = SchedulerSubsystem::new(
            SchedConfig::new(state_dir),
            fsa.clone(),
            Arc::clone(&cluster),
            cib,
            Arc::new(connector),
        );
        Self {
            sub,
            inbox,
            fsa,
            fsa_rx,
            cluster,
            cib_rx,
            peers,
            exits,
            dir,
        }
    }

    fn make_coordinator(&self) {
        self.fsa.set_coordinator(true);
        self.fsa.set_cib_consistent(true);
        self.fsa.set_state(ControllerState::AwaitingPlacement);
    }

    fn connect(&mut self) -> LoopbackPeer {
        self.sub.request_start();
        self.peers.try_recv().expect("scheduler peer accepted")
    }

    /// Feed everything queued in the subsystem inbox back into it.
    fn pump(&mut self) {
        while let Ok(event) = self.inbox.try_recv() {
            self.sub.handle_event(event);
        }
    }

    /// Answer the oldest outstanding cluster-state query.
    fn answer_next(&mut self, result: CibResult<CibDocument>) {
        let request = self.cib_rx.try_recv().expect("a cluster state query");
        assert_eq!(request.scope, CibScope::Local);
        self.sub.handle_cib_reply(CibReply {
            call: request.call,
            result,
        });
    }

    fn drain_fsa(&mut self) -> Vec<FsaEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.fsa_rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Disconnect the cluster-state service so queries fail.
    fn kill_cib(&mut self) {
        let (_tx, rx) = mpsc::unbounded_channel();
        self.cib_rx = rx;
    }
}

fn sample_doc() -> CibDocument {
    CibDocument {
        epoch: 4,
        num_updates: 11,
        configuration: Configuration {
            crm_config: vec![PropertySet {
                id: keys::BOOTSTRAP_OPTIONS.into(),
                nvpairs: vec![NvPair {
                    id: "cib-bootstrap-options-have-watchdog".into(),
                    name: keys::HAVE_WATCHDOG.into(),
                    value: "false".into(),
                }],
            }],
            nodes: vec![
                CibNode {
                    id: "1".into(),
                    uname: "grid-a".into(),
                },
                CibNode {
                    id: "2".into(),
                    uname: "grid-b".into(),
                },
            ],
        },
        ..CibDocument::default()
    }
}

fn snapshot_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("pe-core-") && name.ends_with(".bz2"))
        })
        .collect();
    files.sort();
    files
}

fn input(cause: FsaCause, input: FsaInput) -> FsaEvent {
    FsaEvent::Input {
        cause,
        input,
        prepend: true,
    }
}

// ── Invocation pipeline ──────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn full_cycle_submits_a_decorated_document_and_correlates_the_reply() {
    let mut h = Harness::new();
    h.make_coordinator();
    {
        let mut view = h.cluster.write().unwrap();
        view.set_quorum(true);
        view.set_watchdog(true);
        view.set_membership_seq(7);
    }
    let mut peer = h.connect();

    h.sub.invoke();
    h.answer_next(Ok(sample_doc()));

    let frame = peer.try_recv().expect("placement request transmitted");
    let request = Envelope::from_bytes(&frame).unwrap();
    assert_eq!(request.op, OP_CALC);
    assert_eq!(request.sys_from, "dc");
    assert_eq!(request.sys_to, "pengine");

    let submitted: CibDocument = serde_json::from_value(request.payload.clone()).unwrap();
    assert_eq!(submitted.attr(keys::DC_UUID), Some("grid-a"));
    assert_eq!(submitted.attr(keys::HAVE_QUORUM), Some("1"));
    assert_eq!(submitted.cluster_property(keys::HAVE_WATCHDOG), Some("true"));
    assert_eq!(submitted.attr(keys::NO_QUORUM_PANIC), None);

    // The submitted document refreshed the node caches.
    {
        let view = h.cluster.read().unwrap();
        assert!(view.members().contains("grid-b"));
        assert!(view.known_nodes().contains("grid-b"));
    }
    assert!(h.sub.awaiting_reply());

    // The echoed reference settles the expectation and the reply is routed.
    let reply = Envelope::reply_to(&request, OP_CALC, json!({"transition": []}));
    peer.send(&reply.to_bytes().unwrap()).unwrap();
    h.pump();
    assert!(!h.sub.awaiting_reply());
    assert_eq!(
        h.drain_fsa(),
        vec![FsaEvent::Route {
            cause: FsaCause::IpcMessage,
            message: reply,
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn only_the_latest_query_reaches_submission() {
    let mut h = Harness::new();
    h.make_coordinator();
    let mut peer = h.connect();

    h.sub.invoke();
    h.sub.invoke();
    let first = h.cib_rx.try_recv().unwrap();
    let second = h.cib_rx.try_recv().unwrap();

    // The older query answers first; it is superseded and submits nothing.
    h.sub.handle_cib_reply(CibReply {
        call: first.call,
        result: Ok(sample_doc()),
    });
    assert!(peer.try_recv().is_none());
    assert!(!h.sub.awaiting_reply());

    // The current query answers and is the only one to submit.
    h.sub.handle_cib_reply(CibReply {
        call: second.call,
        result: Ok(sample_doc()),
    });
    assert!(peer.try_recv().is_some());
    assert!(peer.try_recv().is_none());
    assert!(h.sub.awaiting_reply());
}

#[tokio::test(start_paused = true)]
async fn a_new_invocation_cancels_the_previous_expectation() {
    let mut h = Harness::new();
    h.make_coordinator();
    let mut peer = h.connect();

    h.sub.invoke();
    h.answer_next(Ok(sample_doc()));
    assert!(h.sub.awaiting_reply());
    let _old_request = peer.try_recv().unwrap();

    // Starting a new cycle clears the old expectation before any reply.
    h.sub.invoke();
    assert!(!h.sub.awaiting_reply());
    h.answer_next(Ok(sample_doc()));
    assert!(h.sub.awaiting_reply());
    assert!(peer.try_recv().is_some());
}

#[tokio::test(start_paused = true)]
async fn concurrent_state_updates_defer_the_invocation() {
    let mut h = Harness::new();
    h.make_coordinator();
    let mut peer = h.connect();

    h.sub.invoke();
    h.sub.invoke();
    let first = h.cib_rx.try_recv().unwrap();
    let second = h.cib_rx.try_recv().unwrap();

    // Answering the current query while the superseded one is still in
    // flight: two callbacks outstanding, so the pipeline backs off.
    h.sub.handle_cib_reply(CibReply {
        call: second.call,
        result: Ok(sample_doc()),
    });
    assert!(peer.try_recv().is_none());
    assert!(h.drain_fsa().is_empty());

    // After the pacing delay the action is re-registered.
    tokio::time::advance(std::time::Duration::from_secs(1)).await;
    tokio::task::yield_now().await;
    assert_eq!(
        h.drain_fsa(),
        vec![FsaEvent::Action(FsaAction::InvokeScheduler)]
    );

    // The stale reply never submits either.
    h.sub.handle_cib_reply(CibReply {
        call: first.call,
        result: Ok(sample_doc()),
    });
    assert!(peer.try_recv().is_none());
}

#[tokio::test(start_paused = true)]
async fn quorum_panic_is_stamped_only_after_quorum_was_held_and_lost() {
    let mut h = Harness::new();
    h.make_coordinator();
    {
        let mut view = h.cluster.write().unwrap();
        view.set_quorum(true);
        view.set_quorum(false);
    }
    let mut peer = h.connect();

    h.sub.invoke();
    h.answer_next(Ok(sample_doc()));
    let request = Envelope::from_bytes(&peer.try_recv().unwrap()).unwrap();
    let submitted: CibDocument = serde_json::from_value(request.payload).unwrap();
    assert_eq!(submitted.attr(keys::HAVE_QUORUM), Some("0"));
    assert_eq!(submitted.attr(keys::NO_QUORUM_PANIC), Some("1"));

    // A node that never held quorum does not panic-stamp.
    let mut fresh = Harness::new();
    fresh.make_coordinator();
    let mut fresh_peer = fresh.connect();
    fresh.sub.invoke();
    fresh.answer_next(Ok(sample_doc()));
    let request = Envelope::from_bytes(&fresh_peer.try_recv().unwrap()).unwrap();
    let submitted: CibDocument = serde_json::from_value(request.payload).unwrap();
    assert_eq!(submitted.attr(keys::HAVE_QUORUM), Some("0"));
    assert_eq!(submitted.attr(keys::NO_QUORUM_PANIC), None);
}

// ── invoke() gates ───────────────────────────────────────────────────────

#[test]
fn invoke_without_a_link_stalls_and_rerequests_start() {
    let mut h = Harness::new();
    h.make_coordinator();
    h.sub.invoke();

    assert_eq!(
        h.drain_fsa(),
        vec![
            FsaEvent::Stall,
            FsaEvent::Action(FsaAction::StartScheduler),
        ]
    );
    assert!(h.cib_rx.try_recv().is_err());
}

#[test]
fn invoke_without_a_link_while_stopping_terminates() {
    let mut h = Harness::new();
    h.make_coordinator();
    h.fsa.set_shutting_down(true);
    h.sub.invoke();

    assert_eq!(
        h.drain_fsa(),
        vec![input(FsaCause::Internal, FsaInput::Terminate)]
    );
}

#[test]
fn invoke_in_the_wrong_state_is_a_quiet_refusal() {
    let mut h = Harness::new();
    h.make_coordinator();
    let _peer = h.connect();
    h.fsa.set_state(ControllerState::Idle);
    h.sub.invoke();

    assert!(h.drain_fsa().is_empty());
    assert!(h.cib_rx.try_recv().is_err());
}

#[test]
fn invoke_with_an_inconsistent_replica_forces_an_election() {
    let mut h = Harness::new();
    h.make_coordinator();
    let _peer = h.connect();
    h.fsa.set_cib_consistent(false);
    h.sub.invoke();

    assert_eq!(
        h.drain_fsa(),
        vec![input(FsaCause::Internal, FsaInput::Election)]
    );
    assert!(h.cib_rx.try_recv().is_err());
}

#[test]
fn query_failure_escalates_an_error() {
    let mut h = Harness::new();
    h.make_coordinator();
    let _peer = h.connect();
    h.kill_cib();
    h.sub.invoke();

    assert_eq!(
        h.drain_fsa(),
        vec![input(FsaCause::Internal, FsaInput::Error)]
    );
}

#[tokio::test(start_paused = true)]
async fn send_failure_escalates_an_error() {
    let mut h = Harness::new();
    h.make_coordinator();
    let mut peer = h.connect();
    peer.close_inbox();

    h.sub.invoke();
    h.answer_next(Ok(sample_doc()));

    assert_eq!(
        h.drain_fsa(),
        vec![input(FsaCause::Internal, FsaInput::Error)]
    );
    assert!(!h.sub.awaiting_reply());
}

#[tokio::test(start_paused = true)]
async fn failed_queries_escalate_even_when_superseded() {
    let mut h = Harness::new();
    h.make_coordinator();
    let _peer = h.connect();

    h.sub.invoke();
    h.sub.invoke();
    let first = h.cib_rx.try_recv().unwrap();
    let _second = h.cib_rx.try_recv().unwrap();

    // The stale query failing is still an error worth escalating.
    h.sub.handle_cib_reply(CibReply {
        call: first.call,
        result: Err(pulsegrid_cib::CibError::NotFound),
    });
    assert_eq!(
        h.drain_fsa(),
        vec![input(FsaCause::Internal, FsaInput::Error)]
    );
}

// ── Reply deadline ───────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn reply_timeout_as_coordinator_exits_without_respawn() {
    let mut h = Harness::new();
    h.make_coordinator();
    let mut peer = h.connect();
    h.sub.invoke();
    h.answer_next(Ok(sample_doc()));
    let _request = peer.try_recv().unwrap();
    assert!(h.exits.lock().unwrap().is_empty());

    tokio::time::advance(std::time::Duration::from_millis(120_000)).await;
    tokio::task::yield_now().await;
    h.pump();

    assert_eq!(*h.exits.lock().unwrap(), vec![ExitStatus::FatalNoRespawn]);
}

#[tokio::test(start_paused = true)]
async fn reply_timeout_off_the_coordinator_is_a_noop() {
    let mut h = Harness::new();
    h.make_coordinator();
    let mut peer = h.connect();
    h.sub.invoke();
    h.answer_next(Ok(sample_doc()));
    let _request = peer.try_recv().unwrap();

    // The role moved on before the deadline hit.
    h.fsa.set_coordinator(false);
    tokio::time::advance(std::time::Duration::from_millis(120_000)).await;
    tokio::task::yield_now().await;
    h.pump();

    assert!(h.exits.lock().unwrap().is_empty());
    assert!(!h.sub.awaiting_reply());
}

#[tokio::test(start_paused = true)]
async fn a_stale_reply_does_not_disarm_the_deadline() {
    let mut h = Harness::new();
    h.make_coordinator();
    let mut peer = h.connect();
    h.sub.invoke();
    h.answer_next(Ok(sample_doc()));
    let request = Envelope::from_bytes(&peer.try_recv().unwrap()).unwrap();

    // A reply carrying some other reference is obsolete: dropped, no route,
    // deadline still armed.
    let stale = Envelope::request(OP_CALC, "pengine", "dc", json!({}));
    peer.send(&stale.to_bytes().unwrap()).unwrap();
    h.pump();
    assert!(h.sub.awaiting_reply());
    assert!(h.drain_fsa().is_empty());

    // The real reply still lands.
    let reply = Envelope::reply_to(&request, OP_CALC, json!({}));
    peer.send(&reply.to_bytes().unwrap()).unwrap();
    h.pump();
    assert!(!h.sub.awaiting_reply());
    assert_eq!(h.drain_fsa().len(), 1);
}

// ── Disconnect handling and crash diagnostics ────────────────────────────

#[tokio::test(start_paused = true)]
async fn peer_crash_while_armed_tears_down_and_captures_a_snapshot() {
    let mut h = Harness::new();
    h.make_coordinator();
    let mut peer = h.connect();
    h.sub.invoke();
    h.answer_next(Ok(sample_doc()));
    let _request = peer.try_recv().unwrap();
    assert!(h.sub.awaiting_reply());

    peer.hang_up();
    h.pump();

    // Teardown: expectation cleared, link state reset, FSA poked.
    assert!(!h.sub.awaiting_reply());
    assert!(!h.sub.is_connected());
    assert_eq!(h.sub.peer_pid(), None);
    assert!(h.sub.is_required());
    assert_eq!(h.drain_fsa(), vec![FsaEvent::Trigger]);

    // The escalation is deferred until the snapshot query resolves.
    h.answer_next(Ok(sample_doc()));
    assert_eq!(
        h.drain_fsa(),
        vec![input(FsaCause::Internal, FsaInput::Error)]
    );

    let files = snapshot_files(h.dir.path());
    assert_eq!(files.len(), 1);
    let captured = snapshot::read_compressed(&files[0]).unwrap();
    assert_eq!(captured, sample_doc());
}

#[tokio::test(start_paused = true)]
async fn abandoned_snapshot_queries_still_escalate() {
    let mut h = Harness::new();
    h.make_coordinator();
    let peer = h.connect();

    peer.hang_up();
    h.pump();
    assert_eq!(h.drain_fsa(), vec![FsaEvent::Trigger]);
    let pending = h.cib_rx.try_recv().expect("snapshot query issued");

    // Nothing answers within the grace period.
    tokio::time::advance(std::time::Duration::from_secs(5)).await;
    tokio::task::yield_now().await;
    h.pump();
    assert_eq!(
        h.drain_fsa(),
        vec![input(FsaCause::Internal, FsaInput::Error)]
    );
    assert!(snapshot_files(h.dir.path()).is_empty());

    // The late answer finds no expectation and does not escalate again.
    h.sub.handle_cib_reply(CibReply {
        call: pending.call,
        result: Ok(sample_doc()),
    });
    assert!(h.drain_fsa().is_empty());
    assert!(snapshot_files(h.dir.path()).is_empty());
}

#[tokio::test(start_paused = true)]
async fn snapshot_write_failure_is_logged_but_not_escalated_twice() {
    let dir = tempfile::tempdir().unwrap();
    let blocked = dir.path().join("blocked");
    std::fs::write(&blocked, b"not a directory").unwrap();
    let mut h = Harness::with_state_dir(blocked, dir);
    h.make_coordinator();
    let peer = h.connect();

    peer.hang_up();
    h.pump();
    h.drain_fsa();

    h.answer_next(Ok(sample_doc()));
    // Exactly the deferred escalation, nothing more, and no exit.
    assert_eq!(
        h.drain_fsa(),
        vec![input(FsaCause::Internal, FsaInput::Error)]
    );
    assert!(h.exits.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn crash_with_unreachable_state_store_escalates_immediately() {
    let mut h = Harness::new();
    h.make_coordinator();
    let peer = h.connect();
    h.kill_cib();

    peer.hang_up();
    h.pump();

    let events = h.drain_fsa();
    assert_eq!(
        events,
        vec![input(FsaCause::Internal, FsaInput::Error), FsaEvent::Trigger]
    );
    assert!(snapshot_files(h.dir.path()).is_empty());
}
