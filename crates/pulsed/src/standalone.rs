//! Standalone mode — runs the whole control stack in one process.
//!
//! In this mode, the daemon:
//! 1. Assumes the coordinator role (there is no other node to elect)
//! 2. Serves cluster state from an in-memory CIB task
//! 3. Runs a stub policy engine behind the loopback IPC transport
//! 4. Drives the scheduler subsystem from the controller event loop
//! 5. Recomputes placement on a fixed interval

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use pulsegrid_cib::{cib_channel, CibDocument, CibNode, CibReply, CibRequest, Configuration};
use pulsegrid_fsa::{
    ClusterView, ControllerState, FsaAction, FsaCause, FsaEvent, FsaHandle, FsaInput,
};
use pulsegrid_ipc::{Envelope, LoopbackConnector, LoopbackPeer};
use pulsegrid_sched::{SchedConfig, SchedulerSubsystem, OP_CALC};

/// Run the standalone controller.
pub async fn run(
    node_id: String,
    data_dir: PathBuf,
    invoke_interval: u64,
    watchdog: bool,
) -> anyhow::Result<()> {
    info!("PulseGrid controller starting in standalone mode");
    std::fs::create_dir_all(&data_dir)?;

    // ── FSA and cluster view ───────────────────────────────────
    let (fsa, mut fsa_rx) = FsaHandle::new();
    fsa.set_coordinator(true);
    fsa.set_cib_consistent(true);
    fsa.set_state(ControllerState::Idle);

    let mut view = ClusterView::new(node_id.clone());
    view.set_quorum(true);
    view.set_membership_seq(1);
    view.set_watchdog(watchdog);
    view.set_members([node_id.clone()]);
    let cluster = view.into_shared();
    info!(%node_id, watchdog, "coordinator role assumed");

    // ── In-memory CIB service ──────────────────────────────────
    let (cib, cib_requests) = cib_channel();
    let (cib_reply_tx, mut cib_replies) = mpsc::unbounded_channel();
    let cib_handle = tokio::spawn(serve_cib(seed_document(&node_id), cib_requests, cib_reply_tx));
    info!("in-memory cib service started");

    // ── Stub policy engine on the loopback transport ───────────
    let (connector, peers) = LoopbackConnector::new();
    let engine_handle = tokio::spawn(serve_policy_engine(peers));
    info!("stub policy engine started");

    // ── Scheduler subsystem ────────────────────────────────────
    let config = SchedConfig::new(data_dir.join("scheduler"));
    let (mut sched, mut sched_inbox) =
        SchedulerSubsystem::new(config, fsa.clone(), cluster, cib, Arc::new(connector));
    sched.request_start();
    info!("scheduler subsystem initialized");

    // ── Shutdown signal ────────────────────────────────────────
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    // ── Controller event loop ──────────────────────────────────
    // Inputs queue ahead of or behind pending work depending on how they
    // were registered; errors always win the next dispatch.
    let mut inputs: VecDeque<(FsaCause, FsaInput)> = VecDeque::new();
    let mut tick = tokio::time::interval(Duration::from_secs(invoke_interval.max(1)));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    'control: loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                break 'control;
            }
            Some(event) = fsa_rx.recv() => {
                handle_fsa_event(&fsa, &mut sched, &mut inputs, event);
            }
            Some(event) = sched_inbox.recv() => {
                sched.handle_event(event);
            }
            Some(reply) = cib_replies.recv() => {
                sched.handle_cib_reply(reply);
            }
            _ = tick.tick() => {
                if fsa.state() == ControllerState::Idle {
                    fsa.set_state(ControllerState::AwaitingPlacement);
                    sched.invoke();
                }
            }
        }

        while let Some((cause, input)) = inputs.pop_front() {
            if !dispatch_input(&fsa, cause, input) {
                break 'control;
            }
        }
    }

    // ── Graceful teardown ──────────────────────────────────────
    fsa.set_shutting_down(true);
    fsa.set_state(ControllerState::Stopping);
    sched.request_stop();
    cib_handle.abort();
    engine_handle.abort();
    info!("PulseGrid controller stopped");
    Ok(())
}

fn handle_fsa_event(
    fsa: &FsaHandle,
    sched: &mut SchedulerSubsystem,
    inputs: &mut VecDeque<(FsaCause, FsaInput)>,
    event: FsaEvent,
) {
    match event {
        FsaEvent::Input {
            cause,
            input,
            prepend,
        } => {
            if prepend {
                inputs.push_front((cause, input));
            } else {
                inputs.push_back((cause, input));
            }
        }
        FsaEvent::Action(FsaAction::StartScheduler) => sched.request_start(),
        FsaEvent::Action(FsaAction::StopScheduler) => sched.request_stop(),
        FsaEvent::Action(FsaAction::InvokeScheduler) => {
            fsa.set_state(ControllerState::AwaitingPlacement);
            sched.invoke();
        }
        FsaEvent::Stall => {
            debug!("current action stalled, waiting for the next event");
        }
        FsaEvent::Trigger => {
            // Re-evaluate: a link the subsystem still wants but lost gets a
            // fresh start action.
            if sched.is_required() && !sched.is_connected() && !fsa.is_shutting_down() {
                fsa.register_action(FsaAction::StartScheduler);
            }
        }
        FsaEvent::Route { cause, message } => {
            if message.op == OP_CALC {
                info!(
                    ?cause,
                    reference = %message.reference,
                    "placement computed, transition complete"
                );
                fsa.set_state(ControllerState::Idle);
            } else {
                debug!(op = %message.op, "unhandled peer message");
            }
        }
    }
}

/// Apply one dequeued input. Returns false when the controller must stop.
fn dispatch_input(fsa: &FsaHandle, cause: FsaCause, input: FsaInput) -> bool {
    match input {
        FsaInput::Terminate => {
            info!(?cause, "terminate input dispatched");
            false
        }
        FsaInput::Error | FsaInput::Election => {
            // Standalone has nobody else to elect; recover by re-asserting
            // the coordinator role and idling until the next tick.
            warn!(?cause, ?input, "recovering coordinator role after escalation");
            fsa.set_coordinator(true);
            fsa.set_cib_consistent(true);
            fsa.set_state(ControllerState::Idle);
            true
        }
        FsaInput::Fail => {
            info!(?cause, "subsystem start failed, scheduling a retry");
            let fsa = fsa.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                fsa.register_action(FsaAction::StartScheduler);
            });
            true
        }
    }
}

fn seed_document(node_id: &str) -> CibDocument {
    CibDocument {
        epoch: 1,
        num_updates: 0,
        configuration: Configuration {
            crm_config: Vec::new(),
            nodes: vec![CibNode {
                id: "1".to_string(),
                uname: node_id.to_string(),
            }],
        },
        ..CibDocument::default()
    }
}

/// Answer CIB queries from an in-memory document, bumping the update
/// counter per read so successive snapshots are distinguishable.
async fn serve_cib(
    mut doc: CibDocument,
    mut requests: mpsc::UnboundedReceiver<CibRequest>,
    replies: mpsc::UnboundedSender<CibReply>,
) {
    while let Some(request) = requests.recv().await {
        doc.num_updates += 1;
        debug!(call = request.call, scope = ?request.scope, "cib query answered");
        if replies
            .send(CibReply {
                call: request.call,
                result: Ok(doc.clone()),
            })
            .is_err()
        {
            break;
        }
    }
}

/// Accept loopback connections and answer every placement request with an
/// empty transition, standing in for a real policy engine.
async fn serve_policy_engine(mut peers: mpsc::UnboundedReceiver<LoopbackPeer>) {
    while let Some(mut peer) = peers.recv().await {
        info!(service = peer.service(), "policy engine accepted a client");
        tokio::spawn(async move {
            while let Some(frame) = peer.recv().await {
                let request = match Envelope::from_bytes(&frame) {
                    Ok(request) => request,
                    Err(err) => {
                        debug!(%err, "policy engine dropping unparseable frame");
                        continue;
                    }
                };
                if request.op != OP_CALC {
                    debug!(op = %request.op, "policy engine ignoring operation");
                    continue;
                }
                let reply = Envelope::reply_to(
                    &request,
                    OP_CALC,
                    serde_json::json!({ "transition": [] }),
                );
                let Ok(bytes) = reply.to_bytes() else { continue };
                if peer.send(&bytes).is_err() {
                    break;
                }
            }
            debug!("policy engine client gone");
        });
    }
}
