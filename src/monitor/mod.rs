//! The control loop.
//!
//! One task owns the [`Investigator`]. Log lines, fix descriptors and worker
//! reports arrive over an mpsc channel and are handled strictly in order;
//! timers advance on a one-second tick. External calls run off the loop and
//! report back through the same channel, so a slow collaborator never stalls
//! timer bookkeeping. Client pause/resume requests share one worker and reach
//! the client in the order they were issued.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::control::{self, PauseRequest, ResumeRequest, RetryPolicy, Service, ServiceControl, ServiceHealth};
use crate::detect::Classifier;
use crate::fix::FixDescriptor;
use crate::focus::AddOutcome;
use crate::investigation::{Command, Investigator, Step};
use crate::status::StatusSnapshot;
use crate::storage::Record;
use crate::verify::{self, VerificationSettings};

/// Inbox capacity. Senders wait when the loop falls behind.
const EVENT_BUFFER: usize = 1024;

/// Pause/resume requests waiting for the client worker.
const CLIENT_BUFFER: usize = 64;

const TICK: Duration = Duration::from_secs(1);
const STATUS_CADENCE: Duration = Duration::from_secs(5);

/// Inputs to the control loop.
#[derive(Debug)]
pub enum MonitorEvent {
    Line(String),
    Fix(FixDescriptor),
    ServicesReady {
        focus_group_id: Uuid,
        ready: bool,
        health: Vec<(Service, ServiceHealth)>,
    },
    Health(Vec<(Service, ServiceHealth)>),
    Warning(String),
}

/// Requests for the client collaborator, delivered one at a time.
#[derive(Debug)]
enum ClientCommand {
    Pause(PauseRequest),
    Resume(ResumeRequest),
}

pub struct Monitor {
    investigator: Investigator,
    classifier: Classifier,
    control: Arc<dyn ServiceControl>,
    retry: RetryPolicy,
    verification: VerificationSettings,
    events: mpsc::Sender<MonitorEvent>,
    snapshots: watch::Sender<StatusSnapshot>,
    recorder: Option<mpsc::Sender<Record>>,
    recorder_backlogged: bool,
    /// Started on the first pause or resume.
    client: Option<mpsc::Sender<ClientCommand>>,
}

impl Monitor {
    /// Build a monitor and the receiving end of its inbox (passed to [`Monitor::run`]).
    pub fn new(
        investigator: Investigator,
        control: Arc<dyn ServiceControl>,
        retry: RetryPolicy,
        verification: VerificationSettings,
    ) -> (Self, mpsc::Receiver<MonitorEvent>) {
        let (events, inbox) = mpsc::channel(EVENT_BUFFER);
        let (snapshots, _) = watch::channel(StatusSnapshot::capture(&investigator, Utc::now()));
        let monitor = Self {
            investigator,
            classifier: Classifier::new(),
            control,
            retry,
            verification,
            events,
            snapshots,
            recorder: None,
            recorder_backlogged: false,
            client: None,
        };
        (monitor, inbox)
    }

    pub fn with_recorder(mut self, recorder: mpsc::Sender<Record>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Sender for tailers, fix watchers and the API.
    pub fn sender(&self) -> mpsc::Sender<MonitorEvent> {
        self.events.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.snapshots.subscribe()
    }

    pub fn investigator(&self) -> &Investigator {
        &self.investigator
    }

    pub async fn run(mut self, mut inbox: mpsc::Receiver<MonitorEvent>, shutdown: CancellationToken) {
        let step = self.investigator.restore(Utc::now());
        self.apply(step, Utc::now());
        self.publish(Utc::now());
        info!(phase = %self.investigator.phase(), "monitor started");

        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut status = tokio::time::interval(STATUS_CADENCE);
        status.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = inbox.recv() => match event {
                    Some(event) => self.handle(event, Utc::now()),
                    None => break,
                },
                _ = tick.tick() => {
                    let now = Utc::now();
                    let step = self.investigator.tick(now);
                    self.apply(step, now);
                }
                _ = status.tick() => self.publish(Utc::now()),
            }
        }

        let now = Utc::now();
        self.record(Record::FocusState(Box::new(self.investigator.store().clone())), now);
        self.publish(now);
        info!("monitor stopped");
    }

    /// Handle one event synchronously. Commands it produces are dispatched to
    /// spawned tasks.
    pub fn handle(&mut self, event: MonitorEvent, now: DateTime<Utc>) {
        match event {
            MonitorEvent::Line(line) => {
                self.investigator.note_line();
                let Some(issue) = self.classifier.classify_at(&line, now) else {
                    return;
                };
                debug!(issue_type = %issue.issue_type, severity = %issue.severity, source = %issue.source, "classified");
                let recorded = issue.clone();
                let step = self.investigator.handle_issue(issue, now);

                let disposition = match (step.regression, step.outcome) {
                    (true, _) => "regression",
                    (false, Some(outcome)) => outcome.as_str(),
                    (false, None) => "unhandled",
                };
                let focus_group_id = match step.outcome {
                    Some(AddOutcome::Queued) => None,
                    _ => self.investigator.store().active_id(),
                };
                self.record(
                    Record::Issue {
                        issue: recorded,
                        disposition,
                        focus_group_id,
                    },
                    now,
                );
                self.apply(step, now);
            }
            MonitorEvent::Fix(fix) => {
                let step = self.investigator.handle_fix(&fix, now);
                if !step.changed() {
                    // discarded descriptors still surface their warning
                    self.publish(now);
                }
                self.apply(step, now);
            }
            MonitorEvent::ServicesReady {
                focus_group_id,
                ready,
                health,
            } => {
                self.investigator.handle_services_ready(focus_group_id, ready, health, now);
                self.publish(now);
            }
            MonitorEvent::Health(health) => self.investigator.record_health(health),
            MonitorEvent::Warning(message) => {
                self.investigator.warn(message, now);
                self.publish(now);
            }
        }
    }

    fn apply(&mut self, step: Step, now: DateTime<Utc>) {
        if !step.changed() {
            return;
        }

        let Step {
            transitions,
            commands,
            fix_attempts,
            ..
        } = step;

        let transitioned = !transitions.is_empty();
        for transition in transitions {
            self.record(Record::Transition(transition), now);
        }
        for (focus_group_id, attempt) in fix_attempts {
            self.record(
                Record::FixAttempt {
                    focus_group_id,
                    attempt,
                },
                now,
            );
        }
        self.record(Record::FocusState(Box::new(self.investigator.store().clone())), now);

        for command in commands {
            self.dispatch(command, now);
        }
        if transitioned {
            self.publish(now);
        }
    }

    fn publish(&self, now: DateTime<Utc>) {
        self.snapshots
            .send_replace(StatusSnapshot::capture(&self.investigator, now));
    }

    /// Hand a record to the recorder without waiting. Dropped records surface
    /// one warning per backlog episode.
    fn record(&mut self, record: Record, now: DateTime<Utc>) {
        let Some(recorder) = &self.recorder else {
            return;
        };
        match recorder.try_send(record) {
            Ok(()) => self.recorder_backlogged = false,
            Err(e) => {
                if !self.recorder_backlogged {
                    self.recorder_backlogged = true;
                    self.investigator
                        .warn(format!("history recorder unavailable ({}), dropping records", e), now);
                }
            }
        }
    }

    fn dispatch(&mut self, command: Command, now: DateTime<Utc>) {
        match command {
            Command::Pause(request) => {
                info!(focus_group = %request.focus_group_id, resource = ?request.resource_id, "pausing client");
                self.send_client(ClientCommand::Pause(request), now);
            }
            Command::Resume(request) => {
                info!(focus_group = %request.focus_group_id, resource = ?request.resource_id, "resuming client");
                self.send_client(ClientCommand::Resume(request), now);
            }
            Command::Restart {
                focus_group_id,
                services,
            } => {
                let control = self.control.clone();
                let events = self.events.clone();
                let policy = self.retry;
                let verification = self.verification.clone();
                tokio::spawn(async move {
                    run_restarts(control, focus_group_id, services, policy, verification, events).await;
                });
            }
        }
    }

    fn send_client(&mut self, command: ClientCommand, now: DateTime<Utc>) {
        let queue = match &self.client {
            Some(queue) => queue.clone(),
            None => {
                let (tx, rx) = mpsc::channel(CLIENT_BUFFER);
                spawn_client_worker(self.control.clone(), self.retry, rx, self.events.clone());
                self.client = Some(tx.clone());
                tx
            }
        };
        if let Err(e) = queue.try_send(command) {
            self.investigator
                .warn(format!("client command dropped ({})", e), now);
        }
    }
}

/// Deliver pause/resume requests one at a time, in order. A request is fully
/// retried before the next one starts.
fn spawn_client_worker(
    control: Arc<dyn ServiceControl>,
    policy: RetryPolicy,
    mut commands: mpsc::Receiver<ClientCommand>,
    events: mpsc::Sender<MonitorEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(command) = commands.recv().await {
            match command {
                ClientCommand::Pause(request) => {
                    let result = control::with_retry("pause", &policy, || control.pause(&request)).await;
                    report("pause", result, &events).await;
                }
                ClientCommand::Resume(request) => {
                    let result = control::with_retry("resume", &policy, || control.resume(&request)).await;
                    report("resume", result, &events).await;
                }
            }
        }
        debug!("client command worker stopped");
    })
}

async fn report(op: &str, result: Result<(), control::ControlError>, events: &mpsc::Sender<MonitorEvent>) {
    match result {
        Ok(()) => debug!(op, "external call succeeded"),
        Err(e) if e.is_not_configured() => debug!(op, error = %e, "skipped"),
        Err(e) => {
            warn!(op, error = %e, "external call failed after retries");
            let _ = events
                .send(MonitorEvent::Warning(format!("{} failed: {}", op, e)))
                .await;
        }
    }
}

/// Restart in order within the restart budget, wait for readiness within the
/// ready cap, then report back so the verification window can be armed. Both
/// phases are bounded, so the report never lands after the arm deadline.
async fn run_restarts(
    control: Arc<dyn ServiceControl>,
    focus_group_id: Uuid,
    services: Vec<Service>,
    policy: RetryPolicy,
    verification: VerificationSettings,
    events: mpsc::Sender<MonitorEvent>,
) {
    let services = Service::restart_order(&services);
    let restart_policy = RetryPolicy {
        call_timeout: verification.restart_call_timeout(),
        ..policy
    };
    let budget = verification.restart_budget();

    let sequence = restart_in_order(control.as_ref(), &services, &restart_policy, focus_group_id, &events);
    if tokio::time::timeout(budget, sequence).await.is_err() {
        warn!(focus_group = %focus_group_id, budget_secs = budget.as_secs(), "restarts ran out of time, cancelled");
        let _ = events.try_send(MonitorEvent::Warning(format!(
            "restarts for {} did not finish within {}s and were cancelled",
            focus_group_id,
            budget.as_secs()
        )));
    }

    let readiness = verify::wait_for_services(control.as_ref(), &services, &verification, policy.call_timeout).await;
    let _ = events
        .send(MonitorEvent::ServicesReady {
            focus_group_id,
            ready: readiness.ready,
            health: readiness.health,
        })
        .await;
}

async fn restart_in_order(
    control: &dyn ServiceControl,
    services: &[Service],
    policy: &RetryPolicy,
    focus_group_id: Uuid,
    events: &mpsc::Sender<MonitorEvent>,
) {
    for &service in services {
        let op = format!("restart {}", service);
        let result = control::with_retry(&op, policy, || control.restart(service)).await;
        match result {
            Ok(()) => info!(%service, focus_group = %focus_group_id, "service restarted"),
            Err(e) if e.is_not_configured() => debug!(%service, "no restart command configured"),
            Err(e) => {
                warn!(%service, error = %e, "restart failed");
                let _ = events.try_send(MonitorEvent::Warning(format!("{} failed: {}", op, e)));
            }
        }
    }
}

/// Poll every service's health on `interval` for the snapshot's metrics.
pub fn spawn_health_poller(
    control: Arc<dyn ServiceControl>,
    interval: Duration,
    call_timeout: Duration,
    events: mpsc::Sender<MonitorEvent>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let readiness = verify::services_ready(control.as_ref(), &Service::ALL, call_timeout).await;
            if events.send(MonitorEvent::Health(readiness.health)).await.is_err() {
                break;
            }
        }
        debug!("health poller stopped");
    })
}
