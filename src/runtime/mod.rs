//! # Session Runtime Module
//!
//! The single task that owns the dispatcher. Reader events, timers and
//! operator intents are all handled here, one at a time, so session state is
//! never touched concurrently.
//!
//! # Control Flow
//!
//! ```text
//!  SessionHandle ──intent──▶ ┌──────────────────┐ ──snapshot──▶ watch::Receiver
//!  reader task ───event───▶ │  SessionRuntime  │
//!  heartbeat / handshake /  │     select!      │ ──commands──▶ SerialLink
//!  stabilization timers ──▶ └──────────────────┘
//! ```
//!
//! The runtime ends when every [`SessionHandle`] is dropped; an open session
//! is stopped on the way out.

use chrono::Local;
use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::dispatcher::{CommandDispatcher, DispatchError, DispatcherSettings, SessionSnapshot};
use crate::serial::{LinkEvent, PortOpener};
use crate::session::StabilizationTicket;
use crate::telemetry::export::{ExportFormat, ExportJob};
use crate::wire::protocol::OperatingMode;

/// Capacity of the intent queue
const REQUEST_CHANNEL_CAPACITY: usize = 32;

/// Something the operator asked for
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    Connect { port: String, logging_interval: String },
    ChangeMode(OperatingMode),
    ConfirmBaseHeat(String),
    SubmitSetpoint { value: String, confirmed: bool },
    SendDisturbance(String),
    SendPid { kp: String, ki: String, kd: String },
    Stop,
    Export { path: PathBuf, format: Option<ExportFormat> },
}

/// Outcome reported back to the requester
pub type Reply = Result<(), DispatchError>;

struct Request {
    intent: Intent,
    reply: Option<oneshot::Sender<Reply>>,
}

/// Cloneable front end to a running [`SessionRuntime`]
#[derive(Debug, Clone)]
pub struct SessionHandle {
    requests: mpsc::Sender<Request>,
    snapshots: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    /// Submit an intent and wait for its outcome
    ///
    /// # Errors
    ///
    /// The dispatcher's rejection, or `RuntimeStopped` if the runtime is gone.
    pub async fn request(&self, intent: Intent) -> Reply {
        let (reply, outcome) = oneshot::channel();
        self.requests
            .send(Request { intent, reply: Some(reply) })
            .await
            .map_err(|_| DispatchError::RuntimeStopped)?;
        outcome.await.map_err(|_| DispatchError::RuntimeStopped)?
    }

    /// Submit an intent without waiting; returns `false` if the runtime is gone
    pub async fn submit(&self, intent: Intent) -> bool {
        self.requests.send(Request { intent, reply: None }).await.is_ok()
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Receiver notified on every published snapshot
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }
}

/// Timing taken from the `[session]` config section
#[derive(Debug, Clone, Copy)]
struct Timing {
    heartbeat: Duration,
    handshake: Duration,
    stabilization: Duration,
}

/// Owns the dispatcher and serializes everything that touches it
pub struct SessionRuntime<O: PortOpener> {
    dispatcher: CommandDispatcher<O>,
    requests: mpsc::Receiver<Request>,
    events: mpsc::Receiver<LinkEvent>,
    snapshots: watch::Sender<SessionSnapshot>,
    timing: Timing,
    handshake_due: Option<(Instant, u64)>,
    stabilization_due: Option<(Instant, StabilizationTicket)>,
}

impl<O: PortOpener> SessionRuntime<O> {
    /// Build a runtime and its handle
    ///
    /// # Arguments
    ///
    /// * `opener` - Opens ports named in `Connect` intents
    /// * `config` - Validated configuration
    ///
    /// # Returns
    ///
    /// * `(SessionRuntime, SessionHandle)` - Spawn `run()`; keep the handle
    pub fn new(opener: O, config: &Config) -> (Self, SessionHandle) {
        let (event_tx, event_rx) = mpsc::channel(config.session.event_channel_capacity);
        let (request_tx, request_rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);

        let dispatcher =
            CommandDispatcher::new(opener, DispatcherSettings::from_config(config), event_tx);
        let (snapshot_tx, snapshot_rx) = watch::channel(dispatcher.snapshot());

        let runtime = Self {
            dispatcher,
            requests: request_rx,
            events: event_rx,
            snapshots: snapshot_tx,
            timing: Timing {
                heartbeat: Duration::from_millis(config.session.heartbeat_interval_ms),
                handshake: Duration::from_millis(config.session.handshake_delay_ms),
                stabilization: Duration::from_millis(config.session.stabilization_delay_ms),
            },
            handshake_due: None,
            stabilization_due: None,
        };
        let handle = SessionHandle {
            requests: request_tx,
            snapshots: snapshot_rx,
        };
        (runtime, handle)
    }

    /// Run until every handle is dropped
    pub async fn run(mut self) {
        let mut heartbeat =
            time::interval_at(Instant::now() + self.timing.heartbeat, self.timing.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Session runtime started");

        loop {
            tokio::select! {
                request = self.requests.recv() => {
                    let Some(request) = request else {
                        break;
                    };
                    self.handle_request(request).await;
                }

                Some(event) = self.events.recv() => {
                    self.dispatcher.handle_event(event, Instant::now().into_std(), Local::now());
                }

                _ = heartbeat.tick() => {
                    self.dispatcher.heartbeat().await;
                }

                link_id = wait_until(self.handshake_due) => {
                    self.handshake_due = None;
                    self.dispatcher.handshake(link_id).await;
                }

                ticket = wait_until(self.stabilization_due) => {
                    self.stabilization_due = None;
                    self.dispatcher.finish_stabilization(ticket);
                }
            }

            self.publish();
        }

        self.dispatcher.shutdown().await;
        self.publish();
        info!("Session runtime stopped");
    }

    async fn handle_request(&mut self, request: Request) {
        let Request { intent, reply } = request;
        debug!("Intent: {:?}", intent);

        let outcome = match self.apply(intent).await {
            Ok(Some(job)) => {
                // The file is written off the loop; the reply waits for it
                self.publish();
                tokio::spawn(write_export(job, reply));
                return;
            }
            Ok(None) => Ok(()),
            Err(e) => {
                warn!("Rejected: {}", e);
                Err(e)
            }
        };

        // Requesters observe the post-intent snapshot
        self.publish();
        if let Some(reply) = reply {
            let _ = reply.send(outcome);
        }
    }

    /// Apply one intent; an accepted export comes back as a job to run
    async fn apply(&mut self, intent: Intent) -> Result<Option<ExportJob>, DispatchError> {
        match intent {
            Intent::Connect { port, logging_interval } => {
                let link_id =
                    self.dispatcher.connect(&port, &logging_interval, Instant::now().into_std())?;
                self.handshake_due = Some((Instant::now() + self.timing.handshake, link_id));
                self.stabilization_due = None;
            }
            Intent::ChangeMode(mode) => self.dispatcher.change_mode(mode).await?,
            Intent::ConfirmBaseHeat(input) => self.dispatcher.confirm_base_heat(&input).await?,
            Intent::SubmitSetpoint { value, confirmed } => {
                let ticket = self.dispatcher.submit_setpoint(&value, confirmed).await?;
                self.stabilization_due = Some((Instant::now() + self.timing.stabilization, ticket));
            }
            Intent::SendDisturbance(input) => self.dispatcher.send_disturbance(&input).await?,
            Intent::SendPid { kp, ki, kd } => self.dispatcher.send_pid(&kp, &ki, &kd).await?,
            Intent::Stop => {
                self.dispatcher.stop().await?;
                self.handshake_due = None;
                self.stabilization_due = None;
            }
            Intent::Export { path, format } => {
                return self.dispatcher.export_job(path, format).map(Some);
            }
        }
        Ok(None)
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.dispatcher.snapshot());
    }
}

/// Write an export on the blocking pool and answer the requester
async fn write_export(job: ExportJob, reply: Option<oneshot::Sender<Reply>>) {
    let outcome = match tokio::task::spawn_blocking(move || job.run()).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(DispatchError::Export(e.to_string())),
        Err(e) => Err(DispatchError::Export(e.to_string())),
    };
    if let Err(e) = &outcome {
        warn!("Export failed: {}", e);
    }
    if let Some(reply) = reply {
        let _ = reply.send(outcome);
    }
}

/// Resolve at `deadline`, or never when there is none
async fn wait_until<T: Copy>(deadline: Option<(Instant, T)>) -> T {
    match deadline {
        Some((at, value)) => {
            time::sleep_until(at).await;
            value
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::tests::{transcript, DuplexOpener};
    use crate::session::RunPhase;
    use std::fs;
    use tempfile::tempdir;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn spawn_runtime<O: PortOpener + 'static>(opener: O) -> (SessionHandle, tokio::task::JoinHandle<()>) {
        let (runtime, handle) = SessionRuntime::new(opener, &Config::default());
        (handle, tokio::spawn(runtime.run()))
    }

    fn connect(port: &str, interval: &str) -> Intent {
        Intent::Connect {
            port: port.to_string(),
            logging_interval: interval.to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_handshake_and_heartbeat() {
        let opener = DuplexOpener::default();
        let (handle, task) = spawn_runtime(opener.clone());

        handle.request(connect("sim", "1")).await.unwrap();
        let mut device = BufReader::new(opener.take_device());

        let mut lines = Vec::new();
        for _ in 0..5 {
            let mut line = String::new();
            device.read_line(&mut line).await.unwrap();
            lines.push(line);
        }
        // Handshake after 200 ms, then a heartbeat every second
        assert_eq!(
            lines,
            vec!["MODE:0\n", "DIST:0.0\n", "PID:40.0:1.0:10.0\n", "PING\n", "PING\n"]
        );

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stabilization_after_delay() {
        let opener = DuplexOpener::default();
        let (handle, task) = spawn_runtime(opener.clone());
        let mut snapshots = handle.subscribe();

        handle.request(connect("sim", "1")).await.unwrap();
        handle
            .request(Intent::SubmitSetpoint { value: "30.0".into(), confirmed: false })
            .await
            .unwrap();
        assert_eq!(handle.snapshot().phase, Some(RunPhase::Stabilizing));

        time::sleep(Duration::from_millis(1900)).await;
        assert_eq!(handle.snapshot().phase, Some(RunPhase::Stabilizing));

        let snapshot = snapshots
            .wait_for(|s| s.phase == Some(RunPhase::Running))
            .await
            .unwrap()
            .clone();
        assert!(snapshot.monitoring);

        handle.request(Intent::Stop).await.unwrap();
        let sent = transcript(opener.take_device()).await;
        assert!(sent.contains("MODE:0\nSET:30.0\n"));
        assert!(sent.ends_with("STOP\n"));

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_stabilization() {
        let opener = DuplexOpener::default();
        let (handle, task) = spawn_runtime(opener.clone());

        handle.request(connect("sim", "1")).await.unwrap();
        handle
            .request(Intent::SubmitSetpoint { value: "30".into(), confirmed: false })
            .await
            .unwrap();
        handle.request(Intent::Stop).await.unwrap();

        time::sleep(Duration::from_secs(3)).await;
        assert_eq!(handle.snapshot().phase, Some(RunPhase::Stopped));

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_telemetry_flows_into_snapshot() {
        let opener = DuplexOpener::default();
        let (handle, task) = spawn_runtime(opener.clone());
        let mut snapshots = handle.subscribe();

        handle.request(connect("sim", "1")).await.unwrap();
        let mut device = opener.take_device();
        device.write_all(b"DADOS,25.0,0,0,0,0,0\n").await.unwrap();

        let snapshot = snapshots.wait_for(|s| s.record_count == 1).await.unwrap().clone();
        assert_eq!(snapshot.live.map(|l| l.temperature), Some(25.0));
        assert_eq!(snapshot.last_record.map(|r| r.event), Some("-".to_string()));

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_hangup_stops_session() {
        let opener = DuplexOpener::default();
        let (handle, task) = spawn_runtime(opener.clone());
        let mut snapshots = handle.subscribe();

        handle.request(connect("sim", "1")).await.unwrap();
        drop(opener.take_device());

        snapshots
            .wait_for(|s| s.phase == Some(RunPhase::Stopped))
            .await
            .unwrap();
        assert_eq!(handle.request(Intent::Stop).await, Err(DispatchError::NotConnected));

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejections_are_replied() {
        let (handle, task) = spawn_runtime(DuplexOpener::failing());

        assert!(matches!(
            handle.request(connect("/dev/ttyUSB0", "1")).await,
            Err(DispatchError::PortUnavailable(_))
        ));
        assert_eq!(
            handle.request(Intent::SendDisturbance("1".into())).await,
            Err(DispatchError::NotConnected)
        );
        assert!(handle.submit(Intent::ChangeMode(OperatingMode::FanOnly)).await);

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_export_after_stop() {
        let opener = DuplexOpener::default();
        let (handle, task) = spawn_runtime(opener.clone());
        let mut snapshots = handle.subscribe();
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.csv");

        handle.request(connect("sim", "1")).await.unwrap();
        let mut device = opener.take_device();
        device.write_all(b"DADOS,25.0,30.0,127.5,0,0,0\n").await.unwrap();
        snapshots.wait_for(|s| s.record_count == 1).await.unwrap();

        let export = Intent::Export { path: path.clone(), format: None };
        assert!(matches!(
            handle.request(export.clone()).await,
            Err(DispatchError::ExportUnavailable(_))
        ));

        handle.request(Intent::Stop).await.unwrap();
        assert!(handle.snapshot().export_available);
        handle.request(export).await.unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
        let row: Vec<&str> = contents.lines().nth(1).unwrap().split(',').collect();
        assert_eq!(&row[1..7], &["25", "30", "6", "0", "0", "-"]);

        drop(handle);
        task.await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_connect_answered_while_export_pending() {
        let opener = DuplexOpener::default();
        let (handle, task) = spawn_runtime(opener.clone());
        let mut snapshots = handle.subscribe();
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.csv");

        handle.request(connect("sim", "1")).await.unwrap();
        let mut device = opener.take_device();
        device.write_all(b"DADOS,25.0,30.0,127.5,0,0,0\n").await.unwrap();
        snapshots.wait_for(|s| s.record_count == 1).await.unwrap();
        handle.request(Intent::Stop).await.unwrap();

        // Opening a FIFO for writing blocks until something reads it
        let status = std::process::Command::new("mkfifo").arg(&path).status().unwrap();
        assert!(status.success());

        let (reply, mut exported) = oneshot::channel();
        let export = Intent::Export { path: path.clone(), format: None };
        handle.requests.send(Request { intent: export, reply: Some(reply) }).await.unwrap();

        let connected = time::timeout(Duration::from_secs(5), handle.request(connect("sim", "1")))
            .await
            .expect("connect was not answered while the export was blocked");
        assert_eq!(connected, Ok(()));
        assert!(exported.try_recv().is_err());

        let fifo = path.clone();
        let contents = tokio::task::spawn_blocking(move || fs::read_to_string(fifo))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exported.await.unwrap(), Ok(()));
        assert_eq!(contents.lines().count(), 2);

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_open_session() {
        let opener = DuplexOpener::default();
        let (handle, task) = spawn_runtime(opener.clone());

        handle.request(connect("sim", "1")).await.unwrap();
        let device = opener.take_device();
        drop(handle);
        task.await.unwrap();

        assert!(transcript(device).await.ends_with("STOP\n"));
    }

    #[tokio::test]
    async fn test_request_after_runtime_exit() {
        let (runtime, handle) = SessionRuntime::new(DuplexOpener::default(), &Config::default());
        drop(runtime);
        assert_eq!(handle.request(Intent::Stop).await, Err(DispatchError::RuntimeStopped));
        assert!(!handle.submit(Intent::Stop).await);
    }
}
