//! Confirmation gates.
//!
//! A [`Confirmer`] decides *when* an id is confirmed (policy, timer or human);
//! the [`Controller`] decides *what* flows downstream: a lane emits an id once
//! the id it was asked for equals the id it was allowed.

use std::time::Duration;

use gitops_core::api::{ConfirmationStatus, GateKind, LaneStatus};
use gitops_core::now_ms;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::ConfirmError;

/// How a gate confirms submissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmMode {
    /// Every submission is confirmed immediately.
    Without,
    /// Waits for an explicit confirm.
    Manual,
    /// Confirms on its own after the duration unless cancelled.
    Auto(Duration),
}

impl ConfirmMode {
    /// Name shown in the status.
    pub fn name(&self) -> &'static str {
        match self {
            ConfirmMode::Without => "without",
            ConfirmMode::Manual => "manual",
            ConfirmMode::Auto(_) => "auto",
        }
    }

    /// False for `Without`: the gate's lane then passes everything.
    pub fn is_enabled(&self) -> bool {
        !matches!(self, ConfirmMode::Without)
    }

    fn auto_secs(&self) -> Option<u64> {
        match self {
            ConfirmMode::Auto(d) => Some(d.as_secs()),
            _ => None,
        }
    }
}

#[derive(Debug)]
enum Command {
    Submit(String),
    Confirm(String),
    Cancel,
}

/// Handle to a confirmation actor. Cheap to clone.
#[derive(Clone)]
pub struct Confirmer {
    gate: GateKind,
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<ConfirmationStatus>,
}

impl Confirmer {
    /// Spawns the actor. Confirmed ids arrive on the returned receiver; the
    /// actor waits for each one to be received before processing more commands.
    pub fn spawn(gate: GateKind, mode: ConfirmMode) -> (Self, mpsc::Receiver<String>) {
        let (commands_tx, commands_rx) = mpsc::channel(32);
        let (fired_tx, fired_rx) = mpsc::channel(1);
        let (notify_tx, notify_rx) = mpsc::channel(1);

        let actor = Actor {
            gate,
            mode,
            submitted: None,
            confirmed: None,
            timer: None,
            epoch: 0,
            auto_started_at_ms: None,
            fired: fired_tx,
            notify: notify_tx,
            status: watch::Sender::new(ConfirmationStatus::default()),
        };
        let status = actor.status.subscribe();
        actor.publish();
        tokio::spawn(actor.run(commands_rx, fired_rx));

        (
            Self {
                gate,
                commands: commands_tx,
                status,
            },
            notify_rx,
        )
    }

    async fn send(&self, cmd: Command) -> Result<(), ConfirmError> {
        self.commands
            .send(cmd)
            .await
            .map_err(|_| ConfirmError::Closed(self.gate))
    }

    /// Submits `id`, replacing any pending submission and its timer.
    pub async fn submit(&self, id: impl Into<String>) -> Result<(), ConfirmError> {
        let id = id.into();
        if id.is_empty() {
            return Err(ConfirmError::EmptyId);
        }
        self.send(Command::Submit(id)).await
    }

    /// Confirms `id`. May precede the matching submission.
    pub async fn confirm(&self, id: impl Into<String>) -> Result<(), ConfirmError> {
        let id = id.into();
        if id.is_empty() {
            return Err(ConfirmError::EmptyId);
        }
        self.send(Command::Confirm(id)).await
    }

    /// Drops the pending submission, any confirmation and the auto timer.
    pub async fn cancel(&self) -> Result<(), ConfirmError> {
        self.send(Command::Cancel).await
    }

    /// Latest published state.
    pub fn status(&self) -> ConfirmationStatus {
        self.status.borrow().clone()
    }
}

struct Actor {
    gate: GateKind,
    mode: ConfirmMode,
    submitted: Option<String>,
    confirmed: Option<String>,
    timer: Option<JoinHandle<()>>,
    // Bumped on every arm/disarm; fire events from older timers are ignored.
    epoch: u64,
    auto_started_at_ms: Option<i64>,
    fired: mpsc::Sender<u64>,
    notify: mpsc::Sender<String>,
    status: watch::Sender<ConfirmationStatus>,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut fired: mpsc::Receiver<u64>,
    ) {
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                Some(epoch) = fired.recv() => self.on_timer(epoch),
            }
            if !self.emit().await {
                break;
            }
            self.publish();
        }
        self.disarm();
        debug!(gate = %self.gate, "confirmer stopped");
    }

    fn handle(&mut self, cmd: Command) {
        debug!(gate = %self.gate, ?cmd, "confirmer command");
        match cmd {
            Command::Submit(id) => {
                self.disarm();
                match self.mode {
                    ConfirmMode::Without => self.confirmed = Some(id.clone()),
                    ConfirmMode::Auto(after) => self.arm(after),
                    ConfirmMode::Manual => {}
                }
                self.submitted = Some(id);
            }
            Command::Confirm(id) => self.confirmed = Some(id),
            Command::Cancel => {
                self.disarm();
                self.submitted = None;
                self.confirmed = None;
            }
        }
    }

    fn on_timer(&mut self, epoch: u64) {
        if epoch != self.epoch || self.timer.is_none() {
            return;
        }
        self.timer = None;
        self.auto_started_at_ms = None;
        if let Some(id) = &self.submitted {
            info!(gate = %self.gate, %id, "auto confirmation");
            self.confirmed = Some(id.clone());
        }
    }

    fn arm(&mut self, after: Duration) {
        self.epoch += 1;
        let epoch = self.epoch;
        let fired = self.fired.clone();
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = fired.send(epoch).await;
        }));
        self.auto_started_at_ms = Some(now_ms());
    }

    fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.epoch += 1;
        self.auto_started_at_ms = None;
    }

    /// Emits the submission once it is confirmed. Returns false when nobody
    /// listens anymore.
    async fn emit(&mut self) -> bool {
        if self.submitted.is_none() || self.submitted != self.confirmed {
            return true;
        }
        self.confirmed = None;
        let Some(id) = self.submitted.take() else {
            return true;
        };
        self.disarm();
        self.publish();

        info!(gate = %self.gate, %id, "confirmed");
        self.notify.send(id).await.is_ok()
    }

    fn publish(&self) {
        self.status.send_replace(ConfirmationStatus {
            mode: self.mode.name().to_string(),
            auto_confirm_secs: self.mode.auto_secs(),
            submitted: self.submitted.clone(),
            confirmed: self.confirmed.clone(),
            auto_armed: self.timer.is_some(),
            auto_started_at_ms: self.auto_started_at_ms,
        });
    }
}

/// One controller lane.
pub struct Lane {
    gate: GateKind,
    enabled: bool,
    state: Mutex<LaneState>,
    out: mpsc::UnboundedSender<String>,
}

#[derive(Default)]
struct LaneState {
    needed: Option<String>,
    allowed: Option<String>,
}

impl Lane {
    fn new(gate: GateKind, enabled: bool) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (out, rx) = mpsc::unbounded_channel();
        let lane = Self {
            gate,
            enabled,
            state: Mutex::new(LaneState::default()),
            out,
        };
        (lane, rx)
    }

    /// Asks for `id` to pass. Passes at once when the lane is disabled or
    /// `id` was allowed beforehand.
    pub async fn ask(&self, id: &str) {
        let mut state = self.state.lock().await;
        state.needed = Some(id.to_string());
        if !self.enabled || state.allowed.as_deref() == Some(id) {
            self.pass(id);
        }
    }

    /// Allows `id` to pass, now or when it is asked for.
    pub async fn allow(&self, id: &str) {
        let mut state = self.state.lock().await;
        state.allowed = Some(id.to_string());
        if state.needed.as_deref() == Some(id) {
            self.pass(id);
        }
    }

    fn pass(&self, id: &str) {
        debug!(gate = %self.gate, %id, "lane passes");
        let _ = self.out.send(id.to_string());
    }

    /// Snapshot of the lane.
    pub async fn status(&self) -> LaneStatus {
        let state = self.state.lock().await;
        LaneStatus {
            enabled: self.enabled,
            needed: state.needed.clone(),
            allowed: state.allowed.clone(),
        }
    }
}

/// Outputs of the two lanes.
pub struct LaneOutputs {
    /// Ids allowed to build.
    pub build: mpsc::UnboundedReceiver<String>,
    /// Ids allowed to deploy.
    pub deploy: mpsc::UnboundedReceiver<String>,
}

/// The build and deploy lanes.
pub struct Controller {
    build: Lane,
    deploy: Lane,
}

impl Controller {
    /// Creates both lanes; disabled lanes pass every id they are asked for.
    pub fn new(build_enabled: bool, deploy_enabled: bool) -> (Self, LaneOutputs) {
        let (build, build_rx) = Lane::new(GateKind::Build, build_enabled);
        let (deploy, deploy_rx) = Lane::new(GateKind::Deploy, deploy_enabled);
        (
            Self { build, deploy },
            LaneOutputs {
                build: build_rx,
                deploy: deploy_rx,
            },
        )
    }

    /// Lane of `gate`.
    pub fn lane(&self, gate: GateKind) -> &Lane {
        match gate {
            GateKind::Build => &self.build,
            GateKind::Deploy => &self.deploy,
        }
    }

    /// The build of `id` is waiting on the build gate.
    pub async fn ask_for_build(&self, id: &str) {
        self.build.ask(id).await
    }

    /// The build gate confirmed `id`.
    pub async fn confirm_for_build(&self, id: &str) {
        self.build.allow(id).await
    }

    /// The deployment of `id` is waiting on the deploy gate.
    pub async fn ask_for_deploy(&self, id: &str) {
        self.deploy.ask(id).await
    }

    /// The deploy gate confirmed `id`.
    pub async fn confirm_for_deploy(&self, id: &str) {
        self.deploy.allow(id).await
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::{timeout, Instant};

    use super::*;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn without_mode_confirms_immediately() {
        let (c, mut rx) = Confirmer::spawn(GateKind::Build, ConfirmMode::Without);
        c.submit("g1").await.unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("g1"));
        settle().await;
        assert_eq!(c.status().submitted, None);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_mode_waits_for_confirm() {
        let (c, mut rx) = Confirmer::spawn(GateKind::Deploy, ConfirmMode::Manual);
        c.submit("g1").await.unwrap();
        assert!(timeout(Duration::from_secs(3600), rx.recv()).await.is_err());
        assert_eq!(c.status().submitted.as_deref(), Some("g1"));

        c.confirm("g1").await.unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("g1"));
    }

    #[tokio::test(start_paused = true)]
    async fn confirm_sticks_until_submitted() {
        let (c, mut rx) = Confirmer::spawn(GateKind::Deploy, ConfirmMode::Manual);
        c.confirm("g2").await.unwrap();
        c.submit("g1").await.unwrap();
        assert!(timeout(Duration::from_secs(10), rx.recv()).await.is_err());

        c.submit("g2").await.unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("g2"));
    }

    #[tokio::test(start_paused = true)]
    async fn auto_mode_confirms_after_duration() {
        let (c, mut rx) = Confirmer::spawn(GateKind::Build, ConfirmMode::Auto(Duration::from_secs(2)));
        let start = Instant::now();
        c.submit("uuid1").await.unwrap();
        settle().await;
        let status = c.status();
        assert!(status.auto_armed);
        assert_eq!(status.mode, "auto");
        assert_eq!(status.auto_confirm_secs, Some(2));

        assert_eq!(rx.recv().await.as_deref(), Some("uuid1"));
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_auto_confirmation() {
        let (c, mut rx) = Confirmer::spawn(GateKind::Build, ConfirmMode::Auto(Duration::from_secs(2)));
        c.submit("uuid1").await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        c.cancel().await.unwrap();

        assert!(timeout(Duration::from_secs(6), rx.recv()).await.is_err());
        let status = c.status();
        assert_eq!(status.submitted, None);
        assert!(!status.auto_armed);
    }

    #[tokio::test(start_paused = true)]
    async fn newest_submission_owns_the_timer() {
        let (c, mut rx) = Confirmer::spawn(GateKind::Build, ConfirmMode::Auto(Duration::from_secs(2)));
        let start = Instant::now();
        c.submit("a").await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        c.submit("b").await.unwrap();

        assert_eq!(rx.recv().await.as_deref(), Some("b"));
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert!(timeout(Duration::from_secs(10), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn empty_ids_are_rejected() {
        let (c, _rx) = Confirmer::spawn(GateKind::Build, ConfirmMode::Manual);
        assert_eq!(c.submit("").await, Err(ConfirmError::EmptyId));
        assert_eq!(c.confirm("").await, Err(ConfirmError::EmptyId));
    }

    #[tokio::test]
    async fn disabled_lane_passes_straight_through() {
        let (ctl, mut out) = Controller::new(false, true);
        ctl.ask_for_build("g1").await;
        assert_eq!(out.build.try_recv().ok().as_deref(), Some("g1"));

        ctl.ask_for_deploy("g1").await;
        assert!(out.deploy.try_recv().is_err());
        ctl.confirm_for_deploy("g1").await;
        assert_eq!(out.deploy.try_recv().ok().as_deref(), Some("g1"));
    }

    #[tokio::test]
    async fn lane_supports_pre_approval() {
        let (ctl, mut out) = Controller::new(true, true);
        ctl.confirm_for_build("g2").await;
        ctl.ask_for_build("g1").await;
        assert!(out.build.try_recv().is_err());

        ctl.ask_for_build("g2").await;
        assert_eq!(out.build.try_recv().ok().as_deref(), Some("g2"));

        let status = ctl.lane(GateKind::Build).status().await;
        assert!(status.enabled);
        assert_eq!(status.needed.as_deref(), Some("g2"));
        assert_eq!(status.allowed.as_deref(), Some("g2"));
    }
}
