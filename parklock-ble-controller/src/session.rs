//! Lock session: the caller-facing state machine
//!
//! One session drives one lock. Caller commands, transport events and timer
//! expiries all arrive through a single ordered inbox and are handled one at
//! a time, so no protocol state is ever touched concurrently. Outcomes go
//! back to the caller as [`SessionEvent`]s on a channel.
//!
//! ```text
//! configure ──> Ready ──> Scanning ──> Connected ──request──> AwaitingTurnAck
//!                                          ^                       │ ack
//!                                          │                       v
//!                                          └──status── AwaitingCheckAck (after 5s)
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, info, warn};
use parklock_proto::{
    Anomaly, Classified, DeviceIdentity, Generation, HandleResult, LockAction, LockStatus,
    PendingAction, ProtoError, decode_notification, encode,
};
use tokio::sync::{mpsc, oneshot};

use crate::config::Timings;
use crate::link::{ConnectionState, LinkController, LinkEvent};
use crate::timer::{Deferred, Timer};
use crate::transport::{RadioState, Transport, TransportEvent};

/// What the caller is told
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    RadioStateChanged { powered_on: bool },
    RadioUnauthorized,
    Connected,
    Disconnected,
    LockTurnedDown,
    LockTurnedUp,
    /// A notification that could not be classified
    ProtocolAnomaly(Anomaly),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Unconfigured,
    Ready,
    Scanning,
    Connected,
    AwaitingCheckAck,
    AwaitingTurnAck,
}

/// How a request was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dispatch {
    /// Frame written, outcome will follow as events
    Written,
    /// Answered from the retry flag without touching the lock
    ResolvedLocally,
    /// Not connected, scanning started instead. Request again once connected.
    Scanning,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtoError),
    #[error("no lock configured")]
    NotConfigured,
    #[error("{0:?} is still waiting for a response")]
    ActionInFlight(LockAction),
    #[error("connected, but the lock has no write characteristic")]
    NotReady,
    #[error("lock session is not running")]
    Closed,
}

pub enum Command {
    Configure {
        device_id: String,
        lock_type: String,
        secret_key: Option<String>,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Request {
        action: LockAction,
        reply: oneshot::Sender<Result<Dispatch, SessionError>>,
    },
    State {
        reply: oneshot::Sender<SessionState>,
    },
    EnterBackground,
    TearDown {
        reply: oneshot::Sender<()>,
    },
    Shutdown,
}

/// Everything the session reacts to
pub enum Input {
    Command(Command),
    Transport(TransportEvent),
    Timer { timer: Timer, epoch: u64 },
}

/// Where a transport pushes its events
#[derive(Clone)]
pub struct EventSink(mpsc::UnboundedSender<Input>);

impl EventSink {
    /// False once the session is gone
    pub fn push(&self, event: TransportEvent) -> bool {
        self.0.send(Input::Transport(event)).is_ok()
    }
}

/// The session's input queue. Create it first so the transport can be
/// given a sink before the session exists.
pub struct Inbox {
    tx: mpsc::UnboundedSender<Input>,
    rx: mpsc::UnboundedReceiver<Input>,
}

pub fn inbox() -> Inbox {
    let (tx, rx) = mpsc::unbounded_channel();
    Inbox { tx, rx }
}

impl Inbox {
    pub fn sink(&self) -> EventSink {
        EventSink(self.tx.clone())
    }
}

/// Cloneable handle for driving a session that runs as its own task
#[derive(Clone)]
pub struct LockHandle {
    tx: mpsc::UnboundedSender<Input>,
}

impl LockHandle {
    async fn call<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Input::Command(command(reply)))
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    pub async fn configure(
        &self,
        device_id: &str,
        lock_type: &str,
        secret_key: Option<&str>,
    ) -> Result<(), SessionError> {
        self.call(|reply| Command::Configure {
            device_id: device_id.to_string(),
            lock_type: lock_type.to_string(),
            secret_key: secret_key.map(str::to_string),
            reply,
        })
        .await?
    }

    pub async fn request_action(&self, action: LockAction) -> Result<Dispatch, SessionError> {
        self.call(|reply| Command::Request { action, reply }).await?
    }

    pub async fn state(&self) -> Result<SessionState, SessionError> {
        self.call(|reply| Command::State { reply }).await
    }

    pub fn enter_background(&self) -> Result<(), SessionError> {
        self.tx
            .send(Input::Command(Command::EnterBackground))
            .map_err(|_| SessionError::Closed)
    }

    pub async fn tear_down(&self) -> Result<(), SessionError> {
        self.call(|reply| Command::TearDown { reply }).await
    }

    /// Tear down and stop the session task
    pub fn shutdown(&self) {
        let _ = self.tx.send(Input::Command(Command::Shutdown));
    }
}

pub struct LockSession {
    transport: Arc<dyn Transport>,
    timings: Timings,
    inbox: mpsc::UnboundedReceiver<Input>,
    loopback: mpsc::UnboundedSender<Input>,
    events: mpsc::UnboundedSender<SessionEvent>,
    identity: Option<DeviceIdentity>,
    link: Option<LinkController>,
    radio: RadioState,
    /// Written action whose response is outstanding
    pending: Option<PendingAction>,
    /// Turn that started the current verification cycle
    requested: Option<LockAction>,
    /// Outcome of that turn's ack, decides Gen2 status responses
    expectation: Option<HandleResult>,
    /// A turn was written and its verification is not classified yet
    turn_in_flight: bool,
    /// The link dropped during a turn; the next request resolves locally
    retry_pending: bool,
    verification: Deferred,
}

impl LockSession {
    pub fn new(
        transport: Arc<dyn Transport>,
        inbox: Inbox,
        timings: Timings,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let session = Self {
            transport,
            timings,
            inbox: inbox.rx,
            loopback: inbox.tx,
            events,
            identity: None,
            link: None,
            radio: RadioState::Unknown,
            pending: None,
            requested: None,
            expectation: None,
            turn_in_flight: false,
            retry_pending: false,
            verification: Deferred::new(Timer::StatusVerification),
        };
        (session, rx)
    }

    pub fn handle(&self) -> LockHandle {
        LockHandle {
            tx: self.loopback.clone(),
        }
    }

    pub fn identity(&self) -> Option<&DeviceIdentity> {
        self.identity.as_ref()
    }

    /// Generation frames are encoded for: detected once connected,
    /// otherwise the configured one
    pub fn generation(&self) -> Option<Generation> {
        match &self.link {
            Some(link) => Some(link.generation()),
            None => self.identity.as_ref().map(DeviceIdentity::generation),
        }
    }

    pub fn state(&self) -> SessionState {
        if self.identity.is_none() {
            return SessionState::Unconfigured;
        }
        match &self.pending {
            Some(p) if p.action.is_turn() => SessionState::AwaitingTurnAck,
            Some(_) => SessionState::AwaitingCheckAck,
            None => match self.link.as_ref().map(LinkController::state) {
                Some(ConnectionState::Connected) => SessionState::Connected,
                Some(ConnectionState::Scanning | ConnectionState::Connecting) => {
                    SessionState::Scanning
                }
                _ => SessionState::Ready,
            },
        }
    }

    /// Status string the next Gen2 verification is matched against
    pub fn expected_status(&self) -> Option<&'static str> {
        self.expectation.map(HandleResult::expected_status)
    }

    /// Validate and adopt a lock, replacing any previous one.
    ///
    /// Nothing touches the radio when validation fails.
    pub async fn configure(
        &mut self,
        device_id: &str,
        lock_type: &str,
        secret_key: Option<&str>,
    ) -> Result<(), SessionError> {
        let identity = Generation::from_tag(lock_type)
            .and_then(|generation| DeviceIdentity::new(device_id, generation, secret_key))
            .inspect_err(|e| warn!("rejecting lock configuration: {e}"))?;

        self.tear_down().await;
        self.retry_pending = false;
        info!(
            "configured {} lock {} (advertises {})",
            identity.generation(),
            identity.mac(),
            identity.fingerprint()
        );
        self.identity = Some(identity);
        self.ensure_link();

        self.radio = self.transport.radio_state().await;
        let events = match self.link.as_mut() {
            Some(link) => link.radio_changed(self.radio),
            None => vec![],
        };
        self.apply(events).await;
        Ok(())
    }

    /// Ask the lock to do something. At most one action is outstanding.
    pub async fn request_action(&mut self, action: LockAction) -> Result<Dispatch, SessionError> {
        let secret_key = match &self.identity {
            Some(identity) => identity.secret_key().to_string(),
            None => return Err(SessionError::NotConfigured),
        };

        if self.retry_pending {
            self.retry_pending = false;
            info!("previous turn failed, resolving {action:?} locally");
            match action {
                LockAction::TurnDown => self.emit(SessionEvent::LockTurnedDown),
                LockAction::TurnUp => self.emit(SessionEvent::LockTurnedUp),
                LockAction::CheckStatus | LockAction::Reset => {}
            }
            return Ok(Dispatch::ResolvedLocally);
        }

        if let Some(pending) = &self.pending {
            return Err(SessionError::ActionInFlight(pending.action));
        }

        if !self.link.as_ref().is_some_and(LinkController::is_connected) {
            info!("lock not connected, scanning before {action:?}");
            let events = self.start_scanning().await;
            self.apply(events).await;
            return Ok(Dispatch::Scanning);
        }

        let Some(link) = self.link.as_mut() else {
            return Err(SessionError::NotConfigured);
        };
        if !link.has_write_characteristic() {
            return Err(SessionError::NotReady);
        }

        let frame = encode(action, link.generation(), &secret_key)?;
        info!("sending {action:?} to {} lock", link.generation());
        self.pending = Some(PendingAction::new(action, &secret_key));
        if action.is_turn() {
            self.requested = Some(action);
            self.expectation = None;
            self.turn_in_flight = true;
            self.verification.cancel();
        }

        let events = link.write(&frame).await;
        self.apply(events).await;
        Ok(Dispatch::Written)
    }

    pub fn enter_background(&mut self) {
        if let Some(link) = self.link.as_mut() {
            link.enter_background();
        }
    }

    /// Stop scanning, disconnect and drop the link. The identity is kept,
    /// the next request brings the link back.
    pub async fn tear_down(&mut self) {
        self.verification.cancel();
        if let Some(mut link) = self.link.take() {
            link.stop_scanning().await;
            link.clean_up().await;
        }
        self.pending = None;
        self.requested = None;
        self.expectation = None;
        self.turn_in_flight = false;
    }

    /// Handle one input. False once the session has been shut down.
    pub async fn process_next(&mut self) -> bool {
        let Some(input) = self.inbox.recv().await else {
            return false;
        };
        match input {
            Input::Command(Command::Shutdown) => {
                self.tear_down().await;
                return false;
            }
            Input::Command(command) => self.handle_command(command).await,
            Input::Transport(event) => self.handle_transport_event(event).await,
            Input::Timer { timer, epoch } => self.handle_timer(timer, epoch).await,
        }
        true
    }

    pub async fn run(mut self) {
        while self.process_next().await {}
        debug!("lock session stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Configure {
                device_id,
                lock_type,
                secret_key,
                reply,
            } => {
                let result = self
                    .configure(&device_id, &lock_type, secret_key.as_deref())
                    .await;
                let _ = reply.send(result);
            }
            Command::Request { action, reply } => {
                let result = self.request_action(action).await;
                let _ = reply.send(result);
            }
            Command::State { reply } => {
                let _ = reply.send(self.state());
            }
            Command::EnterBackground => self.enter_background(),
            Command::TearDown { reply } => {
                self.tear_down().await;
                let _ = reply.send(());
            }
            Command::Shutdown => {}
        }
    }

    pub async fn handle_transport_event(&mut self, event: TransportEvent) {
        let events = match event {
            TransportEvent::RadioStateChanged(state) => {
                self.radio = state;
                match self.link.as_mut() {
                    Some(link) => link.radio_changed(state),
                    None => LinkEvent::for_radio(state),
                }
            }
            TransportEvent::Discovered(advertisement) => match self.link.as_mut() {
                Some(link) => link.on_discovered(advertisement).await,
                None => vec![],
            },
            TransportEvent::Disconnected(peripheral) => match self.link.as_mut() {
                Some(link) => link.on_disconnected(&peripheral),
                None => vec![],
            },
            TransportEvent::Notification {
                peripheral,
                characteristic,
                value,
            } => match self.link.as_mut() {
                Some(link) => link.on_notification(&peripheral, characteristic, value),
                None => vec![],
            },
        };
        self.apply(events).await;
    }

    async fn handle_timer(&mut self, timer: Timer, epoch: u64) {
        let events = match timer {
            Timer::StatusVerification => {
                if self.verification.fire(epoch) {
                    self.verify_status().await
                } else {
                    vec![]
                }
            }
            Timer::ScanRestart | Timer::WriteReplay => match self.link.as_mut() {
                Some(link) => link.on_timer(timer, epoch).await,
                None => vec![],
            },
        };
        self.apply(events).await;
    }

    /// Interpret link events in order, including any they give rise to
    async fn apply(&mut self, events: Vec<LinkEvent>) {
        let mut queue = VecDeque::from(events);
        while let Some(event) = queue.pop_front() {
            let follow_up = self.on_link_event(event).await;
            queue.extend(follow_up);
        }
    }

    async fn on_link_event(&mut self, event: LinkEvent) -> Vec<LinkEvent> {
        match event {
            LinkEvent::RadioPowerChanged(powered_on) => {
                self.emit(SessionEvent::RadioStateChanged { powered_on });
                if powered_on && self.link.is_some() {
                    return self.start_scanning().await;
                }
            }
            LinkEvent::RadioUnauthorized => {
                warn!("bluetooth is unauthorized");
                self.emit(SessionEvent::RadioUnauthorized);
            }
            LinkEvent::Connected => self.emit(SessionEvent::Connected),
            LinkEvent::Disconnected { radio_on } => return self.on_disconnected(radio_on).await,
            LinkEvent::NotificationReceived(payload) => self.on_notification(&payload),
            LinkEvent::WriteAcknowledged => debug!("write acknowledged"),
        }
        vec![]
    }

    async fn on_disconnected(&mut self, radio_on: bool) -> Vec<LinkEvent> {
        if let Some(link) = self.link.as_mut() {
            link.clean_up().await;
        }
        self.verification.cancel();
        self.pending = None;
        self.expectation = None;

        if self.turn_in_flight {
            info!("link lost during a turn, will resolve the next request locally");
            self.turn_in_flight = false;
            self.retry_pending = true;
            self.requested = None;
            if radio_on {
                return self.start_scanning().await;
            }
            return vec![];
        }

        self.requested = None;
        self.emit(SessionEvent::Disconnected);
        vec![LinkEvent::RadioPowerChanged(radio_on)]
    }

    fn on_notification(&mut self, payload: &[u8]) {
        let Some(generation) = self.generation() else {
            return;
        };
        let pending = self.pending.as_ref().map(|p| p.action);

        match decode_notification(
            payload,
            generation,
            pending,
            self.turn_in_flight,
            self.expectation,
        ) {
            Classified::Ignored => debug!("ignoring notification with nothing pending"),
            Classified::HandleAck(result) => {
                info!(
                    "lock acknowledged {pending:?} with {result:?}, verifying in {:?}",
                    self.timings.status_verification()
                );
                self.expectation = Some(result);
                self.emit(match result.lock_status() {
                    LockStatus::Down => SessionEvent::LockTurnedDown,
                    LockStatus::Up => SessionEvent::LockTurnedUp,
                });
                self.verification.schedule(
                    self.timings.status_verification(),
                    &self.loopback,
                    |timer, epoch| Input::Timer { timer, epoch },
                );
            }
            Classified::Status(status) => {
                self.turn_in_flight = false;
                self.pending = None;
                self.expectation = None;
                match (status, self.requested.take()) {
                    (LockStatus::Down, Some(LockAction::TurnDown)) => {
                        info!("verified lock is down");
                        self.emit(SessionEvent::LockTurnedDown);
                    }
                    (LockStatus::Up, Some(LockAction::TurnUp)) => {
                        info!("verified lock is up");
                        self.emit(SessionEvent::LockTurnedUp);
                    }
                    (status, requested) => {
                        debug!("dropping status {status:?}, requested {requested:?}");
                    }
                }
            }
            Classified::Unclassified(anomaly) => {
                warn!("unexpected response to {pending:?}: {anomaly}");
                if anomaly.kind.concludes_exchange() {
                    self.pending = None;
                }
                self.emit(SessionEvent::ProtocolAnomaly(anomaly));
            }
        }
    }

    /// Write the check that closes a turn's verification cycle
    async fn verify_status(&mut self) -> Vec<LinkEvent> {
        let Some(identity) = self.identity.as_ref() else {
            return vec![];
        };
        let Some(link) = self.link.as_mut() else {
            return vec![];
        };
        if !link.is_connected() {
            debug!("not connected, skipping status verification");
            return vec![];
        }

        let frame = match encode(LockAction::CheckStatus, link.generation(), identity.secret_key())
        {
            Ok(frame) => frame,
            Err(e) => {
                warn!("cannot encode status check: {e}");
                return vec![];
            }
        };
        info!(
            "checking lock status, expecting {}",
            self.expectation
                .map(HandleResult::expected_status)
                .unwrap_or_default()
        );
        self.pending = Some(PendingAction::new(
            LockAction::CheckStatus,
            identity.secret_key(),
        ));
        link.write(&frame).await
    }

    fn ensure_link(&mut self) {
        if self.link.is_some() {
            return;
        }
        if let Some(identity) = &self.identity {
            let mut link = LinkController::new(
                self.transport.clone(),
                self.loopback.clone(),
                self.timings.clone(),
                identity.generation(),
            );
            link.set_radio_state(self.radio);
            self.link = Some(link);
        }
    }

    async fn start_scanning(&mut self) -> Vec<LinkEvent> {
        let Some(fingerprint) = self.identity.as_ref().map(|i| i.fingerprint().to_string())
        else {
            return vec![];
        };
        self.ensure_link();
        match self.link.as_mut() {
            Some(link) => link.start_scanning(&fingerprint).await,
            None => vec![],
        }
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            debug!("session event dropped, no listener");
        }
    }
}
