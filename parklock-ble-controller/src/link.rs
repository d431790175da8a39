//! Link controller: scan, match, connect, discover, notify, write
//!
//! # Architecture
//!
//! The controller knows nothing about lock semantics. Its methods drive the
//! [`Transport`] and return the [`LinkEvent`]s the session has to interpret,
//! in order. Transport failures are logged here and never returned; the
//! session sees them only as a later `Disconnected`.
//!
//! ```text
//! ┌──────┐ start_scanning ┌──────────┐  match  ┌────────────┐ discovered ┌───────────┐
//! │ Idle │──────────────>│ Scanning │───────>│ Connecting │──────────>│ Connected │
//! └──────┘                └──────────┘         └────────────┘            └───────────┘
//!                              ^                  │ connect failed             │
//!                              └──────────────────┘                            │ link lost
//!                                                                              v
//!                                                                      ┌──────────────┐
//!                                                                      │ Disconnected │
//!                                                                      └──────────────┘
//! ```

use std::sync::Arc;

use log::{debug, info, warn};
use parklock_proto::ble::gatt_profile;
use parklock_proto::{CommandFrame, Generation};
use tokio::sync::mpsc;

use crate::config::Timings;
use crate::session::Input;
use crate::timer::{Deferred, Timer};
use crate::transport::{Advertisement, PeripheralHandle, RadioState, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Scanning,
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    RadioPowerChanged(bool),
    RadioUnauthorized,
    /// Characteristics are known, writes go through from here on
    Connected,
    Disconnected { radio_on: bool },
    NotificationReceived(Vec<u8>),
    /// Informational, the peripheral confirmed a write
    WriteAcknowledged,
}

impl LinkEvent {
    /// An unauthorized radio is also reported as off
    pub fn for_radio(state: RadioState) -> Vec<LinkEvent> {
        match state {
            RadioState::PoweredOn => vec![LinkEvent::RadioPowerChanged(true)],
            RadioState::Unauthorized => vec![
                LinkEvent::RadioUnauthorized,
                LinkEvent::RadioPowerChanged(false),
            ],
            RadioState::Unknown | RadioState::PoweredOff | RadioState::Unsupported => {
                vec![LinkEvent::RadioPowerChanged(false)]
            }
        }
    }
}

pub struct LinkController {
    transport: Arc<dyn Transport>,
    timers: mpsc::UnboundedSender<Input>,
    timings: Timings,
    state: ConnectionState,
    radio: RadioState,
    fingerprint: Option<String>,
    peripheral: Option<PeripheralHandle>,
    generation: Generation,
    notify_characteristic: Option<u128>,
    write_characteristic: Option<u128>,
    last_write: Option<Vec<u8>>,
    awaiting_response: bool,
    delay_next_scan: bool,
    scan_restart: Deferred,
    write_replay: Deferred,
}

impl LinkController {
    /// `generation` is the caller's hint; service discovery may override it.
    pub fn new(
        transport: Arc<dyn Transport>,
        timers: mpsc::UnboundedSender<Input>,
        timings: Timings,
        generation: Generation,
    ) -> Self {
        Self {
            transport,
            timers,
            timings,
            state: ConnectionState::Idle,
            radio: RadioState::Unknown,
            fingerprint: None,
            peripheral: None,
            generation,
            notify_characteristic: None,
            write_characteristic: None,
            last_write: None,
            awaiting_response: false,
            delay_next_scan: false,
            scan_restart: Deferred::new(Timer::ScanRestart),
            write_replay: Deferred::new(Timer::WriteReplay),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Detected generation, authoritative over the caller's hint once
    /// services have been discovered
    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn radio_state(&self) -> RadioState {
        self.radio
    }

    pub fn has_write_characteristic(&self) -> bool {
        self.write_characteristic.is_some()
    }

    pub fn is_awaiting_response(&self) -> bool {
        self.awaiting_response
    }

    pub fn peripheral(&self) -> Option<&PeripheralHandle> {
        self.peripheral.as_ref()
    }

    /// Record the radio state without reporting it
    pub fn set_radio_state(&mut self, state: RadioState) {
        self.radio = state;
    }

    pub fn radio_changed(&mut self, state: RadioState) -> Vec<LinkEvent> {
        self.radio = state;
        if !state.is_powered_on()
            && matches!(self.state, ConnectionState::Scanning | ConnectionState::Connecting)
        {
            self.scan_restart.cancel();
            self.state = ConnectionState::Idle;
        }
        LinkEvent::for_radio(state)
    }

    pub async fn start_scanning(&mut self, fingerprint: &str) -> Vec<LinkEvent> {
        self.fingerprint = Some(fingerprint.to_string());

        if !self.radio.is_powered_on() {
            debug!("radio is {:?}, not scanning", self.radio);
            return vec![];
        }

        match self.state {
            ConnectionState::Connected => return vec![LinkEvent::Connected],
            ConnectionState::Scanning | ConnectionState::Connecting => return vec![],
            ConnectionState::Idle | ConnectionState::Disconnected => {}
        }

        self.state = ConnectionState::Scanning;
        if self.delay_next_scan {
            self.delay_next_scan = false;
            info!(
                "delaying scan for {:?} after background",
                self.timings.scan_restart()
            );
            self.scan_restart
                .schedule(self.timings.scan_restart(), &self.timers, |timer, epoch| {
                    Input::Timer { timer, epoch }
                });
        } else {
            self.begin_scan().await;
        }
        vec![]
    }

    async fn begin_scan(&mut self) {
        info!("scanning for lock {}", self.fingerprint.as_deref().unwrap_or_default());
        if let Err(e) = self.transport.start_scan().await {
            warn!("failed to start scan: {e}");
            self.state = ConnectionState::Idle;
        }
    }

    /// Only touches the transport while scanning
    pub async fn stop_scanning(&mut self) {
        if self.state != ConnectionState::Scanning {
            return;
        }
        self.scan_restart.cancel();
        if let Err(e) = self.transport.stop_scan().await {
            warn!("failed to stop scan: {e}");
        }
        self.state = ConnectionState::Idle;
    }

    pub async fn on_discovered(&mut self, advertisement: Advertisement) -> Vec<LinkEvent> {
        if self.state != ConnectionState::Scanning {
            return vec![];
        }
        let Some(fingerprint) = self.fingerprint.as_deref() else {
            return vec![];
        };
        if !advertisement.matches(fingerprint) {
            debug!(
                "ignoring {} name={:?} data={:?}",
                advertisement.peripheral,
                advertisement.local_name,
                advertisement.manufacturer_fingerprint()
            );
            return vec![];
        }

        info!(
            "found lock {fingerprint} at {} (rssi {:?})",
            advertisement.peripheral, advertisement.rssi
        );
        self.state = ConnectionState::Connecting;
        self.peripheral = Some(advertisement.peripheral);
        self.connect().await
    }

    async fn connect(&mut self) -> Vec<LinkEvent> {
        let Some(peripheral) = self.peripheral.clone() else {
            return vec![];
        };

        if let Err(e) = self.transport.connect(&peripheral).await {
            warn!("failed to connect to {peripheral}: {e}");
            self.peripheral = None;
            self.state = ConnectionState::Scanning;
            return vec![];
        }

        if let Err(e) = self.transport.stop_scan().await {
            warn!("failed to stop scan: {e}");
        }

        let services = match self.transport.discover_services(&peripheral).await {
            Ok(services) => services,
            Err(e) => {
                warn!("service discovery on {peripheral} failed: {e}");
                if let Err(e) = self.transport.disconnect(&peripheral).await {
                    debug!("disconnect after failed discovery: {e}");
                }
                self.peripheral = None;
                self.state = ConnectionState::Idle;
                if let Some(fingerprint) = self.fingerprint.clone() {
                    return self.start_scanning(&fingerprint).await;
                }
                return vec![];
            }
        };

        let gen2 = gatt_profile(Generation::Gen2).service;
        self.generation = if services.iter().any(|s| s.uuid == gen2) {
            Generation::Gen2
        } else {
            Generation::Gen1
        };

        let profile = gatt_profile(self.generation);
        let has = |uuid: u128| services.iter().any(|s| s.characteristics.contains(&uuid));

        self.notify_characteristic = None;
        if has(profile.notify) {
            match self.transport.set_notify(&peripheral, profile.notify, true).await {
                Ok(()) => self.notify_characteristic = Some(profile.notify),
                Err(e) => warn!("failed to enable notifications on {peripheral}: {e}"),
            }
        } else {
            warn!("{peripheral} has no notify characteristic");
        }

        self.write_characteristic = has(profile.write).then_some(profile.write);
        if self.write_characteristic.is_none() {
            warn!("{peripheral} has no write characteristic");
        }

        info!("connected to {peripheral} as {}", self.generation);
        self.state = ConnectionState::Connected;
        vec![LinkEvent::Connected]
    }

    pub fn on_disconnected(&mut self, peripheral: &PeripheralHandle) -> Vec<LinkEvent> {
        if self.peripheral.as_ref() != Some(peripheral) {
            return vec![];
        }
        info!("{peripheral} disconnected");
        self.peripheral = None;
        self.notify_characteristic = None;
        self.write_characteristic = None;
        self.awaiting_response = false;
        self.state = ConnectionState::Disconnected;
        vec![LinkEvent::Disconnected {
            radio_on: self.radio.is_powered_on(),
        }]
    }

    pub fn on_notification(
        &mut self,
        peripheral: &PeripheralHandle,
        characteristic: u128,
        value: Vec<u8>,
    ) -> Vec<LinkEvent> {
        if self.peripheral.as_ref() != Some(peripheral)
            || self.notify_characteristic != Some(characteristic)
        {
            return vec![];
        }
        self.awaiting_response = false;
        vec![LinkEvent::NotificationReceived(value)]
    }

    /// Acknowledged write. Dropped with a log line when not connected.
    pub async fn write(&mut self, frame: &CommandFrame) -> Vec<LinkEvent> {
        let (Some(peripheral), Some(characteristic)) =
            (self.peripheral.clone(), self.write_characteristic)
        else {
            warn!("no write characteristic, dropping {}", frame.to_hex());
            return vec![];
        };

        debug!("writing {} to {peripheral}", frame.to_hex());
        self.last_write = Some(frame.as_bytes().to_vec());
        self.awaiting_response = true;
        self.send(&peripheral, characteristic, frame.as_bytes()).await
    }

    async fn send(
        &mut self,
        peripheral: &PeripheralHandle,
        characteristic: u128,
        value: &[u8],
    ) -> Vec<LinkEvent> {
        match self.transport.write(peripheral, characteristic, value).await {
            Ok(()) => vec![LinkEvent::WriteAcknowledged],
            Err(e) => {
                warn!("write to {peripheral} failed: {e}");
                vec![]
            }
        }
    }

    /// Disable notifications, disconnect, forget the peripheral. Idempotent.
    pub async fn clean_up(&mut self) {
        self.scan_restart.cancel();
        self.write_replay.cancel();
        self.stop_scanning().await;

        if let Some(peripheral) = self.peripheral.take() {
            if let Some(notify) = self.notify_characteristic {
                if let Err(e) = self.transport.set_notify(&peripheral, notify, false).await {
                    debug!("failed to disable notifications: {e}");
                }
            }
            if let Err(e) = self.transport.disconnect(&peripheral).await {
                debug!("failed to disconnect {peripheral}: {e}");
            }
        }

        self.notify_characteristic = None;
        self.write_characteristic = None;
        self.awaiting_response = false;
        self.state = ConnectionState::Disconnected;
    }

    /// Prepare for app suspension.
    ///
    /// Gen2 locks sometimes miss a write made just before suspension, so an
    /// unanswered write is replayed shortly after. Otherwise the next scan
    /// start is delayed, scans started right after resume are unreliable.
    pub fn enter_background(&mut self) {
        if self.awaiting_response
            && self.generation == Generation::Gen2
            && self.last_write.is_some()
        {
            info!("replaying last write in {:?}", self.timings.write_replay());
            self.write_replay
                .schedule(self.timings.write_replay(), &self.timers, |timer, epoch| {
                    Input::Timer { timer, epoch }
                });
        } else {
            self.delay_next_scan = true;
        }
    }

    pub async fn on_timer(&mut self, timer: Timer, epoch: u64) -> Vec<LinkEvent> {
        match timer {
            Timer::ScanRestart => {
                if self.scan_restart.fire(epoch) && self.state == ConnectionState::Scanning {
                    self.begin_scan().await;
                }
                vec![]
            }
            Timer::WriteReplay => {
                if !self.write_replay.fire(epoch) {
                    return vec![];
                }
                match (
                    self.peripheral.clone(),
                    self.write_characteristic,
                    self.last_write.clone(),
                ) {
                    (Some(peripheral), Some(characteristic), Some(last)) => {
                        info!("replaying write to {peripheral}");
                        self.send(&peripheral, characteristic, &last).await
                    }
                    _ => {
                        debug!("nothing to replay");
                        vec![]
                    }
                }
            }
            Timer::StatusVerification => vec![],
        }
    }
}
