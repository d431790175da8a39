//! BLE central transport boundary
//!
//! The session never talks to a radio stack directly. It drives a
//! [`Transport`] and receives everything the radio reports asynchronously as
//! [`TransportEvent`]s pushed into its inbox.

use async_trait::async_trait;
use data_encoding::HEXLOWER;

/// Opaque peripheral reference, the platform address or identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeripheralHandle(pub String);

impl std::fmt::Display for PeripheralHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RadioState {
    Unknown,
    PoweredOn,
    PoweredOff,
    Unauthorized,
    Unsupported,
}

impl RadioState {
    pub fn is_powered_on(self) -> bool {
        self == Self::PoweredOn
    }
}

/// One advertisement record seen while scanning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub peripheral: PeripheralHandle,
    pub local_name: Option<String>,
    /// Company identifier (little endian) followed by the payload
    pub manufacturer_data: Option<Vec<u8>>,
    pub rssi: Option<i16>,
}

impl Advertisement {
    /// Lower-case hex of the manufacturer blob
    pub fn manufacturer_fingerprint(&self) -> Option<String> {
        self.manufacturer_data
            .as_deref()
            .map(|data| HEXLOWER.encode(data))
    }

    /// Exact match against the manufacturer blob or the local name
    pub fn matches(&self, fingerprint: &str) -> bool {
        self.manufacturer_fingerprint().as_deref() == Some(fingerprint)
            || self.local_name.as_deref() == Some(fingerprint)
    }
}

/// A discovered GATT service and the UUIDs of its characteristics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: u128,
    pub characteristics: Vec<u128>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    RadioStateChanged(RadioState),
    Discovered(Advertisement),
    Disconnected(PeripheralHandle),
    Notification {
        peripheral: PeripheralHandle,
        characteristic: u128,
        value: Vec<u8>,
    },
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("no Bluetooth adapter found")]
    NoAdapter,
    #[error("unknown peripheral {0}")]
    UnknownPeripheral(PeripheralHandle),
    #[error("characteristic {0:032x} not found")]
    CharacteristicNotFound(u128),
    #[error("bluetooth error: {0}")]
    Backend(String),
}

/// Central role operations the link controller needs from a radio stack.
///
/// Results of scanning, link loss and notifications are not returned from
/// these calls; implementations push them as [`TransportEvent`]s through the
/// [`EventSink`](crate::EventSink) they were built with.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn radio_state(&self) -> RadioState;

    /// Scan for all peripherals, duplicates filtered
    async fn start_scan(&self) -> Result<(), TransportError>;

    async fn stop_scan(&self) -> Result<(), TransportError>;

    async fn connect(&self, peripheral: &PeripheralHandle) -> Result<(), TransportError>;

    async fn disconnect(&self, peripheral: &PeripheralHandle) -> Result<(), TransportError>;

    async fn discover_services(
        &self,
        peripheral: &PeripheralHandle,
    ) -> Result<Vec<GattService>, TransportError>;

    async fn set_notify(
        &self,
        peripheral: &PeripheralHandle,
        characteristic: u128,
        enabled: bool,
    ) -> Result<(), TransportError>;

    /// Acknowledged write, resolves once the peripheral confirmed receipt
    async fn write(
        &self,
        peripheral: &PeripheralHandle,
        characteristic: u128,
        value: &[u8],
    ) -> Result<(), TransportError>;
}
