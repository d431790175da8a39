//! Parking lock wire protocol - device identity, command frames and
//! notification decoding
//!
//! Everything in this crate is pure: no I/O, no async, no clocks. The BLE
//! link and the session state machine live in `parklock-ble-controller`.

pub mod ble;
mod frame;
mod identity;

pub use frame::{
    Anomaly, AnomalyKind, Classified, CommandFrame, HandleResult, LockAction, LockStatus,
    PendingAction, decode_notification, encode, status_field,
};
pub use identity::{DeviceIdentity, MacAddress, advertise_fingerprint, validate_fingerprint};

/// Hardware/firmware protocol family of a lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Generation {
    /// Type 1: fixed command frames, 16-bit GATT UUIDs
    Gen1,
    /// Type 2: keyed command frames, 128-bit vendor GATT UUIDs
    Gen2,
}

impl Generation {
    /// Parse the caller-facing tag, `"V1"` or `"V2"`
    pub fn from_tag(tag: &str) -> Result<Self, ProtoError> {
        match tag {
            "V1" => Ok(Self::Gen1),
            "V2" => Ok(Self::Gen2),
            other => Err(ProtoError::InvalidGeneration(other.to_string())),
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            Self::Gen1 => "V1",
            Self::Gen2 => "V2",
        }
    }
}

impl std::str::FromStr for Generation {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_tag(s)
    }
}

impl std::fmt::Display for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtoError {
    #[error("invalid lock device id {0:?}, expected AA:BB:CC:DD:EE:FF")]
    InvalidDeviceId(String),
    #[error("invalid advertise data {0:?}, expected 12 or 14 characters")]
    InvalidAdvertiseData(String),
    #[error("unknown lock type {0:?}, expected V1 or V2")]
    InvalidGeneration(String),
    #[error("a secret key is required for V2 locks")]
    MissingSecretKey,
    #[error("secret key must be an even number of hex digits")]
    InvalidSecretKey,
    #[error("{action:?} is not supported by {generation} locks")]
    UnsupportedAction {
        action: LockAction,
        generation: Generation,
    },
    #[error("command frame {0:?} is not valid hex")]
    InvalidFrame(String),
}
