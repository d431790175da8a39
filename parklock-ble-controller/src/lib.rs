//! Parklock BLE Controller
//!
//! Drives a BLE parking lock: finds it by its advertise fingerprint,
//! connects, writes command frames and turns notifications into lock
//! outcomes.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use parklock_ble_controller::{BtleTransport, LockSession, SessionEvent, Timings, inbox};
//! use parklock_proto::LockAction;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let inbox = inbox();
//!     let transport = BtleTransport::new(inbox.sink()).await?;
//!     let (session, mut events) = LockSession::new(Arc::new(transport), inbox, Timings::default());
//!     let lock = session.handle();
//!     tokio::spawn(session.run());
//!
//!     lock.configure("AA:BB:CC:DD:EE:FF", "V2", Some("12345678")).await?;
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             SessionEvent::Connected => {
//!                 lock.request_action(LockAction::TurnDown).await?;
//!             }
//!             SessionEvent::LockTurnedDown => break,
//!             _ => {}
//!         }
//!     }
//!
//!     lock.shutdown();
//!     Ok(())
//! }
//! ```

pub mod ble;
pub mod config;
pub mod link;
pub mod session;
pub mod timer;
pub mod transport;

pub use ble::BtleTransport;
pub use config::{ConfigError, LockConfig, Timings};
pub use link::{ConnectionState, LinkController, LinkEvent};
pub use session::{
    Dispatch, EventSink, Inbox, LockHandle, LockSession, SessionError, SessionEvent,
    SessionState, inbox,
};
pub use transport::{
    Advertisement, GattService, PeripheralHandle, RadioState, Transport, TransportError,
    TransportEvent,
};
