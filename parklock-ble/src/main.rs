//! Command line tool for BLE parking locks
//!
//! Finds a lock by its advertise fingerprint and turns it up or down.

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use log::debug;
use parklock_ble_controller::{
    BtleTransport, Dispatch, LockConfig, LockHandle, LockSession, SessionEvent, Timings, ble,
    inbox,
};
use parklock_proto::{
    DeviceIdentity, Generation, LockAction, MacAddress, advertise_fingerprint,
};
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Parser)]
#[command(name = "parklock-ble")]
#[command(about = "Control BLE parking locks")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List nearby BLE devices and their fingerprints
    Scan {
        /// Scan duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Print the fingerprint a lock advertises
    Fingerprint {
        /// Lock MAC address, AA:BB:CC:DD:EE:FF
        #[arg(short, long)]
        device: String,
        /// Lock type, V1 or V2
        #[arg(short = 't', long, default_value = "V1")]
        lock_type: String,
    },
    /// Save the lock to the config file
    Init {
        /// Lock MAC address, AA:BB:CC:DD:EE:FF
        #[arg(short, long)]
        device: String,
        /// Lock type, V1 or V2
        #[arg(short = 't', long)]
        lock_type: String,
        /// Secret key (V2 only)
        #[arg(short, long)]
        key: Option<String>,
    },
    /// Turn the lock down and verify
    Down(LockArgs),
    /// Turn the lock up and verify
    Up(LockArgs),
    /// Query the lock status
    Status(LockArgs),
    /// Reset the lock (V1 only)
    Reset(LockArgs),
}

#[derive(Args)]
struct LockArgs {
    /// Lock MAC address, overrides the config file
    #[arg(short, long)]
    device: Option<String>,
    /// Lock type, overrides the config file
    #[arg(short = 't', long)]
    lock_type: Option<String>,
    /// Secret key, overrides the config file
    #[arg(short, long)]
    key: Option<String>,
    /// Give up after this many seconds
    #[arg(long, default_value = "30")]
    timeout: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Scan { duration } => scan_locks(duration).await,
        Commands::Fingerprint { device, lock_type } => print_fingerprint(&device, &lock_type),
        Commands::Init {
            device,
            lock_type,
            key,
        } => init_config(device, lock_type, key),
        Commands::Down(args) => run_action(args, LockAction::TurnDown).await,
        Commands::Up(args) => run_action(args, LockAction::TurnUp).await,
        Commands::Status(args) => run_action(args, LockAction::CheckStatus).await,
        Commands::Reset(args) => run_action(args, LockAction::Reset).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
    Ok(())
}

async fn scan_locks(duration: u64) -> Result<(), Box<dyn Error>> {
    let configured = LockConfig::load_optional(&LockConfig::default_path()?)?
        .and_then(|c| {
            let generation = Generation::from_tag(&c.lock_type).ok()?;
            DeviceIdentity::new(&c.device_id, generation, c.secret_key.as_deref()).ok()
        })
        .map(|identity| identity.fingerprint().to_string());

    println!("Scanning for parking locks ({} seconds)...", duration);
    let found = ble::scan(Duration::from_secs(duration)).await?;

    println!("\nFound {} devices:", found.len());
    for ad in found {
        let name = ad.local_name.clone().unwrap_or_else(|| "Unknown".to_string());
        let data = ad.manufacturer_fingerprint().unwrap_or_else(|| "-".to_string());
        let rssi = ad.rssi.map(|r| format!("{} dBm", r)).unwrap_or_else(|| "N/A".to_string());
        let marker = match &configured {
            Some(fingerprint) if ad.matches(fingerprint) => " [LOCK]",
            _ => "",
        };
        println!("  {} ({}) data={} RSSI: {}{}", name, ad.peripheral, data, rssi, marker);
    }
    Ok(())
}

fn print_fingerprint(device: &str, lock_type: &str) -> Result<(), Box<dyn Error>> {
    let generation = Generation::from_tag(lock_type)?;
    let mac = MacAddress::parse(device)?;
    println!("{}", advertise_fingerprint(&mac, generation));
    Ok(())
}

fn init_config(
    device: String,
    lock_type: String,
    key: Option<String>,
) -> Result<(), Box<dyn Error>> {
    let generation = Generation::from_tag(&lock_type)?;
    let identity = DeviceIdentity::new(&device, generation, key.as_deref())?;

    let path = LockConfig::default_path()?;
    let timings = LockConfig::load_optional(&path)?
        .map(|c| c.timings)
        .unwrap_or_default();
    let config = LockConfig {
        device_id: device,
        lock_type,
        secret_key: key,
        timings,
    };
    config.save(&path)?;

    println!("Saved {} lock {} to {}", generation, identity.mac(), path.display());
    println!("  advertises as {}", identity.fingerprint());
    Ok(())
}

/// Merge the config file with command line overrides
fn resolve(args: &LockArgs) -> Result<LockConfig, Box<dyn Error>> {
    let file = LockConfig::load_optional(&LockConfig::default_path()?)?;

    let device_id = args
        .device
        .clone()
        .or_else(|| file.as_ref().map(|c| c.device_id.clone()))
        .ok_or("no lock configured, pass --device or run init")?;
    let lock_type = args
        .lock_type
        .clone()
        .or_else(|| file.as_ref().map(|c| c.lock_type.clone()))
        .unwrap_or_else(|| Generation::Gen1.tag().to_string());
    let secret_key = args
        .key
        .clone()
        .or_else(|| file.as_ref().and_then(|c| c.secret_key.clone()));
    let timings = file.map(|c| c.timings).unwrap_or_else(Timings::default);

    Ok(LockConfig {
        device_id,
        lock_type,
        secret_key,
        timings,
    })
}

async fn run_action(args: LockArgs, action: LockAction) -> Result<(), Box<dyn Error>> {
    let config = resolve(&args)?;

    let inbox = inbox();
    let transport = BtleTransport::new(inbox.sink()).await?;
    let (session, mut events) = LockSession::new(Arc::new(transport), inbox, config.timings.clone());
    let lock = session.handle();
    let task = tokio::spawn(session.run());

    let deadline = Instant::now() + Duration::from_secs(args.timeout);
    let result = configure_and_drive(&lock, &mut events, &config, action, deadline).await;

    lock.shutdown();
    if let Err(e) = task.await {
        debug!("session task ended abnormally: {e}");
    }
    result
}

async fn configure_and_drive(
    lock: &LockHandle,
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    config: &LockConfig,
    action: LockAction,
    deadline: Instant,
) -> Result<(), Box<dyn Error>> {
    lock.configure(&config.device_id, &config.lock_type, config.secret_key.as_deref())
        .await?;
    println!("Scanning for lock {}...", config.device_id);
    drive(lock, events, action, deadline).await
}

/// Request `action` once connected and wait for its outcome
async fn drive(
    lock: &LockHandle,
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    action: LockAction,
    deadline: Instant,
) -> Result<(), Box<dyn Error>> {
    let mut acknowledged = false;

    loop {
        let event = match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => return Err("lock session stopped".into()),
            Err(_) if acknowledged => {
                println!("No verification received, the lock acknowledged the command.");
                return Ok(());
            }
            Err(_) => return Err("timed out waiting for the lock".into()),
        };

        match event {
            SessionEvent::RadioStateChanged { powered_on: true } => {}
            SessionEvent::RadioStateChanged { powered_on: false } => {
                println!("Bluetooth is off, waiting...");
            }
            SessionEvent::RadioUnauthorized => {
                return Err("Bluetooth access is not authorized".into());
            }
            SessionEvent::Connected => {
                println!("Connected!");
                match lock.request_action(action).await? {
                    Dispatch::Written => println!("Sent {:?}", action),
                    Dispatch::ResolvedLocally => {
                        println!("Previous command was interrupted, treating it as done.");
                        acknowledged = true;
                    }
                    Dispatch::Scanning => println!("Lock went away, scanning again..."),
                }
                if action == LockAction::Reset {
                    println!("Reset sent! The lock will restart.");
                    return Ok(());
                }
            }
            SessionEvent::Disconnected => println!("Lock disconnected, scanning again..."),
            SessionEvent::LockTurnedDown | SessionEvent::LockTurnedUp => {
                let position = if event == SessionEvent::LockTurnedDown {
                    "down"
                } else {
                    "up"
                };
                if acknowledged {
                    println!("Verified: lock is {position}.");
                    return Ok(());
                }
                println!("Lock acknowledged: {position}. Verifying...");
                acknowledged = true;
            }
            SessionEvent::ProtocolAnomaly(anomaly) => {
                println!("Lock answered {} ({:?})", anomaly.status, anomaly.kind);
                if !action.is_turn() {
                    return Ok(());
                }
            }
        }
    }
}
