//! Run a complete session against the simulated transport
//!
//! Run with: cargo run --example simulated_session

use ble_battery_session::{
    ConnectionSession, ConnectionState, Result, SessionConfig, SimulatedTransport,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ble_battery_session=debug".parse().unwrap()),
        )
        .init();

    let transport = Arc::new(SimulatedTransport::demo()?);
    let session = ConnectionSession::new(transport, SessionConfig::default())?;

    // Print every state change
    let mut updates = session.subscribe();
    let printer = tokio::spawn(async move {
        let mut last = None;
        while updates.changed().await.is_ok() {
            let snapshot = updates.borrow_and_update().clone();
            let summary = (
                snapshot.connection_state,
                snapshot.is_scanning,
                snapshot.devices.len(),
                snapshot.battery_level,
            );
            if last != Some(summary) {
                println!(
                    "state={:<12} scanning={:<5} devices={} battery={:?}",
                    snapshot.connection_state.to_string(),
                    snapshot.is_scanning,
                    snapshot.devices.len(),
                    snapshot.battery_level
                );
                last = Some(summary);
            }
        }
    });

    println!("Scanning...");
    session.start_scan()?;
    tokio::time::sleep(Duration::from_secs(2)).await;

    let snapshot = session.snapshot();
    for device in &snapshot.devices {
        println!(
            "  {:<24} {}  RSSI: {:?} dBm",
            device.display_name(),
            device.address,
            device.rssi
        );
    }

    if let Some(device) = snapshot.devices.first() {
        println!("\nConnecting to {}...", device.display_name());
        session.connect_device(device)?;

        let mut updates = session.subscribe();
        let _ = updates
            .wait_for(|s| s.connection_state != ConnectionState::Connecting)
            .await;
    }

    session.disconnect();
    tokio::time::sleep(Duration::from_millis(100)).await;
    session.close();
    printer.abort();
    println!("Done.");
    Ok(())
}
