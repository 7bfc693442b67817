//! Scan for nearby peripherals and read the battery level of the strongest one
//!
//! Run with: cargo run --example battery_reader [ADDRESS]

use ble_battery_session::{ConnectionSession, NativeTransport, Result, SessionConfig};
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

    let wanted = std::env::args().nth(1);

    println!("Scanning for BLE peripherals...\n");

    let transport = Arc::new(NativeTransport::new().await?);
    let session = ConnectionSession::new(transport, SessionConfig::default())?;
    session.start_scan()?;

    tokio::time::sleep(Duration::from_secs(5)).await;

    let snapshot = session.snapshot();
    println!("Found {} peripheral(s):", snapshot.devices.len());
    for device in &snapshot.devices {
        println!(
            "  {:<24} {}  RSSI: {:?} dBm",
            device.display_name(),
            device.address,
            device.rssi
        );
    }

    let target = match &wanted {
        Some(address) => snapshot.devices.iter().find(|d| &d.address == address),
        None => snapshot.devices.first(),
    };

    let Some(device) = target.cloned() else {
        println!("\nNo peripheral to connect to.");
        session.close();
        return Ok(());
    };

    println!("\nConnecting to {} ({})...", device.display_name(), device.address);
    session.connect_device(&device)?;

    let mut updates = session.subscribe();
    let waited = tokio::time::timeout(
        Duration::from_secs(30),
        updates.wait_for(|s| !s.connection_state.is_transitioning()),
    )
    .await
    .map(|r| r.map(|s| s.clone()));

    match waited {
        Ok(Ok(snapshot)) => match (snapshot.connection_state, snapshot.battery_level) {
            (state, Some(level)) => println!("State: {}  Battery: {}%", state, level),
            (state, None) => println!("State: {}  Battery: unavailable", state),
        },
        Ok(Err(_)) => println!("Session ended"),
        Err(_) => println!("Timed out waiting for the peripheral"),
    }

    session.disconnect();
    tokio::time::sleep(Duration::from_millis(500)).await;
    session.close();

    println!("Done.");
    Ok(())
}
