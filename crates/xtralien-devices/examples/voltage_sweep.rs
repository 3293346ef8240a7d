//! Sweep the voltage on SMU 1 of the first instrument found and print the
//! measured current at each step.
//!
//! Run with `cargo run --example voltage_sweep`.
use std::time::Duration;

use xtralien_core::config::Config;
use xtralien_devices::{CallOptions, Device, Format, Response};

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = Config::default();
    let device = Device::first(&config).await?;
    info!("Using {}", device);

    let serial = device.serial_number().await?;
    info!(serial = %serial, year = serial.full_year(), "Connected");

    let smu = device.step("smu1");
    smu.dup()
        .step("set")
        .step("enabled")
        .call_with([1], CallOptions::new().no_response())
        .await?;

    for step in 0..=10 {
        let volts = f64::from(step) * 0.1;
        let reading = smu
            .dup()
            .step("oneshot")
            .call_with([volts], CallOptions::new().with_format(Format::Array))
            .await?;

        if let Response::Array(values) = reading {
            println!("{:>5.2} V  {:>12.6e} A", values[0], values.get(1).copied().unwrap_or_default());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // One last reading, reported through a callback
    let background = smu.dup().step("measure").call_with_callback(
        std::iter::empty::<&str>(),
        CallOptions::new(),
        |result| match result {
            Ok(reading) => println!("final: {}", reading),
            Err(e) => eprintln!("final reading failed: {}", e),
        },
    );
    background.await?;

    smu.step("set")
        .step("enabled")
        .call_with([0], CallOptions::new().no_response())
        .await?;
    device.close().await?;
    Ok(())
}
