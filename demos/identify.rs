//! Example: Identify an instrument and drain its error queue
//!
//! Run with: cargo run --example identify --features linux-gpib -- [board] [pad]
//!
//! This example demonstrates:
//! - Opening a device by bus address
//! - Querying `*IDN?` and `SYST:ERR?`
//! - Reading the per-thread status after a call
//! - Driver tracing via `RUST_LOG=gpib_session=trace`

use gpib_session::{last_count, last_status, DeviceConfig, Gpib, Instrument, Timeout};

fn main() -> gpib_session::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let board = args.next().and_then(|a| a.parse().ok()).unwrap_or(0);
    let pad = args.next().and_then(|a| a.parse().ok()).unwrap_or(3);

    // =========================================================================
    // Open by address
    // =========================================================================

    let gpib = Gpib::linux();
    let config = DeviceConfig::new(board, pad).with_timeout(Timeout::T3s);
    let instrument = Instrument::new(gpib.open(&config)?);

    // =========================================================================
    // Identify
    // =========================================================================

    let id = instrument.identify()?;
    println!("Manufacturer: {}", id.manufacturer);
    println!("Model:        {}", id.model);
    println!("Serial:       {}", id.serial);
    println!("Firmware:     {}", id.firmware);
    println!("Last status:  {} ({} bytes)", last_status(), last_count());

    // =========================================================================
    // Error queue
    // =========================================================================

    match instrument.errors() {
        Ok(errors) if errors.is_empty() => println!("No errors queued"),
        Ok(errors) => {
            for error in errors {
                println!("Error: {}", error);
            }
        }
        Err(e) => println!("Error queue not supported: {}", e),
    }

    let mut session = instrument.into_session();
    session.close()
}
