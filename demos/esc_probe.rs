// ESC probe: query status and measured speed once, print the decoded replies
//
// Sends only register reads - no commands, no torque. Safe to run with the
// motor connected.
//
// Usage: cargo run --example esc_probe -- [port] [baud]
// Example: cargo run --example esc_probe -- /dev/ttyUSB0 115200

use smartesc_runtime::config::{ESC_BAUDRATE, ESC_PORT};
use smartesc_runtime::esc::protocol::{encode_register_get, hex, EscState, ParsedFrame, Register};
use smartesc_runtime::esc::{FrameReceiver, SerialTransport, Transport};
use std::thread::sleep;
use std::time::{Duration, Instant};

const REPLY_WAIT: Duration = Duration::from_millis(200);

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Setup logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("debug".parse().unwrap()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let port = args.next().unwrap_or_else(|| ESC_PORT.to_string());
    let baud = match args.next() {
        Some(b) => b.parse()?,
        None => ESC_BAUDRATE,
    };

    println!("SmartESC probe (READ-ONLY)");
    println!("Serial port: {} @ {} baud", port, baud);
    println!();

    let mut link = match SerialTransport::open(&port, baud) {
        Ok(link) => link,
        Err(e) => {
            println!("  ✗ Failed to open serial port: {}", e);
            println!("  - Check the port path and that the adapter is plugged in");
            return Err(e.into());
        }
    };
    let mut receiver = FrameReceiver::new();

    for register in [Register::Status, Register::SpeedMeasured] {
        let frame = encode_register_get(register);
        println!("→ GET {:?}: {}", register, hex(&frame.to_bytes()));
        link.write(&frame.to_bytes())?;

        let deadline = Instant::now() + REPLY_WAIT;
        let mut replies = 0;
        while Instant::now() < deadline && replies == 0 {
            receiver.extend(&link.read_available()?);
            for result in receiver.frames() {
                replies += 1;
                match result {
                    Ok(ParsedFrame::ByteValue { ok, value }) => println!(
                        "  ← {} status {} ({:?})",
                        if ok { "OK" } else { "ERR" },
                        value,
                        EscState::from_byte(value)
                    ),
                    Ok(ParsedFrame::Int32Value { ok, value }) => println!(
                        "  ← {} speed {}",
                        if ok { "OK" } else { "ERR" },
                        value
                    ),
                    Ok(other) => println!("  ← {:?}", other),
                    Err(e) => println!("  ✗ {}", e),
                }
            }
            sleep(Duration::from_millis(5));
        }
        if replies == 0 {
            println!("  ✗ No reply within {}ms", REPLY_WAIT.as_millis());
        }
        println!();
    }

    if !receiver.pending().is_empty() {
        println!("Unparsed bytes left: {}", hex(receiver.pending()));
    }
    Ok(())
}
