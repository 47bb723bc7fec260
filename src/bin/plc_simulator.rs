/// SLMP PLC Simulator
///
/// Serves 3E/4E binary frames on TCP or UDP with seeded device data.
/// Usage: plc_simulator [bind_address] [tcp|udp] [error_rate]

use std::time::Duration;
use log::{error, info};
use tokio::signal;
use tokio::time::interval;

use voltage_slmp::{DeviceCode, PlcSimulator, SimulatorConfig, TransportKind};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .init();

    let mut args = std::env::args().skip(1);
    let bind_address = args.next().unwrap_or_else(|| "127.0.0.1:5000".to_string());
    let transport = match args.next().as_deref() {
        Some("udp") | Some("UDP") => TransportKind::Udp,
        Some("tcp") | Some("TCP") | None => TransportKind::Tcp,
        Some(other) => anyhow::bail!("unknown transport '{}', expected tcp or udp", other),
    };

    let error_rate: f32 = match args.next() {
        Some(rate) => rate.parse()?,
        None => 0.0,
    };

    let config = SimulatorConfig {
        bind_address: bind_address.parse()?,
        transport,
        ..SimulatorConfig::default()
    };
    let mut simulator = PlcSimulator::with_config(config);
    if error_rate > 0.0 {
        simulator.set_error_rate(error_rate);
        info!("Answering {:.0}% of requests with a busy end code", error_rate * 100.0);
    }

    let memory = simulator.memory().clone();
    for i in 0..100u32 {
        memory.write_words(DeviceCode::D, i, &[1000 + i as u16]);
        memory.write_bits(DeviceCode::M, i, &[i % 3 == 0]);
    }
    memory.write_dword(DeviceCode::D, 200, 123_456_789);
    info!("Seeded D0-D99, M0-M99 and D200-D201");

    let local_addr = simulator.start().await?;
    println!("PLC simulator listening on {} ({})", local_addr, transport);
    println!("Press Ctrl+C to stop");

    // D1000 counts up once per second
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(1));
        let mut counter = 0u16;
        loop {
            ticker.tick().await;
            counter = counter.wrapping_add(1);
            memory.write_words(DeviceCode::D, 1000, &[counter]);
            memory.write_bits(DeviceCode::SM, 412, &[counter % 2 == 0]);
        }
    });

    match signal::ctrl_c().await {
        Ok(()) => info!("Received interrupt signal, stopping simulator..."),
        Err(err) => error!("Failed to listen for interrupt signal: {}", err),
    }

    simulator.stop().await?;

    let stats = simulator.get_stats();
    info!("Final simulator statistics:");
    info!("   Total connections: {}", stats.connections_count);
    info!("   Total requests: {}", stats.total_requests);
    info!("   Error responses: {}", stats.error_responses);
    info!("   Bytes received: {} bytes", stats.bytes_received);
    info!("   Bytes sent: {} bytes", stats.bytes_sent);
    info!("   Uptime: {} seconds", stats.uptime_seconds);
    Ok(())
}
