/// Voltage SLMP Demo
///
/// Walks through the client operations against an in-process simulator, or
/// against a real PLC when an address is given.
/// Usage: demo [host:port]

use std::net::SocketAddr;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use voltage_slmp::utils::format::format_metrics;
use voltage_slmp::{
    CallbackLogger, ConnectionSettings, DeviceAddress, DeviceClient, DeviceCode, ErrorHandlingMode,
    LoggingMode, PlcSimulator, RequestOptions, SlmpClient, Target,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("Voltage SLMP Demo");
    println!("=================");

    let mut simulator = None;
    let address: SocketAddr = match std::env::args().nth(1) {
        Some(address) => address.parse()?,
        None => {
            let mut sim = PlcSimulator::new("127.0.0.1:0")?;
            let address = sim.start().await?;
            sim.memory().write_words(DeviceCode::D, 100, &[10, 20, 30, 40]);
            info!("Started local simulator on {}", address);
            simulator = Some(sim);
            address
        }
    };

    let settings = ConnectionSettings::tcp_recommended()
        .with_port(address.port())
        .with_mode(ErrorHandlingMode::ReturnDefaultAndContinue);
    let mut logger = CallbackLogger::console();
    logger.set_mode(LoggingMode::Interpreted);
    let client = SlmpClient::new(&address.ip().to_string(), settings, Target::local())?.with_logger(logger);
    client.connect().await?;

    let options = RequestOptions::new().with_timeout(8);

    println!("\nWord devices");
    let words = client.read_word_devices(DeviceCode::D, 100, 4, &options).await?;
    println!("  D100-D103: {:?}", words);

    println!("\nBit devices");
    client.write_bits(DeviceCode::M, 0, &[true, false, true, true]).await?;
    let bits = client.read_bits(DeviceCode::M, 0, 4).await?;
    println!("  M0-M3: {:?}", bits);

    println!("\nPseudo-dwords");
    client
        .write_dword_devices(DeviceCode::D, 200, &[0x0012_D687], &options)
        .await?;
    let dwords = client.read_dword_devices(DeviceCode::D, 200, 1, &options).await?;
    println!("  D200 (32-bit): {}", dwords[0]);

    println!("\nRandom read");
    let random = client
        .read_random(
            &[DeviceAddress::new(DeviceCode::D, 100), DeviceAddress::new(DeviceCode::D, 103)],
            &[DeviceAddress::new(DeviceCode::D, 200)],
            &options,
        )
        .await?;
    println!("  words {:?}, dwords {:?}", random.words, random.dwords);

    println!("\nMixed read");
    let mixed = client
        .read_mixed_devices(
            &[DeviceAddress::new(DeviceCode::D, 101)],
            &[DeviceAddress::new(DeviceCode::M, 0), DeviceAddress::new(DeviceCode::M, 3)],
            &[DeviceAddress::new(DeviceCode::D, 200)],
            &options,
        )
        .await?;
    println!("  {:?}", mixed);

    println!("\nDiagnostics");
    let type_name = client.read_type_name(&options).await?;
    println!("  Model: {} ({:?})", type_name.model, type_name.model_code);
    println!("  Self test: {}", client.self_test("0123ABCD", &options).await?);

    if let Some(sim) = simulator.as_mut() {
        println!("\nContinuity: simulator stopped, reads return defaults");
        sim.stop().await?;
        client.disconnect().await?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let fallback = client.read_word_devices(DeviceCode::D, 100, 2, &options).await?;
        println!("  D100-D101: {:?}", fallback);
    }

    println!("\n{}", client.statistics_summary());
    println!("\n{}", format_metrics(&client.performance()));

    client.close().await?;
    println!("\nDone");
    Ok(())
}
