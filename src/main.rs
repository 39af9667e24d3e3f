use anyhow::Context;
use canfd_loopback::broker::{BrokerAddress, TcpSignalBroker, DEFAULT_BROKER_ADDRESS};
use canfd_loopback::can::adapter::AdapterHandle;
use canfd_loopback::can::canbus::{CanFdApi, ZCanLibrary};
use canfd_loopback::can::channel_config::ChannelMode;
use canfd_loopback::can::config::{self, RunConfig};
use canfd_loopback::can::sim::SimulatedAdapter;
use canfd_loopback::runner::{LoopbackTestRunner, RunnerOptions};
use clap::Parser;
use env_logger::Env;
use log::{error, info};
use std::path::PathBuf;
use std::process::ExitCode;

/// Send CAN ID 0x58A test frames
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Enable CAN loopback mode (1=on, 0=off)
    #[arg(short, long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=1))]
    loopback: u8,

    /// Databroker address in IP:PORT format
    #[arg(default_value = DEFAULT_BROKER_ADDRESS)]
    databroker: BrokerAddress,

    /// YAML run configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run against the in-process simulated adapter
    #[arg(long)]
    simulate: bool,

    /// Override the delay after each transmit
    #[arg(long)]
    pacing_ms: Option<u64>,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    match run(args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(e) => {
            error!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> anyhow::Result<bool> {
    info!("########################################################");
    info!("##     USBCANFD loopback test v{:<24}##", env!("CARGO_PKG_VERSION"));
    info!("########################################################");

    let mut run_config = match &args.config {
        Some(path) => config::load_config(path)?,
        None => RunConfig::default(),
    };
    if let Some(pacing_ms) = args.pacing_ms {
        run_config.pacing_ms = pacing_ms;
    }

    let api: Box<dyn CanFdApi> = if args.simulate {
        info!("Using simulated adapter");
        Box::new(SimulatedAdapter::new())
    } else {
        let lib = ZCanLibrary::new(&run_config.library)
            .with_context(|| format!("Failed to load {}", run_config.library))?;
        Box::new(lib)
    };

    let mode = ChannelMode::from_flag(args.loopback == 1);
    let options = RunnerOptions::from_config(&run_config, mode)?;
    let adapter = AdapterHandle::new(api, run_config.device_type, run_config.device_index);
    let broker = TcpSignalBroker::new(args.databroker);
    let (data_tx, data_rx) = flume::unbounded();

    info!("=== Sending CAN ID 0x58A test messages ===");
    let report = LoopbackTestRunner::new(adapter, broker, options, data_tx).run()?;

    for frame in data_rx.try_iter() {
        println!("[DATA] {}", frame);
    }
    match report.loopback_verified {
        Some(true) => info!("Loopback frames match transmit order"),
        Some(false) => error!(
            "Loopback mismatch: {} frame(s) received for {} sent",
            report.received.len(),
            report.transmitted
        ),
        None => {}
    }
    info!("CAN ID 0x58A test complete");
    Ok(report.passed())
}
