use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use serialwatch_lib::config::MonitorConfig;
use serialwatch_lib::RunOptions;

#[derive(Parser)]
#[command(name = "serialwatch")]
#[command(about = "Monitor every serial port, detecting baud rates when asked")]
struct Args {
    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Probe each port for its baud rate before connecting
    #[arg(short, long)]
    auto_detect: bool,

    /// Baud rate used when not auto-detecting
    #[arg(short, long, default_value = "115200")]
    baud: u32,

    /// Stop after this many one-second reports (runs until Ctrl-C otherwise)
    #[arg(long)]
    ticks: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {} - {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => MonitorConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => MonitorConfig::default(),
    };

    serialwatch_lib::run(RunOptions {
        config,
        auto_detect: args.auto_detect,
        baud: args.baud,
        ticks: args.ticks,
    })
    .await
}
