pub mod commands;
pub mod config;
pub mod connection;
pub mod metrics;
pub mod probe;
pub mod serial;

use std::time::Duration;

use commands::SerialMonitor;
use config::MonitorConfig;
use serial::ConnectionParams;

/// Options for the `serialwatch` binary
#[derive(Debug, Clone)]
pub struct RunOptions {
  pub config: MonitorConfig,
  pub auto_detect: bool,
  pub baud: u32,
  /// Stop after this many one-second report ticks
  pub ticks: Option<u64>,
}

pub async fn run(options: RunOptions) -> anyhow::Result<()> {
  let monitor = SerialMonitor::system(&options.config);

  let ports = monitor.discover_ports().await.map_err(anyhow::Error::msg)?;
  log::info!("Serialwatch started, {} port(s) found", ports.len());
  for port in &ports {
    log::info!("  {} ({})", port.port_name(), port.id);
  }

  if options.auto_detect {
    for (index, port) in ports.iter().enumerate() {
      if index > 0 {
        tokio::time::sleep(Duration::from_millis(options.config.inter_port_delay_ms)).await;
      }
      match monitor.auto_detect_and_connect(&port.id.to_string()).await {
        Ok(handle) => log::info!("{} connected at {}", handle.port_name, handle.params),
        Err(e) => log::warn!("{}: {}", port.port_name(), e),
      }
    }
  } else {
    let outcome = monitor.connect_all(ConnectionParams::new(options.baud)).await;
    for failed in outcome.outcomes.iter().filter(|o| !o.succeeded()) {
      log::warn!("{}: {}", failed.port_name, failed.error.as_deref().unwrap_or("unknown error"));
    }
  }

  let mut interval = tokio::time::interval(Duration::from_secs(1));
  interval.tick().await;
  let mut ticks: u64 = 0;

  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => {
        log::info!("Interrupted, shutting down");
        break;
      }
      _ = interval.tick() => {
        let rates = monitor.sample_rates().await;
        let stats = monitor.get_stats();
        log::info!(
          "active={} errors={} error_rate={:.3} throughput={:.1} B/s",
          stats.active_count,
          stats.error_count,
          stats.error_rate,
          rates.total_bytes_per_second
        );
        for rate in &rates.ports {
          log::debug!("  {}: {:.1} B/s ({} total)", rate.port_name, rate.bytes_per_second, rate.total_bytes);
        }

        ticks += 1;
        if options.ticks.is_some_and(|max| ticks >= max) {
          break;
        }
      }
    }
  }

  let outcome = monitor.disconnect_all().await;
  log::info!("Serialwatch stopped ({} port(s) disconnected)", outcome.succeeded);
  Ok(())
}
