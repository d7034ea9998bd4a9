mod config;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use portal_offline::cache::CacheStorage;
use portal_offline::net::{Destination, Request};
use portal_offline::service::OfflineService;
use portal_offline::store::RequestDescriptor;
use portal_offline::sync::DrainOutcome;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{Config, LogConfig};

#[derive(Parser, Debug)]
#[command(name = "portal-offline")]
#[command(about = "Offline cache and sync layer for the SUTUTEH portal")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/portal-offline/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Route one request through the interceptor
  Fetch {
    url: String,
    /// document, script, style, image, font or fetch
    #[arg(short, long, default_value = "fetch")]
    destination: Destination,
    /// Treat as a top-level page load
    #[arg(short, long)]
    navigate: bool,
  },
  /// Warm the page partition and the structured store
  Warm,
  /// Replay the outbound queue
  Drain,
  /// Queue a mutation for later delivery
  Enqueue {
    url: String,
    #[arg(short, long, default_value = "POST")]
    method: String,
    #[arg(short, long)]
    body: Option<String>,
    /// Extra header as `name: value`
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
  },
  /// Show version, queue and partition state
  Status,
  /// Install the configured version
  Install,
  /// Activate the installed version and drop obsolete partitions
  Activate,
  /// Run the background service until interrupted
  Run,
}

fn init_logging(log: &LogConfig) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&log.level))?;

  match &log.directory {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "portal-offline.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false))
        .try_init()?;
      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()?;
      Ok(None)
    }
  }
}

fn parse_headers(raw: &[String]) -> Result<BTreeMap<String, String>> {
  raw
    .iter()
    .map(|h| {
      h.split_once(':')
        .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_string()))
        .ok_or_else(|| eyre!("Invalid header '{}', expected 'name: value'", h))
    })
    .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _guard = init_logging(&config.log)?;

  let service = OfflineService::open(config.service_settings()?, &config.database_path()?)?;

  match args.command {
    Command::Fetch {
      url,
      destination,
      navigate,
    } => {
      let request = if navigate {
        Request::navigation(&url)?
      } else {
        Request::get(&url)?.with_destination(destination)
      };
      let result = service.intercept(&request).await?;
      println!(
        "{} {} ({:?})",
        result.response.status, result.response.status_text, result.source
      );
      if let Some(cached_at) = result.cached_at {
        println!("cached at {}", cached_at.to_rfc3339());
      }
      if let Some(failure) = &result.failure {
        println!("network failure: {}", failure);
      }
      println!();
      println!("{}", result.response.text());
    }
    Command::Warm => match service.warmer().run().await {
      Ok(report) => {
        println!(
          "primed {} pages, stored {} sources ({} noticias)",
          report.pages_primed,
          report.sources.len(),
          report.noticias
        );
        for (what, error) in &report.failures {
          println!("  failed {}: {}", what, error);
        }
      }
      Err(skip) => println!("warm skipped: {:?}", skip),
    },
    Command::Drain => {
      let outcomes = service.sync().drain().await?;
      if outcomes.is_empty() {
        println!("nothing to drain");
      }
      for outcome in outcomes {
        match outcome {
          DrainOutcome::Delivered { id, url, status } => {
            println!("#{} delivered {} ({})", id, url, status)
          }
          DrainOutcome::Retrying {
            id,
            url,
            retries,
            error,
          } => println!("#{} retry {} after {} failures: {}", id, url, retries, error),
          DrainOutcome::Dropped { id, url, error } => {
            println!("#{} dropped {}: {}", id, url, error)
          }
        }
      }
    }
    Command::Enqueue {
      url,
      method,
      body,
      headers,
    } => {
      let id = service.sync().enqueue(&RequestDescriptor {
        url,
        method,
        body,
        headers: parse_headers(&headers)?,
      })?;
      println!("queued #{}", id);
    }
    Command::Status => {
      let lifecycle = service.lifecycle();
      println!(
        "active version: {}",
        lifecycle.active_version()?.unwrap_or_else(|| "none".to_string())
      );
      println!("pending mutations: {}", service.store().pending_count()?);
      let storage = service.router().engine().cache().storage();
      for name in storage.partition_names()? {
        println!("  {:<48} {:>5}", name, storage.len(&name)?);
      }
    }
    Command::Install => {
      let report = service.lifecycle().install(&config.version).await?;
      if report.skipped {
        println!("version {} already installed", report.version);
      } else {
        println!(
          "installed {}: {} pages primed, {} assets precached",
          report.version, report.primed, report.precached
        );
        for (what, error) in &report.failures {
          println!("  failed {}: {}", what, error);
        }
      }
    }
    Command::Activate => {
      let report = service.lifecycle().activate()?;
      println!("activated {}", report.version);
      for name in report.deleted {
        println!("  deleted {}", name);
      }
    }
    Command::Run => {
      let handle = service.start();
      tokio::signal::ctrl_c().await?;
      handle.shutdown().await;
    }
  }

  Ok(())
}
