//! Hornet daemon entry point.
//!
//! Usage:
//!     hornet --config /etc/hornet.toml

use std::path::PathBuf;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use crossbeam_channel::{bounded, unbounded};
use tracing::{error, info, warn};

use hornet::bus;
use hornet::classifier::Classifier;
use hornet::config::Config;
use hornet::control::ControlRequest;
use hornet::credentials::Credentials;
use hornet::mover::Mover;
use hornet::scheduler::Scheduler;
use hornet::shipper::Shipper;
use hornet::watcher;
use hornet::ShutdownToken;
use hornet_logging::slack::{self, SlackConfig};

/// Grace period for tasks to finish after shutdown is requested.
const JOIN_GRACE: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "hornet", about = "Nearline data-processing daemon")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long, short, default_value = "hornet.toml")]
    config: PathBuf,

    /// Log at debug regardless of the configured level
    #[arg(long, short)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config.display()))?;
    config.validate()?;

    let credentials = Credentials::load();

    // The Slack layer has to exist before the subscriber is installed.
    let mut slack_sink = None;
    let slack_layer = if config.slack.active {
        if !credentials.slack_available() {
            anyhow::bail!("Slack is active but no Slack token is available");
        }
        let slack_config = SlackConfig {
            token: credentials.slack.token.clone(),
            username: config.slack.username.clone(),
            alerts_channel: config.slack.alerts_channel.clone(),
            notices_channel: config.slack.notices_channel.clone(),
        };
        let layer = slack::SlackLayer::new(&slack_config);
        slack_sink = Some(slack::spawn_flusher(slack_config, layer.buffers()));
        Some(layer)
    } else {
        None
    };

    hornet_logging::init_logging(&config.logging.level, args.verbose, slack_layer)?;
    info!("hornet starting; config: {}", args.config.display());

    let shutdown = ShutdownToken::new();
    let (requests_tx, requests_rx) = unbounded::<ControlRequest>();
    let mut handles: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

    // Bus first: the classifier may need the sender.
    let bus_handle = if config.amqp.active {
        let (handle, bus_threads) = bus::start(
            &config.amqp,
            &credentials,
            requests_tx.clone(),
            shutdown.clone(),
        )?;
        handles.extend(bus_threads);
        Some(handle)
    } else {
        info!("AMQP is inactive");
        None
    };

    let watcher_roots = config.watcher.roots();
    let classifier = Classifier::new(
        &config.classifier,
        &config.workers,
        &config.hash,
        &watcher_roots,
        bus_handle.clone(),
    )?;
    let mover = Mover::new(&config.mover, &config.hash);
    let warm_root = std::path::absolute(&config.mover.dest_dir)
        .unwrap_or_else(|_| config.mover.dest_dir.clone());
    let shipper = config
        .shipper
        .active
        .then(|| Shipper::new(&config.shipper, warm_root));

    // The ingest sender stays alive here even without a watcher, so the
    // scheduler's queue does not read as closed.
    let (ingest_tx, ingest_rx) = bounded(config.scheduler.queue_size);

    if config.watcher.active {
        let watcher_config = config.watcher.clone();
        let watcher_ingest = ingest_tx.clone();
        let watcher_requests = requests_tx.clone();
        let watcher_shutdown = shutdown.clone();
        handles.push((
            "watcher",
            std::thread::spawn(move || {
                watcher::run(
                    watcher_config,
                    watcher_ingest,
                    watcher_requests,
                    watcher_shutdown,
                )
            }),
        ));
    } else {
        info!("watcher is inactive");
    }

    {
        let scheduler = Scheduler {
            queue_size: config.scheduler.queue_size,
            n_workers: config.workers.n_workers,
            summary_interval: config.scheduler.summary_interval,
        };
        let scheduler_requests = requests_tx.clone();
        let scheduler_shutdown = shutdown.clone();
        handles.push((
            "scheduler",
            std::thread::spawn(move || {
                scheduler.run(
                    classifier,
                    mover,
                    shipper,
                    ingest_rx,
                    scheduler_requests,
                    scheduler_shutdown,
                )
            }),
        ));
    }

    {
        let signal_requests = requests_tx.clone();
        ctrlc::set_handler(move || {
            let _ = signal_requests.send(ControlRequest::StopExecution);
        })
        .context("installing the signal handler")?;
    }

    info!("hornet is running");
    let failed = match requests_rx.recv() {
        Ok(ControlRequest::StopExecution) => {
            info!("Stop-execution request received");
            false
        }
        Ok(ControlRequest::ThreadCannotContinue) => {
            error!("a task cannot continue; shutting down");
            true
        }
        Err(_) => {
            warn!("the request channel closed; shutting down");
            true
        }
    };

    shutdown.shutdown();
    drop(ingest_tx);
    join_with_grace(handles, JOIN_GRACE);

    if let Some(sink) = slack_sink {
        sink.shutdown();
    }
    info!("hornet finished");
    if failed {
        anyhow::bail!("shut down after a fatal task error");
    }
    Ok(())
}

/// Join every task, waiting at most `grace` past shutdown; stragglers are
/// logged and abandoned (the process exits regardless).
fn join_with_grace(handles: Vec<(&'static str, JoinHandle<()>)>, grace: Duration) {
    let deadline = Instant::now() + grace;
    let mut pending = handles;
    while !pending.is_empty() && Instant::now() < deadline {
        pending = pending
            .into_iter()
            .filter_map(|(name, handle)| {
                if handle.is_finished() {
                    if handle.join().is_err() {
                        error!("{name} task panicked");
                    }
                    None
                } else {
                    Some((name, handle))
                }
            })
            .collect();
        if !pending.is_empty() {
            std::thread::sleep(Duration::from_millis(20));
        }
    }
    for (name, _) in &pending {
        warn!("{name} did not stop within the shutdown grace period");
    }
}
