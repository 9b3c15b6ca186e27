mod cli;
mod config;
mod shutdown;

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use podtail_k8s::{Datastore, DatastoreBuilder, KubeClient};
use podtail_logs::{ContainerFilter, Controller, ControllerConfig, MonitorConfig};
use podtail_output::{Writer, write_sources};

use crate::cli::Args;
use crate::config::Settings;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Run the application
    let result = run(args).await;

    // Handle any errors
    if let Err(e) = &result {
        eprintln!("Error: {:#}", e);
    }

    result
}

/// Diagnostics go to stderr or `log_file`; stdout carries log lines only
fn init_tracing(level: &str, log_file: Option<&Path>) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)
            .with_context(|| format!("invalid log level '{level}'"))?,
    };

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            subscriber
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => subscriber.with_writer(io::stderr).init(),
    }
    Ok(())
}

fn datastore_builder(args: &Args, settings: &Settings) -> DatastoreBuilder {
    Datastore::builder()
        .with_namespaces(args.namespaces.iter().cloned())
        .with_pods(args.pods.iter().cloned())
        .with_labels(args.labels.iter().cloned())
        .with_ignore(settings.ignore.iter().cloned())
        .with_nodes(args.nodes.iter().cloned())
        .with_services(args.services.iter().cloned())
        .with_rcs(args.rcs.iter().cloned())
        .with_rss(args.rss.iter().cloned())
        .with_dss(args.dss.iter().cloned())
        .with_deployments(args.deployments.iter().cloned())
}

async fn run(args: Args) -> Result<()> {
    let settings = Settings::load(&args)?;
    init_tracing(&settings.log_level, settings.log_file.as_deref())?;

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown::cancel_on_signal(shutdown.clone()));

    let client = KubeClient::connect(args.context.as_deref())
        .await
        .context("failed to connect to cluster")?;

    let datastore = datastore_builder(&args, &settings)
        .create(&client, &shutdown)
        .await
        .context("failed to watch pods")?;

    let ready = tokio::select! {
        ready = datastore.ready() => ready,
        _ = shutdown.cancelled() => false,
    };
    if !ready {
        let interrupted = shutdown.is_cancelled();
        datastore.shutdown();
        datastore.done().await;
        if interrupted {
            return Ok(());
        }
        bail!("pod watch ended before the initial listing completed");
    }

    let containers = ContainerFilter::new(settings.containers.iter().cloned());

    if args.dry_run {
        let sources: Vec<_> = datastore
            .pods()
            .list()
            .iter()
            .flat_map(|pod| containers.sources(pod))
            .collect();
        datastore.shutdown();
        datastore.done().await;

        let mut out = io::stdout().lock();
        write_sources(&mut out, &sources, settings.color).context("failed to write output")?;
        out.flush().context("failed to write output")?;
        return Ok(());
    }

    let config = ControllerConfig {
        buffer: settings.buffer,
        containers,
        monitor: MonitorConfig {
            since_seconds: settings.since_seconds(),
            timestamps: settings.timestamps,
            ..Default::default()
        },
    };
    let (controller, mut events) =
        Controller::spawn(datastore.pods().subscribe(), client.clone(), config, &shutdown);

    tracing::info!(output = %settings.output, "streaming logs");
    let mut writer = Writer::new(io::stdout(), settings.output, settings.color);
    let mut output_closed = false;
    let mut failure = None;
    while let Some(event) = events.recv().await {
        match writer.write(&event) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                output_closed = true;
                break;
            }
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }
    drop(events);

    // The queue also ends when the pod watch is lost
    let interrupted = shutdown.is_cancelled();
    shutdown.cancel();
    controller.done().await;
    datastore.done().await;
    let _ = writer.flush();

    if let Some(e) = failure {
        return Err(e).context("failed to write output");
    }
    if !interrupted && !output_closed {
        bail!("pod watch ended");
    }
    Ok(())
}
