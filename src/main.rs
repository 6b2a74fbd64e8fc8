mod client;
mod command;
mod config;
mod ingest;
mod progress;
mod store;

use anyhow::{bail, Context};
use clap::Parser;
use client::{EndpointClient, HttpTransport};
use command::Dispatcher;
use config::ProvisionConfig;
use progress::{BarProgress, LogProgress, ProgressReporter};
use provision_shared::CommandSequence;
use std::future::Future;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use store::{open_store, StoreConfig};

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Shell convention for termination by SIGINT
const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Send keypress templates to a fleet of Cisco IP phones
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Phone list to ingest before the run, one address per line
    #[arg(long)]
    phones: Option<PathBuf>,

    /// YAML file of keypress templates
    #[arg(long, default_value = "templates/keypress_templates.yaml")]
    templates: PathBuf,

    /// Template to send
    #[arg(long)]
    template: Option<String>,

    /// List the available templates and exit
    #[arg(long)]
    list_templates: bool,

    /// Remove every stored phone before ingesting
    #[arg(long)]
    clear: bool,

    /// Phones dispatched together
    #[arg(long)]
    chunk_size: Option<usize>,

    /// CUCM end user with remote control rights on the phones
    #[arg(long, env = "PHONE_PROVISION_USERNAME")]
    username: Option<String>,

    #[arg(long, env = "PHONE_PROVISION_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// SQLite database file
    #[arg(long)]
    db: Option<PathBuf>,
}

impl Cli {
    /// Build the effective configuration; flags win over the file
    fn configuration(&self) -> anyhow::Result<ProvisionConfig> {
        let mut config = match &self.config {
            Some(path) => ProvisionConfig::load(path)?,
            None => ProvisionConfig::default(),
        };
        if let Some(chunk_size) = self.chunk_size {
            config.dispatch.chunk_size = chunk_size;
        }
        if let Some(username) = &self.username {
            config.device.username = username.clone();
        }
        if let Some(password) = &self.password {
            config.device.password = password.clone();
        }
        if let Some(path) = &self.db {
            config.store = StoreConfig::Sqlite { path: path.clone() };
        }
        config.validate()?;
        Ok(config)
    }
}

/// Cancel the run on the first interrupt. Resolves to true on a second one.
async fn watch_interrupts<F, S>(mut next_interrupt: F, cancel: CancellationToken) -> bool
where
    F: FnMut() -> S,
    S: Future<Output = std::io::Result<()>>,
{
    if next_interrupt().await.is_err() {
        return false;
    }
    warn!("Interrupted, finishing in-flight phones. Press Ctrl-C again to exit now");
    cancel.cancel();
    if next_interrupt().await.is_err() {
        return false;
    }
    error!("Interrupted twice, exiting without waiting for the store");
    true
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();
    let config = cli.configuration()?;

    let templates = ingest::load_templates(&cli.templates)?;
    if cli.list_templates {
        for (index, name) in templates.keys().enumerate() {
            println!("{}. {}", index + 1, name);
        }
        return Ok(());
    }
    let Some(template) = cli.template.as_deref() else {
        bail!("No template selected, pass --template (see --list-templates)");
    };
    let steps = ingest::select_template(&templates, template)?;
    let commands = CommandSequence::from_steps(steps);
    info!("Starting with {} ({} keypresses)", template, commands.len());

    let store = open_store(&config.store)
        .await
        .context("Cannot start without a usable store")?;

    if cli.clear {
        let cleared = store.clear_all().await?;
        info!("Cleared records: {}", cleared);
    }
    if let Some(path) = &cli.phones {
        let addresses = ingest::read_addresses(path)?;
        let inserted = ingest::ingest(store.as_ref(), &addresses).await?;
        info!("Phones inserted: {}", inserted);
    }

    let transport = HttpTransport::new(
        config.device.username.clone(),
        config.device.password.clone(),
        config.device.call_timeout(),
    )
    .context("Failed to build HTTP client")?;
    let client = EndpointClient::new(transport, config.device.pause())
        .with_skip_final_pause(config.device.skip_final_pause);

    let progress: Arc<dyn ProgressReporter> = if std::io::stderr().is_terminal() {
        Arc::new(BarProgress::new())
    } else {
        Arc::new(LogProgress)
    };

    let dispatcher = Dispatcher::new(Arc::new(client), store.clone(), progress);

    let cancel = dispatcher.cancellation_token();
    tokio::spawn(async move {
        if watch_interrupts(tokio::signal::ctrl_c, cancel).await {
            std::process::exit(INTERRUPTED_EXIT_CODE);
        }
    });

    let pending = store.list_pending().await?;
    if pending.is_empty() {
        info!("No pending phones, nothing to do");
        return Ok(());
    }

    let report = dispatcher
        .run(&pending, &commands, config.dispatch.chunk_size)
        .await?;

    println!("{}", "=".repeat(80));
    if report.canceled {
        println!(
            "Template {} action canceled after {} of {} phones. Runtime {:.3} sec",
            template,
            report.dispatched.len(),
            pending.len(),
            report.elapsed.as_secs_f64()
        );
    } else {
        println!(
            "Template {} action on {} phones is completed! Runtime {:.3} sec",
            template,
            report.dispatched.len(),
            report.elapsed.as_secs_f64()
        );
    }
    println!("Results: {}", report.tally);
    println!("Check the phones table for more information!");

    Ok(())
}
