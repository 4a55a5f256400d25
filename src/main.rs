//! brewq - distributes brewery records to durable queues and consumes them.

use anyhow::Result;
use brewq::{
    app::{run_distribution, ConsumerApp},
    broker::AmqpBroker,
    cli::{Cli, Command},
    config::Config,
    core::Broker,
    error::{exit_code_for, PipelineError},
    source::CsvSource,
};
use clap::Parser;
use std::process::ExitCode;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Load configuration by layering sources: defaults, file, environment, and CLI args.
    let config = match Config::load(&cli) {
        Ok(config) => config,
        Err(err) => {
            init_logging("info");
            error!("Failed to load configuration: {}", err);
            return ExitCode::FAILURE;
        }
    };

    init_logging(&config.log_level);

    info!("brewq starting up...");
    info!("-------------------- Configuration --------------------");
    info!("Log Level: {}", config.log_level);
    info!("Broker: {}:{}", config.broker.host, config.broker.port);
    info!(
        "Queues: {}",
        config
            .queues
            .iter()
            .map(|q| q.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    info!("-------------------------------------------------------");

    let result = match &cli.command {
        Some(Command::Distribute { .. }) => distribute(&config).await,
        Some(Command::Consume { .. }) => consume(config).await,
        None => Err(PipelineError::Configuration("no command given".to_string()).into()),
    };

    match result {
        Ok(()) => {
            info!("Closing connection. Goodbye.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            let code = exit_code_for(&e);
            if code == 0 {
                info!("Interrupted. Closing connection. Goodbye.");
            } else {
                error!("ERROR: Something went wrong.");
                error!("The error says: {:#}", e);
            }
            ExitCode::from(code)
        }
    }
}

/// Flips the shutdown channel on CTRL+C.
fn spawn_interrupt_listener(on_interrupt: impl FnOnce() + Send + 'static) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received. Shutting down gracefully...");
                on_interrupt();
            }
            Err(e) => warn!(error = %e, "Could not listen for CTRL+C"),
        }
    });
}

async fn distribute(config: &Config) -> Result<()> {
    let topology = config.validate()?;
    let mut source = CsvSource::open(&config.distributor.input_path)?;
    let broker = AmqpBroker::connect(&config.broker.amqp_uri()).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_interrupt_listener(move || {
        shutdown_tx.send_replace(true);
    });

    let result = run_distribution(config, topology, &broker, source.records(), shutdown_rx).await;

    if let Err(e) = broker.close().await {
        warn!(error = %e, "Failed to close broker connection cleanly");
    }
    let report = result?;
    info!(
        records = report.records,
        published = report.total_published(),
        "Distributor finished."
    );
    if report.interrupted {
        return Err(PipelineError::Interrupted.into());
    }
    Ok(())
}

async fn consume(config: Config) -> Result<()> {
    let app = ConsumerApp::builder(config).build().await?;

    let handle = app.shutdown_handle();
    spawn_interrupt_listener(move || handle.trigger_shutdown());

    app.run().await?;
    Ok(())
}
