mod cli;

use std::{process::ExitCode, sync::Arc};

use aft_engine::{drivers, Pipeline, PluginRegistry, RunOutcome};
use clap::Parser;
use cli::Opt;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const LOG_FILE: &str = "aft.log";

#[tokio::main]
async fn main() -> ExitCode {
    let opt = Opt::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(std::fs::File::create(LOG_FILE).expect("Failed to create log file")),
        )
        .try_init()
        .expect("Failed to register tracing_subscriber");

    let Some(image) = opt.image else {
        tracing::error!("No image file specified");
        return ExitCode::from(1);
    };

    let mut registry = PluginRegistry::new();
    registry.register_cutter("usbrelay", Arc::new(drivers::ShellCutter::new("usbrelay")));
    registry.register_device("shelldevice", Arc::new(drivers::ShellDevice::new()));
    registry.register_tester("shelltester", Arc::new(drivers::ShellTester::new()));

    let mut pipeline = Pipeline::new(&registry, image, opt.cfg);
    match pipeline.run(opt.testable).await {
        RunOutcome::Success => ExitCode::SUCCESS,
        RunOutcome::ConfigFailure => ExitCode::from(2),
        RunOutcome::Unsupported => ExitCode::from(3),
        RunOutcome::ValidationFailure => ExitCode::from(4),
    }
}
