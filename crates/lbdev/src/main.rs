use clap::Parser;

mod commands;
mod config;

use config::{Config, SubCommand};

fn main() -> Result<(), anyhow::Error> {
    let tokio_rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let config = Config::parse();
    set_logger();
    tokio_rt.block_on(async move {
        match config.sub_command {
            SubCommand::Generate(generate_config) => {
                commands::generate(generate_config, &config.additional)
            }
            SubCommand::Build(build_config) => commands::build(build_config, &config.additional),
            SubCommand::Run(run_config) => commands::run(run_config, &config.additional),
            SubCommand::Analyze(analyze_config) => {
                commands::analyze_log(analyze_config, &config.additional)
            }
        }
    })
}

fn set_logger() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
