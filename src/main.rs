//! fanread CLI entry point

use anyhow::{Context, Result};
use fanread::config::{cli::Cli, toml::load_config, validator, Config};
use fanread::{bench, logging, output, PassthroughFs};

fn main() -> Result<()> {
    let cli = Cli::parse_args();
    cli.validate()?;

    let config = load_config(&cli)?;
    let _log_guard = logging::init_logging(&config.logging)?;

    validator::validate_config(&config).context("Configuration validation failed")?;
    tracing::debug!(?config, "effective configuration");

    if !config.bench.json {
        print_configuration(&cli, &config);
    }

    let fs = PassthroughFs::new(config.dispatch.clone()).context("Failed to start read workers")?;
    let report = bench::run(&fs, &cli.path, &config.bench);
    fs.shutdown();
    let report = report?;

    if config.bench.json {
        output::json::print_report(&report)?;
    } else {
        output::text::print_report(&report);
    }

    if report.verify_failures > 0 {
        anyhow::bail!(
            "{} of {} blocks did not match a plain read",
            report.verify_failures,
            report.verified
        );
    }
    Ok(())
}

fn print_configuration(cli: &Cli, config: &Config) {
    println!("fanread v{}", env!("CARGO_PKG_VERSION"));
    println!("Target:        {}", cli.path.display());
    println!("Workers:       {}", config.dispatch.workers);
    println!("Max in flight: {}", config.dispatch.max_in_flight);
    if let Some(cores) = &config.dispatch.cpu_cores {
        println!("CPU cores:     {:?}", cores);
    }
    if let Some(timeout) = config.dispatch.read_timeout() {
        println!("Read timeout:  {:?}", timeout);
    }
    println!("Block size:    {}", config.bench.block_size);
    match config.bench.total_bytes {
        Some(total) => println!("Total bytes:   {}", total),
        None => println!("Total bytes:   file size"),
    }
    println!();
}
