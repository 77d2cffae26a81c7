use anyhow::{anyhow, Context, Result};
use dotenv::dotenv;
use env_logger::Env;

use solctl::config::Config;
use solctl::constants::{defaults, envvars};
use solctl::control::Scheduler;
use solctl::modbus::{Bus, SerialTransport};
use solctl::registry::Registry;

const CMD_RUN: &str = "run";
const CMD_CHECK_CONFIG: &str = "check-config";

fn main() -> Result<()> {
    let _ = dotenv();
    env_logger::Builder::from_env(
        Env::default().filter_or(envvars::LOG_LEVEL, defaults::LOG_LEVEL),
    )
    .init();

    let mut args = pico_args::Arguments::from_env();
    match args.subcommand()?.as_deref() {
        Some(CMD_RUN) => run(args.free_from_str()?),
        Some(CMD_CHECK_CONFIG) => check_config(args.free_from_str()?),
        _ => Err(anyhow!(
            "Subcommand must be one of 'run <config.json>', 'check-config <config.json>'"
        )),
    }
}

fn run(config_path: String) -> Result<()> {
    let config = Config::from_file(&config_path)
        .with_context(|| format!("invalid configuration in {}", config_path))?;

    let table = config.point_table()?;
    let causations = config.build_causations(&table)?;

    let transport = SerialTransport::open(&config.bus.serial_settings()?)?;
    let bus = Bus::new(Box::new(transport), config.bus.bus_options()?);
    let registry = Registry::new(bus, table);

    let (mut scheduler, _stop) = Scheduler::new(registry, causations, config.bus.poll_interval()?);
    scheduler.run().context("bus failed permanently")
}

fn check_config(config_path: String) -> Result<()> {
    let config = Config::from_file(&config_path)
        .with_context(|| format!("invalid configuration in {}", config_path))?;
    config.validate()?;
    println!(
        "OK: {} device(s), {} causation(s)",
        config.devices.len(),
        config.causations.len()
    );
    Ok(())
}
