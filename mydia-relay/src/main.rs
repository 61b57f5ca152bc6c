#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]

#[macro_use]
extern crate tracing;

use anyhow::Context as _;
use camino::Utf8PathBuf;
use mydia_relay::config::ConfHandle;
use mydia_relay::service::{RelayService, SERVICE_NAME};

const USAGE: &str = "Usage: mydia-relay [--config-path <PATH>]

Environment:
  MYDIA_RELAY_CONFIG_PATH   Path to the configuration file (or its folder)
  MYDIA_RELAY_DATA_PATH     Data folder (database, logs)
  MYDIA_RELAY_MASTER_PEPPER Base64 master pepper (overrides the config file)
  MYDIA_RELAY_TOKEN_SECRET  Base64 token-digest secret (overrides the config file)";

fn main() -> anyhow::Result<()> {
    run().inspect_err(|error| {
        let bootstacktrace_path = mydia_relay::config::get_data_dir().join("boot.stacktrace");

        if let Err(write_error) = std::fs::write(&bootstacktrace_path, format!("{error:?}")) {
            eprintln!("Failed to write the boot stacktrace to {bootstacktrace_path}: {write_error}");
        }
    })
}

fn run() -> anyhow::Result<()> {
    let mut config_path = None;

    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config-path" => {
                let path = args.next().context("missing value for --config-path")?;
                config_path = Some(Utf8PathBuf::from(path));
            }
            "--help" | "-h" => {
                println!("{USAGE}");
                return Ok(());
            }
            unexpected => anyhow::bail!("unexpected argument: {unexpected}\n{USAGE}"),
        }
    }

    let conf_handle = ConfHandle::init_with_path(config_path.as_deref()).context("couldn't load configuration")?;

    let mut service = RelayService::load(conf_handle).context("service loading failed")?;

    info!(service = SERVICE_NAME, "Starting");

    service.start().context("service startup failed")?;

    service.wait_for_shutdown_signal();

    service.stop();

    Ok(())
}
