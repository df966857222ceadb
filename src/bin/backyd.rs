//! Scheduling daemon: `backyd [<config>]`.
//!
//! Runs every configured job on its retention schedule until SIGTERM.
//! SIGHUP reloads the configuration. An invalid configuration is fatal
//! at startup only; later reloads keep the previous one.

use std::path::PathBuf;

use anyhow::Error;

use backy::config::Config;
use backy::server::Scheduler;

const DEFAULT_CONFIG: &str = "/etc/backy.conf";

fn run() -> Result<(), Error> {
    let config_path = PathBuf::from(
        std::env::args()
            .nth(1)
            .unwrap_or_else(|| DEFAULT_CONFIG.to_string()),
    );
    let config = Config::load(&config_path)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        let scheduler = Scheduler::new(config_path, &config)?;
        log::info!("serving {} jobs", scheduler.jobs().len());
        scheduler.run().await
    })
}

fn main() {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    if let Err(err) = run() {
        log::error!("{err:#}");
        std::process::exit(1);
    }
}
