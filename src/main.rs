use std::env;
use std::path::Path;

use log::{error, info};
use tokio::signal::unix::{signal, SignalKind};
use vancollector::configuration::Config;
use vancollector::controller::Controller;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_target(false)
        .init();

    info!(
        "starting van flow collector version {}",
        env!("CARGO_PKG_VERSION")
    );

    // a single non-flag argument is a configuration file; anything else is
    // parsed as flags/environment
    let argv: Vec<String> = env::args().collect();
    let config = if argv.len() == 2 && !argv[1].starts_with('-') {
        Config::from_file(Path::new(&argv[1]))
    } else {
        Config::from_args()
    };

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("unable to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let mut controller = match Controller::new(config) {
        Ok(controller) => controller,
        Err(e) => {
            error!("unable to create the collector controller: {}", e);
            std::process::exit(1);
        }
    };

    // first signal drains the pipeline, a second one exits immediately
    let cancel = controller.cancellation_token();
    tokio::spawn(async move {
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                error!("unable to install signal handler: {}", e);
                return;
            }
        };
        let mut int = match signal(SignalKind::interrupt()) {
            Ok(int) => int,
            Err(e) => {
                error!("unable to install signal handler: {}", e);
                return;
            }
        };
        tokio::select! {
            _ = term.recv() => {},
            _ = int.recv() => {},
        }
        info!("shutdown signal received, draining");
        cancel.cancel();
        tokio::select! {
            _ = term.recv() => {},
            _ = int.recv() => {},
        }
        error!("second shutdown signal, exiting immediately");
        std::process::exit(1);
    });

    if let Err(e) = controller.run().await {
        error!("error running the collector: {}", e);
        std::process::exit(1);
    }
}
