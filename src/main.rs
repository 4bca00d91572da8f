//! session-gate/src/main.rs
//! Process bootstrap: options, logging, signal handling.

use session_gate::{GateError, GateOptions, logging, types::SECRET_ENV};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

fn load_options() -> Result<GateOptions, GateError> {
    let options = match std::env::args().nth(1) {
        Some(path) => GateOptions::from_json(&std::fs::read_to_string(path)?)?,
        None => GateOptions::default(),
    };
    options.finalize(std::env::var(SECRET_ENV).ok())
}

#[tokio::main]
async fn main() {
    let options = match load_options() {
        Ok(o) => o,
        Err(e) => {
            logging::init_logging("info");
            error!("{}", e);
            std::process::exit(1);
        }
    };
    logging::init_logging(&options.log_level);

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutting down");
                signal.cancel();
            }
            Err(e) => error!("Failed to listen for ctrl-c: {}", e),
        }
    });

    if let Err(e) = session_gate::run(options, shutdown).await {
        error!("{}", e);
        std::process::exit(1);
    }
}
