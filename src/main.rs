//! Daemon entry point: parse flags, set up logging, connect the lock
//! coordinator and serve the plugin socket.

use cepher::{
    config::{CliArgs, Config},
    driver::CepherDriver,
    lock::LockCoordinator,
    server,
};
use clap::Parser;
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tracing_subscriber::EnvFilter;

fn init_tracing(loglevel: &str) {
    let level = match loglevel {
        "trace" | "debug" | "info" | "error" => loglevel,
        "warning" => "warn",
        _ => "info",
    };
    // the env filter takes precedence over the command line flag
    match EnvFilter::try_from_default_env() {
        Ok(filter) => tracing_subscriber::fmt().with_env_filter(filter).init(),
        Err(_) => tracing_subscriber::fmt().with_env_filter(level).init(),
    }
}

#[actix_web::main]
async fn main() -> Result<(), String> {
    let args = CliArgs::parse();
    if args.version {
        println!("cepher {}", cepher::VERSION);
        return Ok(());
    }
    init_tracing(&args.loglevel);

    tracing::info!("==== starting cepher {} ====", cepher::VERSION);
    let config = Config::from(&args);
    if config.use_kernel_module {
        tracing::warn!(
            "the driver is configured to use the kernel RBD module; it has better \
             performance but supports only the layering, striping and exclusive-lock \
             image features"
        );
    }

    let locks = if config.lock_endpoints.is_empty() {
        tracing::warn!(
            "no etcd endpoints configured (--lock-etcd); mounts will not be arbitrated \
             across hosts and read-only rbd-nbd mappings will be refused"
        );
        LockCoordinator::disabled()
    } else {
        LockCoordinator::connect(&config.lock_endpoints, config.lock_timeout)
            .await
            .map_err(|error| format!("error during driver initialization: {error}"))?
    };

    let driver = Arc::new(CepherDriver::new(config, locks));

    let socket = server::PLUGIN_SOCKET;
    if let Some(parent) = Path::new(socket).parent() {
        fs::create_dir_all(parent)
            .map_err(|error| format!("error creating socket directory: {error}"))?;
    }
    // remove a stale socket from a previous instance
    match fs::remove_file(socket) {
        Ok(()) => tracing::info!("removed stale plugin socket {socket}"),
        Err(error) if error.kind() != ErrorKind::NotFound => {
            return Err(format!("error removing stale plugin socket {socket}: {error}"));
        }
        Err(_) => {}
    }

    tracing::info!("opening plugin socket at {socket}");
    server::serve(driver, socket)
        .await
        .map_err(|error| format!("unable to serve on unix socket {socket}: {error}"))
}
