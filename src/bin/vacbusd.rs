use clap::{App, Arg};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vacbus::protocol::DEVICE_PORT;
use vacbus::{DeviceRegistry, DeviceServer, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("vacbusd")
        .version("0.1.0")
        .author("Home Automation Systems Team")
        .about("Local control server for robotic vacuum devices")
        .arg(
            Arg::with_name("bind")
                .short("b")
                .long("bind")
                .value_name("ADDR")
                .help("Address to listen on")
                .takes_value(true)
                .default_value("0.0.0.0"),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Device protocol port")
                .takes_value(true)
                .validator(|v| {
                    v.parse::<u16>()
                        .map(|_| ())
                        .map_err(|_| "Port must be a number".into())
                }),
        )
        .arg(
            Arg::with_name("config-dir")
                .short("c")
                .long("config-dir")
                .value_name("DIR")
                .help("Directory holding per-device settings files")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Enable debug logging"),
        )
        .get_matches();

    let default_filter = if matches.is_present("verbose") {
        "vacbus=debug,vacbusd=debug"
    } else {
        "vacbus=info,vacbusd=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let port = matches
        .value_of("port")
        .map(|v| v.parse::<u16>())
        .transpose()?
        .unwrap_or(DEVICE_PORT);
    let config_dir = match matches.value_of("config-dir") {
        Some(dir) => PathBuf::from(dir),
        None => default_config_dir(),
    };
    std::fs::create_dir_all(&config_dir)?;
    info!(config_dir = %config_dir.display(), "using settings directory");

    let registry = Arc::new(DeviceRegistry::new(&config_dir));
    let server = DeviceServer::new(
        registry,
        ServerConfig {
            bind: matches.value_of("bind").unwrap_or("0.0.0.0").to_string(),
            port,
        },
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.run(shutdown_rx).await?;
    info!("server stopped");
    Ok(())
}

fn default_config_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".config").join("vacbus"),
        None => PathBuf::from(".vacbus"),
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
