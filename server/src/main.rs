//! Standalone TermDock server binary. Run with --config, --port,
//! --data-dir, and --dist, or use defaults. Exits with code 2 when the
//! configuration is present but unusable.

use std::path::PathBuf;
use std::sync::Arc;

use common::config::Config;

const DEFAULT_CONFIG: &str = "settings.json";

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("termdock=info".parse()?)
                .add_directive("common=info".parse()?)
                .add_directive("server=info".parse()?),
        )
        .init();

    let mut config_path = PathBuf::from(DEFAULT_CONFIG);
    let mut port: Option<u16> = None;
    let mut data_dir: Option<PathBuf> = None;
    let mut dist: Option<PathBuf> = None;

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        if args[i] == "--config" && i + 1 < args.len() {
            config_path = PathBuf::from(&args[i + 1]);
            i += 2;
            continue;
        }
        if args[i] == "--port" && i + 1 < args.len() {
            port = args[i + 1].parse().ok();
            i += 2;
            continue;
        }
        if args[i] == "--data-dir" && i + 1 < args.len() {
            data_dir = Some(PathBuf::from(&args[i + 1]));
            i += 2;
            continue;
        }
        if args[i] == "--dist" && i + 1 < args.len() {
            dist = Some(PathBuf::from(&args[i + 1]));
            i += 2;
            continue;
        }
        i += 1;
    }

    let mut config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("termdock-server: {e}");
            std::process::exit(2);
        }
    };
    if let Some(port) = port {
        config.port = port;
    }
    if let Some(data_dir) = data_dir {
        config.data_dir = data_dir;
    }
    if let Err(e) = std::fs::create_dir_all(config.data_dir.join("sessions")) {
        eprintln!("termdock-server: cannot create data dir {}: {e}", config.data_dir.display());
        std::process::exit(2);
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(server::run_web_server(Arc::new(config), dist))
}
