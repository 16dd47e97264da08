mod config;
mod server;

use catalog_core::{CatalogStore, ImageStore};
use clap::{Parser, Subcommand};
use crate::config::Config;
use crate::server::run_server;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "catalog")]
#[command(about = "Item catalog service with content-addressed image storage")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Server {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.yaml")]
        config: String,

        /// Create the database schema and image directory, then exit
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "catalog=info,catalog_core=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server { config, init } => {
            tracing::info!("Starting catalog server with config: {}", config);

            let cfg = match Config::from_file(&config) {
                Ok(c) => c,
                Err(e) => {
                    tracing::error!("Failed to load config: {}", e);
                    std::process::exit(1);
                }
            };

            if init {
                if let Err(e) = initialize(&cfg) {
                    tracing::error!("Initialization failed: {}", e);
                    std::process::exit(1);
                }
                return;
            }

            tracing::info!(
                "Bind: {}, database: {:?}, images: {:?}, front: {}",
                cfg.bind_addr,
                cfg.database_path,
                cfg.image_dir,
                cfg.front_url
            );

            if let Err(e) = run_server(cfg).await {
                tracing::error!("Server error: {}", e);
                std::process::exit(1);
            }
        }
    }
}

fn initialize(config: &Config) -> catalog_core::Result<()> {
    let images = ImageStore::new(config.image_dir.clone(), config.default_image.clone())?;
    CatalogStore::open(&config.database_path, &config.store_options())?;

    tracing::info!("Ensured image directory exists: {:?}", images.base_path());
    tracing::info!("Ensured database schema at {:?}", config.database_path);

    if images.default_image_exists() {
        tracing::info!("Default image present: {:?}", images.default_image_path());
    } else {
        tracing::warn!(
            "Default image missing: {:?}; place a fallback image there",
            images.default_image_path()
        );
    }

    Ok(())
}
