//! corepanel - CLI entry point

use clap::Parser;
use corepanel::model::CoreType;
use corepanel::{App, PanelConfig, VERSION};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "corepanel")]
#[command(version = VERSION)]
#[command(about = "Control plane for Xray and sing-box")]
struct Args {
    /// Path to configuration file
    #[arg(short = 'c', long = "config", default_value = "config.yaml")]
    config: PathBuf,

    /// Home directory; relative paths in the config resolve against it
    #[arg(short = 'd', long = "directory")]
    directory: Option<PathBuf>,

    /// Test configuration and exit
    #[arg(short = 't', long = "test")]
    test: bool,

    /// Log as JSON lines
    #[arg(long = "log-json")]
    log_json: bool,

    /// Force the active core at startup
    #[arg(long = "core")]
    core: Option<CoreType>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().clamp(2, 8))
        .enable_all()
        .thread_name("corepanel-worker")
        .build()?;

    runtime.block_on(async_main(args))
}

fn init_logging(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::from_default_env()
        .add_directive("corepanel=info".parse()?)
        .add_directive("tower_http=info".parse()?);
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
    Ok(())
}

async fn async_main(args: Args) -> anyhow::Result<()> {
    init_logging(args.log_json)?;
    info!("corepanel v{}", VERSION);

    let home = match args.directory {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    let path = if args.config.is_relative() {
        home.join(&args.config)
    } else {
        args.config.clone()
    };

    let mut config = if path.exists() {
        info!("Loading configuration from: {}", path.display());
        match PanelConfig::load_async(&path).await {
            Ok(c) => c,
            Err(e) => {
                error!("Failed to load configuration: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        info!("{} not found, using defaults", path.display());
        PanelConfig::default()
    };
    config = config.with_home(&home);
    if args.core.is_some() {
        config.core = args.core;
    }

    let app = match App::new(config).await {
        Ok(app) => app,
        Err(e) => {
            error!("Failed to initialize: {}", e);
            std::process::exit(1);
        }
    };

    if args.test {
        if let Err(e) = app.check().await {
            error!("Configuration test failed: {}", e);
            std::process::exit(1);
        }
        info!("Configuration test passed");
        return Ok(());
    }

    if let Err(e) = app.run().await {
        error!("corepanel error: {}", e);
        std::process::exit(1);
    }
    Ok(())
}
