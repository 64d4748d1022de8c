use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use arca_core::tasks::BackgroundConfig;
use arca_server::config::ServerConfig;
use arca_server::{build_state, handlers, StartupError};

#[derive(Parser)]
#[command(name = "arca-server", version, about = "arca data-transfer orchestration server")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "/etc/arca/config.yaml")]
    config: PathBuf,

    /// Run only the background worker, without the HTTP surface
    #[arg(long, default_value_t = false)]
    background_only: bool,
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("Error: {e}");
        std::process::exit(e.exit_code());
    }
}

fn run(cli: Cli) -> Result<(), StartupError> {
    let config =
        ServerConfig::load(&cli.config).map_err(StartupError::Config)?;

    match config.log_format.as_str() {
        "json" => tracing_subscriber::fmt().json().init(),
        _ => tracing_subscriber::fmt().init(),
    }

    let background = load_background_config(&config)?;
    let state = build_state(config)?;

    // The background worker runs the cooperative scheduler on its own
    // thread; the database is the only coordination between it and the
    // HTTP surface.
    if let Some(background) = background {
        let ctx = state.ctx.clone();
        let tasks = background.into_tasks();
        std::thread::Builder::new()
            .name("arca-scheduler".into())
            .spawn(move || arca_core::scheduler::run_scheduler(&ctx, tasks))
            .map_err(|e| StartupError::Other(format!("cannot spawn scheduler: {e}")))?;
    } else if cli.background_only {
        return Err(StartupError::Config(
            "--background-only requires a background configuration".into(),
        ));
    }

    if cli.background_only {
        info!("running in background-only mode");
        loop {
            std::thread::park();
        }
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| StartupError::Other(format!("cannot build runtime: {e}")))?;

    runtime.block_on(async move {
        let bind = format!("{}:{}", state.config.host, state.config.port);
        let listener = TcpListener::bind(&bind)
            .await
            .map_err(|e| StartupError::Other(format!("cannot bind {bind}: {e}")))?;
        info!(site = %state.config.name, %bind, "arca-server listening");

        let app = handlers::router(state);
        axum::serve(listener, app)
            .await
            .map_err(|e| StartupError::Other(e.to_string()))
    })
}

fn load_background_config(config: &ServerConfig) -> Result<Option<BackgroundConfig>, StartupError> {
    let path = config
        .background_config
        .clone()
        .or_else(|| std::env::var("ARCA_BACKGROUND_CONFIG").ok().map(PathBuf::from));
    let Some(path) = path else {
        return Ok(None);
    };
    BackgroundConfig::load(&path)
        .map(Some)
        .map_err(|e| StartupError::Config(e.to_string()))
}
