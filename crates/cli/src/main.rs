use {
    clap::Parser,
    moltis_config::Severity,
    tracing::{error, info, warn},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "moltis-chat", about = "Two-sided chat server")]
struct Cli {
    /// Address to bind to (overrides config value / `CHAT_BIND_ADDR`).
    #[arg(long)]
    bind: Option<String>,
    /// Custom data directory (overrides `CHAT_DATA_DIR`).
    #[arg(long, env = "CHAT_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,
}

fn init_telemetry(rust_log: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(rust_log));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_thread_ids(false))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = moltis_config::discover_and_load();
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }
    if let Some(dir) = cli.data_dir {
        config.data_dir = Some(dir.display().to_string());
    }

    init_telemetry(&config.rust_log);
    info!(version = env!("CARGO_PKG_VERSION"), "moltis-chat starting");

    let result = moltis_config::validate(&config);
    for diagnostic in &result.diagnostics {
        match diagnostic.severity {
            Severity::Error => error!(path = %diagnostic.path, "{}", diagnostic.message),
            Severity::Warning => warn!(path = %diagnostic.path, "{}", diagnostic.message),
        }
    }
    if result.has_errors() {
        anyhow::bail!("configuration is invalid, see logged diagnostics above");
    }

    moltis_gateway::server::start(config).await
}
