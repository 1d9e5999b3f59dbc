use candle_chatbot::api::ChatService;
use candle_chatbot::config::{Args, ServerConfig};
use candle_chatbot::openai::openai_server::build_router;
use candle_chatbot::state::shutdown::shutdown_signal;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

const LOG_FILE: &str = "candle-chatbot.log";

fn config_log(
    logger: ftail::Ftail,
    log_enable: bool,
    log_file: String,
) -> Result<(), ftail::error::FtailError> {
    if !log_enable {
        return Ok(());
    }
    use tracing::log::LevelFilter;
    let mut cfg_filter = LevelFilter::Info;
    if let Ok(level) = std::env::var("RUST_LOG") {
        let log_level_names: [&str; 6] = ["OFF", "ERROR", "WARN", "INFO", "DEBUG", "TRACE"];
        let log_levels: [LevelFilter; 6] = [
            LevelFilter::Off,
            LevelFilter::Error,
            LevelFilter::Warn,
            LevelFilter::Info,
            LevelFilter::Debug,
            LevelFilter::Trace,
        ];
        let level = level.to_uppercase();
        for (i, name) in log_level_names.iter().copied().enumerate() {
            if level.contains(name) {
                cfg_filter = log_levels[i]
            }
        }
    };
    if std::path::Path::new(&log_file).exists() {
        let _ = std::fs::remove_file(&log_file);
    }
    logger
        .console(cfg_filter)
        .single_file(log_file.as_str(), true, cfg_filter)
        .init()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    if args.log {
        config_log(ftail::Ftail::new(), true, LOG_FILE.to_string())
            .map_err(|e| anyhow::anyhow!("failed to configure logging: {e:?}"))?;
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .init();
    }

    let mut config = ServerConfig::load(args.config.as_deref())?;
    args.apply(&mut config);

    let service = ChatService::from_config(&config)?;
    let reaper = service.spawn_idle_reaper();
    let app = build_router(service.clone());

    let listener = tokio::net::TcpListener::bind(format!("{}:{}", config.host, config.port)).await?;
    info!(
        "Chat server for {} listening on http://{}:{}",
        config.model_id, config.host, config.port
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(service.shutdown().clone()))
        .await?;

    reaper.abort();
    service.manager().unload();
    info!("Server stopped");
    Ok(())
}
