use std::sync::Arc;

use alerthub::config::Config;
use alerthub::service::AlertService;
use alerthub::web;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = Config::locate();
    let config = Config::new(config_path.clone()).expect("configuration failed to load");

    let _guard = init_logging(&config);
    tracing::info!("configuration loaded from {config_path}");

    let service = Arc::new(AlertService::new(&config).expect("initialization failed"));

    web::serve(service, &config).await.expect("critical error occured");

    Ok(())
}

fn init_logging(config: &Config) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));

    match (&config.logging.directory, &config.logging.file) {
        (Some(directory), Some(file)) => {
            let appender = match config.logging.rotation.as_str() {
                "hourly" => tracing_appender::rolling::hourly(directory, file),
                "never" => tracing_appender::rolling::never(directory, file),
                _ => tracing_appender::rolling::daily(directory, file),
            };
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        _ => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}
