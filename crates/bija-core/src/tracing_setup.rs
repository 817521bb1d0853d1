use std::fs::OpenOptions;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub fn init_tracing() {
    init_tracing_with_filter("bija=info,bija_core=info,bija_cli=info");
}

pub fn init_tracing_with_filter(default_filter: &str) {
    // Check if file logging is enabled via environment variable
    let file_logging = std::env::var("BIJA_LOG_FILE").ok();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let registry = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_filter(env_filter));

    let file = file_logging.as_ref().and_then(|log_path| {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .map_err(|e| eprintln!("Failed to open log file {}: {}", log_path, e))
            .ok()
    });

    let result = if let Some(file) = file {
        let file_layer = fmt::layer()
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_filter(tracing_subscriber::filter::LevelFilter::DEBUG);
        registry.with(file_layer).try_init()
    } else {
        registry.try_init()
    };

    // A subscriber may already be installed (tests, embedding applications)
    if let Err(e) = result {
        eprintln!("Tracing already initialized: {}", e);
    }
}
