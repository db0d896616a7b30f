use log::LevelFilter;
use std::str::FromStr;

/// Installs the global logger. The level is read from `LOG_LEVEL` and
/// defaults to info.
pub fn setup_logging() -> Result<(), fern::InitError> {
    let level = std::env::var("LOG_LEVEL")
        .ok()
        .and_then(|l| LevelFilter::from_str(&l).ok())
        .unwrap_or(LevelFilter::Info);

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} {} [{}] {}",
                chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        // the kube client is noisy at debug level
        .level_for("kube_client", LevelFilter::Warn)
        .level_for("hyper", LevelFilter::Warn)
        .level_for("rustls", LevelFilter::Warn)
        .chain(std::io::stdout())
        .apply()?;
    Ok(())
}
