use colored::*;
use log::{Level, LevelFilter};
use std::fs;

/// Wires the `log` facade to stdout (colored level tags) and a
/// dated file under `log/<app_name>/`.
pub fn init_logger(app_name: impl AsRef<str>, verbosity: u64) -> Result<(), fern::InitError> {
    let log_root = format!("log/{}", app_name.as_ref());
    fs::create_dir_all(&log_root)?;

    let level = match verbosity {
        0 => LevelFilter::Error,
        1 => LevelFilter::Warn,
        2 => LevelFilter::Info,
        3 => LevelFilter::Debug,
        _4_or_more => LevelFilter::Trace,
    };

    let stdout_dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} [{}] [{}] {}",
                chrono::Utc::now().format("%Y-%m-%d %H:%M:%S"),
                match record.level() {
                    Level::Error => format!("{}", record.level()).red(),
                    Level::Warn => format!("{}", record.level()).yellow(),
                    Level::Info => format!("{}", record.level()).cyan(),
                    Level::Debug => format!("{}", record.level()).purple(),
                    Level::Trace => format!("{}", record.level()).normal(),
                },
                record.target(),
                message
            ))
        })
        .chain(std::io::stdout());

    let file_path = format!(
        "{}/{}.{}.log",
        log_root,
        app_name.as_ref(),
        chrono::Utc::now().format("%Y_%m_%d")
    );
    let file_dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} [{}] [{}] {}",
                chrono::Utc::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.target(),
                message
            ))
        })
        .chain(fern::log_file(file_path)?);

    fern::Dispatch::new()
        .level(level)
        .chain(stdout_dispatch)
        .chain(file_dispatch)
        .apply()?;

    Ok(())
}
