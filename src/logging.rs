use std::path::{Path, PathBuf};

use chrono::Local;
use log::LevelFilter;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

const LOG_PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} - {l} - {m}{n}";

/// Log to `<log_dir>/<timestamp>.log` and to stderr. Returns the log file
/// path.
pub fn setup_logging(log_dir: &Path, level: LevelFilter) -> Result<PathBuf, Box<dyn std::error::Error>> {
    std::fs::create_dir_all(log_dir)?;
    let timestamp = Local::now().format("%Y-%m-%d-%H_%M").to_string();
    let log_path = log_dir.join(format!("{timestamp}.log"));

    let file_appender = FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
        .build(&log_path)?;

    let config = Config::builder()
        .appender(Appender::builder().build("file", Box::new(file_appender)))
        .appender(Appender::builder().build("stderr", Box::new(stderr_appender())))
        .build(
            Root::builder()
                .appender("file")
                .appender("stderr")
                .build(level),
        )?;

    log4rs::init_config(config)?;

    Ok(log_path)
}

/// Worker processes log to stderr only; stdout carries the IPC stream and
/// the parent process owns the log file.
pub fn setup_worker_logging(level: LevelFilter) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::builder()
        .appender(Appender::builder().build("stderr", Box::new(stderr_appender())))
        .build(Root::builder().appender("stderr").build(level))?;

    log4rs::init_config(config)?;

    Ok(())
}

fn stderr_appender() -> ConsoleAppender {
    ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
        .build()
}
