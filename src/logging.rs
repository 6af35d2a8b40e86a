use std::io::Write;
use std::str::FromStr;

use chrono::Local;
use log::{LevelFilter, SetLoggerError, warn};

/// Parses a configured level name, falling back to `Info` for unknown names.
pub fn parse_level(level: &str) -> LevelFilter {
    LevelFilter::from_str(level.trim()).unwrap_or(LevelFilter::Info)
}

/// Installs the process-wide logger.
///
/// `level` is the default filter; `RUST_LOG` takes precedence when set.
pub fn init(level: &str) -> Result<(), SetLoggerError> {
    let level_filter = parse_level(level);

    let result = env_logger::Builder::new()
        .filter_level(level_filter)
        .parse_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}: {}",
                Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .try_init();

    if result.is_ok() && level_filter == LevelFilter::Info && !level.eq_ignore_ascii_case("info") {
        warn!("Unknown log level {:?}, using info", level);
    }
    result
}
