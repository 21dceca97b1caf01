pub mod criteria;
pub mod error;
pub mod inversion;
pub mod models;
pub mod training;

// Re-export common types
pub use error::PtiError;
pub use models::{Generator, GeneratorConfig, NoiseMode, StyleGenerator};
pub use training::{load_config, train_from_config, Config, TrainingReport, TrainingSession};

pub mod logging {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;
    use std::str::FromStr;

    /// Timestamped logger at `level`; `RUST_LOG` takes precedence when set.
    pub fn init_logger(level: &str) {
        let mut builder = Builder::new();
        builder.format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] - {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        });
        let parsed = LevelFilter::from_str(level);
        match std::env::var("RUST_LOG") {
            Ok(filters) => {
                builder.parse_filters(&filters);
            }
            Err(_) => {
                builder.filter(None, parsed.as_ref().copied().unwrap_or(LevelFilter::Info));
            }
        }
        let _ = builder.try_init();
        if parsed.is_err() {
            log::warn!("Unknown log level '{}', using info", level);
        }
    }
}
