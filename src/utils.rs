use pretty_env_logger::formatted_builder;

/// Initializes the process-wide logger, honoring `RUST_LOG` and defaulting
/// to `info`.
pub fn init_logger() -> Result<(), log::SetLoggerError> {
    let mut builder = formatted_builder();
    match std::env::var("RUST_LOG") {
        Ok(filters) => builder.parse_filters(&filters),
        Err(_) => builder.parse_filters("info"),
    };
    builder.try_init()
}
