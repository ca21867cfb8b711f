//! Tracing setup shared by the CLI and the prepare-root entrypoint.

/// Initialize tracing with the crate's default format: no timestamps
/// (several log targets such as journald already add their own) and no
/// target path, since this binary only ever logs from one crate family.
///
/// `verbosity` is a repeat-count of `-v` flags: `0` keeps the default
/// `WARN` ceiling appropriate for unattended boot-time use, `1` raises
/// it to `INFO` for a normal interactive run, and `2` or more to
/// `DEBUG` for diagnosing a failed commit or prepare-root pass. An
/// explicit `RUST_LOG` always wins over both.
pub fn initialize_tracing(verbosity: u8) {
    let format = tracing_subscriber::fmt::format()
        .without_time()
        .with_target(false)
        .compact();
    let default_level = match verbosity {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        _ => tracing::Level::DEBUG,
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level.to_string())),
        )
        .event_format(format)
        .with_writer(std::io::stderr)
        .init();
}
