use sfs3::Config;
use tracing_subscriber::EnvFilter;

/// Maps `-q`/`-d` to a tracing filter. `RUST_LOG` wins when set.
pub fn init_tracing(config: &Config) {
    let level = if config.quiet {
        "error"
    } else {
        match config.debug_level {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("sfs3={level}")));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
