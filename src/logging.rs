//! dmesg-style logger setup

use std::sync::OnceLock;
use std::time::Instant;

// Global start time for dmesg-style logging
static START_TIME: OnceLock<Instant> = OnceLock::new();

/// Initialize `env_logger` with elapsed-time timestamps. `RUST_LOG`
/// overrides the default level. Safe to call more than once.
pub fn init(verbose: bool) {
    let start = *START_TIME.get_or_init(Instant::now);

    let log_level = if verbose { "debug" } else { "info" };
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format(move |buf, record| {
            use std::io::Write;

            let elapsed = start.elapsed();
            let secs = elapsed.as_secs();
            let micros = elapsed.subsec_micros();

            // Format like dmesg: [  123.456789] LEVEL message
            writeln!(
                buf,
                "[{:5}.{:06}] {} {}",
                secs,
                micros,
                record.level(),
                record.args()
            )
        })
        .try_init();
}
