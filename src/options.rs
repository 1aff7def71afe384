//! Runtime options - read once at startup.

use std::env;
use std::sync::OnceLock;

/// Global options instance - initialized once at startup, read everywhere.
pub static OPTS: OnceLock<Options> = OnceLock::new();

/// Initialize the global options.
pub fn opts_init(opts: Options) -> Result<(), Options> {
    OPTS.set(opts)
}

/// Get reference to global options. Panics if not initialized.
pub fn opts() -> &'static Options {
    OPTS.get().expect("OPTS not initialized")
}

/// Get reference to global options, returning None if not initialized.
pub fn opts_try() -> Option<&'static Options> {
    OPTS.get()
}

/// Default address space held for the proxy context.
pub const DEFAULT_PROXY_RESERVE: usize = 64 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    /// Bytes of address space reserved for the proxy context.
    pub proxy_reserve: usize,
    /// Static TLS size to use instead of the probed one.
    pub tls_bytes: Option<usize>,
    /// Check the TCB fixed fields after every crossing.
    pub validate_crossings: bool,
    /// Purge unreachable tombstones when checkpointing.
    pub sweep_on_checkpoint: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            proxy_reserve: DEFAULT_PROXY_RESERVE,
            tls_bytes: None,
            validate_crossings: cfg!(debug_assertions),
            sweep_on_checkpoint: true,
        }
    }
}

impl Options {
    /// Defaults overridden by `SPLITPROC_*` environment variables.
    /// Unparsable values are ignored with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut opts = Self::default();
        if let Some(v) = lookup("SPLITPROC_PROXY_RESERVE") {
            match parse_size(&v) {
                Some(n) if n > 0 => opts.proxy_reserve = n,
                _ => log::warn!("Ignoring SPLITPROC_PROXY_RESERVE={}", v),
            }
        }
        if let Some(v) = lookup("SPLITPROC_TLS_BYTES") {
            match parse_size(&v) {
                Some(n) => opts.tls_bytes = Some(n),
                None => log::warn!("Ignoring SPLITPROC_TLS_BYTES={}", v),
            }
        }
        if let Some(v) = lookup("SPLITPROC_VALIDATE_CROSSINGS") {
            match parse_bool(&v) {
                Some(b) => opts.validate_crossings = b,
                None => log::warn!("Ignoring SPLITPROC_VALIDATE_CROSSINGS={}", v),
            }
        }
        if let Some(v) = lookup("SPLITPROC_SWEEP") {
            match parse_bool(&v) {
                Some(b) => opts.sweep_on_checkpoint = b,
                None => log::warn!("Ignoring SPLITPROC_SWEEP={}", v),
            }
        }
        opts
    }
}

/// Decimal or `0x` hex, with an optional `k`/`m`/`g` suffix.
fn parse_size(s: &str) -> Option<usize> {
    let s = s.trim();
    let (digits, shift) = match s.chars().last()?.to_ascii_lowercase() {
        'k' => (&s[..s.len() - 1], 10),
        'm' => (&s[..s.len() - 1], 20),
        'g' => (&s[..s.len() - 1], 30),
        _ => (s, 0),
    };
    let n = match digits.strip_prefix("0x") {
        Some(hex) => usize::from_str_radix(hex, 16).ok()?,
        None => digits.parse::<usize>().ok()?,
    };
    n.checked_mul(1usize << shift)
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
