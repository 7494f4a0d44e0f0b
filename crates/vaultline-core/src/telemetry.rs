//! Structured logging bootstrap.

use tracing_subscriber::EnvFilter;

use crate::config::VaultConfig;

/// Install a JSON `tracing` subscriber.
///
/// `RUST_LOG` wins when set; otherwise `config.log_level` is used. Returns
/// `false` if a global subscriber was already installed, which makes the call
/// safe to repeat from tests and embedding hosts.
pub fn init_logging(config: &VaultConfig) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .json()
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_harmless() {
        let config = VaultConfig::default();
        let _ = init_logging(&config);
        assert!(!init_logging(&config));
    }
}
