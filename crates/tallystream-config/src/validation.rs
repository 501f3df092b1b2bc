// Configuration validation.
//
// Hard errors fail startup; suspicious but workable values only warn.

use crate::RuntimeConfig;
use anyhow::{bail, Result};
use tracing::warn;

pub fn validate_config(config: &RuntimeConfig) -> Result<()> {
    if config.server.listen_addr.is_empty() {
        bail!("server.listen_addr must not be empty");
    }
    if config.server.server_name.is_empty() {
        bail!("server.server_name must not be empty");
    }
    if config.server.worker_count == 0 {
        bail!("server.worker_count must be at least 1");
    }
    if config.ingest.max_buffer_bytes == 0 {
        bail!("ingest.max_buffer_bytes must be positive");
    }
    if config.flush.merge_interval_ms == 0 {
        bail!("flush.merge_interval_ms must be positive");
    }
    if config.flush.lock_stale_secs == 0 {
        bail!("flush.lock_stale_secs must be positive");
    }
    if config.store.reconnect_interval_secs == 0 {
        bail!("store.reconnect_interval_secs must be positive");
    }

    if config.ingest.max_buffer_bytes < 64 * 1024 {
        warn!(
            max_buffer_bytes = config.ingest.max_buffer_bytes,
            "ingest.max_buffer_bytes is very small; large frames will close connections"
        );
    }
    if config.flush.merge_interval_ms < 500 {
        warn!(
            merge_interval_ms = config.flush.merge_interval_ms,
            "flush.merge_interval_ms below 500ms will hammer the store"
        );
    }
    if config.flush.cycle_deadline_ms > config.flush.merge_interval_ms * 2 {
        warn!(
            cycle_deadline_ms = config.flush.cycle_deadline_ms,
            merge_interval_ms = config.flush.merge_interval_ms,
            "flush cycle deadline exceeds twice the flush interval; cycles may overlap"
        );
    }
    if config.ingest.buffer_idle_secs < 30 {
        warn!(
            buffer_idle_secs = config.ingest.buffer_idle_secs,
            "ingest.buffer_idle_secs is aggressive; slow senders may lose partial frames"
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        validate_config(&RuntimeConfig::default()).unwrap();
    }

    #[test]
    fn zero_workers_rejected() {
        let mut config = RuntimeConfig::default();
        config.server.worker_count = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn zero_flush_interval_rejected() {
        let mut config = RuntimeConfig::default();
        config.flush.merge_interval_ms = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn empty_listen_addr_rejected() {
        let mut config = RuntimeConfig::default();
        config.server.listen_addr.clear();
        assert!(validate_config(&config).is_err());
    }
}
