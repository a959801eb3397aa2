pub mod config;
pub mod core_contacts;
pub mod core_crypto;
pub mod core_envelope;
pub mod core_group;
pub mod core_protocol;
pub mod core_sync;
pub mod logging;
pub mod metrics;

#[cfg(test)]
pub mod test_utils;

pub use config::{Config, ConfigError};
pub use core_crypto::CryptoProvider;
pub use core_sync::adapters::{MemoryRelay, RelayTransport, TodoListEngine};
pub use core_sync::{Identity, InboundOutcome, ServerEndpoint, SyncEngine, SyncError, SyncServices};
pub use logging::{init_logging, init_logging_with_config, LogLevel};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_exports() {
        let _ = LogLevel::Info;
        let _ = Config::default();
    }
}
