//! The process-wide client.
//!
//! Written once by the first successful [`initialize`], read-only after.

use std::sync::{Arc, OnceLock};

use crate::client::{Client, ClientId};
use crate::config::Config;
use crate::dumper::LocalDumper;
use crate::error::{self, CrestError, Result};
use crate::transport::SignalTransport;

static CLIENT: OnceLock<Client> = OnceLock::new();

/// Initialize this process's checkpoint client from `CREST_*` settings.
///
/// Notifications arrive on the configured real-time signal and snapshots
/// are taken by the in-process dumper. Idempotent.
pub fn initialize() -> Result<ClientId> {
    let client = match CLIENT.get() {
        Some(c) => c,
        None => {
            let config = Config::from_env().map_err(|e| {
                error::record(&e);
                e
            })?;
            let transport = Arc::new(SignalTransport::new(config.signal));
            let dumper = Arc::new(LocalDumper::new(transport.clone(), config.dumper_slots));
            CLIENT.get_or_init(|| Client::new(config, dumper, transport))
        }
    };
    client.initialize()
}

/// The process-wide client, once [`initialize`] has been called.
pub fn client() -> Result<&'static Client> {
    CLIENT.get().ok_or_else(|| {
        let e = CrestError::NotInitialized;
        error::record(&e);
        e
    })
}
