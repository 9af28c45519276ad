//! Client configuration.
//!
//! Built explicitly for embedded clients, or read from `CREST_*` environment
//! variables for the process-wide client.

use std::env;

use crate::error::{CrestError, Result};

pub const ENV_SIGNAL: &str = "CREST_SIGNAL";
pub const ENV_MAX_CALLBACKS: &str = "CREST_MAX_CALLBACKS";
pub const ENV_FAULT_POLICY: &str = "CREST_FAULT_POLICY";
pub const ENV_DUMPER_SLOTS: &str = "CREST_DUMPER_SLOTS";

pub const DEFAULT_MAX_CALLBACKS: usize = 64;
pub const DEFAULT_DUMPER_SLOTS: usize = 4;

/// What to do on an unrecoverable internal fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FaultPolicy {
    /// Log and abort the process.
    #[default]
    Abort,
    /// Park the client in the error state; later calls fail with `Faulted`.
    Latch,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Real-time signal reserved for checkpoint notifications.
    pub signal: i32,
    /// Capacity of the callback table.
    pub max_callbacks: usize,
    pub fault_policy: FaultPolicy,
    /// Concurrent requests the in-process dumper tracks.
    pub dumper_slots: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            signal: crest_sys::signal::default_signal(),
            max_callbacks: DEFAULT_MAX_CALLBACKS,
            fault_policy: FaultPolicy::default(),
            dumper_slots: DEFAULT_DUMPER_SLOTS,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = Config::default();

        if let Some(v) = lookup(ENV_SIGNAL) {
            let signal = parse_num::<i32>(ENV_SIGNAL, &v)?;
            if !crest_sys::signal::is_realtime(signal) {
                return Err(CrestError::Config {
                    key: ENV_SIGNAL,
                    value: v,
                });
            }
            cfg.signal = signal;
        }
        if let Some(v) = lookup(ENV_MAX_CALLBACKS) {
            cfg.max_callbacks = parse_nonzero(ENV_MAX_CALLBACKS, &v)?;
        }
        if let Some(v) = lookup(ENV_DUMPER_SLOTS) {
            cfg.dumper_slots = parse_nonzero(ENV_DUMPER_SLOTS, &v)?;
        }
        if let Some(v) = lookup(ENV_FAULT_POLICY) {
            cfg.fault_policy = match v.trim().to_ascii_lowercase().as_str() {
                "abort" => FaultPolicy::Abort,
                "latch" => FaultPolicy::Latch,
                _ => {
                    return Err(CrestError::Config {
                        key: ENV_FAULT_POLICY,
                        value: v,
                    })
                }
            };
        }

        Ok(cfg)
    }

    pub fn with_fault_policy(mut self, policy: FaultPolicy) -> Self {
        self.fault_policy = policy;
        self
    }

    pub fn with_max_callbacks(mut self, n: usize) -> Self {
        self.max_callbacks = n;
        self
    }
}

fn parse_num<T: std::str::FromStr>(key: &'static str, v: &str) -> Result<T> {
    v.trim().parse::<T>().map_err(|_| CrestError::Config {
        key,
        value: v.to_string(),
    })
}

fn parse_nonzero(key: &'static str, v: &str) -> Result<usize> {
    match parse_num::<usize>(key, v)? {
        0 => Err(CrestError::Config {
            key,
            value: v.to_string(),
        }),
        n => Ok(n),
    }
}
