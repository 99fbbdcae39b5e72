//! Environment-variable configuration loading for the SHM sensor gateway.
//!
//! Centralizes every `SENSOR_*`/`DATA_DIR`/`LOG_DIR`/`RUN_DIR`/`PACKET_*`/`EVENT_*`
//! lookup behind [`SensorContext::from_env`], in the spirit of `config_loader.py`'s
//! `init_environment` but without its global `os.environ` mutation side effect: each
//! value is read once and held in the returned struct.

#![deny(unsafe_code, clippy::unwrap_used, clippy::expect_used, clippy::panic)]

pub mod context;
pub mod env;

pub use context::SensorContext;
