//! # labdaq
//!
//! Supervisory control and data acquisition for a laboratory full of slow
//! and fast instruments. One supervisor thread per device polls its driver
//! and drains command mailboxes; an HDF5 writer persists every reading and
//! event; a monitor watches run health; a sequencer scripts parameter
//! scans; and an authenticated TCP layer exposes remote control and a
//! readout feed.
//!
//! ## Crate Structure
//!
//! - **`app`**: the `App` struct owning configuration, the device map and
//!   every background component; `start_control`/`stop_control` bracket a
//!   run.
//! - **`config`**: program settings (TOML) and per-device configuration
//!   files with their control-parameter descriptors.
//! - **`device`**: the per-device supervisor thread, its shared mailbox
//!   state and the bounded plots queue.
//! - **`driver`**: the `Driver` trait every instrument implements, the
//!   command-string grammar, and the built-in simulated drivers.
//! - **`error`**: the `DaqError` enum and `AppResult` alias.
//! - **`monitor`**: the 500 ms health loop and the time-series sink.
//! - **`net`**: authenticated remote control and the readout publisher.
//! - **`sequencer`**: sequence trees, the parameter DSL and the executor.
//! - **`signals`**: the cross-thread signal bus a front-end would drain.
//! - **`writer`**: the HDF5 persistence thread.

pub mod app;
pub mod config;
pub mod device;
pub mod driver;
pub mod error;
pub mod monitor;
pub mod net;
pub mod sequencer;
pub mod signals;
pub mod util;
pub mod writer;

pub use app::App;
pub use config::ProgramConfig;
pub use error::{AppResult, DaqError};
