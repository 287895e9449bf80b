//! Cross-thread signal bus.
//!
//! Background threads never touch a user interface directly. Instead they
//! publish `Signal`s on this bus; whichever foreground owns the display
//! drains the receiver on its own thread and applies the updates. The
//! headless binary simply logs them.

use crossbeam_channel::{unbounded, Receiver, Sender};

/// Visual state for status indicators (styled labels, buttons).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndicatorState {
    Enabled,
    Disabled,
    Error,
}

impl IndicatorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndicatorState::Enabled => "enabled",
            IndicatorState::Disabled => "disabled",
            IndicatorState::Error => "error",
        }
    }
}

/// One UI-bound update from a background component.
#[derive(Debug, Clone)]
pub enum Signal {
    /// A warning line for the aggregated warnings label.
    Warning { device: Option<String>, text: String },
    /// HDF writer liveness: last-write timestamp text plus a state.
    HdfStatus { text: String, state: IndicatorState },
    /// Free space remaining on the volume holding the HDF file.
    FreeDiskSpace { bytes: u64 },
    /// Length of a device's data queue.
    QueueLength { device: String, len: usize },
    /// The most recent event recorded for a device.
    LastEvent { device: String, text: String },
    /// Formatted latest sample for a device's monitoring readout.
    MonitoredData { device: String, text: String },
    /// State change for an indicator-style control parameter.
    Indicator {
        device: String,
        param: String,
        text: String,
        state: String,
        checked: Option<bool>,
    },
    /// Sequencer progress: completed steps, total, estimated seconds left.
    SequencerProgress {
        step: usize,
        total: usize,
        remaining_secs: f64,
    },
    SequencerFinished,
    /// A device failed to start or died; named so the operator can react.
    DeviceError { device: String, message: String },
}

/// Unbounded MPMC bus; clone freely, every component keeps a `Sender`.
#[derive(Clone)]
pub struct SignalBus {
    tx: Sender<Signal>,
    rx: Receiver<Signal>,
}

impl SignalBus {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    /// Publish a signal; a missing consumer is not an error.
    pub fn send(&self, signal: Signal) {
        let _ = self.tx.send(signal);
    }

    /// Receiver handle for the foreground thread.
    pub fn receiver(&self) -> Receiver<Signal> {
        self.rx.clone()
    }

    /// Drain everything currently queued (used by the headless main loop
    /// and by tests).
    pub fn drain(&self) -> Vec<Signal> {
        self.rx.try_iter().collect()
    }
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new()
    }
}
