//! Fault confinement: transmit/receive error counters and the three-state
//! classification they drive.
//!
//! Counter changes come exclusively from the node's own protocol task; the
//! atomics exist so the host can observe a node without stopping it. Every
//! mutation re-evaluates the classification. Bus-off recovery (rule 12) and
//! the overlong-flag rule 6 are not modeled: a node that reaches bus off
//! stays there, muted.
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Mutex;

use tracing::{info, warn};

/// Invoked from the node's protocol task when it enters bus off.
pub type BusOffHook = Box<dyn Fn() + Send + Sync>;

//==================================================================================ERROR_STATE
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
/// Fault-confinement classification of a node.
pub enum ErrorState {
    /// May signal errors with a dominant flag.
    ErrorActive = 0,
    /// Only signals errors passively and suspends after transmitting.
    ErrorPassive = 1,
    /// Muted: all writes are dropped, reads keep the node ticking.
    BusOff = 2,
}

impl ErrorState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => ErrorState::ErrorActive,
            1 => ErrorState::ErrorPassive,
            _ => ErrorState::BusOff,
        }
    }
}

impl core::fmt::Display for ErrorState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let label = match self {
            ErrorState::ErrorActive => "error active",
            ErrorState::ErrorPassive => "error passive",
            ErrorState::BusOff => "bus off",
        };
        write!(f, "{label}")
    }
}

//==================================================================================CONFINEMENT
/// Per-node counters and classification.
pub(crate) struct Confinement {
    uid: usize,
    tec: AtomicU32,
    rec: AtomicU32,
    state: AtomicU8,
    bus_off_hook: Mutex<Option<BusOffHook>>,
}

impl Confinement {
    pub(crate) fn new(uid: usize) -> Self {
        Self {
            uid,
            tec: AtomicU32::new(0),
            rec: AtomicU32::new(0),
            state: AtomicU8::new(ErrorState::ErrorActive as u8),
            bus_off_hook: Mutex::new(None),
        }
    }

    pub(crate) fn tec(&self) -> u32 {
        self.tec.load(Ordering::Relaxed)
    }

    pub(crate) fn rec(&self) -> u32 {
        self.rec.load(Ordering::Relaxed)
    }

    pub(crate) fn state(&self) -> ErrorState {
        ErrorState::from_raw(self.state.load(Ordering::Relaxed))
    }

    /// True when the node must drop its writes.
    pub(crate) fn is_muted(&self) -> bool {
        self.state() == ErrorState::BusOff
    }

    pub(crate) fn set_bus_off_hook(&self, hook: BusOffHook) {
        *self.bus_off_hook.lock().expect("hook slot poisoned") = Some(hook);
    }

    /// Charge the transmit error counter and reclassify.
    pub(crate) fn charge_transmit(&self, amount: u32) {
        self.tec.fetch_add(amount, Ordering::Relaxed);
        self.update_state();
    }

    /// Charge the receive error counter and reclassify.
    pub(crate) fn charge_receive(&self, amount: u32) {
        self.rec.fetch_add(amount, Ordering::Relaxed);
        self.update_state();
    }

    /// Successful transmission: step the transmit counter back down.
    /// Fault confinement rule 7.
    pub(crate) fn credit_transmit(&self) {
        if self.tec() > 0 {
            self.tec.fetch_sub(1, Ordering::Relaxed);
            self.update_state();
        }
    }

    /// Successful reception: step the receive counter back down, or collapse
    /// it to 126 when it had climbed past 127. Fault confinement rule 8.
    pub(crate) fn credit_receive(&self) {
        let rec = self.rec();
        if rec == 0 {
            return;
        }
        if rec > 127 {
            self.rec.store(126, Ordering::Relaxed);
        } else {
            self.rec.fetch_sub(1, Ordering::Relaxed);
        }
        self.update_state();
    }

    /// Reclassify after a counter change.
    fn update_state(&self) {
        let tec = self.tec();
        let rec = self.rec();
        match self.state() {
            ErrorState::ErrorActive => {
                // Fault confinement rule 9.
                if tec > 127 || rec > 127 {
                    self.state.store(ErrorState::ErrorPassive as u8, Ordering::Relaxed);
                    warn!(uid = self.uid, "node is error passive");
                }
            }
            ErrorState::ErrorPassive => {
                // Fault confinement rule 11.
                if tec < 128 && rec < 128 {
                    self.state.store(ErrorState::ErrorActive as u8, Ordering::Relaxed);
                    warn!(uid = self.uid, "node is error active");
                }
                // Fault confinement rule 10.
                if tec > 255 {
                    self.state.store(ErrorState::BusOff as u8, Ordering::Relaxed);
                    warn!(uid = self.uid, "node is bus off");
                    let hook = self.bus_off_hook.lock().expect("hook slot poisoned");
                    if let Some(hook) = hook.as_ref() {
                        hook();
                    }
                }
            }
            // Recovery (rule 12) is not modeled.
            ErrorState::BusOff => {}
        }
        info!(
            uid = self.uid,
            tec,
            rec,
            state = %self.state(),
            "node state update"
        );
    }
}
