//! Shared single-wire bus with wired-AND electrical semantics.
//!
//! The bus is the sole driver of time. Once activated it runs one bit period
//! per iteration: it clears the state register to Recessive, opens every
//! node's write gate for half a period, then opens every node's read gate for
//! the other half. A node contributes at most one write and one read per
//! period; whoever misses a phase simply skips it. Dominant wins because each
//! write folds into the register with a bitwise AND.
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::core::BitValue;
use crate::error::BusError;
use crate::protocol::node::Node;

//==================================================================================PORT
/// Per-node synchronization handles.
///
/// Each gate is a one-shot permit: the bus grants one permit per phase and
/// drains whatever was left unclaimed when the phase closes.
pub(crate) struct Port {
    read_gate: Semaphore,
    write_gate: Semaphore,
}

impl Port {
    fn new() -> Self {
        Self {
            read_gate: Semaphore::new(0),
            write_gate: Semaphore::new(0),
        }
    }
}

/// Consume and discard every permit currently in the gate.
fn drain(gate: &Semaphore) {
    while let Ok(permit) = gate.try_acquire() {
        permit.forget();
    }
}

//==================================================================================BUS_SHARED
/// State shared between the bus driver and every attached node.
pub(crate) struct BusShared {
    /// Wired-AND register for the current bit period.
    state: AtomicU8,
    /// Set once by `activate`; gates the I/O entry points.
    active: AtomicBool,
    bit_period: Duration,
}

impl BusShared {
    /// Observe the bus state for this period. Blocks until the read phase.
    ///
    /// # Panics
    ///
    /// Calling this before the bus is activated is a programmer error.
    pub(crate) async fn read(&self, port: &Port) -> BitValue {
        assert!(
            self.active.load(Ordering::Relaxed),
            "bus read before activation"
        );
        let permit = port
            .read_gate
            .acquire()
            .await
            .expect("bus gates are never closed");
        permit.forget();
        BitValue::from_wire(self.state.load(Ordering::Relaxed))
    }

    /// Contribute one bit to this period's wired-AND. Blocks until the write
    /// phase.
    ///
    /// # Panics
    ///
    /// Calling this before the bus is activated is a programmer error.
    pub(crate) async fn write(&self, port: &Port, bit: BitValue) {
        assert!(
            self.active.load(Ordering::Relaxed),
            "bus write before activation"
        );
        let permit = port
            .write_gate
            .acquire()
            .await
            .expect("bus gates are never closed");
        permit.forget();
        self.state.fetch_and(bit.as_wire(), Ordering::Relaxed);
    }
}

//==================================================================================BUS
/// Multi-node rendezvous at one-bit-time resolution.
///
/// Lifecycle: create inactive, attach nodes (each receives a dense uid in
/// attachment order), then activate exactly once. Activation spawns every
/// node's protocol task and turns the caller into the bit-period driver,
/// which never returns.
pub struct Bus {
    shared: Arc<BusShared>,
    /// Ports registered before activation, indexed by uid.
    ports: Mutex<Vec<Arc<Port>>>,
    /// Nodes awaiting their protocol task; drained by `activate`.
    nodes: Mutex<Vec<Arc<Node>>>,
}

impl Bus {
    /// Bus with a bit period of `1s / bitrate`.
    ///
    /// The bit period paces the round-robin between nodes; it is a software
    /// delay, not a real-time guarantee.
    pub fn new(bitrate: u32) -> Self {
        Self {
            shared: Arc::new(BusShared {
                state: AtomicU8::new(BitValue::Recessive.as_wire()),
                active: AtomicBool::new(false),
                bit_period: Duration::from_secs(1) / bitrate,
            }),
            ports: Mutex::new(Vec::new()),
            nodes: Mutex::new(Vec::new()),
        }
    }

    /// Duration of one bit period.
    pub fn bit_period(&self) -> Duration {
        self.shared.bit_period
    }

    /// Allocate a uid and its synchronization handles.
    ///
    /// Fails once the bus is active: the topology is frozen at activation.
    pub(crate) fn register_port(&self) -> Result<(usize, Arc<Port>), BusError> {
        if self.shared.active.load(Ordering::Relaxed) {
            return Err(BusError::AlreadyActive);
        }
        let mut ports = self.ports.lock().expect("port table poisoned");
        let uid = ports.len();
        let port = Arc::new(Port::new());
        ports.push(port.clone());
        Ok((uid, port))
    }

    /// Queue a node for task spawn at activation.
    pub(crate) fn enroll(&self, node: Arc<Node>) {
        self.nodes.lock().expect("node table poisoned").push(node);
    }

    /// Handle to the state shared with the nodes.
    pub(crate) fn shared(&self) -> Arc<BusShared> {
        self.shared.clone()
    }

    /// Start every node's protocol task, then drive bit periods forever.
    ///
    /// Fails if called a second time. On success it never returns; the host
    /// decides about termination from a node's bus-off hook.
    pub async fn activate(&self) -> Result<Infallible, BusError> {
        if self.shared.active.swap(true, Ordering::Relaxed) {
            return Err(BusError::AlreadyActive);
        }
        let ports: Vec<Arc<Port>> = self.ports.lock().expect("port table poisoned").clone();
        let nodes: Vec<Arc<Node>> = self
            .nodes
            .lock()
            .expect("node table poisoned")
            .drain(..)
            .collect();
        info!(bit_period = ?self.shared.bit_period, "bus is active");
        for node in nodes {
            tokio::spawn(node.activate());
        }

        let half_period = self.shared.bit_period / 2;
        let mut period: u64 = 0;
        loop {
            self.shared
                .state
                .store(BitValue::Recessive.as_wire(), Ordering::Relaxed);

            // Write phase: one permit per node, then reclaim the leftovers.
            for port in &ports {
                port.write_gate.add_permits(1);
            }
            sleep(half_period).await;
            for port in &ports {
                drain(&port.write_gate);
            }
            debug!(
                state = self.shared.state.load(Ordering::Relaxed),
                period, "bus write phase end"
            );

            // Read phase: every node that shows up observes the same AND.
            for port in &ports {
                port.read_gate.add_permits(1);
            }
            sleep(half_period).await;
            for port in &ports {
                drain(&port.read_gate);
            }

            period = period.wrapping_add(1);
        }
    }
}

//==================================================================================TESTS
#[cfg(test)]
#[path = "tests.rs"]
mod tests;
