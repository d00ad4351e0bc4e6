//! A node on the bus: application-facing handle, transmit queue, and the
//! per-bit protocol state machine.
//!
//! The handle side (`Node`) is what the host keeps: it enqueues frames,
//! installs the behavior workload and the bus-off / receive hooks, and can
//! observe the error counters at any time. The protocol side (`Machine`)
//! runs on the task the bus spawns at activation and owns all per-frame
//! state; it talks to the handle only through the queue and the confinement
//! counters.
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::core::{
    BitValue, DATA_OFFSET, DLC_BITS, EOF_BITS, ERROR_DELIMITER_BITS, ERROR_FLAG_BITS, ID_BITS,
    INTERMISSION_BITS, SUSPEND_BITS,
};
use crate::error::{FrameError, NodeAttachError};
use crate::infra::stuffing::StuffTracker;
use crate::protocol::bus::{Bus, BusShared, Port};
use crate::protocol::confinement::{Confinement, ErrorState};
use crate::protocol::frame::DataFrame;

/// Invoked from the node's protocol task for every cleanly received frame.
pub type ReceiveHook = Box<dyn Fn(DataFrame) + Send + Sync>;

//==================================================================================NODE
/// One station on the bus.
///
/// Created against an inactive bus; the bus assigns the uid and schedules
/// the protocol task when it activates. The application keeps the `Arc` to
/// enqueue frames and install hooks.
pub struct Node {
    uid: usize,
    /// 11-bit identifier used for every frame this node originates.
    id: u16,
    shared: Arc<BusShared>,
    port: Arc<Port>,
    /// Pending frames, head first. The behavior appends, the state machine
    /// pops, and a failed transmission pushes its frame back onto the head.
    queue: Mutex<VecDeque<DataFrame>>,
    behavior: Mutex<Option<BoxFuture<'static, ()>>>,
    receive_hook: Mutex<Option<ReceiveHook>>,
    confinement: Confinement,
}

impl Node {
    /// Create a node and attach it to `bus`.
    ///
    /// Fails with [`NodeAttachError`] once the bus is active.
    pub fn new(bus: &Bus, id: u16) -> Result<Arc<Self>, NodeAttachError> {
        let (uid, port) = bus.register_port()?;
        let node = Arc::new(Self {
            uid,
            id,
            shared: bus.shared(),
            port,
            queue: Mutex::new(VecDeque::new()),
            behavior: Mutex::new(None),
            receive_hook: Mutex::new(None),
            confinement: Confinement::new(uid),
        });
        bus.enroll(node.clone());
        Ok(node)
    }

    /// Bus-assigned index, dense in attachment order.
    pub fn uid(&self) -> usize {
        self.uid
    }

    /// The identifier this node transmits under.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Current transmit error counter.
    pub fn tec(&self) -> u32 {
        self.confinement.tec()
    }

    /// Current receive error counter.
    pub fn rec(&self) -> u32 {
        self.confinement.rec()
    }

    /// Current fault-confinement classification.
    pub fn state(&self) -> ErrorState {
        self.confinement.state()
    }

    /// Number of frames waiting in the transmit queue.
    pub fn queue_len(&self) -> usize {
        self.queue.lock().expect("transmit queue poisoned").len()
    }

    /// Install the application workload. It is spawned on its own task when
    /// the bus activates, before the protocol loop starts.
    pub fn set_behavior(&self, behavior: impl Future<Output = ()> + Send + 'static) {
        *self.behavior.lock().expect("behavior slot poisoned") = Some(behavior.boxed());
    }

    /// Install the hook fired when this node enters bus off.
    pub fn set_bus_off_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.confinement.set_bus_off_hook(Box::new(hook));
    }

    /// Install the hook fired for every frame this node receives cleanly.
    pub fn set_receive_hook(&self, hook: impl Fn(DataFrame) + Send + Sync + 'static) {
        *self.receive_hook.lock().expect("hook slot poisoned") = Some(Box::new(hook));
    }

    /// Append a frame built from this node's identifier and `payload`.
    pub fn enqueue(&self, payload: &[u8]) -> Result<(), FrameError> {
        let frame = DataFrame::new(self.id, payload)?;
        self.queue
            .lock()
            .expect("transmit queue poisoned")
            .push_back(frame);
        Ok(())
    }

    /// Return a frame whose transmission failed to the head of the queue so
    /// the next contention retries it.
    pub(crate) fn requeue_front(&self, frame: DataFrame) {
        self.queue
            .lock()
            .expect("transmit queue poisoned")
            .push_front(frame);
    }

    pub(crate) fn dequeue(&self) -> Option<DataFrame> {
        self.queue.lock().expect("transmit queue poisoned").pop_front()
    }

    /// Entry point of the node task: start the behavior, then run the
    /// protocol loop forever.
    pub(crate) async fn activate(self: Arc<Self>) {
        let behavior = self.behavior.lock().expect("behavior slot poisoned").take();
        if let Some(behavior) = behavior {
            let (ready_tx, ready_rx) = oneshot::channel();
            tokio::spawn(async move {
                let _ = ready_tx.send(());
                behavior.await;
            });
            // The workload task exists before the first bit period.
            let _ = ready_rx.await;
        }
        info!(uid = self.uid, "node is active");
        Machine::new(self).run().await;
    }
}

//==================================================================================MACHINE
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Protocol states, one step per bit period unless noted otherwise.
enum FsmState {
    Intermission,
    SuspendTransmission,
    BusIdle,
    Arbitration,
    Dlc,
    Data,
    Eof,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// What the node is doing for the frame currently on the wire.
enum Role {
    Receiver,
    Transmitter,
}

impl core::fmt::Display for Role {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let label = match self {
            Role::Receiver => "receiver",
            Role::Transmitter => "transmitter",
        };
        write!(f, "{label}")
    }
}

#[derive(Clone, Copy, Debug)]
/// Counter update captured when a protocol error is detected, applied once
/// the error frame has been signalled.
enum PendingUpdate {
    /// One receive-error point (stuff or form error while receiving).
    /// Fault confinement rule 1.
    ReceiveError,
    /// Eight transmit-error points (stuff or bit error while transmitting).
    /// Fault confinement rule 3.
    TransmitError,
}

impl PendingUpdate {
    fn apply(self, confinement: &Confinement) {
        match self {
            PendingUpdate::ReceiveError => confinement.charge_receive(1),
            PendingUpdate::TransmitError => confinement.charge_transmit(8),
        }
    }
}

/// The protocol state machine. Owned by the node task; everything mutable
/// per frame lives here or in `run`'s locals.
struct Machine {
    node: Arc<Node>,
    /// Polarity run of the bits observed on the bus.
    read_track: StuffTracker,
    /// Polarity run of the bits this node put on the bus.
    write_track: StuffTracker,
}

impl Machine {
    fn new(node: Arc<Node>) -> Self {
        Self {
            node,
            read_track: StuffTracker::new(),
            write_track: StuffTracker::new(),
        }
    }

    //==================================================================================BIT_IO
    async fn bus_read(&mut self) -> BitValue {
        self.node.shared.read(&self.node.port).await
    }

    /// Raw write; a bus-off node drops it silently so the bus loop is never
    /// starved by a muted participant.
    async fn bus_write(&mut self, bit: BitValue) {
        if self.node.confinement.is_muted() {
            debug!(uid = self.node.uid, %bit, "write attempt while bus off");
            return;
        }
        self.node.shared.write(&self.node.port, bit).await;
    }

    /// Read one bit and account for it in the receive-side polarity run.
    async fn read_bit(&mut self) -> BitValue {
        let bit = self.bus_read().await;
        self.read_track.observe(bit);
        bit
    }

    /// Write one bit and account for it in the transmit-side polarity run.
    async fn write_bit(&mut self, bit: BitValue) {
        self.bus_write(bit).await;
        self.write_track.observe(bit);
    }

    /// Consume a stuff bit if one is due. Returns false on a stuff error
    /// (the consumed bit continued the run instead of breaking it).
    async fn maybe_read_stuff(&mut self) -> bool {
        if !self.read_track.at_stuff_point() {
            return true;
        }
        let previous = self.read_track.last();
        let bit = self.read_bit().await;
        debug!(uid = self.node.uid, %bit, "stuff bit consumed");
        bit != previous
    }

    /// Inject a stuff bit if one is due. Returns true when a bit period was
    /// spent on it, in which case the caller retries the payload bit.
    async fn maybe_write_stuff(&mut self) -> bool {
        if !self.write_track.at_stuff_point() {
            return false;
        }
        let bit = self.write_track.last().opposite();
        self.write_bit(bit).await;
        debug!(uid = self.node.uid, %bit, "stuff bit injected");
        true
    }

    //==================================================================================PROTOCOL_LOOP
    async fn run(mut self) {
        let uid = self.node.uid;
        let mut state = FsmState::BusIdle;
        let mut role = Role::Receiver;
        let mut previous_role = Role::Receiver;
        let mut frame: Option<DataFrame> = None;
        let mut pending: Option<PendingUpdate> = None;
        let mut received_id: u16 = 0;
        let mut received_dlc: u8 = 0;
        let mut received_data: Vec<u8> = Vec::new();

        loop {
            match state {
                //==================================================================INTERMISSION
                FsmState::Intermission => {
                    debug!(uid, "node at intermission");
                    self.read_track.reset();
                    self.write_track.reset();
                    frame = None;
                    pending = None;
                    let mut clean = 0;
                    while clean < INTERMISSION_BITS {
                        self.bus_write(BitValue::Recessive).await;
                        if self.bus_read().await.is_dominant() {
                            clean = 0;
                        } else {
                            clean += 1;
                        }
                    }
                    state = if self.node.state() == ErrorState::ErrorPassive
                        && previous_role == Role::Transmitter
                    {
                        FsmState::SuspendTransmission
                    } else {
                        FsmState::BusIdle
                    };
                }
                //==================================================================SUSPEND
                FsmState::SuspendTransmission => {
                    debug!(uid, "node at suspend transmission");
                    let mut yielded = false;
                    for _ in 0..SUSPEND_BITS {
                        self.bus_write(BitValue::Recessive).await;
                        if self.bus_read().await.is_dominant() {
                            // Someone else's start of frame: fold it into the
                            // receive-side run and join as a receiver.
                            self.read_track.observe(BitValue::Dominant);
                            yielded = true;
                            break;
                        }
                    }
                    if yielded {
                        role = Role::Receiver;
                        received_id = 0;
                        state = FsmState::Arbitration;
                    } else {
                        state = FsmState::BusIdle;
                    }
                }
                //==================================================================BUS_IDLE
                FsmState::BusIdle => {
                    debug!(uid, "node at bus idle");
                    frame = self.node.dequeue();
                    if let Some(pending_frame) = frame.as_ref() {
                        info!(uid, frame = %pending_frame, "data frame dequeued");
                        role = Role::Transmitter;
                        received_id = 0;
                        self.write_bit(BitValue::Dominant).await; // SOF
                        self.read_bit().await;
                        state = FsmState::Arbitration;
                    } else if self.read_bit().await.is_dominant() {
                        role = Role::Receiver;
                        received_id = 0;
                        state = FsmState::Arbitration;
                    }
                }
                //==================================================================ARBITRATION
                FsmState::Arbitration => {
                    debug!(uid, %role, "node at arbitration");
                    match role {
                        Role::Receiver => {
                            for _ in 0..ID_BITS {
                                if !self.maybe_read_stuff().await {
                                    pending = Some(PendingUpdate::ReceiveError);
                                    state = FsmState::Error;
                                    break;
                                }
                                let bit = self.read_bit().await;
                                received_id = received_id << 1 | u16::from(bit.as_wire());
                            }
                        }
                        Role::Transmitter => {
                            let own = frame.clone().expect("transmitter without a frame");
                            let mut i = 0;
                            let mut lost = false;
                            while i < ID_BITS {
                                if self.maybe_write_stuff().await {
                                    continue;
                                }
                                if !self.maybe_read_stuff().await {
                                    pending = Some(PendingUpdate::TransmitError);
                                    state = FsmState::Error;
                                    break;
                                }
                                let sent = own.bit(i);
                                self.write_bit(sent).await;
                                let read = self.read_bit().await;
                                received_id = received_id << 1 | u16::from(read.as_wire());
                                if read != sent {
                                    info!(uid, bit = i, "lost arbitration");
                                    role = Role::Receiver;
                                    lost = true;
                                    // The unsent frame contends again later.
                                    if let Some(own) = frame.take() {
                                        self.node.requeue_front(own);
                                    }
                                    break;
                                }
                                i += 1;
                            }
                            if state != FsmState::Error {
                                if !lost {
                                    info!(uid, "won arbitration");
                                }
                                // A loser keeps listening to the rest of the
                                // identifier as a receiver.
                                let mut remaining = i + 1;
                                while remaining < ID_BITS {
                                    if !self.maybe_read_stuff().await {
                                        pending = Some(PendingUpdate::ReceiveError);
                                        state = FsmState::Error;
                                        break;
                                    }
                                    let bit = self.read_bit().await;
                                    received_id = received_id << 1 | u16::from(bit.as_wire());
                                    remaining += 1;
                                }
                            }
                        }
                    }
                    if state != FsmState::Error {
                        state = FsmState::Dlc;
                    }
                }
                //==================================================================DLC
                FsmState::Dlc => {
                    debug!(uid, %role, "node at dlc");
                    match role {
                        Role::Receiver => {
                            received_dlc = 0;
                            let mut clean = true;
                            for i in 0..DLC_BITS {
                                if !self.maybe_read_stuff().await {
                                    pending = Some(PendingUpdate::ReceiveError);
                                    state = FsmState::Error;
                                    clean = false;
                                    break;
                                }
                                let bit = self.read_bit().await;
                                received_dlc += bit.as_wire() << (DLC_BITS - 1 - i);
                            }
                            if clean {
                                info!(uid, dlc = received_dlc, "dlc received");
                            }
                        }
                        Role::Transmitter => {
                            let own = frame.clone().expect("transmitter without a frame");
                            let mut i = ID_BITS;
                            while i < DATA_OFFSET {
                                if self.maybe_write_stuff().await {
                                    continue;
                                }
                                if !self.maybe_read_stuff().await {
                                    pending = Some(PendingUpdate::TransmitError);
                                    state = FsmState::Error;
                                    break;
                                }
                                let sent = own.bit(i);
                                self.write_bit(sent).await;
                                if self.read_bit().await != sent {
                                    pending = Some(PendingUpdate::TransmitError);
                                    state = FsmState::Error;
                                    break;
                                }
                                i += 1;
                            }
                            if i == DATA_OFFSET {
                                info!(uid, dlc = own.dlc(), "dlc sent");
                            }
                        }
                    }
                    if state != FsmState::Error {
                        state = FsmState::Data;
                    }
                }
                //==================================================================DATA
                FsmState::Data => {
                    debug!(uid, %role, "node at data");
                    match role {
                        Role::Receiver => {
                            received_data.clear();
                            let mut clean = true;
                            'bytes: for _ in 0..received_dlc {
                                let mut byte = 0u8;
                                for offset in 0..8 {
                                    if !self.maybe_read_stuff().await {
                                        pending = Some(PendingUpdate::ReceiveError);
                                        state = FsmState::Error;
                                        clean = false;
                                        break 'bytes;
                                    }
                                    let bit = self.read_bit().await;
                                    byte += bit.as_wire() << (7 - offset);
                                }
                                received_data.push(byte);
                            }
                            if clean {
                                info!(uid, data = %hex_string(&received_data), "data received");
                            }
                        }
                        Role::Transmitter => {
                            let own = frame.clone().expect("transmitter without a frame");
                            let end = DATA_OFFSET + 8 * own.dlc() as usize;
                            let mut i = DATA_OFFSET;
                            while i < end {
                                if self.maybe_write_stuff().await {
                                    continue;
                                }
                                if !self.maybe_read_stuff().await {
                                    pending = Some(PendingUpdate::TransmitError);
                                    state = FsmState::Error;
                                    break;
                                }
                                let sent = own.bit(i);
                                self.write_bit(sent).await;
                                if self.read_bit().await != sent {
                                    pending = Some(PendingUpdate::TransmitError);
                                    state = FsmState::Error;
                                    break;
                                }
                                i += 1;
                            }
                            if i == end {
                                info!(uid, queue_len = self.node.queue_len(), "data sent");
                            }
                        }
                    }
                    if state != FsmState::Error {
                        state = FsmState::Eof;
                    }
                }
                //==================================================================EOF
                FsmState::Eof => {
                    debug!(uid, %role, "node at eof");
                    match role {
                        Role::Receiver => {
                            let mut clean = true;
                            for _ in 0..EOF_BITS {
                                if self.bus_read().await.is_dominant() {
                                    // Form error: the tail must stay recessive.
                                    pending = Some(PendingUpdate::ReceiveError);
                                    state = FsmState::Error;
                                    clean = false;
                                    break;
                                }
                            }
                            if clean {
                                self.node.confinement.credit_receive();
                                self.deliver(received_id, &received_data);
                            }
                        }
                        Role::Transmitter => {
                            let mut clean = true;
                            for _ in 0..EOF_BITS {
                                self.bus_write(BitValue::Recessive).await;
                                if self.bus_read().await.is_dominant() {
                                    pending = Some(PendingUpdate::TransmitError);
                                    state = FsmState::Error;
                                    clean = false;
                                    break;
                                }
                            }
                            if clean {
                                // Delivered: the frame leaves the machine.
                                frame = None;
                                self.node.confinement.credit_transmit();
                            }
                        }
                    }
                    if state != FsmState::Error {
                        previous_role = role;
                        state = FsmState::Intermission;
                    }
                }
                //==================================================================ERROR
                FsmState::Error => {
                    debug!(uid, %role, "node at error");
                    // An aborted transmission contends again with the same
                    // frame, so it goes back to the head before signalling.
                    if let Some(aborted) = frame.take() {
                        self.node.requeue_front(aborted);
                    }
                    match (role, self.node.state()) {
                        (Role::Receiver, ErrorState::ErrorActive) => {
                            for _ in 0..ERROR_FLAG_BITS {
                                self.bus_write(BitValue::Dominant).await;
                                if self.bus_read().await.is_recessive() {
                                    // Flag overwritten: fault confinement rule 5.
                                    self.node.confinement.charge_receive(8);
                                }
                            }
                        }
                        (Role::Transmitter, ErrorState::ErrorActive) => {
                            for _ in 0..ERROR_FLAG_BITS {
                                self.bus_write(BitValue::Dominant).await;
                                if self.bus_read().await.is_recessive() {
                                    // Flag overwritten: fault confinement rule 4.
                                    self.node.confinement.charge_transmit(8);
                                }
                            }
                        }
                        (Role::Receiver, ErrorState::ErrorPassive) => {
                            let mut first_dominant = true;
                            let mut clean = 0;
                            while clean < ERROR_FLAG_BITS {
                                self.bus_write(BitValue::Recessive).await;
                                if self.bus_read().await.is_dominant() {
                                    if first_dominant {
                                        // Fault confinement rule 2.
                                        self.node.confinement.charge_receive(8);
                                        first_dominant = false;
                                    }
                                    clean = 0;
                                } else {
                                    clean += 1;
                                }
                            }
                        }
                        (Role::Transmitter, ErrorState::ErrorPassive) => {
                            let mut clean = 0;
                            while clean < ERROR_FLAG_BITS {
                                self.bus_write(BitValue::Recessive).await;
                                if self.bus_read().await.is_dominant() {
                                    clean = 0;
                                } else {
                                    clean += 1;
                                }
                            }
                        }
                        // A muted node signals nothing; the delimiter wait
                        // below keeps it paced with the bus.
                        (_, ErrorState::BusOff) => {}
                    }
                    // Wait out whatever still holds the bus dominant, then
                    // pace through the error delimiter.
                    loop {
                        self.bus_write(BitValue::Recessive).await;
                        if self.bus_read().await.is_recessive() {
                            break;
                        }
                    }
                    for _ in 0..ERROR_DELIMITER_BITS {
                        self.bus_write(BitValue::Recessive).await;
                        self.bus_read().await;
                    }
                    if let Some(update) = pending.take() {
                        update.apply(&self.node.confinement);
                    }
                    previous_role = role;
                    state = FsmState::Intermission;
                }
            }
        }
    }

    /// Hand a cleanly received frame to the application.
    fn deliver(&self, id: u16, data: &[u8]) {
        match DataFrame::new(id, data) {
            Ok(received) => {
                info!(uid = self.node.uid, frame = %received, "frame received");
                if let Some(hook) = self
                    .node
                    .receive_hook
                    .lock()
                    .expect("hook slot poisoned")
                    .as_ref()
                {
                    hook(received);
                }
            }
            // A wire-decoded DLC above eight cannot form a valid frame.
            Err(err) => debug!(uid = self.node.uid, %err, "received frame dropped"),
        }
    }
}

/// Compact hex rendering of a payload for the logs.
fn hex_string(data: &[u8]) -> String {
    data.iter().map(|byte| format!("{byte:02X}")).collect()
}
