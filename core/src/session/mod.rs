//! Device sessions
//!
//! A [`NodeSession`] owns one board's lifecycle. Public calls and transport completions
//! both feed the [`SessionMachine`]; the effects it returns are queued in machine order
//! and carried out by one tokio task per session, which also receives transport events
//! and timer expiries. Public calls may come from any thread. Listener callbacks run on
//! spawned tasks, never on the session task.

pub mod debug;
pub mod machine;
pub mod queue;
pub mod state;

pub use debug::{DebugConsole, DebugEvent, DebugListener};
pub use machine::{Effect, Op, SessionMachine, DEBUG_WRITE_CHUNK};
pub use queue::{DescriptorWriteQueue, PendingWrite};
pub use state::NodeState;

use crate::config::SdkConfig;
use crate::feature::Feature;
use crate::listener::ListenerList;
use crate::protocol::uuids::CLIENT_CONFIGURATION_DESCRIPTOR;
use crate::protocol::{CommandResponse, DeviceDescriptor, PendingCommands};
use crate::transport::{
    BleTransport, BondState, ConnectionHandle, TransportError, TransportEvent,
    TransportEventSender,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

pub trait NodeStateListener: Send + Sync {
    fn on_state_change(&self, node: &NodeSession, new_state: NodeState, old_state: NodeState);
}

pub trait RssiListener: Send + Sync {
    fn on_rssi_changed(&self, node: &NodeSession, rssi: i32);
}

/// Messages for the session task
#[derive(Debug)]
enum SessionMessage {
    /// Effects were queued by a public call
    Flush,
    Retry(Op),
    LivenessExpired(u64),
}

#[derive(Default)]
struct LivenessTimer {
    generation: u64,
    task: Option<JoinHandle<()>>,
}

pub(crate) struct SessionShared {
    me: Weak<SessionShared>,
    tag: String,
    descriptor: DeviceDescriptor,
    config: SdkConfig,
    transport: Arc<dyn BleTransport>,
    machine: Mutex<SessionMachine>,
    outbox: Mutex<VecDeque<Effect>>,
    state_tx: watch::Sender<NodeState>,
    rssi: Mutex<Option<i32>>,
    pending: Mutex<PendingCommands>,
    state_listeners: ListenerList<dyn NodeStateListener>,
    rssi_listeners: ListenerList<dyn RssiListener>,
    debug_listeners: ListenerList<dyn DebugListener>,
    liveness: Mutex<LivenessTimer>,
    messages: mpsc::UnboundedSender<SessionMessage>,
    events: TransportEventSender,
}

/// Handle to one device session; clones share the same session
#[derive(Clone)]
pub struct NodeSession {
    shared: Arc<SessionShared>,
}

impl NodeSession {
    /// Create a session in `Idle` for the device advertising under `tag`.
    ///
    /// # Panics
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        tag: impl Into<String>,
        descriptor: DeviceDescriptor,
        features: Vec<Feature>,
        transport: Arc<dyn BleTransport>,
        config: SdkConfig,
    ) -> Self {
        let (messages, message_rx) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(NodeState::Init);
        let shared = Arc::new_cyclic(|me| SessionShared {
            me: me.clone(),
            tag: tag.into(),
            descriptor,
            config,
            transport,
            machine: Mutex::new(SessionMachine::new(features)),
            outbox: Mutex::new(VecDeque::new()),
            state_tx,
            rssi: Mutex::new(None),
            pending: Mutex::new(PendingCommands::new()),
            state_listeners: ListenerList::new(),
            rssi_listeners: ListenerList::new(),
            debug_listeners: ListenerList::new(),
            liveness: Mutex::new(LivenessTimer::default()),
            messages,
            events,
        });
        tokio::spawn(run_session(Arc::downgrade(&shared), message_rx, event_rx));

        {
            let mut machine = shared.machine.lock();
            let start = machine.start();
            shared.enqueue(&machine, start);
        }
        Self { shared }
    }

    pub(crate) fn from_shared(shared: Arc<SessionShared>) -> Self {
        Self { shared }
    }

    /// Platform address the device was discovered under
    pub fn tag(&self) -> &str {
        &self.shared.tag
    }

    pub fn name(&self) -> Option<&str> {
        self.shared.descriptor.name.as_deref()
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.shared.descriptor
    }

    pub fn state(&self) -> NodeState {
        self.shared.machine.lock().state()
    }

    /// Watch channel following every state change
    pub fn subscribe_state(&self) -> watch::Receiver<NodeState> {
        self.shared.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == NodeState::Connected
    }

    pub fn is_bonded(&self) -> bool {
        self.shared.transport.bond_state(&self.shared.tag) == BondState::Bonded
    }

    /// True if both handles refer to the same session
    pub fn same_as(&self, other: &NodeSession) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Open the link; false unless the session is Idle, Lost or Unreachable
    pub fn connect(&self) -> bool {
        info!("Connecting to {}", self.shared.tag);
        self.shared.run(|m| m.connect())
    }

    /// Close the link once pending descriptor writes are done; false unless Connected
    pub fn disconnect(&self) -> bool {
        self.shared.run(|m| m.disconnect())
    }

    /// Every feature of the session in descending mask order, general-purpose last
    pub fn features(&self) -> Vec<Feature> {
        self.shared.machine.lock().table().features().to_vec()
    }

    pub fn feature_named(&self, name: &str) -> Option<Feature> {
        self.shared.machine.lock().table().feature_named(name).cloned()
    }

    pub fn feature_for_mask(&self, mask: u32) -> Option<Feature> {
        self.shared.machine.lock().table().feature_for_mask(mask).cloned()
    }

    pub fn is_notifying(&self, feature: &Feature) -> bool {
        self.shared.machine.lock().is_notifying(feature)
    }

    /// Request one read of the feature's characteristic; the value reaches the feature
    /// listeners
    pub fn read_feature(&self, feature: &Feature) -> bool {
        self.shared.run(|m| m.read_feature(feature))
    }

    pub fn enable_notification(&self, feature: &Feature) -> bool {
        self.shared.run(|m| m.enable_notification(feature))
    }

    pub fn disable_notification(&self, feature: &Feature) -> bool {
        self.shared.run(|m| m.disable_notification(feature))
    }

    pub fn write_feature_data(&self, feature: &Feature, data: &[u8]) -> bool {
        self.shared.run(|m| m.write_feature_data(feature, data))
    }

    /// Send `[mask][type][payload]` on the command characteristic
    pub fn send_command(&self, feature: &Feature, command_type: u8, payload: &[u8]) -> bool {
        self.shared
            .run(|m| m.send_command(feature, command_type, payload))
    }

    /// Send a command and wait for the first reply with the same mask and type.
    ///
    /// `None` if the command was refused, the link went down or the wait timed out
    /// (`timeout` defaults to the configured command timeout).
    pub async fn request(
        &self,
        feature: &Feature,
        command_type: u8,
        payload: &[u8],
        timeout: Option<Duration>,
    ) -> Option<CommandResponse> {
        let reply = self
            .shared
            .pending
            .lock()
            .register(feature.mask(), command_type);
        if !self.send_command(feature, command_type, payload) {
            return None;
        }
        let timeout = timeout.unwrap_or_else(|| self.shared.config.command_timeout());
        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(response)) => Some(response),
            Ok(Err(_)) => None,
            Err(_) => {
                debug!(
                    "No reply to command {:#04x} for {} within {:?}",
                    command_type,
                    feature.name(),
                    timeout
                );
                None
            }
        }
    }

    pub fn read_rssi(&self) -> bool {
        self.shared.run(|m| m.read_rssi())
    }

    pub fn last_rssi(&self) -> Option<i32> {
        *self.shared.rssi.lock()
    }

    /// Record a liveness signal with its signal strength
    pub fn update_rssi(&self, rssi: i32) {
        let mut machine = self.shared.machine.lock();
        let effects = machine.update_rssi(rssi);
        self.shared.enqueue(&machine, effects);
    }

    /// Console of the debug service; `None` until a discovery found one
    pub fn debug_console(&self) -> Option<DebugConsole> {
        if self.shared.machine.lock().has_debug_console() {
            Some(DebugConsole::new(&self.shared))
        } else {
            None
        }
    }

    pub fn add_state_listener(&self, listener: &Arc<dyn NodeStateListener>) -> bool {
        self.shared.state_listeners.add(listener)
    }

    pub fn remove_state_listener(&self, listener: &Arc<dyn NodeStateListener>) -> bool {
        self.shared.state_listeners.remove(listener)
    }

    pub fn add_rssi_listener(&self, listener: &Arc<dyn RssiListener>) -> bool {
        self.shared.rssi_listeners.add(listener)
    }

    pub fn remove_rssi_listener(&self, listener: &Arc<dyn RssiListener>) -> bool {
        self.shared.rssi_listeners.remove(listener)
    }
}

impl fmt::Debug for NodeSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSession")
            .field("tag", &self.tag())
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

impl fmt::Display for NodeSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) [{}]",
            self.name().unwrap_or("unnamed"),
            self.tag(),
            self.shared.descriptor.board_type
        )
    }
}

impl SessionShared {
    fn node(&self) -> Option<NodeSession> {
        self.me.upgrade().map(NodeSession::from_shared)
    }

    /// Run a machine call and queue its effects; true if the call was accepted
    fn run<F>(&self, call: F) -> bool
    where
        F: FnOnce(&mut SessionMachine) -> Option<Vec<Effect>>,
    {
        let mut machine = self.machine.lock();
        match call(&mut *machine) {
            Some(effects) => {
                self.enqueue(&machine, effects);
                true
            }
            None => false,
        }
    }

    pub(super) fn write_debug(&self, message: &[u8]) -> usize {
        let mut machine = self.machine.lock();
        match machine.write_debug(message) {
            Some((written, effects)) => {
                self.enqueue(&machine, effects);
                written
            }
            None => 0,
        }
    }

    /// Queue effects for the session task.
    ///
    /// Taking the machine by reference means the caller holds its lock, so the outbox
    /// order is the order the machine produced the effects in. State and RSSI mirrors
    /// are updated here so readers see them before the task catches up.
    fn enqueue(&self, _machine: &SessionMachine, effects: Vec<Effect>) {
        if effects.is_empty() {
            return;
        }
        for effect in &effects {
            match effect {
                Effect::StateChanged { new, .. } => {
                    self.state_tx.send_replace(*new);
                    if !new.is_linked() {
                        self.pending.lock().clear();
                    }
                }
                Effect::Rssi(rssi) => *self.rssi.lock() = Some(*rssi),
                _ => {}
            }
        }
        self.outbox.lock().extend(effects);
        let _ = self.messages.send(SessionMessage::Flush);
    }

    pub(super) fn set_debug_listener(&self, listener: Option<Arc<dyn DebugListener>>) -> bool {
        let current = self.debug_listeners.snapshot();
        let unchanged = match (&listener, current.first()) {
            (Some(new), Some(old)) => {
                Arc::as_ptr(new) as *const () == Arc::as_ptr(old) as *const ()
            }
            (None, None) => true,
            _ => false,
        };
        if unchanged {
            return false;
        }
        self.debug_listeners.clear();
        if let Some(listener) = &listener {
            self.debug_listeners.add(listener);
        }
        self.run(|m| m.set_debug_notify(listener.is_some()));
        true
    }

    fn handle_message(&self, message: SessionMessage) {
        {
            let mut machine = self.machine.lock();
            let effects = match message {
                SessionMessage::Flush => Vec::new(),
                SessionMessage::Retry(op) => machine.retry(op),
                SessionMessage::LivenessExpired(generation) => {
                    if generation == self.liveness.lock().generation {
                        machine.liveness_expired()
                    } else {
                        Vec::new()
                    }
                }
            };
            self.enqueue(&machine, effects);
        }
        self.drain();
    }

    fn handle_transport_event(&self, handle: ConnectionHandle, event: TransportEvent) {
        trace!("{} <- {}", self.tag, event);
        let bond = self.transport.bond_state(&self.tag);
        {
            let mut machine = self.machine.lock();
            machine.set_bond_state(bond);
            let effects = machine.handle_event(handle, event);
            self.enqueue(&machine, effects);
        }
        self.drain();
    }

    /// Carry out queued effects in order; only the session task calls this
    fn drain(&self) {
        loop {
            let next = self.outbox.lock().pop_front();
            let Some(effect) = next else {
                break;
            };
            self.apply(effect);
        }
    }

    fn apply(&self, effect: Effect) {
        match effect {
            Effect::Connect => match self.transport.connect(&self.tag, self.events.clone()) {
                Ok(handle) => {
                    debug!("{} connecting on {}", self.tag, handle);
                    self.machine.lock().connection_started(handle);
                }
                Err(e) => self.issue_failed(Op::Connect, e),
            },
            Effect::Issue(handle, op) => {
                if let Err(e) = self.issue(handle, &op) {
                    self.issue_failed(op, e);
                }
            }
            Effect::RetryAfter(op) => self.schedule_retry(op),
            Effect::StateChanged { old, new } => self.announce_state(old, new),
            Effect::Samples(samples) => {
                for (feature, sample) in samples {
                    feature.publish(sample);
                }
            }
            Effect::Response(feature, response) => {
                self.pending.lock().complete(&response);
                feature.publish_response(response);
            }
            Effect::Rssi(rssi) => self.announce_rssi(rssi),
            Effect::Debug(event) => self.announce_debug(event),
            Effect::ArmLiveness => self.arm_liveness(),
            Effect::CancelLiveness => self.cancel_liveness(),
        }
    }

    fn issue_failed(&self, op: Op, error: TransportError) {
        let mut machine = self.machine.lock();
        let effects = machine.issue_failed(op, error);
        self.enqueue(&machine, effects);
    }

    fn issue(&self, handle: ConnectionHandle, op: &Op) -> Result<(), TransportError> {
        trace!("{} -> {:?}", self.tag, op);
        let transport = &self.transport;
        match op {
            Op::Connect => Ok(()),
            Op::DiscoverServices => transport.discover_services(handle),
            Op::Read(characteristic) => transport.read_characteristic(handle, *characteristic),
            Op::Write {
                characteristic,
                data,
            } => transport.write_characteristic(handle, *characteristic, data),
            Op::WriteDescriptor(write) => transport.write_descriptor(
                handle,
                write.characteristic,
                CLIENT_CONFIGURATION_DESCRIPTOR,
                &write.value(),
            ),
            Op::SetNotify {
                characteristic,
                enabled,
            } => transport.set_notify(handle, *characteristic, *enabled),
            Op::ReadRssi => transport.read_rssi(handle),
            Op::Disconnect => transport.disconnect(handle),
        }
    }

    fn schedule_retry(&self, op: Op) {
        let messages = self.messages.clone();
        let delay = self.config.retry_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = messages.send(SessionMessage::Retry(op));
        });
    }

    fn arm_liveness(&self) {
        let mut timer = self.liveness.lock();
        if let Some(task) = timer.task.take() {
            task.abort();
        }
        timer.generation += 1;
        let generation = timer.generation;
        let messages = self.messages.clone();
        let timeout = self.config.node_lost_timeout();
        timer.task = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = messages.send(SessionMessage::LivenessExpired(generation));
        }));
    }

    fn cancel_liveness(&self) {
        let mut timer = self.liveness.lock();
        timer.generation += 1;
        if let Some(task) = timer.task.take() {
            task.abort();
        }
    }

    fn announce_state(&self, old: NodeState, new: NodeState) {
        info!("{}: {} -> {}", self.tag, old, new);
        let Some(node) = self.node() else {
            return;
        };
        self.state_listeners
            .dispatch(move |l| l.on_state_change(&node, new, old));
    }

    fn announce_rssi(&self, rssi: i32) {
        let Some(node) = self.node() else {
            return;
        };
        self.rssi_listeners
            .dispatch(move |l| l.on_rssi_changed(&node, rssi));
    }

    fn announce_debug(&self, event: DebugEvent) {
        let Some(shared) = self.me.upgrade() else {
            return;
        };
        let console = DebugConsole::new(&shared);
        self.debug_listeners.dispatch(move |l| match &event {
            DebugEvent::Stdout(message) => l.on_stdout(&console, message),
            DebugEvent::Stderr(message) => l.on_stderr(&console, message),
            DebugEvent::StdinSent { message, ok } => l.on_stdin_sent(&console, message, *ok),
        });
    }
}

impl Drop for SessionShared {
    fn drop(&mut self) {
        // the timer holds a message sender; the session task ends once all are gone
        if let Some(task) = self.liveness.get_mut().task.take() {
            task.abort();
        }
    }
}

/// Session task: queued effects, transport completions and timer messages
async fn run_session(
    session: Weak<SessionShared>,
    mut messages: mpsc::UnboundedReceiver<SessionMessage>,
    mut events: mpsc::UnboundedReceiver<(ConnectionHandle, TransportEvent)>,
) {
    loop {
        tokio::select! {
            message = messages.recv() => {
                let Some(message) = message else { break };
                let Some(shared) = session.upgrade() else { break };
                shared.handle_message(message);
            }
            event = events.recv() => {
                let Some((handle, event)) = event else { break };
                let Some(shared) = session.upgrade() else { break };
                shared.handle_transport_event(handle, event);
            }
        }
    }
    trace!("Session task finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::builtin::ACCELERATION;
    use crate::protocol::BoardType;
    use crate::protocol::uuids::CONFIG_SERVICE;
    use crate::transport::mock::{MockTransport, RecordedOp};
    use crate::transport::ServiceInfo;
    use tokio::time::sleep;

    async fn settle() {
        sleep(Duration::from_millis(1)).await;
    }

    fn descriptor() -> DeviceDescriptor {
        DeviceDescriptor {
            name: Some("WESU".to_string()),
            address: None,
            tx_power: 0,
            protocol_version: 1,
            device_type_id: 0x01,
            board_type: BoardType::StevalWesu1,
            feature_mask: 0x0080_0000,
            is_sleeping: false,
            has_general_purpose: false,
        }
    }

    fn session(transport: Arc<MockTransport>) -> NodeSession {
        NodeSession::new(
            "AA:BB:CC:DD:EE:FF",
            descriptor(),
            vec![Feature::new(ACCELERATION, 0x0080_0000)],
            transport,
            SdkConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_new_session_is_idle() {
        let transport = Arc::new(MockTransport::new());
        let node = session(transport);
        assert_eq!(node.state(), NodeState::Idle);
        assert_eq!(*node.subscribe_state().borrow(), NodeState::Idle);
        assert_eq!(node.features().len(), 1);
        assert!(node.feature_named("Accelerometer").is_some());
        assert!(node.debug_console().is_none());
    }

    #[tokio::test]
    async fn test_operations_refused_when_not_connected() {
        let transport = Arc::new(MockTransport::new());
        let node = session(transport.clone());
        let feature = node.features()[0].clone();
        assert!(!node.read_feature(&feature));
        assert!(!node.enable_notification(&feature));
        assert!(!node.send_command(&feature, 1, &[]));
        assert!(!node.disconnect());
        assert!(node.request(&feature, 1, &[], None).await.is_none());
        assert!(transport.ops().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_issues_transport_connect() {
        let transport = Arc::new(MockTransport::new());
        let node = session(transport.clone());
        assert!(node.connect());
        assert!(!node.connect());
        assert_eq!(node.state(), NodeState::Connecting);
        assert_eq!(*node.subscribe_state().borrow(), NodeState::Connecting);
        settle().await;
        assert_eq!(
            transport.ops(),
            vec![RecordedOp::Connect("AA:BB:CC:DD:EE:FF".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_connect_retried_after_delay() {
        let transport = Arc::new(MockTransport::new());
        let node = session(transport.clone());
        transport.fail_next(TransportError::Busy);
        assert!(node.connect());
        assert!(transport.ops().is_empty());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(transport.ops().len(), 1);
        assert!(transport.handle().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_from_plain_thread_runs_on_session_task() {
        let transport = Arc::new(MockTransport::new());
        let node = session(transport.clone());
        transport.fail_next(TransportError::Busy);

        let caller = node.clone();
        let accepted = std::thread::spawn(move || caller.connect())
            .join()
            .expect("connect must not panic off the runtime");
        assert!(accepted);
        assert_eq!(node.state(), NodeState::Connecting);

        sleep(Duration::from_millis(150)).await;
        assert_eq!(
            transport.ops(),
            vec![RecordedOp::Connect("AA:BB:CC:DD:EE:FF".to_string())]
        );
        assert!(transport.handle().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_effects_applied_in_call_order() {
        let transport = Arc::new(MockTransport::new());
        let node = session(transport.clone());
        assert!(node.connect());
        settle().await;
        transport.emit(TransportEvent::Connected);
        transport.emit(TransportEvent::ServicesDiscovered(Ok(vec![ServiceInfo {
            uuid: CONFIG_SERVICE,
            characteristics: vec![],
        }])));
        settle().await;
        assert!(node.is_connected());
        transport.take_ops();

        let callers: Vec<_> = (0..4)
            .map(|_| {
                let caller = node.clone();
                std::thread::spawn(move || caller.read_rssi())
            })
            .collect();
        for caller in callers {
            assert!(caller.join().expect("read_rssi"));
        }
        assert!(node.disconnect());
        settle().await;
        let ops = transport.take_ops();
        assert_eq!(ops.len(), 5);
        assert_eq!(ops.last(), Some(&RecordedOp::Disconnect));
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_task_ends_with_last_handle() {
        let transport = Arc::new(MockTransport::new());
        let node = session(transport.clone());
        assert!(node.connect());
        settle().await;
        transport.emit(TransportEvent::Connected);
        transport.emit(TransportEvent::ServicesDiscovered(Ok(vec![ServiceInfo {
            uuid: CONFIG_SERVICE,
            characteristics: vec![],
        }])));
        settle().await;
        assert!(node.disconnect());
        settle().await;
        transport.emit(TransportEvent::Disconnected { error: None });
        settle().await;
        assert_eq!(node.state(), NodeState::Idle);

        // Idle arms the liveness timer; dropping the session must not wait for it
        drop(node);
        settle().await;
        assert!(!transport.emit(TransportEvent::RssiRead(Ok(-40))));
    }
}
