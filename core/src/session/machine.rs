//! Connection state machine without I/O
//!
//! `SessionMachine` consumes API calls, transport completions and timer expiries and
//! answers with a list of [`Effect`]s for the driver to carry out. Keeping it free of
//! channels and clocks lets the whole lifecycle be exercised synchronously.

use super::debug::DebugEvent;
use super::queue::{DescriptorWriteQueue, PendingWrite};
use super::state::NodeState;
use crate::feature::{Feature, FeatureDispatchTable, Sample};
use crate::protocol::uuids::{classify, CharacteristicKind, CONFIG_SERVICE, DEBUG_SERVICE};
use crate::protocol::{CommandPacket, CommandResponse, ProtocolError};
use crate::transport::{
    BondState, CharacteristicProperties, ConnectionHandle, ServiceInfo, TransportError,
    TransportEvent,
};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

/// Largest chunk sent to the debug console per write
pub const DEBUG_WRITE_CHUNK: usize = 20;

/// A transport operation the machine wants started
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Connect,
    DiscoverServices,
    Read(Uuid),
    Write { characteristic: Uuid, data: Vec<u8> },
    WriteDescriptor(PendingWrite),
    SetNotify { characteristic: Uuid, enabled: bool },
    ReadRssi,
    Disconnect,
}

/// Work for the driver
#[derive(Debug, Clone)]
pub enum Effect {
    /// Open a new link
    Connect,
    /// Start `op` on an existing link
    Issue(ConnectionHandle, Op),
    /// Post `op` back after the retry delay
    RetryAfter(Op),
    StateChanged { old: NodeState, new: NodeState },
    Samples(Vec<(Feature, Sample)>),
    Response(Feature, CommandResponse),
    Rssi(i32),
    Debug(DebugEvent),
    ArmLiveness,
    CancelLiveness,
}

#[derive(Debug, Clone, Copy, Default)]
struct DebugCharacteristics {
    term: Option<Uuid>,
    stderr: Option<Uuid>,
}

pub struct SessionMachine {
    state: NodeState,
    handle: Option<ConnectionHandle>,
    user_disconnect: bool,
    bond: BondState,
    table: FeatureDispatchTable,
    properties: HashMap<Uuid, CharacteristicProperties>,
    command: Option<Uuid>,
    debug: DebugCharacteristics,
    debug_notifying: bool,
    notifying: Vec<Feature>,
    descriptors: DescriptorWriteQueue,
    deferred: VecDeque<Op>,
    outstanding_writes: VecDeque<(Uuid, Vec<u8>)>,
}

impl SessionMachine {
    pub fn new(features: Vec<Feature>) -> Self {
        Self {
            state: NodeState::Init,
            handle: None,
            user_disconnect: false,
            bond: BondState::None,
            table: FeatureDispatchTable::new(features),
            properties: HashMap::new(),
            command: None,
            debug: DebugCharacteristics::default(),
            debug_notifying: false,
            notifying: Vec::new(),
            descriptors: DescriptorWriteQueue::new(),
            deferred: VecDeque::new(),
            outstanding_writes: VecDeque::new(),
        }
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn handle(&self) -> Option<ConnectionHandle> {
        self.handle
    }

    pub fn table(&self) -> &FeatureDispatchTable {
        &self.table
    }

    pub fn descriptors(&self) -> &DescriptorWriteQueue {
        &self.descriptors
    }

    pub fn set_bond_state(&mut self, bond: BondState) {
        self.bond = bond;
    }

    pub fn has_debug_console(&self) -> bool {
        self.debug.term.is_some() && self.debug.stderr.is_some()
    }

    pub fn has_command_channel(&self) -> bool {
        self.command.is_some()
    }

    pub fn is_notifying(&self, feature: &Feature) -> bool {
        self.notifying.iter().any(|f| f.same_as(feature))
    }

    /// Announce the session: `Init → Idle`
    pub fn start(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.state == NodeState::Init {
            self.transition(NodeState::Idle, &mut effects);
        }
        effects
    }

    pub fn connect(&mut self) -> Option<Vec<Effect>> {
        if !self.state.can_connect() {
            return None;
        }
        let mut effects = Vec::new();
        self.user_disconnect = false;
        self.handle = None;
        self.transition(NodeState::Connecting, &mut effects);
        effects.push(Effect::Connect);
        Some(effects)
    }

    /// The transport accepted the connect request
    pub fn connection_started(&mut self, handle: ConnectionHandle) {
        if self.state == NodeState::Connecting {
            self.handle = Some(handle);
        }
    }

    pub fn disconnect(&mut self) -> Option<Vec<Effect>> {
        if self.state != NodeState::Connected {
            return None;
        }
        let mut effects = Vec::new();
        self.user_disconnect = true;
        self.transition(NodeState::Disconnecting, &mut effects);
        self.deferred.push_back(Op::Disconnect);
        self.pump(&mut effects);
        Some(effects)
    }

    pub fn read_feature(&mut self, feature: &Feature) -> Option<Vec<Effect>> {
        let characteristic = self.usable_characteristic(feature)?;
        if !self.props(&characteristic).can_read() {
            return None;
        }
        Some(self.defer(Op::Read(characteristic)))
    }

    pub fn write_feature_data(&mut self, feature: &Feature, data: &[u8]) -> Option<Vec<Effect>> {
        let characteristic = self.usable_characteristic(feature)?;
        if !self.props(&characteristic).can_write() {
            return None;
        }
        Some(self.defer(Op::Write {
            characteristic,
            data: data.to_vec(),
        }))
    }

    pub fn send_command(
        &mut self,
        feature: &Feature,
        command_type: u8,
        payload: &[u8],
    ) -> Option<Vec<Effect>> {
        if self.state != NodeState::Connected || feature.is_general_purpose() {
            return None;
        }
        let characteristic = self.command?;
        let packet = CommandPacket::new(feature.mask(), command_type, payload);
        Some(self.defer(Op::Write {
            characteristic,
            data: packet.encode(),
        }))
    }

    /// Start notifications for a feature; `Some(vec![])` when it already notifies
    pub fn enable_notification(&mut self, feature: &Feature) -> Option<Vec<Effect>> {
        let characteristic = self.usable_characteristic(feature)?;
        if !self.props(&characteristic).can_notify() {
            return None;
        }
        if self.is_notifying(feature) {
            return Some(Vec::new());
        }
        let already_on = self.characteristic_notifying(&characteristic);
        self.notifying.push(feature.clone());
        feature.set_notifying(true);
        let mut effects = Vec::new();
        if !already_on {
            self.toggle_notify(characteristic, true, &mut effects);
        }
        Some(effects)
    }

    pub fn disable_notification(&mut self, feature: &Feature) -> Option<Vec<Effect>> {
        let characteristic = self.usable_characteristic(feature)?;
        if !self.is_notifying(feature) {
            return Some(Vec::new());
        }
        self.notifying.retain(|f| !f.same_as(feature));
        feature.set_notifying(false);
        let mut effects = Vec::new();
        if !self.characteristic_notifying(&characteristic) {
            self.toggle_notify(characteristic, false, &mut effects);
        }
        Some(effects)
    }

    pub fn read_rssi(&mut self) -> Option<Vec<Effect>> {
        if self.state != NodeState::Connected {
            return None;
        }
        Some(self.defer(Op::ReadRssi))
    }

    /// Queue up to [`DEBUG_WRITE_CHUNK`] bytes on the debug terminal; returns bytes accepted
    pub fn write_debug(&mut self, message: &[u8]) -> Option<(usize, Vec<Effect>)> {
        if self.state != NodeState::Connected {
            return None;
        }
        let characteristic = self.debug.term?;
        let length = message.len().min(DEBUG_WRITE_CHUNK);
        let effects = self.defer(Op::Write {
            characteristic,
            data: message[..length].to_vec(),
        });
        Some((length, effects))
    }

    /// Turn debug stdout/stderr notifications on or off
    pub fn set_debug_notify(&mut self, enabled: bool) -> Option<Vec<Effect>> {
        if self.state != NodeState::Connected {
            return None;
        }
        let (term, stderr) = (self.debug.term?, self.debug.stderr?);
        let mut effects = Vec::new();
        if self.debug_notifying != enabled {
            self.debug_notifying = enabled;
            self.toggle_notify(term, enabled, &mut effects);
            self.toggle_notify(stderr, enabled, &mut effects);
        }
        Some(effects)
    }

    /// A liveness signal (RSSI update or advertisement re-sighting)
    pub fn update_rssi(&mut self, rssi: i32) -> Vec<Effect> {
        let mut effects = vec![Effect::Rssi(rssi)];
        match self.state {
            NodeState::Lost => self.transition(NodeState::Idle, &mut effects),
            NodeState::Idle => effects.push(Effect::ArmLiveness),
            _ => {}
        }
        effects
    }

    pub fn liveness_expired(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.state == NodeState::Idle {
            self.transition(NodeState::Lost, &mut effects);
        }
        effects
    }

    /// A delayed retry came due.
    ///
    /// Reads, writes and RSSI reads go back behind the descriptor queue like first
    /// attempts do.
    pub fn retry(&mut self, op: Op) -> Vec<Effect> {
        let mut effects = Vec::new();
        let Some(handle) = self.handle else {
            if op == Op::Connect && self.state == NodeState::Connecting {
                effects.push(Effect::Connect);
            } else {
                trace!("Dropping retry of {:?} without a link", op);
            }
            return effects;
        };
        let due = match &op {
            Op::Connect => false,
            Op::DiscoverServices => self.state == NodeState::Connecting,
            Op::WriteDescriptor(write) => {
                self.state.is_linked()
                    && self.descriptors.is_in_flight()
                    && self.descriptors.peek() == Some(write)
            }
            Op::Disconnect => self.state == NodeState::Disconnecting,
            _ => self.state == NodeState::Connected,
        };
        if !due {
            trace!("Dropping retry of {:?} in state {}", op, self.state);
            return effects;
        }
        match op {
            Op::Read(_) | Op::Write { .. } | Op::ReadRssi => self.defer(op),
            op => {
                self.issue(handle, op, &mut effects);
                effects
            }
        }
    }

    /// A transport initiator refused `op` synchronously
    pub fn issue_failed(&mut self, op: Op, error: TransportError) -> Vec<Effect> {
        let mut effects = Vec::new();
        if let Op::Write { characteristic, .. } = &op {
            self.forget_write(characteristic);
        }
        self.fail(op, error, &mut effects);
        effects
    }

    /// Process one completion or notification from the transport
    pub fn handle_event(&mut self, handle: ConnectionHandle, event: TransportEvent) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.handle.is_none() && self.state == NodeState::Connecting {
            self.handle = Some(handle);
        }
        if self.handle != Some(handle) {
            trace!("Ignoring event for stale {}: {}", handle, event);
            return effects;
        }

        match event {
            TransportEvent::Connected => {
                if self.state == NodeState::Connecting {
                    debug!("Link up on {}, discovering services", handle);
                    effects.push(Effect::Issue(handle, Op::DiscoverServices));
                }
            }
            TransportEvent::Disconnected { error } => self.on_disconnected(error, &mut effects),
            TransportEvent::ServicesDiscovered(result) => {
                self.on_services_discovered(result, &mut effects)
            }
            TransportEvent::CharacteristicRead {
                characteristic,
                result,
            } => match result {
                Ok(value) => self.on_value(characteristic, &value, &mut effects),
                Err(e) => self.fail(Op::Read(characteristic), e, &mut effects),
            },
            TransportEvent::CharacteristicWritten {
                characteristic,
                result,
            } => self.on_written(characteristic, result, &mut effects),
            TransportEvent::DescriptorWritten {
                characteristic,
                result,
                ..
            } => self.on_descriptor_written(characteristic, result, &mut effects),
            TransportEvent::CharacteristicChanged {
                characteristic,
                value,
            } => self.on_value(characteristic, &value, &mut effects),
            TransportEvent::RssiRead(Ok(rssi)) => effects.extend(self.update_rssi(rssi)),
            TransportEvent::RssiRead(Err(e)) => debug!("RSSI read failed: {}", e),
            TransportEvent::BondStateChanged(bond) => {
                self.bond = bond;
                if bond == BondState::Bonded && self.state == NodeState::Connected {
                    effects.push(Effect::StateChanged {
                        old: NodeState::Connected,
                        new: NodeState::Connected,
                    });
                }
            }
        }
        effects
    }

    fn on_disconnected(&mut self, error: Option<TransportError>, effects: &mut Vec<Effect>) {
        if !self.state.is_linked() {
            return;
        }
        let next = match error {
            Some(e) => {
                error!("Connection failed: {}", e);
                NodeState::Dead
            }
            None if self.user_disconnect => NodeState::Idle,
            None => {
                warn!("Link dropped unexpectedly");
                NodeState::Unreachable
            }
        };
        self.release_link();
        self.transition(next, effects);
    }

    fn on_services_discovered(
        &mut self,
        result: Result<Vec<ServiceInfo>, TransportError>,
        effects: &mut Vec<Effect>,
    ) {
        if self.state != NodeState::Connecting {
            return;
        }
        let services = match result {
            Ok(services) if services.is_empty() => {
                self.fail(
                    Op::DiscoverServices,
                    TransportError::Fatal("no services exposed".to_string()),
                    effects,
                );
                return;
            }
            Ok(services) => services,
            Err(e) => {
                self.fail(Op::DiscoverServices, e, effects);
                return;
            }
        };

        self.clear_link_bookkeeping();
        self.table.clear_bindings();
        self.properties.clear();
        self.command = None;
        self.debug = DebugCharacteristics::default();

        for service in &services {
            for characteristic in &service.characteristics {
                let uuid = characteristic.uuid;
                let tracked = match classify(&uuid) {
                    CharacteristicKind::DebugTerm if service.uuid == DEBUG_SERVICE => {
                        self.debug.term = Some(uuid);
                        true
                    }
                    CharacteristicKind::DebugStderr if service.uuid == DEBUG_SERVICE => {
                        self.debug.stderr = Some(uuid);
                        true
                    }
                    CharacteristicKind::Command if service.uuid == CONFIG_SERVICE => {
                        self.command = Some(uuid);
                        true
                    }
                    CharacteristicKind::Feature(mask) => {
                        self.table.bind_characteristic(uuid, mask) > 0
                    }
                    CharacteristicKind::GeneralPurpose => {
                        self.table.bind_general_purpose(uuid);
                        true
                    }
                    _ => false,
                };
                if tracked {
                    self.properties.insert(uuid, characteristic.properties);
                }
            }
        }
        if !self.has_debug_console() {
            self.debug = DebugCharacteristics::default();
        }
        debug!(
            "Discovery bound {} characteristics (command channel: {}, debug console: {})",
            self.properties.len(),
            self.command.is_some(),
            self.has_debug_console()
        );

        self.transition(NodeState::Connected, effects);
        if let Some(command) = self.command {
            self.toggle_notify(command, true, effects);
        }
    }

    fn on_value(&mut self, characteristic: Uuid, value: &[u8], effects: &mut Vec<Effect>) {
        if Some(characteristic) == self.command {
            self.on_command_response(value, effects);
        } else if Some(characteristic) == self.debug.term {
            effects.push(Effect::Debug(DebugEvent::Stdout(
                String::from_utf8_lossy(value).into_owned(),
            )));
        } else if Some(characteristic) == self.debug.stderr {
            effects.push(Effect::Debug(DebugEvent::Stderr(
                String::from_utf8_lossy(value).into_owned(),
            )));
        } else if let Some(report) = self.table.dispatch(&characteristic, value) {
            if !report.samples.is_empty() {
                effects.push(Effect::Samples(report.samples));
            }
        } else {
            trace!("Update on untracked characteristic {}", characteristic);
        }
    }

    fn on_command_response(&mut self, value: &[u8], effects: &mut Vec<Effect>) {
        let response = match CommandResponse::parse(value) {
            Ok(response) => response,
            Err(e) => {
                warn!("Dropping command response: {}", e);
                return;
            }
        };
        match self.table.feature_for_mask(response.mask) {
            Some(feature) => effects.push(Effect::Response(feature.clone(), response)),
            None => warn!(
                "Dropping command response: {}",
                ProtocolError::UnroutableCommand(response.mask)
            ),
        }
    }

    fn on_written(
        &mut self,
        characteristic: Uuid,
        result: Result<(), TransportError>,
        effects: &mut Vec<Effect>,
    ) {
        let data = self.forget_write(&characteristic);
        if Some(characteristic) == self.debug.term {
            effects.push(Effect::Debug(DebugEvent::StdinSent {
                message: String::from_utf8_lossy(data.as_deref().unwrap_or_default())
                    .into_owned(),
                ok: result.is_ok(),
            }));
        }
        if let Err(e) = result {
            let data = data.unwrap_or_default();
            self.fail(Op::Write { characteristic, data }, e, effects);
        }
    }

    fn on_descriptor_written(
        &mut self,
        characteristic: Uuid,
        result: Result<(), TransportError>,
        effects: &mut Vec<Effect>,
    ) {
        let Some(head) = self.descriptors.peek().copied() else {
            trace!("Descriptor completion with empty queue");
            return;
        };
        if !self.descriptors.is_in_flight() || head.characteristic != characteristic {
            warn!(
                "Unexpected descriptor completion for {} (head {})",
                characteristic, head.characteristic
            );
            return;
        }
        match result {
            Ok(()) => {
                self.descriptors.complete();
                trace!("Descriptor write on {} done", characteristic);
                self.pump(effects);
            }
            Err(e) => self.fail(Op::WriteDescriptor(head), e, effects),
        }
    }

    /// Transient errors and errors while bonding are retried; the rest kill the session
    fn fail(&mut self, op: Op, error: TransportError, effects: &mut Vec<Effect>) {
        if !self.state.is_linked() {
            trace!("Ignoring failure of {:?} in state {}", op, self.state);
            return;
        }
        match (&op, &error) {
            (Op::ReadRssi, _) => {
                debug!("RSSI read refused: {}", error);
            }
            (Op::Disconnect, _) => {
                debug!("Disconnect refused ({}), treating link as closed", error);
                self.release_link();
                let next = if self.user_disconnect {
                    NodeState::Idle
                } else {
                    NodeState::Unreachable
                };
                self.transition(next, effects);
            }
            (_, TransportError::NotConnected) if op != Op::Connect => {
                debug!("{:?} refused, link is going down", op);
            }
            _ if error.is_transient() || self.bond == BondState::Bonding => {
                debug!("{:?} failed ({}), retrying", op, error);
                effects.push(Effect::RetryAfter(op));
            }
            _ => {
                error!("{:?} failed: {}", op, error);
                self.release_link_with_close(effects);
                self.transition(NodeState::Dead, effects);
            }
        }
    }

    fn usable_characteristic(&self, feature: &Feature) -> Option<Uuid> {
        if self.state != NodeState::Connected || !feature.is_enabled() {
            return None;
        }
        self.table.characteristic_for(feature)
    }

    fn props(&self, characteristic: &Uuid) -> CharacteristicProperties {
        self.properties
            .get(characteristic)
            .copied()
            .unwrap_or_default()
    }

    fn characteristic_notifying(&self, characteristic: &Uuid) -> bool {
        self.notifying
            .iter()
            .any(|f| self.table.characteristic_for(f).as_ref() == Some(characteristic))
    }

    fn toggle_notify(&mut self, characteristic: Uuid, enabled: bool, effects: &mut Vec<Effect>) {
        let Some(handle) = self.handle else {
            return;
        };
        effects.push(Effect::Issue(
            handle,
            Op::SetNotify {
                characteristic,
                enabled,
            },
        ));
        self.descriptors
            .enqueue(PendingWrite::new(characteristic, enabled));
        self.pump(effects);
    }

    fn defer(&mut self, op: Op) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.deferred.push_back(op);
        self.pump(&mut effects);
        effects
    }

    /// Start the next descriptor write, or release deferred operations once none remain
    fn pump(&mut self, effects: &mut Vec<Effect>) {
        let Some(handle) = self.handle else {
            return;
        };
        if !self.descriptors.is_empty() {
            if let Some(write) = self.descriptors.start() {
                effects.push(Effect::Issue(handle, Op::WriteDescriptor(write)));
            }
            return;
        }
        while let Some(op) = self.deferred.pop_front() {
            if op == Op::Disconnect {
                if self.state == NodeState::Disconnecting {
                    self.clear_notifying();
                    effects.push(Effect::Issue(handle, op));
                }
                continue;
            }
            self.issue(handle, op, effects);
        }
    }

    fn issue(&mut self, handle: ConnectionHandle, op: Op, effects: &mut Vec<Effect>) {
        if let Op::Write {
            characteristic,
            data,
        } = &op
        {
            self.outstanding_writes
                .push_back((*characteristic, data.clone()));
        }
        effects.push(Effect::Issue(handle, op));
    }

    fn forget_write(&mut self, characteristic: &Uuid) -> Option<Vec<u8>> {
        let index = self
            .outstanding_writes
            .iter()
            .position(|(c, _)| c == characteristic)?;
        self.outstanding_writes.remove(index).map(|(_, data)| data)
    }

    fn clear_notifying(&mut self) {
        for feature in self.notifying.drain(..) {
            feature.set_notifying(false);
        }
        self.debug_notifying = false;
    }

    fn clear_link_bookkeeping(&mut self) {
        self.clear_notifying();
        self.descriptors.clear();
        self.deferred.clear();
        self.outstanding_writes.clear();
    }

    fn release_link(&mut self) {
        self.clear_link_bookkeeping();
        self.handle = None;
    }

    fn release_link_with_close(&mut self, effects: &mut Vec<Effect>) {
        if let Some(handle) = self.handle {
            effects.push(Effect::Issue(handle, Op::Disconnect));
        }
        self.release_link();
    }

    fn transition(&mut self, next: NodeState, effects: &mut Vec<Effect>) {
        let old = self.state;
        if old == next {
            return;
        }
        debug!("State {} -> {}", old, next);
        self.state = next;
        effects.push(Effect::StateChanged { old, new: next });
        match next {
            NodeState::Idle => effects.push(Effect::ArmLiveness),
            NodeState::Connecting | NodeState::Connected | NodeState::Dead => {
                effects.push(Effect::CancelLiveness)
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::builtin::{ACCELERATION, GYROSCOPE, MIC_LEVEL, TEMPERATURE};
    use crate::protocol::uuids::{
        feature_characteristic, CLIENT_CONFIGURATION_DESCRIPTOR, DEBUG_STDERR_CHARACTERISTIC,
        DEBUG_TERM_CHARACTERISTIC, FEATURE_COMMAND_CHARACTERISTIC,
    };
    use crate::transport::CharacteristicInfo;

    const H: ConnectionHandle = ConnectionHandle(1);

    fn notify_read() -> CharacteristicProperties {
        CharacteristicProperties {
            read: true,
            notify: true,
            ..Default::default()
        }
    }

    fn services() -> Vec<ServiceInfo> {
        vec![
            ServiceInfo {
                uuid: Uuid::from_u128(0x0000_0000_0001_11e1_9ab4_0002_a5d5_c51b),
                characteristics: vec![
                    CharacteristicInfo {
                        uuid: feature_characteristic(0x00C0_0000),
                        properties: notify_read(),
                    },
                    CharacteristicInfo {
                        uuid: feature_characteristic(0x0004_0000),
                        properties: notify_read(),
                    },
                ],
            },
            ServiceInfo {
                uuid: CONFIG_SERVICE,
                characteristics: vec![CharacteristicInfo {
                    uuid: FEATURE_COMMAND_CHARACTERISTIC,
                    properties: CharacteristicProperties {
                        write: true,
                        notify: true,
                        ..Default::default()
                    },
                }],
            },
            ServiceInfo {
                uuid: DEBUG_SERVICE,
                characteristics: vec![
                    CharacteristicInfo {
                        uuid: DEBUG_TERM_CHARACTERISTIC,
                        properties: CharacteristicProperties {
                            write: true,
                            notify: true,
                            ..Default::default()
                        },
                    },
                    CharacteristicInfo {
                        uuid: DEBUG_STDERR_CHARACTERISTIC,
                        properties: notify_read(),
                    },
                ],
            },
        ]
    }

    fn machine() -> SessionMachine {
        SessionMachine::new(vec![
            Feature::new(ACCELERATION, 0x0080_0000),
            Feature::new(GYROSCOPE, 0x0040_0000),
            Feature::new(TEMPERATURE, 0x0004_0000),
        ])
    }

    fn issued(effects: &[Effect]) -> Vec<Op> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Issue(_, op) => Some(op.clone()),
                _ => None,
            })
            .collect()
    }

    fn states(effects: &[Effect]) -> Vec<NodeState> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::StateChanged { new, .. } => Some(*new),
                _ => None,
            })
            .collect()
    }

    fn connected() -> SessionMachine {
        connected_with(machine(), services())
    }

    fn connected_with(mut m: SessionMachine, services: Vec<ServiceInfo>) -> SessionMachine {
        m.start();
        m.connect().expect("idle accepts connect");
        m.connection_started(H);
        m.handle_event(H, TransportEvent::Connected);
        let effects = m.handle_event(H, TransportEvent::ServicesDiscovered(Ok(services)));
        assert_eq!(states(&effects), vec![NodeState::Connected]);
        m.handle_event(
            H,
            TransportEvent::DescriptorWritten {
                characteristic: FEATURE_COMMAND_CHARACTERISTIC,
                descriptor: CLIENT_CONFIGURATION_DESCRIPTOR,
                result: Ok(()),
            },
        );
        m
    }

    #[test]
    fn test_connect_discover_connected() {
        let mut m = machine();
        assert_eq!(states(&m.start()), vec![NodeState::Idle]);
        let effects = m.connect().expect("connect");
        assert!(matches!(effects.last(), Some(Effect::Connect)));
        m.connection_started(H);
        assert_eq!(
            issued(&m.handle_event(H, TransportEvent::Connected)),
            vec![Op::DiscoverServices]
        );
        let effects = m.handle_event(H, TransportEvent::ServicesDiscovered(Ok(services())));
        assert_eq!(
            issued(&effects),
            vec![
                Op::SetNotify {
                    characteristic: FEATURE_COMMAND_CHARACTERISTIC,
                    enabled: true
                },
                Op::WriteDescriptor(PendingWrite::new(FEATURE_COMMAND_CHARACTERISTIC, true)),
            ]
        );
        assert!(m.has_debug_console());
        assert!(m.has_command_channel());
        assert!(m.table().features()[0].is_enabled());
    }

    #[test]
    fn test_empty_discovery_is_fatal_unless_bonding() {
        let mut m = machine();
        m.start();
        m.connect();
        m.connection_started(H);
        m.set_bond_state(BondState::Bonding);
        let effects = m.handle_event(H, TransportEvent::ServicesDiscovered(Ok(vec![])));
        assert!(matches!(
            effects.as_slice(),
            [Effect::RetryAfter(Op::DiscoverServices)]
        ));

        m.set_bond_state(BondState::None);
        let effects = m.handle_event(H, TransportEvent::ServicesDiscovered(Ok(vec![])));
        assert_eq!(states(&effects), vec![NodeState::Dead]);
        assert!(m.connect().is_none());
    }

    #[test]
    fn test_only_one_descriptor_write_in_flight() {
        let mut m = connected();
        let features = m.table().features().to_vec();

        let first = m.enable_notification(&features[0]).expect("accepted");
        assert_eq!(issued(&first).len(), 2);
        let second = m.enable_notification(&features[2]).expect("accepted");
        assert_eq!(
            issued(&second),
            vec![Op::SetNotify {
                characteristic: feature_characteristic(0x0004_0000),
                enabled: true
            }]
        );
        assert_eq!(m.descriptors().len(), 2);

        let done = m.handle_event(
            H,
            TransportEvent::DescriptorWritten {
                characteristic: feature_characteristic(0x00C0_0000),
                descriptor: CLIENT_CONFIGURATION_DESCRIPTOR,
                result: Ok(()),
            },
        );
        assert_eq!(
            issued(&done),
            vec![Op::WriteDescriptor(PendingWrite::new(
                feature_characteristic(0x0004_0000),
                true
            ))]
        );
    }

    #[test]
    fn test_shared_characteristic_toggles_once() {
        let mut m = connected();
        let features = m.table().features().to_vec();
        m.enable_notification(&features[0]).expect("accepted");
        let again = m.enable_notification(&features[1]).expect("accepted");
        assert!(issued(&again).is_empty());
        assert!(m.enable_notification(&features[1]).expect("idempotent").is_empty());

        let off = m.disable_notification(&features[0]).expect("accepted");
        assert!(issued(&off).is_empty());
        let off = m.disable_notification(&features[1]).expect("accepted");
        assert_eq!(
            issued(&off)[0],
            Op::SetNotify {
                characteristic: feature_characteristic(0x00C0_0000),
                enabled: false
            }
        );
    }

    #[test]
    fn test_read_waits_for_descriptor_queue() {
        let mut m = connected();
        let features = m.table().features().to_vec();
        m.enable_notification(&features[2]).expect("accepted");
        let read = m.read_feature(&features[0]).expect("readable");
        assert!(issued(&read).is_empty());

        let done = m.handle_event(
            H,
            TransportEvent::DescriptorWritten {
                characteristic: feature_characteristic(0x0004_0000),
                descriptor: CLIENT_CONFIGURATION_DESCRIPTOR,
                result: Ok(()),
            },
        );
        assert_eq!(
            issued(&done),
            vec![Op::Read(feature_characteristic(0x00C0_0000))]
        );
    }

    #[test]
    fn test_retried_read_waits_for_descriptor_queue() {
        let mut m = connected();
        let features = m.table().features().to_vec();
        let motion = feature_characteristic(0x00C0_0000);
        let read = m.read_feature(&features[0]).expect("readable");
        assert_eq!(issued(&read), vec![Op::Read(motion)]);

        m.enable_notification(&features[2]).expect("accepted");
        assert!(m.descriptors().is_in_flight());
        let failed = m.handle_event(
            H,
            TransportEvent::CharacteristicRead {
                characteristic: motion,
                result: Err(TransportError::Busy),
            },
        );
        assert!(matches!(
            failed.as_slice(),
            [Effect::RetryAfter(Op::Read(c))] if *c == motion
        ));

        assert!(issued(&m.retry(Op::Read(motion))).is_empty());
        assert!(issued(&m.retry(Op::ReadRssi)).is_empty());
        let done = m.handle_event(
            H,
            TransportEvent::DescriptorWritten {
                characteristic: feature_characteristic(0x0004_0000),
                descriptor: CLIENT_CONFIGURATION_DESCRIPTOR,
                result: Ok(()),
            },
        );
        assert_eq!(issued(&done), vec![Op::Read(motion), Op::ReadRssi]);
    }

    #[test]
    fn test_write_feature_data_rules() {
        let temperature = feature_characteristic(0x0004_0000);
        let mut services = services();
        services[0].characteristics[1].properties.write = true;
        let m = SessionMachine::new(vec![
            Feature::new(ACCELERATION, 0x0080_0000),
            Feature::new(GYROSCOPE, 0x0040_0000),
            Feature::new(TEMPERATURE, 0x0004_0000),
            Feature::new(MIC_LEVEL, 0x0400_0000),
        ]);
        let mut m = connected_with(m, services);
        let features = m.table().features().to_vec();
        let (acc, temp, mic) = (&features[0], &features[2], &features[3]);
        assert_eq!(mic.name(), "Mic Level");
        assert!(!mic.is_enabled());

        assert!(m.write_feature_data(mic, &[0x01]).is_none());
        assert!(m.write_feature_data(acc, &[0x01]).is_none());
        let first = m.write_feature_data(temp, &[0x2A]).expect("writable");
        assert_eq!(
            issued(&first),
            vec![Op::Write {
                characteristic: temperature,
                data: vec![0x2A]
            }]
        );

        m.enable_notification(acc).expect("accepted");
        let queued = m.write_feature_data(temp, &[0x2B]).expect("writable");
        assert!(issued(&queued).is_empty());
        let done = m.handle_event(
            H,
            TransportEvent::DescriptorWritten {
                characteristic: feature_characteristic(0x00C0_0000),
                descriptor: CLIENT_CONFIGURATION_DESCRIPTOR,
                result: Ok(()),
            },
        );
        assert_eq!(
            issued(&done),
            vec![Op::Write {
                characteristic: temperature,
                data: vec![0x2B]
            }]
        );

        let failed = m.handle_event(
            H,
            TransportEvent::CharacteristicWritten {
                characteristic: temperature,
                result: Err(TransportError::Busy),
            },
        );
        assert!(matches!(
            failed.as_slice(),
            [Effect::RetryAfter(Op::Write { characteristic, data })]
                if *characteristic == temperature && *data == vec![0x2A]
        ));

        let mut idle = machine();
        idle.start();
        let temp = idle.table().features()[2].clone();
        assert!(idle.write_feature_data(&temp, &[0x01]).is_none());
    }

    #[test]
    fn test_descriptor_failure_retries_same_write() {
        let mut m = connected();
        let features = m.table().features().to_vec();
        m.enable_notification(&features[2]).expect("accepted");
        let write = PendingWrite::new(feature_characteristic(0x0004_0000), true);
        let failed = m.handle_event(
            H,
            TransportEvent::DescriptorWritten {
                characteristic: write.characteristic,
                descriptor: CLIENT_CONFIGURATION_DESCRIPTOR,
                result: Err(TransportError::Busy),
            },
        );
        assert!(matches!(
            failed.as_slice(),
            [Effect::RetryAfter(Op::WriteDescriptor(w))] if *w == write
        ));
        assert_eq!(
            issued(&m.retry(Op::WriteDescriptor(write))),
            vec![Op::WriteDescriptor(write)]
        );
    }

    #[test]
    fn test_fatal_read_failure_kills_session() {
        let mut m = connected();
        let effects = m.handle_event(
            H,
            TransportEvent::CharacteristicRead {
                characteristic: feature_characteristic(0x00C0_0000),
                result: Err(TransportError::Fatal("gatt error".into())),
            },
        );
        assert_eq!(states(&effects), vec![NodeState::Dead]);
        assert_eq!(issued(&effects), vec![Op::Disconnect]);
        assert!(m.handle().is_none());
    }

    #[test]
    fn test_unexpected_disconnect_is_unreachable() {
        let mut m = connected();
        let effects = m.handle_event(H, TransportEvent::Disconnected { error: None });
        assert_eq!(states(&effects), vec![NodeState::Unreachable]);
        assert!(m.connect().is_some());
    }

    #[test]
    fn test_user_disconnect_returns_to_idle() {
        let mut m = connected();
        let effects = m.disconnect().expect("connected");
        assert_eq!(states(&effects), vec![NodeState::Disconnecting]);
        assert_eq!(issued(&effects), vec![Op::Disconnect]);
        let effects = m.handle_event(H, TransportEvent::Disconnected { error: None });
        assert_eq!(states(&effects), vec![NodeState::Idle]);
        assert!(effects.iter().any(|e| matches!(e, Effect::ArmLiveness)));
    }

    #[test]
    fn test_stale_handle_ignored() {
        let mut m = connected();
        let effects = m.handle_event(
            ConnectionHandle(9),
            TransportEvent::Disconnected { error: None },
        );
        assert!(effects.is_empty());
        assert_eq!(m.state(), NodeState::Connected);
    }

    #[test]
    fn test_command_response_routed_by_mask() {
        let mut m = connected();
        let mut value = vec![0x01, 0x00];
        value.extend_from_slice(&0x0040_0000u32.to_be_bytes());
        value.push(0x02);
        value.push(0xAA);
        let effects = m.handle_event(
            H,
            TransportEvent::CharacteristicChanged {
                characteristic: FEATURE_COMMAND_CHARACTERISTIC,
                value: value.clone(),
            },
        );
        assert!(matches!(
            effects.as_slice(),
            [Effect::Response(f, r)] if f.name() == "Gyroscope" && r.payload == vec![0xAA]
        ));

        value[2..6].copy_from_slice(&0x0000_0001u32.to_be_bytes());
        let effects = m.handle_event(
            H,
            TransportEvent::CharacteristicChanged {
                characteristic: FEATURE_COMMAND_CHARACTERISTIC,
                value,
            },
        );
        assert!(effects.is_empty());
    }

    #[test]
    fn test_send_command_frames_packet() {
        let mut m = connected();
        let gyro = m.table().features()[1].clone();
        let effects = m.send_command(&gyro, 0x05, &[0x10]).expect("command channel");
        assert_eq!(
            issued(&effects),
            vec![Op::Write {
                characteristic: FEATURE_COMMAND_CHARACTERISTIC,
                data: vec![0x00, 0x40, 0x00, 0x00, 0x05, 0x10]
            }]
        );
    }

    #[test]
    fn test_liveness_only_from_idle() {
        let mut m = machine();
        m.start();
        assert_eq!(states(&m.liveness_expired()), vec![NodeState::Lost]);
        let effects = m.update_rssi(-60);
        assert_eq!(states(&effects), vec![NodeState::Idle]);
        assert!(matches!(effects[0], Effect::Rssi(-60)));

        let mut m = connected();
        assert!(m.liveness_expired().is_empty());
    }

    #[test]
    fn test_debug_write_truncates_and_echoes() {
        let mut m = connected();
        let (written, effects) = m
            .write_debug(b"0123456789abcdefghijKLM")
            .expect("debug console");
        assert_eq!(written, DEBUG_WRITE_CHUNK);
        assert_eq!(issued(&effects).len(), 1);
        let echo = m.handle_event(
            H,
            TransportEvent::CharacteristicWritten {
                characteristic: DEBUG_TERM_CHARACTERISTIC,
                result: Ok(()),
            },
        );
        assert!(matches!(
            echo.as_slice(),
            [Effect::Debug(DebugEvent::StdinSent { message, ok: true })]
                if message == "0123456789abcdefghij"
        ));
    }

    #[test]
    fn test_bonded_while_connected_reannounces() {
        let mut m = connected();
        let effects = m.handle_event(H, TransportEvent::BondStateChanged(BondState::Bonded));
        assert!(matches!(
            effects.as_slice(),
            [Effect::StateChanged {
                old: NodeState::Connected,
                new: NodeState::Connected
            }]
        ));
    }
}
