//! In-memory transport and scanner for tests and demos
//!
//! `MockTransport` records every operation it is asked to start and lets the caller inject
//! completion events by hand. `ManualScanner` keeps the sink handed to `start_scan` so
//! advertisements can be pushed from outside.

use super::{
    Advertisement, AdvertisementScanner, AdvertisementSink, BleTransport, BondState,
    ConnectionHandle, TransportError, TransportEvent, TransportEventSender,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

/// Operation started on a [`MockTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedOp {
    Connect(String),
    Disconnect,
    DiscoverServices,
    Read(Uuid),
    Write(Uuid, Vec<u8>),
    WriteDescriptor(Uuid, Vec<u8>),
    SetNotify(Uuid, bool),
    ReadRssi,
}

#[derive(Default)]
struct MockState {
    next_handle: u64,
    current: Option<(ConnectionHandle, TransportEventSender)>,
    ops: Vec<RecordedOp>,
    failures: VecDeque<TransportError>,
    bonds: HashMap<String, BondState>,
}

/// Transport that records calls instead of touching a radio
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Operations started so far
    pub fn ops(&self) -> Vec<RecordedOp> {
        self.state.lock().ops.clone()
    }

    /// Operations started so far, clearing the log
    pub fn take_ops(&self) -> Vec<RecordedOp> {
        std::mem::take(&mut self.state.lock().ops)
    }

    pub fn set_bond_state(&self, address: &str, state: BondState) {
        self.state.lock().bonds.insert(address.to_string(), state);
    }

    /// Make the next initiator call fail synchronously with `error`
    pub fn fail_next(&self, error: TransportError) {
        self.state.lock().failures.push_back(error);
    }

    /// Handle of the most recent connection
    pub fn handle(&self) -> Option<ConnectionHandle> {
        self.state.lock().current.as_ref().map(|(h, _)| *h)
    }

    /// Deliver `event` on the current connection; false if there is none
    pub fn emit(&self, event: TransportEvent) -> bool {
        let state = self.state.lock();
        match &state.current {
            Some((handle, events)) => events.send((*handle, event)).is_ok(),
            None => false,
        }
    }

    /// Deliver `event` as if it came from an older connection
    pub fn emit_for(&self, handle: ConnectionHandle, event: TransportEvent) -> bool {
        let state = self.state.lock();
        match &state.current {
            Some((_, events)) => events.send((handle, event)).is_ok(),
            None => false,
        }
    }

    fn record(&self, op: RecordedOp) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }
        state.ops.push(op);
        Ok(())
    }
}

impl BleTransport for MockTransport {
    fn connect(
        &self,
        address: &str,
        events: TransportEventSender,
    ) -> Result<ConnectionHandle, TransportError> {
        self.record(RecordedOp::Connect(address.to_string()))?;
        let mut state = self.state.lock();
        state.next_handle += 1;
        let handle = ConnectionHandle(state.next_handle);
        state.current = Some((handle, events));
        Ok(handle)
    }

    fn disconnect(&self, _handle: ConnectionHandle) -> Result<(), TransportError> {
        self.record(RecordedOp::Disconnect)
    }

    fn discover_services(&self, _handle: ConnectionHandle) -> Result<(), TransportError> {
        self.record(RecordedOp::DiscoverServices)
    }

    fn read_characteristic(
        &self,
        _handle: ConnectionHandle,
        characteristic: Uuid,
    ) -> Result<(), TransportError> {
        self.record(RecordedOp::Read(characteristic))
    }

    fn write_characteristic(
        &self,
        _handle: ConnectionHandle,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), TransportError> {
        self.record(RecordedOp::Write(characteristic, data.to_vec()))
    }

    fn write_descriptor(
        &self,
        _handle: ConnectionHandle,
        characteristic: Uuid,
        _descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), TransportError> {
        self.record(RecordedOp::WriteDescriptor(characteristic, value.to_vec()))
    }

    fn set_notify(
        &self,
        _handle: ConnectionHandle,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<(), TransportError> {
        self.record(RecordedOp::SetNotify(characteristic, enabled))
    }

    fn read_rssi(&self, _handle: ConnectionHandle) -> Result<(), TransportError> {
        self.record(RecordedOp::ReadRssi)
    }

    fn bond_state(&self, address: &str) -> BondState {
        self.state
            .lock()
            .bonds
            .get(address)
            .copied()
            .unwrap_or(BondState::None)
    }
}

/// Scanner driven by hand
#[derive(Default)]
pub struct ManualScanner {
    sink: Mutex<Option<AdvertisementSink>>,
}

impl ManualScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_scanning(&self) -> bool {
        self.sink.lock().is_some()
    }

    /// Deliver an advertisement; false when no scan is running
    pub fn push(&self, advertisement: Advertisement) -> bool {
        match self.sink.lock().as_ref() {
            Some(sink) => sink.send(advertisement).is_ok(),
            None => false,
        }
    }
}

impl AdvertisementScanner for ManualScanner {
    fn start_scan(&self, sink: AdvertisementSink) -> Result<(), TransportError> {
        *self.sink.lock() = Some(sink);
        Ok(())
    }

    fn stop_scan(&self) {
        self.sink.lock().take();
    }
}
