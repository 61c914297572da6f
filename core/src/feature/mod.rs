//! Features: typed data streams exported by a board
//!
//! A [`FeatureType`] describes a stream (name, field layout, decoder factory) and is
//! registered per board type in the [`FeatureRegistry`]. Each connected session owns
//! [`Feature`] instances built from those types; the [`FeatureDispatchTable`] routes raw
//! characteristic bytes to them.

pub mod builtin;
pub mod dispatch;
pub mod registry;

use crate::listener::ListenerList;
use crate::protocol::CommandResponse;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

pub use dispatch::{DispatchReport, FeatureDispatchTable, RollingTimestamp};
pub use registry::{FeatureRegistry, RegistryError};

/// Errors from a single decode step
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Insufficient data: need {needed} bytes, {available} available")]
    InsufficientData { needed: usize, available: usize },
}

/// Primitive encoding of one field on the wire (little endian)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Float,
}

impl FieldType {
    /// Bytes occupied on the wire
    pub const fn width(&self) -> usize {
        match self {
            FieldType::Int8 | FieldType::UInt8 => 1,
            FieldType::Int16 | FieldType::UInt16 => 2,
            FieldType::Int32 | FieldType::UInt32 | FieldType::Float => 4,
        }
    }

    fn read(&self, bytes: &[u8]) -> FieldValue {
        match self {
            FieldType::Int8 => FieldValue::Int(bytes[0] as i8 as i64),
            FieldType::UInt8 => FieldValue::UInt(bytes[0] as u64),
            FieldType::Int16 => FieldValue::Int(i16::from_le_bytes([bytes[0], bytes[1]]) as i64),
            FieldType::UInt16 => FieldValue::UInt(u16::from_le_bytes([bytes[0], bytes[1]]) as u64),
            FieldType::Int32 => FieldValue::Int(
                i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64,
            ),
            FieldType::UInt32 => FieldValue::UInt(
                u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as u64,
            ),
            FieldType::Float => FieldValue::Float(
                f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64,
            ),
        }
    }
}

/// Description of one value inside a sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Field {
    pub name: &'static str,
    pub unit: &'static str,
    pub field_type: FieldType,
    pub min: f64,
    pub max: f64,
    /// Divisor applied to the raw integer; 1.0 keeps the raw value
    pub scale: f64,
}

impl Field {
    pub const fn new(
        name: &'static str,
        unit: &'static str,
        field_type: FieldType,
        min: f64,
        max: f64,
    ) -> Self {
        Self {
            name,
            unit,
            field_type,
            min,
            max,
            scale: 1.0,
        }
    }

    pub const fn scaled(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    fn decode(&self, bytes: &[u8]) -> FieldValue {
        let raw = self.field_type.read(bytes);
        if self.scale == 1.0 {
            raw
        } else {
            FieldValue::Float(raw.as_f64() / self.scale)
        }
    }
}

/// One decoded value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Int(i64),
    UInt(u64),
    Float(f64),
}

impl FieldValue {
    pub fn as_f64(&self) -> f64 {
        match *self {
            FieldValue::Int(v) => v as f64,
            FieldValue::UInt(v) => v as f64,
            FieldValue::Float(v) => v,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Int(v) => write!(f, "{}", v),
            FieldValue::UInt(v) => write!(f, "{}", v),
            FieldValue::Float(v) => write!(f, "{:.3}", v),
        }
    }
}

/// A timestamped observation produced by one decode step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: u64,
    pub values: Vec<FieldValue>,
}

/// Outcome of a decode step
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractResult {
    pub sample: Sample,
    pub bytes_read: usize,
}

/// Stateful decode step shared by every feature type.
///
/// `extract` reads the feature's bytes starting at `offset` and reports how many it
/// consumed so the caller can advance to the next feature of the same payload.
pub trait FeatureDecoder: Send {
    fn extract(
        &mut self,
        timestamp: u64,
        data: &[u8],
        offset: usize,
    ) -> Result<ExtractResult, DecodeError>;
}

/// Decoder for features made of fixed-width fields laid out back to back
pub struct LayoutDecoder {
    fields: &'static [Field],
}

impl LayoutDecoder {
    pub fn new(fields: &'static [Field]) -> Self {
        Self { fields }
    }

    /// Bytes consumed per sample
    pub fn width(&self) -> usize {
        self.fields.iter().map(|f| f.field_type.width()).sum()
    }
}

impl FeatureDecoder for LayoutDecoder {
    fn extract(
        &mut self,
        timestamp: u64,
        data: &[u8],
        offset: usize,
    ) -> Result<ExtractResult, DecodeError> {
        let needed = self.width();
        let available = data.len().saturating_sub(offset);
        if available < needed {
            return Err(DecodeError::InsufficientData { needed, available });
        }
        let mut cursor = offset;
        let values = self
            .fields
            .iter()
            .map(|field| {
                let width = field.field_type.width();
                let value = field.decode(&data[cursor..cursor + width]);
                cursor += width;
                value
            })
            .collect();
        Ok(ExtractResult {
            sample: Sample { timestamp, values },
            bytes_read: needed,
        })
    }
}

/// Decoder that exposes bytes untouched: a fixed count, or everything that is left
pub struct RawDecoder {
    length: Option<usize>,
}

impl RawDecoder {
    pub fn fixed(length: usize) -> Self {
        Self {
            length: Some(length),
        }
    }

    pub fn remaining() -> Self {
        Self { length: None }
    }
}

impl FeatureDecoder for RawDecoder {
    fn extract(
        &mut self,
        timestamp: u64,
        data: &[u8],
        offset: usize,
    ) -> Result<ExtractResult, DecodeError> {
        let available = data.len().saturating_sub(offset);
        let needed = self.length.unwrap_or(available);
        if available < needed {
            return Err(DecodeError::InsufficientData { needed, available });
        }
        let values = data[offset..offset + needed]
            .iter()
            .map(|b| FieldValue::UInt(*b as u64))
            .collect();
        Ok(ExtractResult {
            sample: Sample { timestamp, values },
            bytes_read: needed,
        })
    }
}

/// Builds a fresh decoder for one feature instance
pub type DecoderFactory = fn() -> Box<dyn FeatureDecoder>;

/// Registry entry describing a kind of feature
#[derive(Debug, Clone, Copy)]
pub struct FeatureType {
    pub name: &'static str,
    pub fields: &'static [Field],
    pub factory: DecoderFactory,
    /// Raw general-purpose stream; commands are not allowed on these
    pub general_purpose: bool,
}

impl FeatureType {
    pub const fn new(name: &'static str, fields: &'static [Field], factory: DecoderFactory) -> Self {
        Self {
            name,
            fields,
            factory,
            general_purpose: false,
        }
    }
}

/// Observer of one feature's samples and command replies
pub trait FeatureListener: Send + Sync {
    fn on_update(&self, feature: &Feature, sample: &Sample);

    fn on_command_response(&self, _feature: &Feature, _response: &CommandResponse) {}
}

struct FeatureInner {
    kind: FeatureType,
    mask: u32,
    enabled: AtomicBool,
    notifying: AtomicBool,
    decoder: Mutex<Box<dyn FeatureDecoder>>,
    last_sample: RwLock<Option<Sample>>,
    listeners: ListenerList<dyn FeatureListener>,
}

/// A feature instance owned by one session. Cloning yields another handle to the same
/// instance.
#[derive(Clone)]
pub struct Feature {
    inner: Arc<FeatureInner>,
}

impl Feature {
    pub fn new(kind: FeatureType, mask: u32) -> Self {
        Self {
            inner: Arc::new(FeatureInner {
                kind,
                mask,
                enabled: AtomicBool::new(false),
                notifying: AtomicBool::new(false),
                decoder: Mutex::new((kind.factory)()),
                last_sample: RwLock::new(None),
                listeners: ListenerList::new(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.kind.name
    }

    /// Single bit identifying the feature on its board (0 for general-purpose streams)
    pub fn mask(&self) -> u32 {
        self.inner.mask
    }

    pub fn fields(&self) -> &'static [Field] {
        self.inner.kind.fields
    }

    pub fn is_general_purpose(&self) -> bool {
        self.inner.kind.general_purpose
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_notifying(&self) -> bool {
        self.inner.notifying.load(Ordering::Acquire)
    }

    pub(crate) fn set_notifying(&self, notifying: bool) {
        self.inner.notifying.store(notifying, Ordering::Release);
    }

    pub fn last_sample(&self) -> Option<Sample> {
        self.inner.last_sample.read().clone()
    }

    pub fn add_listener(&self, listener: &Arc<dyn FeatureListener>) -> bool {
        self.inner.listeners.add(listener)
    }

    pub fn remove_listener(&self, listener: &Arc<dyn FeatureListener>) -> bool {
        self.inner.listeners.remove(listener)
    }

    /// True if both handles point at the same instance
    pub fn same_as(&self, other: &Feature) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn extract(
        &self,
        timestamp: u64,
        data: &[u8],
        offset: usize,
    ) -> Result<ExtractResult, DecodeError> {
        self.inner.decoder.lock().extract(timestamp, data, offset)
    }

    /// Store a sample and hand it to the listeners
    pub(crate) fn publish(&self, sample: Sample) {
        *self.inner.last_sample.write() = Some(sample.clone());
        let feature = self.clone();
        self.inner
            .listeners
            .dispatch(move |l| l.on_update(&feature, &sample));
    }

    pub(crate) fn publish_response(&self, response: CommandResponse) {
        let feature = self.clone();
        self.inner
            .listeners
            .dispatch(move |l| l.on_command_response(&feature, &response));
    }
}

impl fmt::Debug for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Feature")
            .field("name", &self.name())
            .field("mask", &format_args!("{:#010x}", self.mask()))
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())?;
        if let Some(sample) = self.last_sample() {
            write!(f, " [{}]", sample.timestamp)?;
            for (field, value) in self.fields().iter().zip(sample.values.iter()) {
                write!(f, " {}: {}{}", field.name, value, field.unit)?;
            }
        }
        Ok(())
    }
}
