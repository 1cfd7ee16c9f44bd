//! Payload decoders
//!
//! Raw characteristic bytes are turned into [`Reading`]s by a decoder
//! registered per characteristic UUID. Only generic layouts live here;
//! sensor-specific formulas belong to the drivers.

use crate::domain::driver::{BleDriver, CharacteristicValue};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    Raw(Vec<u8>),
    Scalar { value: f64, unit: &'static str },
    Vector3 { x: f64, y: f64, z: f64, unit: &'static str },
    Text(String),
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reading::Raw(bytes) => write!(f, "{:02X?}", bytes),
            Reading::Scalar { value, unit } => write!(f, "{value}{unit}"),
            Reading::Vector3 { x, y, z, unit } => write!(f, "({x}, {y}, {z}){unit}"),
            Reading::Text(text) => write!(f, "\"{text}\""),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("payload too short: need {needed} bytes, got {actual}")]
    TooShort { needed: usize, actual: usize },

    #[error("payload is not valid UTF-8")]
    InvalidText,

    #[error("unsupported integer width {0}")]
    UnsupportedWidth(usize),
}

pub trait PayloadDecoder: Send + Sync {
    fn decode(&self, payload: &[u8]) -> Result<Reading, DecodeError>;
}

/// Passes bytes through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawDecoder;

impl PayloadDecoder for RawDecoder {
    fn decode(&self, payload: &[u8]) -> Result<Reading, DecodeError> {
        Ok(Reading::Raw(payload.to_vec()))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8Decoder;

impl PayloadDecoder for Utf8Decoder {
    fn decode(&self, payload: &[u8]) -> Result<Reading, DecodeError> {
        let text = std::str::from_utf8(payload).map_err(|_| DecodeError::InvalidText)?;
        Ok(Reading::Text(text.trim_end_matches('\0').to_string()))
    }
}

/// Little-endian integer at a fixed offset, multiplied by `scale`.
#[derive(Debug, Clone, Copy)]
pub struct ScaledInteger {
    pub offset: usize,
    /// Width in bytes: 1, 2, 4 or 8.
    pub width: usize,
    pub signed: bool,
    pub scale: f64,
    pub unit: &'static str,
}

impl ScaledInteger {
    pub fn unsigned(width: usize) -> Self {
        Self {
            offset: 0,
            width,
            signed: false,
            scale: 1.0,
            unit: "",
        }
    }

    pub fn signed(width: usize) -> Self {
        Self {
            signed: true,
            ..Self::unsigned(width)
        }
    }

    pub fn at(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn scaled(mut self, scale: f64, unit: &'static str) -> Self {
        self.scale = scale;
        self.unit = unit;
        self
    }

    fn raw_value(&self, payload: &[u8]) -> Result<f64, DecodeError> {
        if !matches!(self.width, 1 | 2 | 4 | 8) {
            return Err(DecodeError::UnsupportedWidth(self.width));
        }
        let needed = self.offset + self.width;
        let bytes = payload.get(self.offset..needed).ok_or(DecodeError::TooShort {
            needed,
            actual: payload.len(),
        })?;

        let mut buf = [0u8; 8];
        buf[..self.width].copy_from_slice(bytes);
        let unsigned = u64::from_le_bytes(buf);

        if self.signed {
            // sign-extend from the top bit of the field
            let shift = 64 - 8 * self.width as u32;
            Ok(((unsigned << shift) as i64 >> shift) as f64)
        } else {
            Ok(unsigned as f64)
        }
    }
}

impl PayloadDecoder for ScaledInteger {
    fn decode(&self, payload: &[u8]) -> Result<Reading, DecodeError> {
        Ok(Reading::Scalar {
            value: self.raw_value(payload)? * self.scale,
            unit: self.unit,
        })
    }
}

/// Three consecutive integers of the same layout, e.g. accelerometer axes.
#[derive(Debug, Clone, Copy)]
pub struct ScaledVector {
    pub axis: ScaledInteger,
}

impl ScaledVector {
    pub fn new(axis: ScaledInteger) -> Self {
        Self { axis }
    }
}

impl PayloadDecoder for ScaledVector {
    fn decode(&self, payload: &[u8]) -> Result<Reading, DecodeError> {
        let component = |index: usize| {
            self.axis
                .at(self.axis.offset + index * self.axis.width)
                .raw_value(payload)
                .map(|raw| raw * self.axis.scale)
        };
        Ok(Reading::Vector3 {
            x: component(0)?,
            y: component(1)?,
            z: component(2)?,
            unit: self.axis.unit,
        })
    }
}

/// Decoder for a name used in device configuration files.
pub fn decoder_by_name(name: &str) -> Option<Arc<dyn PayloadDecoder>> {
    let decoder: Arc<dyn PayloadDecoder> = match name.to_ascii_lowercase().as_str() {
        "raw" => Arc::new(RawDecoder),
        "utf8" | "text" => Arc::new(Utf8Decoder),
        "u8" => Arc::new(ScaledInteger::unsigned(1)),
        "i8" => Arc::new(ScaledInteger::signed(1)),
        "u16le" => Arc::new(ScaledInteger::unsigned(2)),
        "i16le" => Arc::new(ScaledInteger::signed(2)),
        "u32le" => Arc::new(ScaledInteger::unsigned(4)),
        "i32le" => Arc::new(ScaledInteger::signed(4)),
        "battery" => Arc::new(ScaledInteger::unsigned(1).scaled(1.0, "%")),
        "xyz_i16le" => Arc::new(ScaledVector::new(ScaledInteger::signed(2))),
        _ => return None,
    };
    Some(decoder)
}

/// Decoders keyed by characteristic UUID, with a fallback for the rest.
#[derive(Clone)]
pub struct DecoderTable {
    decoders: HashMap<Uuid, Arc<dyn PayloadDecoder>>,
    fallback: Arc<dyn PayloadDecoder>,
}

impl Default for DecoderTable {
    fn default() -> Self {
        Self {
            decoders: HashMap::new(),
            fallback: Arc::new(RawDecoder),
        }
    }
}

impl DecoderTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, characteristic: Uuid, decoder: Arc<dyn PayloadDecoder>) {
        self.decoders.insert(characteristic, decoder);
    }

    pub fn with(mut self, characteristic: Uuid, decoder: Arc<dyn PayloadDecoder>) -> Self {
        self.insert(characteristic, decoder);
        self
    }

    pub fn decode(&self, characteristic: Uuid, payload: &[u8]) -> Result<Reading, DecodeError> {
        self.decoders
            .get(&characteristic)
            .unwrap_or(&self.fallback)
            .decode(payload)
    }
}

type ReadingSink = dyn Fn(&CharacteristicValue, Result<Reading, DecodeError>) + Send + Sync;

/// A driver that decodes every value and hands it to a sink.
pub struct DecodingDriver {
    table: DecoderTable,
    sink: Box<ReadingSink>,
}

impl DecodingDriver {
    pub fn new<F>(table: DecoderTable, sink: F) -> Self
    where
        F: Fn(&CharacteristicValue, Result<Reading, DecodeError>) + Send + Sync + 'static,
    {
        Self {
            table,
            sink: Box::new(sink),
        }
    }
}

impl BleDriver for DecodingDriver {
    fn on_value(&self, value: CharacteristicValue) {
        let reading = self.table.decode(value.characteristic, &value.value);
        (self.sink)(&value, reading);
    }
}
