//! Named, typed registers over a sparse field-bus holding-register space.
//!
//! Register addresses are coalesced into contiguous chunks so a refresh costs one bus
//! transaction per chunk. Reads decode from the cache only; the cache is overwritten by
//! a refresh or by a successful write, never speculatively.

use crate::error::{DcsError, DcsResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use thiserror::Error;
use tracing::{debug, warn};

/// Protocol limit for a single holding-register read.
pub const MAX_READ_REGISTERS: u16 = 125;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("field bus {operation} of {count} register(s) at {start} failed: {reason}")]
pub struct BusError {
    pub operation: &'static str,
    pub start: u16,
    pub count: u16,
    pub reason: String,
}

impl BusError {
    pub fn read(start: u16, count: u16, reason: impl Into<String>) -> Self {
        Self { operation: "read", start, count, reason: reason.into() }
    }

    pub fn write(start: u16, count: u16, reason: impl Into<String>) -> Self {
        Self { operation: "write", start, count, reason: reason.into() }
    }
}

impl From<BusError> for DcsError {
    fn from(e: BusError) -> Self {
        DcsError::CommunicationFailure(e.to_string())
    }
}

/// Holding-register transport of the cooling unit.
pub trait FieldBus: Send {
    fn connect(&mut self) -> Result<(), BusError> {
        Ok(())
    }

    fn read_holding_registers(&mut self, start: u16, count: u16) -> Result<Vec<u16>, BusError>;

    fn write_registers(&mut self, start: u16, words: &[u16]) -> Result<(), BusError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegisterKind {
    Int16,
    Bool { bit: u8 },
    Float32,
}

impl RegisterKind {
    pub fn width(self) -> u16 {
        match self {
            RegisterKind::Int16 | RegisterKind::Bool { .. } => 1,
            RegisterKind::Float32 => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RegisterValue {
    Bool(bool),
    Int(u16),
    Float(f32),
}

impl RegisterValue {
    pub fn as_bool(self) -> bool {
        match self {
            RegisterValue::Bool(b) => b,
            RegisterValue::Int(v) => v != 0,
            RegisterValue::Float(v) => v != 0.0,
        }
    }

    pub fn as_int(self) -> Option<u16> {
        match self {
            RegisterValue::Int(v) => Some(v),
            RegisterValue::Bool(b) => Some(u16::from(b)),
            RegisterValue::Float(_) => None,
        }
    }

    fn to_json(self) -> Value {
        match self {
            RegisterValue::Bool(b) => Value::from(b),
            RegisterValue::Int(v) => Value::from(v),
            RegisterValue::Float(v) => Value::from(f64::from(v)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalRegister {
    pub name: String,
    pub address: u16,
    pub kind: RegisterKind,
    pub writable: bool,
}

impl LogicalRegister {
    pub fn width(&self) -> u16 {
        self.kind.width()
    }

    fn addresses(&self) -> impl Iterator<Item = u16> {
        self.address..self.address + self.width()
    }
}

/// A contiguous run of addresses read in one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub start: u16,
    pub len: u16,
}

/// Minimal set of contiguous chunks covering `addresses`, each at most `max_len` long.
pub fn compute_chunks(addresses: &BTreeSet<u16>, max_len: Option<u16>) -> Vec<Chunk> {
    let mut chunks: Vec<Chunk> = Vec::new();
    for &addr in addresses {
        match chunks.last_mut() {
            Some(chunk)
                if u32::from(chunk.start) + u32::from(chunk.len) == u32::from(addr)
                    && max_len.map_or(true, |max| chunk.len < max) =>
            {
                chunk.len += 1;
            }
            _ => chunks.push(Chunk { start: addr, len: 1 }),
        }
    }
    chunks
}

/// Little word order: the first word carries the low half of the IEEE-754 bits.
pub fn decode_f32(words: [u16; 2]) -> f32 {
    f32::from_bits((u32::from(words[1]) << 16) | u32::from(words[0]))
}

pub fn encode_f32(value: f32) -> [u16; 2] {
    let bits = value.to_bits();
    [(bits & 0xFFFF) as u16, (bits >> 16) as u16]
}

pub struct RegisterManager {
    bus: Box<dyn FieldBus>,
    registers: BTreeMap<String, LogicalRegister>,
    addresses: BTreeSet<u16>,
    chunks: Vec<Chunk>,
    max_chunk_len: u16,
    cache: HashMap<u16, u16>,
}

impl std::fmt::Debug for RegisterManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisterManager")
            .field("registers", &self.registers.len())
            .field("chunks", &self.chunks)
            .finish_non_exhaustive()
    }
}

impl RegisterManager {
    /// `max_chunk_len` further limits reads below the protocol's [`MAX_READ_REGISTERS`].
    pub fn new(bus: Box<dyn FieldBus>, max_chunk_len: Option<u16>) -> Self {
        Self {
            bus,
            registers: BTreeMap::new(),
            addresses: BTreeSet::new(),
            chunks: Vec::new(),
            max_chunk_len: max_chunk_len.map_or(MAX_READ_REGISTERS, |len| len.min(MAX_READ_REGISTERS)),
            cache: HashMap::new(),
        }
    }

    pub fn connect(&mut self) -> DcsResult<()> {
        self.bus.connect().map_err(DcsError::from)
    }

    pub fn add_register(&mut self, name: &str, address: u16, kind: RegisterKind, writable: bool) -> DcsResult<()> {
        if self.registers.contains_key(name) {
            return Err(DcsError::config(format!("duplicate register '{}'", name)));
        }
        if let RegisterKind::Bool { bit } = kind {
            if bit > 15 {
                return Err(DcsError::config(format!("register '{}': bit {} out of range", name, bit)));
            }
        }
        if u32::from(address) + u32::from(kind.width()) > u32::from(u16::MAX) {
            return Err(DcsError::config(format!("register '{}' exceeds the address space", name)));
        }

        let register = LogicalRegister {
            name: name.to_string(),
            address,
            kind,
            writable,
        };
        self.addresses.extend(register.addresses());
        self.registers.insert(name.to_string(), register);
        self.chunks = compute_chunks(&self.addresses, Some(self.max_chunk_len));
        Ok(())
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn register(&self, name: &str) -> Option<&LogicalRegister> {
        self.registers.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.registers.keys().map(String::as_str)
    }

    /// One read per chunk. The first failure aborts the refresh; chunks already read
    /// keep their new values. Returns whether any cached word changed.
    pub fn refresh(&mut self) -> DcsResult<bool> {
        let mut changed = false;
        for chunk in &self.chunks {
            let words = self.bus.read_holding_registers(chunk.start, chunk.len).map_err(|e| {
                warn!(error = %e, "register refresh failed");
                DcsError::from(e)
            })?;
            if words.len() != usize::from(chunk.len) {
                return Err(DcsError::comm(format!(
                    "short read at {}: expected {} words, got {}",
                    chunk.start,
                    chunk.len,
                    words.len()
                )));
            }
            for (offset, word) in (0..chunk.len).zip(words) {
                if self.cache.insert(chunk.start + offset, word) != Some(word) {
                    changed = true;
                }
            }
        }
        debug!(chunks = self.chunks.len(), changed, "registers refreshed");
        Ok(changed)
    }

    fn lookup(&self, name: &str) -> DcsResult<&LogicalRegister> {
        self.registers
            .get(name)
            .ok_or_else(|| DcsError::rejected(format!("unknown register '{}'", name)))
    }

    fn cached(&self, address: u16) -> Option<u16> {
        self.cache.get(&address).copied()
    }

    /// Decode from cache. `Ok(None)` until the register has been read once.
    pub fn read(&self, name: &str) -> DcsResult<Option<RegisterValue>> {
        let register = self.lookup(name)?;
        let value = match register.kind {
            RegisterKind::Int16 => self.cached(register.address).map(RegisterValue::Int),
            RegisterKind::Bool { bit } => self
                .cached(register.address)
                .map(|word| RegisterValue::Bool((word >> bit) & 1 == 1)),
            RegisterKind::Float32 => {
                match (self.cached(register.address), self.cached(register.address + 1)) {
                    (Some(lo), Some(hi)) => Some(RegisterValue::Float(decode_f32([lo, hi]))),
                    _ => None,
                }
            }
        };
        Ok(value)
    }

    pub fn write(&mut self, name: &str, value: f64) -> DcsResult<()> {
        let register = self.lookup(name)?.clone();
        if !register.writable {
            return Err(DcsError::rejected(format!("register '{}' is read-only", name)));
        }
        debug!(register = name, value, "register write");

        match register.kind {
            RegisterKind::Int16 => {
                let word = encode_int(name, value)?;
                self.write_words(register.address, &[word])
            }
            RegisterKind::Float32 => {
                #[allow(clippy::cast_possible_truncation)]
                let words = encode_f32(value as f32);
                self.write_words(register.address, &words)
            }
            RegisterKind::Bool { bit } => {
                // Re-read so bits owned by other writers are not clobbered by a stale cache
                let current = self
                    .bus
                    .read_holding_registers(register.address, 1)
                    .map_err(DcsError::from)?
                    .first()
                    .copied()
                    .ok_or_else(|| DcsError::comm(format!("empty read at {}", register.address)))?;
                let mask = 1u16 << bit;
                let word = if value != 0.0 { current | mask } else { current & !mask };
                self.write_words(register.address, &[word])
            }
        }
    }

    fn write_words(&mut self, start: u16, words: &[u16]) -> DcsResult<()> {
        self.bus.write_registers(start, words)?;
        for (offset, word) in (0u16..).zip(words) {
            self.cache.insert(start + offset, *word);
        }
        Ok(())
    }

    /// Every register that has been read at least once, by name.
    pub fn values(&self) -> Map<String, Value> {
        self.registers
            .keys()
            .filter_map(|name| {
                let value = self.read(name).ok().flatten()?;
                Some((name.clone(), value.to_json()))
            })
            .collect()
    }
}

fn encode_int(name: &str, value: f64) -> DcsResult<u16> {
    if value.fract() != 0.0 || !(-32768.0..=65535.0).contains(&value) {
        return Err(DcsError::rejected(format!(
            "value {} does not fit integer register '{}'",
            value, name
        )));
    }
    #[allow(clippy::cast_possible_truncation)]
    let int = value as i32;
    // Negative values are stored two's-complement
    #[allow(clippy::cast_sign_loss)]
    Ok(if int < 0 { (int + 0x1_0000) as u16 } else { int as u16 })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(addrs: &[u16]) -> BTreeSet<u16> {
        addrs.iter().copied().collect()
    }

    #[test]
    fn test_chunks_contiguous_runs() {
        let chunks = compute_chunks(&set(&[1, 2, 3, 7, 8, 20]), None);
        assert_eq!(
            chunks,
            vec![
                Chunk { start: 1, len: 3 },
                Chunk { start: 7, len: 2 },
                Chunk { start: 20, len: 1 },
            ]
        );
    }

    #[test]
    fn test_chunks_capped() {
        let chunks = compute_chunks(&set(&[0, 1, 2, 3, 4]), Some(2));
        assert_eq!(
            chunks,
            vec![
                Chunk { start: 0, len: 2 },
                Chunk { start: 2, len: 2 },
                Chunk { start: 4, len: 1 },
            ]
        );
    }

    #[test]
    fn test_chunks_empty() {
        assert!(compute_chunks(&BTreeSet::new(), None).is_empty());
    }

    #[test]
    fn test_float_word_order() {
        // 1.0f32 = 0x3F80_0000: low word first
        assert_eq!(encode_f32(1.0), [0x0000, 0x3F80]);
        assert_eq!(decode_f32([0x0000, 0x3F80]), 1.0);
        assert_eq!(decode_f32(encode_f32(-12.5)), -12.5);
    }

    #[test]
    fn test_int_encoding() {
        assert_eq!(encode_int("x", 5.0).unwrap(), 5);
        assert_eq!(encode_int("x", -1.0).unwrap(), 0xFFFF);
        assert_eq!(encode_int("x", 65535.0).unwrap(), 0xFFFF);
        assert!(encode_int("x", 65536.0).is_err());
        assert!(encode_int("x", 1.5).is_err());
    }
}
