use log::{debug, warn};
use std::collections::HashSet;
use std::sync::Arc;

use crate::config::{ConfigError, RegisterConfig, RegisterFormat, RegisterKind};
use crate::models::{ReadingSet, Value};
use crate::parser::{FrameParser, ParseError};

/// Most registers a single read request may ask for
pub const MAX_BLOCK_REGISTERS: u16 = 125;
/// Unused registers a block may span to save a request
pub const MAX_BLOCK_GAP: u16 = 8;

/// One read request, its words land at `offset` in the register image
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterBlock {
    pub kind: RegisterKind,
    pub start: u16,
    pub count: u16,
    pub offset: usize,
}

/// Configured registers of a device and the requests that cover them.
/// The register image is the concatenation of all block responses.
#[derive(Debug, Clone)]
pub struct RegisterMap {
    registers: Vec<RegisterConfig>,
    blocks: Vec<RegisterBlock>,
    words: usize,
}

impl RegisterMap {
    pub fn new(registers: &[RegisterConfig]) -> Result<Self, ConfigError> {
        if registers.is_empty() {
            return Err(ConfigError::Missing("registers"));
        }

        let mut names = HashSet::new();
        for reg in registers {
            if !names.insert(reg.name.as_str()) {
                return Err(ConfigError::Invalid { key: "registers".to_string(), value: format!("duplicate name {}", reg.name) });
            }
            if reg.register as u32 + reg.format.words() as u32 > u16::MAX as u32 + 1 {
                return Err(ConfigError::Invalid { key: reg.name.clone(), value: reg.register.to_string() });
            }
        }

        let mut blocks = Vec::new();
        let mut words = 0usize;
        for kind in [RegisterKind::Holding, RegisterKind::Input] {
            let mut of_kind: Vec<&RegisterConfig> = registers.iter().filter(|r| r.input_type == kind).collect();
            of_kind.sort_by_key(|r| r.register);

            let mut current: Option<(u32, u32)> = None;
            for reg in of_kind {
                let reg_start = reg.register as u32;
                let reg_end = reg_start + reg.format.words() as u32;
                current = match current {
                    Some((start, end))
                        if reg_start <= end + MAX_BLOCK_GAP as u32
                            && reg_end.max(end) - start <= MAX_BLOCK_REGISTERS as u32 =>
                    {
                        Some((start, reg_end.max(end)))
                    }
                    Some((start, end)) => {
                        words += push_block(&mut blocks, kind.clone(), start, end, words);
                        Some((reg_start, reg_end))
                    }
                    None => Some((reg_start, reg_end)),
                };
            }
            if let Some((start, end)) = current {
                words += push_block(&mut blocks, kind.clone(), start, end, words);
            }
        }

        debug!("Planned {} register blocks covering {} words", blocks.len(), words);
        Ok(RegisterMap { registers: registers.to_vec(), blocks, words })
    }

    pub fn blocks(&self) -> &[RegisterBlock] {
        &self.blocks
    }

    pub fn registers(&self) -> &[RegisterConfig] {
        &self.registers
    }

    /// Size of the register image in 16 bit words
    pub fn image_words(&self) -> usize {
        self.words
    }

    fn image_offset(&self, reg: &RegisterConfig) -> Option<usize> {
        let words = reg.format.words();
        self.blocks
            .iter()
            .find(|b| {
                b.kind == reg.input_type
                    && b.start <= reg.register
                    && reg.register as u32 + words as u32 <= b.start as u32 + b.count as u32
            })
            .map(|b| b.offset + (reg.register - b.start) as usize)
    }
}

fn push_block(blocks: &mut Vec<RegisterBlock>, kind: RegisterKind, start: u32, end: u32, offset: usize) -> usize {
    let count = (end - start) as u16;
    blocks.push(RegisterBlock { kind, start: start as u16, count, offset });
    count as usize
}

/// Decodes a register image into the configured readings
pub struct RegisterParser {
    map: Arc<RegisterMap>,
}

impl RegisterParser {
    pub fn new(map: Arc<RegisterMap>) -> Self {
        RegisterParser { map }
    }
}

fn decode(format: RegisterFormat, w: &[u16]) -> f64 {
    match format {
        RegisterFormat::U16 => w[0] as f64,
        RegisterFormat::I16 => w[0] as i16 as f64,
        RegisterFormat::U32 => (u32::from(w[0]) << 16 | u32::from(w[1])) as f64,
        RegisterFormat::I32 => (u32::from(w[0]) << 16 | u32::from(w[1])) as i32 as f64,
        RegisterFormat::F32 => f32::from_bits(u32::from(w[0]) << 16 | u32::from(w[1])) as f64,
    }
}

impl FrameParser for RegisterParser {
    fn parse(&self, frame: &[u8]) -> Result<ReadingSet, ParseError> {
        if frame.len() % 2 != 0 {
            return Err(ParseError::Malformed(format!("register image of odd length {}", frame.len())));
        }
        let image: Vec<u16> = frame.chunks_exact(2).map(|c| u16::from_be_bytes([c[0], c[1]])).collect();

        let mut readings = ReadingSet::new();
        for reg in self.map.registers() {
            let words = reg.format.words() as usize;
            let offset = match self.map.image_offset(reg) {
                Some(offset) if offset + words <= image.len() => offset,
                _ => {
                    let e = ParseError::Unsupported(format!("register {} ({}) is not in the image", reg.name, reg.register));
                    warn!("Skipping register: {}", e);
                    continue;
                }
            };

            let raw = decode(reg.format, &image[offset..offset + words]);
            readings.push(reg.name.as_str(), Value::numeric(raw * reg.scaler, reg.unit.as_deref()));
        }
        Ok(readings)
    }
}
