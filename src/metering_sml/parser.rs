use log::{debug, warn};

use super::structs::*;
use crate::connector::framing::{find_sml_end, SML_END_MARKER, SML_ESCAPE, SML_VERSION_1};
use crate::parser::ParseError;

// SML Message Type constants
pub const SML_OPEN_RESPONSE: u32 = 0x0101;
pub const SML_CLOSE_RESPONSE: u32 = 0x0201;
pub const SML_GET_LIST_RESPONSE: u32 = 0x0701;

// TL type nibbles
const TYPE_OCTETS: u8 = 0;
const TYPE_BOOL: u8 = 4;
const TYPE_INT: u8 = 5;
const TYPE_UNSIGNED: u8 = 6;
const TYPE_LIST: u8 = 7;

const MAX_DEPTH: usize = 16;
const MAX_TL_BYTES: usize = 4;

fn malformed(msg: impl Into<String>) -> ParseError {
    ParseError::Malformed(msg.into())
}

/// Checks the transport frame (CRC, padding) and returns the message bytes
/// with escape sequences undone.
pub fn unwrap_transport(frame: &[u8]) -> Result<Vec<u8>, ParseError> {
    let start = frame
        .windows(8)
        .position(|w| w[..4] == SML_ESCAPE && w[4..] == SML_VERSION_1)
        .ok_or_else(|| malformed("missing SML start sequence"))?;
    let end = find_sml_end(frame, start + 8).ok_or_else(|| malformed("missing SML end sequence"))?;

    if frame.len() < end + 8 {
        return Err(malformed("SML frame truncated after end sequence"));
    }
    debug_assert_eq!(frame[end + 4], SML_END_MARKER);

    let padding = frame[end + 5] as usize;
    let expected = u16::from_le_bytes([frame[end + 6], frame[end + 7]]);
    let calculated = crc16::State::<crc16::X_25>::calculate(&frame[start..end + 6]);
    if expected != calculated {
        return Err(malformed(format!(
            "SML checksum mismatch: frame says {:04x}, calculated {:04x}",
            expected, calculated
        )));
    }

    let mut payload = unescape(&frame[start + 8..end])?;
    if padding > 3 || padding > payload.len() {
        return Err(malformed(format!("invalid SML padding count {}", padding)));
    }
    payload.truncate(payload.len() - padding);
    Ok(payload)
}

fn unescape(data: &[u8]) -> Result<Vec<u8>, ParseError> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data.len() >= i + 4 && data[i..i + 4] == SML_ESCAPE {
            if data.len() >= i + 8 && data[i + 4..i + 8] == SML_ESCAPE {
                out.extend_from_slice(&SML_ESCAPE);
                i += 8;
                continue;
            }
            return Err(malformed(format!("unexpected SML escape sequence at {}", i)));
        }
        out.push(data[i]);
        i += 1;
    }
    Ok(out)
}

/// Reads SML type-length-value elements into a generic tree
pub struct TlvReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> TlvReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn next_byte(&mut self) -> Result<u8, ParseError> {
        let byte = *self
            .data
            .get(self.pos)
            .ok_or_else(|| malformed("unexpected end of SML data"))?;
        self.pos += 1;
        Ok(byte)
    }

    /// Returns the type nibble, the length field and the number of TL bytes
    fn parse_type_length(&mut self) -> Result<(u8, usize, usize), ParseError> {
        let first = self.next_byte()?;
        let type_field = (first >> 4) & 0x07;
        let mut length = (first & 0x0F) as usize;
        let mut tl_bytes = 1;
        let mut more = first & 0x80 != 0;

        while more {
            if tl_bytes == MAX_TL_BYTES {
                return Err(malformed("SML length field too long"));
            }
            let next = self.next_byte()?;
            if next & 0x70 != 0 {
                return Err(malformed(format!("bad SML length continuation {:02x}", next)));
            }
            length = (length << 4) | (next & 0x0F) as usize;
            tl_bytes += 1;
            more = next & 0x80 != 0;
        }

        Ok((type_field, length, tl_bytes))
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ParseError> {
        if self.pos + len > self.data.len() {
            return Err(malformed("SML value extends beyond data"));
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    pub fn read_node(&mut self) -> Result<SmlNode, ParseError> {
        self.read_node_at(0)
    }

    fn read_node_at(&mut self, depth: usize) -> Result<SmlNode, ParseError> {
        if depth > MAX_DEPTH {
            return Err(malformed("SML nesting too deep"));
        }
        if self.data.get(self.pos) == Some(&0x00) {
            self.pos += 1;
            return Ok(SmlNode::EndOfMessage);
        }

        let (type_field, length, tl_bytes) = self.parse_type_length()?;

        if type_field == TYPE_LIST {
            let mut items = Vec::with_capacity(length.min(64));
            for _ in 0..length {
                items.push(self.read_node_at(depth + 1)?);
            }
            return Ok(SmlNode::List(items));
        }

        // For scalar types the length counts the TL bytes too
        let payload_len = length
            .checked_sub(tl_bytes)
            .ok_or_else(|| malformed(format!("SML length {} shorter than its header", length)))?;
        let payload = self.take(payload_len)?;

        match type_field {
            TYPE_OCTETS if payload.is_empty() => Ok(SmlNode::Absent),
            TYPE_OCTETS => Ok(SmlNode::Octets(payload.to_vec())),
            TYPE_BOOL if payload.len() == 1 => Ok(SmlNode::Bool(payload[0] != 0)),
            TYPE_INT if (1..=8).contains(&payload.len()) => {
                let mut value: i64 = if payload[0] & 0x80 != 0 { -1 } else { 0 };
                for b in payload {
                    value = (value << 8) | *b as i64;
                }
                Ok(SmlNode::Int(value))
            }
            TYPE_UNSIGNED if (1..=8).contains(&payload.len()) => {
                let value = payload.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64);
                Ok(SmlNode::Unsigned(value))
            }
            _ => Err(malformed(format!(
                "unsupported SML type {} with {} bytes at {}",
                type_field,
                payload.len(),
                self.pos
            ))),
        }
    }
}

pub fn parse_sml_file(payload: &[u8]) -> Result<SmlFile, ParseError> {
    let mut reader = TlvReader::new(payload);
    let mut messages = Vec::new();

    while !reader.at_end() {
        let node = reader.read_node()?;
        match node {
            SmlNode::List(items) => messages.push(parse_sml_message(items)?),
            // leftover fill bytes between messages
            SmlNode::EndOfMessage => continue,
            other => {
                return Err(malformed(format!(
                    "expected SML message at {}, found {:?}",
                    reader.position(),
                    other
                )))
            }
        }
    }

    if messages.is_empty() {
        return Err(malformed("no SML messages found"));
    }
    Ok(SmlFile { messages })
}

fn parse_sml_message(items: Vec<SmlNode>) -> Result<SmlMessage, ParseError> {
    if items.len() < 5 {
        return Err(malformed(format!("SML message with {} elements", items.len())));
    }
    let mut items = items.into_iter();
    let transaction_id = match items.next() {
        Some(SmlNode::Octets(id)) => id,
        _ => Vec::new(),
    };
    let group_no = items.next().and_then(|n| n.as_u64()).unwrap_or(0) as u8;
    let abort_on_error = items.next().and_then(|n| n.as_u64()).unwrap_or(0) as u8;

    let mut body = match items.next() {
        Some(SmlNode::List(body)) if body.len() == 2 => body,
        _ => return Err(malformed("SML message body is not a choice")),
    };
    let content = body.pop().unwrap_or(SmlNode::Absent);
    let message_type = body
        .pop()
        .and_then(|tag| tag.as_u64())
        .ok_or_else(|| malformed("SML message body without tag"))? as u32;

    debug!("SML message type 0x{:04x}", message_type);

    Ok(SmlMessage {
        transaction_id,
        group_no,
        abort_on_error,
        message_type,
        body: content,
    })
}

/// Value list of a GetListResponse body
pub fn get_list_entries(body: &SmlNode) -> Result<Vec<&SmlNode>, ParseError> {
    let fields = body
        .as_list()
        .ok_or_else(|| malformed("GetListResponse body is not a list"))?;
    if fields.len() != 7 {
        return Err(malformed(format!("GetListResponse with {} fields", fields.len())));
    }
    if let Some(server_id) = fields[1].as_octets() {
        debug!(
            "GetListResponse from server {} ({})",
            hex::encode(server_id),
            super::utils::identify_manufacturer_from_server_id(server_id)
        );
    }
    match &fields[4] {
        SmlNode::List(entries) => Ok(entries.iter().collect()),
        _ => {
            warn!("GetListResponse without value list");
            Ok(Vec::new())
        }
    }
}

pub fn parse_list_entry(node: &SmlNode) -> Result<SmlListEntry, ParseError> {
    let fields = match node.as_list() {
        Some(fields) if fields.len() == 7 => fields,
        _ => return Err(ParseError::Unsupported("SML list entry is not a 7 element list".to_string())),
    };

    let obis_code = fields[0].as_octets().and_then(crate::obis_utils::ObisCode::from_bytes);
    let status = fields[1].as_u64();
    let unit = fields[3].as_u64().and_then(|u| u8::try_from(u).ok());
    let scaler = fields[4].as_i64().and_then(|s| i8::try_from(s).ok());

    Ok(SmlListEntry {
        obis_code,
        status,
        unit,
        scaler,
        value: fields[5].clone(),
    })
}
