use log::{debug, warn};

use crate::models::{Identifier, ReadingSet, Value};
use crate::parser::{FrameParser, ParseError};

pub mod parser;
pub mod structs;
pub mod utils;

use parser::*;
use structs::*;

/// Parser for SML 1.04 transport frames as pushed by German smart meters
#[derive(Debug, Default, Clone)]
pub struct SmlParser;

impl SmlParser {
    pub fn new() -> Self {
        SmlParser
    }
}

impl FrameParser for SmlParser {
    fn parse(&self, frame: &[u8]) -> Result<ReadingSet, ParseError> {
        let payload = unwrap_transport(frame)?;
        let file = parse_sml_file(&payload)?;
        debug!("Parsed SML file with {} messages", file.messages.len());

        let mut readings = ReadingSet::new();
        for message in file.messages.iter().filter(|m| m.message_type == SML_GET_LIST_RESPONSE) {
            for node in get_list_entries(&message.body)? {
                match entry_to_reading(node) {
                    Ok((identifier, value)) => readings.push(identifier, value),
                    Err(e) => warn!("Skipping SML entry: {}", e),
                }
            }
        }
        Ok(readings)
    }
}

fn entry_to_reading(node: &SmlNode) -> Result<(Identifier, Value), ParseError> {
    let entry = parse_list_entry(node)?;
    let obis = entry
        .obis_code
        .ok_or_else(|| ParseError::Unsupported("SML entry without 6 byte object name".to_string()))?;

    let value = match &entry.value {
        SmlNode::Unsigned(u) => utils::numeric_value(*u as f64, entry.scaler, entry.unit),
        SmlNode::Int(i) => utils::numeric_value(*i as f64, entry.scaler, entry.unit),
        SmlNode::Bool(b) => Value::boolean(*b),
        SmlNode::Octets(bytes) => utils::octets_value(bytes),
        other => {
            return Err(ParseError::Unsupported(format!("{} has no usable value: {:?}", obis, other)));
        }
    };

    let value = match entry.status {
        Some(status) => value.with_status(utils::format_status(status)),
        None => value,
    };
    Ok((obis.into(), value))
}

#[cfg(test)]
mod tests {
    use super::parser::tests::build;
    use super::*;

    fn meter_frame() -> Vec<u8> {
        let entries = vec![
            build::entry(&[0x81, 0x81, 0xC7, 0x82, 0x03, 0xFF], None, None, None, build::octets(b"EMH")),
            build::entry(&[1, 0, 1, 8, 0, 255], Some(0x1c0104), Some(30), Some(-1), build::unsigned(12345, 4)),
            build::entry(&[1, 0, 16, 7, 0, 255], None, Some(27), Some(0), build::int(-420, 4)),
            build::entry(&[1, 0, 96, 50, 1, 1], None, None, None, build::octets(&[0x0a, 0x01, 0x45, 0x4d, 0x48, 0x00])),
        ];
        let mut payload = build::message(parser::SML_OPEN_RESPONSE, build::list(&[build::absent(), build::absent()]));
        payload.extend(build::message(parser::SML_GET_LIST_RESPONSE, build::get_list_response(&entries)));
        payload.extend(build::message(parser::SML_CLOSE_RESPONSE, build::list(&[build::absent()])));
        build::transport(&payload)
    }

    #[test]
    fn test_parse_meter_frame() {
        let readings = SmlParser.parse(&meter_frame()).unwrap();
        assert_eq!(readings.len(), 4);

        assert_eq!(
            readings.get("1-0:1.8.0*255"),
            Some(&Value::numeric(1234.5, Some("Wh")).with_status("1c0104"))
        );
        assert_eq!(readings.get("1-0:16.7.0*255"), Some(&Value::numeric(-420.0, Some("W"))));
        assert_eq!(readings.get("129-129:199.130.3*255"), Some(&Value::text("EMH")));
        assert_eq!(readings.get("1-0:96.50.1*1"), Some(&Value::text("0a01454d4800")));
    }

    #[test]
    fn test_entry_without_value_is_skipped() {
        let entries = vec![
            build::entry(&[1, 0, 2, 8, 0, 255], None, Some(30), None, build::absent()),
            build::entry(&[1, 0], None, None, None, build::unsigned(1, 1)),
            build::entry(&[1, 0, 1, 8, 0, 255], None, Some(30), None, build::unsigned(7, 1)),
        ];
        // a 2 byte object name still builds a 7 element list
        let payload = build::message(parser::SML_GET_LIST_RESPONSE, build::get_list_response(&entries));
        let readings = SmlParser.parse(&build::transport(&payload)).unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings.get("1-0:1.8.0*255").and_then(|v| v.as_f64()), Some(7.0));
    }

    #[test]
    fn test_corrupted_frame_is_malformed() {
        let mut frame = meter_frame();
        let middle = frame.len() / 2;
        frame[middle] ^= 0x55;
        assert!(matches!(SmlParser.parse(&frame), Err(ParseError::Malformed(_))));
    }

    #[test]
    fn test_frame_without_list_response() {
        let payload = build::message(parser::SML_OPEN_RESPONSE, build::list(&[build::absent()]));
        let readings = SmlParser.parse(&build::transport(&payload)).unwrap();
        assert!(readings.is_empty());
    }
}
