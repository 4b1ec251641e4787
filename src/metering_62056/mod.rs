use log::{debug, warn};
use std::fmt::Write as _;

use crate::models::{Reading, ReadingSet, ValueKind};
use crate::obis_utils::{ObisCode, DEFAULT_STORAGE};
use crate::parser::{FrameParser, ParseError};

pub mod obis_parser;
pub mod structs;
pub mod utils;

pub use structs::{DeviceIdentification, Iec62056Telegram};

/// Parser for IEC 62056-21 mode D / DSMR P1 text telegrams
#[derive(Debug, Default, Clone)]
pub struct Iec62056Parser;

impl Iec62056Parser {
    pub fn new() -> Self {
        Iec62056Parser
    }
}

impl FrameParser for Iec62056Parser {
    fn parse(&self, frame: &[u8]) -> Result<ReadingSet, ParseError> {
        parse_telegram(frame).map(|t| t.readings)
    }
}

pub fn parse_telegram(frame: &[u8]) -> Result<Iec62056Telegram, ParseError> {
    let start = frame
        .iter()
        .position(|b| *b == b'/')
        .ok_or_else(|| ParseError::Malformed("missing identification line".to_string()))?;
    let frame = &frame[start..];

    // The end line is the last one starting with '!'
    let end = frame
        .iter()
        .enumerate()
        .rev()
        .find(|(i, b)| **b == b'!' && (*i == 0 || frame[i - 1] == b'\n'))
        .map(|(i, _)| i)
        .ok_or_else(|| ParseError::Malformed("missing end of telegram".to_string()))?;

    let body = std::str::from_utf8(&frame[..end])
        .map_err(|_| ParseError::Malformed("telegram is not valid text".to_string()))?;
    let tail = String::from_utf8_lossy(&frame[end + 1..]);
    let checksum_field = tail.lines().next().unwrap_or("");

    let checksum = utils::parse_checksum_field(checksum_field)?;
    if let Some(expected) = checksum {
        let calculated = utils::calculate_checksum(&frame[..=end]);
        if calculated != expected {
            return Err(ParseError::Malformed(format!(
                "checksum mismatch: telegram says {:04X}, calculated {:04X}",
                expected, calculated
            )));
        }
    }

    let mut lines = body.lines();
    let identification = utils::parse_identification_line(lines.next().unwrap_or(""))?;
    debug!("Parsed device info: {:?}", identification);

    let mut readings = ReadingSet::new();
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        match obis_parser::parse_obis_line(line) {
            Ok((identifier, value)) => readings.push(identifier, value),
            Err(e) => warn!("Skipping telegram line '{}': {}", line.trim(), e),
        }
    }

    if readings.is_empty() {
        warn!("No valid OBIS data found in telegram");
    }

    Ok(Iec62056Telegram {
        identification,
        readings,
        checksum,
    })
}

/// Writes a DSMR style telegram for `readings`, closed by its CRC.
/// `identification` is the header without the leading `/`.
pub fn encode_telegram(identification: &str, readings: &ReadingSet) -> Result<Vec<u8>, ParseError> {
    if identification.len() < 4 || identification.contains(['\r', '\n']) {
        return Err(ParseError::Malformed(format!("bad identification '{}'", identification)));
    }

    let mut telegram = format!("/{}\r\n\r\n", identification);
    for Reading { identifier, value } in readings {
        let code: ObisCode = identifier
            .as_str()
            .parse()
            .map_err(|e| ParseError::Unsupported(format!("{}", e)))?;
        let rendered = match value.kind() {
            ValueKind::Numeric { value, unit } => {
                if !value.is_finite() {
                    return Err(ParseError::Unsupported(format!("{} has no finite value", identifier)));
                }
                match unit {
                    Some(unit) => format!("{}*{}", value, unit),
                    None => format!("{}", value),
                }
            }
            ValueKind::Text { value } => value.clone(),
            ValueKind::Bool { .. } => {
                return Err(ParseError::Unsupported(format!("{} is a boolean, telegrams carry no booleans", identifier)));
            }
        };
        // whatever is written has to read back as the same value, status included
        if rendered.contains(['(', ')', '\r', '\n']) || obis_parser::parse_value(&rendered) != *value {
            return Err(ParseError::Unsupported(format!("{} cannot be written as '{}'", identifier, rendered)));
        }

        let _ = if code.storage == DEFAULT_STORAGE {
            write!(telegram, "{}({})\r\n", code.short(), rendered)
        } else {
            write!(telegram, "{}({})\r\n", code, rendered)
        };
    }
    telegram.push('!');

    let checksum = utils::calculate_checksum(telegram.as_bytes());
    let _ = write!(telegram, "{:04X}\r\n", checksum);
    Ok(telegram.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Value;

    const TELEGRAM: &str = "/ISK5\\2M550T-1012\r\n\r\n\
        1-3:0.2.8(50)\r\n\
        0-0:1.0.0(200909143019S)\r\n\
        1-0:1.8.1(001581.123*kWh)\r\n\
        1-0:1.8.2(001435.706*kWh)\r\n\
        1-0:1.7.0(00.193*kW)\r\n\
        0-1:24.2.1(200909143005S)(00981.443*m3)\r\n\
        !";

    fn with_crc(body: &str) -> Vec<u8> {
        let crc = utils::calculate_checksum(body.as_bytes());
        format!("{}{:04X}\r\n", body, crc).into_bytes()
    }

    #[test]
    fn test_parse_telegram() {
        let telegram = parse_telegram(&with_crc(TELEGRAM)).unwrap();
        assert_eq!(telegram.identification.manufacturer, "ISK");
        assert!(telegram.checksum.is_some());

        let readings = telegram.readings;
        assert_eq!(readings.len(), 6);
        assert_eq!(readings.get("1-0:1.8.1*255"), Some(&Value::numeric(1581.123, Some("kWh"))));
        assert_eq!(readings.get("1-0:1.7.0*255").and_then(|v| v.as_f64()), Some(0.193));
        assert_eq!(readings.get("0-1:24.2.1*255"), Some(&Value::numeric(981.443, Some("m3"))));
        assert_eq!(readings.get("0-0:1.0.0*255"), Some(&Value::text("200909143019S")));
    }

    #[test]
    fn test_checksum_mismatch_is_malformed() {
        let mut frame = with_crc(TELEGRAM);
        // flip a digit inside the data
        let pos = frame.iter().position(|b| *b == b'5').unwrap();
        frame[pos] = b'6';
        assert!(matches!(Iec62056Parser.parse(&frame), Err(ParseError::Malformed(_))));
    }

    #[test]
    fn test_telegram_without_checksum() {
        let frame = b"/ELS5\\@V5.3\r\n\r\n1-0:1.8.0(000123.456*kWh)\r\n!\r\n";
        let telegram = parse_telegram(frame).unwrap();
        assert_eq!(telegram.checksum, None);
        assert_eq!(telegram.readings.len(), 1);
    }

    #[test]
    fn test_structural_errors() {
        assert!(matches!(Iec62056Parser.parse(b"1-0:1.8.0(1*kWh)\r\n!\r\n"), Err(ParseError::Malformed(_))));
        assert!(matches!(Iec62056Parser.parse(b"/ELS5\r\n1-0:1.8.0(1*kWh)\r\n"), Err(ParseError::Malformed(_))));
        assert!(matches!(Iec62056Parser.parse(b"/ELS5\r\n!ZZZZ\r\n"), Err(ParseError::Malformed(_))));
        assert!(matches!(Iec62056Parser.parse(b""), Err(ParseError::Malformed(_))));
    }

    #[test]
    fn test_unsupported_line_is_skipped() {
        let frame = b"/ELS5\\@V5.3\r\n\r\nF.F(00)\r\n1-0:1.8.0(000123.456*kWh)\r\n!\r\n";
        let readings = Iec62056Parser.parse(frame).unwrap();
        assert_eq!(readings.len(), 1);
        assert!(readings.get("1-0:1.8.0*255").is_some());
    }

    #[test]
    fn test_encode_then_parse() {
        let mut readings = ReadingSet::new();
        readings.push("1-0:1.8.0*255", Value::numeric(1234.5, Some("kWh")));
        readings.push("1-0:2.8.0*96", Value::numeric(-0.25, None));
        readings.push("0-0:96.1.1*255", Value::text("4B38454730"));

        let frame = encode_telegram("EBZ5DD3BL10-112", &readings).unwrap();
        assert!(frame.ends_with(b"\r\n"));

        let telegram = parse_telegram(&frame).unwrap();
        assert!(telegram.checksum.is_some());
        assert_eq!(telegram.readings, readings);
    }

    #[test]
    fn test_encode_rejects_unwritable_entries() {
        let mut readings = ReadingSet::new();
        readings.push("power", Value::numeric(1.0, None));
        assert!(matches!(encode_telegram("EBZ5DD3", &readings), Err(ParseError::Unsupported(_))));

        let mut readings = ReadingSet::new();
        readings.push("0-0:96.13.0*255", Value::text("a (b)"));
        assert!(matches!(encode_telegram("EBZ5DD3", &readings), Err(ParseError::Unsupported(_))));

        assert!(encode_telegram("EB", &ReadingSet::new()).is_err());
    }

    #[test]
    fn test_encode_rejects_values_that_read_back_differently() {
        let cases = [
            Value::text("00123"),
            Value::numeric(1.0, Some("kWh")).with_status("82"),
            Value::boolean(true),
        ];
        for value in cases {
            let mut readings = ReadingSet::new();
            readings.push("0-0:96.1.1*255", value.clone());
            assert!(
                matches!(encode_telegram("EBZ5DD3", &readings), Err(ParseError::Unsupported(_))),
                "{:?} was encoded",
                value
            );
        }
    }
}
