use lazy_static::lazy_static;
use log::debug;
use regex::Regex;

use crate::models::{Identifier, Value};
use crate::obis_utils::ObisCode;
use crate::parser::ParseError;

lazy_static! {
    static ref OBIS_LINE: Regex = Regex::new(
        r"^(\d{1,3})-(\d{1,3}):(\d{1,3})\.(\d{1,3})\.(\d{1,3})(?:\*(\d{1,3}))?((?:\([^()]*\))+)\s*$"
    ).unwrap();
    static ref NUMERIC_VALUE: Regex = Regex::new(r"^([-+]?\d+(?:\.\d+)?)(?:\*(.+))?$").unwrap();
}

pub fn parse_obis_line(line: &str) -> Result<(Identifier, Value), ParseError> {
    // Example formats:
    // 1-0:1.8.1(000123.456*kWh)
    // 1-0:15.7.0(001.234*kW)
    // 0-0:1.0.0(210101120000W)
    // 0-1:24.2.1(101209112500W)(12785.123*m3)

    let line = line.trim();
    let caps = OBIS_LINE
        .captures(line)
        .ok_or_else(|| ParseError::Unsupported(format!("not an OBIS data line: '{}'", line)))?;

    let group = |i: usize| -> Result<u8, ParseError> {
        caps.get(i)
            .map_or("", |m| m.as_str())
            .parse::<u8>()
            .map_err(|_| ParseError::Unsupported(format!("OBIS value group out of range: '{}'", line)))
    };

    let mut code = ObisCode::new(group(1)?, group(2)?, group(3)?, group(4)?, group(5)?);
    if caps.get(6).is_some() {
        code.storage = group(6)?;
    }

    // Only the last parenthesised group carries the value
    let groups = caps.get(7).map_or("", |m| m.as_str());
    let raw = groups
        .rsplit('(')
        .next()
        .unwrap_or("")
        .trim_end_matches(')');

    let value = parse_value(raw);
    debug!("Parsed OBIS line - Code: {}, Value: {}", code, value);

    Ok((code.into(), value))
}

pub fn parse_value(raw: &str) -> Value {
    if let Some(caps) = NUMERIC_VALUE.captures(raw) {
        if let Ok(number) = caps[1].parse::<f64>() {
            return Value::numeric(number, caps.get(2).map(|u| u.as_str().trim()));
        }
    }
    Value::text(raw)
}
