use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::models::Identifier;

/// Storage group used when a code leaves out the `*F` part
pub const DEFAULT_STORAGE: u8 = 255;

/// OBIS code in its six value groups A-B:C.D.E*F
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObisCode {
    pub medium: u8,      // 0: abstract, 1: electricity, 7: gas ...
    pub channel: u8,
    pub indicator: u8,   // Physical value
    pub mode: u8,        // Processing method
    pub tariff: u8,
    pub storage: u8,     // Historical value, 255 = current
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("invalid OBIS code '{0}'")]
pub struct InvalidObisCode(pub String);

impl ObisCode {
    pub fn new(medium: u8, channel: u8, indicator: u8, mode: u8, tariff: u8) -> Self {
        ObisCode { medium, channel, indicator, mode, tariff, storage: DEFAULT_STORAGE }
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 6 {
            return None;
        }
        Some(ObisCode {
            medium: bytes[0],
            channel: bytes[1],
            indicator: bytes[2],
            mode: bytes[3],
            tariff: bytes[4],
            storage: bytes[5],
        })
    }

    pub fn to_bytes(&self) -> [u8; 6] {
        [self.medium, self.channel, self.indicator, self.mode, self.tariff, self.storage]
    }

    /// The code without its storage group, as the description tables use it
    pub fn short(&self) -> String {
        format!("{}-{}:{}.{}.{}", self.medium, self.channel, self.indicator, self.mode, self.tariff)
    }

    pub fn description(&self) -> Option<&'static str> {
        get_obis_description(&self.short())
    }
}

impl fmt::Display for ObisCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}*{}", self.short(), self.storage)
    }
}

impl FromStr for ObisCode {
    type Err = InvalidObisCode;

    /// Accepts `A-B:C.D.E` and `A-B:C.D.E*F` (also `A-B:C.D.E.F`)
    fn from_str(code: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidObisCode(code.to_string());
        let code_trimmed = code.trim();

        let (ab, rest) = code_trimmed.split_once(':').ok_or_else(invalid)?;
        let (a, b) = ab.split_once('-').ok_or_else(invalid)?;

        let (cde, f) = match rest.split_once('*') {
            Some((cde, f)) => (cde, Some(f)),
            None => (rest, None),
        };

        let mut groups: Vec<&str> = cde.split('.').collect();
        let f = match (f, groups.len()) {
            (Some(f), 3) => Some(f),
            (None, 4) => groups.pop(),
            (None, 3) => None,
            _ => return Err(invalid()),
        };

        let num = |s: &str| s.parse::<u8>().map_err(|_| invalid());
        Ok(ObisCode {
            medium: num(a)?,
            channel: num(b)?,
            indicator: num(groups[0])?,
            mode: num(groups[1])?,
            tariff: num(groups[2])?,
            storage: match f {
                Some(f) => num(f)?,
                None => DEFAULT_STORAGE,
            },
        })
    }
}

impl From<ObisCode> for Identifier {
    fn from(code: ObisCode) -> Self {
        Identifier::new(code.to_string())
    }
}

pub fn get_obis_description(obis_code: &str) -> Option<&'static str> {
    let descriptions = get_standard_obis_descriptions();
    descriptions.get(obis_code).copied()
}

pub fn get_standard_obis_descriptions() -> HashMap<&'static str, &'static str> {
    let mut map = HashMap::new();

    // Energy values
    map.insert("1-0:1.8.0", "Active energy + (total)");
    map.insert("1-0:1.8.1", "Active energy + (tariff 1)");
    map.insert("1-0:1.8.2", "Active energy + (tariff 2)");
    map.insert("1-0:2.8.0", "Active energy - (total)");
    map.insert("1-0:2.8.1", "Active energy - (tariff 1)");
    map.insert("1-0:2.8.2", "Active energy - (tariff 2)");
    map.insert("1-0:15.8.0", "Absolute active energy total");

    // Power values
    map.insert("1-0:1.7.0", "Active power + (total)");
    map.insert("1-0:2.7.0", "Active power - (total)");
    map.insert("1-0:15.7.0", "Absolute active instantaneous power");
    map.insert("1-0:16.7.0", "Sum active instantaneous power");
    map.insert("1-0:21.7.0", "Active power + (L1)");
    map.insert("1-0:41.7.0", "Active power + (L2)");
    map.insert("1-0:61.7.0", "Active power + (L3)");

    // Voltage and current
    map.insert("1-0:32.7.0", "Voltage (L1)");
    map.insert("1-0:52.7.0", "Voltage (L2)");
    map.insert("1-0:72.7.0", "Voltage (L3)");
    map.insert("1-0:31.7.0", "Current (L1)");
    map.insert("1-0:51.7.0", "Current (L2)");
    map.insert("1-0:71.7.0", "Current (L3)");

    map.insert("1-0:3.8.0", "Reactive energy + (total)");
    map.insert("1-0:4.8.0", "Reactive energy - (total)");
    map.insert("1-0:13.7.0", "Power factor");
    map.insert("1-0:14.7.0", "Supply frequency");

    // Identification and housekeeping
    map.insert("0-0:1.0.0", "Date and time");
    map.insert("0-0:96.1.1", "Equipment identifier");
    map.insert("0-0:96.14.0", "Tariff indicator");
    map.insert("1-0:0.0.0", "Equipment identifier");
    map.insert("1-0:96.1.0", "Server ID");
    map.insert("1-3:0.2.8", "DSMR version");
    map.insert("129-129:199.130.3", "Manufacturer");

    // Gas via M-Bus channel 1
    map.insert("0-1:24.2.1", "Gas delivered");

    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_and_without_storage() {
        let full: ObisCode = "1-0:1.8.0*255".parse().unwrap();
        let short: ObisCode = "1-0:1.8.0".parse().unwrap();
        let dotted: ObisCode = "1-0:1.8.0.255".parse().unwrap();
        assert_eq!(full, short);
        assert_eq!(full, dotted);
        assert_eq!(full.to_string(), "1-0:1.8.0*255");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("invalid".parse::<ObisCode>().is_err());
        assert!("1:2.3.4".parse::<ObisCode>().is_err());
        assert!("1-0:1.8".parse::<ObisCode>().is_err());
        assert!("1-0:1.8.300".parse::<ObisCode>().is_err());
    }

    #[test]
    fn test_bytes_round_trip() {
        let bytes = [0x01, 0x00, 0x10, 0x07, 0x00, 0xFF];
        let code = ObisCode::from_bytes(&bytes).unwrap();
        assert_eq!(code.to_string(), "1-0:16.7.0*255");
        assert_eq!(code.to_bytes(), bytes);
        assert!(ObisCode::from_bytes(&bytes[..5]).is_none());
    }

    #[test]
    fn test_get_obis_description() {
        assert_eq!(get_obis_description("1-0:1.8.1"), Some("Active energy + (tariff 1)"));
        let code: ObisCode = "1-0:15.7.0*255".parse().unwrap();
        assert_eq!(code.description(), Some("Absolute active instantaneous power"));
        assert_eq!(get_obis_description("nonexistent"), None);
    }
}
