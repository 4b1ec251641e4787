use super::structs::DeviceIdentification;
use crate::parser::ParseError;
use log::debug;

pub fn parse_identification_line(line: &str) -> Result<DeviceIdentification, ParseError> {
    // Example formats:
    // /ELS5\@V5.3
    // /ISK5MT382-1000
    // /EBZ5DD3BL10-112

    let content = line
        .strip_prefix('/')
        .ok_or_else(|| ParseError::Malformed("missing identification line".to_string()))?
        .trim_end();

    if content.len() < 4 || !content.is_char_boundary(3) {
        return Err(ParseError::Malformed(format!("identification line too short: '{}'", line)));
    }

    let manufacturer = content[..3].to_string();
    let identification = content[3..].to_string();
    let mode = determine_protocol_mode(&identification);

    debug!("Parsed identification - Manufacturer: {}, ID: {}, Mode: {}",
           manufacturer, identification, mode);

    Ok(DeviceIdentification {
        manufacturer,
        identification,
        mode,
    })
}

fn determine_protocol_mode(identification: &str) -> String {
    // The baud rate character right after the manufacturer tells the mode
    match identification.chars().next() {
        Some('A'..='I') => "B".to_string(),
        Some('0'..='9') if identification.contains('@') => "E".to_string(),
        Some('0'..='9') => "C".to_string(),
        _ => "A".to_string(),
    }
}

/// CRC16/ARC as used by DSMR over `/` up to and including `!`
pub fn calculate_checksum(data: &[u8]) -> u16 {
    crc16::State::<crc16::ARC>::calculate(data)
}

pub fn parse_checksum_field(field: &str) -> Result<Option<u16>, ParseError> {
    let field = field.trim();
    if field.is_empty() {
        return Ok(None);
    }
    if field.len() != 4 {
        return Err(ParseError::Malformed(format!("bad checksum field '{}'", field)));
    }
    u16::from_str_radix(field, 16)
        .map(Some)
        .map_err(|_| ParseError::Malformed(format!("bad checksum field '{}'", field)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_identification_line() {
        let device_info = parse_identification_line("/ELS5\\@V5.3").unwrap();
        assert_eq!(device_info.manufacturer, "ELS");
        assert_eq!(device_info.identification, "5\\@V5.3");
        assert_eq!(device_info.mode, "E");

        let ebz = parse_identification_line("/EBZ5DD3BL10-112\r").unwrap();
        assert_eq!(ebz.manufacturer, "EBZ");
        assert_eq!(ebz.mode, "C");
    }

    #[test]
    fn test_parse_identification_line_errors() {
        assert!(parse_identification_line("ELS5").is_err());
        assert!(parse_identification_line("/EL").is_err());
    }

    #[test]
    fn test_checksum_known_value() {
        // CRC-16/ARC check value
        assert_eq!(calculate_checksum(b"123456789"), 0xBB3D);
    }

    #[test]
    fn test_parse_checksum_field() {
        assert_eq!(parse_checksum_field("").unwrap(), None);
        assert_eq!(parse_checksum_field("EF2F\r").unwrap(), Some(0xEF2F));
        assert!(parse_checksum_field("XYZ1").is_err());
        assert!(parse_checksum_field("12").is_err());
    }
}
