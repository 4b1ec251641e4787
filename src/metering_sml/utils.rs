use log::debug;

use crate::models::Value;

/// DLMS unit symbol for an SML unit code (IEC 62056-62)
pub fn get_sml_unit_name(unit_code: u8) -> Option<&'static str> {
    match unit_code {
        1 => Some("a"),
        2 => Some("mo"),
        3 => Some("wk"),
        4 => Some("d"),
        5 => Some("h"),
        6 => Some("min"),
        7 => Some("s"),
        8 => Some("°"),
        9 => Some("°C"),
        10 => Some("currency"),
        11 => Some("m"),
        12 => Some("m/s"),
        13 => Some("m3"),
        14 => Some("m3"),
        15 => Some("m3/h"),
        16 => Some("m3/h"),
        17 => Some("m3/d"),
        18 => Some("m3/d"),
        19 => Some("l"),
        20 => Some("kg"),
        21 => Some("N"),
        22 => Some("Nm"),
        23 => Some("Pa"),
        24 => Some("bar"),
        25 => Some("J"),
        26 => Some("J/h"),
        27 => Some("W"),
        28 => Some("VA"),
        29 => Some("var"),
        30 => Some("Wh"),
        31 => Some("VAh"),
        32 => Some("varh"),
        33 => Some("A"),
        34 => Some("C"),
        35 => Some("V"),
        36 => Some("V/m"),
        37 => Some("F"),
        38 => Some("Ω"),
        39 => Some("Ωm2/m"),
        40 => Some("Wb"),
        41 => Some("T"),
        42 => Some("A/m"),
        43 => Some("H"),
        44 => Some("Hz"),
        45 => Some("1/(Wh)"),
        46 => Some("1/(varh)"),
        47 => Some("1/(VAh)"),
        48 => Some("V2h"),
        49 => Some("A2h"),
        50 => Some("kg/s"),
        51 => Some("S"),
        52 => Some("K"),
        56 => Some("%"),
        57 => Some("Ah"),
        60 => Some("Wh/m3"),
        61 => Some("J/m3"),
        62 => Some("Mol %"),
        63 => Some("g/m3"),
        64 => Some("Pa s"),
        65 => Some("J/kg"),
        70 => Some("dBm"),
        71 => Some("dBµV"),
        72 => Some("dB"),
        _ => None,
    }
}

/// `raw * 10^scaler`, dividing for negative scalers so decimals stay exact
pub fn apply_scaler(raw: f64, scaler: Option<i8>) -> f64 {
    match scaler {
        Some(s) if s < 0 => raw / 10_f64.powi(-(s as i32)),
        Some(s) => raw * 10_f64.powi(s as i32),
        None => raw,
    }
}

pub fn numeric_value(raw: f64, scaler: Option<i8>, unit: Option<u8>) -> Value {
    let unit_name = unit.and_then(|u| {
        let name = get_sml_unit_name(u);
        if name.is_none() {
            debug!("Unknown SML unit code {}", u);
        }
        name
    });
    Value::numeric(apply_scaler(raw, scaler), unit_name)
}

pub fn octets_value(bytes: &[u8]) -> Value {
    // Try to decode as UTF-8 string first
    if let Ok(string) = std::str::from_utf8(bytes) {
        if !string.is_empty() && string.chars().all(|c| c.is_ascii_graphic() || c == ' ') {
            return Value::text(string);
        }
    }
    // Otherwise format as hex
    Value::text(hex::encode(bytes))
}

pub fn format_status(status: u64) -> String {
    format!("{:02x}", status)
}

pub fn identify_manufacturer_from_server_id(server_id: &[u8]) -> &'static str {
    // Server IDs usually carry the FLAG manufacturer code from byte 2 on
    let flag = server_id.get(2..5).unwrap_or(&[]);
    match flag {
        b"EMH" => "EMH",
        b"ISK" => "Iskraemeco",
        b"ESY" => "EasyMeter",
        b"ITF" | b"ITR" => "Itron",
        b"LGZ" => "Landis+Gyr",
        b"DZG" => "DZG",
        b"EBZ" => "eBZ",
        b"HLY" => "Holley",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_names() {
        assert_eq!(get_sml_unit_name(27), Some("W"));
        assert_eq!(get_sml_unit_name(30), Some("Wh"));
        assert_eq!(get_sml_unit_name(33), Some("A"));
        assert_eq!(get_sml_unit_name(35), Some("V"));
        assert_eq!(get_sml_unit_name(44), Some("Hz"));
        assert_eq!(get_sml_unit_name(255), None);
    }

    #[test]
    fn test_apply_scaler() {
        assert_eq!(apply_scaler(12345.0, Some(-2)), 123.45);
        assert_eq!(apply_scaler(12345.0, Some(-1)), 1234.5);
        assert_eq!(apply_scaler(12.0, Some(3)), 12000.0);
        assert_eq!(apply_scaler(7.0, None), 7.0);
    }

    #[test]
    fn test_numeric_value() {
        let value = numeric_value(12345.0, Some(-1), Some(30));
        assert_eq!(value, Value::numeric(1234.5, Some("Wh")));
        assert_eq!(numeric_value(3.0, None, Some(250)), Value::numeric(3.0, None));
    }

    #[test]
    fn test_octets_value() {
        assert_eq!(octets_value(b"EMH"), Value::text("EMH"));
        assert_eq!(octets_value(&[0x0a, 0x01, 0xff]), Value::text("0a01ff"));
    }

    #[test]
    fn test_identify_manufacturer() {
        assert_eq!(identify_manufacturer_from_server_id(b"\x0a\x01EMH\x00\x00\x4a\x1b\x2c"), "EMH");
        assert_eq!(identify_manufacturer_from_server_id(b"\x0a\x01ISK\x00"), "Iskraemeco");
        assert_eq!(identify_manufacturer_from_server_id(&[0x01]), "Unknown");
    }

    #[test]
    fn test_format_status() {
        assert_eq!(format_status(0x1c0104), "1c0104");
        assert_eq!(format_status(0), "00");
    }
}
