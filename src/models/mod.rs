use serde::{Deserialize, Serialize};
use std::fmt;


/// Names one measured quantity of a device, e.g. `1-0:1.8.0*255`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(String);

impl Identifier {
    pub fn new(id: impl Into<String>) -> Self {
        Identifier(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identifier {
    fn from(s: &str) -> Self {
        Identifier(s.to_string())
    }
}

impl From<String> for Identifier {
    fn from(s: String) -> Self {
        Identifier(s)
    }
}

/// Typed payload of a reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ValueKind {
    Numeric { value: f64, unit: Option<String> },
    Text { value: String },
    Bool { value: bool },
}

/// A single observed value, immutable once produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Value {
    #[serde(flatten)]
    kind: ValueKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<String>,
}

impl Value {
    pub fn numeric(value: f64, unit: Option<&str>) -> Self {
        Value {
            kind: ValueKind::Numeric { value, unit: unit.map(|u| u.to_string()) },
            status: None,
        }
    }

    pub fn text(value: impl Into<String>) -> Self {
        Value { kind: ValueKind::Text { value: value.into() }, status: None }
    }

    pub fn boolean(value: bool) -> Self {
        Value { kind: ValueKind::Bool { value }, status: None }
    }

    /// Attach the raw status string the device reported alongside the value
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn kind(&self) -> &ValueKind {
        &self.kind
    }

    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    pub fn as_f64(&self) -> Option<f64> {
        match &self.kind {
            ValueKind::Numeric { value, .. } => Some(*value),
            ValueKind::Bool { value } => Some(if *value { 1.0 } else { 0.0 }),
            ValueKind::Text { value } => value.parse().ok(),
        }
    }

    pub fn unit(&self) -> Option<&str> {
        match &self.kind {
            ValueKind::Numeric { unit, .. } => unit.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ValueKind::Numeric { value, unit: Some(u) } => write!(f, "{} {}", value, u)?,
            ValueKind::Numeric { value, unit: None } => write!(f, "{}", value)?,
            ValueKind::Text { value } => write!(f, "{}", value)?,
            ValueKind::Bool { value } => write!(f, "{}", value)?,
        }
        if let Some(status) = &self.status {
            write!(f, " [{}]", status)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub identifier: Identifier,
    pub value: Value,
}

/// Everything one poll cycle produced, in the order the device sent it.
///
/// Identifiers are unique inside a set: pushing a known identifier again
/// replaces the value but keeps the original position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadingSet {
    readings: Vec<Reading>,
}

impl ReadingSet {
    pub fn new() -> Self {
        ReadingSet { readings: Vec::new() }
    }

    pub fn push(&mut self, identifier: impl Into<Identifier>, value: Value) {
        let identifier = identifier.into();
        match self.readings.iter_mut().find(|r| r.identifier == identifier) {
            Some(existing) => existing.value = value,
            None => self.readings.push(Reading { identifier, value }),
        }
    }

    pub fn get(&self, identifier: &str) -> Option<&Value> {
        self.readings
            .iter()
            .find(|r| r.identifier.as_str() == identifier)
            .map(|r| &r.value)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Reading> {
        self.readings.iter()
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }
}

impl IntoIterator for ReadingSet {
    type Item = Reading;
    type IntoIter = std::vec::IntoIter<Reading>;

    fn into_iter(self) -> Self::IntoIter {
        self.readings.into_iter()
    }
}

impl<'a> IntoIterator for &'a ReadingSet {
    type Item = &'a Reading;
    type IntoIter = std::slice::Iter<'a, Reading>;

    fn into_iter(self) -> Self::IntoIter {
        self.readings.iter()
    }
}

impl<I: Into<Identifier>> FromIterator<(I, Value)> for ReadingSet {
    fn from_iter<T: IntoIterator<Item = (I, Value)>>(iter: T) -> Self {
        let mut set = ReadingSet::new();
        for (id, value) in iter {
            set.push(id, value);
        }
        set
    }
}

/// One cache entry that differs from what was stored before the merge
#[derive(Debug, Clone, PartialEq)]
pub struct ChangedEntry {
    pub identifier: Identifier,
    pub value: Value,
    /// `None` when the identifier was seen for the first time
    pub previous: Option<Value>,
}

/// Transport state of a device link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Retries are exhausted, the link will not reconnect on its own
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "DISCONNECTED"),
            ConnectionState::Connecting => write!(f, "CONNECTING"),
            ConnectionState::Connected => write!(f, "CONNECTED"),
            ConnectionState::Failed => write!(f, "FAILED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceProtocol {
    Iec62056,
    Sml,
    Modbus,
}

impl DeviceProtocol {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "iec62056" | "iec 62056-21" | "dsmr" => Some(DeviceProtocol::Iec62056),
            "sml" => Some(DeviceProtocol::Sml),
            "modbus" | "modbus tcp" => Some(DeviceProtocol::Modbus),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceProtocol::Iec62056 => write!(f, "IEC 62056-21"),
            DeviceProtocol::Sml => write!(f, "SML"),
            DeviceProtocol::Modbus => write!(f, "Modbus TCP"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reading_set_keeps_identifiers_unique() {
        let mut set = ReadingSet::new();
        set.push("1-0:1.8.0*255", Value::numeric(1.0, Some("kWh")));
        set.push("1-0:2.8.0*255", Value::numeric(2.0, Some("kWh")));
        set.push("1-0:1.8.0*255", Value::numeric(3.0, Some("kWh")));

        assert_eq!(set.len(), 2);
        let ids: Vec<&str> = set.iter().map(|r| r.identifier.as_str()).collect();
        assert_eq!(ids, vec!["1-0:1.8.0*255", "1-0:2.8.0*255"]);
        assert_eq!(set.get("1-0:1.8.0*255").and_then(|v| v.as_f64()), Some(3.0));
    }

    #[test]
    fn test_value_equality_includes_status() {
        let plain = Value::numeric(5.0, Some("W"));
        let flagged = Value::numeric(5.0, Some("W")).with_status("0x182");
        assert_ne!(plain, flagged);
        assert_eq!(flagged.status(), Some("0x182"));
        assert_eq!(plain.unit(), Some("W"));
    }

    #[test]
    fn test_value_display() {
        assert_eq!(Value::numeric(1234.5, Some("kWh")).to_string(), "1234.5 kWh");
        assert_eq!(Value::boolean(true).to_string(), "true");
        assert_eq!(Value::text("abc").with_status("1").to_string(), "abc [1]");
    }

    #[test]
    fn test_value_serializes_flat() {
        let json = serde_json::to_value(Value::numeric(230.1, Some("V"))).unwrap();
        assert_eq!(json["type"], "numeric");
        assert_eq!(json["value"], 230.1);
        assert_eq!(json["unit"], "V");
        assert!(json.get("status").is_none());
    }

    #[test]
    fn test_protocol_from_str() {
        assert_eq!(DeviceProtocol::from_str("DSMR"), Some(DeviceProtocol::Iec62056));
        assert_eq!(DeviceProtocol::from_str("sml"), Some(DeviceProtocol::Sml));
        assert_eq!(DeviceProtocol::from_str("modbus"), Some(DeviceProtocol::Modbus));
        assert_eq!(DeviceProtocol::from_str("zigbee"), None);
    }
}
