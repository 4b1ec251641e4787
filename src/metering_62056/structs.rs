use crate::models::ReadingSet;

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceIdentification {
    pub manufacturer: String,
    pub identification: String,
    pub mode: String,
}

/// A decoded telegram, header included
#[derive(Debug, Clone, PartialEq)]
pub struct Iec62056Telegram {
    pub identification: DeviceIdentification,
    pub readings: ReadingSet,
    pub checksum: Option<u16>,
}
