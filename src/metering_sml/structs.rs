use crate::obis_utils::ObisCode;

/// One decoded SML TLV element
#[derive(Debug, Clone, PartialEq)]
pub enum SmlNode {
    /// `0x01`, an optional field that is not present
    Absent,
    /// `0x00`, closes a message
    EndOfMessage,
    Octets(Vec<u8>),
    Bool(bool),
    Int(i64),
    Unsigned(u64),
    List(Vec<SmlNode>),
}

impl SmlNode {
    pub fn as_list(&self) -> Option<&[SmlNode]> {
        match self {
            SmlNode::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_octets(&self) -> Option<&[u8]> {
        match self {
            SmlNode::Octets(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            SmlNode::Unsigned(u) => Some(*u),
            SmlNode::Int(i) if *i >= 0 => Some(*i as u64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SmlNode::Int(i) => Some(*i),
            SmlNode::Unsigned(u) => i64::try_from(*u).ok(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SmlFile {
    pub messages: Vec<SmlMessage>,
}

#[derive(Debug, Clone)]
pub struct SmlMessage {
    pub transaction_id: Vec<u8>,
    pub group_no: u8,
    pub abort_on_error: u8,
    pub message_type: u32,
    pub body: SmlNode,
}

/// One row of a GetListResponse value list
#[derive(Debug, Clone)]
pub struct SmlListEntry {
    pub obis_code: Option<ObisCode>,
    pub status: Option<u64>,
    pub unit: Option<u8>,
    pub scaler: Option<i8>,
    pub value: SmlNode,
}
