use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

/// Wire record exchanged between overlay nodes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireMessage {
    pub id: u32,

    #[serde(rename = "type")]
    pub kind: u32,

    pub source_id: ByteBuf,

    pub destination_id: ByteBuf,

    #[serde(default)]
    pub data: ByteBuf,

    #[serde(default)]
    pub cacheable: u8,

    #[serde(default)]
    pub direct: u8,

    #[serde(default)]
    pub response: u8,

    #[serde(default)]
    pub replication: u16,
}

impl WireMessage {
    pub fn from_bytes(bytes: &[u8]) -> Result<WireMessage, serde_bencode::Error> {
        let obj = serde_bencode::from_bytes(bytes)?;
        Ok(obj)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_bencode::Error> {
        serde_bencode::to_bytes(self)
    }
}
