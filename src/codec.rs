//! Wire encoding of overlay messages.

use bytes::Bytes;

use crate::common::Message;
use crate::Result;

/// Turns [Message]s into datagrams and back.
pub trait Codec: std::fmt::Debug + Send + Sync {
    fn encode(&self, message: &Message) -> Result<Bytes>;

    fn decode(&self, bytes: &[u8]) -> Result<Message>;
}

#[derive(Debug, Default, Clone, Copy)]
/// Bencoded [WireMessage](crate::WireMessage) dictionaries.
pub struct BencodeCodec;

impl Codec for BencodeCodec {
    fn encode(&self, message: &Message) -> Result<Bytes> {
        Ok(Bytes::from(message.to_bytes()?))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Message> {
        Message::from_bytes(bytes)
    }
}
