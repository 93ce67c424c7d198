//! [`Encode`]/[`Decode`] implementations for block types.
//!
//! These define the payload bytes a block handler persists to the WAL.
//! Layout:
//!
//! ```text
//! Record  = [body: Vec<u8>][headers: map]
//! BlockId = [receiver_id: u32][time_ms: i64]
//! Block   = [id: BlockId][records: Vec<Record>]
//! ```

use crate::encoding::{self, Decode, Encode, EncodingError};

use super::{Block, BlockId, Record};

impl Encode for Record {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.body.encode_to(buf)?;
        encoding::encode_map(&self.headers, buf)?;
        Ok(())
    }
}

impl Decode for Record {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (body, n) = Vec::<u8>::decode_from(&buf[offset..])?;
        offset += n;
        let (headers, n) = encoding::decode_map(&buf[offset..])?;
        offset += n;
        Ok((Self { body, headers }, offset))
    }
}

impl Encode for BlockId {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.receiver_id.encode_to(buf)?;
        self.time_ms.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for BlockId {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (receiver_id, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (time_ms, n) = i64::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                receiver_id,
                time_ms,
            },
            offset,
        ))
    }
}

impl Encode for Block {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.id.encode_to(buf)?;
        encoding::encode_vec(&self.records, buf)?;
        Ok(())
    }
}

impl Decode for Block {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (id, n) = BlockId::decode_from(&buf[offset..])?;
        offset += n;
        let (records, n) = encoding::decode_vec::<Record>(&buf[offset..])?;
        offset += n;
        Ok((Self { id, records }, offset))
    }
}
