use std::fmt::Debug;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::service::ByteOrder;
use crate::AppError::{MalformedHeader, PayloadTooLarge};
use crate::AppResult;

/// Decoded fixed-size header of one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    pub msg_id: u32,
    pub data_len: u32,
}

/// Framing contract between the raw byte stream and discrete messages.
///
/// Implementations are shared by every connection of a service and must not
/// keep per-stream state.
pub trait PacketCodec: Send + Sync + Debug {
    /// Number of bytes the read path pulls before calling `decode_header`.
    fn head_len(&self) -> usize;

    fn decode_header(&self, head: &[u8]) -> AppResult<MsgHeader>;

    /// Produces header and payload as one contiguous buffer.
    fn encode(&self, msg_id: u32, data: &[u8]) -> AppResult<Bytes>;
}

/// Default codec: `[data_len: u32][msg_id: u32][data]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DataPack {
    byte_order: ByteOrder,
    /// 0 means no limit
    max_packet_size: u32,
}

impl DataPack {
    pub const HEAD_LEN: usize = 8;

    pub fn new(byte_order: ByteOrder, max_packet_size: u32) -> Self {
        DataPack {
            byte_order,
            max_packet_size,
        }
    }

    pub fn max_packet_size(&self) -> u32 {
        self.max_packet_size
    }

    fn exceeds_limit(&self, len: usize) -> bool {
        self.max_packet_size > 0 && len > self.max_packet_size as usize
    }
}

impl PacketCodec for DataPack {
    fn head_len(&self) -> usize {
        Self::HEAD_LEN
    }

    fn decode_header(&self, mut head: &[u8]) -> AppResult<MsgHeader> {
        if head.remaining() < Self::HEAD_LEN {
            return Err(MalformedHeader(format!(
                "header needs {} bytes, got {}",
                Self::HEAD_LEN,
                head.remaining()
            )));
        }
        let (data_len, msg_id) = match self.byte_order {
            ByteOrder::Little => (head.get_u32_le(), head.get_u32_le()),
            ByteOrder::Big => (head.get_u32(), head.get_u32()),
        };
        if self.exceeds_limit(data_len as usize) {
            return Err(MalformedHeader(format!(
                "data length {} exceeds max packet size {}",
                data_len, self.max_packet_size
            )));
        }
        Ok(MsgHeader { msg_id, data_len })
    }

    fn encode(&self, msg_id: u32, data: &[u8]) -> AppResult<Bytes> {
        if self.exceeds_limit(data.len()) {
            return Err(PayloadTooLarge {
                size: data.len(),
                max: self.max_packet_size,
            });
        }
        let data_len = u32::try_from(data.len()).map_err(|_| PayloadTooLarge {
            size: data.len(),
            max: u32::MAX,
        })?;

        let mut buf = BytesMut::with_capacity(Self::HEAD_LEN + data.len());
        match self.byte_order {
            ByteOrder::Little => {
                buf.put_u32_le(data_len);
                buf.put_u32_le(msg_id);
            }
            ByteOrder::Big => {
                buf.put_u32(data_len);
                buf.put_u32(msg_id);
            }
        }
        buf.put_slice(data);
        Ok(buf.freeze())
    }
}
