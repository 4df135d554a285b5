use bytes::Bytes;

/// One decoded application unit. The payload is opaque to the framework.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    msg_id: u32,
    data: Bytes,
}

impl Message {
    pub fn new(msg_id: u32, data: impl Into<Bytes>) -> Self {
        Message {
            msg_id,
            data: data.into(),
        }
    }

    pub fn msg_id(&self) -> u32 {
        self.msg_id
    }

    pub fn data_len(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }
}
