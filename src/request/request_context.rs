use bytes::Bytes;

use crate::network::{Connection, Message};

/// One decoded message together with the connection it arrived on.
///
/// Built by the connection reader and consumed exactly once by a worker or an
/// inline handler task. Cloning is cheap and shares the connection handle.
#[derive(Debug, Clone)]
pub struct Request {
    conn: Connection,
    msg: Message,
}

impl Request {
    pub fn new(conn: Connection, msg: Message) -> Self {
        Request { conn, msg }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn message(&self) -> &Message {
        &self.msg
    }

    pub fn msg_id(&self) -> u32 {
        self.msg.msg_id()
    }

    pub fn data(&self) -> &Bytes {
        self.msg.data()
    }
}
