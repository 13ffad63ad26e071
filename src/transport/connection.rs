use std::io;

use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::Mutex,
};

use super::{codec::encode_reply, request::Request};
use crate::rpc::envelope::ReplyMessage;

/// Outbound half of the broker link. Writes are serialized so that frames
/// from concurrent callers never interleave.
pub struct Connection<W> {
    out: Mutex<W>,
}

impl<W> Connection<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub async fn send(&self, sender: &str, conn_id: &str, payload: &[u8]) -> io::Result<()> {
        let frame = encode_reply(sender, conn_id, payload);
        let mut out = self.out.lock().await;
        out.write_all(&frame).await?;
        out.flush().await
    }

    pub async fn reply(&self, request: &Request, message: &ReplyMessage) -> io::Result<()> {
        let payload = message.to_bytes()?;
        self.send(&request.sender, &request.conn_id, &payload).await
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}
