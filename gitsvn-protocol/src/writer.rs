//! Buffered item writer.
//!
//! Responses are staged into an in-memory buffer and pushed to the socket
//! in one `flush`, so a cancelled handler can never leave a partial frame
//! on the wire.

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::WireError;
use crate::item::{encode_decimal, Item};

pub struct ItemWriter<W> {
    inner: W,
    buf: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> ItemWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(4096),
        }
    }

    pub fn list_begin(&mut self) -> &mut Self {
        self.buf.extend_from_slice(b"( ");
        self
    }

    pub fn list_end(&mut self) -> &mut Self {
        self.buf.extend_from_slice(b") ");
        self
    }

    pub fn word(&mut self, w: &str) -> &mut Self {
        self.buf.extend_from_slice(w.as_bytes());
        self.buf.push(b' ');
        self
    }

    pub fn number(&mut self, n: u64) -> &mut Self {
        encode_decimal(n, &mut self.buf);
        self.buf.push(b' ');
        self
    }

    pub fn bool(&mut self, b: bool) -> &mut Self {
        self.word(if b { "true" } else { "false" })
    }

    pub fn string(&mut self, bytes: &[u8]) -> &mut Self {
        encode_decimal(bytes.len() as u64, &mut self.buf);
        self.buf.push(b':');
        self.buf.extend_from_slice(bytes);
        self.buf.push(b' ');
        self
    }

    pub fn str(&mut self, s: &str) -> &mut Self {
        self.string(s.as_bytes())
    }

    pub fn item(&mut self, item: &Item) -> &mut Self {
        item.encode(&mut self.buf);
        self
    }

    /// Buffered bytes not yet flushed. Used by streaming handlers to cap
    /// batch sizes.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub async fn flush(&mut self) -> Result<(), WireError> {
        if !self.buf.is_empty() {
            self.inner.write_all(&self.buf).await?;
            self.buf.clear();
        }
        self.inner.flush().await?;
        Ok(())
    }

    /// Writes one complete item and flushes it.
    pub async fn send(&mut self, item: &Item) -> Result<(), WireError> {
        self.item(item);
        self.flush().await
    }

    /// `( success ( params... ) )`
    pub async fn send_success(&mut self, params: Vec<Item>) -> Result<(), WireError> {
        self.send(&Item::List(vec![
            Item::word("success"),
            Item::List(params),
        ]))
        .await
    }

    /// `( failure ( ( code msg file line ) ) )`
    pub async fn send_failure(&mut self, code: u64, msg: &str) -> Result<(), WireError> {
        self.send(&Item::List(vec![
            Item::word("failure"),
            Item::List(vec![Item::List(vec![
                Item::Number(code),
                Item::str(msg),
                Item::str(""),
                Item::Number(0),
            ])]),
        ]))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn builder_primitives_match_item_encoding() {
        let mut out = Vec::new();
        {
            let mut w = ItemWriter::new(&mut out);
            w.list_begin()
                .word("success")
                .list_begin()
                .number(12)
                .str("hello")
                .list_end()
                .list_end();
            w.flush().await.unwrap();
        }
        let item = Item::List(vec![
            Item::word("success"),
            Item::List(vec![Item::Number(12), Item::str("hello")]),
        ]);
        assert_eq!(out, item.to_bytes());
    }

    #[tokio::test]
    async fn failure_frame_shape() {
        let mut out = Vec::new();
        {
            let mut w = ItemWriter::new(&mut out);
            w.send_failure(160013, "not found").await.unwrap();
        }
        assert_eq!(
            out,
            b"( failure ( ( 160013 9:not found 0: 0 ) ) ) ".to_vec()
        );
    }

    #[tokio::test]
    async fn nothing_on_wire_before_flush() {
        let mut out = Vec::new();
        let mut w = ItemWriter::new(&mut out);
        w.list_begin().word("partial");
        assert!(w.pending() > 0);
        drop(w);
        assert!(out.is_empty());
    }
}
