//! Incremental item tokenizer over an async byte stream.
//!
//! The reader owns a growable buffer and refills it from the underlying
//! stream as needed. Every token must be terminated by whitespace exactly
//! as the grammar requires; any deviation is a [`WireError::MalformedFrame`]
//! and the connection cannot be reused afterwards.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::WireError;
use crate::item::Item;

const READ_CHUNK: usize = 16 * 1024;

pub struct ItemReader<R> {
    inner: R,
    buf: Vec<u8>,
    pos: usize,
}

impl<R: AsyncRead + Unpin> ItemReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            pos: 0,
        }
    }

    /// Reads the next complete item from the stream.
    pub async fn read_item(&mut self) -> Result<Item, WireError> {
        self.skip_ws().await?;
        if self.peek().await? == b'(' {
            self.read_list().await
        } else {
            self.read_atom().await
        }
    }

    /// Reads an item and requires it to be a list, as every command frame is.
    pub async fn read_frame(&mut self, ctx: &str) -> Result<Vec<Item>, WireError> {
        match self.read_item().await? {
            Item::List(items) => Ok(items),
            other => Err(WireError::malformed(format!(
                "{ctx}: expected list frame, got {}",
                other.kind()
            ))),
        }
    }

    async fn read_list(&mut self) -> Result<Item, WireError> {
        self.consume().await?;
        self.require_ws().await?;

        // Iterative with an explicit stack; client-supplied nesting must
        // not be able to exhaust the call stack.
        let mut stack: Vec<Vec<Item>> = vec![Vec::new()];
        loop {
            self.skip_ws().await?;
            match self.peek().await? {
                b')' => {
                    self.consume().await?;
                    self.require_ws().await?;
                    let done = stack
                        .pop()
                        .ok_or_else(|| WireError::malformed("list stack underflow"))?;
                    let item = Item::List(done);
                    match stack.last_mut() {
                        Some(parent) => parent.push(item),
                        None => return Ok(item),
                    }
                }
                b'(' => {
                    self.consume().await?;
                    self.require_ws().await?;
                    stack.push(Vec::new());
                }
                _ => {
                    let atom = self.read_atom().await?;
                    stack
                        .last_mut()
                        .ok_or_else(|| WireError::malformed("list stack underflow"))?
                        .push(atom);
                }
            }
        }
    }

    async fn read_atom(&mut self) -> Result<Item, WireError> {
        self.skip_ws().await?;
        let ch = self.peek().await?;
        if ch.is_ascii_digit() {
            let n = self.parse_digits().await?;
            if self.peek().await? == b':' {
                self.consume().await?;
                let bytes = self.read_exact(n as usize).await?;
                self.require_ws().await?;
                Ok(Item::String(bytes))
            } else {
                self.require_ws().await?;
                Ok(Item::Number(n))
            }
        } else {
            let word = self.parse_word().await?;
            self.require_ws().await?;
            Ok(Item::Word(word))
        }
    }

    async fn parse_digits(&mut self) -> Result<u64, WireError> {
        let mut value: u64 = 0;
        loop {
            let ch = self.peek().await?;
            if !ch.is_ascii_digit() {
                return Ok(value);
            }
            self.consume().await?;
            value = value
                .checked_mul(10)
                .and_then(|v| v.checked_add((ch - b'0') as u64))
                .ok_or_else(|| WireError::malformed("number overflow"))?;
        }
    }

    async fn parse_word(&mut self) -> Result<String, WireError> {
        let first = self.peek().await?;
        if !first.is_ascii_alphabetic() {
            return Err(WireError::malformed(format!(
                "invalid token start byte 0x{first:02x}"
            )));
        }
        let mut word = String::new();
        loop {
            let ch = self.peek().await?;
            if ch.is_ascii_alphanumeric() || ch == b'-' {
                word.push(ch as char);
                self.consume().await?;
            } else {
                return Ok(word);
            }
        }
    }

    async fn read_exact(&mut self, n: usize) -> Result<Vec<u8>, WireError> {
        let mut out = Vec::with_capacity(n.min(READ_CHUNK));
        while out.len() < n {
            if self.pos < self.buf.len() {
                let take = (n - out.len()).min(self.buf.len() - self.pos);
                out.extend_from_slice(&self.buf[self.pos..self.pos + take]);
                self.pos += take;
            } else {
                self.fill().await?;
            }
        }
        Ok(out)
    }

    async fn skip_ws(&mut self) -> Result<(), WireError> {
        loop {
            if self.pos < self.buf.len() {
                if self.buf[self.pos].is_ascii_whitespace() {
                    self.pos += 1;
                } else {
                    return Ok(());
                }
            } else {
                self.fill().await?;
            }
        }
    }

    /// Every token must be followed by at least one whitespace byte.
    async fn require_ws(&mut self) -> Result<(), WireError> {
        let ch = self.peek().await?;
        if ch.is_ascii_whitespace() {
            self.pos += 1;
            Ok(())
        } else {
            Err(WireError::malformed(format!(
                "missing token separator, got byte 0x{ch:02x}"
            )))
        }
    }

    async fn peek(&mut self) -> Result<u8, WireError> {
        while self.pos >= self.buf.len() {
            self.fill().await?;
        }
        Ok(self.buf[self.pos])
    }

    async fn consume(&mut self) -> Result<u8, WireError> {
        let ch = self.peek().await?;
        self.pos += 1;
        Ok(ch)
    }

    async fn fill(&mut self) -> Result<(), WireError> {
        if self.pos > 0 {
            let len = self.buf.len();
            self.buf.copy_within(self.pos..len, 0);
            self.buf.truncate(len - self.pos);
            self.pos = 0;
        }
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.inner.read(&mut chunk).await?;
        if n == 0 {
            return Err(WireError::UnexpectedEof);
        }
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn parse(bytes: &[u8]) -> Result<Item, WireError> {
        let mut reader = ItemReader::new(std::io::Cursor::new(bytes.to_vec()));
        reader.read_item().await
    }

    #[tokio::test]
    async fn roundtrips_encoded_items() {
        let item = Item::List(vec![
            Item::word("get-file"),
            Item::Number(42),
            Item::bytes(vec![1, 2, 3, 0, 255]),
            Item::List(vec![Item::word("true"), Item::List(Vec::new())]),
        ]);
        let parsed = parse(&item.to_bytes()).await.unwrap();
        assert_eq!(parsed, item);
    }

    #[tokio::test]
    async fn parses_number_vs_string_by_colon() {
        assert_eq!(parse(b"42 ").await.unwrap(), Item::Number(42));
        assert_eq!(parse(b"2:ab ").await.unwrap(), Item::str("ab"));
    }

    #[tokio::test]
    async fn rejects_invalid_word_start() {
        let err = parse(b"_nope ").await.unwrap_err();
        assert!(matches!(err, WireError::MalformedFrame(_)));
    }

    #[tokio::test]
    async fn rejects_number_overflow() {
        let err = parse(b"99999999999999999999999 ").await.unwrap_err();
        assert!(matches!(err, WireError::MalformedFrame(_)));
    }

    #[tokio::test]
    async fn rejects_missing_separator() {
        let err = parse(b"( word)").await.unwrap_err();
        assert!(matches!(err, WireError::MalformedFrame(_)));
    }

    #[tokio::test]
    async fn eof_mid_string_is_reported() {
        let err = parse(b"10:abc").await.unwrap_err();
        assert!(matches!(err, WireError::UnexpectedEof));
    }

    #[tokio::test]
    async fn deeply_nested_lists_do_not_recurse() {
        let mut bytes = Vec::new();
        for _ in 0..10_000 {
            bytes.extend_from_slice(b"( ");
        }
        bytes.extend_from_slice(b"7 ");
        for _ in 0..10_000 {
            bytes.extend_from_slice(b") ");
        }
        let parsed = parse(&bytes).await.unwrap();
        let mut cur = &parsed;
        let mut depth = 0usize;
        while let Item::List(items) = cur {
            assert_eq!(items.len(), 1);
            cur = &items[0];
            depth += 1;
        }
        assert_eq!(depth, 10_000);
        assert_eq!(*cur, Item::Number(7));
    }
}
