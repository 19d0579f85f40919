//! The `ra_svn` item grammar as an owned value tree.
//!
//! Four terminals (word, number, string, boolean words) and one composite
//! (list). Strings carry raw bytes; nothing on this level assumes UTF-8.

use crate::error::WireError;

/// One protocol item.
#[derive(Clone, Debug, PartialEq)]
pub enum Item {
    /// An identifier token, e.g. a command or capability name.
    Word(String),
    /// A non-negative decimal number.
    Number(u64),
    /// A length-prefixed byte string.
    String(Vec<u8>),
    /// A nested list. Empty lists are legal and common.
    List(Vec<Item>),
}

impl Item {
    pub fn word(w: impl Into<String>) -> Self {
        Item::Word(w.into())
    }

    pub fn str(s: impl AsRef<str>) -> Self {
        Item::String(s.as_ref().as_bytes().to_vec())
    }

    pub fn bytes(b: impl Into<Vec<u8>>) -> Self {
        Item::String(b.into())
    }

    pub fn bool(b: bool) -> Self {
        Item::Word(if b { "true" } else { "false" }.to_string())
    }

    /// `( )` if `value` is `None`, `( item )` otherwise. The protocol
    /// encodes optional tuple slots this way.
    pub fn optional(value: Option<Item>) -> Self {
        match value {
            Some(item) => Item::List(vec![item]),
            None => Item::List(Vec::new()),
        }
    }

    pub fn list(items: impl Into<Vec<Item>>) -> Self {
        Item::List(items.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Item::Word(_) => "word",
            Item::Number(_) => "number",
            Item::String(_) => "string",
            Item::List(_) => "list",
        }
    }

    pub fn as_word(&self) -> Option<&str> {
        match self {
            Item::Word(w) => Some(w),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Item::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.as_word() {
            Some("true") => Some(true),
            Some("false") => Some(false),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Item::String(b) => Some(b),
            _ => None,
        }
    }

    /// UTF-8 view of a string item. Non-UTF-8 strings return `None`;
    /// callers that accept raw bytes should use [`Item::as_bytes`].
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Item::String(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Item]> {
        match self {
            Item::List(items) => Some(items),
            _ => None,
        }
    }

    /// Like [`Item::as_list`] but producing a typed error naming `ctx`.
    pub fn expect_list(&self, ctx: &str) -> Result<&[Item], WireError> {
        self.as_list()
            .ok_or_else(|| WireError::malformed(format!("{ctx}: expected list, got {}", self.kind())))
    }

    pub fn expect_word(&self, ctx: &str) -> Result<&str, WireError> {
        self.as_word()
            .ok_or_else(|| WireError::malformed(format!("{ctx}: expected word, got {}", self.kind())))
    }

    pub fn expect_u64(&self, ctx: &str) -> Result<u64, WireError> {
        self.as_u64()
            .ok_or_else(|| WireError::malformed(format!("{ctx}: expected number, got {}", self.kind())))
    }

    pub fn expect_str(&self, ctx: &str) -> Result<&str, WireError> {
        self.as_str()
            .ok_or_else(|| WireError::malformed(format!("{ctx}: expected utf-8 string")))
    }

    pub fn expect_bytes(&self, ctx: &str) -> Result<&[u8], WireError> {
        self.as_bytes()
            .ok_or_else(|| WireError::malformed(format!("{ctx}: expected string, got {}", self.kind())))
    }

    /// Encodes this item into `out`, byte-exact per the grammar.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Item::Word(w) => {
                out.extend_from_slice(w.as_bytes());
                out.push(b' ');
            }
            Item::Number(n) => {
                encode_decimal(*n, out);
                out.push(b' ');
            }
            Item::String(s) => {
                encode_decimal(s.len() as u64, out);
                out.push(b':');
                out.extend_from_slice(s);
                out.push(b' ');
            }
            Item::List(items) => {
                out.extend_from_slice(b"( ");
                for item in items {
                    item.encode(out);
                }
                out.extend_from_slice(b") ");
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }
}

pub(crate) fn encode_decimal(mut n: u64, out: &mut Vec<u8>) {
    if n == 0 {
        out.push(b'0');
        return;
    }
    let mut buf = [0u8; 20];
    let mut i = buf.len();
    while n > 0 {
        i -= 1;
        buf[i] = b'0' + (n % 10) as u8;
        n /= 10;
    }
    out.extend_from_slice(&buf[i..]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_expected_bytes() {
        let item = Item::List(vec![
            Item::word("word"),
            Item::Number(22),
            Item::str("string"),
            Item::List(vec![Item::word("sublist")]),
        ]);
        assert_eq!(item.to_bytes(), b"( word 22 6:string ( sublist ) ) ");
    }

    #[test]
    fn empty_list_and_empty_string() {
        assert_eq!(Item::List(Vec::new()).to_bytes(), b"( ) ");
        assert_eq!(Item::String(Vec::new()).to_bytes(), b"0: ");
    }

    #[test]
    fn optional_tuple_slots() {
        assert_eq!(Item::optional(None).to_bytes(), b"( ) ");
        assert_eq!(Item::optional(Some(Item::Number(7))).to_bytes(), b"( 7 ) ");
    }

    #[test]
    fn binary_string_is_byte_exact() {
        let item = Item::bytes(vec![0u8, 255, 10, 32]);
        let mut expected = b"4:".to_vec();
        expected.extend_from_slice(&[0, 255, 10, 32]);
        expected.push(b' ');
        assert_eq!(item.to_bytes(), expected);
    }
}
