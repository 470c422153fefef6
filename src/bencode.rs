//! Bencoding value tree and codec.
//!
//! Bencode is the encoding used by .torrent files, tracker responses and the
//! metadata exchange extension. Four kinds of values exist: integers, byte
//! strings, lists and dictionaries keyed by byte strings. Parsing yields an
//! [`Element`] tree; serializing is deterministic with dictionary keys in
//! lexicographic byte order, which is what makes the info hash reproducible.

use std::{collections::BTreeMap, ops::Range};

use crate::error::Error;

/// Dictionary keys are raw byte strings ordered lexicographically, the order
/// the canonical encoding requires.
pub type Dictionary = BTreeMap<Vec<u8>, Element>;

/// A single bencoded value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Element {
    Integer(i64),
    ByteString(Vec<u8>),
    List(Vec<Element>),
    Dictionary(Dictionary),
}

impl Element {
    /// Parse one bencoded value from the start of `buf`. Trailing bytes are
    /// ignored, use [`Parser`] directly when the consumed length matters.
    pub fn decode(buf: &[u8]) -> Result<Element, Error> {
        Parser::new(buf).parse()
    }

    /// Serialize the value canonically.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Element::Integer(v) => {
                out.push(b'i');
                out.extend_from_slice(v.to_string().as_bytes());
                out.push(b'e');
            }
            Element::ByteString(v) => {
                out.extend_from_slice(v.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(v);
            }
            Element::List(list) => {
                out.push(b'l');
                for element in list {
                    element.encode_into(out);
                }
                out.push(b'e');
            }
            Element::Dictionary(dict) => {
                out.push(b'd');
                // BTreeMap iterates in key order, exactly the order the
                // canonical encoding requires.
                for (key, value) in dict {
                    out.extend_from_slice(key.len().to_string().as_bytes());
                    out.push(b':');
                    out.extend_from_slice(key);
                    value.encode_into(out);
                }
                out.push(b'e');
            }
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Element::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Element::ByteString(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn as_list(&self) -> Option<&[Element]> {
        match self {
            Element::List(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_dictionary(&self) -> Option<&Dictionary> {
        match self {
            Element::Dictionary(v) => Some(v),
            _ => None,
        }
    }

    /// Look a key up, if this element is a dictionary.
    pub fn get(&self, key: &[u8]) -> Option<&Element> {
        self.as_dictionary().and_then(|d| d.get(key))
    }
}

impl From<i64> for Element {
    fn from(value: i64) -> Self {
        Element::Integer(value)
    }
}

impl From<&[u8]> for Element {
    fn from(value: &[u8]) -> Self {
        Element::ByteString(value.to_vec())
    }
}

impl From<&str> for Element {
    fn from(value: &str) -> Self {
        Element::ByteString(value.as_bytes().to_vec())
    }
}

/// Recursive descent parser over a byte buffer.
#[derive(Debug)]
pub struct Parser<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// How many bytes have been consumed so far. After [`Parser::parse`]
    /// this is the length of the parsed value, which callers use to split
    /// a value from a trailing payload.
    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn parse(&mut self) -> Result<Element, Error> {
        match self.peek()? {
            b'i' => self.parse_integer(),
            b'l' => self.parse_list(),
            b'd' => self.parse_dictionary(),
            b'0'..=b'9' => self.parse_string().map(Element::ByteString),
            _ => Err(self.invalid("invalid token")),
        }
    }

    fn peek(&self) -> Result<u8, Error> {
        self.buf
            .get(self.pos)
            .copied()
            .ok_or(self.invalid("unexpected end of input"))
    }

    fn bump(&mut self) -> Result<u8, Error> {
        let byte = self.peek()?;
        self.pos += 1;
        Ok(byte)
    }

    fn invalid(&self, reason: &'static str) -> Error {
        Error::Bencode { pos: self.pos, reason }
    }

    fn parse_integer(&mut self) -> Result<Element, Error> {
        self.bump()?; // 'i'
        let start = self.pos;
        while self.peek()? != b'e' {
            self.pos += 1;
        }
        let digits = std::str::from_utf8(&self.buf[start..self.pos])
            .map_err(|_| self.invalid("integer is not ASCII"))?;
        let value = digits
            .parse::<i64>()
            .map_err(|_| self.invalid("invalid integer"))?;
        self.bump()?; // 'e'
        Ok(Element::Integer(value))
    }

    fn parse_string(&mut self) -> Result<Vec<u8>, Error> {
        let start = self.pos;
        while self.peek()?.is_ascii_digit() {
            self.pos += 1;
        }
        if self.bump()? != b':' {
            return Err(self.invalid("expected `:` after string length"));
        }
        let length = std::str::from_utf8(&self.buf[start..self.pos - 1])
            .expect("digits are ASCII")
            .parse::<usize>()
            .map_err(|_| self.invalid("invalid string length"))?;
        if self.pos + length > self.buf.len() {
            return Err(self.invalid("string runs past end of input"));
        }
        let value = self.buf[self.pos..self.pos + length].to_vec();
        self.pos += length;
        Ok(value)
    }

    fn parse_list(&mut self) -> Result<Element, Error> {
        self.bump()?; // 'l'
        let mut list = Vec::new();
        while self.peek()? != b'e' {
            list.push(self.parse()?);
        }
        self.bump()?; // 'e'
        Ok(Element::List(list))
    }

    fn parse_dictionary(&mut self) -> Result<Element, Error> {
        self.bump()?; // 'd'
        let mut dict = Dictionary::new();
        while self.peek()? != b'e' {
            let key = self.parse_string()?;
            let value = self.parse()?;
            dict.insert(key, value);
        }
        self.bump()?; // 'e'
        Ok(Element::Dictionary(dict))
    }
}

/// Byte range that `key`'s value occupies inside a top-level dictionary.
///
/// The info hash is the SHA-1 of the info value exactly as it appeared in
/// the .torrent file, so the raw span is needed rather than a re-encoding
/// of the parsed tree.
pub fn raw_value_span(
    buf: &[u8],
    key: &[u8],
) -> Result<Option<Range<usize>>, Error> {
    let mut parser = Parser::new(buf);
    if parser.bump()? != b'd' {
        return Err(Error::Bencode {
            pos: 0,
            reason: "expected a top-level dictionary",
        });
    }
    while parser.peek()? != b'e' {
        let entry_key = parser.parse_string()?;
        let start = parser.pos();
        parser.parse()?;
        if entry_key == key {
            return Ok(Some(start..parser.pos()));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use sha1::{Digest, Sha1};

    use super::*;

    fn roundtrip(element: Element) {
        let encoded = element.encode();
        assert_eq!(Element::decode(&encoded).unwrap(), element);
    }

    #[test]
    fn roundtrips() {
        roundtrip(Element::Integer(0));
        roundtrip(Element::Integer(-42));
        roundtrip(Element::Integer(i64::MAX));
        roundtrip(Element::ByteString(vec![]));
        roundtrip(Element::ByteString(b"spam".to_vec()));
        roundtrip(Element::ByteString(vec![0x00, 0xff, 0x80, b':']));
        roundtrip(Element::List(vec![
            Element::Integer(1),
            Element::List(vec![Element::ByteString(b"a".to_vec())]),
        ]));

        let mut dict = Dictionary::new();
        dict.insert(b"nested".to_vec(), Element::Dictionary(Dictionary::new()));
        dict.insert(b"list".to_vec(), Element::List(vec![]));
        roundtrip(Element::Dictionary(dict));
    }

    #[test]
    fn dictionary_keys_are_sorted() {
        let mut dict = Dictionary::new();
        dict.insert(b"zz".to_vec(), Element::Integer(1));
        dict.insert(b"aa".to_vec(), Element::Integer(2));
        dict.insert(b"mm".to_vec(), Element::Integer(3));

        let encoded = Element::Dictionary(dict).encode();
        assert_eq!(encoded, b"d2:aai2e2:mmi3e2:zzi1ee");
    }

    #[test]
    fn parses_torrent_shaped_input() {
        let mut buf = b"d8:announce3:url4:infod6:lengthi12e4:name1:a12:piece \
                        lengthi12e6:pieces20:"
            .to_vec();
        buf.extend_from_slice(&[0u8; 20]);
        buf.extend_from_slice(b"ee");

        let root = Element::decode(&buf).unwrap();
        assert_eq!(root.get(b"announce").unwrap().as_str(), Some("url"));

        let info = root.get(b"info").unwrap();
        assert_eq!(info.get(b"length").unwrap().as_integer(), Some(12));
        assert_eq!(info.get(b"piece length").unwrap().as_integer(), Some(12));
        assert_eq!(info.get(b"pieces").unwrap().as_bytes(), Some(&[0u8; 20][..]));

        // the serialized info sub-dict hashes to a stable value
        let mut hasher = Sha1::new();
        hasher.update(info.encode());
        let hash: [u8; 20] = hasher.finalize().into();
        assert_eq!(
            hex::encode(hash),
            "e7bcc8eaf3c8dd31d20977a66244d05e2cdd0e29"
        );

        // and the raw span matches the canonical re-encoding
        let span = raw_value_span(&buf, b"info").unwrap().unwrap();
        assert_eq!(&buf[span], &info.encode()[..]);
    }

    #[test]
    fn duplicate_dictionary_keys_keep_the_last_value() {
        let element = Element::decode(b"d1:ai1e1:ai2ee").unwrap();
        assert_eq!(element.get(b"a").unwrap().as_integer(), Some(2));
    }

    #[test]
    fn binary_safe_strings() {
        let mut buf = b"3:".to_vec();
        buf.extend_from_slice(&[b'e', 0x00, b'i']);
        let element = Element::decode(&buf).unwrap();
        assert_eq!(element.as_bytes(), Some(&[b'e', 0x00, b'i'][..]));
    }

    #[test]
    fn errors_carry_positions() {
        match Element::decode(b"i12") {
            Err(Error::Bencode { pos: 3, .. }) => {}
            other => panic!("unexpected: {other:?}"),
        }
        match Element::decode(b"5:ab") {
            Err(Error::Bencode { pos: 2, .. }) => {}
            other => panic!("unexpected: {other:?}"),
        }
        match Element::decode(b"x") {
            Err(Error::Bencode { pos: 0, .. }) => {}
            other => panic!("unexpected: {other:?}"),
        }
        assert!(Element::decode(b"li1e").is_err());
        assert!(Element::decode(b"iabce").is_err());
    }

    #[test]
    fn parser_reports_consumed_length() {
        let mut parser = Parser::new(b"d1:ai1eetrailing");
        parser.parse().unwrap();
        assert_eq!(parser.pos(), 8);
    }
}
