use err_derive::Error;
use log::trace;
use nom::error::{ErrorKind, ParseError};
use nom::number::complete::{be_u16, be_u24, be_u8};
use nom::IResult;

use super::dictionary::Dictionary;
use super::keystream;
use super::keystream::KeyStream;
use super::model::*;

type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(display = "Unexpected token {:#04x}", _0)]
    UnexpectedToken(u8),

    #[error(display = "Unknown dictionary index {}", _0)]
    UnknownIndex(u16),

    #[error(display = "Encrypted frame received before key exchange")]
    MissingKey,

    #[error(display = "Malformed stanza payload")]
    Malformed,

    #[error(display = "Frame transform error")]
    KeyStream(#[error(source)] keystream::Error),
}

/// Nom error carrier for the node grammar, so a failed parse can report the
/// offending byte instead of a bare position.
#[derive(Debug)]
enum NodeError<'a> {
    UnexpectedToken(u8),
    UnknownIndex(u16),
    Nom(&'a [u8], ErrorKind),
}

impl<'a> ParseError<&'a [u8]> for NodeError<'a> {
    fn from_error_kind(input: &'a [u8], kind: ErrorKind) -> Self {
        NodeError::Nom(input, kind)
    }

    fn append(_: &'a [u8], _: ErrorKind, other: Self) -> Self {
        other
    }
}

impl<'a> From<nom::Err<NodeError<'a>>> for Error {
    fn from(err: nom::Err<NodeError<'a>>) -> Self {
        match err {
            nom::Err::Error(e) | nom::Err::Failure(e) => match e {
                NodeError::UnexpectedToken(token) => Error::UnexpectedToken(token),
                NodeError::UnknownIndex(index) => Error::UnknownIndex(index),
                NodeError::Nom(..) => Error::Malformed,
            },
            // The payload parsers run in complete mode; a frame that ends
            // mid-stanza is corrupt, not short.
            nom::Err::Incomplete(_) => Error::Malformed,
        }
    }
}

type NodeResult<'a, T> = IResult<&'a [u8], T, NodeError<'a>>;

/// Outcome of one `next_node` attempt.
#[derive(Debug, PartialEq)]
pub enum Decoded {
    /// The buffer does not yet hold a complete frame.
    NotReady,
    /// A complete frame that carries no stanza (keep-alive).
    Empty,
    /// A complete stanza.
    Stanza(Node),
}

/// Turns the accumulating inbound byte stream into stanzas.
///
/// Bytes arrive in arbitrary chunks via `append_input`; `next_node` consumes
/// exactly one frame per call once enough bytes are buffered.  A decode error
/// means the stream is desynchronized and the connection must be torn down.
pub struct Decoder {
    dictionary: &'static Dictionary,
    key: Option<KeyStream>,
    input: Vec<u8>,
}

impl Decoder {
    pub fn new(dictionary: &'static Dictionary) -> Decoder {
        Decoder {
            dictionary,
            key: None,
            input: Vec::new(),
        }
    }

    /// Installs (or clears) the inbound keystream.  Set once the session key
    /// has been derived; encrypted frames before that are fatal.
    pub fn set_key(&mut self, key: Option<KeyStream>) {
        self.key = key;
    }

    pub fn append_input(&mut self, bytes: &[u8]) {
        self.input.extend_from_slice(bytes);
    }

    pub fn next_node(&mut self) -> Result<Decoded> {
        let (flags, payload_len) = match frame_header(&self.input) {
            Ok((_, header)) => header,
            Err(nom::Err::Incomplete(_)) => return Ok(Decoded::NotReady),
            Err(_) => return Err(Error::Malformed),
        };

        let payload_end = FRAME_HEADER_LEN + payload_len as usize;
        let payload = self.input[FRAME_HEADER_LEN..payload_end].to_vec();
        self.input.drain(..payload_end);

        if payload.is_empty() {
            trace!("Keep-alive frame");
            return Ok(Decoded::Empty);
        }

        let plaintext;
        let stanza_buf = if flags & FLAG_RX_ENCRYPTED != 0 {
            let key = self.key.as_mut().ok_or(Error::MissingKey)?;
            plaintext = key.decode(&payload)?;
            &plaintext
        } else {
            &payload
        };

        // One stanza per frame; anything after it inside the frame boundary
        // is ignored.
        let (_, stanza) = node(self.dictionary, stanza_buf).map_err(Error::from)?;

        Ok(match stanza {
            Some(node) => Decoded::Stanza(node),
            None => Decoded::Empty,
        })
    }
}

/// Streaming parse of the 3-byte frame header, yielding `Incomplete` until
/// the whole payload is buffered.  The payload itself is not consumed here.
fn frame_header(buf: &[u8]) -> IResult<&[u8], (u8, u16), NodeError> {
    use nom::bytes::streaming::take;
    use nom::number::streaming::{be_u16, be_u8};

    let (buf, flags) = be_u8(buf)?;
    let (buf, payload_len) = be_u16(buf)?;
    let (buf, _payload) = take(payload_len)(buf)?;
    Ok((buf, (flags, payload_len)))
}

fn node<'a>(dict: &Dictionary, buf: &'a [u8]) -> NodeResult<'a, Option<Node>> {
    let (buf, marker) = be_u8(buf)?;
    let (buf, size) = list_size(marker, buf)?;
    if size == 0 {
        // A bare zero-size list stands for "no stanza".
        return Ok((buf, None));
    }

    let (buf, token) = be_u8(buf)?;
    match token {
        TOKEN_STREAM_START => {
            let (buf, attributes) = attributes(dict, size, buf)?;
            let node = Node::from_parts(
                STREAM_START_TAG.to_string(),
                attributes,
                Vec::new(),
                Vec::new(),
            );
            Ok((buf, Some(node)))
        }
        TOKEN_ABSENT => Ok((buf, None)),
        token => {
            let (buf, tag) = string(dict, token, buf)?;
            let (buf, attrs) = attributes(dict, size, buf)?;

            // An odd list size means the stanza has neither children nor data.
            if size % 2 == 1 {
                return Ok((buf, Some(Node::from_parts(tag, attrs, Vec::new(), Vec::new()))));
            }

            let (buf, content_token) = be_u8(buf)?;
            if is_list_token(content_token) {
                let (buf, children) = node_list(dict, content_token, buf)?;
                Ok((buf, Some(Node::from_parts(tag, attrs, children, Vec::new()))))
            } else {
                let (buf, data) = raw(dict, content_token, buf)?;
                Ok((buf, Some(Node::from_parts(tag, attrs, Vec::new(), data))))
            }
        }
    }
}

fn is_list_token(token: u8) -> bool {
    token == TOKEN_LIST_EMPTY || token == TOKEN_LIST_8 || token == TOKEN_LIST_16
}

fn list_size(marker: u8, buf: &[u8]) -> NodeResult<u16> {
    match marker {
        TOKEN_LIST_EMPTY => Ok((buf, 0)),
        TOKEN_LIST_8 => {
            let (buf, size) = be_u8(buf)?;
            Ok((buf, u16::from(size)))
        }
        TOKEN_LIST_16 => be_u16(buf),
        marker => Err(nom::Err::Failure(NodeError::UnexpectedToken(marker))),
    }
}

fn attributes<'a>(
    dict: &Dictionary,
    list_size: u16,
    buf: &'a [u8],
) -> NodeResult<'a, Vec<(String, String)>> {
    let count = (list_size + list_size % 2 - 2) / 2;
    let mut attributes = Vec::with_capacity(count as usize);

    let mut buf = buf;
    for _ in 0..count {
        let (rest, key_token) = be_u8(buf)?;
        let (rest, key) = string(dict, key_token, rest)?;
        let (rest, value_token) = be_u8(rest)?;
        let (rest, value) = string(dict, value_token, rest)?;
        attributes.push((key, value));
        buf = rest;
    }

    Ok((buf, attributes))
}

fn string<'a>(dict: &Dictionary, token: u8, buf: &'a [u8]) -> NodeResult<'a, String> {
    match token {
        // Token 0 stands for the empty string (used for server-only
        // addresses).
        0 => Ok((buf, String::new())),
        t if t > 4 && u16::from(t) < DICT_EXTENDED_BASE => {
            let (_, string) = dict_string(dict, u16::from(t), buf)?;
            Ok((buf, string))
        }
        TOKEN_DICT_EXTENDED => {
            let (buf, offset) = be_u8(buf)?;
            dict_string(dict, DICT_EXTENDED_BASE + u16::from(offset), buf)
        }
        TOKEN_BYTES_8 => {
            let (buf, len) = be_u8(buf)?;
            let (buf, bytes) = nom::bytes::complete::take(len)(buf)?;
            Ok((buf, String::from_utf8_lossy(bytes).into_owned()))
        }
        TOKEN_BYTES_24 => {
            let (buf, len) = be_u24(buf)?;
            let (buf, bytes) = nom::bytes::complete::take(len)(buf)?;
            Ok((buf, String::from_utf8_lossy(bytes).into_owned()))
        }
        TOKEN_JID_PAIR => {
            let (buf, user_token) = be_u8(buf)?;
            let (buf, user) = string(dict, user_token, buf)?;
            let (buf, server_token) = be_u8(buf)?;
            let (buf, server) = string(dict, server_token, buf)?;
            let jid = if user.is_empty() {
                server
            } else {
                format!("{}@{}", user, server)
            };
            Ok((buf, jid))
        }
        token => Err(nom::Err::Failure(NodeError::UnexpectedToken(token))),
    }
}

fn dict_string<'a>(dict: &Dictionary, index: u16, buf: &'a [u8]) -> NodeResult<'a, String> {
    match dict.token(index) {
        Some(string) => Ok((buf, string.to_string())),
        None => Err(nom::Err::Failure(NodeError::UnknownIndex(index))),
    }
}

/// A stanza payload: length-prefixed forms yield their raw bytes, anything
/// else decodes through the string grammar.
fn raw<'a>(dict: &Dictionary, token: u8, buf: &'a [u8]) -> NodeResult<'a, Vec<u8>> {
    match token {
        TOKEN_BYTES_8 => {
            let (buf, len) = be_u8(buf)?;
            let (buf, bytes) = nom::bytes::complete::take(len)(buf)?;
            Ok((buf, bytes.to_vec()))
        }
        TOKEN_BYTES_24 => {
            let (buf, len) = be_u24(buf)?;
            let (buf, bytes) = nom::bytes::complete::take(len)(buf)?;
            Ok((buf, bytes.to_vec()))
        }
        token => {
            let (buf, string) = string(dict, token, buf)?;
            Ok((buf, string.into_bytes()))
        }
    }
}

fn node_list<'a>(dict: &Dictionary, marker: u8, buf: &'a [u8]) -> NodeResult<'a, Vec<Node>> {
    let (buf, size) = list_size(marker, buf)?;
    let mut children = Vec::with_capacity(size as usize);

    let mut buf = buf;
    for _ in 0..size {
        let (rest, child) = node(dict, buf)?;
        children.extend(child);
        buf = rest;
    }

    Ok((buf, children))
}

#[cfg(test)]
use super::dictionary::DICTIONARY;

#[test]
fn test_not_ready_until_whole_frame_buffered() {
    let mut decoder = Decoder::new(&DICTIONARY);
    assert_eq!(decoder.next_node().unwrap(), Decoded::NotReady);

    // message stanza framed by the encoder, split at an arbitrary point
    let stanza = Node::new("message")
        .attr("type", "chat")
        .child(Node::new("body").with_data(&b"split me"[..]));
    let mut encoder = super::ser::Encoder::new(&DICTIONARY);
    let frame = encoder.node(&stanza).unwrap();

    decoder.append_input(&frame[..5]);
    assert_eq!(decoder.next_node().unwrap(), Decoded::NotReady);

    decoder.append_input(&frame[5..]);
    assert_eq!(decoder.next_node().unwrap(), Decoded::Stanza(stanza));
    assert_eq!(decoder.next_node().unwrap(), Decoded::NotReady);
}

#[test]
fn test_zero_length_payload_is_keep_alive() {
    let mut decoder = Decoder::new(&DICTIONARY);
    decoder.append_input(&[0x00, 0x00, 0x00]);
    assert_eq!(decoder.next_node().unwrap(), Decoded::Empty);
}

#[test]
fn test_batched_frames_drain_in_order() {
    let mut encoder = super::ser::Encoder::new(&DICTIONARY);
    let first = Node::new("presence").attr("type", "available");
    let second = Node::new("iq").attr("type", "get").attr("id", "x-1");

    let mut batch = encoder.node(&first).unwrap();
    batch.extend(encoder.node(&second).unwrap());
    batch.extend(&[0x00, 0x00, 0x00]);

    let mut decoder = Decoder::new(&DICTIONARY);
    decoder.append_input(&batch);
    assert_eq!(decoder.next_node().unwrap(), Decoded::Stanza(first));
    assert_eq!(decoder.next_node().unwrap(), Decoded::Stanza(second));
    assert_eq!(decoder.next_node().unwrap(), Decoded::Empty);
    assert_eq!(decoder.next_node().unwrap(), Decoded::NotReady);
}

#[test]
fn test_encrypted_frame_without_key() {
    let mut decoder = Decoder::new(&DICTIONARY);
    decoder.append_input(&[FLAG_RX_ENCRYPTED, 0x00, 0x05, 1, 2, 3, 4, 5]);
    match decoder.next_node() {
        Err(Error::MissingKey) => {}
        other => panic!("expected MissingKey, got {:?}", other),
    }
}

#[test]
fn test_unexpected_token_is_fatal() {
    let mut decoder = Decoder::new(&DICTIONARY);
    // list of size 1 whose tag token 0xFB is not part of the grammar
    decoder.append_input(&[0x00, 0x00, 0x03, 0xF8, 0x01, 0xFB]);
    match decoder.next_node() {
        Err(Error::UnexpectedToken(0xFB)) => {}
        other => panic!("expected UnexpectedToken, got {:?}", other),
    }
}

#[test]
fn test_unknown_extended_index_is_fatal() {
    let mut decoder = Decoder::new(&DICTIONARY);
    decoder.append_input(&[0x00, 0x00, 0x04, 0xF8, 0x01, 0xFE, 0xFF]);
    match decoder.next_node() {
        Err(Error::UnknownIndex(index)) => {
            assert_eq!(index, DICT_EXTENDED_BASE + 0xFF);
        }
        other => panic!("expected UnknownIndex, got {:?}", other),
    }
}

#[test]
fn test_absent_stanza_token() {
    let mut decoder = Decoder::new(&DICTIONARY);
    decoder.append_input(&[0x00, 0x00, 0x03, 0xF8, 0x01, TOKEN_ABSENT]);
    assert_eq!(decoder.next_node().unwrap(), Decoded::Empty);
}

#[test]
fn test_server_only_address() {
    // from="g.us" spelled as a composite address with an empty user part
    let server_index = DICTIONARY.index_of("g.us").unwrap() as u8;
    let from_index = DICTIONARY.index_of("from").unwrap() as u8;
    let presence_index = DICTIONARY.index_of("presence").unwrap() as u8;
    let payload = [
        0xF8,
        0x03,
        presence_index,
        from_index,
        TOKEN_JID_PAIR,
        0x00,
        server_index,
    ];
    let mut frame = vec![0x00, 0x00, payload.len() as u8];
    frame.extend_from_slice(&payload);

    let mut decoder = Decoder::new(&DICTIONARY);
    decoder.append_input(&frame);
    match decoder.next_node().unwrap() {
        Decoded::Stanza(node) => {
            assert_eq!(node.tag(), "presence");
            assert_eq!(node.attribute("from"), Some("g.us"));
        }
        other => panic!("expected a stanza, got {:?}", other),
    }
}

#[test]
fn test_stream_start_reply() {
    let to_index = DICTIONARY.index_of("to").unwrap() as u8;
    let server_index = DICTIONARY.index_of("s.whatsapp.net").unwrap() as u8;
    let payload = [0xF8, 0x03, TOKEN_STREAM_START, to_index, server_index];
    let mut frame = vec![0x00, 0x00, payload.len() as u8];
    frame.extend_from_slice(&payload);

    let mut decoder = Decoder::new(&DICTIONARY);
    decoder.append_input(&frame);
    match decoder.next_node().unwrap() {
        Decoded::Stanza(node) => {
            assert_eq!(node.tag(), STREAM_START_TAG);
            assert_eq!(node.attribute("to"), Some("s.whatsapp.net"));
        }
        other => panic!("expected a stanza, got {:?}", other),
    }
}
