use cookie_factory::bytes::{be_u16, be_u24, be_u8};
use cookie_factory::combinator::slice;
use cookie_factory::sequence::tuple;
use cookie_factory::{gen, GenError, GenResult, SerializeFn, WriteContext};
use std::io::Write;

use super::dictionary::Dictionary;
use super::keystream::KeyStream;
use super::model::*;

pub type Error = GenError;

type Result<T> = std::result::Result<T, Error>;

// GenError::CustomError discriminants.
const ERR_TOKEN_RANGE: u32 = 1;
const ERR_BYTES_TOO_LONG: u32 = 2;
const ERR_LIST_TOO_LONG: u32 = 3;
const ERR_FRAME_TOO_LONG: u32 = 4;

/// Serializes stanzas into framed wire bytes, optionally transforming the
/// payload through the outbound keystream.
///
/// The frame header must state the exact payload length up front, so every
/// stanza is measured first by running its serializer over a sink, then
/// written into a buffer of exactly that size.  Both passes share one
/// combinator tree and cannot diverge.
pub struct Encoder {
    dictionary: &'static Dictionary,
    key: Option<KeyStream>,
}

impl Encoder {
    pub fn new(dictionary: &'static Dictionary) -> Encoder {
        Encoder {
            dictionary,
            key: None,
        }
    }

    /// Installs (or clears) the outbound keystream.  Frames produced after
    /// this carry the encrypted flag and the integrity tag.
    pub fn set_key(&mut self, key: Option<KeyStream>) {
        self.key = key;
    }

    /// The stream-open preamble and header frame.  Sent once per connection,
    /// before any keystream exists.
    pub fn stream_open(&mut self, to: &str, resource: &str) -> Result<Vec<u8>> {
        let payload = to_vec(stream_start(self.dictionary, to, resource))?;
        let frame = self.frame(payload)?;

        let mut out = Vec::with_capacity(STREAM_MAGIC.len() + STREAM_VERSION.len() + frame.len());
        out.extend_from_slice(STREAM_MAGIC);
        out.extend_from_slice(&STREAM_VERSION);
        out.extend_from_slice(&frame);
        Ok(out)
    }

    /// One stanza, framed.
    pub fn node(&mut self, node: &Node) -> Result<Vec<u8>> {
        let length = buffer_length(write_node(self.dictionary, node))?;
        let (payload, _) = gen(
            write_node(self.dictionary, node),
            Vec::with_capacity(length as usize),
        )?;
        self.frame(payload)
    }

    /// A frame carrying no stanza, used as a keep-alive.
    pub fn empty_frame(&mut self) -> Result<Vec<u8>> {
        self.frame(vec![TOKEN_LIST_EMPTY])
    }

    fn frame(&mut self, payload: Vec<u8>) -> Result<Vec<u8>> {
        let (payload, flags) = match self.key.as_mut() {
            Some(key) => (key.encode(&payload, true), FLAG_TX_ENCRYPTED),
            None => (payload, FLAG_PLAIN),
        };

        if payload.len() > usize::from(u16::max_value()) {
            return Err(GenError::CustomError(ERR_FRAME_TOO_LONG));
        }

        let out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        let (out, _) = gen(
            tuple((
                be_u8(flags),
                be_u16(payload.len() as u16),
                slice(&payload),
            )),
            out,
        )?;
        Ok(out)
    }
}

/// Runs a serializer over a sink to measure its output.
fn buffer_length<F: SerializeFn<std::io::Sink>>(f: F) -> Result<u64> {
    gen(f, std::io::sink()).map(|(_, length)| length)
}

fn to_vec<F: SerializeFn<Vec<u8>>>(f: F) -> Result<Vec<u8>> {
    gen(f, Vec::new()).map(|(out, _)| out)
}

/// One serializer for the whole node grammar.  Running it over a sink
/// measures a stanza; running it over a buffer writes one.  The recursion is
/// a plain function so the combinator wrapper stays a simple closure.
fn write_node<'a, W: Write + 'a>(dict: &'a Dictionary, node: &'a Node) -> impl SerializeFn<W> + 'a {
    move |out: WriteContext<W>| node_bytes(dict, node, out)
}

fn node_bytes<W: Write>(dict: &Dictionary, node: &Node, out: WriteContext<W>) -> GenResult<W> {
    let mut size = 1 + 2 * node.attributes().len();
    if !node.data().is_empty() {
        size += 1;
    }
    if !node.children().is_empty() {
        size += 1;
    }

    let mut out = write_list_start(size)(out)?;
    out = string_bytes(dict, node.tag(), out)?;
    for (key, value) in node.attributes() {
        out = string_bytes(dict, key, out)?;
        out = string_bytes(dict, value, out)?;
    }

    if !node.data().is_empty() {
        out = write_bytes(node.data())(out)?;
    }
    if !node.children().is_empty() {
        out = write_list_start(node.children().len())(out)?;
        for child in node.children() {
            out = node_bytes(dict, child, out)?;
        }
    }
    Ok(out)
}

fn stream_start<'a, W: Write + 'a>(
    dict: &'a Dictionary,
    to: &'a str,
    resource: &'a str,
) -> impl SerializeFn<W> + 'a {
    move |out: WriteContext<W>| {
        let out = write_list_start(5)(out)?;
        let out = be_u8(TOKEN_STREAM_START)(out)?;
        let out = string_bytes(dict, "to", out)?;
        let out = string_bytes(dict, to, out)?;
        let out = string_bytes(dict, "resource", out)?;
        string_bytes(dict, resource, out)
    }
}

fn write_list_start<W: Write>(len: usize) -> impl SerializeFn<W> {
    move |out: WriteContext<W>| {
        if len == 0 {
            be_u8(TOKEN_LIST_EMPTY)(out)
        } else if len < 0x100 {
            tuple((be_u8(TOKEN_LIST_8), be_u8(len as u8)))(out)
        } else if len <= usize::from(u16::max_value()) {
            tuple((be_u8(TOKEN_LIST_16), be_u16(len as u16)))(out)
        } else {
            Err(GenError::CustomError(ERR_LIST_TOO_LONG))
        }
    }
}

/// The string rule: dictionary token, then composite address, then raw
/// length-prefixed bytes.
fn string_bytes<W: Write>(dict: &Dictionary, string: &str, out: WriteContext<W>) -> GenResult<W> {
    if let Some(index) = dict.index_of(string) {
        write_token(index)(out)
    } else if let Some(at) = string.find('@') {
        jid_bytes(dict, &string[..at], &string[at + 1..], out)
    } else {
        write_bytes(string.as_bytes())(out)
    }
}

fn write_token<W: Write>(index: u16) -> impl SerializeFn<W> {
    move |out: WriteContext<W>| {
        if index < DICT_EXTENDED_BASE {
            be_u8(index as u8)(out)
        } else if index < DICT_MAX {
            tuple((
                be_u8(TOKEN_DICT_EXTENDED),
                be_u8((index - DICT_EXTENDED_BASE) as u8),
            ))(out)
        } else {
            Err(GenError::CustomError(ERR_TOKEN_RANGE))
        }
    }
}

fn jid_bytes<W: Write>(
    dict: &Dictionary,
    user: &str,
    server: &str,
    out: WriteContext<W>,
) -> GenResult<W> {
    let out = be_u8(TOKEN_JID_PAIR)(out)?;
    let out = if user.is_empty() {
        // A server-only address carries the zero token as its user part.
        be_u8(0)(out)?
    } else {
        string_bytes(dict, user, out)?
    };
    string_bytes(dict, server, out)
}

fn write_bytes<'a, W: Write + 'a>(bytes: &'a [u8]) -> impl SerializeFn<W> + 'a {
    move |out: WriteContext<W>| {
        if bytes.len() < 0x100 {
            tuple((be_u8(TOKEN_BYTES_8), be_u8(bytes.len() as u8), slice(bytes)))(out)
        } else if bytes.len() < 0x0100_0000 {
            tuple((
                be_u8(TOKEN_BYTES_24),
                be_u24(bytes.len() as u32),
                slice(bytes),
            ))(out)
        } else {
            Err(GenError::CustomError(ERR_BYTES_TOO_LONG))
        }
    }
}

#[cfg(test)]
use super::de::{Decoded, Decoder};
#[cfg(test)]
use super::dictionary::DICTIONARY;
#[cfg(test)]
use super::keystream::TAG_LEN;

#[cfg(test)]
fn sample_nodes() -> Vec<Node> {
    vec![
        Node::new("presence").attr("type", "available"),
        Node::new("message")
            .attr("to", "4479000000@s.whatsapp.net")
            .attr("type", "chat")
            .attr("id", "message-1415000000-12")
            .child(Node::new("x").attr("xmlns", "jabber:x:event").child(Node::new("server")))
            .child(Node::new("request").attr("xmlns", "urn:xmpp:receipts"))
            .child(Node::new("body").with_data(&b"hello there"[..])),
        Node::new("iq")
            .attr("id", "ping-9")
            .attr("type", "get")
            .child(Node::new("ping").attr("xmlns", "urn:xmpp:ping")),
        Node::new("ack").attr("custom-attr", "custom value not in the table"),
        Node::new("raw-tagged-stanza").with_data((0u8..=255).collect::<Vec<u8>>()),
    ]
}

#[test]
fn test_roundtrip_through_decoder() {
    let mut encoder = Encoder::new(&DICTIONARY);
    let mut decoder = Decoder::new(&DICTIONARY);

    for node in sample_nodes() {
        decoder.append_input(&encoder.node(&node).unwrap());
        assert_eq!(decoder.next_node().unwrap(), Decoded::Stanza(node));
    }
}

#[test]
fn test_measured_length_matches_written() {
    for node in sample_nodes() {
        let length = buffer_length(write_node(&DICTIONARY, &node)).unwrap();
        let (written, _) = gen(write_node(&DICTIONARY, &node), Vec::new()).unwrap();
        assert_eq!(written.len() as u64, length);
    }
}

#[test]
fn test_stream_open_exact_bytes() {
    let mut encoder = Encoder::new(&DICTIONARY);
    let out = encoder.stream_open("s.example.net", "android-1-5222").unwrap();

    let mut payload = vec![0xF8, 0x05, TOKEN_STREAM_START];
    payload.push(DICTIONARY.index_of("to").unwrap() as u8);
    payload.extend(&[TOKEN_BYTES_8, 13]);
    payload.extend(b"s.example.net");
    payload.push(DICTIONARY.index_of("resource").unwrap() as u8);
    payload.extend(&[TOKEN_BYTES_8, 14]);
    payload.extend(b"android-1-5222");

    let mut expected = vec![b'W', b'A', 0x01, 0x05, 0x00];
    expected.extend(&(payload.len() as u16).to_be_bytes());
    expected.extend(&payload);

    assert_eq!(out, expected);
}

#[test]
fn test_empty_frame_bytes() {
    let mut encoder = Encoder::new(&DICTIONARY);
    assert_eq!(encoder.empty_frame().unwrap(), [0x00, 0x00, 0x01, 0x00]);
}

#[test]
fn test_extended_token_two_byte_form() {
    let extended = DICTIONARY.token(DICT_EXTENDED_BASE).unwrap();
    let node = Node::new("message").attr("type", extended);

    let mut encoder = Encoder::new(&DICTIONARY);
    let frame = encoder.node(&node).unwrap();

    // The value encodes as the extended marker plus offset zero.
    let tail = &frame[frame.len() - 2..];
    assert_eq!(tail, [TOKEN_DICT_EXTENDED, 0x00]);

    let mut decoder = Decoder::new(&DICTIONARY);
    decoder.append_input(&frame);
    assert_eq!(decoder.next_node().unwrap(), Decoded::Stanza(node));
}

#[test]
fn test_dictionary_hit_is_single_byte() {
    let mut encoder = Encoder::new(&DICTIONARY);
    let frame = encoder.node(&Node::new("presence")).unwrap();
    // header + list marker + size + one token byte
    assert_eq!(frame.len(), FRAME_HEADER_LEN + 3);
}

#[test]
fn test_long_data_uses_24_bit_length() {
    let node = Node::new("body").with_data(vec![0x42u8; 0x100]);
    let mut encoder = Encoder::new(&DICTIONARY);
    let frame = encoder.node(&node).unwrap();
    let payload = &frame[FRAME_HEADER_LEN..];
    // list start, tag token, then the 24-bit raw form
    assert_eq!(payload[2], TOKEN_BYTES_24);
    assert_eq!(&payload[3..6], [0x00, 0x01, 0x00]);

    let mut decoder = Decoder::new(&DICTIONARY);
    decoder.append_input(&frame);
    assert_eq!(decoder.next_node().unwrap(), Decoded::Stanza(node));
}

#[test]
fn test_encrypted_frame_layout() {
    let key = [7u8; 20];
    let node = Node::new("presence").attr("type", "available");

    let mut encoder = Encoder::new(&DICTIONARY);
    let plain_frame = encoder.node(&node).unwrap();

    encoder.set_key(Some(KeyStream::new(&key)));
    let frame = encoder.node(&node).unwrap();

    assert_eq!(frame[0], FLAG_TX_ENCRYPTED);
    let payload = &frame[FRAME_HEADER_LEN..];
    assert_eq!(payload.len(), plain_frame.len() - FRAME_HEADER_LEN + TAG_LEN);

    // Outbound payloads trail their tag; move it up front and decode with an
    // identically-keyed stream.
    let (ciphertext, tag) = payload.split_at(payload.len() - TAG_LEN);
    let mut reframed = tag.to_vec();
    reframed.extend_from_slice(ciphertext);
    let mut rx = KeyStream::new(&key);
    assert_eq!(rx.decode(&reframed).unwrap(), &plain_frame[FRAME_HEADER_LEN..]);
}
