use std::fmt::Write as _;

// Flag byte plus big-endian payload length.
pub(super) const FRAME_HEADER_LEN: usize = 3;

// Frame flag bits.  The server stamps bit 7 on encrypted frames; clients are
// expected to stamp 0x10 on theirs.  The asymmetry is part of the wire format.
pub(super) const FLAG_RX_ENCRYPTED: u8 = 0x80;
pub(super) const FLAG_TX_ENCRYPTED: u8 = 0x10;
pub(super) const FLAG_PLAIN: u8 = 0x00;

// Stream preamble: magic plus protocol major/minor.
pub(super) const STREAM_MAGIC: &[u8; 2] = b"WA";
pub(super) const STREAM_VERSION: [u8; 2] = [0x01, 0x05];

// Tokens with fixed meaning in the node grammar.
pub(super) const TOKEN_STREAM_START: u8 = 0x01;
pub(super) const TOKEN_ABSENT: u8 = 0x02;
pub(super) const TOKEN_LIST_EMPTY: u8 = 0x00;
pub(super) const TOKEN_LIST_8: u8 = 0xF8;
pub(super) const TOKEN_LIST_16: u8 = 0xF9;
pub(super) const TOKEN_JID_PAIR: u8 = 0xFA;
pub(super) const TOKEN_BYTES_8: u8 = 0xFC;
pub(super) const TOKEN_BYTES_24: u8 = 0xFD;
pub(super) const TOKEN_DICT_EXTENDED: u8 = 0xFE;

// Dictionary indices below this encode as a single byte; everything from here
// up to DICT_MAX goes through the two-byte extended form.
pub(super) const DICT_EXTENDED_BASE: u16 = 0xF5;
pub(super) const DICT_MAX: u16 = 0x1F5;

/// The tag of the synthetic stream-open stanza.
pub const STREAM_START_TAG: &str = "start";

/// One protocol stanza: a tagged tree with string attributes and either child
/// stanzas or a raw byte payload.  Values are immutable once built; the
/// consuming builder methods below are the only way to grow one.
///
/// Attribute order is wire-visible, so attributes are kept as an ordered list
/// of pairs rather than a map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    tag: String,
    attributes: Vec<(String, String)>,
    children: Vec<Node>,
    data: Vec<u8>,
}

impl Node {
    pub fn new<T: Into<String>>(tag: T) -> Node {
        Node {
            tag: tag.into(),
            attributes: Vec::new(),
            children: Vec::new(),
            data: Vec::new(),
        }
    }

    pub fn attr<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Node {
        self.attributes.push((key.into(), value.into()));
        self
    }

    pub fn child(mut self, child: Node) -> Node {
        self.children.push(child);
        self
    }

    pub fn with_data<D: Into<Vec<u8>>>(mut self, data: D) -> Node {
        self.data = data.into();
        self
    }

    pub(super) fn from_parts(
        tag: String,
        attributes: Vec<(String, String)>,
        children: Vec<Node>,
        data: Vec<u8>,
    ) -> Node {
        Node {
            tag,
            attributes,
            children,
            data,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn attributes(&self) -> &[(String, String)] {
        &self.attributes
    }

    /// The value of the named attribute, if present.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn children(&self) -> &[Node] {
        &self.children
    }

    /// The first child with the given tag.
    pub fn find(&self, tag: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.tag == tag)
    }

    pub fn first_child(&self) -> Option<&Node> {
        self.children.first()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Renders the stanza as indented XML-ish text for logs and error
    /// reports.  Binary payloads are shown lossily.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_xml(&mut out, 0);
        out
    }

    fn write_xml(&self, out: &mut String, depth: usize) {
        let pad = "  ".repeat(depth);
        let _ = write!(out, "{}<{}", pad, self.tag);
        for (key, value) in &self.attributes {
            let _ = write!(out, " {}=\"{}\"", key, value);
        }
        out.push('>');
        if !self.data.is_empty() {
            out.push_str(&String::from_utf8_lossy(&self.data));
        }
        if !self.children.is_empty() {
            for child in &self.children {
                out.push('\n');
                child.write_xml(out, depth + 1);
            }
            out.push('\n');
            out.push_str(&pad);
        }
        let _ = write!(out, "</{}>", self.tag);
    }
}

#[test]
fn test_attribute_lookup() {
    let node = Node::new("iq").attr("type", "get").attr("id", "ping-1");
    assert_eq!(node.attribute("type"), Some("get"));
    assert_eq!(node.attribute("id"), Some("ping-1"));
    assert_eq!(node.attribute("from"), None);
}

#[test]
fn test_find_child() {
    let node = Node::new("message")
        .child(Node::new("request").attr("xmlns", "urn:xmpp:receipts"))
        .child(Node::new("body").with_data(&b"hello"[..]));
    assert_eq!(node.find("body").unwrap().data(), b"hello");
    assert!(node.find("received").is_none());
    assert_eq!(node.first_child().unwrap().tag(), "request");
}

#[test]
fn test_to_xml() {
    let node = Node::new("message")
        .attr("to", "123@s.whatsapp.net")
        .child(Node::new("body").with_data(&b"hi"[..]));
    let xml = node.to_xml();
    assert!(xml.starts_with("<message to=\"123@s.whatsapp.net\">"));
    assert!(xml.contains("<body>hi</body>"));
}
