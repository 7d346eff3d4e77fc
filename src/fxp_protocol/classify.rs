use crate::fxp::model::Node;

/// The closed set of inbound stanza shapes the session reacts to.  Produced
/// by `classify`, which checks the variants in declaration order so "first
/// match wins" is explicit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaKind {
    /// Server challenge carrying the key-derivation salt.
    Challenge,
    /// Authentication accepted; payload is next session's challenge material.
    Success,
    /// A contact's availability changed.
    Presence,
    /// The server flagged stale state categories to be cleaned.
    DirtyPresence,
    /// Server ping, must be answered with a matching-id pong.
    Ping,
    /// Reply to a last-seen query.
    LastSeen,
    /// Item-not-found error reply.
    NotFound,
    /// Stream-level failure report.
    Failure,
    /// The peer confirmed delivery of one of our messages.
    Delivered,
    /// Reply to a profile picture query.
    ProfilePicture,
    /// A chat message for the processor chain.
    ChatMessage,
    /// A typing-state notification.
    Typing,
    /// Anything else; ignored.
    Other,
}

/// Classifies a stanza by its shape: tag, attributes, and first child.
pub fn classify(node: &Node) -> StanzaKind {
    if node.tag() == "challenge" {
        StanzaKind::Challenge
    } else if node.tag() == "success" {
        StanzaKind::Success
    } else if is_presence_update(node) {
        StanzaKind::Presence
    } else if node.tag() == "presence" && node.attribute("status") == Some("dirty") {
        StanzaKind::DirtyPresence
    } else if is_ping(node) {
        StanzaKind::Ping
    } else if is_last_seen(node) {
        StanzaKind::LastSeen
    } else if is_not_found(node) {
        StanzaKind::NotFound
    } else if node.tag() == "failure" {
        StanzaKind::Failure
    } else if node.tag() == "message" && node.find("received").is_some() {
        StanzaKind::Delivered
    } else if is_profile_picture(node) {
        StanzaKind::ProfilePicture
    } else if is_chat_message(node) {
        StanzaKind::ChatMessage
    } else if is_typing(node) {
        StanzaKind::Typing
    } else {
        StanzaKind::Other
    }
}

/// A message stanza asking for a delivery receipt (or confirming one, which
/// is acknowledged in turn).  Answered before classification so chat
/// messages still reach the processor chain.
pub fn wants_receipt(node: &Node) -> bool {
    node.tag() == "message"
        && (node.find("notify").is_some()
            || node.find("received").is_some()
            || node.find("request").is_some())
}

fn is_presence_update(node: &Node) -> bool {
    node.tag() == "presence"
        && (node.attribute("type") == Some("available")
            || node.attribute("type") == Some("unavailable"))
}

fn is_ping(node: &Node) -> bool {
    node.tag() == "iq"
        && node.attribute("type") == Some("get")
        && node.first_child().map(|c| c.tag()) == Some("ping")
}

fn is_last_seen(node: &Node) -> bool {
    node.find("query")
        .and_then(|q| q.attribute("xmlns"))
        == Some("jabber:iq:last")
}

fn is_not_found(node: &Node) -> bool {
    node.tag() == "iq"
        && node.find("error").and_then(|e| e.attribute("code")) == Some("404")
}

fn is_profile_picture(node: &Node) -> bool {
    node.tag() == "iq" && node.first_child().map(|c| c.tag()) == Some("picture")
}

fn is_chat_message(node: &Node) -> bool {
    node.tag() == "message"
        && node.find("notify").map_or(false, |n| n.attribute("name").is_some())
}

fn is_typing(node: &Node) -> bool {
    node.tag() == "message"
        && matches!(
            node.first_child().map(|c| c.tag()),
            Some("composing") | Some("paused")
        )
}

#[test]
fn test_first_match_wins_over_later_shapes() {
    // Shaped as both a last-seen reply and a 404 error; the earlier rule
    // claims it.
    let node = Node::new("iq")
        .attr("from", "1@s.whatsapp.net")
        .child(Node::new("query").attr("xmlns", "jabber:iq:last").attr("seconds", "120"))
        .child(Node::new("error").attr("code", "404"));
    assert_eq!(classify(&node), StanzaKind::LastSeen);
}

#[test]
fn test_ping_shape() {
    let ping = Node::new("iq")
        .attr("id", "ping-4")
        .attr("type", "get")
        .child(Node::new("ping"));
    assert_eq!(classify(&ping), StanzaKind::Ping);

    let not_ping = Node::new("iq")
        .attr("id", "x")
        .attr("type", "result")
        .child(Node::new("ping"));
    assert_eq!(classify(&not_ping), StanzaKind::Other);
}

#[test]
fn test_chat_message_and_receipt_request() {
    let message = Node::new("message")
        .attr("from", "12345@s.whatsapp.net")
        .attr("id", "A1")
        .child(Node::new("notify").attr("name", "Alice"))
        .child(Node::new("request").attr("xmlns", "urn:xmpp:receipts"))
        .child(Node::new("body").with_data(&b"hi"[..]));
    assert!(wants_receipt(&message));
    assert_eq!(classify(&message), StanzaKind::ChatMessage);
}

#[test]
fn test_delivery_confirmation_outranks_chat() {
    let confirmation = Node::new("message")
        .attr("from", "12345@s.whatsapp.net")
        .attr("id", "A1")
        .attr("t", "1415000000")
        .child(Node::new("received").attr("xmlns", "urn:xmpp:receipts"));
    assert!(wants_receipt(&confirmation));
    assert_eq!(classify(&confirmation), StanzaKind::Delivered);
}

#[test]
fn test_presence_shapes() {
    let available = Node::new("presence")
        .attr("from", "1@s.whatsapp.net")
        .attr("type", "available");
    assert_eq!(classify(&available), StanzaKind::Presence);

    let dirty = Node::new("presence")
        .attr("status", "dirty")
        .child(Node::new("category").attr("name", "groups"));
    assert_eq!(classify(&dirty), StanzaKind::DirtyPresence);
}

#[test]
fn test_typing_shape() {
    let typing = Node::new("message")
        .attr("from", "1@s.whatsapp.net")
        .child(Node::new("composing").attr("xmlns", "http://jabber.org/protocol/chatstates"));
    assert_eq!(classify(&typing), StanzaKind::Typing);
}

#[test]
fn test_unrecognized_is_other() {
    assert_eq!(classify(&Node::new("stream:features")), StanzaKind::Other);
}
