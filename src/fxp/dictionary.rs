use lazy_static::lazy_static;
use std::collections::HashMap;

use super::model::DICT_MAX;

#[cfg(test)]
use super::model::DICT_EXTENDED_BASE;

/// The well-known string table of the wire format.  Tokens 0 through 4 are
/// reserved by the grammar and never carry a string.  Indices below 0xF5
/// encode as a single byte on the wire; the rest use the two-byte extended
/// form.
///
/// The table is fixed by the protocol; both peers must agree on it exactly.
const TOKENS: &[&str] = &[
    "",
    "",
    "",
    "",
    "",
    "account",
    "ack",
    "action",
    "active",
    "add",
    "after",
    "ib",
    "all",
    "allow",
    "apple",
    "audio",
    "auth",
    "author",
    "available",
    "bad-protocol",
    "bad-request",
    "before",
    "Bell.caf",
    "body",
    "Boing.caf",
    "cancel",
    "category",
    "challenge",
    "chat",
    "clean",
    "code",
    "composing",
    "config",
    "conflict",
    "contacts",
    "count",
    "create",
    "creation",
    "default",
    "delay",
    "delete",
    "delivered",
    "deny",
    "digest",
    "DIGEST-MD5-1",
    "DIGEST-MD5-2",
    "dirty",
    "duplicate",
    "elapsed",
    "broadcast",
    "enable",
    "encoding",
    "duplicate_type",
    "error",
    "event",
    "expiration",
    "expired",
    "fail",
    "failure",
    "False",
    "favorites",
    "feature",
    "features",
    "field",
    "first",
    "free",
    "from",
    "g.us",
    "get",
    "Glass.caf",
    "google",
    "group",
    "groups",
    "g_notify",
    "g_sound",
    "Harp.caf",
    "http://etherx.jabber.org/streams",
    "http://jabber.org/protocol/chatstates",
    "id",
    "image",
    "img",
    "inactive",
    "index",
    "internal-server-error",
    "invalid-mechanism",
    "ip",
    "iq",
    "item",
    "item-not-found",
    "user-not-found",
    "jabber:iq:last",
    "jabber:iq:privacy",
    "jabber:x:delay",
    "jabber:x:event",
    "jid",
    "jid-malformed",
    "kind",
    "last",
    "latitude",
    "lc",
    "leave",
    "leave-all",
    "lg",
    "list",
    "location",
    "longitude",
    "max",
    "max_groups",
    "max_participants",
    "max_subject",
    "mechanism",
    "media",
    "message",
    "message_acks",
    "method",
    "microsoft",
    "missing",
    "modify",
    "mute",
    "name",
    "nokia",
    "none",
    "not-acceptable",
    "not-allowed",
    "not-authorized",
    "notification",
    "notify",
    "off",
    "offline",
    "order",
    "owner",
    "owning",
    "paid",
    "participant",
    "participants",
    "participating",
    "password",
    "paused",
    "picture",
    "pin",
    "ping",
    "platform",
    "pop_mean_time",
    "pop_plus_minus",
    "port",
    "presence",
    "preview",
    "probe",
    "proceed",
    "prop",
    "props",
    "p_o",
    "p_t",
    "query",
    "raw",
    "reason",
    "receipt",
    "receipt_acks",
    "received",
    "registration",
    "relay",
    "remote-server-timeout",
    "remove",
    "Replaced by new connection",
    "request",
    "required",
    "resource",
    "resource-constraint",
    "response",
    "result",
    "retry",
    "rim",
    "s.whatsapp.net",
    "s.us",
    "seconds",
    "server",
    "server-error",
    "service-unavailable",
    "set",
    "show",
    "sid",
    "silent",
    "sound",
    "stamp",
    "unsubscribe",
    "stat",
    "status",
    "stream:error",
    "stream:features",
    "subject",
    "subscribe",
    "success",
    "sync",
    "system-shutdown",
    "s_o",
    "s_t",
    "t",
    "text",
    "timeout",
    "TimePassing.caf",
    "timestamp",
    "to",
    "Tri-tone.caf",
    "true",
    "type",
    "unavailable",
    "uri",
    "url",
    "urn:ietf:params:xml:ns:xmpp-sasl",
    "urn:ietf:params:xml:ns:xmpp-stanzas",
    "urn:ietf:params:xml:ns:xmpp-streams",
    "urn:xmpp:delay",
    "urn:xmpp:ping",
    "urn:xmpp:receipts",
    "urn:xmpp:whatsapp",
    "urn:xmpp:whatsapp:account",
    "urn:xmpp:whatsapp:dirty",
    "urn:xmpp:whatsapp:mms",
    "urn:xmpp:whatsapp:push",
    "user",
    "username",
    "value",
    "vcard",
    "version",
    "video",
    "w",
    "w:g",
    "w:p",
    "w:p:r",
    "w:profile:picture",
    "wait",
    "x",
    "xml-not-well-formed",
    "xmlns",
    "xmlns:stream",
    "Xylophone.caf",
    "1",
    "WAUTH-2",
    "leaf",
    "hint",
    "mime_type",
    "hash",
    "nsid",
    "invite",
    "offsets",
    "background",
    "color",
    "key",
    "busy",
    "capability",
    "client",
    "down",
    "exist",
    "expiry",
    "fallback_hostname",
    "fallback_ip",
    "fallback_port",
    "hostname",
    "size",
    "mode",
    "interactive",
    "out",
    "registration_sync",
    "priority",
    "readreceipts",
    "web",
    "groups_v2",
    "privacy",
    "filehash",
    "max_list_recipients",
    "0",
    "voip",
    "webpresence",
    "invalid",
    "kicked",
    "heartbeat",
    "dhash",
    "offsets_v2",
    "gcm",
    "plain",
    "deleted",
    "pkmsg",
    "otp",
    "encrypt",
    "broadcastlist",
    "abt",
    "normal",
];

/// The fixed, bidirectional token<->string table.  Built once at startup and
/// shared read-only by every Decoder and Encoder in the process.
pub struct Dictionary {
    tokens: &'static [&'static str],
    indices: HashMap<&'static str, u16>,
}

impl Dictionary {
    fn new(tokens: &'static [&'static str]) -> Dictionary {
        assert!(tokens.len() <= DICT_MAX as usize);
        let mut indices = HashMap::with_capacity(tokens.len());
        for (index, token) in tokens.iter().enumerate() {
            if !token.is_empty() {
                indices.insert(*token, index as u16);
            }
        }
        Dictionary { tokens, indices }
    }

    /// The string at `index`, or `None` for reserved or out-of-range indices.
    pub fn token(&self, index: u16) -> Option<&'static str> {
        match self.tokens.get(index as usize) {
            Some(token) if !token.is_empty() => Some(token),
            _ => None,
        }
    }

    /// The index of `string`, if it is a well-known string.
    pub fn index_of(&self, string: &str) -> Option<u16> {
        self.indices.get(string).copied()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

lazy_static! {
    /// Process-wide dictionary instance.
    pub static ref DICTIONARY: Dictionary = Dictionary::new(TOKENS);
}

#[test]
fn test_reserved_tokens_resolve_to_nothing() {
    for index in 0..5 {
        assert_eq!(DICTIONARY.token(index), None);
    }
}

#[test]
fn test_roundtrip_lookup() {
    for index in 5..DICTIONARY.len() as u16 {
        if let Some(token) = DICTIONARY.token(index) {
            assert_eq!(DICTIONARY.index_of(token), Some(index));
        }
    }
}

#[test]
fn test_table_reaches_extended_range() {
    // The extended two-byte form must have strings to point at.
    assert!(DICTIONARY.len() > DICT_EXTENDED_BASE as usize);
    assert!(DICTIONARY.token(DICT_EXTENDED_BASE).is_some());
}

#[test]
fn test_out_of_range() {
    assert_eq!(DICTIONARY.token(0x1F5), None);
    assert_eq!(DICTIONARY.index_of("not-a-protocol-string"), None);
}
