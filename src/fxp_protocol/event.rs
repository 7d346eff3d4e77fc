/// Application-level events, emitted in decode order within one inbound
/// batch.  Delivered over the channel handed out by `Session::new`.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The transport came up and the login sequence was sent.
    Connected,
    /// The transport could not be established.
    ConnectError(String),
    /// A transport or server-reported failure.  The session may still be
    /// usable; fatal protocol errors surface as `Err` from the handler
    /// entry points instead.
    Error(String),
    /// Clean end of stream, with reconnection disabled.
    End,
    /// Clean end of stream; a new connection attempt is already underway.
    Reconnect,
    /// Authentication succeeded.
    LoggedIn,
    /// An inbound chat message, extracted by the default processor.
    Message {
        from: String,
        id: String,
        sender_name: String,
        body: String,
        /// Set on group messages: the member the message originated from.
        author: Option<String>,
    },
    /// The peer confirmed delivery of a message we sent.
    MessageDelivered {
        from: String,
        id: String,
        timestamp: String,
    },
    /// A contact became available or unavailable.
    PresenceAvailable { from: String, kind: String },
    /// Reply to a last-seen query, as a unix timestamp.
    LastSeenFound { from: String, timestamp: i64 },
    /// The queried contact has no last-seen record.
    LastSeenNotFound { from: String },
    /// Reply to a profile picture query.
    ProfilePicture {
        from: String,
        preview: bool,
        data: Vec<u8>,
    },
    /// A contact started or stopped typing ("composing" / "paused").
    Typing { from: String, state: String },
}
