use err_derive::Error;
use log::*;
use std::fs;
use std::sync::mpsc::{channel, Receiver, Sender};

use crate::config::Config;
use crate::fxp::de::{self, Decoded, Decoder};
use crate::fxp::dictionary::DICTIONARY;
use crate::fxp::keystream::{derive_key, KeyStream, KEY_LEN};
use crate::fxp::model::Node;
use crate::fxp::ser::{self, Encoder};

use self::classify::{classify, wants_receipt, StanzaKind};
use self::event::Event;
use self::processor::Processor;
use self::transport::{Transport, TransportEvent};

pub mod classify;
pub mod event;
pub mod processor;
pub mod transport;

/// Authentication mechanism name sent in the auth stanza.
const MECHANISM: &str = "WAUTH-2";

type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(display = "Transport error")]
    TransportError(#[error(source)] transport::Error),

    #[error(display = "Decoding error")]
    DecodingError(#[error(source)] de::Error),

    #[error(display = "Encoding error")]
    EncodingError(#[error(source)] ser::Error),

    #[error(display = "Invalid password encoding")]
    InvalidPassword(#[error(source)] base64::DecodeError),
}

/// Connection lifecycle.  `Closed` is reachable from every other state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Disconnected,
    Connecting,
    StreamOpen,
    Authenticating,
    Ready,
    Closed,
}

/// The protocol state machine.  Owns one Decoder/Encoder pair and the
/// transport, drives connect → stream-open → auth → ready, queues outbound
/// messages until login completes, and classifies and dispatches every
/// inbound stanza.
///
/// All entry points are synchronous; the transport collaborator calls back
/// in via `handle_data`, `handle_error` and `handle_end` (see `run` for the
/// glue loop).  Nothing here is safe for concurrent use from several
/// threads.
pub struct Session<T: Transport> {
    config: Config,
    transport: T,
    reader: Decoder,
    writer: Encoder,
    processors: Vec<Box<dyn Processor>>,
    events: Sender<Event>,
    state: State,
    queue: Vec<(String, Node)>,
    message_num: u32,
    self_address: String,
}

impl<T: Transport> Session<T> {
    /// Builds a session around a transport.  The returned receiver yields
    /// the application events of §events, in decode order.
    pub fn new(config: Config, transport: T) -> (Session<T>, Receiver<Event>) {
        let (events, events_rx) = channel();
        let self_address = jid(&config.msisdn, &config.server, &config.group_server);

        let session = Session {
            config,
            transport,
            reader: Decoder::new(&DICTIONARY),
            writer: Encoder::new(&DICTIONARY),
            processors: processor::default_processors(),
            events,
            state: State::Disconnected,
            queue: Vec::new(),
            message_num: 0,
            self_address,
        };
        (session, events_rx)
    }

    /// Replaces the chat-message processor chain.
    pub fn set_processors(&mut self, processors: Vec<Box<dyn Processor>>) {
        self.processors = processors;
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Opens the transport and, on success, runs the login sequence.
    pub fn connect(&mut self) -> Result<()> {
        self.state = State::Connecting;
        match self.transport.connect(&self.config.host, self.config.port) {
            Ok(()) => self.handle_connected(),
            Err(err) => {
                self.emit(Event::ConnectError(err.to_string()));
                self.state = State::Closed;
                Err(err.into())
            }
        }
    }

    /// Unconditionally tears the transport down.
    pub fn disconnect(&mut self) {
        self.transport.disconnect();
        self.state = State::Closed;
    }

    /// Entry point for transport-connected notifications.
    pub fn handle_connected(&mut self) -> Result<()> {
        debug!("Transport connected, opening stream");
        self.state = State::StreamOpen;
        self.emit(Event::Connected);
        self.login()
    }

    /// Entry point for inbound bytes.  Drains every frame that is complete
    /// in the buffer before returning.  A decode error is fatal: the
    /// transport is torn down and the error propagated.
    pub fn handle_data(&mut self, data: &[u8]) -> Result<()> {
        self.reader.append_input(data);
        loop {
            match self.reader.next_node() {
                Ok(Decoded::NotReady) => return Ok(()),
                Ok(Decoded::Empty) => continue,
                Ok(Decoded::Stanza(node)) => self.process_node(&node)?,
                Err(err) => {
                    error!("Stream desynchronized: {}", err);
                    self.transport.disconnect();
                    self.state = State::Closed;
                    return Err(err.into());
                }
            }
        }
    }

    /// Entry point for transport errors.  Reported, but not a state change;
    /// reconnection only ever follows a clean end of stream.
    pub fn handle_error(&mut self, err: std::io::Error) {
        warn!("Transport error: {}", err);
        let event = if self.state == State::Connecting {
            Event::ConnectError(err.to_string())
        } else {
            Event::Error(err.to_string())
        };
        self.emit(event);
    }

    /// Entry point for end-of-stream.  Re-enters `Connecting` immediately
    /// when the reconnect policy is enabled; there is no backoff and no
    /// attempt cap.
    pub fn handle_end(&mut self) -> Result<()> {
        self.state = State::Closed;
        if self.config.reconnect {
            self.emit(Event::Reconnect);
            self.connect()
        } else {
            self.emit(Event::End);
            Ok(())
        }
    }

    /// Sends `message` as the payload of a chat envelope.  Before the
    /// session is `Ready` the message is queued (without bound; the queue is
    /// drained once on login).
    pub fn send_message<D: Into<Vec<u8>>>(&mut self, to: &str, message: D) -> Result<()> {
        self.send_message_node(to, Node::new("body").with_data(message), None)
    }

    /// Like `send_message` for a caller-built payload stanza, optionally
    /// with a caller-chosen correlation id.
    pub fn send_message_node(
        &mut self,
        to: &str,
        node: Node,
        message_id: Option<String>,
    ) -> Result<()> {
        if self.state != State::Ready {
            trace!("Not logged in yet, queueing message to {}", to);
            self.queue.push((to.to_string(), node));
            return Ok(());
        }

        let id = message_id.unwrap_or_else(|| self.next_message_id("message"));
        let envelope = Node::new("message")
            .attr("to", jid(to, &self.config.server, &self.config.group_server))
            .attr("type", "chat")
            .attr("id", id)
            .attr("t", tstamp().to_string())
            .child(
                Node::new("x")
                    .attr("xmlns", "jabber:x:event")
                    .child(Node::new("server")),
            )
            .child(
                Node::new("notify")
                    .attr("xmlns", "urn:xmpp:whatsapp")
                    .attr("name", self.config.username.clone()),
            )
            .child(Node::new("request").attr("xmlns", "urn:xmpp:receipts"))
            .child(node);

        self.send_node(&envelope)
    }

    /// Sends a keep-alive frame.
    pub fn send_keep_alive(&mut self) -> Result<()> {
        let frame = self.writer.empty_frame()?;
        self.transport.send(&frame)?;
        Ok(())
    }

    fn login(&mut self) -> Result<()> {
        self.reader.set_key(None);
        self.writer.set_key(None);

        let resource = format!(
            "{}-{}-{}",
            self.config.device_type, self.config.app_version, self.config.port
        );
        let open = self.writer.stream_open(&self.config.server, &resource)?;
        self.transport.send(&open)?;

        self.send_node(&self.capabilities_node())?;

        let (auth, writer_key) = self.auth_node()?;
        self.send_node(&auth)?;
        // The fast-path outbound stream goes live only after the auth
        // stanza itself went out in the clear.
        if writer_key.is_some() {
            self.writer.set_key(writer_key);
        }

        self.state = State::Authenticating;
        Ok(())
    }

    /// The auth stanza, plus the outbound keystream when prior challenge
    /// material allows the fast path.
    fn auth_node(&mut self) -> Result<(Node, Option<KeyStream>)> {
        let node = Node::new("auth")
            .attr("mechanism", MECHANISM)
            .attr("user", self.config.msisdn.clone());

        let challenge = fs::read(&self.config.challenge_file).unwrap_or_default();
        if challenge.is_empty() {
            return Ok((node, None));
        }

        debug!("Attempting fast-path authentication");
        let key = derive_key(&self.config.password, &challenge)?;
        let (mut tx, rx) = self.keystream_pair(&key);
        self.reader.set_key(Some(rx));

        let mut material = vec![0u8; 4];
        material.extend_from_slice(self.config.msisdn.as_bytes());
        material.extend_from_slice(&challenge);
        material.extend_from_slice(tstamp().to_string().as_bytes());
        let proof = tx.encode(&material, false);

        Ok((node.with_data(proof), Some(tx)))
    }

    fn process_node(&mut self, node: &Node) -> Result<()> {
        trace!("Inbound stanza:\n{}", node.to_xml());

        if wants_receipt(node) && node.attribute("from") != Some(self.self_address.as_str()) {
            if let Some(receipt) = self.receipt_node(node) {
                self.send_node(&receipt)?;
            }
        }

        match classify(node) {
            StanzaKind::Challenge => self.handle_challenge(node)?,
            StanzaKind::Success => self.handle_success(node)?,
            StanzaKind::Presence => {
                self.emit(Event::PresenceAvailable {
                    from: attr_string(node, "from"),
                    kind: attr_string(node, "type"),
                });
            }
            StanzaKind::DirtyPresence => {
                let clean = self.clean_dirty_node(node);
                self.send_node(&clean)?;
            }
            StanzaKind::Ping => {
                let pong = self.pong_node(node.attribute("id").unwrap_or_default());
                self.send_node(&pong)?;
            }
            StanzaKind::LastSeen => {
                let seconds: i64 = node
                    .find("query")
                    .and_then(|q| q.attribute("seconds"))
                    .and_then(|s| s.parse().ok())
                    .unwrap_or_default();
                self.emit(Event::LastSeenFound {
                    from: attr_string(node, "from"),
                    timestamp: tstamp() - seconds,
                });
            }
            StanzaKind::NotFound => {
                self.emit(Event::LastSeenNotFound {
                    from: attr_string(node, "from"),
                });
            }
            StanzaKind::Failure => {
                warn!("Server reported failure:\n{}", node.to_xml());
                self.emit(Event::Error(node.to_xml()));
            }
            StanzaKind::Delivered => {
                self.emit(Event::MessageDelivered {
                    from: attr_string(node, "from"),
                    id: attr_string(node, "id"),
                    timestamp: attr_string(node, "t"),
                });
            }
            StanzaKind::ProfilePicture => {
                if let Some(picture) = node.find("picture") {
                    self.emit(Event::ProfilePicture {
                        from: attr_string(node, "from"),
                        preview: picture.attribute("type") == Some("preview"),
                        data: picture.data().to_vec(),
                    });
                }
            }
            StanzaKind::ChatMessage => {
                processor::run(&self.processors, node, &self.events);
            }
            StanzaKind::Typing => {
                self.emit(Event::Typing {
                    from: attr_string(node, "from"),
                    state: node
                        .first_child()
                        .map(|c| c.tag().to_string())
                        .unwrap_or_default(),
                });
            }
            StanzaKind::Other => {
                debug!("Ignoring unrecognized stanza <{}>", node.tag());
            }
        }
        Ok(())
    }

    /// Challenge handling: derive the key pair, answer with the keyed proof,
    /// then switch both codec directions over.  The response stanza itself
    /// still goes out in a plaintext frame.
    fn handle_challenge(&mut self, node: &Node) -> Result<()> {
        debug!("Received authentication challenge");
        let key = derive_key(&self.config.password, node.data())?;
        let (mut tx, rx) = self.keystream_pair(&key);

        let mut material = Vec::new();
        material.extend_from_slice(self.config.msisdn.as_bytes());
        material.extend_from_slice(node.data());
        material.extend_from_slice(tstamp().to_string().as_bytes());
        let proof = tx.encode(&material, false);

        let response = Node::new("response")
            .attr("xmlns", "urn:ietf:params:xml:ns:xmpp-sasl")
            .with_data(proof);
        self.send_node(&response)?;

        self.reader.set_key(Some(rx));
        self.writer.set_key(Some(tx));
        Ok(())
    }

    fn handle_success(&mut self, node: &Node) -> Result<()> {
        info!("Logged in as {}", self.self_address);
        self.state = State::Ready;

        if let Err(err) = fs::write(&self.config.challenge_file, node.data()) {
            warn!(
                "Could not persist challenge material to {}: {}",
                self.config.challenge_file.display(),
                err
            );
        }

        self.emit(Event::LoggedIn);
        self.flush_queue()
    }

    /// Drains the pre-login queue in FIFO order.  Runs once per login; the
    /// queue stays empty afterwards.
    fn flush_queue(&mut self) -> Result<()> {
        let queue = std::mem::replace(&mut self.queue, Vec::new());
        for (to, node) in queue {
            self.send_message_node(&to, node, None)?;
        }
        Ok(())
    }

    fn keystream_pair(&self, key: &[u8; KEY_LEN]) -> (KeyStream, KeyStream) {
        let tx = KeyStream::new(key);
        let mut rx = KeyStream::new(key);
        if self.config.strict_integrity {
            rx.enable_verification();
        }
        (tx, rx)
    }

    fn capabilities_node(&self) -> Node {
        Node::new("stream:features")
            .child(Node::new("readreceipts"))
            .child(Node::new("groups_v2"))
            .child(Node::new("privacy"))
            .child(Node::new("presence"))
    }

    /// The receipt for a message stanza: `received` when the peer asked for
    /// one, `ack` when it confirmed one of ours.
    fn receipt_node(&self, node: &Node) -> Option<Node> {
        let confirmation = node.find("received").is_some();
        if !confirmation && node.find("request").is_none() {
            return None;
        }

        let kind = if confirmation { "ack" } else { "received" };
        Some(
            Node::new("message")
                .attr("to", node.attribute("from")?)
                .attr("type", "chat")
                .attr("id", node.attribute("id")?)
                .attr("t", tstamp().to_string())
                .child(Node::new(kind).attr("xmlns", "urn:xmpp:receipts")),
        )
    }

    fn pong_node(&self, id: &str) -> Node {
        Node::new("iq")
            .attr("to", self.config.server.clone())
            .attr("id", id)
            .attr("type", "result")
    }

    /// The cleanup reply to a dirty-presence notice, enumerating the
    /// categories the notice carried.
    fn clean_dirty_node(&mut self, node: &Node) -> Node {
        let mut clean = Node::new("clean").attr("xmlns", "urn:xmpp:whatsapp:dirty");
        for child in node.children() {
            if child.tag() == "category" {
                let mut category = Node::new("category");
                if let Some(name) = child.attribute("name") {
                    category = category.attr("name", name);
                }
                clean = clean.child(category);
            }
        }

        Node::new("iq")
            .attr("id", self.next_message_id("cleardirty"))
            .attr("type", "set")
            .attr("to", self.config.server.clone())
            .child(clean)
    }

    fn send_node(&mut self, node: &Node) -> Result<()> {
        trace!("Outbound stanza:\n{}", node.to_xml());
        let frame = self.writer.node(node)?;
        self.transport.send(&frame)?;
        Ok(())
    }

    fn next_message_id(&mut self, prefix: &str) -> String {
        self.message_num += 1;
        format!("{}-{}-{}", prefix, tstamp(), self.message_num)
    }

    fn emit(&self, event: Event) {
        // A dropped receiver only means nobody is listening anymore.
        let _ = self.events.send(event);
    }
}

fn attr_string(node: &Node, key: &str) -> String {
    node.attribute(key).unwrap_or_default().to_string()
}

/// Qualifies a destination: bare numbers get the server domain, numbers with
/// the group marker get the group domain, full addresses pass through.
fn jid(destination: &str, server: &str, group_server: &str) -> String {
    if destination.contains('@') {
        destination.to_string()
    } else if destination.contains('-') {
        format!("{}@{}", destination, group_server)
    } else {
        format!("{}@{}", destination, server)
    }
}

fn tstamp() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

/// Glue loop wiring a transport's event stream back into the session.
/// Returns when the stream ends for good (reconnect disabled or failed) or
/// on a fatal protocol error.
pub fn run<T: Transport>(
    session: &mut Session<T>,
    transport_events: &Receiver<TransportEvent>,
) -> Result<()> {
    session.connect()?;
    loop {
        match transport_events.recv() {
            Ok(TransportEvent::Data(bytes)) => session.handle_data(&bytes)?,
            Ok(TransportEvent::Error(err)) => session.handle_error(err),
            Ok(TransportEvent::End) => {
                session.handle_end()?;
                if session.state() == State::Closed {
                    return Ok(());
                }
            }
            Err(_) => return Ok(()),
        }
    }
}

#[cfg(test)]
use base64::engine::general_purpose::STANDARD as BASE64;
#[cfg(test)]
use base64::Engine;
#[cfg(test)]
use std::cell::{Cell, RefCell};
#[cfg(test)]
use std::path::PathBuf;
#[cfg(test)]
use std::rc::Rc;

#[cfg(test)]
struct FakeTransport {
    sent: Rc<RefCell<Vec<Vec<u8>>>>,
    connects: Rc<Cell<usize>>,
}

#[cfg(test)]
impl Transport for FakeTransport {
    fn connect(&mut self, _host: &str, _port: u16) -> std::result::Result<(), transport::Error> {
        self.connects.set(self.connects.get() + 1);
        Ok(())
    }

    fn send(&mut self, frame: &[u8]) -> std::result::Result<(), transport::Error> {
        self.sent.borrow_mut().push(frame.to_vec());
        Ok(())
    }

    fn disconnect(&mut self) {}
}

#[cfg(test)]
fn test_config(tag: &str) -> Config {
    let challenge_file: PathBuf =
        std::env::temp_dir().join(format!("walink-test-{}.challenge", tag));
    Config {
        msisdn: "15551230000".to_string(),
        password: BASE64.encode(b"account secret"),
        username: "Tester".to_string(),
        reconnect: false,
        host: "localhost".to_string(),
        port: 5222,
        server: "s.whatsapp.net".to_string(),
        group_server: "g.us".to_string(),
        device_type: "android".to_string(),
        app_version: "1.5".to_string(),
        challenge_file,
        strict_integrity: false,
    }
}

#[cfg(test)]
fn new_session(
    tag: &str,
) -> (
    Session<FakeTransport>,
    Receiver<Event>,
    Rc<RefCell<Vec<Vec<u8>>>>,
    Rc<Cell<usize>>,
) {
    let sent = Rc::new(RefCell::new(Vec::new()));
    let connects = Rc::new(Cell::new(0));
    let transport = FakeTransport {
        sent: sent.clone(),
        connects: connects.clone(),
    };
    let config = test_config(tag);
    let _ = fs::remove_file(&config.challenge_file);
    let (session, events) = Session::new(config, transport);
    (session, events, sent, connects)
}

#[cfg(test)]
fn drain_events(events: &Receiver<Event>) -> Vec<Event> {
    events.try_iter().collect()
}

/// Reparses one outbound frame, stripping the stream preamble and undoing
/// the client-side keystream when one is active.
#[cfg(test)]
fn decode_frame(frame: &[u8], key: Option<&mut KeyStream>) -> Decoded {
    let frame = if frame.starts_with(b"WA") {
        &frame[4..]
    } else {
        frame
    };
    let payload = &frame[3..];

    let plaintext = match key {
        Some(rx) if frame[0] == 0x10 => {
            // Outbound payloads trail their tag; the decoder wants it first.
            let (ciphertext, tag) = payload.split_at(payload.len() - 4);
            let mut reordered = tag.to_vec();
            reordered.extend_from_slice(ciphertext);
            rx.decode(&reordered).unwrap()
        }
        _ => payload.to_vec(),
    };

    let mut framed = vec![0x00];
    framed.extend_from_slice(&(plaintext.len() as u16).to_be_bytes());
    framed.extend_from_slice(&plaintext);

    let mut decoder = Decoder::new(&DICTIONARY);
    decoder.append_input(&framed);
    decoder.next_node().unwrap()
}

#[cfg(test)]
fn expect_stanza(decoded: Decoded) -> Node {
    match decoded {
        Decoded::Stanza(node) => node,
        other => panic!("expected a stanza, got {:?}", other),
    }
}

#[cfg(test)]
fn inbound_plain_frame(node: &Node) -> Vec<u8> {
    Encoder::new(&DICTIONARY).node(node).unwrap()
}

/// Builds a server-style encrypted frame: bit 7 flag, tag in front of the
/// ciphertext.
#[cfg(test)]
fn inbound_encrypted_frame(node: &Node, server_tx: &mut KeyStream) -> Vec<u8> {
    let plain = Encoder::new(&DICTIONARY).node(node).unwrap();
    let sealed = server_tx.encode(&plain[3..], false);

    let mut frame = vec![0x80];
    frame.extend_from_slice(&(sealed.len() as u16).to_be_bytes());
    frame.extend_from_slice(&sealed);
    frame
}

/// Walks a fresh session through connect, challenge and success.  Returns
/// keystreams mirroring the server's two directions, already in sync with
/// the session's.
#[cfg(test)]
fn authenticate(
    session: &mut Session<FakeTransport>,
    sent: &Rc<RefCell<Vec<Vec<u8>>>>,
) -> (KeyStream, KeyStream) {
    let challenge = b"0123456789abcdef".to_vec();

    session.connect().unwrap();
    assert_eq!(session.state(), State::Authenticating);
    let response_index = sent.borrow().len();

    let challenge_node = Node::new("challenge").with_data(challenge.clone());
    session
        .handle_data(&inbound_plain_frame(&challenge_node))
        .unwrap();

    let key = derive_key(&session.config.password, &challenge).unwrap();
    let mut server_rx = KeyStream::new(&key);
    let mut server_tx = KeyStream::new(&key);

    // The response still rides in a plaintext frame; its proof payload moves
    // the keystreams, so replay it through the server-side stream.
    let response = expect_stanza(decode_frame(&sent.borrow()[response_index], None));
    assert_eq!(response.tag(), "response");
    let proof = server_rx.decode(response.data()).unwrap();
    assert!(proof.starts_with(session.config.msisdn.as_bytes()));

    let success = Node::new("success").with_data(&b"next-challenge"[..]);
    session
        .handle_data(&inbound_encrypted_frame(&success, &mut server_tx))
        .unwrap();
    assert_eq!(session.state(), State::Ready);

    (server_tx, server_rx)
}

#[test]
fn test_connect_sends_login_sequence() {
    let (mut session, events, sent, _) = new_session("login-sequence");
    session.connect().unwrap();

    assert_eq!(session.state(), State::Authenticating);
    assert_eq!(drain_events(&events), [Event::Connected]);

    let frames = sent.borrow();
    assert_eq!(frames.len(), 3);

    assert!(frames[0].starts_with(b"WA\x01\x05"));
    let open = expect_stanza(decode_frame(&frames[0], None));
    assert_eq!(open.tag(), "start");
    assert_eq!(open.attribute("to"), Some("s.whatsapp.net"));
    assert_eq!(open.attribute("resource"), Some("android-1.5-5222"));

    let features = expect_stanza(decode_frame(&frames[1], None));
    assert_eq!(features.tag(), "stream:features");
    assert_eq!(features.children().len(), 4);

    let auth = expect_stanza(decode_frame(&frames[2], None));
    assert_eq!(auth.tag(), "auth");
    assert_eq!(auth.attribute("mechanism"), Some("WAUTH-2"));
    assert_eq!(auth.attribute("user"), Some("15551230000"));
    assert!(auth.data().is_empty());
}

#[test]
fn test_queued_messages_flush_in_order_after_login() {
    let (mut session, events, sent, _) = new_session("queue-flush");

    for body in ["one", "two", "three"].iter() {
        session.send_message("15551110001", *body).unwrap();
    }
    assert!(sent.borrow().is_empty());

    let (_, mut server_rx) = authenticate(&mut session, &sent);
    assert!(drain_events(&events).contains(&Event::LoggedIn));

    // stream open, features, auth, response, then the queue in order
    let frames = sent.borrow();
    assert_eq!(frames.len(), 7);

    for (frame, body) in frames[4..].iter().zip(["one", "two", "three"].iter()) {
        let message = expect_stanza(decode_frame(frame, Some(&mut server_rx)));
        assert_eq!(message.tag(), "message");
        assert_eq!(message.attribute("to"), Some("15551110001@s.whatsapp.net"));
        assert_eq!(message.attribute("type"), Some("chat"));
        assert!(message.attribute("id").unwrap().starts_with("message-"));
        assert!(message.find("x").is_some());
        assert!(message.find("notify").is_some());
        assert!(message.find("request").is_some());
        assert_eq!(message.find("body").unwrap().data(), body.as_bytes());
    }
    drop(frames);

    // The queue is spent; later messages go straight out.
    session.send_message("15551110001", "four").unwrap();
    assert_eq!(sent.borrow().len(), 8);
}

#[test]
fn test_ping_produces_exactly_one_pong() {
    let (mut session, events, sent, _) = new_session("ping-pong");
    session.connect().unwrap();
    drain_events(&events);
    let baseline = sent.borrow().len();

    let ping = Node::new("iq")
        .attr("from", "s.whatsapp.net")
        .attr("id", "ping-77")
        .attr("type", "get")
        .child(Node::new("ping").attr("xmlns", "urn:xmpp:ping"));
    session.handle_data(&inbound_plain_frame(&ping)).unwrap();

    let frames = sent.borrow();
    assert_eq!(frames.len(), baseline + 1);
    let pong = expect_stanza(decode_frame(&frames[baseline], None));
    assert_eq!(pong.tag(), "iq");
    assert_eq!(pong.attribute("type"), Some("result"));
    assert_eq!(pong.attribute("id"), Some("ping-77"));
    assert_eq!(pong.attribute("to"), Some("s.whatsapp.net"));
    assert!(pong.children().is_empty());

    assert!(drain_events(&events).is_empty());
}

#[test]
fn test_challenge_switches_outbound_to_encrypted() {
    let (mut session, _events, sent, _) = new_session("challenge-keys");
    session.connect().unwrap();

    let challenge_node = Node::new("challenge").with_data(&b"fresh salt value"[..]);
    session
        .handle_data(&inbound_plain_frame(&challenge_node))
        .unwrap();
    assert_eq!(session.state(), State::Authenticating);

    // The response frame itself is plaintext...
    let response_frame = sent.borrow().last().unwrap().clone();
    assert_eq!(response_frame[0], 0x00);

    // ...but everything after it is keyed.
    session.send_keep_alive().unwrap();
    assert_eq!(sent.borrow().last().unwrap()[0], 0x10);
}

#[test]
fn test_success_persists_challenge_material() {
    let (mut session, _events, sent, _) = new_session("persist");
    let challenge_file = session.config.challenge_file.clone();

    authenticate(&mut session, &sent);

    assert_eq!(fs::read(&challenge_file).unwrap(), b"next-challenge");
    let _ = fs::remove_file(&challenge_file);
}

#[test]
fn test_fast_path_auth_from_persisted_challenge() {
    let (mut session, _events, sent, _) = new_session("fast-path");
    let salt = b"persisted salt 1";
    fs::write(&session.config.challenge_file, &salt[..]).unwrap();

    session.connect().unwrap();

    let frames = sent.borrow();
    let auth = expect_stanza(decode_frame(&frames[2], None));
    assert!(!auth.data().is_empty());

    let key = derive_key(&session.config.password, salt).unwrap();
    let mut server_rx = KeyStream::new(&key);
    let proof = server_rx.decode(auth.data()).unwrap();
    assert!(proof.starts_with(&[0, 0, 0, 0]));
    assert_eq!(&proof[4..4 + 11], session.config.msisdn.as_bytes());
    drop(frames);

    // Outbound keystream went live right after the auth stanza.
    session.send_keep_alive().unwrap();
    assert_eq!(sent.borrow().last().unwrap()[0], 0x10);

    // Inbound keystream was installed when the proof was built.
    let mut server_tx = KeyStream::new(&key);
    let success = Node::new("success").with_data(&b"rotated"[..]);
    session
        .handle_data(&inbound_encrypted_frame(&success, &mut server_tx))
        .unwrap();
    assert_eq!(session.state(), State::Ready);

    let _ = fs::remove_file(&session.config.challenge_file);
}

#[test]
fn test_end_without_reconnect() {
    let (mut session, events, _sent, connects) = new_session("end-plain");
    session.connect().unwrap();
    drain_events(&events);

    session.handle_end().unwrap();
    assert_eq!(session.state(), State::Closed);
    assert_eq!(drain_events(&events), [Event::End]);
    assert_eq!(connects.get(), 1);
}

#[test]
fn test_end_with_reconnect_reenters_immediately() {
    let (mut session, events, _sent, connects) = new_session("end-reconnect");
    session.config.reconnect = true;
    session.connect().unwrap();
    drain_events(&events);

    session.handle_end().unwrap();
    assert_eq!(session.state(), State::Authenticating);
    assert_eq!(drain_events(&events), [Event::Reconnect, Event::Connected]);
    assert_eq!(connects.get(), 2);
}

#[test]
fn test_transport_error_is_reported_not_fatal() {
    let (mut session, events, _sent, _) = new_session("transport-error");
    session.connect().unwrap();
    drain_events(&events);
    let state = session.state();

    session.handle_error(std::io::Error::new(
        std::io::ErrorKind::ConnectionReset,
        "reset by peer",
    ));

    assert_eq!(session.state(), state);
    match drain_events(&events).as_slice() {
        [Event::Error(message)] => assert!(message.contains("reset by peer")),
        other => panic!("expected one error event, got {:?}", other),
    }
}

#[test]
fn test_decode_error_is_fatal() {
    let (mut session, _events, _sent, _) = new_session("decode-error");
    session.connect().unwrap();

    // 0xFB cannot start a stanza
    assert!(session.handle_data(&[0x00, 0x00, 0x01, 0xFB]).is_err());
    assert_eq!(session.state(), State::Closed);
}

#[test]
fn test_dirty_presence_gets_cleaned() {
    let (mut session, _events, sent, _) = new_session("dirty-clean");
    session.connect().unwrap();
    let baseline = sent.borrow().len();

    let dirty = Node::new("presence")
        .attr("from", "s.whatsapp.net")
        .attr("status", "dirty")
        .child(Node::new("category").attr("name", "groups"))
        .child(Node::new("category").attr("name", "contacts"));
    session.handle_data(&inbound_plain_frame(&dirty)).unwrap();

    let frames = sent.borrow();
    let reply = expect_stanza(decode_frame(&frames[baseline], None));
    assert_eq!(reply.tag(), "iq");
    assert_eq!(reply.attribute("type"), Some("set"));
    assert_eq!(reply.attribute("to"), Some("s.whatsapp.net"));

    let clean = reply.find("clean").unwrap();
    assert_eq!(clean.attribute("xmlns"), Some("urn:xmpp:whatsapp:dirty"));
    let names: Vec<_> = clean
        .children()
        .iter()
        .map(|c| c.attribute("name").unwrap())
        .collect();
    assert_eq!(names, ["groups", "contacts"]);
}

#[test]
fn test_chat_message_is_acked_and_forwarded() {
    let (mut session, events, sent, _) = new_session("chat-message");
    session.connect().unwrap();
    drain_events(&events);
    let baseline = sent.borrow().len();

    let message = Node::new("message")
        .attr("from", "15551110002@s.whatsapp.net")
        .attr("id", "A-1")
        .attr("t", "1415000000")
        .child(Node::new("notify").attr("name", "Alice"))
        .child(Node::new("request").attr("xmlns", "urn:xmpp:receipts"))
        .child(Node::new("body").with_data(&b"hello"[..]));
    session.handle_data(&inbound_plain_frame(&message)).unwrap();

    let frames = sent.borrow();
    let receipt = expect_stanza(decode_frame(&frames[baseline], None));
    assert_eq!(receipt.tag(), "message");
    assert_eq!(receipt.attribute("to"), Some("15551110002@s.whatsapp.net"));
    assert_eq!(receipt.attribute("id"), Some("A-1"));
    assert_eq!(receipt.first_child().unwrap().tag(), "received");

    assert_eq!(
        drain_events(&events),
        [Event::Message {
            from: "15551110002@s.whatsapp.net".to_string(),
            id: "A-1".to_string(),
            sender_name: "Alice".to_string(),
            body: "hello".to_string(),
            author: None,
        }]
    );
}

#[test]
fn test_delivery_confirmation_is_acked_and_emitted() {
    let (mut session, events, sent, _) = new_session("delivered");
    session.connect().unwrap();
    drain_events(&events);
    let baseline = sent.borrow().len();

    let confirmation = Node::new("message")
        .attr("from", "15551110002@s.whatsapp.net")
        .attr("id", "message-1415000000-1")
        .attr("t", "1415000123")
        .child(Node::new("received").attr("xmlns", "urn:xmpp:receipts"));
    session
        .handle_data(&inbound_plain_frame(&confirmation))
        .unwrap();

    let frames = sent.borrow();
    let ack = expect_stanza(decode_frame(&frames[baseline], None));
    assert_eq!(ack.first_child().unwrap().tag(), "ack");

    assert_eq!(
        drain_events(&events),
        [Event::MessageDelivered {
            from: "15551110002@s.whatsapp.net".to_string(),
            id: "message-1415000000-1".to_string(),
            timestamp: "1415000123".to_string(),
        }]
    );
}

#[test]
fn test_presence_lastseen_picture_typing_events() {
    let (mut session, events, _sent, _) = new_session("event-grabbag");
    session.connect().unwrap();
    drain_events(&events);

    let available = Node::new("presence")
        .attr("from", "15551110003@s.whatsapp.net")
        .attr("type", "available");
    session.handle_data(&inbound_plain_frame(&available)).unwrap();

    let last_seen = Node::new("iq")
        .attr("from", "15551110003@s.whatsapp.net")
        .attr("type", "result")
        .child(
            Node::new("query")
                .attr("xmlns", "jabber:iq:last")
                .attr("seconds", "120"),
        );
    session.handle_data(&inbound_plain_frame(&last_seen)).unwrap();

    let not_found = Node::new("iq")
        .attr("from", "15551110004@s.whatsapp.net")
        .attr("type", "error")
        .child(Node::new("error").attr("code", "404"));
    session.handle_data(&inbound_plain_frame(&not_found)).unwrap();

    let picture = Node::new("iq")
        .attr("from", "15551110003@s.whatsapp.net")
        .attr("type", "result")
        .child(
            Node::new("picture")
                .attr("type", "preview")
                .with_data(&[0xFF, 0xD8, 0xFF][..]),
        );
    session.handle_data(&inbound_plain_frame(&picture)).unwrap();

    let typing = Node::new("message")
        .attr("from", "15551110003@s.whatsapp.net")
        .child(Node::new("composing"));
    session.handle_data(&inbound_plain_frame(&typing)).unwrap();

    let emitted = drain_events(&events);
    assert_eq!(emitted.len(), 5);
    assert_eq!(
        emitted[0],
        Event::PresenceAvailable {
            from: "15551110003@s.whatsapp.net".to_string(),
            kind: "available".to_string(),
        }
    );
    match &emitted[1] {
        Event::LastSeenFound { from, timestamp } => {
            assert_eq!(from, "15551110003@s.whatsapp.net");
            assert!(*timestamp <= tstamp() - 120);
        }
        other => panic!("expected LastSeenFound, got {:?}", other),
    }
    assert_eq!(
        emitted[2],
        Event::LastSeenNotFound {
            from: "15551110004@s.whatsapp.net".to_string(),
        }
    );
    assert_eq!(
        emitted[3],
        Event::ProfilePicture {
            from: "15551110003@s.whatsapp.net".to_string(),
            preview: true,
            data: vec![0xFF, 0xD8, 0xFF],
        }
    );
    assert_eq!(
        emitted[4],
        Event::Typing {
            from: "15551110003@s.whatsapp.net".to_string(),
            state: "composing".to_string(),
        }
    );
}

#[test]
fn test_destination_resolution() {
    let (mut session, _events, sent, _) = new_session("destinations");
    let (_, mut server_rx) = authenticate(&mut session, &sent);
    let baseline = sent.borrow().len();

    session.send_message("15551110005", "direct").unwrap();
    session.send_message("15551110005-1400000000", "group").unwrap();
    session.send_message("someone@other.example", "custom").unwrap();

    let frames = sent.borrow();
    let expected = [
        "15551110005@s.whatsapp.net",
        "15551110005-1400000000@g.us",
        "someone@other.example",
    ];
    for (frame, to) in frames[baseline..].iter().zip(expected.iter()) {
        let message = expect_stanza(decode_frame(frame, Some(&mut server_rx)));
        assert_eq!(message.attribute("to"), Some(*to));
    }
}
