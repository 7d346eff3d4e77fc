//!
//! # Walink
//!
//! Walink is a client library for a legacy mobile-messaging service that
//! speaks a compact binary tree-structured stanza protocol over a persistent
//! TCP stream.
//!
//! The crate splits into the wire format (`fxp`: node model, dictionary
//! compression, framing, keystream) and the protocol driver (`fxp_protocol`:
//! the session state machine, stanza classification and dispatch, transport
//! and processor collaborators).
//!
//! ```no_run
//! use std::sync::mpsc::channel;
//! use walink::{Config, Session, TcpTransport};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::from_file("walink.toml".as_ref())?;
//!
//! let (transport_tx, transport_rx) = channel();
//! let (mut session, events) = Session::new(config, TcpTransport::new(transport_tx));
//!
//! std::thread::spawn(move || {
//!     for event in events {
//!         println!("{:?}", event);
//!     }
//! });
//!
//! walink::fxp_protocol::run(&mut session, &transport_rx)?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod fxp;
pub mod fxp_protocol;

pub use config::Config;
pub use fxp::model::Node;
pub use fxp_protocol::event::Event;
pub use fxp_protocol::processor::Processor;
pub use fxp_protocol::transport::{TcpTransport, Transport, TransportEvent};
pub use fxp_protocol::{Session, State};
