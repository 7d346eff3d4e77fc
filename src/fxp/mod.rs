//! The wire format is a stream of frames, each a 1-byte flag (bit 7 marks an
//! encrypted inbound payload; clients stamp 0x10 on their own encrypted
//! frames) followed by a big-endian 16-bit payload length.  A zero-length
//! payload is a keep-alive.
//!
//! A payload holds one serialized stanza: a list-size marker, a tag, a run of
//! key/value attribute strings, and then either a list of child stanzas or a
//! raw byte payload.  Strings are compressed against a fixed dictionary of
//! well-known protocol strings; `user@server` addresses and arbitrary
//! length-prefixed bytes have their own token forms.
//!
//! After authentication each direction of the stream is transformed by an
//! RC4 keystream with a truncated HMAC-SHA1 tag per frame.

pub mod model;

pub mod dictionary;

pub mod de;
pub mod keystream;
pub mod ser;
