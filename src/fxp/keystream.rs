use err_derive::Error;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rc4::consts::U20;
use rc4::{KeyInit, Rc4, StreamCipher};
use sha1::Sha1;

/// Length of the derived session key.
pub const KEY_LEN: usize = 20;

/// Length of the per-frame integrity tag.
pub const TAG_LEN: usize = 4;

/// Keystream bytes discarded after key setup.  The first bytes of an RC4
/// keystream are biased; both peers skip the same amount.
const DEFAULT_DROP: usize = 256;

/// PBKDF2 parameters fixed by the protocol.
const KDF_ROUNDS: u32 = 16;

type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(display = "Frame shorter than its integrity tag")]
    ShortFrame,

    #[error(display = "Integrity tag mismatch")]
    BadTag,
}

/// One direction of the keyed frame transform: an RC4 keystream plus an
/// HMAC-SHA1 integrity tag over the ciphertext.
///
/// The cipher state advances on every call, so a stream is only valid for one
/// connection direction and calls must happen in strict frame order.  An
/// authenticated session owns two of these, one per direction, built from the
/// same derived key.
pub struct KeyStream {
    cipher: Rc4<U20>,
    key: [u8; KEY_LEN],
    verify: bool,
}

impl std::fmt::Debug for KeyStream {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        // Key material stays out of logs.
        f.debug_struct("KeyStream")
            .field("verify", &self.verify)
            .finish()
    }
}

impl KeyStream {
    pub fn new(key: &[u8; KEY_LEN]) -> KeyStream {
        KeyStream::new_with_drop(key, DEFAULT_DROP)
    }

    pub fn new_with_drop(key: &[u8; KEY_LEN], drop: usize) -> KeyStream {
        let mut cipher = Rc4::<U20>::new(key.into());

        let mut filler: Vec<u8> = (0..drop).map(|i| i as u8).collect();
        cipher.apply_keystream(&mut filler);

        KeyStream {
            cipher,
            key: *key,
            verify: false,
        }
    }

    /// Turns on inbound tag verification.  The reference peers never verify,
    /// so this stays off unless the caller asks for strict mode.
    pub fn enable_verification(&mut self) {
        self.verify = true;
    }

    /// Transforms `data` and tags it.  Returns `ciphertext || tag` when
    /// `append_tag` is set, `tag || ciphertext` otherwise (the latter is the
    /// layout of authentication proof payloads).
    ///
    /// Advances the cipher state; call exactly once per logical frame, in
    /// frame order.
    pub fn encode(&mut self, data: &[u8], append_tag: bool) -> Vec<u8> {
        let mut ciphertext = data.to_vec();
        self.cipher.apply_keystream(&mut ciphertext);

        let tag = self.tag(&ciphertext);

        let mut out = Vec::with_capacity(ciphertext.len() + TAG_LEN);
        if append_tag {
            out.extend_from_slice(&ciphertext);
            out.extend_from_slice(&tag);
        } else {
            out.extend_from_slice(&tag);
            out.extend_from_slice(&ciphertext);
        }
        out
    }

    /// Strips the leading 4-byte tag and transforms the remainder.  The tag
    /// is checked only when verification is enabled.
    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < TAG_LEN {
            return Err(Error::ShortFrame);
        }
        let (tag, ciphertext) = data.split_at(TAG_LEN);

        if self.verify && tag != self.tag(ciphertext) {
            return Err(Error::BadTag);
        }

        let mut plaintext = ciphertext.to_vec();
        self.cipher.apply_keystream(&mut plaintext);
        Ok(plaintext)
    }

    fn tag(&self, ciphertext: &[u8]) -> [u8; TAG_LEN] {
        let mut mac = <Hmac<Sha1> as Mac>::new_from_slice(&self.key)
            .expect("HMAC accepts any key length");
        mac.update(ciphertext);
        let digest = mac.finalize().into_bytes();

        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&digest[..TAG_LEN]);
        tag
    }
}

/// Derives the shared session key from the account password and the server's
/// challenge payload.  The password is transported base64-encoded; its raw
/// bytes are the PBKDF2 input and the challenge is the salt.
pub fn derive_key(password: &str, challenge: &[u8]) -> std::result::Result<[u8; KEY_LEN], base64::DecodeError> {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    let secret = STANDARD.decode(password)?;

    let mut key = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha1>(&secret, challenge, KDF_ROUNDS, &mut key);
    Ok(key)
}

#[cfg(test)]
fn test_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    for (i, b) in key.iter_mut().enumerate() {
        *b = i as u8 ^ 0x5A;
    }
    key
}

#[test]
fn test_matched_streams_roundtrip() {
    let mut tx = KeyStream::new(&test_key());
    let mut rx = KeyStream::new(&test_key());

    // Every frame must survive in call order.
    for frame in [&b"first frame"[..], b"second", b"", b"third and last"] {
        let encoded = tx.encode(frame, true);
        assert_eq!(encoded.len(), frame.len() + TAG_LEN);
        // Tag trails the ciphertext; the decoder expects it in front.
        let (ciphertext, tag) = encoded.split_at(frame.len());
        let mut framed = tag.to_vec();
        framed.extend_from_slice(ciphertext);
        assert_eq!(rx.decode(&framed).unwrap(), frame);
    }
}

#[test]
fn test_reordered_streams_disagree() {
    let mut tx = KeyStream::new(&test_key());
    let mut rx = KeyStream::new(&test_key());

    let first = tx.encode(b"frame one", false);
    let second = tx.encode(b"frame two", false);

    // Decoding out of order consumes the wrong keystream span.
    assert_ne!(rx.decode(&second).unwrap(), b"frame two");
    assert_ne!(rx.decode(&first).unwrap(), b"frame one");
}

#[test]
fn test_tag_position() {
    let mut appended = KeyStream::new(&test_key());
    let mut prepended = KeyStream::new(&test_key());

    let tail = appended.encode(b"payload", true);
    let head = prepended.encode(b"payload", false);

    assert_eq!(tail[..tail.len() - TAG_LEN], head[TAG_LEN..]);
    assert_eq!(tail[tail.len() - TAG_LEN..], head[..TAG_LEN]);
}

#[test]
fn test_strict_mode_rejects_mangled_tag() {
    let mut tx = KeyStream::new(&test_key());
    let mut rx = KeyStream::new(&test_key());
    rx.enable_verification();

    let mut framed = tx.encode(b"payload", false);
    framed[0] ^= 0xFF;

    match rx.decode(&framed) {
        Err(Error::BadTag) => {}
        other => panic!("expected BadTag, got {:?}", other),
    }
}

#[test]
fn test_strict_mode_accepts_good_tag() {
    let mut tx = KeyStream::new(&test_key());
    let mut rx = KeyStream::new(&test_key());
    rx.enable_verification();

    let framed = tx.encode(b"payload", false);
    assert_eq!(rx.decode(&framed).unwrap(), b"payload");
}

#[test]
fn test_short_frame() {
    let mut rx = KeyStream::new(&test_key());
    match rx.decode(b"abc") {
        Err(Error::ShortFrame) => {}
        other => panic!("expected ShortFrame, got {:?}", other),
    }
}

#[test]
fn test_derive_key_is_deterministic() {
    let password = {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;
        STANDARD.encode(b"secret bytes")
    };
    let a = derive_key(&password, b"salt one").unwrap();
    let b = derive_key(&password, b"salt one").unwrap();
    let c = derive_key(&password, b"salt two").unwrap();
    assert_eq!(a, b);
    assert_ne!(a, c);
}

#[test]
fn test_derive_key_rejects_bad_base64() {
    assert!(derive_key("not base64!!!", b"salt").is_err());
}
