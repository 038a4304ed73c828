//! Sealed direct-message unwrapping.
//!
//! Payloads are NIP-44 v2: ECDH shared x-coordinate → HKDF-extract with the
//! `nip44-v2` salt → per-message HKDF-expand keyed by a 32-byte nonce →
//! ChaCha20 body + HMAC-SHA256 tag, base64 envelope. A gift wrap unwraps in
//! two layers: wrap content → seal event, seal content → unsigned rumor.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use secp256k1::{Parity, PublicKey as SecpPublicKey, Scalar, Secp256k1, SecretKey, XOnlyPublicKey};
use sha2::Sha256;

use crate::event::{validate, Event, Kind, PubKey, Rumor};
use crate::keys::Identity;

type HmacSha256 = Hmac<Sha256>;

/// Smallest well-formed payload: version + nonce + padded block + tag.
const MIN_PAYLOAD: usize = 1 + 32 + 2 + 32 + 32;

/// Unwrap failures, counted per relay by the ingest loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum UnwrapError {
    #[error("payload could not be decrypted")]
    DecryptFailed,
    #[error("seal failed validation")]
    InvalidInnerSignature,
    #[error("seal and rumor authors differ")]
    AuthorMismatch,
}

/// Long-lived shared secret between our secret key and a peer's x-only key:
/// the peer's point multiplied by our scalar. The x-coordinate of the shared
/// point is parity-free, so both directions derive the same key.
pub fn conversation_key(secret: &SecretKey, peer: &PubKey) -> Result<[u8; 32], UnwrapError> {
    let xonly = XOnlyPublicKey::from_slice(&peer.0).map_err(|_| UnwrapError::DecryptFailed)?;
    let full = SecpPublicKey::from_x_only_public_key(xonly, Parity::Even);
    let secp = Secp256k1::verification_only();
    let scalar =
        Scalar::from_be_bytes(secret.secret_bytes()).map_err(|_| UnwrapError::DecryptFailed)?;
    let point = full
        .mul_tweak(&secp, &scalar)
        .map_err(|_| UnwrapError::DecryptFailed)?;
    // uncompressed form is 0x04 ‖ x ‖ y
    let shared_x = &point.serialize_uncompressed()[1..33];
    let (prk, _) = Hkdf::<Sha256>::extract(Some(b"nip44-v2"), shared_x);
    let mut key = [0u8; 32];
    key.copy_from_slice(&prk);
    Ok(key)
}

/// Derive the per-message cipher key, cipher nonce, and mac key.
fn message_keys(
    conv_key: &[u8; 32],
    nonce: &[u8],
) -> Result<([u8; 32], [u8; 12], [u8; 32]), UnwrapError> {
    let hk = Hkdf::<Sha256>::from_prk(conv_key).map_err(|_| UnwrapError::DecryptFailed)?;
    let mut okm = [0u8; 76];
    hk.expand(nonce, &mut okm)
        .map_err(|_| UnwrapError::DecryptFailed)?;
    let mut cipher_key = [0u8; 32];
    let mut cipher_nonce = [0u8; 12];
    let mut mac_key = [0u8; 32];
    cipher_key.copy_from_slice(&okm[0..32]);
    cipher_nonce.copy_from_slice(&okm[32..44]);
    mac_key.copy_from_slice(&okm[44..76]);
    Ok((cipher_key, cipher_nonce, mac_key))
}

/// Decrypt one base64 payload with a conversation key.
pub fn decrypt(conv_key: &[u8; 32], payload: &str) -> Result<String, UnwrapError> {
    if payload.starts_with('#') {
        // version flag for non-base64 future formats
        return Err(UnwrapError::DecryptFailed);
    }
    let data = BASE64
        .decode(payload)
        .map_err(|_| UnwrapError::DecryptFailed)?;
    if data.len() < MIN_PAYLOAD || data[0] != 2 {
        return Err(UnwrapError::DecryptFailed);
    }
    let nonce = &data[1..33];
    let mac = &data[data.len() - 32..];
    let ciphertext = &data[33..data.len() - 32];

    let (cipher_key, cipher_nonce, mac_key) = message_keys(conv_key, nonce)?;
    let mut hmac =
        HmacSha256::new_from_slice(&mac_key).map_err(|_| UnwrapError::DecryptFailed)?;
    hmac.update(nonce);
    hmac.update(ciphertext);
    hmac.verify_slice(mac).map_err(|_| UnwrapError::DecryptFailed)?;

    let mut buf = ciphertext.to_vec();
    let mut cipher = ChaCha20::new(&cipher_key.into(), &cipher_nonce.into());
    cipher.apply_keystream(&mut buf);

    let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if len == 0 || 2 + len > buf.len() {
        return Err(UnwrapError::DecryptFailed);
    }
    String::from_utf8(buf[2..2 + len].to_vec()).map_err(|_| UnwrapError::DecryptFailed)
}

/// Unwrap a gift wrap for the viewer: decrypt the wrap into a seal, validate
/// the seal, decrypt the seal into a rumor, and require the seal and rumor
/// to name the same author.
pub fn unwrap_gift_wrap(wrap: &Event, viewer: &Identity) -> Result<Rumor, UnwrapError> {
    let secret = viewer.secret_key();
    let wrap_key = conversation_key(&secret, &wrap.pubkey)?;
    let seal_json = decrypt(&wrap_key, &wrap.content)?;
    let seal: Event =
        serde_json::from_str(&seal_json).map_err(|_| UnwrapError::DecryptFailed)?;
    if seal.kind != Kind::Seal || validate(&seal).is_err() {
        return Err(UnwrapError::InvalidInnerSignature);
    }

    let seal_key = conversation_key(&secret, &seal.pubkey)?;
    let rumor_json = decrypt(&seal_key, &seal.content)?;
    let rumor: Rumor =
        serde_json::from_str(&rumor_json).map_err(|_| UnwrapError::DecryptFailed)?;
    if rumor.pubkey != seal.pubkey {
        return Err(UnwrapError::AuthorMismatch);
    }
    Ok(rumor)
}


#[cfg(test)]
mod tests {
    use super::testutil::{encrypt, gift_wrap, gift_wrap_bad_seal, padded_len, rand_secret};
    use super::*;
    use crate::event::testutil::{pubkey_of, sign_event};
    use crate::event::Tag;
    use secp256k1::{Keypair, Secp256k1};

    fn keypair(seed: u8) -> Keypair {
        Keypair::from_seckey_slice(&Secp256k1::new(), &[seed; 32]).unwrap()
    }

    fn identity(seed: u8) -> Identity {
        Identity::from_secret_hex(&hex::encode([seed; 32])).unwrap()
    }

    #[test]
    fn conversation_key_is_symmetric() {
        let a = keypair(1);
        let b = keypair(2);
        let ka = conversation_key(&SecretKey::from_keypair(&a), &pubkey_of(2)).unwrap();
        let kb = conversation_key(&SecretKey::from_keypair(&b), &pubkey_of(1)).unwrap();
        assert_eq!(ka, kb);
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let key = [7u8; 32];
        for text in ["x", "hello world", &"long ".repeat(200)] {
            let payload = encrypt(&key, text);
            assert_eq!(decrypt(&key, &payload).unwrap(), text);
        }
    }

    #[test]
    fn decrypt_rejects_tampering() {
        let key = [7u8; 32];
        let payload = encrypt(&key, "secret");
        let mut data = BASE64.decode(&payload).unwrap();
        let mid = data.len() / 2;
        data[mid] ^= 0x01;
        let tampered = BASE64.encode(&data);
        assert_eq!(decrypt(&key, &tampered), Err(UnwrapError::DecryptFailed));
        assert_eq!(decrypt(&[8u8; 32], &payload), Err(UnwrapError::DecryptFailed));
        assert_eq!(decrypt(&key, "#v3"), Err(UnwrapError::DecryptFailed));
        assert_eq!(decrypt(&key, "AA=="), Err(UnwrapError::DecryptFailed));
    }

    #[test]
    fn padded_lengths() {
        assert_eq!(padded_len(1), 32);
        assert_eq!(padded_len(32), 32);
        assert_eq!(padded_len(33), 64);
        assert_eq!(padded_len(255), 256);
        assert_eq!(padded_len(257), 320);
        assert_eq!(padded_len(1000), 1024);
    }

    #[test]
    fn unwrap_round_trip() {
        let sender = keypair(5);
        let viewer = identity(6);
        let rumor = Rumor {
            pubkey: pubkey_of(5),
            created_at: 500,
            kind: Kind::ShortTextNote,
            tags: vec![Tag::PubKey {
                key: viewer.public_key(),
                relay_hint: None,
                petname: None,
            }],
            content: "psst".into(),
        };
        let wrap = gift_wrap(&sender, viewer.public_key(), &rumor);
        assert_eq!(wrap.kind, Kind::GiftWrap);
        assert!(validate(&wrap).is_ok());
        let out = unwrap_gift_wrap(&wrap, &viewer).unwrap();
        assert_eq!(out, rumor);
    }

    #[test]
    fn unwrap_rejects_wrong_viewer() {
        let sender = keypair(5);
        let viewer = identity(6);
        let eavesdropper = identity(9);
        let rumor = Rumor {
            pubkey: pubkey_of(5),
            created_at: 1,
            kind: Kind::ShortTextNote,
            tags: vec![],
            content: "psst".into(),
        };
        let wrap = gift_wrap(&sender, viewer.public_key(), &rumor);
        assert_eq!(
            unwrap_gift_wrap(&wrap, &eavesdropper),
            Err(UnwrapError::DecryptFailed)
        );
    }

    #[test]
    fn unwrap_rejects_invalid_seal() {
        let sender = keypair(5);
        let viewer = identity(6);
        let rumor = Rumor {
            pubkey: pubkey_of(5),
            created_at: 1,
            kind: Kind::ShortTextNote,
            tags: vec![],
            content: "psst".into(),
        };
        let wrap = gift_wrap_bad_seal(&sender, viewer.public_key(), &rumor);
        assert_eq!(
            unwrap_gift_wrap(&wrap, &viewer),
            Err(UnwrapError::InvalidInnerSignature)
        );
    }

    #[test]
    fn unwrap_rejects_author_mismatch() {
        // seal signed by sender, rumor claiming someone else
        let sender = keypair(5);
        let viewer = identity(6);
        let rumor = Rumor {
            pubkey: pubkey_of(7),
            created_at: 1,
            kind: Kind::ShortTextNote,
            tags: vec![],
            content: "psst".into(),
        };
        let wrap = gift_wrap(&sender, viewer.public_key(), &rumor);
        assert_eq!(
            unwrap_gift_wrap(&wrap, &viewer),
            Err(UnwrapError::AuthorMismatch)
        );
    }

    #[test]
    fn unwrap_rejects_non_seal_inner_event() {
        let secp = Secp256k1::new();
        let viewer = identity(6);
        let sender = keypair(5);
        // inner event is a plain note, not a seal
        let inner = sign_event(&sender, Kind::ShortTextNote, 1, vec![], "not a seal");
        let ephemeral = Keypair::from_seckey_slice(&secp, &rand_secret()).unwrap();
        let wrap_key =
            conversation_key(&SecretKey::from_keypair(&ephemeral), &viewer.public_key()).unwrap();
        let wrap = sign_event(
            &ephemeral,
            Kind::GiftWrap,
            1,
            vec![],
            &encrypt(&wrap_key, &serde_json::to_string(&inner).unwrap()),
        );
        assert_eq!(
            unwrap_gift_wrap(&wrap, &viewer),
            Err(UnwrapError::InvalidInnerSignature)
        );
    }
}
