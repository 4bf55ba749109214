// codec.rs -- AES-128-GCM framing of control messages; AES-128-CBC+PKCS#7
// legacy input framing.
//
// Two independent ciphers share one 16-byte key. The control-channel GCM
// codec is stateless per call (the sequence number is passed in and owned
// by the caller, so concurrent sends stay strictly ordered under the
// adapter mutex). The legacy input ciphers are stateful: a single cipher
// context is initialized once and reused across messages, preserving the
// chained-CBC and rolling-IV quirks bit-exactly.

use aes::Aes128;
use aes_gcm::aead::generic_array::typenum::U16;
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{AesGcm, KeyInit};
use cbc::cipher::{BlockEncryptMut, KeyIvInit};

use crate::error::{CoreError, CoreResult};

/// AES-128-GCM with a 16-byte nonce. The wire protocol's IV is 16 bytes,
/// not the usual 12-byte GCM nonce, so this is parameterized explicitly.
type Aes128GcmIv16 = AesGcm<Aes128, U16>;

const GCM_TAG_LEN: usize = 16;
const INNER_HEADER_LEN: usize = 4; // type:u16 + payload_len:u16
const CONTROL_OUTER_TYPE: u16 = 0x0001;
const CONTROL_HEADER_LEN: usize = 4; // outer_type:u16 + length:u16
const CONTROL_LENGTH_FIELD_MIN: usize = 4 + GCM_TAG_LEN + INNER_HEADER_LEN;

/// Derive the 16-byte IV for a control-channel GCM frame: 16 zero bytes
/// with byte 0 set to the low byte of the sequence number. This truncation
/// is a bit-exact server-compatibility quirk, not a bug -- do not widen it.
fn control_iv(seq: u32) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[0] = (seq & 0xFF) as u8;
    iv
}

/// Stateless AES-128-GCM codec for control-channel frames.
pub struct GcmFrameCodec {
    key: [u8; 16],
}

impl GcmFrameCodec {
    pub fn new(key: [u8; 16]) -> Self {
        Self { key }
    }

    /// Encrypt one control message into its wire frame:
    /// `[0x0001][length][seq][tag][ciphertext]`.
    pub fn encrypt(&self, seq: u32, msg_type: u16, payload: &[u8]) -> CoreResult<Vec<u8>> {
        let mut plaintext = Vec::with_capacity(INNER_HEADER_LEN + payload.len());
        plaintext.extend_from_slice(&msg_type.to_le_bytes());
        plaintext.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        plaintext.extend_from_slice(payload);

        let cipher = Aes128GcmIv16::new_from_slice(&self.key)
            .map_err(|e| CoreError::CryptoFail(format!("bad key: {e}")))?;
        let nonce = control_iv(seq);
        let ciphertext = cipher
            .encrypt(&nonce.into(), Payload { msg: &plaintext, aad: &[] })
            .map_err(|e| CoreError::CryptoFail(format!("gcm encrypt: {e}")))?;

        // aes-gcm appends the tag to the ciphertext; the wire format wants
        // it split out into its own field ahead of the ciphertext body.
        if ciphertext.len() < GCM_TAG_LEN {
            return Err(CoreError::CryptoFail("ciphertext shorter than tag".into()));
        }
        let (body, tag) = ciphertext.split_at(ciphertext.len() - GCM_TAG_LEN);

        let length = (4 + GCM_TAG_LEN + body.len()) as u16;
        let mut frame = Vec::with_capacity(CONTROL_HEADER_LEN + length as usize);
        frame.extend_from_slice(&CONTROL_OUTER_TYPE.to_le_bytes());
        frame.extend_from_slice(&length.to_le_bytes());
        frame.extend_from_slice(&seq.to_le_bytes());
        frame.extend_from_slice(tag);
        frame.extend_from_slice(body);
        Ok(frame)
    }

    /// Decrypt a wire frame and transform its V2 plaintext
    /// (`[type][payload_len][payload]`) into a V1 header
    /// (`[type][payload]`), returning `(bytes, new_len)`.
    ///
    /// `Ok(None)` means "drop, already logged" (a non-`0x0001` outer type
    /// while encryption is enabled is dropped and logged rather than
    /// asserted). `Err` covers genuinely malformed or authentication-failed
    /// frames.
    pub fn decrypt(&self, wire: &[u8]) -> CoreResult<Option<(Vec<u8>, usize)>> {
        if wire.len() < CONTROL_HEADER_LEN {
            return Err(CoreError::Runt { got: wire.len(), want: CONTROL_HEADER_LEN });
        }
        let outer_type = u16::from_le_bytes([wire[0], wire[1]]);
        let length = u16::from_le_bytes([wire[2], wire[3]]) as usize;

        if outer_type != CONTROL_OUTER_TYPE {
            tracing::warn!(outer_type, "dropping control frame with unexpected outer type");
            return Ok(None);
        }
        if length < CONTROL_LENGTH_FIELD_MIN {
            return Err(CoreError::Runt { got: length, want: CONTROL_LENGTH_FIELD_MIN });
        }
        if wire.len() < CONTROL_HEADER_LEN + length {
            return Err(CoreError::Runt { got: wire.len(), want: CONTROL_HEADER_LEN + length });
        }

        let seq = u32::from_le_bytes(wire[4..8].try_into().unwrap());
        let tag = &wire[8..8 + GCM_TAG_LEN];
        let body = &wire[8 + GCM_TAG_LEN..CONTROL_HEADER_LEN + length];

        let mut ciphertext_and_tag = Vec::with_capacity(body.len() + GCM_TAG_LEN);
        ciphertext_and_tag.extend_from_slice(body);
        ciphertext_and_tag.extend_from_slice(tag);

        let cipher = Aes128GcmIv16::new_from_slice(&self.key)
            .map_err(|e| CoreError::CryptoFail(format!("bad key: {e}")))?;
        let nonce = control_iv(seq);
        let plaintext = cipher
            .decrypt(&nonce.into(), Payload { msg: &ciphertext_and_tag, aad: &[] })
            .map_err(|e| CoreError::CryptoFail(format!("gcm decrypt/auth: {e}")))?;

        if plaintext.len() < INNER_HEADER_LEN {
            return Err(CoreError::Runt { got: plaintext.len(), want: INNER_HEADER_LEN });
        }

        // V2 -> V1: drop the 2-byte inner payload_len field.
        let mut v1 = Vec::with_capacity(plaintext.len() - 2);
        v1.extend_from_slice(&plaintext[0..2]); // type
        v1.extend_from_slice(&plaintext[4..]); // payload (skip payload_len)
        let new_len = plaintext.len() - 2;
        Ok(Some((v1, new_len)))
    }
}

/// PKCS#7-pad `plaintext` to a whole number of 16-byte blocks (always
/// adding at least one padding byte, per the standard -- a message that's
/// already block-aligned still grows by a full block).
fn pkcs7_pad(plaintext: &[u8]) -> Vec<u8> {
    let pad_len = 16 - (plaintext.len() % 16);
    let mut padded = Vec::with_capacity(plaintext.len() + pad_len);
    padded.extend_from_slice(plaintext);
    padded.extend(std::iter::repeat(pad_len as u8).take(pad_len));
    padded
}

/// Stateful AES-128-CBC encryptor for the legacy (<Gen7) input channel.
///
/// The cipher context is initialized once with the session IV and then
/// reused across subsequent frames without reinitialization: each new
/// message's CBC chain picks up from the previous message's final
/// ciphertext block. This is intentional and must be preserved exactly.
pub struct CbcInputEncryptor {
    state: cbc::Encryptor<Aes128>,
}

impl CbcInputEncryptor {
    pub fn new(key: [u8; 16], iv: [u8; 16]) -> Self {
        Self { state: cbc::Encryptor::<Aes128>::new(&key.into(), &iv.into()) }
    }

    /// Encrypt one message, padding it to a whole number of 16-byte blocks
    /// and advancing the persistent CBC chain: each block (including the
    /// first block of this message) is XORed against the running state
    /// left behind by whatever was encrypted before it, message or not.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> CoreResult<Vec<u8>> {
        let padded = pkcs7_pad(plaintext);
        let mut out = Vec::with_capacity(padded.len());
        for chunk in padded.chunks(16) {
            let arr: [u8; 16] = chunk.try_into().expect("pkcs7_pad always yields 16-byte chunks");
            let mut block = arr.into();
            self.state.encrypt_block_mut(&mut block);
            out.extend_from_slice(&block);
        }
        Ok(out)
    }
}

/// One-shot AES-128-GCM encryptor for the Gen7 non-unified input channel,
/// with the rolling-IV quirk: after a send, the session IV is overwritten
/// with the last 16 bytes of the just-sent ciphertext (when long enough).
/// This imitates a server behavior and must be preserved bit-exactly.
pub struct GcmInputEncryptor {
    key: [u8; 16],
    iv: [u8; 16],
}

impl GcmInputEncryptor {
    pub fn new(key: [u8; 16], iv: [u8; 16]) -> Self {
        Self { key, iv }
    }

    pub fn current_iv(&self) -> [u8; 16] {
        self.iv
    }

    /// Encrypt one message, returning the framed body
    /// `[tag][ciphertext]` (the 4-byte big-endian length prefix is added by
    /// the caller once it knows the full frame length). Rolls the IV as a
    /// side effect of a successful send.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> CoreResult<Vec<u8>> {
        let cipher = Aes128GcmIv16::new_from_slice(&self.key)
            .map_err(|e| CoreError::CryptoFail(format!("bad key: {e}")))?;
        let ciphertext = cipher
            .encrypt(&self.iv.into(), Payload { msg: plaintext, aad: &[] })
            .map_err(|e| CoreError::CryptoFail(format!("gcm encrypt: {e}")))?;

        if ciphertext.len() < GCM_TAG_LEN {
            return Err(CoreError::CryptoFail("ciphertext shorter than tag".into()));
        }
        let (body, tag) = ciphertext.split_at(ciphertext.len() - GCM_TAG_LEN);
        let mut framed = Vec::with_capacity(GCM_TAG_LEN + body.len());
        framed.extend_from_slice(tag);
        framed.extend_from_slice(body);

        if body.len() >= 16 {
            self.iv.copy_from_slice(&body[body.len() - 16..]);
        }

        Ok(framed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    fn key() -> [u8; 16] {
        [0x42; 16]
    }

    #[test]
    fn gcm_roundtrip_various_lengths_and_sequences() {
        let codec = GcmFrameCodec::new(key());
        let mut rng = rand::thread_rng();
        for len in [1usize, 2, 16, 255, 1024, 4096] {
            for seq in [0u32, 1, 255, 256, (1 << 24) - 1] {
                let mut payload = vec![0u8; len];
                rng.fill_bytes(&mut payload);
                let msg_type = 0x0305u16;

                let frame = codec.encrypt(seq, msg_type, &payload).unwrap();
                let (decoded, new_len) = codec.decrypt(&frame).unwrap().unwrap();

                assert_eq!(new_len, decoded.len());
                assert_eq!(new_len, payload.len() + 2);
                assert_eq!(&decoded[0..2], &msg_type.to_le_bytes());
                assert_eq!(&decoded[2..], payload.as_slice());
            }
        }
    }

    #[test]
    fn decrypt_drops_unexpected_outer_type() {
        let codec = GcmFrameCodec::new(key());
        let mut frame = codec.encrypt(0, 0x0305, b"hi").unwrap();
        frame[0] = 0xAB;
        frame[1] = 0xCD;
        let result = codec.decrypt(&frame).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn decrypt_runt_below_header_size() {
        let codec = GcmFrameCodec::new(key());
        let err = codec.decrypt(&[0x01, 0x00]).unwrap_err();
        assert!(matches!(err, CoreError::Runt { .. }));
    }

    #[test]
    fn decrypt_fails_on_tampered_ciphertext() {
        let codec = GcmFrameCodec::new(key());
        let mut frame = codec.encrypt(5, 0x0305, b"hello world").unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        let err = codec.decrypt(&frame).unwrap_err();
        assert!(matches!(err, CoreError::CryptoFail(_)));
    }

    #[test]
    fn cbc_chains_across_messages() {
        let iv = [0u8; 16];
        let mut enc = CbcInputEncryptor::new(key(), iv);
        let first = enc.encrypt(b"abc").unwrap();
        let second = enc.encrypt(b"abc").unwrap();
        // Same plaintext, but chaining from a different running state means
        // the two ciphertexts must differ.
        assert_ne!(first, second);
    }

    #[test]
    fn cbc_pads_arbitrary_lengths_to_block_multiples() {
        for len in [0usize, 1, 15, 16, 17, 31, 32] {
            let mut enc = CbcInputEncryptor::new(key(), [0u8; 16]);
            let plaintext = vec![0x55u8; len];
            let ciphertext = enc.encrypt(&plaintext).unwrap();
            assert_eq!(ciphertext.len() % 16, 0);
            assert!(ciphertext.len() >= len + 1);
        }
    }

    #[test]
    fn gcm_input_rolls_iv_after_send() {
        let mut enc = GcmInputEncryptor::new(key(), [0u8; 16]);
        let before = enc.current_iv();
        let framed = enc.encrypt(b"controller state").unwrap();
        let after = enc.current_iv();
        assert_ne!(before, after);
        assert_eq!(&after[..], &framed[framed.len() - 16..]);
    }
}
