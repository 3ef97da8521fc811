//! QUIC-LB Draft 20 connection-id codec (spec §4.A).
//!
//! The teacher hand-rolls its own AES-128 (AES-NI + software S-box fallback,
//! `selenia_core::crypto::aes`) because its charter forbids external crates.
//! That charter doesn't apply here — TLS/QUIC termination is out of scope
//! per spec §1, so the only AES we need is a correct block cipher, which the
//! `aes` crate (RustCrypto, used by `elisplash-paw` for its own block-cipher
//! needs) already provides.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use rand::RngCore;

use crate::error::QlbError;

/// Wire algorithm tag, carried as a config parameter rather than a trait
/// object hierarchy per design note "dynamic dispatch over algorithms is
/// captured by a tagged variant."
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Plaintext,
    /// Draft 20 §5.4: single AES-128-ECB block encryption. Requires
    /// `server_id_len + nonce_len == 16`.
    StreamCipher,
    /// Draft 20 §5.5: four-pass Feistel network. Requires
    /// `4 < server_id_len + nonce_len <= 19` and `!= 16`.
    BlockCipher,
}

/// Rotation id carried in the CID's top three bits. `0..=6` are routable
/// configuration slots; `0b111` is the reserved unroutable namespace.
pub const UNROUTABLE_ROTATION: u8 = 0b111;
pub const MAX_ROTATION: u8 = 6;

/// A single installed CID-encoding configuration (spec §3 "Configuration").
#[derive(Debug, Clone)]
pub struct Config {
    pub rotation_id: u8,
    pub algorithm: Algorithm,
    pub server_id_len: u8,
    pub cid_len: u8,
    pub nonce_len: u8,
    pub key: Option<[u8; 16]>,
    pub length_self_encoding: bool,
}

impl Config {
    /// Validate the invariants of spec §3 and the per-algorithm constraints
    /// of §4.A. Called by the config registry before `install`.
    pub fn validate(&self) -> Result<(), QlbError> {
        if self.rotation_id > MAX_ROTATION {
            return Err(QlbError::ConfigInvalid(format!(
                "rotation_id {} out of range 0..=6",
                self.rotation_id
            )));
        }
        if !(1..=15).contains(&self.server_id_len) {
            return Err(QlbError::ConfigInvalid(format!(
                "server_id_len {} out of range [1,15]",
                self.server_id_len
            )));
        }
        if !(4..=20).contains(&self.cid_len) {
            return Err(QlbError::ConfigInvalid(format!(
                "cid_len {} out of range [4,20]",
                self.cid_len
            )));
        }
        if self.length_self_encoding && (self.cid_len - 1) > 0x1F {
            return Err(QlbError::ConfigInvalid(
                "cid_len - 1 does not fit in 5 self-encoding bits".into(),
            ));
        }

        match self.algorithm {
            Algorithm::Plaintext => {
                let payload = self.cid_len as i16 - 1;
                if (self.server_id_len as i16) > payload {
                    return Err(QlbError::ConfigInvalid(
                        "server_id_len exceeds plaintext payload".into(),
                    ));
                }
            }
            Algorithm::StreamCipher => {
                self.validate_encrypted_common()?;
                let l = self.server_id_len + self.nonce_len;
                if l != 16 {
                    return Err(QlbError::ConfigInvalid(format!(
                        "stream-cipher requires server_id_len + nonce_len == 16, got {}",
                        l
                    )));
                }
                if self.cid_len != 17 {
                    return Err(QlbError::ConfigInvalid(
                        "stream-cipher requires cid_len == 17".into(),
                    ));
                }
            }
            Algorithm::BlockCipher => {
                self.validate_encrypted_common()?;
                let l = self.server_id_len + self.nonce_len;
                if l == 16 || !(5..=19).contains(&l) {
                    return Err(QlbError::ConfigInvalid(format!(
                        "block-cipher requires 4 < server_id_len + nonce_len <= 19 and != 16, got {}",
                        l
                    )));
                }
                if self.cid_len != l + 1 {
                    return Err(QlbError::ConfigInvalid(
                        "cid_len must equal 1 + server_id_len + nonce_len".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    fn validate_encrypted_common(&self) -> Result<(), QlbError> {
        if self.key.is_none() {
            return Err(QlbError::ConfigInvalid(
                "encrypted algorithm requires a 16-byte key".into(),
            ));
        }
        if self.nonce_len < 4 {
            return Err(QlbError::ConfigInvalid(
                "nonce_len must be >= 4 for encrypted algorithms".into(),
            ));
        }
        if self.server_id_len + self.nonce_len > 19 {
            return Err(QlbError::ConfigInvalid(
                "server_id_len + nonce_len must be <= 19".into(),
            ));
        }
        Ok(())
    }
}

/// Result of a successful decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub rotation_id: u8,
    pub server_id: u64,
    pub nonce: Vec<u8>,
}

/// Decode-time failure, richer than [`QlbError`] because the dispatcher
/// needs the raw bytes of an unroutable CID to key the fallback path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    Truncated,
    Unroutable { raw: Vec<u8> },
    AlgorithmMismatch,
}

impl From<CodecError> for QlbError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Truncated => QlbError::Truncated,
            CodecError::Unroutable { .. } => QlbError::UnroutableCid,
            CodecError::AlgorithmMismatch => QlbError::AlgorithmMismatch,
        }
    }
}

fn first_octet(rotation_id: u8, tail5: u8) -> u8 {
    (rotation_id << 5) | (tail5 & 0x1F)
}

fn random_tail5() -> u8 {
    (rand::thread_rng().next_u32() as u8) & 0x1F
}

fn random_bytes(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

fn aes_encrypt_block(key: &[u8; 16], block: &mut [u8; 16]) {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut ga = GenericArray::clone_from_slice(&block[..]);
    cipher.encrypt_block(&mut ga);
    block.copy_from_slice(&ga);
}

fn aes_decrypt_block(key: &[u8; 16], block: &mut [u8; 16]) {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut ga = GenericArray::clone_from_slice(&block[..]);
    cipher.decrypt_block(&mut ga);
    block.copy_from_slice(&ga);
}

/// One Feistel round function: pad `source` to 16 bytes, stamp `len` and
/// `pass` into the last two bytes, AES-encrypt, return the 16-byte digest.
/// Per design note 9: this follows the Draft 20 reference round function,
/// not the "simplified" variant the original source used.
fn feistel_round(key: &[u8; 16], source: &[u8], total_len: u8, pass: u8) -> [u8; 16] {
    let mut padded = [0u8; 16];
    padded[..source.len()].copy_from_slice(source);
    padded[14] = total_len;
    padded[15] = pass;
    aes_encrypt_block(key, &mut padded);
    padded
}

fn xor_into(target: &mut [u8], digest: &[u8]) {
    for (t, d) in target.iter_mut().zip(digest.iter()) {
        *t ^= d;
    }
}

/// Encode `(rotation_id, server_id, nonce)` under `config`. When `nonce` is
/// `None`, a fresh random nonce of the configured length is generated —
/// spec §4.A: "encoding is deterministic given a fresh random nonce."
pub fn encode(config: &Config, server_id: u64, nonce: Option<&[u8]>) -> Result<Vec<u8>, QlbError> {
    config.validate()?;

    let tail5 = if config.length_self_encoding {
        config.cid_len - 1
    } else {
        random_tail5()
    };
    let first = first_octet(config.rotation_id, tail5);

    let mut cid = Vec::with_capacity(config.cid_len as usize);
    cid.push(first);

    match config.algorithm {
        Algorithm::Plaintext => {
            let payload_len = config.cid_len as usize - 1;
            let nonce_len = payload_len - config.server_id_len as usize;
            let sid_bytes = server_id_to_bytes(server_id, config.server_id_len as usize);
            cid.extend_from_slice(&sid_bytes);
            match nonce {
                Some(n) => {
                    if n.len() != nonce_len {
                        return Err(QlbError::ConfigInvalid(
                            "supplied nonce length mismatches configuration".into(),
                        ));
                    }
                    cid.extend_from_slice(n);
                }
                None => cid.extend(random_bytes(nonce_len)),
            }
        }
        Algorithm::StreamCipher => {
            let key = config.key.expect("validated");
            let l = (config.server_id_len + config.nonce_len) as usize;
            let block = build_plaintext_block(server_id, config, nonce, l)?;
            let mut arr = [0u8; 16];
            arr.copy_from_slice(&block);
            aes_encrypt_block(&key, &mut arr);
            cid.extend_from_slice(&arr);
        }
        Algorithm::BlockCipher => {
            let key = config.key.expect("validated");
            let l = (config.server_id_len + config.nonce_len) as usize;
            let plaintext = build_plaintext_block(server_id, config, nonce, l)?;
            let (l1, l2) = halves(l);
            let mut left = plaintext[..l1].to_vec();
            let mut right = plaintext[l1..].to_vec();
            for pass in 1u8..=4 {
                if pass % 2 == 1 {
                    let digest = feistel_round(&key, &right, l as u8, pass);
                    xor_into(&mut left, &digest[..l1]);
                } else {
                    let digest = feistel_round(&key, &left, l as u8, pass);
                    xor_into(&mut right, &digest[..l2]);
                }
            }
            cid.extend_from_slice(&left);
            cid.extend_from_slice(&right);
        }
    }

    debug_assert_eq!(cid.len(), config.cid_len as usize);
    Ok(cid)
}

fn halves(l: usize) -> (usize, usize) {
    let l1 = (l + 1) / 2;
    let l2 = l - l1;
    (l1, l2)
}

/// Big-endian-encode `server_id` into exactly `len` bytes. `len` ranges over
/// the full spec §3 range `[1,15]`, wider than `u64`'s 8 bytes, so this pads
/// with leading zero bytes rather than slicing a fixed 8-byte array (which
/// underflows for `len > 8`).
fn server_id_to_bytes(server_id: u64, len: usize) -> Vec<u8> {
    let full = server_id.to_be_bytes();
    let copy_len = full.len().min(len);
    let mut buf = vec![0u8; len];
    buf[len - copy_len..].copy_from_slice(&full[full.len() - copy_len..]);
    buf
}

fn bytes_to_server_id(bytes: &[u8]) -> u64 {
    let copy_len = bytes.len().min(8);
    let mut buf = [0u8; 8];
    buf[8 - copy_len..].copy_from_slice(&bytes[bytes.len() - copy_len..]);
    u64::from_be_bytes(buf)
}

fn build_plaintext_block(
    server_id: u64,
    config: &Config,
    nonce: Option<&[u8]>,
    l: usize,
) -> Result<Vec<u8>, QlbError> {
    let mut block = Vec::with_capacity(l);
    block.extend_from_slice(&server_id_to_bytes(server_id, config.server_id_len as usize));
    match nonce {
        Some(n) => {
            if n.len() != config.nonce_len as usize {
                return Err(QlbError::ConfigInvalid(
                    "supplied nonce length mismatches configuration".into(),
                ));
            }
            block.extend_from_slice(n);
        }
        None => block.extend(random_bytes(config.nonce_len as usize)),
    }
    Ok(block)
}

/// Decode a wire CID under `config`. The caller (the config registry lookup
/// in the dispatcher) has already matched `config.rotation_id` against the
/// CID's top three bits.
pub fn decode(config: &Config, cid: &[u8]) -> Result<Decoded, CodecError> {
    if cid.is_empty() {
        return Err(CodecError::Truncated);
    }
    let first = cid[0];
    let rotation_id = first >> 5;
    if rotation_id == UNROUTABLE_ROTATION {
        return Err(CodecError::Unroutable { raw: cid.to_vec() });
    }
    if rotation_id != config.rotation_id {
        return Err(CodecError::AlgorithmMismatch);
    }
    if config.length_self_encoding {
        let declared = (first & 0x1F) + 1;
        if declared != config.cid_len {
            return Err(CodecError::AlgorithmMismatch);
        }
    }

    match config.algorithm {
        Algorithm::Plaintext => {
            let payload_len = config.cid_len as usize - 1;
            if cid.len() < 1 + config.server_id_len as usize {
                return Err(CodecError::Truncated);
            }
            if cid.len() < 1 + payload_len {
                return Err(CodecError::Truncated);
            }
            let sid = &cid[1..1 + config.server_id_len as usize];
            let nonce = &cid[1 + config.server_id_len as usize..1 + payload_len];
            Ok(Decoded {
                rotation_id,
                server_id: bytes_to_server_id(sid),
                nonce: nonce.to_vec(),
            })
        }
        Algorithm::StreamCipher => {
            let key = config.key.ok_or(CodecError::AlgorithmMismatch)?;
            let l = (config.server_id_len + config.nonce_len) as usize;
            if cid.len() < 1 + l {
                return Err(CodecError::Truncated);
            }
            let mut arr = [0u8; 16];
            arr.copy_from_slice(&cid[1..1 + 16]);
            aes_decrypt_block(&key, &mut arr);
            let sid = &arr[..config.server_id_len as usize];
            let nonce = &arr[config.server_id_len as usize..l];
            Ok(Decoded {
                rotation_id,
                server_id: bytes_to_server_id(sid),
                nonce: nonce.to_vec(),
            })
        }
        Algorithm::BlockCipher => {
            let key = config.key.ok_or(CodecError::AlgorithmMismatch)?;
            let l = (config.server_id_len + config.nonce_len) as usize;
            if cid.len() < 1 + l {
                return Err(CodecError::Truncated);
            }
            let (l1, l2) = halves(l);
            let mut left = cid[1..1 + l1].to_vec();
            let mut right = cid[1 + l1..1 + l].to_vec();
            for pass in (1u8..=4).rev() {
                if pass % 2 == 1 {
                    let digest = feistel_round(&key, &right, l as u8, pass);
                    xor_into(&mut left, &digest[..l1]);
                } else {
                    let digest = feistel_round(&key, &left, l as u8, pass);
                    xor_into(&mut right, &digest[..l2]);
                }
            }
            let sid = &left[..config.server_id_len as usize];
            let nonce_left = &left[config.server_id_len as usize..];
            let mut nonce = nonce_left.to_vec();
            nonce.extend_from_slice(&right);
            Ok(Decoded {
                rotation_id,
                server_id: bytes_to_server_id(sid),
                nonce,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plaintext_config(length_self_encoding: bool) -> Config {
        Config {
            rotation_id: 1,
            algorithm: Algorithm::Plaintext,
            server_id_len: 2,
            cid_len: 8,
            nonce_len: 0,
            key: None,
            length_self_encoding,
        }
    }

    fn stream_config() -> Config {
        Config {
            rotation_id: 2,
            algorithm: Algorithm::StreamCipher,
            server_id_len: 2,
            cid_len: 17,
            nonce_len: 14,
            key: Some([0x42; 16]),
            length_self_encoding: false,
        }
    }

    fn block_config() -> Config {
        Config {
            rotation_id: 3,
            algorithm: Algorithm::BlockCipher,
            server_id_len: 2,
            cid_len: 12,
            nonce_len: 9,
            key: Some([0x11; 16]),
            length_self_encoding: false,
        }
    }

    // Scenario 1: literal plaintext encode/decode from spec §8.
    #[test]
    fn scenario_plaintext_literal() {
        let cfg = plaintext_config(false);
        let cid = encode(&cfg, 0x007B, None).unwrap();
        assert_eq!(cid.len(), 8);
        assert_eq!(cid[0] >> 5, 1);
        assert_eq!(&cid[1..3], &[0x00, 0x7B]);
        let decoded = decode(&cfg, &cid).unwrap();
        assert_eq!(decoded.server_id, 0x007B);
        assert_eq!(decoded.nonce.len(), 5);
    }

    // Scenario 2: length self-encoding.
    #[test]
    fn scenario_length_self_encoding() {
        let cfg = plaintext_config(true);
        let cid = encode(&cfg, 5, None).unwrap();
        assert_eq!(cid[0], 0x27);
        assert_eq!((cid[0] & 0x1F) + 1, 8);
    }

    // Scenario 3: rotation 0b111 is unroutable.
    #[test]
    fn scenario_unroutable() {
        let cfg = plaintext_config(false);
        let cid = [0xE3, 1, 2, 3, 4, 5, 6, 7];
        let err = decode(&cfg, &cid).unwrap_err();
        assert!(matches!(err, CodecError::Unroutable { .. }));
    }

    #[test]
    fn plaintext_roundtrip_preserves_server_id() {
        for sid in [0u64, 1, 255, 0xFFFF] {
            let cfg = plaintext_config(false);
            let cid = encode(&cfg, sid, None).unwrap();
            let decoded = decode(&cfg, &cid).unwrap();
            assert_eq!(decoded.server_id, sid);
            assert_eq!(decoded.rotation_id, cfg.rotation_id);
        }
    }

    #[test]
    fn stream_cipher_roundtrip() {
        let cfg = stream_config();
        let cid = encode(&cfg, 9001, None).unwrap();
        assert_eq!(cid.len(), 17);
        let decoded = decode(&cfg, &cid).unwrap();
        assert_eq!(decoded.server_id, 9001);
    }

    #[test]
    fn block_cipher_feistel_roundtrip() {
        let cfg = block_config();
        for sid in [0u64, 42, 65535] {
            let cid = encode(&cfg, sid, None).unwrap();
            assert_eq!(cid.len(), cfg.cid_len as usize);
            let decoded = decode(&cfg, &cid).unwrap();
            assert_eq!(decoded.server_id, sid, "roundtrip failed for sid {sid}");
        }
    }

    #[test]
    fn plaintext_roundtrip_with_server_id_len_beyond_eight_bytes() {
        // server_id_len up to 15 is in-spec (spec §3) even though a u64
        // server id only ever occupies the low 8 bytes of it.
        let cfg = Config {
            rotation_id: 1,
            algorithm: Algorithm::Plaintext,
            server_id_len: 12,
            cid_len: 20,
            nonce_len: 0,
            key: None,
            length_self_encoding: false,
        };
        assert!(cfg.validate().is_ok());
        let cid = encode(&cfg, 0xABCD, None).unwrap();
        assert_eq!(cid.len(), 20);
        let decoded = decode(&cfg, &cid).unwrap();
        assert_eq!(decoded.server_id, 0xABCD);
    }

    #[test]
    fn stream_cipher_roundtrip_with_server_id_len_beyond_eight_bytes() {
        let cfg = Config {
            rotation_id: 2,
            algorithm: Algorithm::StreamCipher,
            server_id_len: 12,
            cid_len: 17,
            nonce_len: 4,
            key: Some([0x77; 16]),
            length_self_encoding: false,
        };
        assert!(cfg.validate().is_ok());
        let cid = encode(&cfg, 4242, None).unwrap();
        let decoded = decode(&cfg, &cid).unwrap();
        assert_eq!(decoded.server_id, 4242);
    }

    #[test]
    fn truncated_cid_is_rejected() {
        let cfg = stream_config();
        let err = decode(&cfg, &[0x40, 1, 2]).unwrap_err();
        assert_eq!(err, CodecError::Truncated);
    }

    #[test]
    fn block_cipher_requires_valid_length() {
        let mut cfg = block_config();
        cfg.nonce_len = 100;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn stream_cipher_requires_len_16() {
        let mut cfg = stream_config();
        cfg.nonce_len = 1;
        assert!(cfg.validate().is_err());
    }

    proptest::proptest! {
        #[test]
        fn prop_plaintext_roundtrip(sid in 0u64..0xFFFF, nonce_seed in proptest::collection::vec(0u8..=255, 5)) {
            let cfg = plaintext_config(false);
            let cid = encode(&cfg, sid, Some(&nonce_seed)).unwrap();
            let decoded = decode(&cfg, &cid).unwrap();
            proptest::prop_assert_eq!(decoded.server_id, sid);
            proptest::prop_assert_eq!(decoded.nonce, nonce_seed);
        }

        #[test]
        fn prop_block_cipher_roundtrip(sid in 0u64..0xFFFF) {
            let cfg = block_config();
            let cid = encode(&cfg, sid, None).unwrap();
            proptest::prop_assert_eq!(cid.len(), cfg.cid_len as usize);
            let decoded = decode(&cfg, &cid).unwrap();
            proptest::prop_assert_eq!(decoded.server_id, sid);
        }
    }
}
