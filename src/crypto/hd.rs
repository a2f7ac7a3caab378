//! Mnemonic handling and hierarchical key derivation.
//!
//! The master key is a BIP32 extended private key created from a 24-word
//! BIP39 mnemonic (256-bit entropy, English wordlist) with an empty
//! passphrase, so recovery works from the mnemonic alone. Delegates are
//! children at the fixed all-hardened path `m/1000'/2'/keyIndex'`.
//!
//! Key material crosses module boundaries as the base58 `xprv` text
//! encoding, carried in zeroize-on-drop buffers.

use std::str::FromStr;

use bip39::{Language, Mnemonic};
use bitcoin::bip32::{ChildNumber, Xpriv};
use bitcoin::secp256k1::Secp256k1;
use bitcoin::Network;
use zeroize::Zeroizing;

use crate::crypto::envelope;
use crate::crypto::sensitive::SensitiveBytes;
use crate::error::{KeyError, Result};

pub const MNEMONIC_ENTROPY_BITS: usize = 256;
const MNEMONIC_ENTROPY_BYTES: usize = MNEMONIC_ENTROPY_BITS / 8;
const MAX_GENERATE_ATTEMPTS: u32 = 1000;

// First two hardened levels of the delegate path m/1000'/2'/keyIndex'.
const DELEGATE_PURPOSE: u32 = 1000;
const DELEGATE_SUBPURPOSE: u32 = 2;

/// The BIP32 extended master private key.
pub struct MasterKey {
    xprv: Xpriv,
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(REDACTED)")
    }
}

impl MasterKey {
    pub fn from_seed(seed: &[u8]) -> Result<Self> {
        let xprv = Xpriv::new_master(Network::Bitcoin, seed)
            .map_err(|e| KeyError::Internal(format!("bip32 master derivation: {e}")))?;
        Ok(Self { xprv })
    }

    /// Decode the stored text encoding. Failure after a successful decrypt
    /// means the stored record is corrupt.
    pub fn decode(text: &[u8]) -> Result<Self> {
        let xprv = decode_xprv(text)?;
        Ok(Self { xprv })
    }

    /// The base58 `xprv` text encoding, as bytes in a zeroized buffer.
    pub fn encode(&self) -> SensitiveBytes {
        SensitiveBytes::new(self.xprv.to_string().into_bytes())
    }

    /// Compressed secp256k1 public key (33 bytes): the stable public
    /// identity of this master.
    pub fn public_key(&self) -> Vec<u8> {
        let secp = Secp256k1::new();
        self.xprv
            .private_key
            .public_key(&secp)
            .serialize()
            .to_vec()
    }

    /// Derive the delegate child at `m/1000'/2'/key_index'`.
    pub fn derive_delegate(&self, key_index: u32) -> Result<DelegateKey> {
        let secp = Secp256k1::new();
        let path = [
            hardened(DELEGATE_PURPOSE)?,
            hardened(DELEGATE_SUBPURPOSE)?,
            hardened(key_index)?,
        ];
        let xprv = self
            .xprv
            .derive_priv(&secp, &path)
            .map_err(|e| KeyError::Internal(format!("delegate derivation: {e}")))?;
        Ok(DelegateKey { xprv })
    }
}

/// A delegate child key.
pub struct DelegateKey {
    xprv: Xpriv,
}

impl DelegateKey {
    pub fn decode(text: &[u8]) -> Result<Self> {
        let xprv = decode_xprv(text)?;
        Ok(Self { xprv })
    }

    pub fn encode(&self) -> SensitiveBytes {
        SensitiveBytes::new(self.xprv.to_string().into_bytes())
    }

    /// Raw 32-byte EC private key.
    pub fn secret_bytes(&self) -> SensitiveBytes {
        SensitiveBytes::from_slice(&self.xprv.private_key.secret_bytes())
    }

    /// Compressed secp256k1 public key (33 bytes).
    pub fn public_key(&self) -> Vec<u8> {
        let secp = Secp256k1::new();
        self.xprv
            .private_key
            .public_key(&secp)
            .serialize()
            .to_vec()
    }

    /// Textual serialization of the extended private key.
    pub fn wif(&self) -> Zeroizing<String> {
        Zeroizing::new(self.xprv.to_string())
    }
}

fn hardened(index: u32) -> Result<ChildNumber> {
    ChildNumber::from_hardened_idx(index)
        .map_err(|e| KeyError::Internal(format!("hardened index {index}: {e}")))
}

fn decode_xprv(text: &[u8]) -> Result<Xpriv> {
    let s = std::str::from_utf8(text)
        .map_err(|_| KeyError::BadKey("key material is not valid text".into()))?;
    Xpriv::from_str(s).map_err(|e| KeyError::BadKey(format!("key does not decode: {e}")))
}

/// Generate a fresh mnemonic and master key.
///
/// Each attempt draws 256 bits of entropy, round-trips the phrase the
/// operator will write down, and derives the BIP32 master. The rare BIP32
/// "try again" case and any round-trip failure count against a bound of
/// 1000 attempts.
pub fn generate_master() -> Result<(Mnemonic, MasterKey)> {
    for _ in 0..MAX_GENERATE_ATTEMPTS {
        let mut entropy = Zeroizing::new([0u8; MNEMONIC_ENTROPY_BYTES]);
        envelope::fill_random(&mut entropy[..])?;
        let mnemonic = Mnemonic::from_entropy_in(Language::English, &entropy[..])
            .map_err(|e| KeyError::Internal(format!("mnemonic from entropy: {e}")))?;

        let phrase = Zeroizing::new(mnemonic.to_string());
        let reparsed = match Mnemonic::parse_in(Language::English, phrase.as_str()) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("generated mnemonic failed to re-parse: {e}");
                continue;
            }
        };
        let seed = Zeroizing::new(mnemonic.to_seed(""));
        let seed2 = Zeroizing::new(reparsed.to_seed(""));
        if seed[..] != seed2[..] {
            tracing::warn!("generated mnemonic did not round-trip");
            continue;
        }

        match MasterKey::from_seed(&seed[..]) {
            Ok(master) => return Ok((mnemonic, master)),
            Err(_) => continue,
        }
    }
    Err(KeyError::TooManyAttempts)
}

/// Recompute the master key from a recovery mnemonic. Parse failures pass
/// through as mnemonic errors; a seed that fails BIP32 derivation cannot
/// belong to a key this service generated.
pub fn master_from_mnemonic(words: &[String]) -> Result<MasterKey> {
    let phrase = Zeroizing::new(words.join(" "));
    let mnemonic = Mnemonic::parse_in(Language::English, phrase.as_str())?;
    let seed = Zeroizing::new(mnemonic.to_seed(""));
    MasterKey::from_seed(&seed[..]).map_err(|_| KeyError::WrongMnemonic)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_24_words() {
        let (mnemonic, _) = generate_master().unwrap();
        assert_eq!(mnemonic.words().count(), 24);
    }

    #[test]
    fn mnemonic_recovers_same_master() {
        let (mnemonic, master) = generate_master().unwrap();
        let words: Vec<String> = mnemonic.words().map(str::to_string).collect();
        let recovered = master_from_mnemonic(&words).unwrap();
        assert_eq!(recovered.public_key(), master.public_key());
        assert_eq!(recovered.encode().as_bytes(), master.encode().as_bytes());
    }

    #[test]
    fn encode_decode_round_trip() {
        let (_, master) = generate_master().unwrap();
        let encoded = master.encode();
        assert!(encoded.as_bytes().starts_with(b"xprv"));
        let decoded = MasterKey::decode(encoded.as_bytes()).unwrap();
        assert_eq!(decoded.public_key(), master.public_key());
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            MasterKey::decode(b"not an xprv").unwrap_err(),
            KeyError::BadKey(_)
        ));
        assert!(matches!(
            MasterKey::decode(&[0xFF, 0xFE]).unwrap_err(),
            KeyError::BadKey(_)
        ));
    }

    #[test]
    fn delegate_derivation_is_deterministic() {
        let (_, master) = generate_master().unwrap();
        let a = master.derive_delegate(1).unwrap();
        let b = master.derive_delegate(1).unwrap();
        assert_eq!(a.public_key(), b.public_key());
        assert_eq!(a.secret_bytes().as_bytes(), b.secret_bytes().as_bytes());

        let other = master.derive_delegate(2).unwrap();
        assert_ne!(other.public_key(), a.public_key());
    }

    #[test]
    fn delegate_key_shapes() {
        let (_, master) = generate_master().unwrap();
        let child = master.derive_delegate(7).unwrap();
        assert_eq!(child.secret_bytes().len(), 32);
        assert_eq!(child.public_key().len(), 33);
        assert!(child.wif().starts_with("xprv"));

        let decoded = DelegateKey::decode(child.encode().as_bytes()).unwrap();
        assert_eq!(decoded.public_key(), child.public_key());
    }

    #[test]
    fn bad_mnemonics_map_to_parse_errors() {
        let words = |s: &str| s.split(' ').map(str::to_string).collect::<Vec<_>>();

        let err = master_from_mnemonic(&words("abandon ability")).unwrap_err();
        assert!(matches!(err, KeyError::MnemonicLength));

        let (mnemonic, _) = generate_master().unwrap();
        let mut good: Vec<String> = mnemonic.words().map(str::to_string).collect();
        good[0] = "zzzzzz".into();
        let err = master_from_mnemonic(&good).unwrap_err();
        assert!(matches!(err, KeyError::MnemonicWord));

        // valid words, broken checksum
        let bad = words(
            "abandon abandon abandon abandon abandon abandon abandon abandon \
             abandon abandon abandon abandon abandon abandon abandon abandon \
             abandon abandon abandon abandon abandon abandon abandon abandon",
        );
        let err = master_from_mnemonic(&bad).unwrap_err();
        assert!(matches!(err, KeyError::MnemonicChecksum));
    }
}
