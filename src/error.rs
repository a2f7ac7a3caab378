use thiserror::Error;

/// Error taxonomy for the key manager.
///
/// Authentication failures (`WrongPassword`, `WrongToken`, `BadToken`) never
/// distinguish their underlying cause. `DbConflict` is retried inside the
/// store and only escapes wrapped as a generic `Db` error.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("insufficient entropy available")]
    OutOfEntropy,

    #[error("incorrect password")]
    WrongPassword,

    #[error("invalid or expired token")]
    BadToken,

    #[error("incorrect delegate token")]
    WrongToken,

    #[error("key already exists")]
    KeyExists,

    #[error("record already exists")]
    AlreadyExists,

    #[error("record not found")]
    NotFound,

    #[error("key has not been created")]
    NoKey,

    #[error("too many attempts to generate a key")]
    TooManyAttempts,

    #[error("mnemonic does not match the existing key")]
    WrongMnemonic,

    /// Stored key material decrypted but failed to decode. Data integrity.
    #[error("stored key is corrupt: {0}")]
    BadKey(String),

    #[error("mnemonic has the wrong number of words")]
    MnemonicLength,

    #[error("mnemonic contains a word outside the wordlist")]
    MnemonicWord,

    #[error("mnemonic checksum is invalid")]
    MnemonicChecksum,

    #[error("invalid mnemonic: {0}")]
    Mnemonic(String),

    #[error("database conflict: transaction must be retried")]
    DbConflict,

    #[error("database error: {0}")]
    Db(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<bip39::Error> for KeyError {
    fn from(e: bip39::Error) -> Self {
        match e {
            bip39::Error::BadWordCount(_) => KeyError::MnemonicLength,
            bip39::Error::UnknownWord(_) => KeyError::MnemonicWord,
            bip39::Error::InvalidChecksum => KeyError::MnemonicChecksum,
            other => KeyError::Mnemonic(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, KeyError>;
