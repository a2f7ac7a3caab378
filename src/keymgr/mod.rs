//! The key lifecycle engine.
//!
//! Exactly one master key is custodied, envelope-encrypted under the
//! operator password at the reserved record id 1. While at least one
//! session is open the decrypted master (xprv text) is cached in memory so
//! delegates can be minted without re-prompting; the cache is zeroized and
//! dropped with the last session.
//!
//! Every password-authenticated operation fetches the stored record fresh
//! and opens it with the supplied password. The cache is never consulted
//! for authorization.

pub mod session;

use std::sync::{Mutex, MutexGuard};

use zeroize::Zeroizing;

use crate::crypto::sensitive::SensitiveBytes;
use crate::crypto::{envelope, hd};
use crate::error::{KeyError, Result};
use crate::store::{DelegateRecord, KeyRecord, Store};
use self::session::SessionTable;

/// Reserved record id of the master key.
pub const MASTER_KEY_ID: u32 = 1;

pub struct KeyMgr<S> {
    store: S,
    sessions: Mutex<SessionTable>,
}

/// A delegate key as handed to the orchestrator: raw EC private key,
/// compressed public key, and the xprv text serialization. `token` is set
/// only when this call created the record.
pub struct Delegate {
    pub secret: SensitiveBytes,
    pub pubkey: Vec<u8>,
    pub wif: Zeroizing<String>,
    pub token: Option<String>,
}

impl<S: Store> KeyMgr<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            sessions: Mutex::new(SessionTable::default()),
        }
    }

    fn sessions(&self) -> Result<MutexGuard<'_, SessionTable>> {
        self.sessions
            .lock()
            .map_err(|_| KeyError::Internal("session lock poisoned".into()))
    }

    /// Fetch the master record and open it with `password`. Missing record
    /// is `NoKey`; any decrypt failure is `WrongPassword`.
    fn open_master(&self, password: &str) -> Result<(SensitiveBytes, Vec<u8>)> {
        let rec = match self.store.get_key(MASTER_KEY_ID) {
            Err(KeyError::NotFound) => return Err(KeyError::NoKey),
            other => other?,
        };
        let secret = envelope::open(&rec.salt, &rec.nonce, &rec.ciphertext, password)?;
        Ok((secret, rec.pubkey))
    }

    fn seal_master(&self, secret: &SensitiveBytes, password: &str, pubkey: Vec<u8>, allow_replace: bool) -> Result<()> {
        let env = envelope::seal(secret.as_bytes(), password)?;
        let rec = KeyRecord {
            salt: env.salt.to_vec(),
            nonce: env.nonce.to_vec(),
            ciphertext: env.ciphertext,
            pubkey,
        };
        self.store.set_key(MASTER_KEY_ID, &rec, allow_replace)
    }

    /// Create the master key. Fails with `KeyExists` if one is already
    /// stored. Returns the mnemonic words; they are shown to the operator
    /// once and never persisted.
    pub fn create_key(&self, password: &str) -> Result<Vec<String>> {
        let (mnemonic, master) = hd::generate_master()?;
        let pubkey = master.public_key();
        let secret = master.encode();
        match self.seal_master(&secret, password, pubkey.clone(), false) {
            Err(KeyError::AlreadyExists) => return Err(KeyError::KeyExists),
            other => other?,
        }
        tracing::info!(pubkey = %hex::encode(&pubkey), "master key created");
        Ok(mnemonic.words().map(str::to_string).collect())
    }

    /// Verify `password`, mint a session, and cache the decrypted master.
    /// Returns the session token and its validity in seconds.
    pub fn login(&self, password: &str) -> Result<(String, u64)> {
        let (secret, _) = self.open_master(password)?;
        // surface a corrupt record now rather than at first delegate mint
        hd::MasterKey::decode(secret.as_bytes())?;
        self.sessions()?.open(secret)
    }

    pub fn roll_token(&self, token: &str) -> Result<(String, u64)> {
        self.sessions()?.roll(token)
    }

    pub fn logout(&self, token: &str) -> Result<()> {
        self.sessions()?.logout(token);
        Ok(())
    }

    /// Re-seal the master under `new_password`. The stored public identity
    /// is unchanged.
    pub fn change_password(&self, password: &str, new_password: &str) -> Result<()> {
        let (secret, pubkey) = self.open_master(password)?;
        self.seal_master(&secret, new_password, pubkey, true)?;
        tracing::info!("password changed");
        Ok(())
    }

    /// Recover from the mnemonic: recompute the master, check its public
    /// key against the stored one, and re-seal under `new_password`.
    pub fn recover_password(&self, words: &[String], new_password: &str) -> Result<()> {
        let stored_pub = match self.store.get_key_pub(MASTER_KEY_ID) {
            Err(KeyError::NotFound) => return Err(KeyError::NoKey),
            other => other?,
        };
        let master = hd::master_from_mnemonic(words)?;
        if master.public_key() != stored_pub {
            return Err(KeyError::WrongMnemonic);
        }
        let secret = master.encode();
        self.seal_master(&secret, new_password, stored_pub, true)?;
        tracing::info!("password recovered from mnemonic");
        Ok(())
    }

    /// Mint a delegate for `id`, authenticated by password. The child is
    /// sealed under a fresh random token, which is the only way to read
    /// the stored private key back.
    pub fn create_delegate(&self, id: &str, password: &str) -> Result<(String, Vec<u8>)> {
        let (secret, _) = self.open_master(password)?;
        let master = hd::MasterKey::decode(secret.as_bytes())?;
        drop(secret);

        let mut minted: Option<String> = None;
        let rec = self.store.create_delegate(id, &mut |key_index| {
            let child = master.derive_delegate(key_index)?;
            let token = session::new_delegate_token()?;
            let encoded = child.encode();
            let env = envelope::seal(encoded.as_bytes(), &token)?;
            let record = DelegateRecord {
                id: id.to_string(),
                salt: env.salt.to_vec(),
                nonce: env.nonce.to_vec(),
                ciphertext: env.ciphertext,
                pubkey: child.public_key(),
                key_index,
            };
            minted = Some(token);
            Ok(record)
        })?;
        let token = minted.ok_or_else(|| KeyError::Internal("delegate token was not minted".into()))?;
        tracing::info!(id, key_index = rec.key_index, "delegate created");
        Ok((token, rec.pubkey))
    }

    pub fn delegate_pub(&self, id: &str) -> Result<Vec<u8>> {
        let (pubkey, _) = self.store.get_delegate_pub(id)?;
        Ok(pubkey)
    }

    /// Open the stored delegate envelope with its token and return the raw
    /// EC private key plus the stored public key.
    pub fn delegate_priv(&self, id: &str, token: &str) -> Result<(SensitiveBytes, Vec<u8>)> {
        let rec = self.store.get_delegate_priv(id)?;
        let secret = match envelope::open(&rec.salt, &rec.nonce, &rec.ciphertext, token) {
            Err(KeyError::WrongPassword) => return Err(KeyError::WrongToken),
            other => other?,
        };
        let child = hd::DelegateKey::decode(secret.as_bytes())?;
        Ok((child.secret_bytes(), rec.pubkey))
    }

    /// Session-authenticated delegate mint. Uses the cached master; the
    /// record is created on first use (reserving the next `key_index`) and
    /// re-derived at its stored index ever after. Never rotates.
    pub fn make_delegate(&self, id: &str, session_token: &str) -> Result<Delegate> {
        let cached = {
            let mut table = self.sessions()?;
            if !table.is_live(session_token) {
                return Err(KeyError::BadToken);
            }
            match table.master() {
                Some(m) => m.clone(),
                None => return Err(KeyError::BadToken),
            }
        };
        let master = hd::MasterKey::decode(cached.as_bytes())?;
        drop(cached);

        match self.store.get_delegate_pub(id) {
            Ok((pubkey, key_index)) => self.rederive(id, &master, key_index, pubkey, None),
            Err(KeyError::NotFound) => {
                let mut minted: Option<String> = None;
                let created = self.store.create_delegate(id, &mut |key_index| {
                    let child = master.derive_delegate(key_index)?;
                    let token = session::new_delegate_token()?;
                    let encoded = child.encode();
                    let env = envelope::seal(encoded.as_bytes(), &token)?;
                    let record = DelegateRecord {
                        id: id.to_string(),
                        salt: env.salt.to_vec(),
                        nonce: env.nonce.to_vec(),
                        ciphertext: env.ciphertext,
                        pubkey: child.public_key(),
                        key_index,
                    };
                    minted = Some(token);
                    Ok(record)
                });
                match created {
                    Ok(rec) => {
                        tracing::info!(id, key_index = rec.key_index, "delegate created via session");
                        self.rederive(id, &master, rec.key_index, rec.pubkey, minted)
                    }
                    // lost a race with a concurrent mint for the same id
                    Err(KeyError::AlreadyExists) => {
                        let (pubkey, key_index) = self.store.get_delegate_pub(id)?;
                        self.rederive(id, &master, key_index, pubkey, None)
                    }
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    fn rederive(
        &self,
        id: &str,
        master: &hd::MasterKey,
        key_index: u32,
        stored_pub: Vec<u8>,
        token: Option<String>,
    ) -> Result<Delegate> {
        let child = master.derive_delegate(key_index)?;
        if child.public_key() != stored_pub {
            return Err(KeyError::BadKey(format!(
                "delegate {id} does not re-derive to its stored public key"
            )));
        }
        Ok(Delegate {
            secret: child.secret_bytes(),
            pubkey: stored_pub,
            wif: child.wif(),
            token,
        })
    }

    #[cfg(test)]
    pub(crate) fn store(&self) -> &S {
        &self.store
    }

    #[cfg(test)]
    pub(crate) fn cached_master_cleared(&self) -> bool {
        !self.sessions().expect("session lock").has_master()
    }
}
