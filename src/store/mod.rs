//! Durable persistence for the master and delegate records.
//!
//! `Store` is the capability set the key manager needs; the production
//! implementation is SQLite-backed (`sqlite`), and tests substitute the
//! in-memory `memory` implementation.

pub mod sqlite;

#[cfg(test)]
pub mod memory;

use crate::error::Result;

/// The envelope-sealed master record. `pubkey` is stored in cleartext and
/// is the host's stable public identity.
#[derive(Debug, Clone)]
pub struct KeyRecord {
    pub salt: Vec<u8>,
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub pubkey: Vec<u8>,
}

/// A delegate record, sealed under its per-delegate token. `key_index` is
/// the hardened BIP32 index assigned at creation; indexes are unique and
/// never reused.
#[derive(Debug, Clone)]
pub struct DelegateRecord {
    pub id: String,
    pub salt: Vec<u8>,
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub pubkey: Vec<u8>,
    pub key_index: u32,
}

pub trait Store: Send + Sync {
    /// Insert the key record; with `allow_replace` an existing row is
    /// updated, otherwise a duplicate is `AlreadyExists`.
    fn set_key(&self, id: u32, rec: &KeyRecord, allow_replace: bool) -> Result<()>;

    fn get_key(&self, id: u32) -> Result<KeyRecord>;

    /// Cheap cleartext-pub lookup used by recovery.
    fn get_key_pub(&self, id: u32) -> Result<Vec<u8>>;

    /// Insert a delegate record; duplicate id is `AlreadyExists`.
    fn set_delegate(&self, rec: &DelegateRecord) -> Result<()>;

    fn get_delegate_pub(&self, id: &str) -> Result<(Vec<u8>, u32)>;

    fn get_delegate_priv(&self, id: &str) -> Result<DelegateRecord>;

    /// Highest assigned `key_index`, or 0 when no delegates exist.
    fn get_max_delegate(&self) -> Result<u32>;

    /// Assign the next `key_index` and insert the record `build` produces
    /// for it, atomically. A duplicate id is `AlreadyExists` and nothing
    /// is persisted.
    fn create_delegate(
        &self,
        id: &str,
        build: &mut dyn FnMut(u32) -> Result<DelegateRecord>,
    ) -> Result<DelegateRecord>;
}
