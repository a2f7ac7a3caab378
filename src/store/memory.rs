//! In-memory store used by tests.

use std::collections::HashMap;
use std::sync::Mutex;

use super::{DelegateRecord, KeyRecord, Store};
use crate::error::{KeyError, Result};

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    keys: HashMap<u32, KeyRecord>,
    delegates: HashMap<String, DelegateRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| KeyError::Internal("memory store lock poisoned".into()))
    }
}

impl Store for MemoryStore {
    fn set_key(&self, id: u32, rec: &KeyRecord, allow_replace: bool) -> Result<()> {
        let mut inner = self.lock()?;
        if !allow_replace && inner.keys.contains_key(&id) {
            return Err(KeyError::AlreadyExists);
        }
        inner.keys.insert(id, rec.clone());
        Ok(())
    }

    fn get_key(&self, id: u32) -> Result<KeyRecord> {
        self.lock()?.keys.get(&id).cloned().ok_or(KeyError::NotFound)
    }

    fn get_key_pub(&self, id: u32) -> Result<Vec<u8>> {
        self.lock()?
            .keys
            .get(&id)
            .map(|rec| rec.pubkey.clone())
            .ok_or(KeyError::NotFound)
    }

    fn set_delegate(&self, rec: &DelegateRecord) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.delegates.contains_key(&rec.id) {
            return Err(KeyError::AlreadyExists);
        }
        inner.delegates.insert(rec.id.clone(), rec.clone());
        Ok(())
    }

    fn get_delegate_pub(&self, id: &str) -> Result<(Vec<u8>, u32)> {
        self.lock()?
            .delegates
            .get(id)
            .map(|rec| (rec.pubkey.clone(), rec.key_index))
            .ok_or(KeyError::NotFound)
    }

    fn get_delegate_priv(&self, id: &str) -> Result<DelegateRecord> {
        self.lock()?.delegates.get(id).cloned().ok_or(KeyError::NotFound)
    }

    fn get_max_delegate(&self) -> Result<u32> {
        Ok(self
            .lock()?
            .delegates
            .values()
            .map(|rec| rec.key_index)
            .max()
            .unwrap_or(0))
    }

    fn create_delegate(
        &self,
        id: &str,
        build: &mut dyn FnMut(u32) -> Result<DelegateRecord>,
    ) -> Result<DelegateRecord> {
        // the lock is held across build, which makes index assignment atomic
        let mut inner = self.lock()?;
        if inner.delegates.contains_key(id) {
            return Err(KeyError::AlreadyExists);
        }
        let max = inner
            .delegates
            .values()
            .map(|rec| rec.key_index)
            .max()
            .unwrap_or(0);
        let rec = build(max + 1)?;
        inner.delegates.insert(id.to_string(), rec.clone());
        Ok(rec)
    }
}
