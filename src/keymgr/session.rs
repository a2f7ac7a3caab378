//! In-memory session table and the cached decrypted master.
//!
//! A session grants its holder the right to mint delegates and to roll
//! itself once. Expiry is lazy: every operation prunes first. The cached
//! master lives exactly as long as the table is non-empty; dropping it
//! zeroizes the buffer.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::crypto::envelope;
use crate::crypto::sensitive::SensitiveBytes;
use crate::error::{KeyError, Result};

pub const SESSION_TTL: Duration = Duration::from_secs(600);
pub const HANDOVER_TTL: Duration = Duration::from_secs(10);
pub const SESSION_TTL_SECS: u64 = SESSION_TTL.as_secs();

const SESSION_TOKEN_LEN: usize = 16;
const DELEGATE_TOKEN_LEN: usize = 32;

struct Session {
    expires: Instant,
    rolled: bool,
}

#[derive(Default)]
pub struct SessionTable {
    sessions: HashMap<String, Session>,
    master: Option<SensitiveBytes>,
}

impl SessionTable {
    /// Drop expired sessions, and the cached master with the last of them.
    pub fn prune(&mut self) {
        let now = Instant::now();
        self.sessions.retain(|_, s| s.expires > now);
        if self.sessions.is_empty() {
            self.master = None;
        }
    }

    /// Record a fresh session and cache the decrypted master, replacing
    /// any previous cached value.
    pub fn open(&mut self, master: SensitiveBytes) -> Result<(String, u64)> {
        self.prune();
        let token = new_session_token()?;
        self.sessions.insert(
            token.clone(),
            Session {
                expires: Instant::now() + SESSION_TTL + HANDOVER_TTL,
                rolled: false,
            },
        );
        self.master = Some(master);
        Ok((token, SESSION_TTL_SECS))
    }

    /// Roll `token`: the old session survives for a short handover window
    /// (concurrent requests may still be using it), and a new session is
    /// born. A token that is unknown, expired, or already rolled is
    /// `BadToken` and is removed.
    pub fn roll(&mut self, token: &str) -> Result<(String, u64)> {
        self.prune();
        let now = Instant::now();
        let can_roll = matches!(
            self.sessions.get(token),
            Some(s) if !s.rolled && s.expires > now
        );
        if !can_roll {
            self.sessions.remove(token);
            if self.sessions.is_empty() {
                self.master = None;
            }
            return Err(KeyError::BadToken);
        }

        let fresh = new_session_token()?;
        if let Some(s) = self.sessions.get_mut(token) {
            s.rolled = true;
            s.expires = now + HANDOVER_TTL;
        }
        self.sessions.insert(
            fresh.clone(),
            Session {
                expires: now + SESSION_TTL + HANDOVER_TTL,
                rolled: false,
            },
        );
        Ok((fresh, SESSION_TTL_SECS))
    }

    pub fn logout(&mut self, token: &str) {
        self.sessions.remove(token);
        self.prune();
    }

    /// True when `token` names an unexpired session. Rolled sessions stay
    /// live until their handover window closes.
    pub fn is_live(&mut self, token: &str) -> bool {
        self.prune();
        let now = Instant::now();
        matches!(self.sessions.get(token), Some(s) if s.expires > now)
    }

    pub fn master(&self) -> Option<&SensitiveBytes> {
        self.master.as_ref()
    }

    #[cfg(test)]
    pub fn has_master(&self) -> bool {
        self.master.is_some()
    }

    #[cfg(test)]
    pub fn force_expire(&mut self, token: &str) {
        if let Some(s) = self.sessions.get_mut(token) {
            s.expires = Instant::now() - Duration::from_secs(1);
        }
    }
}

fn new_session_token() -> Result<String> {
    let mut raw = [0u8; SESSION_TOKEN_LEN];
    envelope::fill_random(&mut raw)?;
    Ok(hex::encode(raw))
}

/// Delegate tokens are longer-lived capabilities than sessions and get
/// twice the entropy.
pub fn new_delegate_token() -> Result<String> {
    let mut raw = [0u8; DELEGATE_TOKEN_LEN];
    envelope::fill_random(&mut raw)?;
    Ok(hex::encode(raw))
}
