//! Config Registry (spec §4.B): up to seven concurrently installed CID
//! configurations keyed by 3-bit rotation id, with one designated active.
//!
//! Grounded on the teacher's `selenia_core::ratelimit` (a single
//! mutex-guarded state struct mutated under one short critical section per
//! call), adapted to a `RwLock` reader/writer split directly from spec §5's
//! "many readers, rare writer" requirement for shared registries.

use std::sync::RwLock;

use tracing::{info, warn};

use crate::codec::{Config, MAX_ROTATION};
use crate::error::{QlbError, QlbResult};

const SLOTS: usize = (MAX_ROTATION as usize) + 1;

#[derive(Default)]
struct Inner {
    slots: [Option<Config>; SLOTS],
    active: Option<u8>,
}

/// Holds at most seven [`Config`]s. `install` followed by `activate` is
/// observed atomically by any concurrent `get` because both run under the
/// same write-lock critical section.
pub struct ConfigRegistry {
    inner: RwLock<Inner>,
}

impl Default for ConfigRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Install (or replace) a configuration. Does not change the active
    /// rotation. Rejects on constraint violation per spec §3/§4.A.
    pub fn install(&self, config: Config) -> QlbResult<()> {
        config.validate()?;
        let idx = config.rotation_id as usize;
        let mut guard = self.inner.write().unwrap();
        info!(rotation_id = config.rotation_id, "installing quic-lb config");
        guard.slots[idx] = Some(config);
        Ok(())
    }

    /// Designate `rotation_id` as active. Returns `UnknownRotation` if it
    /// was never installed.
    pub fn activate(&self, rotation_id: u8) -> QlbResult<()> {
        let mut guard = self.inner.write().unwrap();
        if guard.slots[rotation_id as usize].is_none() {
            return Err(QlbError::UnknownRotation(rotation_id));
        }
        guard.active = Some(rotation_id);
        info!(rotation_id, "activated quic-lb rotation");
        Ok(())
    }

    /// Fetch an installed config by rotation id, active or not — an
    /// in-flight CID encoded under a retired-but-still-installed rotation
    /// must keep decoding.
    pub fn get(&self, rotation_id: u8) -> Option<Config> {
        let guard = self.inner.read().unwrap();
        guard.slots.get(rotation_id as usize).cloned().flatten()
    }

    /// The currently active rotation id, if any has been activated yet.
    pub fn current(&self) -> Option<u8> {
        self.inner.read().unwrap().active
    }

    /// The currently active config, convenience over `current` + `get`.
    pub fn current_config(&self) -> Option<Config> {
        let rotation = self.current()?;
        self.get(rotation)
    }

    /// All installed configs, for the admin listing endpoint.
    pub fn all(&self) -> Vec<Config> {
        self.inner
            .read()
            .unwrap()
            .slots
            .iter()
            .filter_map(|s| s.clone())
            .collect()
    }

    /// Remove a rotation's config. Spec §4.B: "retire only when no record
    /// in the connection tracker references the rotation" — callers must
    /// check that precondition themselves; this just performs the removal
    /// and logs a warning if it wasn't installed.
    pub fn retire(&self, rotation_id: u8) {
        let mut guard = self.inner.write().unwrap();
        let idx = rotation_id as usize;
        if guard.slots[idx].take().is_none() {
            warn!(rotation_id, "retire called on unknown rotation");
        }
        if guard.active == Some(rotation_id) {
            guard.active = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Algorithm;

    fn cfg(rotation_id: u8) -> Config {
        Config {
            rotation_id,
            algorithm: Algorithm::Plaintext,
            server_id_len: 2,
            cid_len: 8,
            nonce_len: 0,
            key: None,
            length_self_encoding: false,
        }
    }

    #[test]
    fn install_then_activate_is_observable() {
        let reg = ConfigRegistry::new();
        reg.install(cfg(1)).unwrap();
        reg.activate(1).unwrap();
        assert_eq!(reg.current(), Some(1));
        assert!(reg.get(1).is_some());
    }

    #[test]
    fn stale_rotation_still_decodes_after_rotation() {
        // Scenario 4 from spec §8: rot=1 stays installed after rot=2 activates.
        let reg = ConfigRegistry::new();
        reg.install(cfg(1)).unwrap();
        reg.activate(1).unwrap();
        reg.install(cfg(2)).unwrap();
        reg.activate(2).unwrap();
        assert_eq!(reg.current(), Some(2));
        assert!(reg.get(1).is_some(), "rotation 1 must remain installed");
    }

    #[test]
    fn activate_unknown_rotation_errors() {
        let reg = ConfigRegistry::new();
        assert!(matches!(
            reg.activate(3),
            Err(QlbError::UnknownRotation(3))
        ));
    }

    #[test]
    fn reinstalling_identical_config_is_idempotent() {
        let reg = ConfigRegistry::new();
        reg.install(cfg(1)).unwrap();
        reg.install(cfg(1)).unwrap();
        assert_eq!(reg.all().len(), 1);
    }
}
