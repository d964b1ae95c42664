//! In-memory store of completed key material.
//!
//! Keys are indexed by the DKG session id that produced them; refresh
//! sessions reference that id and replace the share in place. Artifacts are
//! retained after completion so later sign and reshare sessions can find
//! them. P1's Paillier material is cached here because generating it is by
//! far the most expensive primitive call.

use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use tss_provider::{DlnParams, KeyShare, PaillierKeypair, RefreshOutcome};

struct KeyEntry {
    share: KeyShare,
    /// Set when the holder reports its secret lost; the refresh setup is
    /// then seeded with a share-loss indicator instead of the secret.
    share_lost: bool,
    paillier: Option<(PaillierKeypair, DlnParams)>,
}

/// Key material held by this coordinator, one entry per generated key.
#[derive(Default)]
pub struct KeyStore {
    keys: Mutex<HashMap<Uuid, KeyEntry>>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, key_id: Uuid, share: KeyShare) {
        self.keys.lock().await.insert(
            key_id,
            KeyEntry {
                share,
                share_lost: false,
                paillier: None,
            },
        );
    }

    pub async fn share(&self, key_id: Uuid) -> Option<KeyShare> {
        let keys = self.keys.lock().await;
        keys.get(&key_id).map(|entry| entry.share.clone())
    }

    /// The share to seed a refresh with: `None` if the secret was lost.
    pub async fn refresh_seed(&self, key_id: Uuid) -> Option<(Option<KeyShare>, String)> {
        let keys = self.keys.lock().await;
        keys.get(&key_id).map(|entry| {
            let seed = if entry.share_lost {
                None
            } else {
                Some(entry.share.clone())
            };
            (seed, entry.share.public_key.clone())
        })
    }

    /// Replace the share after a completed refresh. The Paillier cache stays:
    /// it is bound to the holder, not to the share value.
    pub async fn apply_refresh(&self, key_id: Uuid, outcome: &RefreshOutcome) {
        let mut keys = self.keys.lock().await;
        match keys.get_mut(&key_id) {
            Some(entry) => {
                entry.share = outcome.key_share.clone();
                entry.share_lost = false;
            }
            None => {
                keys.insert(
                    key_id,
                    KeyEntry {
                        share: outcome.key_share.clone(),
                        share_lost: false,
                        paillier: None,
                    },
                );
            }
        }
    }

    /// Simulate share loss (the holder keeps the public artifact).
    pub async fn mark_share_lost(&self, key_id: Uuid) -> bool {
        let mut keys = self.keys.lock().await;
        match keys.get_mut(&key_id) {
            Some(entry) => {
                entry.share_lost = true;
                true
            }
            None => false,
        }
    }

    /// Cached Paillier material for P1, if it was generated before.
    pub async fn cached_paillier(&self, key_id: Uuid) -> Option<(PaillierKeypair, DlnParams)> {
        let keys = self.keys.lock().await;
        keys.get(&key_id).and_then(|entry| entry.paillier.clone())
    }

    /// Cache freshly generated Paillier material for P1.
    pub async fn store_paillier(&self, key_id: Uuid, keypair: PaillierKeypair, dln: DlnParams) {
        let mut keys = self.keys.lock().await;
        if let Some(entry) = keys.get_mut(&key_id) {
            entry.paillier = Some((keypair, dln));
        }
    }
}
