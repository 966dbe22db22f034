//! Generation lifecycle: install, activate, supersede.
//!
//! Each proxy instance carries a numeric generation tag. Installing
//! prefetches the required static assets into the new generation's
//! `static` partition — all of them or none. Activating sweeps away every
//! versioned partition that belongs to a superseded generation; it is the
//! only place generation-based eviction happens, and it must finish before
//! the new generation serves traffic.
//!
//! There is no teardown state: an active generation persists until a newer
//! one installs and activates over it.

use std::collections::HashSet;
use std::fmt;
use std::sync::RwLock;

use thiserror::Error;
use tracing::{info, warn};

use crate::cache::{CacheKey, CacheStore, ResponseSnapshot, RUNTIME_BASE, STATIC_BASE, versioned_name};
use crate::http::{Method, Request};
use crate::upstream::{Fetch, FetchError};

/// Lifecycle states, in order. `Active` is terminal until superseded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Installing,
    Installed,
    Activating,
    Active,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Activating => "activating",
            Self::Active => "active",
        })
    }
}

/// Errors from install and activate.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("install failed fetching required asset {asset}: {source}")]
    InstallFetch {
        asset: String,
        #[source]
        source: FetchError,
    },

    #[error("install failed: required asset {asset} returned status {status}")]
    InstallStatus { asset: String, status: u16 },

    #[error("invalid lifecycle transition: expected {expected}, currently {actual}")]
    InvalidState {
        expected: &'static str,
        actual: LifecycleState,
    },
}

/// Controls one generation's install/activate protocol.
#[derive(Debug)]
pub struct Lifecycle {
    generation: u64,
    state: RwLock<LifecycleState>,
}

impl Lifecycle {
    /// Creates the controller for a new generation, in `Installing` state.
    pub fn new(generation: u64) -> Self {
        Self {
            generation,
            state: RwLock::new(LifecycleState::Installing),
        }
    }

    /// Returns this instance's generation tag.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns `true` once activation has completed.
    pub fn is_active(&self) -> bool {
        self.state() == LifecycleState::Active
    }

    /// Name of this generation's static partition.
    pub fn static_partition(&self) -> String {
        versioned_name(STATIC_BASE, self.generation)
    }

    /// Name of this generation's runtime partition.
    pub fn runtime_partition(&self) -> String {
        versioned_name(RUNTIME_BASE, self.generation)
    }

    fn set_state(&self, new_state: LifecycleState) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        *state = new_state;
    }

    /// Installs this generation: fetches every required asset and stores a
    /// snapshot of each into the new generation's static partition.
    ///
    /// All fetches must succeed before anything is written, so a failed
    /// install leaves no half-populated partition behind and the previous
    /// generation remains authoritative. On success the state advances to
    /// `Installed` and the instance may take over open UI sessions without
    /// waiting for a reload.
    ///
    /// # Errors
    ///
    /// - [`LifecycleError::InvalidState`] if not in `Installing`.
    /// - [`LifecycleError::InstallFetch`] / [`LifecycleError::InstallStatus`]
    ///   if any required asset cannot be fetched successfully.
    pub async fn install(
        &self,
        store: &CacheStore,
        upstream: &dyn Fetch,
        required_assets: &[String],
    ) -> Result<(), LifecycleError> {
        if self.state() != LifecycleState::Installing {
            return Err(LifecycleError::InvalidState {
                expected: "installing",
                actual: self.state(),
            });
        }

        info!(generation = self.generation, assets = required_assets.len(), "install started");

        let mut fetched = Vec::with_capacity(required_assets.len());
        for asset in required_assets {
            let request = Request::new(Method::Get, asset.clone());
            let response =
                upstream
                    .fetch(&request)
                    .await
                    .map_err(|source| LifecycleError::InstallFetch {
                        asset: asset.clone(),
                        source,
                    })?;
            if !response.status().is_success() {
                return Err(LifecycleError::InstallStatus {
                    asset: asset.clone(),
                    status: response.status().as_u16(),
                });
            }
            fetched.push((CacheKey::for_get(asset), ResponseSnapshot::capture(&response)));
        }

        let partition = self.static_partition();
        for (key, snapshot) in fetched {
            store.write(&partition, key, snapshot).await;
        }

        self.set_state(LifecycleState::Installed);
        info!(generation = self.generation, "install complete — ready for takeover");
        Ok(())
    }

    /// Activates this generation: deletes every versioned partition that
    /// does not belong to it.
    ///
    /// Un-versioned partitions (`warm`) are never touched. Re-activating an
    /// already-active generation is a no-op sweep over a clean store.
    /// Returns the number of partitions evicted.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::InvalidState`] if install has not completed.
    pub async fn activate(&self, store: &CacheStore) -> Result<usize, LifecycleError> {
        match self.state() {
            LifecycleState::Installed | LifecycleState::Active => {}
            actual => {
                return Err(LifecycleError::InvalidState {
                    expected: "installed or active",
                    actual,
                });
            }
        }

        self.set_state(LifecycleState::Activating);

        let expected: HashSet<String> =
            HashSet::from([self.static_partition(), self.runtime_partition()]);

        let mut evicted = 0usize;
        for name in store.partition_names() {
            if crate::cache::is_versioned(&name) && !expected.contains(&name) {
                if store.drop_partition(&name).await {
                    warn!(partition = %name, generation = self.generation, "stale partition evicted");
                    evicted += 1;
                }
            }
        }

        self.set_state(LifecycleState::Active);
        info!(generation = self.generation, evicted, "activation complete");
        Ok(evicted)
    }
}
