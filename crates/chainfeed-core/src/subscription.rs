//! Subscription versions and the two-slot lifecycle of an app.
//!
//! An app holds at most two live versions: the `current` one, serving
//! traffic, and a pending `new` one being prepared for an upgrade.
//!
//! ```text
//! Created ──start──► Started ◄──start/pause──► Paused
//!                       │                        │
//!                       └────────stop────────────┴──► Stopped (slot cleared)
//! ```

use serde::{Deserialize, Serialize};

use crate::error::FeedError;
use crate::keys::AppId;
use crate::manifest::SubscriptionManifest;

// ─── VersionId ────────────────────────────────────────────────────────────────

/// Monotonic (per app) subscription version number, rendered `v1`, `v2`, …
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionId(pub u64);

impl std::fmt::Display for VersionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

// ─── SubscriptionStatus ──────────────────────────────────────────────────────

/// Lifecycle status of one subscription version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionStatus {
    Created,
    Started,
    Paused,
    Stopped,
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Started => write!(f, "started"),
            Self::Paused => write!(f, "paused"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// A manifest snapshot plus its lifecycle status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionVersion {
    pub version: VersionId,
    pub manifest: SubscriptionManifest,
    pub status: SubscriptionStatus,
}

/// Read model returned by `get_subscription`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSubscription {
    pub current_version: Option<SubscriptionVersion>,
    pub new_version: Option<SubscriptionVersion>,
}

/// Result of adding a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Added {
    pub version: VersionId,
    /// The pending version that was displaced, when replacement is enabled.
    pub replaced: Option<SubscriptionVersion>,
}

/// Result of a status transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub previous: SubscriptionStatus,
    /// The version after the transition (status `Stopped` for a stop).
    pub version: SubscriptionVersion,
}

// ─── AppSubscriptionState ─────────────────────────────────────────────────────

/// The two subscription slots of one app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSubscriptionState {
    pub app_id: AppId,
    pub current_version: Option<SubscriptionVersion>,
    pub new_version: Option<SubscriptionVersion>,
    /// Highest version number ever handed out.
    last_version: u64,
}

impl AppSubscriptionState {
    pub fn new(app_id: impl Into<AppId>) -> Self {
        Self {
            app_id: app_id.into(),
            current_version: None,
            new_version: None,
            last_version: 0,
        }
    }

    /// Attach `manifest` as a new version in the first free slot.
    ///
    /// With both slots taken this fails with `VersionSlotFull`, unless
    /// `replace_pending` is set, in which case the pending version is
    /// displaced and returned in [`Added::replaced`].
    pub fn add(
        &mut self,
        manifest: SubscriptionManifest,
        replace_pending: bool,
    ) -> Result<Added, FeedError> {
        manifest.validate()?;
        if self.current_version.is_some() && self.new_version.is_some() && !replace_pending {
            return Err(FeedError::VersionSlotFull {
                app_id: self.app_id.clone(),
            });
        }

        self.last_version += 1;
        let version = SubscriptionVersion {
            version: VersionId(self.last_version),
            manifest,
            status: SubscriptionStatus::Created,
        };
        let id = version.version;

        if self.current_version.is_none() {
            self.current_version = Some(version);
            return Ok(Added { version: id, replaced: None });
        }
        let replaced = self.new_version.replace(version);
        Ok(Added { version: id, replaced })
    }

    /// Replace the manifest of `version`, returning the previous snapshot.
    pub fn update_manifest(
        &mut self,
        version: VersionId,
        manifest: SubscriptionManifest,
    ) -> Result<SubscriptionVersion, FeedError> {
        manifest.validate()?;
        let slot = self.slot_mut(version)?;
        let previous = slot.clone();
        slot.manifest = manifest;
        Ok(previous)
    }

    /// Promote the pending version. Returns the retired current version.
    pub fn upgrade(&mut self) -> Result<Option<SubscriptionVersion>, FeedError> {
        let promoted = self.new_version.take().ok_or_else(|| FeedError::NoPendingVersion {
            app_id: self.app_id.clone(),
        })?;
        Ok(self.current_version.replace(promoted))
    }

    /// Created | Paused → Started. Restarting a started version is allowed.
    pub fn start(&mut self, version: VersionId) -> Result<Transition, FeedError> {
        let slot = self.slot_mut(version)?;
        let previous = slot.status;
        match previous {
            SubscriptionStatus::Created | SubscriptionStatus::Paused | SubscriptionStatus::Started => {
                slot.status = SubscriptionStatus::Started;
                Ok(Transition { previous, version: slot.clone() })
            }
            SubscriptionStatus::Stopped => Err(invalid(version, previous, "start")),
        }
    }

    /// Started → Paused.
    pub fn pause(&mut self, version: VersionId) -> Result<Transition, FeedError> {
        let slot = self.slot_mut(version)?;
        let previous = slot.status;
        if previous != SubscriptionStatus::Started {
            return Err(invalid(version, previous, "pause"));
        }
        slot.status = SubscriptionStatus::Paused;
        Ok(Transition { previous, version: slot.clone() })
    }

    /// Started | Paused → Stopped. The slot is cleared; stopping the current
    /// version while a pending one exists moves the pending one into the
    /// current slot so `new_version` never outlives `current_version`.
    pub fn stop(&mut self, version: VersionId) -> Result<Transition, FeedError> {
        let previous = self.slot_mut(version)?.status;
        if !matches!(previous, SubscriptionStatus::Started | SubscriptionStatus::Paused) {
            return Err(invalid(version, previous, "stop"));
        }

        let removed = if self.is_current(version) {
            let removed = self.current_version.take();
            self.current_version = self.new_version.take();
            removed
        } else {
            self.new_version.take()
        };
        let mut removed = removed.ok_or_else(|| self.not_found(version))?;

        removed.status = SubscriptionStatus::Stopped;
        Ok(Transition { previous, version: removed })
    }

    /// Status of `version`.
    pub fn status(&self, version: VersionId) -> Result<SubscriptionStatus, FeedError> {
        self.version(version)
            .map(|v| v.status)
            .ok_or_else(|| self.not_found(version))
    }

    /// The live version with id `version`, if any.
    pub fn version(&self, version: VersionId) -> Option<&SubscriptionVersion> {
        [self.current_version.as_ref(), self.new_version.as_ref()]
            .into_iter()
            .flatten()
            .find(|v| v.version == version)
    }

    /// Snapshot of both slots.
    pub fn subscription(&self) -> AppSubscription {
        AppSubscription {
            current_version: self.current_version.clone(),
            new_version: self.new_version.clone(),
        }
    }

    fn is_current(&self, version: VersionId) -> bool {
        self.current_version.as_ref().is_some_and(|v| v.version == version)
    }

    fn slot_mut(&mut self, version: VersionId) -> Result<&mut SubscriptionVersion, FeedError> {
        let err = self.not_found(version);
        [self.current_version.as_mut(), self.new_version.as_mut()]
            .into_iter()
            .flatten()
            .find(|v| v.version == version)
            .ok_or(err)
    }

    fn not_found(&self, version: VersionId) -> FeedError {
        FeedError::VersionNotFound {
            app_id: self.app_id.clone(),
            version,
        }
    }
}

fn invalid(version: VersionId, from: SubscriptionStatus, action: &'static str) -> FeedError {
    FeedError::InvalidTransition { version, from, action }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
