//! Asset Index
//!
//! Derives, on demand, which assets each component type needs for the loaded
//! opus and how a component's reported cache differs from that. Everything
//! here is a pure function of its inputs.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::opus::{AssetRef, ComponentType, CueAction, Opus};

/// An asset as a component reports holding it
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReportedAsset {
    /// Manifest key
    pub id: AssetRef,
    /// Checksum of the component's cached copy, if it computed one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl ReportedAsset {
    /// Asset reported without a checksum
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: AssetRef::new(id),
            checksum: None,
        }
    }

    /// Attach a checksum
    #[must_use]
    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }
}

/// What a component must change to match the opus
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetDiff {
    /// Required but not reported
    pub add: BTreeSet<AssetRef>,
    /// Reported but not required
    pub remove: BTreeSet<AssetRef>,
    /// Reported with a checksum that differs from the opus
    pub update: BTreeSet<AssetRef>,
}

impl AssetDiff {
    /// Whether the component already matches
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty() && self.update.is_empty()
    }

    /// Total number of entries across all three sets
    #[must_use]
    pub fn len(&self) -> usize {
        self.add.len() + self.remove.len() + self.update.len()
    }
}

/// Stateless queries over an opus's asset usage
pub struct AssetIndex;

impl AssetIndex {
    /// Union of the assets of every cue step targeting `component_type`
    #[must_use]
    pub fn required_assets(opus: &Opus, component_type: &ComponentType) -> BTreeSet<AssetRef> {
        steps(opus)
            .filter(|step| &step.target == component_type)
            .filter_map(|step| step.asset.clone())
            .collect()
    }

    /// Component types whose cue steps use `asset`
    #[must_use]
    pub fn targets_of(opus: &Opus, asset: &AssetRef) -> BTreeSet<ComponentType> {
        steps(opus)
            .filter(|step| step.asset.as_ref() == Some(asset))
            .map(|step| step.target.clone())
            .collect()
    }

    /// Required assets for every declared component type
    #[must_use]
    pub fn by_component_type(opus: &Opus) -> BTreeMap<ComponentType, BTreeSet<AssetRef>> {
        opus.component_types()
            .iter()
            .map(|t| (t.clone(), Self::required_assets(opus, t)))
            .collect()
    }

    /// Compare what a component reports against what its type requires
    ///
    /// An asset lands in `update` only when both sides carry a checksum and
    /// they differ; a missing checksum on either side is taken as a match.
    #[must_use]
    pub fn diff(
        opus: &Opus,
        component_type: &ComponentType,
        reported: &[ReportedAsset],
    ) -> AssetDiff {
        let required = Self::required_assets(opus, component_type);
        let reported: BTreeMap<&AssetRef, Option<&str>> = reported
            .iter()
            .map(|r| (&r.id, r.checksum.as_deref()))
            .collect();

        let mut diff = AssetDiff::default();
        for id in &required {
            match reported.get(id) {
                None => {
                    diff.add.insert(id.clone());
                }
                Some(Some(have)) => {
                    let want = opus.asset(id).and_then(|spec| spec.checksum.as_deref());
                    if want.is_some_and(|want| want != *have) {
                        diff.update.insert(id.clone());
                    }
                }
                Some(None) => {}
            }
        }
        for id in reported.keys() {
            if !required.contains(*id) {
                diff.remove.insert((*id).clone());
            }
        }
        diff
    }
}

fn steps(opus: &Opus) -> impl Iterator<Item = &CueAction> {
    opus.scenes()
        .iter()
        .flat_map(|scene| &scene.cues)
        .flat_map(|cue| &cue.actions)
}
