//! Opus Model
//!
//! The opus is the declarative show script: an ordered list of scenes, each an
//! ordered list of cues, plus a flat asset manifest and the set of component
//! types the show expects to drive.
//!
//! # Design Philosophy
//!
//! The opus is validated exactly once, at the boundary. [`parse`] and [`load`]
//! either return a fully well-formed [`Opus`] or a [`ValidationError`] listing
//! every violation found, so an operator can fix the script in one pass.
//! Nothing downstream ever re-checks references: if a cue names an asset, the
//! asset is in the manifest.
//!
//! # Document Format
//!
//! ```yaml
//! version: 1
//! components: [audio, lighting]
//! assets:
//!   thunder: { path: sounds/thunder.wav, checksum: 9f2c }
//! scenes:
//!   - id: act-1
//!     cues:
//!       - id: lights-down
//!         target: lighting
//!         action: { cmd: fade, params: { level: 0 } }
//!         wait_for_ack: true
//!       - id: thunder
//!         target: audio
//!         action: { cmd: play }
//!         asset: thunder
//! ```
//!
//! # Named Actions
//!
//! Actions used by several cues can be declared once under a top-level
//! `actions:` map and referred to by name. An entry is either a single
//! action (`{ target, cmd, params?, asset? }`) or a composite: a list of
//! single action names or inline single actions, dispatched in order.
//!
//! ```yaml
//! actions:
//!   blackout: { target: lighting, cmd: fade, params: { level: 0 } }
//!   storm:
//!     - blackout
//!     - { target: audio, cmd: play, asset: thunder }
//! scenes:
//!   - id: act-2
//!     cues:
//!       - { id: storm, action: storm }
//!       - { id: both, action: [blackout, { target: audio, cmd: stop }] }
//! ```
//!
//! A cue whose `action` is a name or a list takes its targets from the
//! actions and may not carry `target` or `asset` itself.

mod document;
mod validate;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use validate::{IssueKind, ValidationError, ValidationIssue};

/// Highest opus schema version this build understands
pub const SUPPORTED_VERSION: u32 = 1;

/// A component type named by cues (e.g. `audio`, `lighting`)
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComponentType(String);

impl ComponentType {
    /// Name of the built-in type whose cues Core executes itself
    pub const INTERNAL: &'static str = "internal";

    /// Create a component type from a name
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The built-in `internal` type
    #[must_use]
    pub fn internal() -> Self {
        Self(Self::INTERNAL.to_string())
    }

    /// Whether this is the built-in `internal` type
    #[must_use]
    pub fn is_internal(&self) -> bool {
        self.0 == Self::INTERNAL
    }

    /// Get the string value
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ComponentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key of an entry in the asset manifest
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetRef(String);

impl AssetRef {
    /// Create an asset reference
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the string value
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One entry of the asset manifest
///
/// Core never reads the asset itself. `path` is handed to components as-is,
/// `checksum` (when the opus declares one) lets a component's cached copy be
/// detected as stale.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetSpec {
    /// Manifest key
    pub id: AssetRef,
    /// Location, relative to the opus or an absolute URL
    pub path: String,
    /// Expected content checksum, if declared
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// What a cue asks for
#[derive(Clone, Debug, PartialEq)]
pub enum CuePayload {
    /// Forwarded verbatim to every eligible component of the cue's target type
    Command {
        /// Command name understood by the component
        cmd: String,
        /// Command parameters, opaque to Core
        params: serde_json::Map<String, serde_json::Value>,
    },
    /// Executed by Core itself (target `internal`)
    Internal(InternalAction),
}

/// Actions Core performs in-process
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InternalAction {
    /// Write a line to the show log
    Log {
        /// Text to log
        text: String,
    },
    /// Relocate the cursor once this cue has executed
    Goto {
        /// Scene id to jump to
        scene: String,
        /// Cue id inside that scene (first cue when absent)
        cue: Option<String>,
    },
}

/// One instruction for one component type
#[derive(Clone, Debug, PartialEq)]
pub struct CueAction {
    /// Library entry this step was expanded from, if any
    pub name: Option<String>,
    /// Component type that renders this step
    pub target: ComponentType,
    /// What to do
    pub payload: CuePayload,
    /// Asset the step plays, if any
    pub asset: Option<AssetRef>,
}

/// A named entry of the action library
#[derive(Clone, Debug, PartialEq)]
pub struct NamedAction {
    /// Library key
    pub name: String,
    /// Operator-facing description
    pub description: Option<String>,
    /// One step for a single action, several for a composite
    pub steps: Vec<CueAction>,
}

/// What the operator fires: one or more actions, dispatched in order
#[derive(Clone, Debug, PartialEq)]
pub struct Cue {
    /// Identifier, unique within its scene
    pub id: String,
    /// Steps in dispatch order, never empty
    pub actions: Vec<CueAction>,
    /// Whether the cursor waits for every targeted component to acknowledge
    pub wait_for_ack: bool,
    /// Operator-facing description
    pub description: Option<String>,
    /// Per-cue acknowledgement timeout, overriding the configured default
    pub ack_timeout: Option<Duration>,
}

impl Cue {
    /// Component types this cue dispatches to, first use first
    #[must_use]
    pub fn targets(&self) -> Vec<&ComponentType> {
        let mut targets: Vec<&ComponentType> = Vec::new();
        for action in &self.actions {
            if !targets.contains(&&action.target) {
                targets.push(&action.target);
            }
        }
        targets
    }
}

/// An ordered group of cues (an act, a scene)
#[derive(Clone, Debug, PartialEq)]
pub struct Scene {
    /// Identifier, unique within the opus
    pub id: String,
    /// Operator-facing title
    pub title: Option<String>,
    /// Cues in execution order, never empty
    pub cues: Vec<Cue>,
}

/// Position of a cue inside an opus
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CuePosition {
    /// Scene index
    pub scene: usize,
    /// Cue index within the scene
    pub cue: usize,
}

impl CuePosition {
    /// Create a position
    #[must_use]
    pub fn new(scene: usize, cue: usize) -> Self {
        Self { scene, cue }
    }
}

impl fmt::Display for CuePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.scene, self.cue)
    }
}

/// A validated show script
///
/// Immutable once built; share it as `Arc<Opus>`.
#[derive(Clone, Debug, PartialEq)]
pub struct Opus {
    version: u32,
    components: BTreeSet<ComponentType>,
    assets: BTreeMap<AssetRef, AssetSpec>,
    actions: BTreeMap<String, NamedAction>,
    scenes: Vec<Scene>,
    warnings: Vec<ValidationIssue>,
}

impl Opus {
    /// Schema version the document declared
    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Declared component types (always includes `internal`)
    #[must_use]
    pub fn component_types(&self) -> &BTreeSet<ComponentType> {
        &self.components
    }

    /// Whether cues may target this component type
    #[must_use]
    pub fn declares(&self, component_type: &ComponentType) -> bool {
        self.components.contains(component_type)
    }

    /// The asset manifest
    #[must_use]
    pub fn assets(&self) -> &BTreeMap<AssetRef, AssetSpec> {
        &self.assets
    }

    /// Look up a manifest entry
    #[must_use]
    pub fn asset(&self, id: &AssetRef) -> Option<&AssetSpec> {
        self.assets.get(id)
    }

    /// The named action library
    #[must_use]
    pub fn actions(&self) -> &BTreeMap<String, NamedAction> {
        &self.actions
    }

    /// Look up a named action
    #[must_use]
    pub fn action(&self, name: &str) -> Option<&NamedAction> {
        self.actions.get(name)
    }

    /// Scenes in show order
    #[must_use]
    pub fn scenes(&self) -> &[Scene] {
        &self.scenes
    }

    /// Non-fatal findings from validation (unused assets, actions and component types)
    #[must_use]
    pub fn warnings(&self) -> &[ValidationIssue] {
        &self.warnings
    }

    /// Total number of cues across all scenes
    #[must_use]
    pub fn cue_count(&self) -> usize {
        self.scenes.iter().map(|s| s.cues.len()).sum()
    }

    /// Get the scene at an index
    #[must_use]
    pub fn scene(&self, index: usize) -> Option<&Scene> {
        self.scenes.get(index)
    }

    /// Get the cue at a position
    #[must_use]
    pub fn cue(&self, position: CuePosition) -> Option<&Cue> {
        self.scenes
            .get(position.scene)
            .and_then(|s| s.cues.get(position.cue))
    }

    /// Index of the scene with this id
    #[must_use]
    pub fn find_scene(&self, id: &str) -> Option<usize> {
        self.scenes.iter().position(|s| s.id == id)
    }

    /// Index of a cue inside a scene
    #[must_use]
    pub fn find_cue(&self, scene: usize, id: &str) -> Option<usize> {
        self.scenes
            .get(scene)
            .and_then(|s| s.cues.iter().position(|c| c.id == id))
    }

    /// First cue of the first scene
    #[must_use]
    pub fn first_position(&self) -> Option<CuePosition> {
        self.cue(CuePosition::new(0, 0)).map(|_| CuePosition::new(0, 0))
    }

    /// Position after `position`, crossing scene boundaries
    ///
    /// Returns `None` past the last cue of the last scene.
    #[must_use]
    pub fn next_position(&self, position: CuePosition) -> Option<CuePosition> {
        let scene = self.scenes.get(position.scene)?;
        if position.cue + 1 < scene.cues.len() {
            return Some(CuePosition::new(position.scene, position.cue + 1));
        }
        self.scenes
            .get(position.scene + 1)
            .map(|_| CuePosition::new(position.scene + 1, 0))
    }

    /// Position before `position`, crossing scene boundaries
    #[must_use]
    pub fn previous_position(&self, position: CuePosition) -> Option<CuePosition> {
        if position.cue > 0 {
            return Some(CuePosition::new(position.scene, position.cue - 1));
        }
        let previous = position.scene.checked_sub(1)?;
        let scene = self.scenes.get(previous)?;
        Some(CuePosition::new(previous, scene.cues.len().saturating_sub(1)))
    }

    /// Human-readable `scene/cue` label for a position
    #[must_use]
    pub fn label(&self, position: CuePosition) -> String {
        match (self.scene(position.scene), self.cue(position)) {
            (Some(scene), Some(cue)) => format!("{}/{}", scene.id, cue.id),
            _ => position.to_string(),
        }
    }

    /// Serialize back to the YAML document format
    ///
    /// Inline assets come out as ordinary manifest entries under their
    /// generated ids, so the result loads to an equal opus.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(&document::OpusDocument::from_opus(self))
    }
}

/// Error loading an opus from disk
#[derive(Debug, thiserror::Error)]
pub enum OpusError {
    /// The file could not be read
    #[error("failed to read opus {path:?}: {source}")]
    Io {
        /// Path that was read
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The document failed validation
    #[error("opus {path:?} is invalid: {errors}")]
    Invalid {
        /// Path that was read
        path: PathBuf,
        /// Every violation found
        errors: ValidationError,
    },
}

/// What to do when the configured opus fails to load
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationFailurePolicy {
    /// Exit the process with a non-zero status
    Abort,
    /// Keep running with no opus loaded
    Degraded,
}

impl ValidationFailurePolicy {
    /// Policy for the `EXIT_ON_VALIDATION_FAILURE` flag
    #[must_use]
    pub fn from_exit_flag(exit_on_failure: bool) -> Self {
        if exit_on_failure {
            Self::Abort
        } else {
            Self::Degraded
        }
    }
}

impl fmt::Display for ValidationFailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Abort => f.write_str("abort"),
            Self::Degraded => f.write_str("degraded"),
        }
    }
}

/// Parse and validate an opus document
///
/// # Errors
///
/// Returns every schema, reference and structural violation found.
pub fn parse(text: &str) -> Result<Opus, ValidationError> {
    validate::validate(text)
}

/// Read, parse and validate the opus at `path`
///
/// Warnings are logged but do not fail the load.
///
/// # Errors
///
/// `OpusError::Io` if the file cannot be read, `OpusError::Invalid` with the
/// full violation list otherwise.
pub fn load(path: impl AsRef<Path>) -> Result<Opus, OpusError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| OpusError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let opus = parse(&text).map_err(|errors| OpusError::Invalid {
        path: path.to_path_buf(),
        errors,
    })?;

    for warning in opus.warnings() {
        tracing::warn!(path = ?path, warning = %warning, "Opus warning");
    }
    tracing::info!(
        path = ?path,
        scenes = opus.scenes().len(),
        cues = opus.cue_count(),
        assets = opus.assets().len(),
        actions = opus.actions().len(),
        "Opus loaded"
    );
    Ok(opus)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const TWO_SCENES: &str = r"
version: 1
components: [audio, lighting]
assets:
  thunder: { path: sounds/thunder.wav }
scenes:
  - id: act-1
    cues:
      - id: lights
        target: lighting
        action: { cmd: fade, params: { level: 0 } }
      - id: thunder
        target: audio
        action: { cmd: play }
        asset: thunder
  - id: act-2
    cues:
      - id: lights-up
        target: lighting
        action: { cmd: fade, params: { level: 100 } }
";

    #[test]
    fn test_navigation_crosses_scenes() {
        let opus = parse(TWO_SCENES).unwrap();
        let first = opus.first_position().unwrap();
        assert_eq!(first, CuePosition::new(0, 0));

        let second = opus.next_position(first).unwrap();
        assert_eq!(second, CuePosition::new(0, 1));

        let third = opus.next_position(second).unwrap();
        assert_eq!(third, CuePosition::new(1, 0));
        assert!(opus.next_position(third).is_none());

        assert_eq!(opus.previous_position(third), Some(second));
        assert_eq!(opus.previous_position(first), None);
    }

    #[test]
    fn test_find_and_label() {
        let opus = parse(TWO_SCENES).unwrap();
        assert_eq!(opus.find_scene("act-2"), Some(1));
        assert_eq!(opus.find_cue(0, "thunder"), Some(1));
        assert_eq!(opus.find_cue(1, "thunder"), None);
        assert_eq!(opus.label(CuePosition::new(0, 1)), "act-1/thunder");
        assert_eq!(opus.cue_count(), 3);
    }

    #[test]
    fn test_internal_type_always_declared() {
        let opus = parse(TWO_SCENES).unwrap();
        assert!(opus.declares(&ComponentType::internal()));
        assert!(opus.declares(&ComponentType::new("audio")));
        assert!(!opus.declares(&ComponentType::new("video")));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(TWO_SCENES.as_bytes()).unwrap();

        let opus = load(file.path()).unwrap();
        assert_eq!(opus.scenes().len(), 2);
    }

    #[test]
    fn test_load_missing_file() {
        let result = load("/nonexistent/opus.yaml");
        assert!(matches!(result, Err(OpusError::Io { .. })));
    }

    #[test]
    fn test_load_invalid_file_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"scenes: []\n").unwrap();

        let err = load(file.path()).unwrap_err();
        match err {
            OpusError::Invalid { path, errors } => {
                assert_eq!(path, file.path());
                assert!(errors.has(IssueKind::Schema));
            }
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn test_yaml_roundtrip_is_lossless() {
        let opus = parse(TWO_SCENES).unwrap();
        let yaml = opus.to_yaml().unwrap();
        let reloaded = parse(&yaml).unwrap();
        assert_eq!(opus, reloaded);
    }

    #[test]
    fn test_policy_from_exit_flag() {
        assert_eq!(
            ValidationFailurePolicy::from_exit_flag(true),
            ValidationFailurePolicy::Abort
        );
        assert_eq!(
            ValidationFailurePolicy::from_exit_flag(false),
            ValidationFailurePolicy::Degraded
        );
    }
}
