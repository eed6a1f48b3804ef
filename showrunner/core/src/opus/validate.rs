//! Opus Validation
//!
//! Walks the raw YAML tree instead of deserializing straight into typed
//! structs, so that one bad field does not hide the rest: every violation is
//! recorded with its location and the walk carries on.
//!
//! Passes run in order over whatever parsed:
//!
//! 1. schema shape (required fields, types, supported version)
//! 2. referential integrity (assets, targets, action names, cue ids, goto
//!    targets)
//! 3. ordering sanity (empty scenes, duplicate scene ids)

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use super::{
    AssetRef, AssetSpec, ComponentType, Cue, CueAction, CuePayload, InternalAction, NamedAction,
    Opus, Scene, SUPPORTED_VERSION,
};

/// Which validation rule family an issue belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// Required field missing, wrong type, unsupported version
    Schema,
    /// Dangling asset, action or goto reference, undeclared target, duplicate cue id
    Reference,
    /// Empty scene, duplicate scene id, no scenes at all
    Structural,
    /// Declared but never used (warning only)
    Unreferenced,
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Schema => "schema",
            Self::Reference => "reference",
            Self::Structural => "structural",
            Self::Unreferenced => "unreferenced",
        };
        f.write_str(name)
    }
}

/// One violation, located in the document
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Rule family
    pub kind: IssueKind,
    /// Path into the document, e.g. `scenes[1].cues[0].asset`
    pub location: String,
    /// What is wrong
    pub message: String,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.kind, self.location, self.message)
    }
}

/// Every violation found in an opus document
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationError {
    issues: Vec<ValidationIssue>,
}

impl ValidationError {
    /// All issues, schema first, then reference, then structural
    #[must_use]
    pub fn issues(&self) -> &[ValidationIssue] {
        &self.issues
    }

    /// Whether any issue of this kind was found
    #[must_use]
    pub fn has(&self, kind: IssueKind) -> bool {
        self.issues.iter().any(|i| i.kind == kind)
    }

    /// Number of issues of this kind
    #[must_use]
    pub fn count(&self, kind: IssueKind) -> usize {
        self.issues.iter().filter(|i| i.kind == kind).count()
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} validation issue(s)", self.issues.len())?;
        for issue in &self.issues {
            write!(f, "\n  {issue}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

/// A scene as far as it parsed
struct DraftScene {
    id: Option<String>,
    title: Option<String>,
    location: String,
    /// Number of entries under `cues`, valid or not
    declared_cues: usize,
    cues: Vec<DraftCue>,
}

struct DraftCue {
    cue: Cue,
    location: String,
    /// Parallel to `cue.actions`; `None` for steps taken from the library
    steps_at: Vec<Option<StepAt>>,
}

/// A library entry as far as it parsed
struct DraftAction {
    action: NamedAction,
    composite: bool,
    /// Parallel to `action.steps`; `None` for steps that name another entry
    steps_at: Vec<Option<StepAt>>,
}

/// Where a step was written down
#[derive(Clone)]
struct StepAt {
    /// Holds `target` and `asset`
    base: String,
    /// Holds `cmd` and `params`
    action_at: String,
}

impl StepAt {
    fn inline(at: &str) -> Self {
        Self {
            base: at.to_string(),
            action_at: at.to_string(),
        }
    }
}

/// One entry of a cue's `action` once its shape is known
enum ActionItem {
    Name { name: String, at: String },
    Step { step: CueAction, at: StepAt },
}

#[derive(Default)]
struct Checker {
    issues: Vec<ValidationIssue>,
    used_actions: BTreeSet<String>,
}

pub(super) fn validate(text: &str) -> Result<Opus, ValidationError> {
    let mut checker = Checker::default();

    let root: Value = match serde_yaml::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            checker.schema("$", format!("not a valid YAML document: {e}"));
            return Err(checker.into_error());
        }
    };
    let Some(root) = root.as_mapping() else {
        checker.schema(
            "$",
            format!("expected a mapping at the root, found {}", type_name(&root)),
        );
        return Err(checker.into_error());
    };

    let version = checker.version(root);
    let components = checker.components(root);
    let mut assets = checker.assets(root);
    let library = checker.actions(root, &mut assets);
    let scenes = checker.scenes(root, &library, &mut assets);

    if let Some(scenes) = &scenes {
        checker.references(scenes, &library, &assets, &components);
        checker.structure(scenes);
    }

    let Some(scenes) = scenes else {
        return Err(checker.into_error());
    };
    if !checker.issues.is_empty() {
        return Err(checker.into_error());
    }

    let warnings = unreferenced(&scenes, &library, &assets, &components, &checker.used_actions);
    let actions = library
        .into_iter()
        .map(|(name, draft)| (name, draft.action))
        .collect();
    let scenes = scenes
        .into_iter()
        .map(|draft| Scene {
            id: draft.id.unwrap_or_default(),
            title: draft.title,
            cues: draft.cues.into_iter().map(|c| c.cue).collect(),
        })
        .collect();

    Ok(Opus {
        version,
        components,
        assets,
        actions,
        scenes,
        warnings,
    })
}

impl Checker {
    fn push(&mut self, kind: IssueKind, location: impl Into<String>, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            kind,
            location: location.into(),
            message: message.into(),
        });
    }

    fn schema(&mut self, location: impl Into<String>, message: impl Into<String>) {
        self.push(IssueKind::Schema, location, message);
    }

    fn reference(&mut self, location: impl Into<String>, message: impl Into<String>) {
        self.push(IssueKind::Reference, location, message);
    }

    fn structural(&mut self, location: impl Into<String>, message: impl Into<String>) {
        self.push(IssueKind::Structural, location, message);
    }

    fn into_error(mut self) -> ValidationError {
        // Stable: keeps document order inside each pass
        self.issues.sort_by_key(|i| i.kind);
        ValidationError {
            issues: self.issues,
        }
    }

    fn required_str<'v>(&mut self, map: &'v Mapping, key: &str, at: &str) -> Option<&'v str> {
        match map.get(key) {
            None | Some(Value::Null) => {
                self.schema(at, format!("missing required field `{key}`"));
                None
            }
            Some(value) => self.as_str(value, &field(at, key)),
        }
    }

    fn optional_str<'v>(&mut self, map: &'v Mapping, key: &str, at: &str) -> Option<&'v str> {
        match map.get(key) {
            None | Some(Value::Null) => None,
            Some(value) => self.as_str(value, &field(at, key)),
        }
    }

    fn as_str<'v>(&mut self, value: &'v Value, at: &str) -> Option<&'v str> {
        match value.as_str() {
            Some(s) if s.trim().is_empty() => {
                self.schema(at, "must not be empty");
                None
            }
            Some(s) => Some(s),
            None => {
                self.schema(at, format!("expected a string, found {}", type_name(value)));
                None
            }
        }
    }

    fn optional_bool(&mut self, map: &Mapping, key: &str, at: &str) -> Option<bool> {
        match map.get(key) {
            None | Some(Value::Null) => None,
            Some(Value::Bool(b)) => Some(*b),
            Some(other) => {
                self.schema(
                    field(at, key),
                    format!("expected a boolean, found {}", type_name(other)),
                );
                None
            }
        }
    }

    fn optional_u64(&mut self, map: &Mapping, key: &str, at: &str) -> Option<u64> {
        match map.get(key) {
            None | Some(Value::Null) => None,
            Some(value) => match value.as_u64() {
                Some(n) => Some(n),
                None => {
                    self.schema(
                        field(at, key),
                        format!(
                            "expected a non-negative integer, found {}",
                            type_name(value)
                        ),
                    );
                    None
                }
            },
        }
    }

    fn version(&mut self, root: &Mapping) -> u32 {
        let Some(value) = root.get("version") else {
            return SUPPORTED_VERSION;
        };
        match value.as_u64() {
            Some(v) if v >= 1 && v <= u64::from(SUPPORTED_VERSION) => {
                u32::try_from(v).unwrap_or(SUPPORTED_VERSION)
            }
            Some(v) => {
                self.schema(
                    "version",
                    format!("unsupported schema version {v} (supported: 1..={SUPPORTED_VERSION})"),
                );
                SUPPORTED_VERSION
            }
            None => {
                self.schema(
                    "version",
                    format!("expected an integer, found {}", type_name(value)),
                );
                SUPPORTED_VERSION
            }
        }
    }

    fn components(&mut self, root: &Mapping) -> BTreeSet<ComponentType> {
        let mut declared = BTreeSet::new();
        declared.insert(ComponentType::internal());

        let Some(value) = root.get("components") else {
            self.schema("$", "missing required field `components`");
            return declared;
        };
        let Some(list) = value.as_sequence() else {
            self.schema(
                "components",
                format!("expected a sequence, found {}", type_name(value)),
            );
            return declared;
        };

        for (i, entry) in list.iter().enumerate() {
            if let Some(name) = self.as_str(entry, &format!("components[{i}]")) {
                declared.insert(ComponentType::new(name));
            }
        }
        declared
    }

    fn assets(&mut self, root: &Mapping) -> BTreeMap<AssetRef, AssetSpec> {
        let mut assets = BTreeMap::new();
        let Some(value) = root.get("assets") else {
            return assets;
        };
        let Some(map) = value.as_mapping() else {
            if !value.is_null() {
                self.schema(
                    "assets",
                    format!("expected a mapping, found {}", type_name(value)),
                );
            }
            return assets;
        };

        for (key, entry) in map {
            let Some(id) = key.as_str() else {
                self.schema(
                    "assets",
                    format!("asset keys must be strings, found {}", type_name(key)),
                );
                continue;
            };
            let at = format!("assets.{id}");
            if let Some(spec) = self.asset_spec(AssetRef::new(id), entry, &at) {
                assets.insert(spec.id.clone(), spec);
            }
        }
        assets
    }

    /// An asset is either a bare path string or `{ path, checksum? }`
    fn asset_spec(&mut self, id: AssetRef, value: &Value, at: &str) -> Option<AssetSpec> {
        if let Some(path) = value.as_str() {
            return self.as_str(value, at).map(|_| AssetSpec {
                id,
                path: path.to_string(),
                checksum: None,
            });
        }
        let Some(map) = value.as_mapping() else {
            self.schema(
                at,
                format!("expected a path or a mapping, found {}", type_name(value)),
            );
            return None;
        };
        let path = self.required_str(map, "path", at);
        let checksum = self.optional_str(map, "checksum", at);
        path.map(|path| AssetSpec {
            id,
            path: path.to_string(),
            checksum: checksum.map(str::to_string),
        })
    }

    /// The optional `actions:` library
    ///
    /// Single entries are read first so composites can name them in any
    /// order. A composite may not include another composite.
    fn actions(
        &mut self,
        root: &Mapping,
        assets: &mut BTreeMap<AssetRef, AssetSpec>,
    ) -> BTreeMap<String, DraftAction> {
        let mut library = BTreeMap::new();
        let Some(value) = root.get("actions") else {
            return library;
        };
        let Some(map) = value.as_mapping() else {
            if !value.is_null() {
                self.schema(
                    "actions",
                    format!("expected a mapping, found {}", type_name(value)),
                );
            }
            return library;
        };

        let mut composites = Vec::new();
        for (key, entry) in map {
            let Some(name) = key.as_str() else {
                self.schema(
                    "actions",
                    format!("action names must be strings, found {}", type_name(key)),
                );
                continue;
            };
            let at = format!("actions.{name}");
            match entry {
                Value::Mapping(def) => {
                    let description = self.optional_str(def, "description", &at).map(str::to_string);
                    let asset_id = AssetRef::new(format!("actions/{name}"));
                    let steps = self
                        .inline_action(entry, &at, asset_id, assets)
                        .map(|step| CueAction {
                            name: Some(name.to_string()),
                            ..step
                        })
                        .into_iter()
                        .collect::<Vec<_>>();
                    let steps_at = steps.iter().map(|_| Some(StepAt::inline(&at))).collect();
                    let action = NamedAction {
                        name: name.to_string(),
                        description,
                        steps,
                    };
                    library.insert(
                        name.to_string(),
                        DraftAction {
                            action,
                            composite: false,
                            steps_at,
                        },
                    );
                }
                Value::Sequence(items) => composites.push((name, at, items)),
                other => self.schema(
                    &at,
                    format!(
                        "expected an action or a list of actions, found {}",
                        type_name(other)
                    ),
                ),
            }
        }

        for (name, at, items) in composites {
            if items.is_empty() {
                self.schema(&at, "a composite action needs at least one step");
            }
            let mut steps = Vec::with_capacity(items.len());
            let mut steps_at = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                let item_at = format!("{at}[{i}]");
                match item {
                    Value::String(_) => {
                        let Some(used) = self.as_str(item, &item_at) else {
                            continue;
                        };
                        match library.get(used) {
                            Some(single) if !single.composite => {
                                self.used_actions.insert(used.to_string());
                                for step in &single.action.steps {
                                    steps.push(step.clone());
                                    steps_at.push(None);
                                }
                            }
                            _ if map.get(used).is_some_and(Value::is_sequence) => {
                                self.reference(
                                    &item_at,
                                    format!("composite action `{name}` cannot include composite action `{used}`"),
                                );
                            }
                            // Declared but broken: already reported
                            _ if map.contains_key(used) => {}
                            _ => self.reference(&item_at, format!("unknown action `{used}`")),
                        }
                    }
                    Value::Mapping(_) => {
                        let asset_id = AssetRef::new(format!("actions/{name}/{i}"));
                        if let Some(step) = self.inline_action(item, &item_at, asset_id, assets) {
                            steps.push(step);
                            steps_at.push(Some(StepAt::inline(&item_at)));
                        }
                    }
                    other => self.schema(
                        &item_at,
                        format!(
                            "expected an action name or an action, found {}",
                            type_name(other)
                        ),
                    ),
                }
            }
            let action = NamedAction {
                name: name.to_string(),
                description: None,
                steps,
            };
            library.insert(
                name.to_string(),
                DraftAction {
                    action,
                    composite: true,
                    steps_at,
                },
            );
        }
        library
    }

    /// `{ target, cmd, params?, asset? }` as written in the library or a
    /// cue's action list
    fn inline_action(
        &mut self,
        value: &Value,
        at: &str,
        asset_id: AssetRef,
        assets: &mut BTreeMap<AssetRef, AssetSpec>,
    ) -> Option<CueAction> {
        let map = value.as_mapping()?;
        let before = self.issues.len();
        let target = self.required_str(map, "target", at).map(ComponentType::new);
        let payload = match &target {
            Some(target) => self.payload(value, target, at),
            None => None,
        };
        let asset = self.asset_field(map, at, asset_id, assets);
        if self.issues.len() > before {
            return None;
        }
        Some(CueAction {
            name: None,
            target: target?,
            payload: payload?,
            asset,
        })
    }

    fn scenes(
        &mut self,
        root: &Mapping,
        library: &BTreeMap<String, DraftAction>,
        assets: &mut BTreeMap<AssetRef, AssetSpec>,
    ) -> Option<Vec<DraftScene>> {
        let Some(value) = root.get("scenes") else {
            self.schema("$", "missing required field `scenes`");
            return None;
        };
        let Some(list) = value.as_sequence() else {
            self.schema(
                "scenes",
                format!("expected a sequence, found {}", type_name(value)),
            );
            return None;
        };

        let mut scenes = Vec::with_capacity(list.len());
        for (i, entry) in list.iter().enumerate() {
            let at = format!("scenes[{i}]");
            let Some(map) = entry.as_mapping() else {
                self.schema(&at, format!("expected a mapping, found {}", type_name(entry)));
                continue;
            };
            scenes.push(self.scene(map, at, library, assets));
        }
        Some(scenes)
    }

    fn scene(
        &mut self,
        map: &Mapping,
        at: String,
        library: &BTreeMap<String, DraftAction>,
        assets: &mut BTreeMap<AssetRef, AssetSpec>,
    ) -> DraftScene {
        let id = self.required_str(map, "id", &at).map(str::to_string);
        let title = self.optional_str(map, "title", &at).map(str::to_string);

        let mut draft = DraftScene {
            id,
            title,
            location: at,
            declared_cues: 0,
            cues: Vec::new(),
        };

        let cues_at = field(&draft.location, "cues");
        let list = match map.get("cues") {
            None | Some(Value::Null) => {
                self.schema(&draft.location, "missing required field `cues`");
                return draft;
            }
            Some(value) => match value.as_sequence() {
                Some(list) => list,
                None => {
                    self.schema(
                        &cues_at,
                        format!("expected a sequence, found {}", type_name(value)),
                    );
                    return draft;
                }
            },
        };

        draft.declared_cues = list.len();
        for (i, entry) in list.iter().enumerate() {
            let at = format!("{cues_at}[{i}]");
            let Some(cue_map) = entry.as_mapping() else {
                self.schema(&at, format!("expected a mapping, found {}", type_name(entry)));
                continue;
            };
            if let Some((cue, steps_at)) = self.cue(cue_map, &at, draft.id.as_deref(), library, assets) {
                draft.cues.push(DraftCue {
                    cue,
                    location: at,
                    steps_at,
                });
            }
        }
        draft
    }

    fn cue(
        &mut self,
        map: &Mapping,
        at: &str,
        scene_id: Option<&str>,
        library: &BTreeMap<String, DraftAction>,
        assets: &mut BTreeMap<AssetRef, AssetSpec>,
    ) -> Option<(Cue, Vec<Option<StepAt>>)> {
        let before = self.issues.len();

        let id = self.required_str(map, "id", at);
        let wait_for_ack = self.optional_bool(map, "wait_for_ack", at).unwrap_or(false);
        let description = self.optional_str(map, "description", at).map(str::to_string);
        let ack_timeout = self
            .optional_u64(map, "ack_timeout_ms", at)
            .map(Duration::from_millis);

        let prefix = format!("{}/{}", scene_id.unwrap_or(at), id.unwrap_or("cue"));
        let action_at = field(at, "action");
        let items = match map.get("action") {
            None | Some(Value::Null) => {
                self.schema(at, "missing required field `action`");
                Vec::new()
            }
            Some(action @ Value::Mapping(_)) => {
                let target = self.required_str(map, "target", at).map(ComponentType::new);
                let payload = match &target {
                    Some(target) => self.payload(action, target, &action_at),
                    None => None,
                };
                let asset = self.asset_field(map, at, AssetRef::new(prefix), assets);
                match (target, payload) {
                    (Some(target), Some(payload)) => vec![ActionItem::Step {
                        step: CueAction {
                            name: None,
                            target,
                            payload,
                            asset,
                        },
                        at: StepAt {
                            base: at.to_string(),
                            action_at,
                        },
                    }],
                    _ => Vec::new(),
                }
            }
            Some(action @ (Value::String(_) | Value::Sequence(_))) => {
                for key in ["target", "asset"] {
                    if map.get(key).is_some_and(|v| !v.is_null()) {
                        self.schema(
                            field(at, key),
                            format!("`{key}` belongs to the named actions when `action` is a name or a list"),
                        );
                    }
                }
                self.action_items(action, &action_at, &prefix, assets)
            }
            Some(other) => {
                self.schema(
                    &action_at,
                    format!(
                        "expected an action, an action name or a list, found {}",
                        type_name(other)
                    ),
                );
                Vec::new()
            }
        };

        if self.issues.len() > before {
            return None;
        }

        let mut actions = Vec::with_capacity(items.len());
        let mut steps_at = Vec::with_capacity(items.len());
        for item in items {
            match item {
                ActionItem::Step { step, at } => {
                    actions.push(step);
                    steps_at.push(Some(at));
                }
                ActionItem::Name { name, at } => match library.get(&name) {
                    Some(entry) => {
                        for step in &entry.action.steps {
                            actions.push(CueAction {
                                name: Some(name.clone()),
                                ..step.clone()
                            });
                            steps_at.push(None);
                        }
                        self.used_actions.insert(name);
                    }
                    None => self.reference(at, format!("unknown action `{name}`")),
                },
            }
        }

        let cue = Cue {
            id: id?.to_string(),
            actions,
            wait_for_ack,
            description,
            ack_timeout,
        };
        Some((cue, steps_at))
    }

    /// A cue's `action` written as a library name or a list of names and
    /// inline actions
    fn action_items(
        &mut self,
        action: &Value,
        at: &str,
        prefix: &str,
        assets: &mut BTreeMap<AssetRef, AssetSpec>,
    ) -> Vec<ActionItem> {
        let Some(list) = action.as_sequence() else {
            return self
                .as_str(action, at)
                .map(|name| ActionItem::Name {
                    name: name.to_string(),
                    at: at.to_string(),
                })
                .into_iter()
                .collect();
        };
        if list.is_empty() {
            self.schema(at, "an action list needs at least one entry");
        }

        let mut items = Vec::with_capacity(list.len());
        for (i, entry) in list.iter().enumerate() {
            let item_at = format!("{at}[{i}]");
            match entry {
                Value::String(_) => {
                    if let Some(name) = self.as_str(entry, &item_at) {
                        items.push(ActionItem::Name {
                            name: name.to_string(),
                            at: item_at,
                        });
                    }
                }
                Value::Mapping(_) => {
                    let asset_id = AssetRef::new(format!("{prefix}/{i}"));
                    if let Some(step) = self.inline_action(entry, &item_at, asset_id, assets) {
                        items.push(ActionItem::Step {
                            step,
                            at: StepAt::inline(&item_at),
                        });
                    }
                }
                other => self.schema(
                    &item_at,
                    format!(
                        "expected an action name or an action, found {}",
                        type_name(other)
                    ),
                ),
            }
        }
        items
    }

    /// `asset:` as a manifest id, or an inline asset lifted into the
    /// manifest under `generated`
    fn asset_field(
        &mut self,
        map: &Mapping,
        at: &str,
        generated: AssetRef,
        assets: &mut BTreeMap<AssetRef, AssetSpec>,
    ) -> Option<AssetRef> {
        match map.get("asset") {
            None | Some(Value::Null) => None,
            Some(value @ Value::String(_)) => {
                self.as_str(value, &field(at, "asset")).map(AssetRef::new)
            }
            Some(inline @ Value::Mapping(_)) => {
                let spec = self.asset_spec(generated.clone(), inline, &field(at, "asset"))?;
                if assets.contains_key(&generated) {
                    self.reference(
                        field(at, "asset"),
                        format!("inline asset id `{generated}` collides with a manifest entry"),
                    );
                } else {
                    assets.insert(generated.clone(), spec);
                }
                Some(generated)
            }
            Some(other) => {
                self.schema(
                    field(at, "asset"),
                    format!(
                        "expected an asset id or an inline asset, found {}",
                        type_name(other)
                    ),
                );
                None
            }
        }
    }

    fn payload(&mut self, action: &Value, target: &ComponentType, at: &str) -> Option<CuePayload> {
        let Some(map) = action.as_mapping() else {
            self.schema(at, format!("expected a mapping, found {}", type_name(action)));
            return None;
        };
        let cmd = self.required_str(map, "cmd", at)?;

        let params = match map.get("params") {
            None | Some(Value::Null) => serde_json::Map::new(),
            Some(value @ Value::Mapping(_)) => match serde_json::to_value(value) {
                Ok(serde_json::Value::Object(params)) => params,
                Ok(_) | Err(_) => {
                    self.schema(
                        field(at, "params"),
                        "parameters must be a mapping with string keys",
                    );
                    return None;
                }
            },
            Some(other) => {
                self.schema(
                    field(at, "params"),
                    format!("expected a mapping, found {}", type_name(other)),
                );
                return None;
            }
        };

        if !target.is_internal() {
            return Some(CuePayload::Command {
                cmd: cmd.to_string(),
                params,
            });
        }

        let params_at = field(at, "params");
        let param = |checker: &mut Self, key: &str, required: bool| -> Option<String> {
            match params.get(key) {
                Some(serde_json::Value::String(s)) if !s.trim().is_empty() => Some(s.clone()),
                Some(other) => {
                    checker.schema(
                        field(&params_at, key),
                        format!("expected a non-empty string, found {other}"),
                    );
                    None
                }
                None => {
                    if required {
                        checker.schema(
                            &params_at,
                            format!("internal command `{cmd}` requires parameter `{key}`"),
                        );
                    }
                    None
                }
            }
        };

        match cmd {
            "log" => param(self, "text", true)
                .map(|text| CuePayload::Internal(InternalAction::Log { text })),
            "goto" => {
                let scene = param(self, "scene", true)?;
                let cue = param(self, "cue", false);
                Some(CuePayload::Internal(InternalAction::Goto { scene, cue }))
            }
            other => {
                self.schema(
                    field(at, "cmd"),
                    format!("unknown internal command `{other}` (expected `log` or `goto`)"),
                );
                None
            }
        }
    }

    fn references(
        &mut self,
        scenes: &[DraftScene],
        library: &BTreeMap<String, DraftAction>,
        assets: &BTreeMap<AssetRef, AssetSpec>,
        components: &BTreeSet<ComponentType>,
    ) {
        for entry in library.values() {
            for (step, at) in entry.action.steps.iter().zip(&entry.steps_at) {
                if let Some(at) = at {
                    self.step_references(scenes, step, at, assets, components);
                }
            }
        }

        for scene in scenes {
            let mut seen = HashSet::new();
            for draft in &scene.cues {
                let cue = &draft.cue;

                if !seen.insert(cue.id.as_str()) {
                    self.reference(
                        field(&draft.location, "id"),
                        format!("duplicate cue id `{}` in this scene", cue.id),
                    );
                }

                // Library steps were checked where they are declared
                for (step, at) in cue.actions.iter().zip(&draft.steps_at) {
                    if let Some(at) = at {
                        self.step_references(scenes, step, at, assets, components);
                    }
                }
            }
        }
    }

    fn step_references(
        &mut self,
        scenes: &[DraftScene],
        step: &CueAction,
        at: &StepAt,
        assets: &BTreeMap<AssetRef, AssetSpec>,
        components: &BTreeSet<ComponentType>,
    ) {
        if !components.contains(&step.target) {
            self.reference(
                field(&at.base, "target"),
                format!("target `{}` is not a declared component type", step.target),
            );
        }

        if let Some(asset) = &step.asset {
            if !assets.contains_key(asset) {
                self.reference(
                    field(&at.base, "asset"),
                    format!("asset `{asset}` is not in the manifest"),
                );
            }
        }

        if let CuePayload::Internal(InternalAction::Goto { scene: to, cue: to_cue }) = &step.payload {
            self.goto_target(scenes, to, to_cue.as_deref(), &field(&at.action_at, "params"));
        }
    }

    fn goto_target(&mut self, scenes: &[DraftScene], to: &str, to_cue: Option<&str>, at: &str) {
        let Some(target) = scenes.iter().find(|s| s.id.as_deref() == Some(to)) else {
            self.reference(at, format!("goto names unknown scene `{to}`"));
            return;
        };
        if let Some(cue_id) = to_cue {
            if !target.cues.iter().any(|c| c.cue.id == cue_id) {
                self.reference(
                    at,
                    format!("goto names unknown cue `{cue_id}` in scene `{to}`"),
                );
            }
        }
    }

    fn structure(&mut self, scenes: &[DraftScene]) {
        if scenes.is_empty() {
            self.structural("scenes", "an opus needs at least one scene");
        }

        let mut seen = HashSet::new();
        for scene in scenes {
            if scene.declared_cues == 0 {
                self.structural(&scene.location, "scene has no cues");
            }
            if let Some(id) = &scene.id {
                if !seen.insert(id.as_str()) {
                    self.structural(
                        field(&scene.location, "id"),
                        format!("duplicate scene id `{id}`"),
                    );
                }
            }
        }
    }
}

/// Assets, library actions and component types nothing uses
fn unreferenced(
    scenes: &[DraftScene],
    library: &BTreeMap<String, DraftAction>,
    assets: &BTreeMap<AssetRef, AssetSpec>,
    components: &BTreeSet<ComponentType>,
    used_actions: &BTreeSet<String>,
) -> Vec<ValidationIssue> {
    let steps = || {
        scenes
            .iter()
            .flat_map(|s| s.cues.iter().flat_map(|d| d.cue.actions.iter()))
    };
    let used_assets: HashSet<&AssetRef> = steps().filter_map(|a| a.asset.as_ref()).collect();
    let used_targets: HashSet<&ComponentType> = steps().map(|a| &a.target).collect();

    let mut warnings = Vec::new();
    for id in assets.keys().filter(|id| !used_assets.contains(id)) {
        warnings.push(ValidationIssue {
            kind: IssueKind::Unreferenced,
            location: format!("assets.{id}"),
            message: format!("asset `{id}` is never used by a cue"),
        });
    }
    for name in library.keys().filter(|name| !used_actions.contains(*name)) {
        warnings.push(ValidationIssue {
            kind: IssueKind::Unreferenced,
            location: format!("actions.{name}"),
            message: format!("action `{name}` is never used by a cue or composite"),
        });
    }
    for component in components
        .iter()
        .filter(|c| !c.is_internal() && !used_targets.contains(c))
    {
        warnings.push(ValidationIssue {
            kind: IssueKind::Unreferenced,
            location: "components".to_string(),
            message: format!("component type `{component}` is never targeted"),
        });
    }
    warnings
}

fn field(at: &str, key: &str) -> String {
    if at == "$" {
        key.to_string()
    } else {
        format!("{at}.{key}")
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a sequence",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn issues(text: &str) -> ValidationError {
        validate(text).expect_err("document should be invalid")
    }

    #[test]
    fn test_minimal_opus_is_valid() {
        let opus = validate(
            r"
components: [audio]
scenes:
  - id: s
    cues:
      - { id: c, target: audio, action: { cmd: play } }
",
        )
        .unwrap();
        assert_eq!(opus.version(), 1);
        assert!(opus.warnings().is_empty());
    }

    #[test]
    fn test_yaml_syntax_error_is_schema() {
        let err = issues("scenes: [unclosed");
        assert_eq!(err.issues().len(), 1);
        assert_eq!(err.issues()[0].kind, IssueKind::Schema);
    }

    #[test]
    fn test_dangling_asset_is_reference_not_schema() {
        let err = issues(
            r"
components: [audio]
scenes:
  - id: s
    cues:
      - { id: c, target: audio, action: { cmd: play }, asset: ghost }
",
        );
        assert!(!err.has(IssueKind::Schema));
        assert_eq!(err.count(IssueKind::Reference), 1);
        let issue = &err.issues()[0];
        assert_eq!(issue.location, "scenes[0].cues[0].asset");
        assert!(issue.message.contains("ghost"));
    }

    #[test]
    fn test_all_violations_reported_together() {
        let err = issues(
            r"
version: 1
components: [audio]
scenes:
  - id: a
    cues:
      - { id: c1, target: video, action: { cmd: play } }
      - { id: c1, target: audio, action: { cmd: play } }
      - { id: c3, action: { cmd: play } }
  - id: a
    cues: []
",
        );

        let kinds: Vec<IssueKind> = err.issues().iter().map(|i| i.kind).collect();
        assert_eq!(
            kinds,
            vec![
                IssueKind::Schema,     // c3 missing target
                IssueKind::Reference,  // video undeclared
                IssueKind::Reference,  // duplicate c1
                IssueKind::Structural, // empty scene
                IssueKind::Structural, // duplicate scene id
            ]
        );
    }

    #[test]
    fn test_wrong_types_are_schema() {
        let err = issues(
            r"
components: [audio]
scenes:
  - id: s
    cues:
      - id: c
        target: audio
        action: { cmd: play, params: [1, 2] }
        wait_for_ack: sometimes
        ack_timeout_ms: -5
",
        );
        assert_eq!(err.count(IssueKind::Schema), 3);
        assert!(!err.has(IssueKind::Reference));
    }

    #[test]
    fn test_unsupported_version() {
        let err = issues(
            r"
version: 7
components: []
scenes:
  - id: s
    cues:
      - { id: c, target: internal, action: { cmd: log, params: { text: hi } } }
",
        );
        assert_eq!(err.issues().len(), 1);
        assert_eq!(err.issues()[0].location, "version");
    }

    #[test]
    fn test_internal_actions_parse() {
        let opus = validate(
            r"
components: []
scenes:
  - id: one
    cues:
      - { id: note, target: internal, action: { cmd: log, params: { text: hello } } }
      - { id: loop, target: internal, action: { cmd: goto, params: { scene: two, cue: b } } }
  - id: two
    cues:
      - { id: a, target: internal, action: { cmd: log, params: { text: a } } }
      - { id: b, target: internal, action: { cmd: log, params: { text: b } } }
",
        )
        .unwrap();

        let cue = &opus.scenes()[0].cues[1];
        assert_eq!(
            cue.actions[0].payload,
            CuePayload::Internal(InternalAction::Goto {
                scene: "two".to_string(),
                cue: Some("b".to_string()),
            })
        );
    }

    #[test]
    fn test_internal_action_errors() {
        let err = issues(
            r"
components: []
scenes:
  - id: one
    cues:
      - { id: a, target: internal, action: { cmd: explode } }
      - { id: b, target: internal, action: { cmd: log } }
      - { id: c, target: internal, action: { cmd: goto, params: { scene: nowhere } } }
",
        );
        assert_eq!(err.count(IssueKind::Schema), 2);
        assert_eq!(err.count(IssueKind::Reference), 1);
    }

    #[test]
    fn test_inline_asset_is_lifted_into_manifest() {
        let opus = validate(
            r"
components: [video]
scenes:
  - id: intro
    cues:
      - id: film
        target: video
        action: { cmd: play }
        asset: { path: video/intro.mp4, checksum: abc }
",
        )
        .unwrap();

        let id = AssetRef::new("intro/film");
        assert_eq!(opus.scenes()[0].cues[0].actions[0].asset.as_ref(), Some(&id));
        let spec = opus.asset(&id).unwrap();
        assert_eq!(spec.path, "video/intro.mp4");
        assert_eq!(spec.checksum.as_deref(), Some("abc"));
    }

    #[test]
    fn test_asset_path_shorthand() {
        let opus = validate(
            r"
components: [audio]
assets:
  bell: sounds/bell.wav
scenes:
  - id: s
    cues:
      - { id: c, target: audio, action: { cmd: play }, asset: bell }
",
        )
        .unwrap();
        assert_eq!(
            opus.asset(&AssetRef::new("bell")).unwrap().path,
            "sounds/bell.wav"
        );
    }

    #[test]
    fn test_unused_entries_are_warnings() {
        let opus = validate(
            r"
components: [audio, lighting]
assets:
  spare: sounds/spare.wav
scenes:
  - id: s
    cues:
      - { id: c, target: audio, action: { cmd: play } }
",
        )
        .unwrap();

        assert_eq!(opus.warnings().len(), 2);
        assert!(opus
            .warnings()
            .iter()
            .all(|w| w.kind == IssueKind::Unreferenced));
    }

    #[test]
    fn test_missing_scenes_and_components() {
        let err = issues("assets: {}\n");
        assert_eq!(err.count(IssueKind::Schema), 2);
    }

    #[test]
    fn test_no_scenes_is_structural() {
        let err = issues("components: []\nscenes: []\n");
        assert_eq!(err.issues().len(), 1);
        assert_eq!(err.issues()[0].kind, IssueKind::Structural);
    }

    #[test]
    fn test_display_lists_every_issue() {
        let err = issues("components: []\nscenes: []\n");
        let text = err.to_string();
        assert!(text.starts_with("1 validation issue(s)"));
        assert!(text.contains("[structural] scenes"));
    }

    const LIBRARY: &str = r"
components: [audio, lighting]
assets:
  thunder: sounds/thunder.wav
actions:
  blackout: { target: lighting, cmd: fade, params: { level: 0 }, description: All dark }
  boom: { target: audio, cmd: play, asset: thunder }
  storm: [blackout, boom, { target: internal, cmd: log, params: { text: storm } }]
scenes:
  - id: s
    cues:
      - { id: dark, action: blackout }
      - { id: storm, action: storm }
      - { id: both, action: [boom, { target: audio, cmd: stop }] }
";

    #[test]
    fn test_named_actions_expand_into_steps() {
        let opus = validate(LIBRARY).unwrap();
        assert!(opus.warnings().is_empty());
        assert_eq!(opus.actions().len(), 3);
        assert_eq!(
            opus.action("blackout").unwrap().description.as_deref(),
            Some("All dark")
        );

        let cues = &opus.scenes()[0].cues;
        assert_eq!(cues[0].actions.len(), 1);
        assert_eq!(cues[0].actions[0].target, ComponentType::new("lighting"));

        let storm: Vec<&str> = cues[1].actions.iter().map(|a| a.target.as_str()).collect();
        assert_eq!(storm, vec!["lighting", "audio", "internal"]);
        assert!(cues[1]
            .actions
            .iter()
            .all(|a| a.name.as_deref() == Some("storm")));
        assert_eq!(cues[1].actions[1].asset, Some(AssetRef::new("thunder")));

        assert_eq!(cues[2].actions[0].name.as_deref(), Some("boom"));
        assert_eq!(cues[2].actions[1].name, None);
    }

    #[test]
    fn test_unknown_and_nested_action_names_are_reference() {
        let err = issues(
            r"
components: [audio]
actions:
  play: { target: audio, cmd: play }
  pair: [play, play]
  nested: [pair, ghost]
scenes:
  - id: s
    cues:
      - { id: a, action: missing }
      - { id: b, action: [play, nope] }
      - { id: c, action: nested }
",
        );
        assert!(!err.has(IssueKind::Schema));
        let locations: Vec<&str> = err
            .issues()
            .iter()
            .filter(|i| i.kind == IssueKind::Reference)
            .map(|i| i.location.as_str())
            .collect();
        assert_eq!(
            locations,
            vec![
                "actions.nested[0]",
                "actions.nested[1]",
                "scenes[0].cues[0].action",
                "scenes[0].cues[1].action[1]",
            ]
        );
    }

    #[test]
    fn test_library_steps_are_checked_where_declared() {
        let err = issues(
            r"
components: [audio]
actions:
  flash: { target: lighting, cmd: strobe }
  jump: { target: internal, cmd: goto, params: { scene: nowhere } }
scenes:
  - id: s
    cues:
      - { id: a, action: flash }
      - { id: b, action: flash }
      - { id: c, action: [jump, { target: audio, cmd: play, asset: ghost }] }
",
        );
        let locations: Vec<&str> = err.issues().iter().map(|i| i.location.as_str()).collect();
        assert_eq!(
            locations,
            vec![
                "actions.flash.target",
                "actions.jump.params",
                "scenes[0].cues[2].action[1].asset",
            ]
        );
    }

    #[test]
    fn test_named_action_rejects_cue_level_target() {
        let err = issues(
            r"
components: [audio]
actions:
  play: { target: audio, cmd: play }
scenes:
  - id: s
    cues:
      - { id: a, target: audio, asset: x, action: play }
      - { id: b, action: [] }
      - { id: c, action: 7 }
",
        );
        assert_eq!(err.count(IssueKind::Schema), 4);
        assert_eq!(err.issues()[0].location, "scenes[0].cues[0].target");
    }

    #[test]
    fn test_unused_library_action_is_warning() {
        let opus = validate(
            r"
components: [audio]
actions:
  spare: { target: audio, cmd: stop }
  used: { target: audio, cmd: play }
  pair: [used, used]
scenes:
  - id: s
    cues:
      - { id: c, action: used }
",
        )
        .unwrap();

        let flagged: Vec<&str> = opus.warnings().iter().map(|w| w.location.as_str()).collect();
        assert_eq!(flagged, vec!["actions.pair", "actions.spare"]);
    }

    #[test]
    fn test_library_inline_assets_are_lifted() {
        let opus = validate(
            r"
components: [audio]
actions:
  rain: { target: audio, cmd: play, asset: { path: sounds/rain.ogg } }
scenes:
  - id: s
    cues:
      - { id: c, action: rain }
",
        )
        .unwrap();
        let id = AssetRef::new("actions/rain");
        assert_eq!(opus.scenes()[0].cues[0].actions[0].asset.as_ref(), Some(&id));
        assert_eq!(opus.asset(&id).unwrap().path, "sounds/rain.ogg");
    }
}
