//! Serializable mirror of the opus document format

use std::collections::BTreeMap;

use serde::Serialize;

use super::{Cue, CueAction, CuePayload, InternalAction, NamedAction, Opus};

#[derive(Serialize)]
pub(super) struct OpusDocument<'a> {
    version: u32,
    components: Vec<&'a str>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    assets: BTreeMap<&'a str, AssetEntry<'a>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    actions: BTreeMap<&'a str, LibraryEntry<'a>>,
    scenes: Vec<SceneEntry<'a>>,
}

#[derive(Serialize)]
struct AssetEntry<'a> {
    path: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    checksum: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum LibraryEntry<'a> {
    Single(SingleEntry<'a>),
    Composite(Vec<UseEntry<'a>>),
}

#[derive(Serialize)]
struct SingleEntry<'a> {
    #[serde(flatten)]
    step: StepEntry<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
}

#[derive(Serialize)]
struct SceneEntry<'a> {
    id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<&'a str>,
    cues: Vec<CueEntry<'a>>,
}

#[derive(Serialize)]
struct CueEntry<'a> {
    id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    target: Option<&'a str>,
    action: CueActionEntry<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    asset: Option<&'a str>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    wait_for_ack: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ack_timeout_ms: Option<u128>,
}

/// The three shapes a cue's `action` can take
#[derive(Serialize)]
#[serde(untagged)]
enum CueActionEntry<'a> {
    Inline(ActionEntry<'a>),
    Named(&'a str),
    List(Vec<UseEntry<'a>>),
}

/// A list item: a library name or a step with its own target
#[derive(Serialize)]
#[serde(untagged)]
enum UseEntry<'a> {
    Named(&'a str),
    Step(StepEntry<'a>),
}

#[derive(Serialize)]
struct StepEntry<'a> {
    target: &'a str,
    #[serde(flatten)]
    action: ActionEntry<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    asset: Option<&'a str>,
}

#[derive(Serialize)]
struct ActionEntry<'a> {
    cmd: &'a str,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    params: serde_json::Map<String, serde_json::Value>,
}

impl<'a> OpusDocument<'a> {
    pub(super) fn from_opus(opus: &'a Opus) -> Self {
        let components = opus
            .components
            .iter()
            .filter(|c| !c.is_internal())
            .map(|c| c.as_str())
            .collect();

        let assets = opus
            .assets
            .values()
            .map(|spec| {
                let entry = AssetEntry {
                    path: &spec.path,
                    checksum: spec.checksum.as_deref(),
                };
                (spec.id.as_str(), entry)
            })
            .collect();

        let actions = opus
            .actions
            .values()
            .map(|named| (named.name.as_str(), LibraryEntry::from_named(named)))
            .collect();

        let scenes = opus
            .scenes
            .iter()
            .map(|scene| SceneEntry {
                id: &scene.id,
                title: scene.title.as_deref(),
                cues: scene
                    .cues
                    .iter()
                    .map(|cue| CueEntry::from_cue(opus, cue))
                    .collect(),
            })
            .collect();

        Self {
            version: opus.version,
            components,
            assets,
            actions,
            scenes,
        }
    }
}

impl<'a> LibraryEntry<'a> {
    fn from_named(named: &'a NamedAction) -> Self {
        match named.steps.as_slice() {
            [step] if step.name.as_deref() == Some(named.name.as_str()) => {
                Self::Single(SingleEntry {
                    step: StepEntry::from_action(step),
                    description: named.description.as_deref(),
                })
            }
            steps => Self::Composite(
                steps
                    .iter()
                    .map(|step| match step.name.as_deref() {
                        Some(name) => UseEntry::Named(name),
                        None => UseEntry::Step(StepEntry::from_action(step)),
                    })
                    .collect(),
            ),
        }
    }
}

impl<'a> CueEntry<'a> {
    fn from_cue(opus: &'a Opus, cue: &'a Cue) -> Self {
        let mut entry = Self {
            id: &cue.id,
            target: None,
            action: CueActionEntry::List(Vec::new()),
            asset: None,
            wait_for_ack: cue.wait_for_ack,
            description: cue.description.as_deref(),
            ack_timeout_ms: cue.ack_timeout.map(|t| t.as_millis()),
        };

        if let [step] = cue.actions.as_slice() {
            if step.name.is_none() {
                entry.target = Some(step.target.as_str());
                entry.action = CueActionEntry::Inline(ActionEntry::from_payload(&step.payload));
                entry.asset = step.asset.as_ref().map(|a| a.as_str());
                return entry;
            }
        }

        // Consecutive steps from one library entry collapse back to its name
        let mut uses = Vec::new();
        let mut rest = cue.actions.as_slice();
        while let Some(step) = rest.first() {
            let expanded = step
                .name
                .as_deref()
                .and_then(|name| opus.action(name).map(|named| (name, named.steps.len().max(1))));
            match expanded {
                Some((name, len)) => {
                    uses.push(UseEntry::Named(name));
                    rest = rest.get(len..).unwrap_or_default();
                }
                None => {
                    uses.push(UseEntry::Step(StepEntry::from_action(step)));
                    rest = &rest[1..];
                }
            }
        }

        let single = match uses.as_slice() {
            [UseEntry::Named(name)] => Some(*name),
            _ => None,
        };
        entry.action = match single {
            Some(name) => CueActionEntry::Named(name),
            None => CueActionEntry::List(uses),
        };
        entry
    }
}

impl<'a> StepEntry<'a> {
    fn from_action(step: &'a CueAction) -> Self {
        Self {
            target: step.target.as_str(),
            action: ActionEntry::from_payload(&step.payload),
            asset: step.asset.as_ref().map(|a| a.as_str()),
        }
    }
}

impl<'a> ActionEntry<'a> {
    fn from_payload(payload: &'a CuePayload) -> Self {
        match payload {
            CuePayload::Command { cmd, params } => Self {
                cmd,
                params: params.clone(),
            },
            CuePayload::Internal(InternalAction::Log { text }) => {
                let mut params = serde_json::Map::new();
                params.insert("text".to_string(), text.clone().into());
                Self { cmd: "log", params }
            }
            CuePayload::Internal(InternalAction::Goto { scene, cue }) => {
                let mut params = serde_json::Map::new();
                params.insert("scene".to_string(), scene.clone().into());
                if let Some(cue) = cue {
                    params.insert("cue".to_string(), cue.clone().into());
                }
                Self { cmd: "goto", params }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::parse;

    #[test]
    fn test_internal_and_inline_assets_survive_roundtrip() {
        let opus = parse(
            r"
components: [video]
scenes:
  - id: intro
    title: Opening
    cues:
      - id: film
        target: video
        action: { cmd: play }
        asset: { path: video/intro.mp4 }
        wait_for_ack: true
        ack_timeout_ms: 1500
        description: Roll the film
      - id: back
        target: internal
        action: { cmd: goto, params: { scene: intro, cue: film } }
",
        )
        .unwrap();

        let yaml = opus.to_yaml().unwrap();
        assert!(yaml.contains("intro/film"));
        assert!(!yaml.contains("internal\n- "));
        assert_eq!(parse(&yaml).unwrap(), opus);
    }

    #[test]
    fn test_named_and_composite_actions_survive_roundtrip() {
        let opus = parse(
            r"
components: [audio, lighting]
actions:
  blackout: { target: lighting, cmd: fade, params: { level: 0 }, description: All dark }
  storm:
    - blackout
    - { target: audio, cmd: play, asset: { path: sounds/thunder.wav } }
scenes:
  - id: act
    cues:
      - { id: dark, action: blackout }
      - { id: storm, action: storm, wait_for_ack: true }
      - id: mixed
        action: [storm, { target: audio, cmd: stop }, blackout]
",
        )
        .unwrap();

        let yaml = opus.to_yaml().unwrap();
        assert!(yaml.contains("actions/storm/1"));
        let reloaded = parse(&yaml).unwrap();
        assert_eq!(reloaded, opus);
        assert_eq!(reloaded.scenes()[0].cues[2].actions.len(), 4);
    }
}
