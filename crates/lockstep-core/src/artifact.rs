//! Artifact path convention and front-matter metadata.
//!
//! Artifacts are Markdown files with an optional YAML front-matter block:
//!
//! ```text
//! ---
//! story: "5.1"
//! title: Login
//! state: todo
//! ---
//! <body, kept verbatim>
//! ```
//!
//! Only the `epic`, `story`, `title` and `state` keys are read or written;
//! any other key survives a rewrite untouched.

use chrono::NaiveDate;
use serde_yaml::{Mapping, Value};
use std::path::{Component, Path, PathBuf};

use crate::config::LayoutConfig;
use crate::error::{Result, StateError};
use crate::model::{CeremonyKind, StoryState};

const FENCE: &str = "---";

pub const KEY_EPIC: &str = "epic";
pub const KEY_STORY: &str = "story";
pub const KEY_TITLE: &str = "title";
pub const KEY_STATE: &str = "state";

/// What a path under the artifact tree refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactKind {
    Epic { epic_num: i64 },
    Story { epic_num: i64, story_id: String },
    Transcript { epic_num: Option<i64> },
}

/// Maps entities to their artifact paths (relative to the working tree).
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    config: LayoutConfig,
}

impl ArtifactLayout {
    #[must_use]
    pub const fn new(config: LayoutConfig) -> Self {
        Self { config }
    }

    /// `epics/epic-<N>/epic-<N>.md`
    #[must_use]
    pub fn epic_path(&self, epic_num: i64) -> String {
        format!(
            "{}/epic-{epic_num}/epic-{epic_num}.{}",
            self.config.epics, self.config.extension
        )
    }

    /// `stories/epic-<N>/<story_id>.md`
    #[must_use]
    pub fn story_path(&self, epic_num: i64, story_id: &str) -> String {
        format!(
            "{}/epic-{epic_num}/{story_id}.{}",
            self.config.stories, self.config.extension
        )
    }

    /// `ceremonies/epic-<N>/<kind>-<YYYY-MM-DD>.md`, with a `-<k>` suffix for
    /// the k-th extra ceremony of the same kind on the same day. Ceremonies
    /// without an epic go under `ceremonies/general/`.
    #[must_use]
    pub fn transcript_path(
        &self,
        epic_num: Option<i64>,
        kind: CeremonyKind,
        held_on: NaiveDate,
        ordinal: u32,
    ) -> String {
        let scope = epic_num.map_or_else(|| "general".to_string(), |n| format!("epic-{n}"));
        let date = held_on.format("%Y-%m-%d");
        let suffix = if ordinal == 0 {
            String::new()
        } else {
            format!("-{ordinal}")
        };
        format!(
            "{}/{scope}/{kind}-{date}{suffix}.{}",
            self.config.ceremonies, self.config.extension
        )
    }

    /// Classify a relative path against the convention.
    #[must_use]
    pub fn classify(&self, rel_path: &str) -> Option<ArtifactKind> {
        let parts: Vec<&str> = rel_path.split('/').collect();
        let [category, scope, file] = parts.as_slice() else {
            return None;
        };
        let stem = file.strip_suffix(&format!(".{}", self.config.extension))?;

        if *category == self.config.ceremonies {
            let epic_num = match *scope {
                "general" => None,
                other => Some(parse_epic_dir(other)?),
            };
            let kind = CeremonyKind::ALL
                .iter()
                .find(|kind| stem.starts_with(&format!("{}-", kind.as_str())))?;
            let date = stem.get(kind.as_str().len() + 1..)?.get(..10)?;
            NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?;
            return Some(ArtifactKind::Transcript { epic_num });
        }

        let epic_num = parse_epic_dir(scope)?;
        if *category == self.config.epics {
            (stem == format!("epic-{epic_num}")).then_some(ArtifactKind::Epic { epic_num })
        } else if *category == self.config.stories {
            crate::service::story::validate_story_id(stem, epic_num)
                .ok()
                .map(|()| ArtifactKind::Story {
                    epic_num,
                    story_id: stem.to_string(),
                })
        } else {
            None
        }
    }
}

fn parse_epic_dir(dir: &str) -> Option<i64> {
    dir.strip_prefix("epic-")?
        .parse::<i64>()
        .ok()
        .filter(|n| *n > 0)
}

/// Reject absolute paths and any `..`/`.` component.
///
/// # Errors
///
/// [`StateError::Validation`] for a path that could escape the tree.
pub fn validate_relative(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(StateError::Validation("artifact path is empty".to_string()));
    }
    for component in path.components() {
        match component {
            Component::Normal(_) => {}
            _ => {
                return Err(StateError::Validation(format!(
                    "artifact path must be relative without '.' or '..': {}",
                    path.display()
                )));
            }
        }
    }
    Ok(())
}

/// Join a validated relative path onto the tree root.
///
/// # Errors
///
/// See [`validate_relative`].
pub fn resolve(root: &Path, rel: &str) -> Result<PathBuf> {
    let rel = Path::new(rel);
    validate_relative(rel)?;
    Ok(root.join(rel))
}

/// A parsed artifact: front-matter mapping plus verbatim body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    pub front: Mapping,
    pub body: String,
}

impl Document {
    /// Split and parse `text`. Text without a leading fence is all body.
    ///
    /// # Errors
    ///
    /// [`StateError::Validation`] when the front matter is not a YAML mapping
    /// or the closing fence is missing.
    pub fn parse(text: &str) -> Result<Self> {
        let Some(rest) = text
            .strip_prefix("---\n")
            .or_else(|| text.strip_prefix("---\r\n"))
        else {
            return Ok(Self {
                front: Mapping::new(),
                body: text.to_string(),
            });
        };

        let mut offset = 0;
        for line in rest.split_inclusive('\n') {
            if line.trim_end_matches(['\r', '\n']) == FENCE {
                let yaml = &rest[..offset];
                let body = &rest[offset + line.len()..];
                let front = if yaml.trim().is_empty() {
                    Mapping::new()
                } else {
                    match serde_yaml::from_str::<Value>(yaml) {
                        Ok(Value::Mapping(map)) => map,
                        Ok(_) => {
                            return Err(StateError::Validation(
                                "front matter must be a mapping".to_string(),
                            ));
                        }
                        Err(err) => {
                            return Err(StateError::Validation(format!(
                                "malformed front matter: {err}"
                            )));
                        }
                    }
                };
                return Ok(Self {
                    front,
                    body: body.to_string(),
                });
            }
            offset += line.len();
        }

        Err(StateError::Validation(
            "front matter is missing its closing fence".to_string(),
        ))
    }

    /// Render front matter (when non-empty) followed by the body.
    ///
    /// # Errors
    ///
    /// [`StateError::Internal`] if YAML serialization fails.
    pub fn render(&self) -> Result<String> {
        if self.front.is_empty() {
            return Ok(self.body.clone());
        }
        let yaml = serde_yaml::to_string(&self.front)
            .map_err(|err| StateError::Internal(format!("render front matter: {err}")))?;
        Ok(format!("{FENCE}\n{yaml}{FENCE}\n{}", self.body))
    }

    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.front.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    #[must_use]
    pub fn title(&self) -> Option<String> {
        self.get_str(KEY_TITLE).filter(|t| !t.trim().is_empty())
    }

    /// Story state from front matter. Unknown values read as absent.
    #[must_use]
    pub fn story_state(&self) -> Option<StoryState> {
        self.get_str(KEY_STATE)?.parse().ok()
    }

    pub fn set_str(&mut self, key: &str, value: &str) {
        self.front
            .insert(Value::String(key.to_string()), Value::String(value.to_string()));
    }

    pub fn set_int(&mut self, key: &str, value: i64) {
        self.front
            .insert(Value::String(key.to_string()), Value::Number(value.into()));
    }
}

/// Epic artifact content: metadata plus caller-supplied body.
///
/// # Errors
///
/// [`StateError::Internal`] if rendering fails.
pub fn epic_document(epic_num: i64, title: &str, body: &str) -> Result<String> {
    let mut doc = Document {
        front: Mapping::new(),
        body: body.to_string(),
    };
    doc.set_int(KEY_EPIC, epic_num);
    doc.set_str(KEY_TITLE, title.trim());
    doc.render()
}

/// Story artifact content: metadata plus caller-supplied body.
///
/// # Errors
///
/// [`StateError::Internal`] if rendering fails.
pub fn story_document(
    story_id: &str,
    epic_num: i64,
    title: &str,
    state: StoryState,
    body: &str,
) -> Result<String> {
    let mut doc = Document {
        front: Mapping::new(),
        body: body.to_string(),
    };
    doc.set_str(KEY_STORY, story_id);
    doc.set_int(KEY_EPIC, epic_num);
    doc.set_str(KEY_TITLE, title.trim());
    doc.set_str(KEY_STATE, state.as_str());
    doc.render()
}

#[cfg(test)]
mod tests {
    use super::{ArtifactKind, ArtifactLayout, Document, story_document, validate_relative};
    use crate::config::LayoutConfig;
    use crate::model::{CeremonyKind, StoryState};
    use chrono::NaiveDate;
    use std::path::Path;

    fn layout() -> ArtifactLayout {
        ArtifactLayout::new(LayoutConfig::default())
    }

    #[test]
    fn paths_follow_convention() {
        let layout = layout();
        assert_eq!(layout.epic_path(5), "epics/epic-5/epic-5.md");
        assert_eq!(layout.story_path(5, "5.1"), "stories/epic-5/5.1.md");
        let date = NaiveDate::from_ymd_opt(2026, 6, 2).expect("date");
        assert_eq!(
            layout.transcript_path(Some(5), CeremonyKind::Retrospective, date, 0),
            "ceremonies/epic-5/retrospective-2026-06-02.md"
        );
        assert_eq!(
            layout.transcript_path(None, CeremonyKind::Standup, date, 2),
            "ceremonies/general/standup-2026-06-02-2.md"
        );
    }

    #[test]
    fn classify_recognizes_each_category() {
        let layout = layout();
        assert_eq!(
            layout.classify("epics/epic-5/epic-5.md"),
            Some(ArtifactKind::Epic { epic_num: 5 })
        );
        assert_eq!(
            layout.classify("stories/epic-5/5.3.md"),
            Some(ArtifactKind::Story {
                epic_num: 5,
                story_id: "5.3".to_string()
            })
        );
        assert_eq!(
            layout.classify("ceremonies/epic-5/standup-2026-01-09-1.md"),
            Some(ArtifactKind::Transcript { epic_num: Some(5) })
        );
        for other in [
            "README.md",
            "epics/epic-5/notes.md",
            "stories/epic-5/6.1.md",
            "stories/epic-x/5.1.md",
            "stories/epic-5/5.1.txt",
            "ceremonies/epic-5/party-2026-01-09.md",
            "ceremonies/epic-5/standup-yesterday.md",
            ".lockstep/state.sqlite3",
        ] {
            assert_eq!(layout.classify(other), None, "{other}");
        }
    }

    #[test]
    fn relative_paths_only() {
        assert!(validate_relative(Path::new("stories/epic-1/1.1.md")).is_ok());
        assert!(validate_relative(Path::new("/etc/passwd")).is_err());
        assert!(validate_relative(Path::new("stories/../../x")).is_err());
        assert!(validate_relative(Path::new("./x")).is_err());
        assert!(validate_relative(Path::new("")).is_err());
    }

    #[test]
    fn parse_preserves_unknown_keys_and_body() {
        let text = "---\nstory: '5.1'\ntitle: Login\nstate: todo\nowner: ana\n---\n# Login\n\nBody text.\n";
        let mut doc = Document::parse(text).expect("parse");
        assert_eq!(doc.title().as_deref(), Some("Login"));
        assert_eq!(doc.story_state(), Some(StoryState::Todo));
        assert_eq!(doc.body, "# Login\n\nBody text.\n");

        doc.set_str("state", "in_progress");
        let rendered = doc.render().expect("render");
        let reparsed = Document::parse(&rendered).expect("reparse");
        assert_eq!(reparsed.story_state(), Some(StoryState::InProgress));
        assert_eq!(reparsed.get_str("owner").as_deref(), Some("ana"));
        assert_eq!(reparsed.body, doc.body);
    }

    #[test]
    fn text_without_front_matter_is_body() {
        let doc = Document::parse("# Plain\n").expect("parse");
        assert!(doc.front.is_empty());
        assert_eq!(doc.render().expect("render"), "# Plain\n");
    }

    #[test]
    fn malformed_front_matter_is_rejected() {
        assert!(Document::parse("---\ntitle: [unclosed\n---\n").is_err());
        assert!(Document::parse("---\n- a\n- b\n---\n").is_err());
        assert!(Document::parse("---\ntitle: x\n").is_err());
    }

    #[test]
    fn story_document_carries_metadata() {
        let text = story_document("5.1", 5, "Login", StoryState::Todo, "Body\n").expect("render");
        let doc = Document::parse(&text).expect("parse");
        assert_eq!(doc.get_str("story").as_deref(), Some("5.1"));
        assert_eq!(doc.get_str("epic").as_deref(), Some("5"));
        assert_eq!(doc.body, "Body\n");
    }
}
