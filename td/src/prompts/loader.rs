//! Three-tier template resolution: a user override directory, a
//! repo-default directory, then an embedded `const &str` fallback.
//! Missing optional files resolve to an empty string, never an error.

use std::path::{Path, PathBuf};

use handlebars::Handlebars;
use serde::Serialize;
use tracing::debug;

use super::embedded;

pub struct PromptLoader {
    hbs: Handlebars<'static>,
    user_dir: Option<PathBuf>,
    repo_dir: Option<PathBuf>,
}

impl PromptLoader {
    /// `worktree` is the project root; `.claude/prompts/` is the user
    /// override directory, `prompts/` the repo default.
    pub fn new(worktree: impl AsRef<Path>) -> Self {
        let worktree = worktree.as_ref();
        debug!(?worktree, "PromptLoader::new: called");
        let user_dir = worktree.join(".claude/prompts");
        let repo_dir = worktree.join("prompts");
        Self {
            hbs: Handlebars::new(),
            user_dir: if user_dir.is_dir() { Some(user_dir) } else { None },
            repo_dir: if repo_dir.is_dir() { Some(repo_dir) } else { None },
        }
    }

    /// A loader with no filesystem directories, for tests.
    pub fn embedded_only() -> Self {
        Self { hbs: Handlebars::new(), user_dir: None, repo_dir: None }
    }

    /// Resolve `<name>.<ext>` through the three tiers, returning an
    /// empty string if it is nowhere to be found — callers decide
    /// whether the name is optional.
    fn load(&self, name: &str, ext: &str) -> String {
        if let Some(ref dir) = self.user_dir {
            let path = dir.join(format!("{name}.{ext}"));
            if let Ok(content) = std::fs::read_to_string(&path) {
                debug!(?path, "PromptLoader::load: found in user override");
                return content;
            }
        }
        if let Some(ref dir) = self.repo_dir {
            let path = dir.join(format!("{name}.{ext}"));
            if let Ok(content) = std::fs::read_to_string(&path) {
                debug!(?path, "PromptLoader::load: found in repo default");
                return content;
            }
        }
        if let Some(content) = embedded::get_embedded(name) {
            debug!(%name, "PromptLoader::load: found embedded fallback");
            return content.to_string();
        }
        debug!(%name, "PromptLoader::load: not found anywhere, returning empty");
        String::new()
    }

    /// The literal Mandatory Rules text. Always present (embedded),
    /// never resolved against the override directories — its wording
    /// is fixed, not a project-customisable template.
    pub fn mandatory_rules(&self) -> String {
        embedded::MANDATORY_RULES.to_string()
    }

    pub fn global_prelude_extra(&self) -> String {
        self.load("global-prelude", "md")
    }

    pub fn project_prelude(&self) -> String {
        self.load("project-prelude", "md")
    }

    pub fn output_epilogue(&self) -> String {
        self.load("output-epilogue", "md")
    }

    pub fn template_rules(&self, template_name: &str) -> String {
        self.load(&format!("{template_name}-rules"), "md")
    }

    pub fn template_output_format(&self, template_name: &str) -> String {
        self.load(&format!("{template_name}-output-format"), "md")
    }

    /// Render the modification-prompt Handlebars template with the
    /// given context (`{{detected_issues}}` as a bullet list,
    /// `{{original_task}}` as the verbatim prior prompt).
    pub fn render_modification_prompt<T: Serialize>(&self, context: &T) -> Result<String, handlebars::RenderError> {
        let template = self.load("modification-prompt", "pmt");
        self.hbs.render_template(&template, context)
    }
}
