//! `PromptAssembler`: deterministic, fixed-order composition of a
//! prompt from template files and the caller's input. No caching —
//! every call re-resolves templates, so identical input always
//! produces identical output, not merely identical output while a
//! cache stays warm.

use tracing::debug;

use crate::domain::{ModificationPrompt, PromptSections};
use crate::error::PromptError;

use super::loader::PromptLoader;

/// The last five conversation entries are each truncated to 100
/// characters before being folded into the task-group prelude.
const CONVERSATION_ENTRY_TRUNCATE_LEN: usize = 100;
const CONVERSATION_ENTRY_MAX_COUNT: usize = 5;

#[derive(Debug, Clone, Default)]
pub struct LastTaskResult {
    pub files_modified: Vec<String>,
    pub error: Option<String>,
}

/// Context used to synthesise the task-group prelude: the group's
/// history, working files, and last result.
#[derive(Debug, Clone, Default)]
pub struct TaskGroupContext {
    pub group_id: String,
    pub working_files: Vec<String>,
    pub last_task_result: Option<LastTaskResult>,
    pub conversation_entries: Vec<String>,
}

impl TaskGroupContext {
    fn render(&self) -> String {
        let mut lines = vec![format!("Task group: {}", self.group_id)];

        if !self.working_files.is_empty() {
            lines.push(format!("Working files: {}", self.working_files.join(", ")));
        }

        if let Some(ref last) = self.last_task_result {
            if !last.files_modified.is_empty() {
                lines.push(format!("Last task modified: {}", last.files_modified.join(", ")));
            }
            if let Some(ref err) = last.error {
                lines.push(format!("Last task error: {err}"));
            }
        }

        let recent: Vec<String> = self
            .conversation_entries
            .iter()
            .rev()
            .take(CONVERSATION_ENTRY_MAX_COUNT)
            .rev()
            .map(|entry| truncate(entry, CONVERSATION_ENTRY_TRUNCATE_LEN))
            .collect();
        if !recent.is_empty() {
            lines.push("Recent conversation:".to_string());
            for entry in recent {
                lines.push(format!("- {entry}"));
            }
        }

        lines.join("\n")
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars { s.to_string() } else { s.chars().take(max_chars).collect() }
}

/// Optional per-template sections active only when a template is in
/// use for this task.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    pub template_name: Option<String>,
}

pub struct PromptAssembler {
    loader: PromptLoader,
}

impl PromptAssembler {
    pub fn new(loader: PromptLoader) -> Self {
        Self { loader }
    }

    /// Assemble a fresh prompt (no modification_prompt section).
    pub fn assemble(
        &self,
        user_input: &str,
        group_context: &TaskGroupContext,
        template: &TemplateContext,
    ) -> Result<PromptSections, PromptError> {
        self.assemble_inner(user_input, group_context, template, None)
    }

    /// Assemble a retry prompt with the modification preamble inserted
    /// immediately before `user_input`.
    pub fn assemble_with_modification(
        &self,
        user_input: &str,
        group_context: &TaskGroupContext,
        template: &TemplateContext,
        modification: &ModificationPrompt,
    ) -> Result<PromptSections, PromptError> {
        let rendered = self
            .loader
            .render_modification_prompt(modification)
            .map_err(|e| PromptError::Render(e.to_string()))?;
        self.assemble_inner(user_input, group_context, template, Some(rendered))
    }

    fn assemble_inner(
        &self,
        user_input: &str,
        group_context: &TaskGroupContext,
        template: &TemplateContext,
        modification_prompt: Option<String>,
    ) -> Result<PromptSections, PromptError> {
        debug!(user_input_len = user_input.len(), template = ?template.template_name, "PromptAssembler::assemble: called");
        if user_input.trim().is_empty() {
            return Err(PromptError::EmptyUserInput);
        }

        let global_prelude = {
            let mandatory = self.loader.mandatory_rules();
            let extra = self.loader.global_prelude_extra();
            if extra.is_empty() { mandatory } else { format!("{mandatory}\n\n{extra}") }
        };

        let (template_rules, template_output_format) = match &template.template_name {
            Some(name) => {
                let rules = self.loader.template_rules(name);
                let format = self.loader.template_output_format(name);
                (non_empty(rules), non_empty(format))
            }
            None => (None, None),
        };

        Ok(PromptSections {
            global_prelude,
            template_rules,
            project_prelude: self.loader.project_prelude(),
            task_group_prelude: group_context.render(),
            modification_prompt,
            user_input: user_input.to_string(),
            template_output_format,
            output_epilogue: self.loader.output_epilogue(),
        })
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() { None } else { Some(s) }
}
