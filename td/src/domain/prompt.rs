//! Prompt section data carried between the assembler and its caller.

use serde::{Deserialize, Serialize};

/// The extra preamble inserted immediately before `user_input` on a
/// retry after a review rejects the prior output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModificationPrompt {
    pub detected_issues: Vec<String>,
    pub original_task: String,
}

/// The ordered pieces assembled into one prompt. Kept individually so
/// callers can log each section without re-parsing the joined text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptSections {
    pub global_prelude: String,
    pub template_rules: Option<String>,
    pub project_prelude: String,
    pub task_group_prelude: String,
    pub modification_prompt: Option<String>,
    pub user_input: String,
    pub template_output_format: Option<String>,
    pub output_epilogue: String,
}

impl PromptSections {
    /// Join every present section with a blank line, in a fixed
    /// order.
    pub fn joined(&self) -> String {
        let mut parts = vec![self.global_prelude.as_str()];
        if let Some(ref t) = self.template_rules {
            parts.push(t);
        }
        parts.push(self.project_prelude.as_str());
        parts.push(self.task_group_prelude.as_str());
        if let Some(ref m) = self.modification_prompt {
            parts.push(m);
        }
        parts.push(self.user_input.as_str());
        if let Some(ref t) = self.template_output_format {
            parts.push(t);
        }
        parts.push(self.output_epilogue.as_str());
        parts.into_iter().filter(|s| !s.is_empty()).collect::<Vec<_>>().join("\n\n")
    }
}
