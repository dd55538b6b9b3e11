//! Built-in fallback templates, embedded into the binary so the
//! assembler always has something to render even when neither a user
//! override nor a repo default directory exists.

/// The literal Mandatory Rules block, auto-injected at the front of
/// every `global_prelude`. Wording is fixed: no omission markers, no
/// TODO/FIXME/TBD remnants, no unbalanced constructs, evidence
/// required before claiming completion, no early-termination
/// phrases, fail-closed when uncertain.
pub const MANDATORY_RULES: &str = include_str!("../../prompts/mandatory-rules.md");

pub const MODIFICATION_PROMPT: &str = include_str!("../../prompts/modification-prompt.pmt");

pub fn get_embedded(name: &str) -> Option<&'static str> {
    match name {
        "mandatory-rules" => Some(MANDATORY_RULES),
        "modification-prompt" => Some(MODIFICATION_PROMPT),
        _ => None,
    }
}
