//! NamespaceResolver
//!
//! Derives a stable, validated `Namespace` from an explicit name, an
//! environment variable, or a project path, so that "same folder = same
//! queue" without a central registry.

use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use tracing::debug;

use crate::error::NamespaceError;

/// Names reserved regardless of case.
const RESERVED: &[&str] = &["all", "none", "null", "undefined", "system"];

const MAX_LEN: usize = 32;

/// Environment variable read once at resolver construction time.
pub const NAMESPACE_ENV_VAR: &str = "PM_RUNNER_NAMESPACE";

/// The literal default namespace when nothing else applies.
pub const DEFAULT_NAMESPACE: &str = "default";

/// A validated namespace label. Construction is the only way to obtain
/// one, so an unvalidated string can never reach the queue store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Namespace(String);

impl Namespace {
    /// Validate and wrap a namespace string.
    pub fn try_new(name: impl Into<String>) -> Result<Self, NamespaceError> {
        let name = name.into();
        validate(&name)?;
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// State directory for this namespace under `project_root`.
    ///
    /// `<projectRoot>/.claude` for the default namespace,
    /// `<projectRoot>/.claude/state/<namespace>` otherwise.
    pub fn state_dir(&self, project_root: impl AsRef<Path>) -> PathBuf {
        let root = project_root.as_ref();
        if self.0 == DEFAULT_NAMESPACE {
            root.join(".claude")
        } else {
            root.join(".claude").join("state").join(&self.0)
        }
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Namespace {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Validate a candidate namespace string against the format rules.
///
/// 1-32 characters; starts and ends with alphanumeric; interior
/// characters are alphanumeric or hyphen; case-insensitive reservation
/// of a fixed set of names.
pub fn validate(name: &str) -> Result<(), NamespaceError> {
    debug!(%name, "namespace::validate: called");
    if name.is_empty() {
        return Err(NamespaceError::Empty);
    }
    if name.chars().count() > MAX_LEN {
        return Err(NamespaceError::TooLong(name.to_string()));
    }
    if RESERVED.iter().any(|r| r.eq_ignore_ascii_case(name)) {
        return Err(NamespaceError::Reserved(name.to_string()));
    }

    let chars: Vec<char> = name.chars().collect();
    let first_ok = chars.first().is_some_and(|c| c.is_ascii_alphanumeric());
    let last_ok = chars.last().is_some_and(|c| c.is_ascii_alphanumeric());
    let interior_ok = chars.iter().all(|c| c.is_ascii_alphanumeric() || *c == '-');

    if !first_ok || !last_ok || !interior_ok {
        return Err(NamespaceError::InvalidFormat(name.to_string()));
    }
    Ok(())
}

/// Derive a namespace candidate from a project path.
///
/// Normalises separators, strips a trailing slash, lowercases the
/// basename, replaces underscores with hyphens, strips any character
/// outside `[a-z0-9-]`, collapses repeated hyphens, trims leading and
/// trailing hyphens (falling back to `"project"` if that leaves
/// nothing), then appends `-<4-hex-of-md5(full-normalised-path)>`,
/// truncating the folder portion so the total length is <= 32 and does
/// not end in a hyphen.
pub fn derive_from_path(path: impl AsRef<Path>) -> String {
    let path = path.as_ref();
    debug!(?path, "namespace::derive_from_path: called");

    let normalised = normalise_path(path);
    let basename = normalised
        .rsplit('/')
        .find(|s| !s.is_empty())
        .unwrap_or("");

    let mut folder: String = basename
        .to_lowercase()
        .chars()
        .map(|c| if c == '_' { '-' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect();
    folder = collapse_hyphens(&folder);
    folder = folder.trim_matches('-').to_string();
    if folder.is_empty() {
        folder = "project".to_string();
    }

    let hex = hex4_of_md5(&normalised);
    let suffix_len = 1 + hex.len(); // '-' + 4 hex chars
    let max_folder_len = MAX_LEN.saturating_sub(suffix_len);
    if folder.chars().count() > max_folder_len {
        folder = folder.chars().take(max_folder_len).collect();
        folder = folder.trim_end_matches('-').to_string();
    }

    format!("{folder}-{hex}")
}

fn normalise_path(path: &Path) -> String {
    let s = path.to_string_lossy().replace('\\', "/");
    s.trim_end_matches('/').to_string()
}

fn collapse_hyphens(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_hyphen = false;
    for c in s.chars() {
        if c == '-' {
            if !prev_hyphen {
                out.push(c);
            }
            prev_hyphen = true;
        } else {
            out.push(c);
            prev_hyphen = false;
        }
    }
    out
}

fn hex4_of_md5(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    let full = format!("{digest:x}");
    full[..4].to_string()
}

/// Inputs accepted by `build`, in priority order: explicit name > env
/// variable > path derivation (if `auto_derive`) > the literal default.
#[derive(Debug, Default)]
pub struct BuildOptions<'a> {
    pub explicit_name: Option<&'a str>,
    pub env_value: Option<&'a str>,
    pub project_root: Option<&'a Path>,
    pub auto_derive: bool,
}

/// Resolve a `Namespace` following the priority chain. An invalid
/// result (explicit name fails validation, for example) is a hard
/// error; derived/default names are always valid by construction.
pub fn build(opts: &BuildOptions<'_>) -> Result<Namespace, NamespaceError> {
    debug!(?opts.explicit_name, ?opts.env_value, auto_derive = opts.auto_derive, "namespace::build: called");

    if let Some(name) = opts.explicit_name {
        return Namespace::try_new(name);
    }
    if let Some(env_value) = opts.env_value {
        return Namespace::try_new(env_value);
    }
    if opts.auto_derive
        && let Some(root) = opts.project_root
    {
        let derived = derive_from_path(root);
        return Namespace::try_new(derived);
    }
    Namespace::try_new(DEFAULT_NAMESPACE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_empty() {
        assert!(matches!(validate(""), Err(NamespaceError::Empty)));
    }

    #[test]
    fn validate_rejects_too_long() {
        let long = "a".repeat(33);
        assert!(matches!(validate(&long), Err(NamespaceError::TooLong(_))));
    }

    #[test]
    fn validate_rejects_reserved_case_insensitive() {
        assert!(matches!(validate("ALL"), Err(NamespaceError::Reserved(_))));
        assert!(matches!(validate("System"), Err(NamespaceError::Reserved(_))));
    }

    #[test]
    fn validate_rejects_leading_or_trailing_hyphen() {
        assert!(validate("-abc").is_err());
        assert!(validate("abc-").is_err());
    }

    #[test]
    fn validate_accepts_interior_hyphens() {
        assert!(validate("my-project").is_ok());
    }

    #[test]
    fn derive_from_path_matches_spec_example() {
        let ns = derive_from_path("/Users/masa/dev/my-project");
        assert!(ns.starts_with("my-project-"));
        assert!(ns.len() <= MAX_LEN);
        let hex = &ns[ns.len() - 4..];
        assert_eq!(hex.len(), 4);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn derive_from_path_is_deterministic() {
        let a = derive_from_path("/a/b/my-project");
        let b = derive_from_path("/a/b/my-project");
        assert_eq!(a, b);
    }

    #[test]
    fn derive_from_path_handles_trailing_slash() {
        let a = derive_from_path("/a/b/my-project");
        let b = derive_from_path("/a/b/my-project/");
        assert_eq!(a, b);
    }

    #[test]
    fn derive_from_path_sanitizes_underscores_and_invalid_chars() {
        let ns = derive_from_path("/home/user/My_Weird!!Project");
        assert!(ns.starts_with("my-weird-project-") || ns.starts_with("my-weirdproject-"));
        assert!(validate(&ns).is_ok());
    }

    #[test]
    fn derive_from_path_empty_basename_falls_back_to_project() {
        let ns = derive_from_path("/___/");
        assert!(ns.starts_with("project-"));
    }

    #[test]
    fn derive_from_path_truncates_long_folder_names() {
        let long_name = "a".repeat(60);
        let ns = derive_from_path(format!("/x/{long_name}"));
        assert!(ns.len() <= MAX_LEN);
        assert!(!ns.ends_with('-') || ns.ends_with(&ns[ns.len() - 4..]));
        assert!(validate(&ns).is_ok());
    }

    #[test]
    fn build_prefers_explicit_name_over_env_and_path() {
        let opts = BuildOptions {
            explicit_name: Some("explicit-ns"),
            env_value: Some("env-ns"),
            project_root: Some(Path::new("/tmp/proj")),
            auto_derive: true,
        };
        let ns = build(&opts).unwrap();
        assert_eq!(ns.as_str(), "explicit-ns");
    }

    #[test]
    fn build_falls_back_to_env_then_path_then_default() {
        let env_only = BuildOptions {
            explicit_name: None,
            env_value: Some("env-ns"),
            project_root: Some(Path::new("/tmp/proj")),
            auto_derive: true,
        };
        assert_eq!(build(&env_only).unwrap().as_str(), "env-ns");

        let path_only = BuildOptions {
            explicit_name: None,
            env_value: None,
            project_root: Some(Path::new("/tmp/my-project")),
            auto_derive: true,
        };
        assert!(build(&path_only).unwrap().as_str().starts_with("my-project-"));

        let none = BuildOptions::default();
        assert_eq!(build(&none).unwrap().as_str(), DEFAULT_NAMESPACE);
    }

    #[test]
    fn build_rejects_invalid_explicit_name() {
        let opts = BuildOptions {
            explicit_name: Some("system"),
            ..Default::default()
        };
        assert!(build(&opts).is_err());
    }

    #[test]
    fn state_dir_uses_claude_root_for_default_namespace() {
        let ns = Namespace::try_new(DEFAULT_NAMESPACE).unwrap();
        let dir = ns.state_dir("/home/u/proj");
        assert_eq!(dir, PathBuf::from("/home/u/proj/.claude"));
    }

    #[test]
    fn state_dir_uses_state_subdir_for_named_namespace() {
        let ns = Namespace::try_new("my-project-ab12").unwrap();
        let dir = ns.state_dir("/home/u/proj");
        assert_eq!(dir, PathBuf::from("/home/u/proj/.claude/state/my-project-ab12"));
    }
}
