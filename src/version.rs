//! Build information
//!
//! Commit and branch come from `METALANCHOR_GIT_COMMIT` and
//! `METALANCHOR_GIT_BRANCH` at compile time, when the build sets them.

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn commit() -> Option<&'static str> {
    option_env!("METALANCHOR_GIT_COMMIT").filter(|s| !s.is_empty())
}

pub fn branch() -> Option<&'static str> {
    option_env!("METALANCHOR_GIT_BRANCH").filter(|s| !s.is_empty())
}

/// Human-readable version line for logs and `--version`
pub fn version_string() -> String {
    format_version(VERSION, commit(), branch())
}

/// Pure function - no I/O
pub fn format_version(version: &str, commit: Option<&str>, branch: Option<&str>) -> String {
    match (version.is_empty(), commit) {
        (false, Some(commit)) => format!(
            "version {} (commit {}, branch {})",
            version,
            commit,
            branch.unwrap_or("unknown")
        ),
        (true, Some(commit)) => {
            format!("(commit {}, branch {})", commit, branch.unwrap_or("unknown"))
        }
        (false, None) => format!("version {} (no build information)", version),
        (true, None) => "(no version or build info)".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_version() {
        assert_eq!(
            format_version("0.3.1", Some("abc123"), Some("main")),
            "version 0.3.1 (commit abc123, branch main)"
        );
        assert_eq!(
            format_version("", Some("abc123"), None),
            "(commit abc123, branch unknown)"
        );
        assert_eq!(
            format_version("0.3.1", None, None),
            "version 0.3.1 (no build information)"
        );
        assert_eq!(format_version("", None, None), "(no version or build info)");
    }

    #[test]
    fn test_version_string_mentions_crate_version() {
        assert!(version_string().contains(VERSION));
    }
}
