//! Derived artifact names
//!
//! The derived name names the source file and, for languages like Java, is
//! also the entry point handed to the runtime. It always ends up as a path
//! component inside the scratch directory, so anything taken from
//! submitted source text is checked before use.

use regex::Regex;
use tracing::{debug, warn};

/// Longest name accepted as a path component (leaves room for extensions)
const MAX_NAME_LEN: usize = 200;

/// Check whether a name is usable as a single path component
///
/// Accepts letters, digits, `_` and `$` only, so separators and traversal
/// sequences cannot appear.
pub fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '$')
}

/// Derive an artifact name from source text
///
/// Tries each pattern in order and returns the first capture group of the
/// first match that is a safe name. Falls back to `default` otherwise.
pub fn derive_name(patterns: &[String], default: &str, source: &str) -> String {
    for pattern in patterns {
        let regex = match Regex::new(pattern) {
            Ok(regex) => regex,
            Err(e) => {
                warn!(pattern, error = %e, "skipping invalid name pattern");
                continue;
            }
        };

        let Some(candidate) = regex
            .captures(source)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
        else {
            continue;
        };

        if is_safe_name(candidate) {
            debug!(name = candidate, "derived name from source");
            return candidate.to_owned();
        }

        warn!(candidate, "rejected unsafe derived name");
    }

    default.to_owned()
}
