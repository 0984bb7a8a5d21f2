//! # Config
//!
//! The one configuration surface: an `.ini` file sitting beside the
//! patcher module, sharing its base name. A single integer lookup is all
//! the patch list needs, so the reader is a line scanner with the usual
//! `.ini` tolerances rather than a full parser.

use std::fs;
use std::path::{Path, PathBuf};

/// Option value meaning "absent": returned when the file, the section, the
/// key, or a parsable value is missing.
pub const ABSENT: i32 = -1;

/// Derives the configuration path from the module path by swapping the
/// extension.
pub fn ini_path(module: &Path) -> PathBuf {
    module.with_extension("ini")
}

/// Looks up `key` under `[section]` in the file at `path` and parses the
/// value as an integer, returning `default` when any part of that fails.
pub fn int_option(path: &Path, section: &str, key: &str, default: i32) -> i32 {
    let Ok(text) = fs::read_to_string(path) else {
        return default;
    };
    parse_int_option(&text, section, key).unwrap_or(default)
}

/// Scanner behind [`int_option`]. Section and key matching is
/// case-insensitive; `;` starts a comment anywhere on a line.
fn parse_int_option(text: &str, section: &str, key: &str) -> Option<i32> {
    let mut in_section = false;
    for line in text.lines() {
        let line = line.split_once(';').map_or(line, |(before, _)| before).trim();
        if line.is_empty() {
            continue;
        }
        if let Some(header) = line.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
            in_section = header.trim().eq_ignore_ascii_case(section);
            continue;
        }
        if !in_section {
            continue;
        }
        let Some((name, value)) = line.split_once('=') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case(key) {
            return value.trim().parse().ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use super::*;

    fn write_ini(dir: &Path, contents: &str) -> PathBuf {
        let path = dir.join("patch.ini");
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn missing_file_returns_the_default() {
        assert_eq!(
            int_option(Path::new("/nonexistent/patch.ini"), "Patch", "FPSLimit", ABSENT),
            ABSENT
        );
    }

    #[test]
    fn present_value_is_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_ini(dir.path(), "[Patch]\nFPSLimit = 60\n");
        assert_eq!(int_option(&path, "Patch", "FPSLimit", ABSENT), 60);
    }

    #[test]
    fn section_and_key_match_case_insensitively() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_ini(dir.path(), "[patch]\nfpslimit=30\n");
        assert_eq!(int_option(&path, "Patch", "FPSLimit", ABSENT), 30);
    }

    #[test]
    fn key_in_another_section_does_not_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_ini(dir.path(), "[Other]\nFPSLimit = 60\n[Patch]\n");
        assert_eq!(int_option(&path, "Patch", "FPSLimit", ABSENT), ABSENT);
    }

    #[test]
    fn comments_and_whitespace_are_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_ini(
            dir.path(),
            "; frame cap override\n[ Patch ]\n  FPSLimit = -5  ; negative removes the cap\n",
        );
        assert_eq!(int_option(&path, "Patch", "FPSLimit", ABSENT), -5);
    }

    #[test]
    fn unparsable_value_returns_the_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_ini(dir.path(), "[Patch]\nFPSLimit = sixty\n");
        assert_eq!(int_option(&path, "Patch", "FPSLimit", ABSENT), ABSENT);
    }

    #[test]
    fn ini_path_swaps_the_extension() {
        assert_eq!(
            ini_path(Path::new("C:/games/scripts/patch.asi")),
            Path::new("C:/games/scripts/patch.ini")
        );
    }
}
