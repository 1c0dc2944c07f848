//! Checks for `requirements.txt`-style pin lists.
//!
//! Every line that is not blank or a comment must read `name==version`, and
//! a package may not be pinned to two different versions. Names are compared
//! after PEP 503 normalisation, so `Flask_Login` and `flask-login` clash.

use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum ManifestError {
    #[error("line {line}: expected `name==version`, found `{content}`")]
    Malformed { line: usize, content: String },
    #[error(
        "line {line}: `{name}` pinned to {version}, but line {first_line} pins {first_version}"
    )]
    Conflict {
        name: String,
        first_line: usize,
        first_version: String,
        line: usize,
        version: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestEntry {
    /// 1-based line number in the source text.
    pub line: usize,
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Manifest {
    pub entries: Vec<ManifestEntry>,
}

fn pin_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^([A-Za-z0-9](?:[A-Za-z0-9._-]*[A-Za-z0-9])?)\s*==\s*([A-Za-z0-9][A-Za-z0-9.+!_-]*)$",
        )
        .expect("valid pin regex")
    })
}

fn separator_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[-_.]+").expect("valid separator regex"))
}

/// PEP 503 name normalisation: lowercase, separator runs become `-`.
pub fn normalize_name(name: &str) -> String {
    separator_pattern()
        .replace_all(&name.to_lowercase(), "-")
        .into_owned()
}

/// Drops comments and surrounding whitespace. `None` for lines with no pin.
fn strip_line(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    // Inline comments need whitespace before the `#`.
    let content = match trimmed.find(" #").or_else(|| trimmed.find("\t#")) {
        Some(idx) => trimmed[..idx].trim_end(),
        None => trimmed,
    };
    Some(content)
}

fn parse_line(number: usize, raw: &str) -> Result<Option<ManifestEntry>, ManifestError> {
    let Some(content) = strip_line(raw) else {
        return Ok(None);
    };
    let captures = pin_pattern()
        .captures(content)
        .ok_or_else(|| ManifestError::Malformed {
            line: number,
            content: content.to_string(),
        })?;

    Ok(Some(ManifestEntry {
        line: number,
        name: captures[1].to_string(),
        version: captures[2].to_string(),
    }))
}

/// Parses a pin list, stopping at the first malformed line.
pub fn parse_manifest(text: &str) -> Result<Manifest, ManifestError> {
    let mut entries = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        if let Some(entry) = parse_line(idx + 1, raw)? {
            entries.push(entry);
        }
    }
    Ok(Manifest { entries })
}

impl Manifest {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn version_of(&self, name: &str) -> Option<&str> {
        let wanted = normalize_name(name);
        self.entries
            .iter()
            .find(|e| normalize_name(&e.name) == wanted)
            .map(|e| e.version.as_str())
    }

    /// Packages pinned to a different version than their first occurrence.
    /// Repeating the same pin is allowed.
    pub fn conflicts(&self) -> Vec<ManifestError> {
        let mut first_seen: HashMap<String, &ManifestEntry> = HashMap::new();
        let mut conflicts = Vec::new();

        for entry in &self.entries {
            match first_seen.get(&normalize_name(&entry.name)) {
                Some(first) if first.version != entry.version => {
                    conflicts.push(ManifestError::Conflict {
                        name: entry.name.clone(),
                        first_line: first.line,
                        first_version: first.version.clone(),
                        line: entry.line,
                        version: entry.version.clone(),
                    });
                }
                Some(_) => {}
                None => {
                    first_seen.insert(normalize_name(&entry.name), entry);
                }
            }
        }
        conflicts
    }
}

/// Reports every malformed line and every conflicting pin.
pub fn check_manifest(text: &str) -> Result<Manifest, Vec<ManifestError>> {
    let mut errors = Vec::new();
    let mut entries = Vec::new();

    for (idx, raw) in text.lines().enumerate() {
        match parse_line(idx + 1, raw) {
            Ok(Some(entry)) => entries.push(entry),
            Ok(None) => {}
            Err(e) => errors.push(e),
        }
    }

    let manifest = Manifest { entries };
    errors.extend(manifest.conflicts());
    errors.sort_by_key(|e| match e {
        ManifestError::Malformed { line, .. } | ManifestError::Conflict { line, .. } => *line,
    });

    if errors.is_empty() {
        Ok(manifest)
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# MindMap Pro dependencies
# Web
streamlit==1.29.0

# Data
pandas==2.1.4
networkx==3.2.1  # graphs
PyJWT==2.8.0
";

    #[test]
    fn parses_pins_and_skips_comments() {
        let manifest = parse_manifest(SAMPLE).unwrap();
        assert_eq!(manifest.len(), 4);
        assert_eq!(manifest.entries[0].line, 3);
        assert_eq!(manifest.version_of("networkx"), Some("3.2.1"));
        assert_eq!(manifest.version_of("pyjwt"), Some("2.8.0"));
        assert!(check_manifest(SAMPLE).is_ok());
    }

    #[test]
    fn malformed_lines_are_reported() {
        let err = parse_manifest("pandas>=2.0\n").unwrap_err();
        assert_eq!(
            err,
            ManifestError::Malformed {
                line: 1,
                content: "pandas>=2.0".into()
            }
        );
        assert!(parse_manifest("pandas==\n").is_err());
        assert!(parse_manifest("==1.0\n").is_err());
    }

    #[test]
    fn conflicting_pins_use_normalised_names() {
        let text = "Flask_Login==0.6.3\nflask-login==0.6.2\nredis==5.0.1\nredis==5.0.1\n";
        let errors = check_manifest(text).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(matches!(
            &errors[0],
            ManifestError::Conflict { first_line: 1, line: 2, .. }
        ));
    }

    #[test]
    fn all_problems_are_collected_in_line_order() {
        let text = "numpy==1.26.2\nnot a pin\nnumpy==1.26.3\n";
        let errors = check_manifest(text).unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(matches!(errors[0], ManifestError::Malformed { line: 2, .. }));
        assert!(matches!(errors[1], ManifestError::Conflict { line: 3, .. }));
    }

    #[test]
    fn name_normalisation() {
        assert_eq!(normalize_name("Scikit__Learn"), "scikit-learn");
        assert_eq!(normalize_name("zope.interface"), "zope-interface");
    }
}
