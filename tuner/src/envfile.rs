//! Shared `.env`-style file grammar used both by [`crate::config`] (the
//! `.env` file) and [`crate::supervisor`] (`env_files`): one `KEY=VALUE` or
//! `export KEY=VALUE` per line, `#` comments and blank lines ignored, values
//! may be single- or double-quoted and are unquoted as a whole.

use std::collections::HashMap;

use crate::error::ConfigError;

/// Parses the contents of an env file into an ordered list of `(key,
/// value)` pairs.
///
/// # Errors
///
/// [`ConfigError`] if a non-blank, non-comment line is not of the form
/// `[export ]KEY=VALUE`.
pub fn parse(contents: &str) -> Result<Vec<(String, String)>, ConfigError> {
    let mut pairs = Vec::new();

    for (lineno, raw_line) in contents.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let line = line.strip_prefix("export ").unwrap_or(line).trim_start();

        let Some((key, value)) = line.split_once('=') else {
            return Err(ConfigError {
                reason: format!("malformed env line {}: {:?}", lineno + 1, raw_line),
            });
        };

        let key = key.trim();
        if key.is_empty() {
            return Err(ConfigError {
                reason: format!("empty key on env line {}: {:?}", lineno + 1, raw_line),
            });
        }

        pairs.push((key.to_string(), unquote(value.trim())));
    }

    Ok(pairs)
}

/// Strips a single matching pair of surrounding single or double quotes, if
/// present, leaving the value untouched otherwise.
fn unquote(value: &str) -> String {
    let bytes = value.as_bytes();
    if bytes.len() >= 2
        && ((bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[bytes.len() - 1] == b'\''))
    {
        value[1..value.len() - 1].to_string()
    } else {
        value.to_string()
    }
}

/// Reads and parses `path`, returning an empty list (not an error) if the
/// file does not exist. Parse errors on a present file are fatal.
///
/// # Errors
///
/// [`ConfigError`] if the file exists but fails to parse, or if it exists
/// but cannot be read for a reason other than not-found.
pub async fn load_file(path: &std::path::Path) -> Result<Vec<(String, String)>, ConfigError> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => parse(&contents),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(vec![]),
        Err(e) => Err(ConfigError {
            reason: format!("failed to read env file {}: {e}", path.display()),
        }),
    }
}

/// Applies `pairs` to `env`, last write wins for duplicate keys (matching
/// how a shell would source the same lines in order).
pub fn apply_to(pairs: &[(String, String)], env: &mut HashMap<String, String>) {
    for (k, v) in pairs {
        env.insert(k.clone(), v.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_export_and_plain_assignments() {
        let pairs = parse("export FOO=bar\nBAZ=\"q u x\"\n# comment\n\nQUUX='single'\n").unwrap();
        assert_eq!(
            pairs,
            vec![
                ("FOO".to_string(), "bar".to_string()),
                ("BAZ".to_string(), "q u x".to_string()),
                ("QUUX".to_string(), "single".to_string()),
            ]
        );
    }

    #[test]
    fn rejects_malformed_line() {
        assert!(parse("NOT_AN_ASSIGNMENT").is_err());
    }

    #[tokio::test]
    async fn missing_file_yields_empty_list() {
        let dir = tempfile::tempdir().unwrap();
        let pairs = load_file(&dir.path().join("nope.env")).await.unwrap();
        assert!(pairs.is_empty());
    }
}
