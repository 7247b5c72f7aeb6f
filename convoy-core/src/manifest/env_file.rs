//! Environment file loading.
//!
//! Files are newline-delimited `KEY=VALUE` entries parsed with `dotenvy`:
//! blank lines and `#` comments are skipped, an `export ` prefix is accepted
//! and quoted values are unquoted. Later keys override earlier ones.

use crate::error::{ParseError, ParseErrorKind};
use std::collections::BTreeMap;
use std::path::Path;

/// Parse env-file content. `origin` names the file in errors.
pub fn parse_env_content(
    origin: &str,
    content: &str,
) -> Result<BTreeMap<String, String>, ParseError> {
    let mut vars = BTreeMap::new();

    for entry in dotenvy::from_read_iter(content.as_bytes()) {
        let (key, value) = entry.map_err(|e| env_error(origin, content, e))?;
        vars.insert(key, value);
    }

    Ok(vars)
}

/// Read and parse an env file from disk.
pub fn load_env_file(path: &Path) -> Result<BTreeMap<String, String>, ParseError> {
    let origin = path.display().to_string();
    let content = std::fs::read_to_string(path)
        .map_err(|e| ParseError::new(ParseErrorKind::EnvFile, &origin, e.to_string()))?;
    parse_env_content(&origin, &content)
}

fn env_error(origin: &str, content: &str, err: dotenvy::Error) -> ParseError {
    let detail = match err {
        dotenvy::Error::LineParse(line, _) => {
            let number = content.lines().position(|l| l.trim() == line.trim()).map(|n| n + 1);
            match number {
                Some(number) => format!("line {}: expected KEY=VALUE, got '{}'", number, line.trim()),
                None => format!("expected KEY=VALUE, got '{}'", line.trim()),
            }
        }
        other => other.to_string(),
    };
    ParseError::new(ParseErrorKind::EnvFile, origin, detail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_basic_entries() {
        let vars = parse_env_content(
            ".env",
            "# database\nMONGO_URI=mongodb://mongodb:27017/app\n\nPORT=5000\n",
        )
        .unwrap();
        assert_eq!(vars.len(), 2);
        assert_eq!(vars["MONGO_URI"], "mongodb://mongodb:27017/app");
        assert_eq!(vars["PORT"], "5000");
    }

    #[test]
    fn test_later_keys_override_earlier() {
        let vars = parse_env_content(".env", "MODE=dev\nMODE=prod\n").unwrap();
        assert_eq!(vars["MODE"], "prod");
    }

    #[test]
    fn test_quotes_export_and_empty_values() {
        let vars = parse_env_content(
            ".env",
            "export SECRET=\"a b c\"\nNAME='x=y'\nEMPTY=\n",
        )
        .unwrap();
        assert_eq!(vars["SECRET"], "a b c");
        assert_eq!(vars["NAME"], "x=y");
        assert_eq!(vars["EMPTY"], "");
    }

    #[test]
    fn test_malformed_line_names_file_and_line() {
        let err = parse_env_content("backend/.env", "A=1\nnot an assignment\n").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::EnvFile);
        assert_eq!(err.name, "backend/.env");
        assert!(err.detail.contains("line 2"));
    }

    #[test]
    fn test_malformed_key_is_rejected() {
        let err = parse_env_content(".env", "# config\nGOOD=1\nBAD KEY=2\n").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::EnvFile);
        assert!(err.detail.contains("line 3"), "{}", err.detail);
    }

    #[test]
    fn test_load_env_file_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "JWT_SECRET=changeme").unwrap();
        let vars = load_env_file(file.path()).unwrap();
        assert_eq!(vars["JWT_SECRET"], "changeme");
    }

    #[test]
    fn test_missing_env_file() {
        let err = load_env_file(Path::new("/definitely/not/here/.env")).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::EnvFile);
    }
}
