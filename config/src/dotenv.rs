//! Parse `.env` into a key-value map (no overwrite of existing env here; applied in lib).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

fn dotenv_path(override_dir: Option<&Path>) -> Option<PathBuf> {
    let dir = override_dir
        .map(Path::to_path_buf)
        .or_else(|| std::env::current_dir().ok())?;
    let path = dir.join(".env");
    path.is_file().then_some(path)
}

/// Minimal .env parser: `KEY=VALUE` lines, `#` comment lines skipped, keys and values trimmed.
/// Double-quoted values support `\"`; single-quoted values are stripped verbatim. No multiline.
fn parse_dotenv(content: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((k, v)) = line.split_once('=') else {
            continue;
        };
        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        let value = v.trim();
        let value = if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
            value[1..value.len() - 1].replace("\\\"", "\"")
        } else if value.len() >= 2 && value.starts_with('\'') && value.ends_with('\'') {
            value[1..value.len() - 1].to_string()
        } else {
            value.to_string()
        };
        out.insert(key.to_string(), value);
    }
    out
}

/// Load `.env` from override_dir or current directory into a map. Missing file returns empty map.
pub fn load_env_map(override_dir: Option<&Path>) -> std::io::Result<HashMap<String, String>> {
    let path = match dotenv_path(override_dir) {
        Some(p) => p,
        None => return Ok(HashMap::new()),
    };
    Ok(parse_dotenv(&std::fs::read_to_string(&path)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_and_quoted() {
        let m = parse_dotenv("FOO=bar\nQUOTED=\"hello world\"\nSINGLE='one two'\n");
        assert_eq!(m.get("FOO"), Some(&"bar".to_string()));
        assert_eq!(m.get("QUOTED"), Some(&"hello world".to_string()));
        assert_eq!(m.get("SINGLE"), Some(&"one two".to_string()));
    }

    #[test]
    fn skips_comments_blank_lines_and_malformed() {
        let m = parse_dotenv("# comment\n\nNOT_A_PAIR\n=no_key\nKEY=val\n");
        assert_eq!(m.len(), 1);
        assert_eq!(m.get("KEY"), Some(&"val".to_string()));
    }

    #[test]
    fn empty_value_preserved() {
        let m = parse_dotenv("KEY=\nOTHER=\"\"\n");
        assert_eq!(m.get("KEY"), Some(&String::new()));
        assert_eq!(m.get("OTHER"), Some(&String::new()));
    }

    #[test]
    fn escaped_quote_in_double_quoted() {
        let m = parse_dotenv(r#"KEY="say \"hi\"""#);
        assert_eq!(m.get("KEY"), Some(&"say \"hi\"".to_string()));
    }

    #[test]
    fn load_env_map_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_env_map(Some(dir.path())).unwrap().is_empty());
    }

    #[test]
    fn load_env_map_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".env"), "A=1\nB=2\n").unwrap();
        let m = load_env_map(Some(dir.path())).unwrap();
        assert_eq!(m.get("A"), Some(&"1".to_string()));
        assert_eq!(m.get("B"), Some(&"2".to_string()));
    }
}
