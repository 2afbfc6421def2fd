use log::debug;
use std::fs;
use std::path::{Path, PathBuf};

use super::model::Template;
use crate::error::TemplateError;

/// Finds `name` on the search path, trying it as given and then with a `.json` extension.
///
/// A name that is itself an existing path (absolute, or relative to the working directory) wins
/// over the search directories.
pub fn locate(name: &str, search_dirs: &[PathBuf]) -> Option<PathBuf> {
    let direct = Path::new(name);
    if direct.is_file() {
        return Some(direct.to_path_buf());
    }

    let with_extension = format!("{}.json", name);
    search_dirs
        .iter()
        .flat_map(|dir| [dir.join(name), dir.join(&with_extension)])
        .find(|candidate| candidate.is_file())
}

/// Locates and parses a template document.
pub fn load_template(name: &str, search_dirs: &[PathBuf]) -> Result<Template, TemplateError> {
    let path = locate(name, search_dirs).ok_or_else(|| TemplateError::NotFound {
        name: name.to_owned(),
        reason: format!("not found in {:?}", search_dirs),
    })?;
    debug!("Loading template '{}' from {}", name, path.display());

    let json = fs::read_to_string(&path).map_err(|e| TemplateError::NotFound {
        name: name.to_owned(),
        reason: format!("{}: {}", path.display(), e),
    })?;
    json.parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"{"argCount": 0, "segments": [{"name": "MSH", "fieldCount": 2}]}"#;

    #[test]
    fn searches_directories_in_order() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        fs::write(second.path().join("adt.json"), DOC).unwrap();

        let dirs = vec![first.path().to_path_buf(), second.path().to_path_buf()];
        assert_eq!(locate("adt", &dirs), Some(second.path().join("adt.json")));

        // an earlier directory shadows a later one
        fs::write(first.path().join("adt.json"), DOC).unwrap();
        assert_eq!(locate("adt.json", &dirs), Some(first.path().join("adt.json")));
    }

    #[test]
    fn loads_and_parses() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("oru.json"), DOC).unwrap();

        let t = load_template("oru", &[dir.path().to_path_buf()]).unwrap();
        assert_eq!(t.arg_count().unwrap(), 0);
    }

    #[test]
    fn missing_template_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        match load_template("missing", &[dir.path().to_path_buf()]) {
            Err(TemplateError::NotFound { name, .. }) => assert_eq!(name, "missing"),
            other => panic!("Expected NotFound, got {:?}", other),
        }
    }
}
