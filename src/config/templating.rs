use std::path::Path;

use crate::errors::Result;
use walkdir::WalkDir;

/// Lists all SQL template files in a directory recursively.
///
/// Walks through the directory tree finding all `.sql` files (case-insensitive)
/// and returns their paths relative to the root directory, sorted.
///
/// Used by the management API's filesystem/schema endpoints and by endpoint
/// validation at config-load time to confirm a declared `template_source`
/// actually exists under the project's template root.
pub fn list_sql_templates(root: impl AsRef<Path>) -> Result<Vec<String>> {
    let root = root.as_ref();
    let mut out = Vec::new();

    for entry_res in WalkDir::new(root) {
        let entry = match entry_res {
            Ok(e) => e,
            Err(_) => continue,
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let is_sql = path
            .extension()
            .and_then(|s| s.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("sql"))
            .unwrap_or(false);
        if !is_sql {
            continue;
        }

        let rel = match path.strip_prefix(root) {
            Ok(p) => p,
            Err(_) => continue,
        };

        let name = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        out.push(name);
    }

    out.sort();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn lists_templates_recursively_and_sorted() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::write(root.join("zebra.sql"), "SELECT 1;").unwrap();
        fs::write(root.join("apple.sql"), "SELECT 2;").unwrap();
        fs::create_dir(root.join("subdir")).unwrap();
        fs::write(root.join("subdir/query3.sql"), "SELECT 3;").unwrap();

        let templates = list_sql_templates(root).unwrap();

        assert_eq!(templates[0], "apple.sql");
        assert!(templates.contains(&"subdir/query3.sql".to_string()));
        assert_eq!(templates.last().unwrap(), "zebra.sql");
    }

    #[test]
    fn empty_directory_yields_no_templates() {
        let temp_dir = TempDir::new().unwrap();
        let templates = list_sql_templates(temp_dir.path()).unwrap();
        assert!(templates.is_empty());
    }

    #[test]
    fn extension_match_is_case_insensitive() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::write(root.join("a.sql"), "SELECT 1;").unwrap();
        fs::write(root.join("b.SQL"), "SELECT 2;").unwrap();
        fs::write(root.join("c.Sql"), "SELECT 3;").unwrap();

        assert_eq!(list_sql_templates(root).unwrap().len(), 3);
    }
}
