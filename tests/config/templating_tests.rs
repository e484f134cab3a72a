use flapi::config::templating::list_sql_templates;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_list_sql_templates_finds_all_sql_files() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();

    fs::write(root.join("query1.sql"), "SELECT 1;").unwrap();
    fs::write(root.join("query2.sql"), "SELECT 2;").unwrap();

    let subdir = root.join("subdir");
    fs::create_dir(&subdir).unwrap();
    fs::write(subdir.join("query3.sql"), "SELECT 3;").unwrap();

    // Non-SQL file should be ignored.
    fs::write(root.join("readme.txt"), "Not SQL").unwrap();

    let templates = list_sql_templates(root).unwrap();

    assert_eq!(templates.len(), 3);
    assert!(templates.contains(&"query1.sql".to_string()));
    assert!(templates.contains(&"query2.sql".to_string()));
    assert!(templates.contains(&"subdir/query3.sql".to_string()));
}

#[test]
fn test_list_sql_templates_empty_directory() {
    let temp_dir = TempDir::new().unwrap();
    let templates = list_sql_templates(temp_dir.path()).unwrap();
    assert_eq!(templates.len(), 0);
}

#[test]
fn test_list_sql_templates_case_insensitive() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();

    fs::write(root.join("query1.sql"), "SELECT 1;").unwrap();
    fs::write(root.join("query2.SQL"), "SELECT 2;").unwrap();
    fs::write(root.join("query3.Sql"), "SELECT 3;").unwrap();

    assert_eq!(list_sql_templates(root).unwrap().len(), 3);
}

#[test]
fn test_list_sql_templates_sorted() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();

    fs::write(root.join("zebra.sql"), "SELECT 1;").unwrap();
    fs::write(root.join("apple.sql"), "SELECT 2;").unwrap();
    fs::write(root.join("banana.sql"), "SELECT 3;").unwrap();

    let templates = list_sql_templates(root).unwrap();

    assert_eq!(templates[0], "apple.sql");
    assert_eq!(templates[1], "banana.sql");
    assert_eq!(templates[2], "zebra.sql");
}
