//! Coverage for credential loading and permission checks.

use std::collections::BTreeMap;
use std::fs;

use confluence::credentials::{
    enforce_private_file_permissions, load_credentials, Credentials, MASTER_KEY_ENV,
};

#[test]
fn loads_env_credentials() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let env_path = tmp.path().join(".env");
    fs::write(&env_path, format!("{MASTER_KEY_ENV}=from-file\nOTHER=1\n")).expect("should write");
    enforce_private_file_permissions(&env_path).expect("should restrict");

    let credentials = load_credentials(&env_path).expect("credentials should load");

    assert_eq!(credentials.get(MASTER_KEY_ENV), Some("from-file"));
    assert_eq!(credentials.get("OTHER"), Some("1"));
}

#[test]
fn missing_env_file_is_empty() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let credentials = load_credentials(&tmp.path().join(".env")).expect("no file is fine");
    assert_eq!(credentials.get(MASTER_KEY_ENV), None);
}

#[cfg(unix)]
#[test]
fn rejects_world_readable_env_file() {
    use std::os::unix::fs::PermissionsExt;

    let tmp = tempfile::tempdir().expect("should create temp dir");
    let env_path = tmp.path().join(".env");
    fs::write(&env_path, format!("{MASTER_KEY_ENV}=k\n")).expect("should write");
    fs::set_permissions(&env_path, fs::Permissions::from_mode(0o644)).expect("chmod");

    assert!(load_credentials(&env_path).is_err());
}

#[test]
fn debug_output_redacts_values() {
    let mut vars = BTreeMap::new();
    vars.insert(MASTER_KEY_ENV.to_owned(), "hunter2".to_owned());
    let credentials = Credentials::from_map(vars);

    let rendered = format!("{credentials:?}");

    assert!(rendered.contains(MASTER_KEY_ENV));
    assert!(!rendered.contains("hunter2"));
}

#[test]
fn master_key_falls_back_to_file_value() {
    if std::env::var(MASTER_KEY_ENV).is_ok() {
        return;
    }
    let mut vars = BTreeMap::new();
    vars.insert(MASTER_KEY_ENV.to_owned(), "from-file".to_owned());
    assert_eq!(
        Credentials::from_map(vars).master_key(),
        Some("from-file".to_owned())
    );

    let mut empty = BTreeMap::new();
    empty.insert(MASTER_KEY_ENV.to_owned(), String::new());
    assert_eq!(Credentials::from_map(empty).master_key(), None);
}
