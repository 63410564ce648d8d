//! Tests for `src/state.rs`: persisting and restoring the vault.

use std::collections::BTreeMap;

use confluence::droplet::{ConfigError, Settings};
use confluence::identifier::IdentifierService;
use confluence::state::{load_state, save_state, StateDocument};
use confluence::vault::{CredentialVault, DropletRecord};

#[test]
fn missing_state_file_is_none() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let loaded = load_state(&tmp.path().join("state.json")).expect("no error");
    assert!(loaded.is_none());
}

#[test]
fn saved_vault_restores_equivalent_and_locked() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let path = tmp.path().join("nested").join("state.json");

    let ids = IdentifierService::new();
    let id = ids.next_identifier();
    let vault = CredentialVault::new();
    vault.set_key("passphrase");
    vault
        .put_record(
            id,
            DropletRecord {
                provider: "maildir".to_owned(),
                settings: Settings::new("inbox")
                    .with_field("endpoint", "/var/mail/me")
                    .with_poll_interval(120),
            },
        )
        .expect("unlocked");

    let document = StateDocument::from_vault(&vault).expect("unlocked");
    save_state(&path, &document).expect("save");
    let loaded = load_state(&path).expect("load").expect("present");
    assert_eq!(loaded, document);

    let (configuration, records) = loaded.into_parts().expect("valid");
    let restored = CredentialVault::restore(configuration, records);
    assert!(!restored.is_unlocked());
    assert!(restored.unlock("passphrase"));
    assert_eq!(restored.records(), vault.records());
    assert!(!path.with_extension("json.tmp").exists());
}

#[cfg(unix)]
#[test]
fn saved_state_is_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let tmp = tempfile::tempdir().expect("should create temp dir");
    let path = tmp.path().join("state.json");
    let vault = CredentialVault::new();
    vault.set_key("k");
    save_state(&path, &StateDocument::from_vault(&vault).expect("unlocked")).expect("save");

    let mode = std::fs::metadata(&path).expect("metadata").permissions().mode() & 0o777;
    assert_eq!(mode, 0o600);
}

#[test]
fn locked_vault_cannot_be_snapshot() {
    let vault = CredentialVault::new();
    vault.set_key("k");
    vault.lock();
    assert!(StateDocument::from_vault(&vault).is_err());
}

#[test]
fn garbage_state_file_is_an_error() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let path = tmp.path().join("state.json");
    std::fs::write(&path, "{ not json").expect("write");
    assert!(load_state(&path).is_err());
}

#[test]
fn document_without_droplets_parses() {
    let json = format!(
        "{{\"auth_key_digest\": \"{}\"}}",
        confluence::vault::KeyDigest::of("k").as_hex()
    );
    let document: StateDocument = serde_json::from_str(&json).expect("parse");
    let (_, records) = document.into_parts().expect("valid");
    assert_eq!(records, BTreeMap::new());
}

#[test]
fn keys_naming_the_same_droplet_twice_are_malformed() {
    let json = format!(
        r#"{{
            "auth_key_digest": "{}",
            "droplets": {{
                "4": {{"provider": "maildir", "settings": {{"display_name": "a"}}}},
                "04": {{"provider": "maildir", "settings": {{"display_name": "b"}}}}
            }}
        }}"#,
        confluence::vault::KeyDigest::of("k").as_hex()
    );
    let document: StateDocument = serde_json::from_str(&json).expect("parse");

    let err = document.into_parts().expect_err("ambiguous keys");

    assert!(matches!(err, ConfigError::Malformed(_)));
}

#[test]
fn signed_key_is_malformed() {
    let mut droplets = BTreeMap::new();
    droplets.insert(
        "+4".to_owned(),
        DropletRecord {
            provider: "maildir".to_owned(),
            settings: Settings::new("inbox"),
        },
    );
    let document = StateDocument {
        auth_key_digest: confluence::vault::KeyDigest::of("k").as_hex().to_owned(),
        droplets,
    };
    assert!(matches!(document.into_parts(), Err(ConfigError::Malformed(_))));
}
