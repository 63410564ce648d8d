//! Tests for `src/droplet/mail/maildir.rs` against a real directory.

use std::path::Path;

use confluence::droplet::mail::maildir::{create_maildir, MAILDIR_PROVIDER};
use confluence::droplet::{InitError, ProviderCatalog, Settings};

fn maildir_settings(root: &Path) -> Settings {
    let path = root.to_str().expect("utf-8 temp path");
    Settings::new("local")
        .with_field("address", "me@localhost")
        .with_field("endpoint", path)
}

fn write_message(root: &Path, sub: &str, name: &str, subject: &str) {
    let raw = format!(
        "From: Bob <bob@example.com>\r\nSubject: {subject}\r\nDate: Tue, 1 Jul 2025 10:00:00 +0000\r\n\r\nbody of {subject}\r\n"
    );
    std::fs::write(root.join(sub).join(name), raw).expect("should write message");
}

#[tokio::test]
async fn builtin_catalog_serves_maildir() {
    let catalog = ProviderCatalog::builtin();
    assert_eq!(catalog.providers(), vec![MAILDIR_PROVIDER.to_owned()]);
}

#[tokio::test]
async fn missing_maildir_is_unreachable() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let catalog = ProviderCatalog::builtin();
    let mut droplet = catalog
        .build(MAILDIR_PROVIDER, maildir_settings(&tmp.path().join("absent")))
        .expect("settings are well-formed");

    let err = droplet.initialize().await.expect_err("no maildir there");

    assert!(matches!(err, InitError::Unreachable(_)));
}

#[tokio::test]
async fn maildir_messages_become_ripples_once() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    create_maildir(tmp.path()).expect("should create maildir");
    write_message(tmp.path(), "new", "1000.A.host", "hello");
    write_message(tmp.path(), "cur", "999.B.host:2,S", "seen before");

    let catalog = ProviderCatalog::builtin();
    let mut droplet = catalog
        .build(MAILDIR_PROVIDER, maildir_settings(tmp.path()))
        .expect("valid");
    droplet.initialize().await.expect("init");

    let first = droplet.poll().await.expect("poll");
    let mut subjects: Vec<&str> = first.iter().map(|r| r.subject()).collect();
    subjects.sort_unstable();
    assert_eq!(subjects, vec!["hello", "seen before"]);
    assert!(first.iter().all(|r| r.sender() == "Bob <bob@example.com>"));
    assert!(first.iter().all(|r| r.received_date() == 1_751_364_000_000));

    // Moving a message from new/ to cur/ keeps its identity.
    std::fs::rename(
        tmp.path().join("new").join("1000.A.host"),
        tmp.path().join("cur").join("1000.A.host:2,S"),
    )
    .expect("should move message");
    write_message(tmp.path(), "new", "1001.C.host", "fresh");

    let second = droplet.poll().await.expect("poll");
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].subject(), "fresh");
    assert_eq!(second[0].content(), "body of fresh");
}

#[tokio::test]
async fn message_after_a_failed_fetch_is_not_lost() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    create_maildir(tmp.path()).expect("should create maildir");
    write_message(tmp.path(), "new", "1000.A.host", "first");
    write_message(tmp.path(), "cur", "1001.B.host:2,S", "second");

    let catalog = ProviderCatalog::builtin();
    let mut droplet = catalog
        .build(MAILDIR_PROVIDER, maildir_settings(tmp.path()))
        .expect("valid");
    droplet.initialize().await.expect("init");
    assert_eq!(droplet.poll().await.expect("poll").len(), 2);

    std::fs::remove_file(tmp.path().join("new").join("1000.A.host")).expect("should delete");
    let cur = tmp.path().join("cur");
    let parked = tmp.path().join("cur.parked");
    std::fs::rename(&cur, &parked).expect("should park cur/");
    assert!(droplet.poll().await.is_err(), "cur/ is gone");

    std::fs::rename(&parked, &cur).expect("should restore cur/");
    write_message(tmp.path(), "new", "1002.C.host", "third");

    let after = droplet.poll().await.expect("poll after reconnect");
    let subjects: Vec<&str> = after.iter().map(|r| r.subject()).collect();
    assert_eq!(subjects, vec!["third"]);
    assert!(after[0].id() > 2, "uids are never reused");
}
