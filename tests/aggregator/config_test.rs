//! Configuration dialog handling: apply, reject, cancel, open.

use std::sync::Arc;

use confluence::aggregator::AggregatorError;
use confluence::dispatch::{ConfigDialogEvent, CoreEvent, DropletViewEvent};
use confluence::droplet::lifecycle::LifecycleState;
use confluence::droplet::registry::RegistryError;
use confluence::droplet::{ConfigError, Settings};

use crate::fakes::{fake_settings, FakeFactory, FAKE_PROVIDER, GOOD_PASSWORD};
use crate::{core_with, record};

#[tokio::test]
async fn rejected_apply_leaves_everything_untouched() {
    let factory = FakeFactory::new();
    let core = core_with(&factory);
    let events = record(&core);
    let original = fake_settings("me", GOOD_PASSWORD);
    let id = core
        .add_droplet(FAKE_PROVIDER, original.clone())
        .expect("add");
    core.initialize_droplet(id).await.expect("init");
    let live = core.registry().get(id).expect("registered");

    let missing_password = Settings::new("fake me").with_field("account", "me");
    let err = core
        .apply_settings(id, missing_password)
        .expect_err("invalid settings");

    assert_eq!(
        err,
        AggregatorError::Config(ConfigError::Missing("password".to_owned()))
    );
    let current = core.registry().get(id).expect("still registered");
    assert!(Arc::ptr_eq(&current, &live));
    assert_eq!(current.state(), LifecycleState::Initialized);
    assert_eq!(
        core.vault().record(id).expect("unlocked").map(|r| r.settings),
        Some(original)
    );

    core.pump_events();
    assert!(events.lock().expect("lock").iter().any(|e| matches!(
        e,
        CoreEvent::ConfigRejected { droplet, error: ConfigError::Missing(_) } if *droplet == id
    )));
}

#[tokio::test]
async fn applied_settings_are_stored_and_rebuild_the_droplet() {
    let factory = FakeFactory::new();
    let core = core_with(&factory);
    let id = core
        .add_droplet(FAKE_PROVIDER, fake_settings("me", GOOD_PASSWORD))
        .expect("add");
    core.initialize_droplet(id).await.expect("init");
    let before = core.registry().get(id).expect("registered");

    let revised = fake_settings("me", GOOD_PASSWORD).with_poll_interval(600);
    core.handle_config_dialog(&ConfigDialogEvent::Apply {
        droplet: id,
        settings: revised.clone(),
    })
    .expect("applied");

    let after = core.registry().get(id).expect("same identifier");
    assert!(!Arc::ptr_eq(&before, &after));
    assert_eq!(before.state(), LifecycleState::Destroyed);
    assert_eq!(after.state(), LifecycleState::Uninitialized);
    assert_eq!(after.settings(), &revised);
    assert_eq!(
        core.vault().record(id).expect("unlocked").map(|r| r.settings),
        Some(revised)
    );
}

#[tokio::test]
async fn apply_clashing_with_another_droplet_keeps_stored_settings() {
    let factory = FakeFactory::new();
    let core = core_with(&factory);
    let original = fake_settings("me", GOOD_PASSWORD);
    let id = core
        .add_droplet(FAKE_PROVIDER, original.clone())
        .expect("add");
    let other = core
        .add_droplet(FAKE_PROVIDER, fake_settings("you", GOOD_PASSWORD))
        .expect("add");
    let live = core.registry().get(id).expect("registered");

    let err = core
        .apply_settings(id, fake_settings("you", GOOD_PASSWORD))
        .expect_err("credential already served");

    assert!(matches!(
        err,
        AggregatorError::Registry(RegistryError::Duplicate { existing, .. }) if existing == other
    ));
    assert!(Arc::ptr_eq(&core.registry().get(id).expect("registered"), &live));
    assert_eq!(
        core.vault().record(id).expect("unlocked").map(|r| r.settings),
        Some(original)
    );
}

#[tokio::test]
async fn cancel_changes_nothing() {
    let factory = FakeFactory::new();
    let core = core_with(&factory);
    let id = core
        .add_droplet(FAKE_PROVIDER, fake_settings("me", GOOD_PASSWORD))
        .expect("add");
    let before = core.registry().get(id).expect("registered");

    core.handle_config_dialog(&ConfigDialogEvent::Cancel { droplet: id })
        .expect("cancel never fails");

    let after = core.registry().get(id).expect("registered");
    assert!(Arc::ptr_eq(&before, &after));
    assert_eq!(core.pump_events(), 0);
}

#[tokio::test]
async fn apply_while_locked_is_rejected() {
    let factory = FakeFactory::new();
    let core = core_with(&factory);
    let id = core
        .add_droplet(FAKE_PROVIDER, fake_settings("me", GOOD_PASSWORD))
        .expect("add");
    core.vault().lock();

    let err = core
        .apply_settings(id, fake_settings("me", GOOD_PASSWORD))
        .expect_err("locked");

    assert_eq!(err, AggregatorError::Config(ConfigError::Locked));
}

#[tokio::test]
async fn open_configuration_publishes_settings_and_status() {
    let factory = FakeFactory::new();
    let core = core_with(&factory);
    core.wire_listeners();
    let events = record(&core);
    let settings = fake_settings("me", GOOD_PASSWORD);
    let id = core
        .add_droplet(FAKE_PROVIDER, settings.clone())
        .expect("add");

    core.events()
        .droplet_view
        .dispatch(&DropletViewEvent::OpenConfiguration { droplet: id });
    core.pump_events();

    let events = events.lock().expect("lock");
    match events.as_slice() {
        [CoreEvent::ConfigurationOpened {
            droplet,
            provider,
            settings: shown,
            status,
        }] => {
            assert_eq!(*droplet, id);
            assert_eq!(provider, FAKE_PROVIDER);
            assert_eq!(shown, &settings);
            assert_eq!(status.state, LifecycleState::Uninitialized);
            assert!(!status.busy);
        }
        other => panic!("unexpected events {other:?}"),
    }
}
