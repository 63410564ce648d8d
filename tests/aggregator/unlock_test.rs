//! Unlocking, key changes and restoring droplets from persisted state.

use std::collections::BTreeMap;

use confluence::aggregator::{Aggregator, AggregatorError};
use confluence::config::PollingConfig;
use confluence::dispatch::{CoreEvent, UnlockEvent};
use confluence::droplet::{ConfigError, ProviderCatalog};
use confluence::identifier::Identifier;
use confluence::state::StateDocument;
use confluence::vault::{Configuration, CredentialVault, DropletRecord};

use crate::fakes::{fake_settings, FakeFactory, FAKE_PROVIDER, GOOD_PASSWORD};
use crate::{core_over, core_with, record};

fn stored_document(records: Vec<(u64, DropletRecord)>) -> StateDocument {
    let records: BTreeMap<Identifier, DropletRecord> = records
        .into_iter()
        .map(|(raw, record)| (raw.to_string().parse().expect("id"), record))
        .collect();
    StateDocument::from_parts(&Configuration::from_key("master"), &records)
}

fn restored(factory: &std::sync::Arc<FakeFactory>, document: StateDocument) -> Aggregator {
    let mut catalog = ProviderCatalog::new();
    catalog.register(factory.clone());
    Aggregator::restore(
        catalog,
        Some(document),
        PollingConfig::default(),
        tokio::runtime::Handle::current(),
    )
    .expect("valid document")
}

#[tokio::test]
async fn droplets_are_built_on_first_successful_unlock() {
    let factory = FakeFactory::new();
    let document = stored_document(vec![(
        7,
        DropletRecord {
            provider: FAKE_PROVIDER.to_owned(),
            settings: fake_settings("me", GOOD_PASSWORD),
        },
    )]);
    let core = restored(&factory, document);
    assert!(core.registry().is_empty(), "nothing is built while locked");

    assert!(!core.unlock("guess"));
    assert!(core.registry().is_empty());
    assert!(core.unlock("master"));

    let id: Identifier = "7".parse().expect("id");
    assert!(core.registry().get(id).is_some());

    let next = core
        .add_droplet(FAKE_PROVIDER, fake_settings("other", GOOD_PASSWORD))
        .expect("add");
    assert!(next > id, "new identifiers never collide with stored ones");

    assert!(core.unlock("master"));
    assert_eq!(core.registry().len(), 2, "a second unlock does not duplicate");
}

#[tokio::test]
async fn unusable_stored_record_is_reported_and_kept() {
    let factory = FakeFactory::new();
    let document = stored_document(vec![(
        1,
        DropletRecord {
            provider: "carrier-pigeon".to_owned(),
            settings: fake_settings("me", GOOD_PASSWORD),
        },
    )]);
    let core = restored(&factory, document);
    let events = record(&core);

    assert!(core.unlock("master"));
    core.pump_events();

    assert!(core.registry().is_empty());
    assert_eq!(core.vault().records().expect("unlocked").len(), 1);
    let events = events.lock().expect("lock");
    assert!(events.contains(&CoreEvent::UnlockResult { unlocked: true }));
    assert!(events.iter().any(|e| matches!(
        e,
        CoreEvent::ConfigRejected { error: ConfigError::UnknownProvider(p), .. } if p == "carrier-pigeon"
    )));
}

#[tokio::test]
async fn login_event_reports_result() {
    let factory = FakeFactory::new();
    let core = std::sync::Arc::new(restored(&factory, stored_document(Vec::new())));
    core.wire_listeners();
    let events = record(&core);

    core.events().unlock.dispatch(&UnlockEvent::Login {
        candidate_key: "wrong".to_owned(),
    });
    core.events().unlock.dispatch(&UnlockEvent::Login {
        candidate_key: "master".to_owned(),
    });
    core.pump_events();

    assert_eq!(
        *events.lock().expect("lock"),
        vec![
            CoreEvent::UnlockResult { unlocked: false },
            CoreEvent::UnlockResult { unlocked: true },
        ]
    );
    assert!(core.vault().is_unlocked());
}

#[tokio::test]
async fn key_change_requires_an_unlocked_vault() {
    let factory = FakeFactory::new();
    let core = restored(&factory, stored_document(Vec::new()));

    assert_eq!(
        core.set_key("hijack"),
        Err(AggregatorError::Config(ConfigError::Locked))
    );

    assert!(core.unlock("master"));
    assert_eq!(
        core.handle_unlock(&UnlockEvent::SetKey {
            new_key: "rotated".to_owned()
        }),
        Ok(true)
    );
    core.vault().lock();
    assert!(!core.unlock("master"));
    assert!(core.unlock("rotated"));
}

#[tokio::test]
async fn first_run_sets_key_without_unlock() {
    let factory = FakeFactory::new();
    let core = core_over(&factory, CredentialVault::new());

    assert!(!core.vault().has_key());
    assert!(matches!(
        core.add_droplet(FAKE_PROVIDER, fake_settings("me", GOOD_PASSWORD)),
        Err(AggregatorError::Config(ConfigError::Locked))
    ));
    assert!(matches!(
        core.set_key(""),
        Err(AggregatorError::Config(ConfigError::Invalid { .. }))
    ));

    core.set_key("fresh").expect("first run");

    assert!(core.vault().is_unlocked());
    core.add_droplet(FAKE_PROVIDER, fake_settings("me", GOOD_PASSWORD))
        .expect("unlocked now");
}

#[tokio::test]
async fn state_document_round_trips_through_restore() {
    let factory = FakeFactory::new();
    let core = core_with(&factory);
    let id = core
        .add_droplet(FAKE_PROVIDER, fake_settings("me", GOOD_PASSWORD))
        .expect("add");

    let document = core.state_document().expect("unlocked");
    let back = restored(&factory, document);

    assert!(back.unlock("master"));
    assert_eq!(back.vault().records(), core.vault().records());
    assert!(back.registry().get(id).is_some());
}
