//! Adding, initializing, polling and removing droplets through the facade.

use std::sync::Arc;

use confluence::aggregator::{AggregatorError, SetupOutcome, SetupSurface};
use confluence::dispatch::{ConfigDialogEvent, CoreEvent};
use confluence::droplet::lifecycle::{DropletError, LifecycleState};
use confluence::droplet::registry::RegistryError;
use confluence::droplet::InitError;
use confluence::interactive;

use crate::fakes::{fake_settings, ripple, FakeFactory, FAKE_PROVIDER, GOOD_PASSWORD};
use crate::{core_with, record};

#[tokio::test]
async fn three_failed_initializations_then_success_after_correction() {
    let factory = FakeFactory::new();
    let core = core_with(&factory);
    let events = record(&core);
    let id = core
        .add_droplet(FAKE_PROVIDER, fake_settings("me", "wrong"))
        .expect("add");

    for _ in 0..3 {
        let err = core.initialize_droplet(id).await.expect_err("bad credentials");
        assert!(matches!(
            err,
            AggregatorError::Droplet(DropletError::Init(InitError::BadCredentials(_)))
        ));
        let state = core.registry().get(id).expect("registered").state();
        assert_eq!(state, LifecycleState::Uninitialized);
    }

    core.apply_settings(id, fake_settings("me", GOOD_PASSWORD))
        .expect("corrected settings accepted");
    core.initialize_droplet(id).await.expect("fourth attempt succeeds");

    let state = core.registry().get(id).expect("registered").state();
    assert_eq!(state, LifecycleState::Initialized);
    assert_eq!(factory.script("me").init_calls.load(std::sync::atomic::Ordering::SeqCst), 4);

    core.pump_events();
    let events = events.lock().expect("lock");
    let failures = events
        .iter()
        .filter(|e| matches!(e, CoreEvent::InitFailed { droplet, .. } if *droplet == id))
        .count();
    assert_eq!(failures, 3);
    assert!(events.contains(&CoreEvent::Reconfigured { droplet: id }));
    assert!(events.contains(&CoreEvent::Initialized { droplet: id }));
}

#[tokio::test]
async fn duplicate_credential_is_rejected_and_not_stored() {
    let factory = FakeFactory::new();
    let core = core_with(&factory);
    core.add_droplet(FAKE_PROVIDER, fake_settings("me", GOOD_PASSWORD))
        .expect("first");

    let err = core
        .add_droplet(FAKE_PROVIDER, fake_settings("me", GOOD_PASSWORD))
        .expect_err("second");

    assert!(matches!(err, AggregatorError::Registry(RegistryError::Duplicate { .. })));
    assert_eq!(core.registry().len(), 1);
    assert_eq!(core.vault().records().expect("unlocked").len(), 1);
}

#[tokio::test]
async fn blocking_calls_are_refused_on_the_interactive_thread() {
    let factory = FakeFactory::new();
    let core = core_with(&factory);
    let id = core
        .add_droplet(FAKE_PROVIDER, fake_settings("me", GOOD_PASSWORD))
        .expect("add");

    let guard = interactive::enter();
    let err = core.initialize_droplet(id).await.expect_err("interactive thread");
    drop(guard);

    assert!(matches!(
        err,
        AggregatorError::Droplet(DropletError::LongOperation(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn initialize_all_runs_on_workers() {
    let factory = FakeFactory::new();
    let core = core_with(&factory);
    let good = core
        .add_droplet(FAKE_PROVIDER, fake_settings("good", GOOD_PASSWORD))
        .expect("add");
    let bad = core
        .add_droplet(FAKE_PROVIDER, fake_settings("bad", "nope"))
        .expect("add");

    let _guard = interactive::enter();
    core.spawn_initialize_all().await.expect("join");

    assert_eq!(
        core.registry().get(good).expect("good").state(),
        LifecycleState::Initialized
    );
    assert_eq!(
        core.registry().get(bad).expect("bad").state(),
        LifecycleState::Uninitialized
    );
}

#[tokio::test]
async fn poll_now_publishes_merged_ripples() {
    let factory = FakeFactory::new();
    let core = core_with(&factory);
    let events = record(&core);
    factory.script("me").push(vec![ripple(3, 30), ripple(1, 10)]);
    let id = core
        .add_droplet(FAKE_PROVIDER, fake_settings("me", GOOD_PASSWORD))
        .expect("add");
    core.initialize_droplet(id).await.expect("init");

    let report = core.poll_now().await;
    assert_eq!(report.polled, vec![id]);
    assert_eq!(core.pump_events(), 2, "initialized + ripples");

    let events = events.lock().expect("lock");
    match events.last() {
        Some(CoreEvent::Ripples { ripples, .. }) => {
            let ids: Vec<u64> = ripples.iter().map(|t| t.ripple.id()).collect();
            assert_eq!(ids, vec![3, 1]);
        }
        other => panic!("expected ripples, got {other:?}"),
    }
}

#[tokio::test]
async fn delete_from_dialog_removes_and_releases() {
    let factory = FakeFactory::new();
    let core = core_with(&factory);
    core.wire_listeners();
    let events = record(&core);
    let id = core
        .add_droplet(FAKE_PROVIDER, fake_settings("me", GOOD_PASSWORD))
        .expect("add");
    core.initialize_droplet(id).await.expect("init");
    let script = factory.script("me");

    core.events()
        .config_dialog
        .dispatch(&ConfigDialogEvent::Delete { droplet: id });

    assert!(core.registry().get(id).is_none());
    assert_eq!(core.vault().record(id), Ok(None));
    while script.destroys() == 0 {
        tokio::task::yield_now().await;
    }
    // The Destroyed event is sent right after the release completes.
    tokio::task::yield_now().await;
    core.pump_events();
    assert!(events
        .lock()
        .expect("lock")
        .contains(&CoreEvent::Destroyed { droplet: id }));
}

#[tokio::test]
async fn remove_unknown_droplet_is_not_found() {
    let factory = FakeFactory::new();
    let core = core_with(&factory);
    let id = core
        .add_droplet(FAKE_PROVIDER, fake_settings("me", GOOD_PASSWORD))
        .expect("add");
    core.remove_droplet(id).expect("first removal");
    assert_eq!(core.remove_droplet(id), Err(AggregatorError::NotFound(id)));
}

struct ScriptedSurface {
    outcome: Option<SetupOutcome>,
    offered: Vec<String>,
}

impl SetupSurface for ScriptedSurface {
    fn present(&mut self, providers: &[String]) -> SetupOutcome {
        self.offered = providers.to_vec();
        self.outcome.take().unwrap_or(SetupOutcome::Cancelled)
    }
}

#[tokio::test]
async fn setup_surface_adds_or_cancels() {
    let factory = FakeFactory::new();
    let core = core_with(&factory);
    let mut surface = ScriptedSurface {
        outcome: Some(SetupOutcome::Accepted {
            provider: FAKE_PROVIDER.to_owned(),
            settings: fake_settings("me", GOOD_PASSWORD),
        }),
        offered: Vec::new(),
    };

    let added = core.setup_droplet(&mut surface).expect("accepted");
    let cancelled = core.setup_droplet(&mut surface).expect("cancelled");

    assert_eq!(surface.offered, vec![FAKE_PROVIDER.to_owned()]);
    let id = added.expect("a droplet was added");
    assert!(core.registry().get(id).is_some());
    assert_eq!(cancelled, None);
    assert_eq!(core.registry().len(), 1);
}

#[tokio::test]
async fn shutdown_releases_every_droplet() {
    let factory = FakeFactory::new();
    let core = core_with(&factory);
    for account in ["a", "b"] {
        let id = core
            .add_droplet(FAKE_PROVIDER, fake_settings(account, GOOD_PASSWORD))
            .expect("add");
        core.initialize_droplet(id).await.expect("init");
    }

    core.shutdown().await;

    assert!(core.registry().is_empty());
    assert_eq!(factory.script("a").destroys(), 1);
    assert_eq!(factory.script("b").destroys(), 1);
    assert_eq!(core.vault().records().expect("unlocked").len(), 2, "settings survive");
}

#[tokio::test]
async fn start_polling_stops_cleanly() {
    let factory = FakeFactory::new();
    let core = core_with(&factory);
    factory.script("me").push(vec![ripple(1, 1)]);
    let id = core
        .add_droplet(FAKE_PROVIDER, fake_settings("me", GOOD_PASSWORD))
        .expect("add");
    core.initialize_droplet(id).await.expect("init");
    let mut events = core.take_event_receiver().expect("receiver");

    let handle = core.start_polling();
    let mut saw_ripples = false;
    while let Some(event) = events.recv().await {
        if matches!(event, CoreEvent::Ripples { .. }) {
            saw_ripples = true;
            break;
        }
    }
    handle.stop().await;

    assert!(saw_ripples);
    assert_eq!(core.pump_events(), 0, "receiver was taken");
}

fn assert_send_sync<T: Send + Sync>(_: &T) {}

#[tokio::test]
async fn aggregator_is_shareable_across_threads() {
    let factory = FakeFactory::new();
    let core = core_with(&factory);
    assert_send_sync(&core);
    let _ = Arc::clone(&core);
}
