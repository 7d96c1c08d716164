//! Sync passes, connectivity transitions and loop lifecycle

mod common;

use pretty_assertions::assert_eq;
use std::time::Duration;

use air_cache::sync::PullOutcome;
use air_cache::types::resource;
use air_cache::{CacheError, CacheEvent, EmailAction, LoopState};
use common::{cache_at, populated_remote, Call};

const ACCOUNT: &str = "a@x.com";

#[tokio::test]
async fn test_pass_fills_every_store() {
    let dir = tempfile::tempdir().unwrap();
    let remote = populated_remote();
    remote.script().contacts_broken = true;
    let (cache, rx) = cache_at(dir.path(), remote.clone());

    let report = cache.sync_now(ACCOUNT).await.unwrap();
    assert_eq!(report.emails, PullOutcome::Pulled(2));
    assert_eq!(report.folders, PullOutcome::Pulled(1));
    assert_eq!(report.calendars, PullOutcome::Pulled(1));
    assert_eq!(report.events, PullOutcome::Pulled(1));
    assert!(report.contacts.is_failed());

    assert_eq!(
        remote.calls()[0],
        Call::ListMessages {
            account: ACCOUNT.to_string(),
            limit: 100,
        }
    );

    assert_eq!(cache.emails(ACCOUNT).unwrap().count().unwrap(), 2);
    assert_eq!(cache.folders(ACCOUNT).unwrap().count().unwrap(), 1);
    let event = cache.events(ACCOUNT).unwrap().get("e1").unwrap().unwrap();
    assert_eq!(event.calendar_id, "cal-1");
    assert_eq!(cache.contacts(ACCOUNT).unwrap().count().unwrap(), 0);

    let sync_state = cache.sync_state(ACCOUNT).unwrap();
    assert!(sync_state.get(resource::EMAILS).unwrap().is_some());
    assert!(sync_state.get(resource::EVENTS).unwrap().is_some());
    assert!(sync_state.get(resource::CONTACTS).unwrap().is_none());

    let events: Vec<CacheEvent> = rx.drain().collect();
    assert_eq!(
        events,
        vec![
            CacheEvent::SyncStarted {
                account: ACCOUNT.to_string()
            },
            CacheEvent::SyncCompleted {
                account: ACCOUNT.to_string(),
                failed: vec!["contacts".to_string()],
            },
        ]
    );
}

#[tokio::test]
async fn test_email_network_failure_goes_offline_and_skips_pass() {
    let dir = tempfile::tempdir().unwrap();
    let remote = populated_remote();
    remote.set_unreachable(true);
    let (cache, _rx) = cache_at(dir.path(), remote.clone());

    let report = cache.sync_now(ACCOUNT).await.unwrap();
    assert!(report.went_offline);
    assert!(!cache.is_online());
    assert_eq!(report.folders, PullOutcome::Skipped);
    assert_eq!(report.calendars, PullOutcome::Skipped);
    assert_eq!(report.contacts, PullOutcome::Skipped);
    assert_eq!(remote.calls().len(), 1);
    assert_eq!(cache.folders(ACCOUNT).unwrap().count().unwrap(), 0);
}

#[tokio::test]
async fn test_successful_pass_restores_online_and_drains() {
    let dir = tempfile::tempdir().unwrap();
    let remote = populated_remote();
    remote.set_unreachable(true);
    let (cache, rx) = cache_at(dir.path(), remote.clone());

    cache.sync_now(ACCOUNT).await.unwrap();
    assert!(!cache.is_online());
    cache
        .apply(
            ACCOUNT,
            EmailAction::MarkRead {
                email_id: "m1".to_string(),
            },
        )
        .await
        .unwrap();

    remote.set_unreachable(false);
    let report = cache.sync_now(ACCOUNT).await.unwrap();
    assert!(!report.went_offline);
    assert!(cache.is_online());
    assert!(cache.queue(ACCOUNT).unwrap().is_empty().unwrap());
    assert_eq!(remote.mutated_ids(), vec!["m1"]);
    // Replayed once, after the last pull of the pass
    assert!(matches!(remote.calls().last(), Some(Call::Update { .. })));

    let events: Vec<CacheEvent> = rx.drain().collect();
    assert!(events.contains(&CacheEvent::OnlineChanged { online: false }));
    assert!(events.contains(&CacheEvent::OnlineChanged { online: true }));
    assert!(events.contains(&CacheEvent::QueueDrained {
        account: ACCOUNT.to_string(),
        replayed: 1,
        remaining: 0,
    }));
}

#[tokio::test]
async fn test_drains_are_independent_per_account() {
    let dir = tempfile::tempdir().unwrap();
    let remote = populated_remote();
    remote.script().rejected_messages.insert("a1".to_string());
    let (cache, _rx) = cache_at(dir.path(), remote.clone());

    cache.set_online(false).await;
    for (account, id) in [("a@x.com", "a1"), ("a@x.com", "a2"), ("b@x.com", "b1")] {
        cache
            .apply(
                account,
                EmailAction::Star {
                    email_id: id.to_string(),
                },
            )
            .await
            .unwrap();
    }

    let reports = cache.set_online(true).await;
    assert_eq!(reports.len(), 2);
    assert_eq!(remote.mutated_ids(), vec!["a1", "b1"]);
    assert_eq!(cache.queue("a@x.com").unwrap().len().unwrap(), 2);
    assert!(cache.queue("b@x.com").unwrap().is_empty().unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_loops_run_until_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let remote = populated_remote();
    let (cache, _rx) = cache_at(dir.path(), remote.clone());
    let accounts = vec!["a@x.com".to_string(), "b@x.com".to_string()];

    cache.start(&accounts).unwrap();
    // Starting twice does not duplicate loops
    cache.start(&accounts).unwrap();

    for account in &accounts {
        while cache.loop_state(account) != Some(LoopState::Running) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
    let pulls = |remote: &common::ScriptedRemote| {
        remote
            .calls()
            .iter()
            .filter(|c| matches!(c, Call::ListMessages { .. }))
            .count()
    };
    assert_eq!(pulls(&remote), 2);

    // One more pass per account after the interval
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(pulls(&remote), 4);

    cache.stop().await.unwrap();
    assert_eq!(cache.loop_state("a@x.com"), None);
    assert!(cache.storage_manager().open_accounts().is_empty());

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(pulls(&remote), 4);

    assert!(matches!(cache.start(&accounts), Err(CacheError::Closed(_))));
}

#[tokio::test]
async fn test_background_sync_disabled_starts_no_loops() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = common::settings();
    settings.background_sync_enabled = false;
    let remote = populated_remote();
    let (cache, _rx) = air_cache::AirCache::new(
        air_cache::CacheConfig::new(dir.path(), settings),
        remote.clone(),
    );

    cache.start(&[ACCOUNT.to_string()]).unwrap();
    assert_eq!(cache.loop_state(ACCOUNT), None);
    assert!(remote.calls().is_empty());

    // Registered accounts are still drained
    cache.set_online(false).await;
    cache
        .queue(ACCOUNT)
        .unwrap()
        .enqueue(&EmailAction::Unstar {
            email_id: "m1".to_string(),
        })
        .unwrap();
    cache.storage_manager().close(ACCOUNT).unwrap();
    let reports = cache.set_online(true).await;
    assert_eq!(reports.len(), 1);
    cache.stop().await.unwrap();
}
