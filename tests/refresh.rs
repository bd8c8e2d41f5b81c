#![allow(non_snake_case)]

use alloy::primitives::{
    Address,
    U256,
};
use std::time::Duration;
use team_lottery::{
    cache::ReadCache,
    chain::{
        ChainClient,
        Connection,
    },
    coordinator::{
        SyncWorker,
        SyncWorkerEvent,
    },
    error::FetchError,
    session::SessionTracker,
    test_helpers::FakeChain,
    types::{
        ContractEventKind,
        RefreshTicket,
        Team,
        TriggerSource,
    },
};
use tokio::sync::mpsc;

fn team(n: u8) -> Team {
    Team::new(format!("team-{n}"), Address::repeat_byte(n), U256::from(n * 3))
}

async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

async fn next_matching<T>(
    events: &mut mpsc::UnboundedReceiver<SyncWorkerEvent>,
    mut pick: impl FnMut(SyncWorkerEvent) -> Option<T>,
) -> T {
    loop {
        let event = events.recv().await.expect("sync worker stopped");
        if let Some(found) = pick(event) {
            return found;
        }
    }
}

#[tokio::test]
async fn refresh__twice_without_chain_changes_is_idempotent() {
    // given
    let chain = FakeChain::with_teams(vec![team(1), team(2), team(3)]);
    let mut tracker = SessionTracker::new();
    let key = tracker.connect(chain.chain_id());
    let cache = ReadCache::new(tracker.watcher());
    let connection = Connection::new(chain, key);

    // when
    let first = cache.refresh(&connection, RefreshTicket(1)).await.unwrap();
    let second = cache.refresh(&connection, RefreshTicket(2)).await.unwrap();

    // then
    assert_eq!(first.teams, second.teams);
    assert_eq!(first.team_count, second.team_count);
    assert_eq!(first.balance, second.balance);
    assert_eq!(second.ticket, Some(RefreshTicket(2)));
}

#[tokio::test]
async fn sync_worker__mount_event_and_timer_share_one_read_burst() {
    // given
    let chain = FakeChain::with_teams(vec![team(1)]);
    let mut tracker = SessionTracker::new();
    let cache = ReadCache::new(tracker.watcher());
    let (handle, mut events, _task) = SyncWorker::spawn(cache, Duration::from_secs(3600));
    chain.hold_reads();
    let key = tracker.connect(chain.chain_id());
    handle.connect(Connection::new(chain.clone(), key));
    let mount = next_matching(&mut events, |e| match e {
        SyncWorkerEvent::RefreshStarted { ticket, source } => Some((ticket, source)),
        _ => None,
    })
    .await;

    // when
    chain.emit(ContractEventKind::TeamRegistered);
    handle.refresh().trigger(TriggerSource::Timer);
    settle().await;
    chain.release_reads();

    // then
    assert_eq!(mount.1, TriggerSource::Mount);
    let trailing = next_matching(&mut events, |e| match e {
        SyncWorkerEvent::RefreshStarted { ticket, source } => Some((ticket, source)),
        _ => None,
    })
    .await;
    assert!(trailing.0 > mount.0);
    let finished = next_matching(&mut events, |e| match e {
        SyncWorkerEvent::RefreshFinished { ticket, result } if ticket == trailing.0 => {
            Some(result)
        }
        _ => None,
    })
    .await;
    assert_eq!(finished, Ok(()));
    settle().await;
    assert!(events.try_recv().is_err());
    assert_eq!(chain.count_reads(), 2);
    assert_eq!(chain.max_concurrent_refreshes(), 1);
}

#[tokio::test]
async fn refresh__result_returning_after_network_switch_is_dropped() {
    // given
    let on_a = FakeChain::with_teams(vec![team(1)]).on_chain(1);
    let mut tracker = SessionTracker::new();
    let key_a = tracker.connect(on_a.chain_id());
    let cache = ReadCache::new(tracker.watcher());
    let connection = Connection::new(on_a.clone(), key_a);
    on_a.hold_reads();

    // when
    let refresh = cache.refresh(&connection, RefreshTicket(1));
    let switch = async {
        settle().await;
        tracker.connect(11155111);
        on_a.release_reads();
    };
    let (result, ()) = tokio::join!(refresh, switch);

    // then
    assert_eq!(result, Err(FetchError::Stale));
    assert!(!cache.snapshot().is_loaded());
}

#[tokio::test]
async fn apply__older_ticket_does_not_overwrite_newer_snapshot() {
    // given
    let chain = FakeChain::with_teams(vec![team(1)]);
    let mut tracker = SessionTracker::new();
    let key = tracker.connect(chain.chain_id());
    let cache = ReadCache::new(tracker.watcher());
    let connection = Connection::new(chain.clone(), key);
    cache.refresh(&connection, RefreshTicket(5)).await.unwrap();

    // when
    chain.set_teams(vec![team(1), team(2)]);
    let result = cache.refresh(&connection, RefreshTicket(4)).await.unwrap();

    // then
    assert_eq!(result.ticket, Some(RefreshTicket(5)));
    assert_eq!(cache.snapshot().teams, vec![team(1)]);
}

#[tokio::test]
async fn refresh__balance_failure_keeps_teams_and_last_balance() {
    // given
    let chain = FakeChain::with_teams(vec![team(1)]);
    let mut tracker = SessionTracker::new();
    let key = tracker.connect(chain.chain_id());
    let cache = ReadCache::new(tracker.watcher());
    let connection = Connection::new(chain.clone(), key);
    let first = cache.refresh(&connection, RefreshTicket(1)).await.unwrap();

    // when
    chain.fail_balance(true);
    chain.set_teams(vec![team(1), team(2)]);
    let second = cache.refresh(&connection, RefreshTicket(2)).await.unwrap();

    // then
    assert_eq!(second.teams.len(), 2);
    assert_eq!(second.balance, first.balance);
    assert_eq!(
        second.balance.as_ref().map(|b| b.display()),
        Some("0.0200 ETH".to_string())
    );
}
