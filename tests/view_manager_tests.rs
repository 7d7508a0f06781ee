use anyhow::Result;
use hive_gms::transport::{MemoryNetwork, MemoryTransport};
use hive_gms::view_manager::ViewManager;
use hive_gms::{
    ClusterView, GroupConfig, GroupContext, MemberAdvertisement, MemberId, ViewEvent, ViewEventKind,
};
use std::sync::{Arc, Mutex};

// Helper function to create a test member
fn create_test_member(id: &str, start_time: u64) -> MemberAdvertisement {
    MemberAdvertisement::with_start_time(MemberId::from(id), id, start_time)
}

// Helper function to create a view manager for `local` on a fresh network
fn create_test_view_manager(local: &MemberAdvertisement) -> (Arc<MemoryTransport>, ViewManager) {
    let network = MemoryNetwork::new();
    let transport = network.transport(&local.id);
    let context = GroupContext::new(GroupConfig::default(), local.clone(), transport.clone());
    (transport, ViewManager::new(context))
}

fn record_events(manager: &ViewManager) -> Arc<Mutex<Vec<(ViewEvent, usize)>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    manager.add_listener(Arc::new(move |event: &ViewEvent, view: &ClusterView| {
        sink.lock().unwrap().push((event.clone(), view.size()));
    }));
    events
}

#[tokio::test]
async fn test_view_starts_with_local_member() -> Result<()> {
    let local = create_test_member("local", 100);
    let (_transport, manager) = create_test_view_manager(&local);

    let view = manager.get_local_view().await;
    assert_eq!(view.size(), 1);
    assert!(view.contains(&local.id));
    assert!(view.master().is_none());
    Ok(())
}

#[tokio::test]
async fn test_view_size_counts_distinct_members() -> Result<()> {
    let local = create_test_member("local", 100);
    let (transport, manager) = create_test_view_manager(&local);

    assert!(manager.add(&create_test_member("m2", 200)).await);
    assert!(manager.add(&create_test_member("m3", 300)).await);
    assert!(!manager.add(&create_test_member("m3", 300)).await);

    let view = manager.get_local_view().await;
    assert_eq!(view.size(), 3);
    assert_eq!(
        view.member_ids(),
        vec![MemberId::from("local"), MemberId::from("m2"), MemberId::from("m3")]
    );
    assert_eq!(transport.routes(), vec![MemberId::from("m2"), MemberId::from("m3")]);
    Ok(())
}

#[tokio::test]
async fn test_local_view_ids_increase() -> Result<()> {
    let local = create_test_member("local", 100);
    let (_transport, manager) = create_test_view_manager(&local);

    let first = manager.get_local_view().await;
    let second = manager.get_local_view().await;
    assert!(second.view_id() > first.view_id());
    Ok(())
}

#[tokio::test]
async fn test_set_master_is_idempotent() -> Result<()> {
    let local = create_test_member("local", 100);
    let (_transport, manager) = create_test_view_manager(&local);
    let events = record_events(&manager);
    let m2 = create_test_member("m2", 200);

    assert!(manager.set_master(&m2, true).await);
    assert!(!manager.set_master(&m2, true).await);

    let events = events.lock().unwrap();
    let changes = events
        .iter()
        .filter(|(event, _)| event.kind == ViewEventKind::MasterChange)
        .count();
    assert_eq!(changes, 1);
    assert!(manager.is_master(&m2.id).await);
    Ok(())
}

#[tokio::test]
async fn test_master_candidate_is_most_senior() -> Result<()> {
    let local = create_test_member("m3", 300);
    let (_transport, manager) = create_test_view_manager(&local);
    manager.add(&create_test_member("m1", 100)).await;
    manager.add(&create_test_member("m2", 200)).await;

    assert_eq!(manager.get_master_candidate().await.id, MemberId::from("m1"));
    assert_eq!(
        manager
            .master_candidate_excluding(Some(&MemberId::from("m1")))
            .await
            .id,
        MemberId::from("m2")
    );
    Ok(())
}

#[tokio::test]
async fn test_equal_start_times_prefer_greater_id() -> Result<()> {
    let local = create_test_member("a", 100);
    let (_transport, manager) = create_test_view_manager(&local);
    manager.add(&create_test_member("b", 100)).await;

    assert_eq!(manager.get_master_candidate().await.id, MemberId::from("b"));
    Ok(())
}

#[tokio::test]
async fn test_restart_replaces_member_and_marks_rejoin() -> Result<()> {
    let local = create_test_member("local", 100);
    let (_transport, manager) = create_test_view_manager(&local);
    let events = record_events(&manager);
    let old = create_test_member("m2", 200);
    let new = create_test_member("m2", 250);

    manager.add(&old).await;
    assert!(manager.add(&new).await);
    assert_eq!(manager.get(&new.id).await.unwrap().start_time, 250);

    // the next authoritative ADD for m2 carries the previous start time
    let view = manager.members().await;
    manager
        .add_to_view(&view, true, &ViewEvent::new(ViewEventKind::Add, new.clone()))
        .await;
    let events = events.lock().unwrap();
    let (event, _) = events.last().unwrap();
    assert_eq!(event.kind, ViewEventKind::Add);
    assert_eq!(event.previous_start_time, Some(200));
    assert!(event.is_rejoin());
    Ok(())
}

#[tokio::test]
async fn test_remove_leaves_newer_incarnation() -> Result<()> {
    let local = create_test_member("local", 100);
    let (transport, manager) = create_test_view_manager(&local);
    let old = create_test_member("m2", 200);
    let new = create_test_member("m2", 250);

    manager.add(&new).await;
    assert!(manager.remove(&old).await.is_none());
    assert!(manager.contains(&new.id).await);

    assert!(manager.remove(&new).await.is_some());
    assert!(!manager.contains(&new.id).await);
    assert!(transport.routes().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_non_authoritative_view_is_silent() -> Result<()> {
    let local = create_test_member("local", 100);
    let (_transport, manager) = create_test_view_manager(&local);
    let events = record_events(&manager);
    let m2 = create_test_member("m2", 200);

    let changed = manager
        .add_to_view(
            &[local.clone(), m2.clone()],
            false,
            &ViewEvent::new(ViewEventKind::Add, m2.clone()),
        )
        .await;
    assert!(changed);
    assert!(manager.contains(&m2.id).await);
    assert!(events.lock().unwrap().is_empty());

    // the first authoritative view still announces m2
    manager
        .add_to_view(
            &[local.clone(), m2.clone()],
            true,
            &ViewEvent::new(ViewEventKind::Add, m2.clone()),
        )
        .await;
    assert_eq!(events.lock().unwrap().len(), 1);

    // an unchanged authoritative ADD is not re-announced
    manager
        .add_to_view(
            &[local.clone(), m2.clone()],
            true,
            &ViewEvent::new(ViewEventKind::Add, m2.clone()),
        )
        .await;
    assert_eq!(events.lock().unwrap().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_view_keeps_local_member() -> Result<()> {
    let local = create_test_member("local", 100);
    let (_transport, manager) = create_test_view_manager(&local);
    let m2 = create_test_member("m2", 200);

    manager
        .add_to_view(&[m2.clone()], true, &ViewEvent::new(ViewEventKind::Add, m2.clone()))
        .await;
    assert!(manager.contains(&local.id).await);
    assert_eq!(manager.members().await.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_terminal_events_delivered_once_per_incarnation() -> Result<()> {
    let local = create_test_member("local", 100);
    let (_transport, manager) = create_test_view_manager(&local);
    let events = record_events(&manager);
    let m2 = create_test_member("m2", 200);

    assert!(manager.notify_listeners(ViewEvent::new(ViewEventKind::Failure, m2.clone())).await);
    assert!(!manager.notify_listeners(ViewEvent::new(ViewEventKind::Failure, m2.clone())).await);

    // a new incarnation may fail again
    let restarted = create_test_member("m2", 300);
    assert!(manager.notify_listeners(ViewEvent::new(ViewEventKind::Failure, restarted)).await);

    // non-terminal events are never suppressed
    manager.notify_listeners(ViewEvent::new(ViewEventKind::InDoubt, m2.clone())).await;
    manager.notify_listeners(ViewEvent::new(ViewEventKind::InDoubt, m2.clone())).await;

    assert_eq!(events.lock().unwrap().len(), 4);
    Ok(())
}

#[tokio::test]
async fn test_panicking_listener_does_not_block_others() -> Result<()> {
    let local = create_test_member("local", 100);
    let (_transport, manager) = create_test_view_manager(&local);
    manager.add_listener(Arc::new(|_: &ViewEvent, _: &ClusterView| panic!("listener failure")));
    let events = record_events(&manager);

    manager
        .notify_listeners(ViewEvent::new(ViewEventKind::JoinedAndReady, local.clone()))
        .await;
    assert_eq!(events.lock().unwrap().len(), 1);
    assert_eq!(manager.listener_count(), 2);
    Ok(())
}

#[tokio::test]
async fn test_listener_sees_snapshot_after_change() -> Result<()> {
    let local = create_test_member("local", 100);
    let (_transport, manager) = create_test_view_manager(&local);
    let events = record_events(&manager);
    let m2 = create_test_member("m2", 200);
    let m3 = create_test_member("m3", 300);

    manager
        .add_to_view(
            &[local.clone(), m2.clone(), m3.clone()],
            true,
            &ViewEvent::new(ViewEventKind::Add, m3.clone()),
        )
        .await;

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].1, 3);
    Ok(())
}

#[tokio::test]
async fn test_one_terminal_event_per_incarnation_across_kinds() -> Result<()> {
    let local = create_test_member("local", 100);
    let (_transport, manager) = create_test_view_manager(&local);
    let events = record_events(&manager);
    let m2 = create_test_member("m2", 200);

    assert!(manager.notify_listeners(ViewEvent::new(ViewEventKind::PeerStop, m2.clone())).await);
    assert!(!manager.notify_listeners(ViewEvent::new(ViewEventKind::ClusterStop, m2.clone())).await);
    assert!(!manager.notify_listeners(ViewEvent::new(ViewEventKind::Failure, m2.clone())).await);

    // once a newer incarnation is gone, an older one's echo stays quiet
    let restarted = create_test_member("m2", 300);
    assert!(manager.notify_listeners(ViewEvent::new(ViewEventKind::Failure, restarted)).await);
    assert!(!manager.notify_listeners(ViewEvent::new(ViewEventKind::Failure, m2.clone())).await);

    assert_eq!(events.lock().unwrap().len(), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_terminal_records_expire_after_retention() -> Result<()> {
    let local = create_test_member("local", 100);
    let (_transport, manager) = create_test_view_manager(&local);
    let m2 = create_test_member("m2", 200);

    assert!(manager.notify_listeners(ViewEvent::new(ViewEventKind::Failure, m2.clone())).await);
    tokio::time::advance(GroupConfig::default().processed_view_expiry()).await;

    // the record for m2 was pruned, so it no longer suppresses anything
    assert!(manager.notify_listeners(ViewEvent::new(ViewEventKind::Failure, m2.clone())).await);
    Ok(())
}
