use anyhow::Result;
use std::time::Duration;
use tokio::time::{self, Instant};

use crate::health_monitor::MemberState;
use crate::member::{MemberAdvertisement, MemberId};
use crate::message::{MasterMessage, MasterMessageKind};
use crate::tests::mocks::*;
use crate::view::{ViewEvent, ViewEventKind};

fn view_change(source: &MemberAdvertisement, seq: u64, view: Vec<MemberAdvertisement>, event: ViewEvent) -> MasterMessage {
    MasterMessage::new(source.clone(), seq, MasterMessageKind::ViewChange { view, event })
}

// Helper function to make `master` the assigned master, with `others` also in the view
async fn follow_master(service: &crate::group::GroupService, master: &MemberAdvertisement, others: &[MemberAdvertisement]) {
    for other in others {
        service.view_manager().add(other).await;
    }
    service.view_manager().set_master(master, false).await;
    service.context().master_state.set_master_assigned(true);
}

fn announcement(source: &MemberAdvertisement, seq: u64, view: Vec<MemberAdvertisement>) -> MasterMessage {
    MasterMessage::new(
        source.clone(),
        seq,
        MasterMessageKind::MasterAnnouncement {
            view,
            event: Some(ViewEvent::new(ViewEventKind::MasterChange, source.clone())),
        },
    )
}

#[tokio::test]
async fn test_master_answers_query_and_announces_new_member() -> Result<()> {
    let transport = RecordingTransport::new();
    let local = member("local", 100);
    let service = create_test_service(local.clone(), transport.clone(), StaticProber::new(true));
    service.context().master_state.set_is_master(true);
    service.view_manager().set_master(&local, false).await;
    let events = record_events(&service);

    let m2 = member("m2", 200);
    service
        .election()
        .handle_message(MasterMessage::new(m2.clone(), 0, MasterMessageKind::MasterQuery))
        .await;

    let sent = transport.master_messages();
    let response = sent
        .iter()
        .find(|(to, message)| {
            to.as_ref() == Some(&m2.id) && matches!(message.kind, MasterMessageKind::MasterResponse { .. })
        })
        .expect("master response sent to querier");
    match &response.1.kind {
        MasterMessageKind::MasterResponse { view, .. } => {
            assert!(view.iter().any(|m| m.id == m2.id));
            assert!(view.iter().any(|m| m.id == local.id));
        }
        other => panic!("unexpected {:?}", other),
    }

    let change = sent
        .iter()
        .find(|(to, message)| to.is_none() && matches!(message.kind, MasterMessageKind::ViewChange { .. }))
        .expect("view change broadcast");
    assert_eq!(change.1.master_view_id, 1);
    assert_eq!(service.context().master_state.master_view_id(), 1);
    assert_eq!(count_events(&events, ViewEventKind::Add, &m2.id), 1);
    Ok(())
}

#[tokio::test]
async fn test_non_master_answers_query_with_node_response() -> Result<()> {
    let transport = RecordingTransport::new();
    let service = create_test_service(member("local", 100), transport.clone(), StaticProber::new(true));
    let m2 = member("m2", 200);

    service
        .election()
        .handle_message(MasterMessage::new(m2.clone(), 0, MasterMessageKind::MasterQuery))
        .await;

    let sent = transport.master_messages();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0.as_ref(), Some(&m2.id));
    assert_eq!(sent[0].1.kind, MasterMessageKind::NodeResponse);
    assert!(service.view_manager().contains(&m2.id).await);
    Ok(())
}

#[tokio::test]
async fn test_announcement_installs_master_and_view() -> Result<()> {
    let transport = RecordingTransport::new();
    let local = member("local", 300);
    let service = create_test_service(local.clone(), transport.clone(), StaticProber::new(true));
    let events = record_events(&service);
    let m1 = member("m1", 100);
    let m2 = member("m2", 200);

    service
        .election()
        .handle_message(announcement(&m1, 1, vec![m1.clone(), m2.clone(), local.clone()]))
        .await;

    assert_eq!(service.master().await.map(|m| m.id), Some(m1.id.clone()));
    assert!(!service.is_master());
    let view = service.view().await;
    assert_eq!(view.size(), 3);
    assert_eq!(view.master(), Some(&m1.id));
    assert_eq!(view.master_view_id(), 1);
    assert_eq!(count_events(&events, ViewEventKind::MasterChange, &m1.id), 1);
    Ok(())
}

#[tokio::test]
async fn test_view_without_local_member_triggers_reannounce() -> Result<()> {
    let transport = RecordingTransport::new();
    let local = member("local", 300);
    let service = create_test_service(local.clone(), transport.clone(), StaticProber::new(true));
    let m1 = member("m1", 100);

    service.election().handle_message(announcement(&m1, 1, vec![m1.clone()])).await;

    let sent = transport.master_messages();
    assert!(sent
        .iter()
        .any(|(to, message)| to.as_ref() == Some(&m1.id) && message.kind == MasterMessageKind::NodeResponse));
    assert!(service.view_manager().contains(&local.id).await);
    Ok(())
}

#[tokio::test]
async fn test_stale_views_are_dropped() -> Result<()> {
    let transport = RecordingTransport::new();
    let local = member("local", 300);
    let service = create_test_service(local.clone(), transport.clone(), StaticProber::new(true));
    let m1 = member("m1", 100);
    let m2 = member("m2", 200);
    let election = service.election();

    election.handle_message(announcement(&m1, 3, vec![m1.clone(), local.clone()])).await;
    assert_eq!(service.context().master_state.master_view_id(), 3);

    // an older view that would add m2 is not applied
    let stale = MasterMessage::new(
        m1.clone(),
        2,
        MasterMessageKind::ViewChange {
            view: vec![m1.clone(), m2.clone(), local.clone()],
            event: ViewEvent::new(ViewEventKind::Add, m2.clone()),
        },
    );
    election.handle_message(stale).await;
    assert!(!service.view_manager().contains(&m2.id).await);
    assert_eq!(service.context().master_state.master_view_id(), 3);
    Ok(())
}

#[tokio::test]
async fn test_late_resend_delivers_event_without_rollback() -> Result<()> {
    let transport = RecordingTransport::new();
    let local = member("local", 300);
    let service = create_test_service(local.clone(), transport.clone(), StaticProber::new(true));
    let events = record_events(&service);
    let m1 = member("m1", 100);
    let x = member("x", 400);
    let y = member("y", 500);
    let election = service.election();

    election
        .handle_message(announcement(&m1, 5, vec![m1.clone(), local.clone(), x.clone()]))
        .await;

    let mut resent = MasterMessage::new(
        m1.clone(),
        4,
        MasterMessageKind::ViewChange {
            view: vec![m1.clone(), local.clone()],
            event: ViewEvent::new(ViewEventKind::Failure, y.clone()),
        },
    );
    resent.resend = true;
    election.handle_message(resent.clone()).await;

    assert_eq!(count_events(&events, ViewEventKind::Failure, &y.id), 1);
    assert!(service.view_manager().contains(&x.id).await);
    assert_eq!(service.context().master_state.master_view_id(), 5);

    // a second copy is a duplicate
    election.handle_message(resent).await;
    assert_eq!(count_events(&events, ViewEventKind::Failure, &y.id), 1);
    Ok(())
}

#[tokio::test]
async fn test_junior_master_resigns_on_collision() -> Result<()> {
    let transport = RecordingTransport::new();
    let local = member("local", 300);
    let service = create_test_service(local.clone(), transport.clone(), StaticProber::new(true));
    service.context().master_state.set_is_master(true);
    service.view_manager().set_master(&local, false).await;
    let senior = member("m1", 100);

    service
        .election()
        .handle_message(announcement(&senior, 1, vec![senior.clone()]))
        .await;

    assert!(!service.is_master());
    let sent = transport.master_messages();
    assert!(sent
        .iter()
        .any(|(to, message)| to.as_ref() == Some(&senior.id) && message.kind == MasterMessageKind::MasterCollision));
    assert!(service.view_manager().contains(&senior.id).await);
    Ok(())
}

#[tokio::test]
async fn test_senior_master_reasserts_on_collision() -> Result<()> {
    let transport = RecordingTransport::new();
    let local = member("local", 100);
    let service = create_test_service(local.clone(), transport.clone(), StaticProber::new(true));
    service.context().master_state.set_is_master(true);
    service.view_manager().set_master(&local, false).await;
    let junior = member("m3", 300);

    service
        .election()
        .handle_message(announcement(&junior, 1, vec![junior.clone()]))
        .await;

    assert!(service.is_master());
    let sent = transport.master_messages();
    assert!(sent
        .iter()
        .any(|(to, message)| to.as_ref() == Some(&junior.id) && message.kind == MasterMessageKind::MasterCollision));
    assert!(sent
        .iter()
        .any(|(to, message)| to.is_none() && matches!(message.kind, MasterMessageKind::MasterAnnouncement { .. })));
    Ok(())
}

#[tokio::test]
async fn test_restarted_master_is_replaced() -> Result<()> {
    let transport = RecordingTransport::new();
    let local = member("local", 300);
    let service = create_test_service(local.clone(), transport.clone(), StaticProber::new(true));
    let m1 = member("m1", 100);
    service.view_manager().add(&m1).await;
    service.view_manager().set_master(&m1, false).await;

    let restarted = member("m1", 150);
    assert!(service.election().check_restart(&restarted).await);

    assert!(service.master().await.is_none());
    let cached = service.view_manager().get(&m1.id).await.unwrap();
    assert_eq!(cached.start_time, 150);
    assert_eq!(service.view_manager().take_rejoin(&m1.id).await, Some(100));

    // the same incarnation again is not a restart
    assert!(!service.election().check_restart(&restarted).await);
    Ok(())
}

#[tokio::test]
async fn test_group_startup_complete_only_from_master() -> Result<()> {
    let transport = RecordingTransport::new();
    let local = member("local", 300);
    let service = create_test_service(local.clone(), transport.clone(), StaticProber::new(true));
    let m1 = member("m1", 100);
    let m2 = member("m2", 200);
    let complete = |source: &MemberAdvertisement| {
        MasterMessage::new(
            source.clone(),
            0,
            MasterMessageKind::GroupStartupComplete {
                members: vec![m1.clone(), m2.clone(), local.clone()],
            },
        )
    };

    service.election().handle_message(complete(&m2)).await;
    assert!(!service.group_startup_complete());

    service.view_manager().set_master(&m1, false).await;
    service.election().handle_message(complete(&m1)).await;
    assert!(service.group_startup_complete());
    assert!(service.view_manager().contains(&MemberId::from("m2")).await);
    Ok(())
}

#[tokio::test]
async fn test_group_startup_complete_requires_master() -> Result<()> {
    let transport = RecordingTransport::new();
    let service = create_test_service(member("local", 100), transport.clone(), StaticProber::new(true));

    assert!(service.announce_group_startup_complete().await.is_err());

    service.context().master_state.set_is_master(true);
    service.announce_group_startup_complete().await?;
    assert!(service.group_startup_complete());
    assert!(transport
        .master_messages()
        .iter()
        .any(|(to, message)| to.is_none()
            && matches!(message.kind, MasterMessageKind::GroupStartupComplete { .. })));
    Ok(())
}

#[tokio::test]
async fn test_stale_view_is_applied_during_discovery() -> Result<()> {
    let transport = RecordingTransport::new();
    let local = member("local", 300);
    let service = create_test_service(local.clone(), transport.clone(), StaticProber::new(true));
    let m1 = member("m1", 100);
    let m2 = member("m2", 200);
    let election = service.election();

    election.handle_message(announcement(&m1, 3, vec![m1.clone(), local.clone()])).await;
    service.context().master_state.set_discovery_in_progress(true);

    election
        .handle_message(view_change(
            &m1,
            2,
            vec![m1.clone(), m2.clone(), local.clone()],
            ViewEvent::new(ViewEventKind::Add, m2.clone()),
        ))
        .await;
    assert!(service.view_manager().contains(&m2.id).await);
    assert_eq!(service.context().master_state.master_view_id(), 2);
    Ok(())
}

#[tokio::test]
async fn test_duplicate_view_change_is_dropped() -> Result<()> {
    let transport = RecordingTransport::new();
    let local = member("local", 300);
    let service = create_test_service(local.clone(), transport.clone(), StaticProber::new(true));
    let events = record_events(&service);
    let m1 = member("m1", 100);
    let m2 = member("m2", 200);
    let election = service.election();

    election.handle_message(announcement(&m1, 3, vec![m1.clone(), local.clone()])).await;
    let change = view_change(
        &m1,
        4,
        vec![m1.clone(), m2.clone(), local.clone()],
        ViewEvent::new(ViewEventKind::Add, m2.clone()),
    );
    election.handle_message(change.clone()).await;
    assert_eq!(count_events(&events, ViewEventKind::Add, &m2.id), 1);

    // the same (master, id) again must not be re-applied
    service.view_manager().remove(&m2).await;
    election.handle_message(change).await;
    assert!(!service.view_manager().contains(&m2.id).await);
    assert_eq!(count_events(&events, ViewEventKind::Add, &m2.id), 1);
    Ok(())
}

#[tokio::test]
async fn test_junior_claim_replaces_master_missing_from_its_view() -> Result<()> {
    let transport = RecordingTransport::new();
    let local = member("m3", 300);
    let service = create_test_service(local.clone(), transport.clone(), StaticProber::new(true));
    let events = record_events(&service);
    let m1 = member("m1", 100);
    let m2 = member("m2", 200);
    follow_master(&service, &m1, &[m2.clone()]).await;
    let election = service.election();

    election.handle_message(announcement(&m2, 6, vec![m2.clone(), local.clone()])).await;
    assert_eq!(service.master().await.map(|m| m.id), Some(m2.id.clone()));

    election
        .handle_message(view_change(
            &m2,
            7,
            vec![m2.clone(), local.clone()],
            ViewEvent::new(ViewEventKind::Failure, m1.clone()),
        ))
        .await;
    assert_eq!(count_events(&events, ViewEventKind::Failure, &m1.id), 1);
    assert_eq!(
        service.view().await.member_ids(),
        vec![MemberId::from("m2"), MemberId::from("m3")]
    );
    assert_eq!(service.context().master_state.master_view_id(), 7);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_silent_master_fails_once_when_junior_takes_over() -> Result<()> {
    let transport = RecordingTransport::new();
    let local = member("m3", 300);
    let service = create_test_service(local.clone(), transport.clone(), StaticProber::new(false));
    let events = record_events(&service);
    let m1 = member("m1", 100);
    let m2 = member("m2", 200);
    follow_master(&service, &m1, &[m2.clone()]).await;
    service.health().process(heartbeat(&m1, MemberState::Alive, 4)).await;

    time::advance(service.context().config.suspicion_threshold() + Duration::from_millis(10)).await;

    let election = service.election();
    election.handle_message(announcement(&m2, 6, vec![m2.clone(), local.clone()])).await;
    assert_eq!(service.master().await.map(|m| m.id), Some(m2.id.clone()));
    assert_eq!(service.member_state(&m1.id).await, Some(MemberState::Dead));
    assert_eq!(count_events(&events, ViewEventKind::Failure, &m1.id), 1);

    // the new master's own FAILURE announcement is not delivered twice
    election
        .handle_message(view_change(
            &m2,
            7,
            vec![m2.clone(), local.clone()],
            ViewEvent::new(ViewEventKind::Failure, m1.clone()),
        ))
        .await;
    assert_eq!(count_events(&events, ViewEventKind::Failure, &m1.id), 1);
    Ok(())
}

#[tokio::test]
async fn test_junior_claim_ignored_while_master_heartbeats() -> Result<()> {
    let transport = RecordingTransport::new();
    let local = member("m3", 300);
    let service = create_test_service(local.clone(), transport.clone(), StaticProber::new(true));
    let m1 = member("m1", 100);
    let m2 = member("m2", 200);
    follow_master(&service, &m1, &[m2.clone()]).await;
    service.health().process(heartbeat(&m1, MemberState::Alive, 4)).await;

    service
        .election()
        .handle_message(announcement(&m2, 6, vec![m2.clone(), local.clone()]))
        .await;

    assert_eq!(service.master().await.map(|m| m.id), Some(m1.id.clone()));
    assert!(service.view_manager().contains(&m1.id).await);
    assert_eq!(service.member_state(&m1.id).await, Some(MemberState::Alive));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_discovery_runs_every_round_after_earlier_master() -> Result<()> {
    let transport = RecordingTransport::new();
    let local = member("local", 300);
    let service = create_test_service(local.clone(), transport.clone(), StaticProber::new(true));
    let m1 = member("m1", 100);
    let election = service.election();

    // an applied announcement wakes nobody, so nothing may linger for later rounds
    election.handle_message(announcement(&m1, 1, vec![m1.clone(), local.clone()])).await;
    service.view_manager().clear_master().await;
    service.context().master_state.set_master_assigned(false);
    transport.take();

    let started = Instant::now();
    election.discover_master().await?;

    let config = &service.context().config;
    assert!(started.elapsed() >= config.discovery_timeout() * config.discovery_attempts);
    let queries = transport
        .master_messages()
        .into_iter()
        .filter(|(_, message)| message.kind == MasterMessageKind::MasterQuery)
        .count();
    assert_eq!(queries, config.discovery_attempts as usize);
    assert_eq!(service.master().await.map(|m| m.id), Some(m1.id.clone()));
    Ok(())
}
