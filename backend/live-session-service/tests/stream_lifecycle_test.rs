/// Integration tests for the stream lifecycle: start, ingest, publish, stop
mod common;

use common::{eventually, segment, Harness, ScriptedExecutor};
use live_session_service::models::{
    EndReason, EventPayload, InputSegment, JobTarget, SessionState, Variant,
};
use live_session_service::AppError;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

async fn wait_for_entries(h: &Harness, session_id: Uuid, variant: &str, count: usize) {
    let mut rx = h
        .state
        .publisher
        .watch_manifest(session_id, &Variant::new(variant))
        .unwrap();
    tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|m| m.entries.len() >= count))
        .await
        .expect("manifest did not fill in time")
        .unwrap();
}

#[tokio::test]
async fn test_start_ingest_stop_finalizes_everything() {
    let h = Harness::new();
    let mut watcher = h.state.chat.join(h.channel_id, h.owner_id).await.unwrap();

    let started = h.state.registry.start_stream(h.channel_id).await.unwrap();
    assert_eq!(started.state, SessionState::KeyIssued);
    assert!(started.ingest_url.ends_with(&started.stream_key));

    let mut conn = h
        .state
        .gateway
        .accept_connection(&started.stream_key, Uuid::new_v4())
        .unwrap();
    assert_eq!(
        h.state.registry.session_status(started.session_id).unwrap().state,
        SessionState::Live
    );

    conn.push_chunk(segment(1)).await.unwrap();
    conn.push_chunk(segment(2)).await.unwrap();

    wait_for_entries(&h, started.session_id, "720p", 2).await;
    wait_for_entries(&h, started.session_id, "480p", 2).await;

    let manifest = h
        .state
        .publisher
        .manifest(started.session_id, &Variant::new("720p"))
        .unwrap();
    let sequences: Vec<u64> = manifest.entries.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, vec![0, 1]);
    assert!(!manifest.closed);

    let state = h.state.registry.stop_stream(started.session_id).unwrap();
    assert_eq!(state, SessionState::Ended);

    for variant in ["720p", "480p"] {
        let manifest = h
            .state
            .publisher
            .manifest(started.session_id, &Variant::new(variant))
            .unwrap();
        assert!(manifest.closed, "{variant} manifest not final");
        assert!(manifest.to_hls_playlist().contains("#EXT-X-ENDLIST"));
    }

    // the ingest connection is told to close
    assert!(conn.session_token().is_cancelled());
    assert!(matches!(
        conn.push_chunk(segment(3)).await,
        Err(AppError::SessionClosed(_))
    ));

    // no new work is accepted for the ended session
    let late = InputSegment {
        session_id: started.session_id,
        index: 9,
        data: segment(9),
        duration: Duration::from_secs(2),
    };
    assert_eq!(
        h.state.dispatcher.submit(
            started.session_id,
            late,
            JobTarget::Rendition(Variant::new("720p"))
        ),
        Err(AppError::SessionClosed(started.session_id))
    );

    // the key died with the session
    assert!(matches!(
        h.state
            .gateway
            .accept_connection(&started.stream_key, Uuid::new_v4()),
        Err(AppError::KeyInvalid)
    ));

    // viewers saw the stream start and end; the channel stream then finishes
    let mut kinds = Vec::new();
    while let Ok(Some(event)) = watcher.recv().await {
        kinds.push(event.payload.kind());
        if let EventPayload::StreamEnded { reason, .. } = &event.payload {
            assert_eq!(reason, &EndReason::Stopped);
        }
    }
    assert!(kinds.contains(&"streamStarted"));
    assert_eq!(kinds.last(), Some(&"streamEnded"));
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let h = Harness::new();
    let started = h.state.registry.start_stream(h.channel_id).await.unwrap();

    assert_eq!(
        h.state.registry.stop_stream(started.session_id),
        Ok(SessionState::Ended)
    );
    assert_eq!(
        h.state.registry.stop_stream(started.session_id),
        Ok(SessionState::Ended)
    );
}

#[tokio::test]
async fn test_one_active_session_per_channel() {
    let h = Harness::new();
    let first = h.state.registry.start_stream(h.channel_id).await.unwrap();

    let err = h.state.registry.start_stream(h.channel_id).await.unwrap_err();
    assert_eq!(
        err,
        AppError::KeyConflict {
            channel_id: h.channel_id,
            session_id: first.session_id,
        }
    );

    h.state.registry.stop_stream(first.session_id).unwrap();
    let second = h.state.registry.start_stream(h.channel_id).await.unwrap();
    assert_ne!(second.session_id, first.session_id);
    assert_eq!(
        h.state.registry.active_session(h.channel_id),
        Some(second.session_id)
    );
}

#[tokio::test]
async fn test_unknown_channel_is_not_found() {
    let h = Harness::new();
    let err = h
        .state
        .registry
        .start_stream(Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn test_second_ingest_connection_conflicts() {
    let h = Harness::new();
    let started = h.state.registry.start_stream(h.channel_id).await.unwrap();

    let _first = h
        .state
        .gateway
        .accept_connection(&started.stream_key, Uuid::new_v4())
        .unwrap();
    let second = h
        .state
        .gateway
        .accept_connection(&started.stream_key, Uuid::new_v4());
    assert!(matches!(second, Err(AppError::SessionConflict(_))));
}

#[tokio::test]
async fn test_rotated_key_replaces_old_one() {
    let h = Harness::new();
    let started = h.state.registry.start_stream(h.channel_id).await.unwrap();

    let new_key = h.state.registry.rotate_key(started.session_id).unwrap();
    assert_ne!(new_key, started.stream_key);

    assert!(matches!(
        h.state
            .gateway
            .accept_connection(&started.stream_key, Uuid::new_v4()),
        Err(AppError::KeyInvalid)
    ));
    let conn = h
        .state
        .gateway
        .accept_connection(&new_key, Uuid::new_v4())
        .unwrap();
    assert_eq!(conn.session_id, started.session_id);
}

#[tokio::test]
async fn test_ingest_drop_ends_session_after_grace() {
    let h = Harness::new();
    let started = h.state.registry.start_stream(h.channel_id).await.unwrap();

    let mut conn = h
        .state
        .gateway
        .accept_connection(&started.stream_key, Uuid::new_v4())
        .unwrap();
    conn.disconnect().await;
    assert_eq!(
        h.state.registry.session_status(started.session_id).unwrap().state,
        SessionState::Live
    );

    let registry = h.state.registry.clone();
    let session_id = started.session_id;
    assert!(
        eventually(|| {
            let registry = registry.clone();
            async move {
                registry.session_status(session_id).unwrap().state == SessionState::Ended
            }
        })
        .await
    );
    assert_eq!(h.state.registry.active_session(h.channel_id), None);
}

#[tokio::test]
async fn test_reconnect_within_grace_keeps_session_live() {
    let h = Harness::new();
    let started = h.state.registry.start_stream(h.channel_id).await.unwrap();

    let mut first = h
        .state
        .gateway
        .accept_connection(&started.stream_key, Uuid::new_v4())
        .unwrap();
    first.disconnect().await;

    let mut second = h
        .state
        .gateway
        .accept_connection(&started.stream_key, Uuid::new_v4())
        .unwrap();
    second.push_chunk(segment(4)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        h.state.registry.session_status(started.session_id).unwrap().state,
        SessionState::Live
    );
}

#[tokio::test]
async fn test_storage_outage_errors_the_session() {
    let h = Harness::new();
    h.store.down.store(true, std::sync::atomic::Ordering::SeqCst);
    let mut watcher = h.state.chat.join(h.channel_id, h.owner_id).await.unwrap();
    let started = h.state.registry.start_stream(h.channel_id).await.unwrap();

    let mut conn = h
        .state
        .gateway
        .accept_connection(&started.stream_key, Uuid::new_v4())
        .unwrap();
    conn.push_chunk(segment(5)).await.unwrap();

    let registry = h.state.registry.clone();
    let session_id = started.session_id;
    assert!(
        eventually(|| {
            let registry = registry.clone();
            async move {
                registry.session_status(session_id).unwrap().state == SessionState::Errored
            }
        })
        .await
    );

    let session = h.state.registry.session_status(started.session_id).unwrap();
    assert!(session.error.unwrap().contains("storage"));
    assert!(conn.session_token().is_cancelled());

    let mut ended = None;
    while let Ok(Some(event)) = watcher.recv().await {
        if let EventPayload::StreamEnded { reason, .. } = event.payload {
            ended = Some(reason);
        }
    }
    assert!(matches!(ended, Some(EndReason::Failed { .. })));
}

#[tokio::test]
async fn test_permanent_variant_failure_degrades_only_that_variant() {
    let h = Harness::with(common::test_config(), ScriptedExecutor::failing(&["480p"]));
    let started = h.state.registry.start_stream(h.channel_id).await.unwrap();

    let mut conn = h
        .state
        .gateway
        .accept_connection(&started.stream_key, Uuid::new_v4())
        .unwrap();
    conn.push_chunk(segment(6)).await.unwrap();
    conn.push_chunk(segment(7)).await.unwrap();

    wait_for_entries(&h, started.session_id, "720p", 2).await;

    let registry = h.state.registry.clone();
    let session_id = started.session_id;
    assert!(
        eventually(|| {
            let registry = registry.clone();
            async move { registry.is_degraded(session_id, &Variant::new("480p")) }
        })
        .await
    );

    let session = h.state.registry.session_status(started.session_id).unwrap();
    assert_eq!(session.state, SessionState::Live);
    assert!(session.degraded_variants.contains("480p"));
    assert!(!session.degraded_variants.contains("720p"));

    let degraded = h
        .state
        .publisher
        .manifest(started.session_id, &Variant::new("480p"))
        .unwrap();
    assert!(degraded.entries.is_empty());
}

#[tokio::test]
async fn test_resubmitting_a_job_is_idempotent() {
    let h = Harness::new();
    let started = h.state.registry.start_stream(h.channel_id).await.unwrap();
    let input = InputSegment {
        session_id: started.session_id,
        index: 0,
        data: segment(8),
        duration: Duration::from_secs(2),
    };
    let target = JobTarget::Rendition(Variant::new("720p"));

    let dispatcher = Arc::clone(&h.state.dispatcher);
    let first = dispatcher
        .submit(started.session_id, input.clone(), target.clone())
        .unwrap();
    let result = dispatcher.await_result(first).await.unwrap();

    let second = dispatcher
        .submit(started.session_id, input, target)
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(dispatcher.await_result(second).await.unwrap(), result);
    assert_eq!(h.executor.calls(), 1);

    let manifest = h
        .state
        .publisher
        .manifest(started.session_id, &Variant::new("720p"))
        .unwrap();
    assert_eq!(manifest.entries.len(), 1);
}
