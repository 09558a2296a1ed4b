mod support;

use std::sync::Arc;
use std::time::Duration;

use retrocast_core::rtsp::parse_request;
use retrocast_core::{PublisherId, SessionRegistry, StreamError, StreamRequest};

use support::{context, description, failing_resolver, resolver, FakeLauncher};

fn request(path: &str, query: &str) -> StreamRequest {
    parse_request(path, query, None).unwrap()
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_describes_launch_one_encoder() {
    let launcher = FakeLauncher::new();
    let registry = SessionRegistry::new(context(launcher.clone(), resolver()));
    launcher.auto_publish(&registry);

    let mut waiters = Vec::new();
    for index in 0..16 {
        let registry = Arc::clone(&registry);
        let query = if index % 2 == 0 {
            "transport=tcp"
        } else {
            "transport=TCP&"
        };
        let stream = request("/retro/abc123.3gp", query);
        waiters.push(tokio::spawn(async move {
            let session = registry.get_or_create(&stream);
            session.ensure_started();
            session.wait_ready(Duration::from_secs(2)).await
        }));
    }
    for waiter in waiters {
        let ready = waiter.await.unwrap().unwrap();
        assert_eq!(ready.track_count(), 2);
    }

    assert_eq!(launcher.launch_count(), 1);
    assert_eq!(registry.len(), 1);
    let launch = &launcher.launches()[0];
    assert!(launch
        .args
        .last()
        .unwrap()
        .ends_with("/retro/abc123?transport=tcp"));
}

#[tokio::test]
async fn seek_relaunches_only_outside_tolerance() {
    let launcher = FakeLauncher::new();
    let registry = SessionRegistry::new(context(launcher.clone(), resolver()));
    launcher.auto_publish(&registry);

    let session = registry.get_or_create(&request("/retro/abc123.3gp", ""));
    session.ensure_started();
    session.wait_ready(Duration::from_secs(2)).await.unwrap();
    assert_eq!(launcher.launch_count(), 1);

    session.seek(30.0).await.unwrap();
    assert_eq!(launcher.launch_count(), 2);
    assert_eq!(launcher.cancelled_count(), 1);
    assert_eq!(session.offset(), 30.0);
    let relaunch = &launcher.launches()[1];
    let seek = relaunch.args.iter().position(|arg| arg == "-ss").unwrap();
    assert_eq!(relaunch.args[seek + 1], "30.000");

    session.seek(30.2).await.unwrap();
    assert_eq!(launcher.launch_count(), 2);
    assert_eq!(launcher.cancelled_count(), 1);
    assert!(session.is_ready());
}

#[tokio::test]
async fn seek_retires_the_previous_publisher() {
    let launcher = FakeLauncher::new();
    let registry = SessionRegistry::new(context(launcher.clone(), resolver()));
    launcher.auto_publish(&registry);

    let session = registry.get_or_create(&request("/edge/clip42", ""));
    session.ensure_started();
    session.wait_ready(Duration::from_secs(2)).await.unwrap();
    let first = session.publisher().unwrap();
    let feed = session.publisher_feed(first).unwrap();

    session.seek(120.0).await.unwrap();
    assert!(feed.attempt.is_cancelled());
    assert!(session.publisher_feed(first).is_none());
    assert_ne!(session.publisher(), Some(first));
    assert!(registry.session_by_publisher(first).is_none());
    // The old publisher hanging up must not close the relaunched session.
    assert!(!registry.close_publisher(first));
    assert!(!session.is_closed());
}

#[tokio::test]
async fn remove_releases_blocked_waiters() {
    let launcher = FakeLauncher::new();
    let registry = SessionRegistry::new(context(launcher.clone(), resolver()));

    let session = registry.get_or_create(&request("/retro/slow", ""));
    session.ensure_started();
    let waiter = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.wait_ready(Duration::from_secs(30)).await })
    };
    assert!(eventually(|| launcher.launch_count() == 1).await);

    registry.remove(&session);
    let outcome = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter should be released promptly")
        .unwrap();
    assert_eq!(outcome, Err(StreamError::Closed));
    assert!(registry.is_empty());
    assert_eq!(launcher.cancelled_count(), 1);

    let fresh = registry.get_or_create(&request("/retro/slow", ""));
    assert!(!Arc::ptr_eq(&fresh, &session));
}

#[tokio::test]
async fn resolve_failure_reaches_waiters_without_launching() {
    let launcher = FakeLauncher::new();
    let registry = SessionRegistry::new(context(launcher.clone(), failing_resolver()));

    let session = registry.get_or_create(&request("/retro/gone", ""));
    session.ensure_started();
    let outcome = session.wait_ready(Duration::from_secs(2)).await;
    assert!(matches!(outcome, Err(StreamError::ResolveFailed(_))));
    assert_eq!(launcher.launch_count(), 0);
    assert!(eventually(|| registry.is_empty()).await);

    // Late waiters see the same failure.
    let again = session.wait_ready(Duration::from_millis(50)).await;
    assert!(matches!(again, Err(StreamError::ResolveFailed(_))));
}

#[tokio::test]
async fn second_publisher_is_refused() {
    let launcher = FakeLauncher::new();
    let registry = SessionRegistry::new(context(launcher.clone(), resolver()));
    let session = registry.get_or_create(&request("/retro/abc", ""));

    let first = PublisherId::new();
    session.attach_publisher(first, description()).unwrap();
    assert_eq!(
        session.attach_publisher(PublisherId::new(), description()),
        Err(StreamError::PublisherConflict)
    );
    // Re-announcing by the same publisher updates in place.
    session.attach_publisher(first, description()).unwrap();
    assert_eq!(session.publisher(), Some(first));
}

#[tokio::test]
async fn publisher_cannot_bind_to_a_removed_session() {
    let launcher = FakeLauncher::new();
    let registry = SessionRegistry::new(context(launcher.clone(), resolver()));
    let session = registry.get_or_create(&request("/retro/abc", ""));
    registry.remove(&session);

    let publisher = PublisherId::new();
    assert_eq!(
        registry.attach_publisher(publisher, &session, description()),
        Err(StreamError::Closed)
    );
    assert!(registry.session_by_publisher(publisher).is_none());
    assert_eq!(session.publisher(), None);
}

#[tokio::test]
async fn attached_publisher_is_indexed() {
    let launcher = FakeLauncher::new();
    let registry = SessionRegistry::new(context(launcher.clone(), resolver()));
    let session = registry.get_or_create(&request("/retro/abc", ""));

    let publisher = PublisherId::new();
    registry
        .attach_publisher(publisher, &session, description())
        .unwrap();
    let bound = registry.session_by_publisher(publisher).unwrap();
    assert!(Arc::ptr_eq(&bound, &session));

    registry.remove(&session);
    assert!(registry.session_by_publisher(publisher).is_none());
}

#[tokio::test]
async fn publisher_close_tears_down_session() {
    let launcher = FakeLauncher::new();
    let registry = SessionRegistry::new(context(launcher.clone(), resolver()));
    launcher.auto_publish(&registry);

    let session = registry.get_or_create(&request("/android/abc", "start=10"));
    session.ensure_started();
    session.wait_ready(Duration::from_secs(2)).await.unwrap();
    let publisher = session.publisher().unwrap();
    let hub = session.hub().unwrap();

    let snapshot = registry.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].key, "/android/abc?start=10");
    assert_eq!(snapshot[0].offset, 10.0);
    assert!(snapshot[0].ready);

    assert!(registry.close_publisher(publisher));
    assert!(session.is_closed());
    assert!(hub.is_closed());
    assert!(registry.is_empty());
    assert_eq!(launcher.cancelled_count(), 1);
    assert_eq!(
        session.wait_ready(Duration::from_millis(50)).await,
        Err(StreamError::Closed)
    );
}
