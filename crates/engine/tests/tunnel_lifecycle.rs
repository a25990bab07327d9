// Manager lifecycle: registration, start/stop, bind errors, cleanup

mod support;

use std::sync::Arc;

use tokio::net::TcpListener;

use sshfwd_common::TunnelState;
use sshfwd_engine::TunnelError;

use support::{echo_server, manager_with, tunnel_config, wait_until, DialMode, MockConnector, Recorder};

#[tokio::test]
async fn test_create_twice_starts_one_listener() {
    let connector = MockConnector::new(DialMode::Connect(echo_server().await));
    let manager = manager_with(connector);
    let recorder = Recorder::attach(&manager);

    let first = manager.create_tunnel("web", tunnel_config("web")).await;
    let second = manager.create_tunnel("web", tunnel_config("web")).await;
    assert!(Arc::ptr_eq(&first, &second));

    manager.start_tunnel(&first).await.unwrap();
    let err = manager.start_tunnel(&second).await.unwrap_err();
    assert!(matches!(err, TunnelError::AlreadyRunning(_)));

    recorder.wait_for("web", TunnelState::Connecting, 1).await;
    manager.stop_tunnel("web").await.unwrap();
    recorder.wait_for("web", TunnelState::Stopped, 1).await;

    // One accept loop means exactly one "waiting for traffic"
    let waiting = recorder
        .statuses
        .lock()
        .iter()
        .filter(|s| s.message == "waiting for traffic")
        .count();
    assert_eq!(waiting, 1);
}

#[tokio::test]
async fn test_bind_failure_leaves_tunnel_stopped() {
    let connector = MockConnector::new(DialMode::Connect(echo_server().await));
    let manager = manager_with(connector.clone());
    let recorder = Recorder::attach(&manager);

    let blocker = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut config = tunnel_config("web");
    config.local_port = blocker.local_addr().unwrap().port();

    let tunnel = manager.create_tunnel("web", config).await;
    let err = manager.start_tunnel(&tunnel).await.unwrap_err();
    assert!(matches!(err, TunnelError::Bind { .. }), "{err}");
    assert!(!tunnel.is_running());
    assert!(!tunnel.is_retired());
    assert_eq!(connector.connect_count(), 0);
    wait_until(|| recorder.has_log("[web] ERROR Failed to listen on 127.0.0.1:")).await;
    assert!(recorder.states("web").is_empty());

    // Once the port frees up the same tunnel starts normally
    drop(blocker);
    manager.start_tunnel(&tunnel).await.unwrap();
    assert!(tunnel.is_running());

    manager.cleanup().await;
}

#[tokio::test]
async fn test_stopped_tunnel_is_replaced_by_a_new_one() {
    let connector = MockConnector::new(DialMode::Connect(echo_server().await));
    let manager = manager_with(connector);
    let _recorder = Recorder::attach(&manager);

    let old = manager.create_tunnel("web", tunnel_config("web")).await;
    manager.start_tunnel(&old).await.unwrap();
    manager.stop_tunnel("web").await.unwrap();

    let err = manager.start_tunnel(&old).await.unwrap_err();
    assert!(matches!(err, TunnelError::Retired(_)));

    let fresh = manager.create_tunnel("web", tunnel_config("web")).await;
    assert!(!Arc::ptr_eq(&old, &fresh));
    manager.start_tunnel(&fresh).await.unwrap();
    assert!(fresh.is_running());

    manager.cleanup().await;
}

#[tokio::test]
async fn test_concurrent_stops_are_serialized() {
    let connector = MockConnector::new(DialMode::Connect(echo_server().await));
    let manager = manager_with(connector);
    let recorder = Recorder::attach(&manager);

    let tunnel = manager.create_tunnel("web", tunnel_config("web")).await;
    manager.start_tunnel(&tunnel).await.unwrap();

    let (a, b) = tokio::join!(manager.stop_tunnel("web"), manager.stop_tunnel("web"));
    assert!(a.is_ok() && b.is_ok());

    wait_until(|| recorder.count("web", TunnelState::Stopped) == 1).await;
    assert!(manager.tunnel_ids().await.is_empty());
}

#[tokio::test]
async fn test_cleanup_stops_everything_and_ends_streams() {
    let connector = MockConnector::new(DialMode::Connect(echo_server().await));
    let manager = manager_with(connector);
    let recorder = Recorder::attach(&manager);

    let mut tunnels = Vec::new();
    for name in ["a", "b", "c"] {
        let tunnel = manager.create_tunnel(name, tunnel_config(name)).await;
        manager.start_tunnel(&tunnel).await.unwrap();
        tunnels.push(tunnel);
    }

    manager.cleanup().await;

    for tunnel in &tunnels {
        assert!(!tunnel.is_running());
    }
    assert!(manager.tunnel_ids().await.is_empty());
    assert_eq!(manager.get_metrics_snapshot("a").await, "--");

    let statuses = recorder.statuses.clone();
    recorder.finished().await;
    for name in ["a", "b", "c"] {
        let last = statuses
            .lock()
            .iter()
            .filter(|s| s.id == name)
            .last()
            .map(|s| s.state);
        assert_eq!(last, Some(TunnelState::Stopped));
    }
}
