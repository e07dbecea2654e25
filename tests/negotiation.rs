//! Connection negotiation against a live listener: ALPN enforcement and
//! authentication classification.

mod common;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use rustls::ServerConfig;
use tokio::runtime::Handle;

use common::{
    closed_by_server, connect, next_context, stays_open, RecordingFactory, RefusingFactory,
    TestPki,
};
use mock_push_gateway::{AuthContext, HandlerFactory, MockPushServer, MAX_CONCURRENT_STREAMS};

async fn start_server(
    config: ServerConfig,
    factory: Arc<dyn HandlerFactory>,
) -> (MockPushServer, SocketAddr) {
    let mut server = MockPushServer::builder(config)
        .worker_pool(Handle::current())
        .handler_factory(factory)
        .bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .build()
        .unwrap();
    let addr = server.start(0).unwrap().await.unwrap();
    (server, addr)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_token_authentication_without_client_certificate() {
    let pki = TestPki::new();
    let (factory, mut contexts) = RecordingFactory::new();
    let (mut server, addr) = start_server(pki.server_config(true), factory).await;

    let _client = connect(addr, pki.client_config(&[b"h2"], None))
        .await
        .unwrap();

    let context = next_context(&mut contexts).await;
    assert_eq!(context.auth, AuthContext::Token);
    assert!(context.auth.uses_token_authentication());
    assert_eq!(context.max_concurrent_streams, MAX_CONCURRENT_STREAMS);
    assert_eq!(context.max_concurrent_streams, 8);
    assert!(Arc::ptr_eq(&context.state, server.state()));

    server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_certificate_authentication_with_uid() {
    let pki = TestPki::new();
    let (factory, mut contexts) = RecordingFactory::new();
    let (mut server, addr) = start_server(pki.server_config(true), factory).await;

    let identity = pki.client_identity(Some("com.example.app"));
    let _client = connect(addr, pki.client_config(&[b"h2"], Some(identity)))
        .await
        .unwrap();

    let context = next_context(&mut contexts).await;
    assert_eq!(
        context.auth,
        AuthContext::Certificate {
            base_topic: Some("com.example.app".to_string())
        }
    );
    assert_eq!(context.auth.base_topic(), Some("com.example.app"));
    assert_eq!(context.max_concurrent_streams, 8);

    server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_certificate_authentication_without_uid() {
    let pki = TestPki::new();
    let (factory, mut contexts) = RecordingFactory::new();
    let (mut server, addr) = start_server(pki.server_config(true), factory).await;

    let identity = pki.client_identity(None);
    let _client = connect(addr, pki.client_config(&[b"h2"], Some(identity)))
        .await
        .unwrap();

    let context = next_context(&mut contexts).await;
    assert_eq!(context.auth, AuthContext::Certificate { base_topic: None });
    assert!(!context.auth.uses_token_authentication());

    server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_client_without_push_protocol_is_refused() {
    let pki = TestPki::new();
    let (factory, mut contexts) = RecordingFactory::new();
    let (mut server, addr) = start_server(pki.server_config(false), factory).await;

    let result = connect(addr, pki.client_config(&[b"http/1.1"], None)).await;
    assert!(result.is_err());

    // listener keeps serving other clients
    let _client = connect(addr, pki.client_config(&[b"h2"], None))
        .await
        .unwrap();
    assert_eq!(next_context(&mut contexts).await.auth, AuthContext::Token);

    server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_wrong_protocol_closes_only_that_connection() {
    let pki = TestPki::new();
    let mut config = pki.server_config(false);
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    let (factory, mut contexts) = RecordingFactory::new();
    let (mut server, addr) = start_server(config, factory).await;

    let mut good = connect(addr, pki.client_config(&[b"h2"], None))
        .await
        .unwrap();
    assert_eq!(next_context(&mut contexts).await.auth, AuthContext::Token);

    // TLS succeeds, then the connection is dropped before any handler exists
    let mut wrong = connect(addr, pki.client_config(&[b"http/1.1"], None))
        .await
        .unwrap();
    assert!(closed_by_server(&mut wrong).await);

    let mut no_alpn = connect(addr, pki.client_config(&[], None)).await.unwrap();
    assert!(closed_by_server(&mut no_alpn).await);

    assert!(contexts.try_recv().is_err());
    assert!(stays_open(&mut good, Duration::from_millis(200)).await);

    let _later = connect(addr, pki.client_config(&[b"h2"], None))
        .await
        .unwrap();
    assert_eq!(next_context(&mut contexts).await.auth, AuthContext::Token);

    server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_handler_refusal_closes_connection() {
    let pki = TestPki::new();
    let (mut server, addr) = start_server(pki.server_config(false), Arc::new(RefusingFactory)).await;

    let mut client = connect(addr, pki.client_config(&[b"h2"], None))
        .await
        .unwrap();
    assert!(closed_by_server(&mut client).await);

    server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_handler_sees_registered_state() {
    let pki = TestPki::new();
    let (factory, mut contexts) = RecordingFactory::new();
    let (mut server, addr) = start_server(pki.server_config(false), factory).await;

    server
        .state()
        .devices()
        .register("com.example.app", "device-1", None);
    server.state().set_emulate_internal_errors(true);

    let _client = connect(addr, pki.client_config(&[b"h2"], None))
        .await
        .unwrap();
    let context = next_context(&mut contexts).await;

    assert!(context
        .state
        .devices()
        .is_registered("device-1", "com.example.app"));
    assert!(context.state.emulate_internal_errors());

    server.shutdown().await.unwrap();
}
