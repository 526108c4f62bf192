//! Event-stream adapter against a mocked backend

use askflow_ai::{
    Adapter, CanonicalEvent, ErrorKind, HttpConfig, ProviderKind, SseAdapter, SseDialect,
    TextMode, build_http_client,
};
use futures::StreamExt;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn disable_system_proxy_for_tests() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        // Safety: set once for the process before any HTTP clients are built.
        unsafe {
            std::env::set_var("ASKFLOW_DISABLE_SYSTEM_PROXY", "1");
        }
    });
}

async fn backend(response: ResponseTemplate) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/stream"))
        .respond_with(response)
        .mount(&server)
        .await;
    server
}

async fn collect(server: &MockServer, dialect: SseDialect) -> Vec<CanonicalEvent> {
    disable_system_proxy_for_tests();
    let client = build_http_client(&HttpConfig::default()).unwrap();
    let adapter = Adapter::Sse(SseAdapter::new(
        client,
        ProviderKind::OpenAi,
        format!("{}/stream", server.uri()),
        "sk-test",
        "test-model",
        dialect,
    ));
    adapter
        .open("question", CancellationToken::new())
        .collect()
        .await
}

fn answer_texts(events: &[CanonicalEvent]) -> Vec<&str> {
    events
        .iter()
        .filter_map(|event| match event {
            CanonicalEvent::Answer { text, .. } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn challenge_page_is_classified() {
    let server = backend(
        ResponseTemplate::new(403)
            .insert_header("cf-mitigated", "challenge")
            .set_body_raw("<html>Just a moment...</html>", "text/html"),
    )
    .await;

    let events = collect(&server, SseDialect::ChatCompletions).await;
    assert!(matches!(
        &events[..],
        [CanonicalEvent::Error { kind: ErrorKind::CloudflareChallenge, .. }]
    ));
}

#[tokio::test]
async fn challenge_markup_on_success_status_is_classified() {
    let server = backend(ResponseTemplate::new(200).set_body_raw(
        "<html><head><title>Just a moment...</title></head><body>cf_chl_opt</body></html>",
        "text/html; charset=UTF-8",
    ))
    .await;

    let events = collect(&server, SseDialect::ChatCompletions).await;
    assert!(matches!(
        &events[..],
        [CanonicalEvent::Error { kind: ErrorKind::CloudflareChallenge, .. }]
    ));
}

#[tokio::test]
async fn plain_html_on_success_status_is_a_protocol_error() {
    let server = backend(ResponseTemplate::new(200).set_body_raw(
        "<html><body>Maintenance</body></html>",
        "text/html",
    ))
    .await;

    let events = collect(&server, SseDialect::ChatCompletions).await;
    assert!(matches!(
        &events[..],
        [CanonicalEvent::Error { kind: ErrorKind::ProviderProtocolError, .. }]
    ));
}

#[tokio::test]
async fn finish_reason_without_sentinel_still_completes() {
    let server = backend(ResponseTemplate::new(200).set_body_raw(
        concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"},\"finish_reason\":null}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"},\"finish_reason\":\"stop\"}]}",
        ),
        "text/event-stream",
    ))
    .await;

    let events = collect(&server, SseDialect::ChatCompletions).await;
    assert_eq!(answer_texts(&events), ["Hel", "Hello"]);
    assert_eq!(events.last(), Some(&CanonicalEvent::Done));
}

#[tokio::test]
async fn truncated_stream_is_a_network_error() {
    let server = backend(ResponseTemplate::new(200).set_body_raw(
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
        "text/event-stream",
    ))
    .await;

    let events = collect(&server, SseDialect::ChatCompletions).await;
    assert_eq!(answer_texts(&events), ["Hel"]);
    assert!(matches!(
        events.last(),
        Some(CanonicalEvent::Error { kind: ErrorKind::NetworkError, .. })
    ));
}

#[tokio::test]
async fn conversation_dialect_passes_cumulative_text_through() {
    let server = backend(ResponseTemplate::new(200).set_body_raw(
        concat!(
            "data: {\"message\":{\"id\":\"m1\",\"author\":{\"role\":\"assistant\"},\"content\":{\"parts\":[\"Hello\"]}},\"conversation_id\":\"c1\"}\n\n",
            "data: {\"message\":{\"id\":\"m1\",\"author\":{\"role\":\"assistant\"},\"content\":{\"parts\":[\"Hello world\"]}},\"conversation_id\":\"c1\"}\n\n",
            "data: [DONE]\n\n",
        ),
        "text/event-stream",
    ))
    .await;

    assert_eq!(SseDialect::ConversationWeb.default_text_mode(), TextMode::Cumulative);
    let events = collect(&server, SseDialect::ConversationWeb).await;
    assert_eq!(
        events,
        vec![
            CanonicalEvent::Answer {
                text: "Hello".into(),
                message_id: "m1".into(),
                conversation_id: "c1".into(),
            },
            CanonicalEvent::Answer {
                text: "Hello world".into(),
                message_id: "m1".into(),
                conversation_id: "c1".into(),
            },
            CanonicalEvent::Done,
        ]
    );
}

/// Answers 502 with a declared body it never sends. The receiver fires once
/// the status line and headers are on the wire.
async fn stalled_error_body() -> (String, oneshot::Receiver<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (headers_tx, headers_rx) = oneshot::channel();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4096];
        let _ = socket.read(&mut buf).await;
        socket
            .write_all(b"HTTP/1.1 502 Bad Gateway\r\ncontent-type: text/plain\r\ncontent-length: 4096\r\n\r\nupstream")
            .await
            .unwrap();
        let _ = headers_tx.send(());
        while matches!(socket.read(&mut buf).await, Ok(n) if n > 0) {}
    });
    (format!("http://{addr}/stream"), headers_rx)
}

#[tokio::test]
async fn cancel_interrupts_slow_error_body() {
    disable_system_proxy_for_tests();
    let (url, headers_sent) = stalled_error_body().await;
    let client = build_http_client(&HttpConfig::default()).unwrap();
    let adapter = Adapter::Sse(SseAdapter::new(
        client,
        ProviderKind::OpenAi,
        url,
        "sk-test",
        "test-model",
        SseDialect::ChatCompletions,
    ));

    let cancel = CancellationToken::new();
    let mut raw = adapter.open_raw("question", cancel.clone());
    let reader = tokio::spawn(async move { raw.next().await.is_none() });

    headers_sent.await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let ended_quietly = tokio::time::timeout(Duration::from_millis(500), reader)
        .await
        .expect("error body read ignored cancellation")
        .unwrap();
    assert!(ended_quietly);
}
