mod common;

use std::time::Duration;

use common::{start_pair, EchoService, MetaService, SlowService, TickerService};
use muxbus_core::codec::Utf8Codec;
use muxbus_core::metadata::Metadata;
use muxbus_core::CallOptions;

#[tokio::test]
async fn concurrent_calls_interleave_on_one_transport() {
    let (caller, _responder) = start_pair(|r| {
        r.add_service(&EchoService);
        r.add_service(&SlowService);
    });

    // Park a slow call on the transport, then run a fast one past it.
    let slow = caller
        .unary("Slow", "Sleep", Utf8Codec, Utf8Codec, CallOptions::new())
        .await
        .unwrap();
    let slow_handle = tokio::spawn(async move { slow.call("held".to_string()).await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let fast = caller
        .unary(
            "Echo",
            "SayHello",
            Utf8Codec,
            Utf8Codec,
            CallOptions::new().with_deadline(Duration::from_secs(1)),
        )
        .await
        .unwrap();
    assert_eq!(fast.call("quick".to_string()).await.unwrap(), "quick");

    // The slow call is still pending, untouched by the fast one.
    assert!(!slow_handle.is_finished());
    slow_handle.abort();
}

#[tokio::test]
async fn many_concurrent_calls_do_not_cross_talk() {
    let (caller, _responder) = start_pair(|r| r.add_service(&EchoService));

    let mut handles = Vec::new();
    for i in 0..10 {
        let call = caller
            .unary("Echo", "SayHello", Utf8Codec, Utf8Codec, CallOptions::new())
            .await
            .unwrap();
        handles.push(tokio::spawn(async move {
            (i, call.call(format!("payload-{i}")).await)
        }));
    }

    for handle in handles {
        let (i, result) = handle.await.unwrap();
        assert_eq!(result.unwrap(), format!("payload-{i}"));
    }
}

#[tokio::test]
async fn streamed_responses_arrive_in_send_order() {
    let ticker = TickerService::new();
    let (caller, _responder) = start_pair(|r| r.add_service(&ticker));

    let call = caller
        .server_stream("Ticker", "Count", Utf8Codec, Utf8Codec, CallOptions::new())
        .await
        .unwrap();
    let mut responses = call.call("20".to_string()).await.unwrap();

    let mut items = Vec::new();
    while let Some(item) = responses.message().await.unwrap() {
        items.push(item);
    }
    let expected: Vec<String> = (1..=20).map(|i| i.to_string()).collect();
    assert_eq!(items, expected);
}

#[tokio::test]
async fn request_metadata_reaches_the_handler() {
    let (caller, _responder) = start_pair(|r| r.add_service(&MetaService));

    let mut metadata = Metadata::new();
    metadata.append("x-request-id", "req-42");

    let call = caller
        .unary(
            "Meta",
            "Header",
            Utf8Codec,
            Utf8Codec,
            CallOptions::new().with_metadata(metadata),
        )
        .await
        .unwrap();
    let value = call.call("x-request-id".to_string()).await.unwrap();
    assert_eq!(value, "req-42");
}

#[tokio::test]
async fn missing_request_metadata_is_visible_to_the_handler() {
    let (caller, _responder) = start_pair(|r| r.add_service(&MetaService));

    let call = caller
        .unary("Meta", "Header", Utf8Codec, Utf8Codec, CallOptions::new())
        .await
        .unwrap();
    let value = call.call("x-absent".to_string()).await.unwrap();
    assert_eq!(value, "<missing>");
}
