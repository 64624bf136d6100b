//! Publish-path integration tests over real TCP connections.
mod common;

use anyhow::Result;
use bytes::{Bytes, BytesMut};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::{sleep, timeout};
use viaduct_wire::{
    Code, Confirmation, ErrorInfo, FLAG_CONFIRMATION, FLAG_ERROR, Message, StartPublishRequest,
};

fn start_frame(topic: &str) -> viaduct_wire::Frame {
    StartPublishRequest {
        topic: topic.to_string(),
    }
    .encode()
    .expect("encode start")
}

fn message_frame(id: &str) -> viaduct_wire::Frame {
    Message::new(id, Bytes::from_static(b"payload"))
        .encode()
        .expect("encode message")
}

#[tokio::test]
async fn publish_stores_and_confirms_in_send_order() -> Result<()> {
    let gateway = common::start_gateway().await?;

    let mut stream = common::connect(&gateway).await?;
    let mut scratch = BytesMut::new();
    common::write_frame(&mut stream, &start_frame("t")).await?;
    for id in ["m1", "m2", "m3"] {
        common::write_frame(&mut stream, &message_frame(id)).await?;
    }

    for expected in ["m1", "m2", "m3"] {
        let frame = timeout(
            Duration::from_secs(2),
            common::read_frame(&mut stream, &mut scratch),
        )
        .await??
        .expect("confirmation");
        assert_eq!(frame.header.flags, FLAG_CONFIRMATION);
        let confirm = Confirmation::decode(frame.payload)?;
        assert_eq!(confirm.msg_id, expected);
    }

    // Half-close the write direction: the session drains and ends cleanly.
    stream.shutdown().await?;
    let end = timeout(
        Duration::from_secs(2),
        common::read_frame(&mut stream, &mut scratch),
    )
    .await??;
    assert!(end.is_none());

    let stored: Vec<String> = gateway
        .backend
        .topic("t")
        .await
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(stored, vec!["m1", "m2", "m3"]);
    Ok(())
}

#[tokio::test]
async fn disconnect_without_reading_confirmations_keeps_messages() -> Result<()> {
    let gateway = common::start_gateway().await?;

    let mut stream = common::connect(&gateway).await?;
    common::write_frame(&mut stream, &start_frame("t")).await?;
    common::write_frame(&mut stream, &message_frame("m1")).await?;
    common::write_frame(&mut stream, &message_frame("m2")).await?;
    // Half-close first so the in-flight messages outrun the reset, then
    // vanish without ever reading a confirmation.
    stream.shutdown().await?;
    drop(stream);

    // The session resolves on its own; the store keeps both messages.
    timeout(Duration::from_secs(2), async {
        loop {
            if gateway.backend.topic("t").await.len() == 2 {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    Ok(())
}

#[tokio::test]
async fn message_before_start_returns_an_error_frame() -> Result<()> {
    let gateway = common::start_gateway().await?;

    let mut stream = common::connect(&gateway).await?;
    let mut scratch = BytesMut::new();
    common::write_frame(&mut stream, &message_frame("m1")).await?;

    let frame = timeout(
        Duration::from_secs(2),
        common::read_frame(&mut stream, &mut scratch),
    )
    .await??
    .expect("error frame");
    assert_eq!(frame.header.flags, FLAG_ERROR);
    let info = ErrorInfo::decode(frame.payload)?;
    assert_eq!(info.code, Code::InvalidArgument);
    assert_eq!(info.message, "not connected to a topic");
    Ok(())
}

#[tokio::test]
async fn second_start_returns_an_error_frame() -> Result<()> {
    let gateway = common::start_gateway().await?;

    let mut stream = common::connect(&gateway).await?;
    let mut scratch = BytesMut::new();
    common::write_frame(&mut stream, &start_frame("t")).await?;
    common::write_frame(&mut stream, &start_frame("t")).await?;

    let frame = timeout(
        Duration::from_secs(2),
        common::read_frame(&mut stream, &mut scratch),
    )
    .await??
    .expect("error frame");
    assert_eq!(frame.header.flags, FLAG_ERROR);
    let info = ErrorInfo::decode(frame.payload)?;
    assert_eq!(info.code, Code::InvalidArgument);
    assert_eq!(info.message, "stream already started");
    Ok(())
}

#[tokio::test]
async fn publish_session_survives_empty_payloads() -> Result<()> {
    let gateway = common::start_gateway().await?;

    let mut stream = common::connect(&gateway).await?;
    let mut scratch = BytesMut::new();
    common::write_frame(&mut stream, &start_frame("t")).await?;
    let empty = Message::new("m1", Bytes::new()).encode()?;
    common::write_frame(&mut stream, &empty).await?;

    let frame = timeout(
        Duration::from_secs(2),
        common::read_frame(&mut stream, &mut scratch),
    )
    .await??
    .expect("confirmation");
    let confirm = Confirmation::decode(frame.payload)?;
    assert_eq!(confirm.msg_id, "m1");

    stream.shutdown().await?;
    let end = timeout(
        Duration::from_secs(2),
        common::read_frame(&mut stream, &mut scratch),
    )
    .await??;
    assert!(end.is_none());
    assert_eq!(gateway.backend.topic("t").await.len(), 1);
    Ok(())
}
