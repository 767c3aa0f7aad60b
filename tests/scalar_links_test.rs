//! Transducer and depth gauge links against mock line servers.

mod common;

use common::{MockLineServer, Scripted};
use rust_ieb::error_recovery::RetryPolicy;
use rust_ieb::hardware::{DepthLink, TransducerLink, DEFAULT_TRANSDUCER_ID};
use rust_ieb::{DeviceGroup, IebError};
use std::time::Duration;

fn transducer(server: &MockLineServer) -> TransducerLink {
    TransducerLink::new(
        "sp1.r1",
        server.endpoint(),
        DEFAULT_TRANSDUCER_ID,
        Duration::from_millis(500),
        Duration::from_millis(150),
    )
}

fn depth(server: &MockLineServer) -> DepthLink {
    DepthLink::new(
        "sp1.depth",
        server.endpoint(),
        vec!["A".into(), "B".into(), "C".into()],
        Duration::from_millis(500),
        Duration::from_millis(150),
    )
}

#[tokio::test]
async fn test_pressure_and_temperature() {
    let server = MockLineServer::start(b'\\', |_, request| match request {
        "@253P?\\" => Scripted::Reply(b"@253ACK1.50E-06\\".to_vec()),
        "@253T?\\" => Scripted::Reply(b"@253ACK-120.25\\".to_vec()),
        _ => Scripted::Reply(b"@253NAK160\\".to_vec()),
    })
    .await;
    let link = transducer(&server);

    let pressure = link.read_pressure().await.unwrap();
    let temperature = link.read_temperature().await.unwrap();

    assert!((pressure - 1.5e-6).abs() < 1e-12);
    assert_eq!(temperature, -120.25);
    assert_eq!(server.requests(), vec!["@253P?\\", "@253T?\\"]);
}

#[tokio::test]
async fn test_silent_transducer_times_out_without_value() {
    let server = MockLineServer::start(b'\\', |_, _| Scripted::Silent).await;
    let link = transducer(&server);

    let err = link.read_pressure().await.unwrap_err();

    assert!(err.is_timeout(), "{err}");
}

#[tokio::test]
async fn test_nak_is_parse_error() {
    let server =
        MockLineServer::start(b'\\', |_, _| Scripted::Reply(b"@253NAK160\\".to_vec())).await;
    let link = transducer(&server);

    let err = link.read_temperature().await.unwrap_err();

    assert!(matches!(err, IebError::Parse { .. }));
}

#[tokio::test]
async fn test_group_retries_transient_transducer_failure() {
    let server = MockLineServer::start(b'\\', |index, _| {
        if index == 0 {
            Scripted::Hangup
        } else {
            Scripted::Reply(b"@253ACK9.9E-07\\".to_vec())
        }
    })
    .await;
    let policy = RetryPolicy {
        max_attempts: 3,
        backoff_delay: Duration::from_millis(1),
    };
    let group = DeviceGroup::new("sp1", policy).with_transducer("r1", transducer(&server));

    let pressure = group.read_pressure("r1").await.unwrap();

    assert!((pressure - 9.9e-7).abs() < 1e-13);
    assert_eq!(server.requests().len(), 2);
}

#[tokio::test]
async fn test_group_gives_up_after_max_attempts() {
    let server = MockLineServer::start(b'\\', |_, _| Scripted::Silent).await;
    let policy = RetryPolicy {
        max_attempts: 2,
        backoff_delay: Duration::from_millis(1),
    };
    let group = DeviceGroup::new("sp1", policy).with_transducer("r1", transducer(&server));

    let err = group.read_pressure("r1").await.unwrap_err();

    assert!(err.is_timeout());
    assert_eq!(server.requests().len(), 2);
    assert!(matches!(
        group.read_pressure("b1").await,
        Err(IebError::UnknownDevice(_))
    ));
}

#[tokio::test]
async fn test_depth_reads_every_channel() {
    let server = MockLineServer::start(b'\n', |_, request| {
        let channel = request.trim_start_matches("SEND ").trim_end();
        let reply = match channel {
            "A" => "A +1.250 mm\n".to_string(),
            "B" => "\rB -0.500 mm\r\n".to_string(),
            other => format!("{other} 0.000 mm\n"),
        };
        Scripted::Reply(reply.into_bytes())
    })
    .await;
    let link = depth(&server);
    link.set_camera("b1");

    let values = link.read_all().await.unwrap();

    assert_eq!(values["A"], 1.25);
    assert_eq!(values["B"], -0.5);
    assert_eq!(values["C"], 0.0);
    assert_eq!(server.requests(), vec!["SEND A\n", "SEND B\n", "SEND C\n"]);
    assert_eq!(link.camera().as_deref(), Some("b1"));
}

#[tokio::test]
async fn test_depth_unknown_channel_is_not_queried() {
    let server = MockLineServer::start(b'\n', |_, _| Scripted::Reply(b"D 1.0 mm\n".to_vec())).await;
    let link = depth(&server);

    let err = link.read_channel("D").await.unwrap_err();

    assert!(matches!(err, IebError::UnknownDevice(_)));
    assert!(server.requests().is_empty());
}

#[tokio::test]
async fn test_depth_report_through_group() {
    let server = MockLineServer::start(b'\n', |_, request| {
        let channel = request.trim_start_matches("SEND ").trim_end().to_string();
        Scripted::Reply(format!("{channel} 2.000 mm\n").into_bytes())
    })
    .await;
    let link = depth(&server);
    link.set_camera("r1");
    let group = DeviceGroup::new("sp1", RetryPolicy::no_retry()).with_depth(link);

    let report = group.read_depth().await.unwrap();

    assert_eq!(report.camera.as_deref(), Some("r1"));
    assert_eq!(report.values.len(), 3);
    assert!(report.values.values().all(|v| *v == 2.0));
}
