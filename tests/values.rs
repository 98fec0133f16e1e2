//! Field values crossing the native boundary in both directions.

mod helpers;

use std::sync::Arc;

use fabric_bridge::native::NativeValue;
use fabric_bridge::{
    BridgeError, HostMessage, HostValue, OutboundMessage, PublicationEventKind, SendOptions,
    SubscriptionOptions, Timestamp,
};
use helpers::fabric::{Fixture, Recorder};
use rstest::rstest;

/// Subscribe to `topic` and collect every message.
fn collect(fixture: &Fixture, topic: &str) -> Recorder<HostMessage> {
    let subscription = fixture
        .session
        .create_subscription_blocking(topic, SubscriptionOptions::best_effort())
        .unwrap();
    let received = Recorder::new();
    let sink = received.clone();
    subscription
        .on_message(move |message| {
            sink.push(message.clone());
            Ok(())
        })
        .unwrap();
    received
}

#[test]
fn int32_field_survives_publish_and_receive() {
    let mut fixture = Fixture::connect();
    let received = collect(&fixture, "VAL.INT");
    let publication = fixture
        .session
        .create_publication_blocking("VAL.INT")
        .unwrap();

    publication
        .send_message(
            "VAL.INT",
            OutboundMessage::new().with("x", 7),
            SendOptions::default(),
        )
        .unwrap();
    assert!(fixture.run_until(|| received.len() == 1));

    let message = &received.snapshot()[0];
    assert_eq!(message.topic, "VAL.INT");
    assert_eq!(message.get("x"), Some(&HostValue::Int32(7)));
    assert_eq!(message.field_names().collect::<Vec<_>>(), ["x"]);
    fixture.close();
}

#[rstest]
#[case::boolean(NativeValue::Boolean(true), HostValue::Bool(true))]
#[case::byte(NativeValue::Byte(-3), HostValue::Int32(-3))]
#[case::short(NativeValue::Short(300), HostValue::Int32(300))]
#[case::int(NativeValue::Int(i32::MIN), HostValue::Int32(i32::MIN))]
#[case::long(NativeValue::Long(1 << 40), HostValue::Number(1_099_511_627_776.0))]
#[case::float(NativeValue::Float(1.5), HostValue::Number(1.5))]
#[case::double(NativeValue::Double(-2.25), HostValue::Number(-2.25))]
#[case::string(NativeValue::String("abc".into()), HostValue::String("abc".into()))]
#[case::datetime(
    NativeValue::DateTime(Timestamp::from_micros(1_234_567)),
    HostValue::Date(Timestamp::from_micros(1_234_000))
)]
#[case::byte_array(
    NativeValue::ByteArray(vec![-1, 2]),
    HostValue::Array(vec![HostValue::Int32(-1), HostValue::Int32(2)])
)]
#[case::int_array(
    NativeValue::IntArray(vec![4, 5]),
    HostValue::Array(vec![HostValue::Int32(4), HostValue::Int32(5)])
)]
#[case::long_array(
    NativeValue::LongArray(vec![6]),
    HostValue::Array(vec![HostValue::Number(6.0)])
)]
#[case::string_array(
    NativeValue::StringArray(vec!["a".into(), "b".into()]),
    HostValue::Array(vec![HostValue::String("a".into()), HostValue::String("b".into())])
)]
fn native_fields_arrive_as_host_values(#[case] native: NativeValue, #[case] expected: HostValue) {
    let mut fixture = Fixture::connect();
    let received = collect(&fixture, "VAL.TYPES");
    fixture.sim.inject("VAL.TYPES", vec![("field", native)]);
    assert!(fixture.run_until(|| received.len() == 1));
    assert_eq!(received.snapshot()[0].get("field"), Some(&expected));
    fixture.close();
}

#[test]
fn opaque_fields_are_skipped() {
    let mut fixture = Fixture::connect();
    let received = collect(&fixture, "VAL.OPAQUE");
    fixture.sim.inject(
        "VAL.OPAQUE",
        vec![
            ("before", NativeValue::Int(1)),
            ("blob", NativeValue::Opaque(vec![0xde, 0xad])),
            ("after", NativeValue::Int(2)),
        ],
    );
    assert!(fixture.run_until(|| received.len() == 1));
    assert_eq!(
        received.snapshot()[0].field_names().collect::<Vec<_>>(),
        ["before", "after"]
    );
    fixture.close();
}

#[test]
fn host_arrays_and_nulls_publish_as_expected() {
    let mut fixture = Fixture::connect();
    let received = collect(&fixture, "VAL.ARR");
    let publication = fixture
        .session
        .create_publication_blocking("VAL.ARR")
        .unwrap();

    let message = OutboundMessage::new()
        .with("ints", vec![1, 2, 3])
        .with("mixed_numbers", vec![HostValue::Int32(1), HostValue::Number(2.5)])
        .with("flags", vec![true, false])
        .with("missing", HostValue::Null)
        .with("name", "abc");
    publication
        .send_message("VAL.ARR", message, SendOptions::self_describing())
        .unwrap();
    assert!(fixture.run_until(|| received.len() == 1));

    let message = &received.snapshot()[0];
    assert_eq!(message.get("ints"), Some(&HostValue::from(vec![1, 2, 3])));
    assert_eq!(
        message.get("mixed_numbers"),
        Some(&HostValue::from(vec![1.0, 2.5]))
    );
    assert_eq!(message.get("flags"), Some(&HostValue::from(vec![true, false])));
    assert_eq!(message.get("missing"), None);
    assert_eq!(message.get("name"), Some(&HostValue::from("abc")));
    fixture.close();
}

#[test]
fn unconvertible_messages_fail_before_queueing() {
    let mut fixture = Fixture::connect();
    let publication = fixture
        .session
        .create_publication_blocking("VAL.BAD")
        .unwrap();
    let results = Recorder::new();
    let sink = results.clone();
    publication
        .on(PublicationEventKind::Message, move |result| {
            sink.push(result.is_ok());
            Ok(())
        })
        .unwrap();

    let mixed =
        OutboundMessage::new().with("bad", vec![HostValue::Bool(true), HostValue::Int32(1)]);
    let err = publication
        .send_message("VAL.BAD", mixed, SendOptions::default())
        .unwrap_err();
    assert!(matches!(err, BridgeError::InvalidArgument { .. }));
    let err = publication
        .send_message("", OutboundMessage::new(), SendOptions::default())
        .unwrap_err();
    assert!(matches!(err, BridgeError::InvalidArgument { .. }));

    let good = Arc::new(OutboundMessage::new().with("ok", 1));
    publication
        .send_message("VAL.BAD", Arc::clone(&good), SendOptions::default())
        .unwrap();
    assert!(fixture.run_until(|| results.len() == 1));
    assert_eq!(results.snapshot(), [true]);
    assert_eq!(fixture.sim.stats().outbound_messages, 0);
    fixture.close();
}
