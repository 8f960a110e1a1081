// tests/integration/keys_test.rs

//! Tests for key extraction from message properties, JSON bodies and closures.

use seqdispatch::broker::Message;
use seqdispatch::core::errors::SequencerError;
use seqdispatch::core::keys::{
    JsonFieldKeyExtractor, KeyExtractor, MessageKey, PropertyKeyExtractor,
};

fn json_message(body: &str) -> Message {
    Message::new("m-1", body.to_string())
}

// ===== Property extractor =====

#[test]
fn test_property_extractor_reads_the_property() {
    let extractor = PropertyKeyExtractor::new("customer");
    let message = Message::new("m-1", "ignored").with_property("customer", "c-42");
    assert_eq!(extractor.extract_key(&message).unwrap(), MessageKey::new("c-42"));
}

#[test]
fn test_property_extractor_missing_property() {
    let extractor = PropertyKeyExtractor::new("customer");
    let message = Message::new("m-1", "ignored").with_property("other", "x");
    let err = extractor.extract_key(&message).unwrap_err();
    assert!(matches!(err, SequencerError::KeyExtraction(_)));
    assert!(err.is_recoverable());
}

// ===== JSON field extractor =====

#[test]
fn test_json_extractor_scalar_fields() {
    let extractor = JsonFieldKeyExtractor::new("account");
    let cases = [
        (r#"{"account": "acc-7", "amount": 10}"#, "acc-7"),
        (r#"{"account": 1234}"#, "1234"),
        (r#"{"account": true}"#, "true"),
    ];
    for (body, expected) in cases {
        let key = extractor.extract_key(&json_message(body)).unwrap();
        assert_eq!(key.as_str(), expected, "body {body}");
    }
}

#[test]
fn test_json_extractor_rejects_unusable_bodies() {
    let extractor = JsonFieldKeyExtractor::new("account");
    for body in [
        r#"{"amount": 10}"#,
        r#"{"account": {"id": 1}}"#,
        r#"{"account": null}"#,
        "not json",
    ] {
        let err = extractor.extract_key(&json_message(body)).unwrap_err();
        assert!(
            matches!(err, SequencerError::KeyExtraction(_)),
            "body {body}: {err:?}"
        );
    }
}

#[test]
fn test_json_extractor_rejects_invalid_utf8() {
    let extractor = JsonFieldKeyExtractor::new("account");
    let message = Message::new("m-1", vec![0xff, 0xfe, 0xfd]);
    assert!(matches!(
        extractor.extract_key(&message),
        Err(SequencerError::KeyExtraction(_))
    ));
}

// ===== Closures =====

#[test]
fn test_closures_are_key_extractors() {
    let by_id = |message: &Message| -> Result<MessageKey, SequencerError> {
        Ok(MessageKey::from(message.message_id.clone()))
    };
    let extractor: &dyn KeyExtractor = &by_id;
    let key = extractor.extract_key(&Message::new("id-9", "x")).unwrap();
    assert_eq!(key.to_string(), "id-9");
}
