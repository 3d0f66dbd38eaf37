#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use keel_codec::{decode, encode};
use keel_core::{ObjectMeta, Resource};
use proptest::prelude::*;
use serde_json::{Map, Value};

fn scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<i64>().prop_map(Value::from),
        any::<bool>().prop_map(Value::from),
        "[a-zA-Z0-9 ._-]{0,12}".prop_map(Value::from),
    ]
}

fn json_tree() -> impl Strategy<Value = Value> {
    scalar().prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

fn object_tree() -> impl Strategy<Value = Value> {
    prop::collection::btree_map("[a-z]{1,6}", json_tree(), 0..4).prop_map(|m| Value::Object(m.into_iter().collect()))
}

/// An explicit `null` must survive as well as an object.
fn intent() -> impl Strategy<Value = Value> {
    prop_oneof![1 => Just(Value::Null), 4 => object_tree()]
}

fn extras() -> impl Strategy<Value = Map<String, Value>> {
    // Prefixed keys never collide with the modelled envelope fields.
    prop::collection::btree_map("x[a-z]{1,5}", json_tree(), 0..3).prop_map(|m| m.into_iter().collect())
}

fn string_map() -> impl Strategy<Value = BTreeMap<String, String>> {
    prop::collection::btree_map("[a-z]{1,8}(/[a-z]{1,4})?", "[a-z0-9]{0,8}", 0..4)
}

prop_compose! {
    fn arb_meta()(
        name in "[a-z][a-z0-9-]{0,14}",
        namespace in proptest::option::of("[a-z]{1,10}"),
        resource_version in proptest::option::of("[1-9][0-9]{0,6}"),
        uid in proptest::option::of("[0-9a-f]{8}"),
        generation in proptest::option::of(1i64..1_000),
        labels in string_map(),
        annotations in string_map(),
        extra in extras(),
    ) -> ObjectMeta {
        ObjectMeta { name, namespace, resource_version, uid, generation, labels, annotations, extra }
    }
}

prop_compose! {
    fn arb_resource()(
        api_version in prop_oneof![Just(String::new()), Just("v1".to_string()), Just("example.dev/v1".to_string())],
        kind in prop_oneof![Just("Widget"), Just("Pod"), Just("Secret")],
        metadata in arb_meta(),
        spec in proptest::option::of(intent()),
        status in proptest::option::of(intent()),
        extra in extras(),
    ) -> Resource {
        Resource { api_version, kind: kind.to_string(), metadata, spec, status, extra }
    }
}

proptest! {
    #[test]
    fn decode_of_encode_is_identity(r in arb_resource()) {
        let bytes = encode(&r).expect("encode");
        let back = decode(&bytes).expect("decode");
        prop_assert_eq!(back, r);
    }

    #[test]
    fn explicit_null_spec_round_trips(name in "[a-z]{1,8}") {
        let mut r = Resource { kind: "Widget".into(), ..Default::default() };
        r.metadata.name = name;
        r.spec = Some(Value::Null);
        prop_assert_eq!(decode(&encode(&r).expect("encode")).expect("decode"), r);
    }
}
