use proptest::prelude::*;

use objmirror_core::{Client, ClientConfig, NoopRestController, Number, Op, Value};

#[derive(Clone, Debug)]
enum Edit {
    Set(i64),
    Unset,
    Increment(i64),
}

fn edit() -> impl Strategy<Value = Edit> {
    prop_oneof![
        (-1_000i64..1_000).prop_map(Edit::Set),
        Just(Edit::Unset),
        (-100i64..100).prop_map(Edit::Increment),
    ]
}

fn apply(object: &objmirror_core::Object, edit: &Edit) {
    match edit {
        Edit::Set(n) => object.set("n", *n).unwrap(),
        Edit::Unset => object.unset("n").unwrap(),
        Edit::Increment(n) => object.increment("n", *n).unwrap(),
    }
}

fn client(single_instance: bool) -> Client {
    let config = ClientConfig {
        single_instance,
        ..ClientConfig::default()
    };
    Client::new(config, NoopRestController)
}

proptest! {
    #[test]
    fn estimate_is_server_value_plus_all_increments(
        server in -1_000i64..1_000,
        batches in prop::collection::vec(prop::collection::vec(-50i64..50, 0..5), 1..5),
        single_instance in any::<bool>(),
    ) {
        let client = client(single_instance);
        let object = client
            .object_from_json(&serde_json::json!({"className": "Counter", "objectId": "c1", "n": server}), true)
            .unwrap();
        let store = client.store();
        for (i, amounts) in batches.iter().enumerate() {
            if i > 0 {
                store.push_pending_state(&object);
            }
            for amount in amounts {
                object.increment("n", *amount).unwrap();
            }
        }
        let expected = server + batches.iter().flatten().sum::<i64>();
        prop_assert_eq!(object.get("n").unwrap(), Some(Value::from(expected)));
        prop_assert_eq!(store.get_server_data(&object)["n"].clone(), Value::from(server));
    }

    #[test]
    fn merging_batches_preserves_the_estimate(
        server in prop::option::of(-1_000i64..1_000),
        first in prop::collection::vec(edit(), 0..6),
        second in prop::collection::vec(edit(), 0..6),
    ) {
        let client = client(true);
        let mut json = serde_json::json!({"className": "Counter", "objectId": "c1"});
        if let Some(server) = server {
            json["n"] = serde_json::json!(server);
        }
        let object = client.object_from_json(&json, true).unwrap();
        let store = client.store();

        first.iter().for_each(|edit| apply(&object, edit));
        store.push_pending_state(&object);
        second.iter().for_each(|edit| apply(&object, edit));

        let before = object.get("n").unwrap();
        store.merge_first_pending_state(&object).unwrap();
        prop_assert_eq!(store.get_pending_ops(&object).len(), 1);
        prop_assert_eq!(object.get("n").unwrap(), before);
    }

    #[test]
    fn increments_merge_into_one_operation(amounts in prop::collection::vec(-100i64..100, 1..8)) {
        let client = client(false);
        let object = client.create_without_data("Counter", "c1");
        for amount in &amounts {
            object.increment("n", *amount).unwrap();
        }
        let total: i64 = amounts.iter().sum();
        prop_assert_eq!(object.op("n").unwrap(), Some(Op::Increment(Number::Int(total))));
    }
}
