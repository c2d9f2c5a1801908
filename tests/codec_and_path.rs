// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

use std::rc::Rc;

use muscle::codec;
use muscle::message::{what, Field, Message};
use muscle::path::PathMatcher;

#[test]
fn flatten_and_unflatten_round_trips_a_nested_message() {
    let _ = env_logger::try_init();

    let mut inner = Message::new(0);
    inner.add_i32("count", 7);
    inner.add_string("label", "hello");

    let mut outer = Message::new(what::PR_COMMAND_SETDATA);
    outer.add_message("foo/bar", Rc::new(inner));
    outer.add_bytes("raw", vec![1, 2, 3, 4]);

    let bytes = codec::flatten(&outer).unwrap();
    let restored = codec::unflatten(&bytes).unwrap();

    assert_eq!(restored.what, what::PR_COMMAND_SETDATA);
    match restored.field("raw") {
        Some(Field::Bytes(values)) => assert_eq!(values[0], vec![1, 2, 3, 4]),
        other => panic!("unexpected field: {:?}", other),
    }
    match restored.field("foo/bar") {
        Some(Field::Message(values)) => {
            assert_eq!(values[0].find_string("label", 0), Some("hello"));
        }
        other => panic!("unexpected field: {:?}", other),
    }
}

#[test]
fn unflatten_rejects_truncated_input() {
    let _ = env_logger::try_init();

    let mut msg = Message::new(1);
    msg.add_i32("x", 1);
    let mut bytes = codec::flatten(&msg).unwrap();
    bytes.truncate(bytes.len() - 2);

    assert!(codec::unflatten(&bytes).is_err());
}

#[test]
fn path_matcher_matches_glob_subscriptions_across_siblings() {
    let _ = env_logger::try_init();

    let mut matcher = PathMatcher::new();
    matcher.put_path_string("foo/*", None);

    assert!(matcher.matches_path("foo/hello", None));
    assert!(matcher.matches_path("foo/world", None));
    assert!(!matcher.matches_path("bar/hello", None));
    assert!(!matcher.matches_path("foo/hello/nested", None));
}

#[test]
fn path_matcher_forgets_a_removed_pattern() {
    let _ = env_logger::try_init();

    let mut matcher = PathMatcher::new();
    matcher.put_path_string("a/b", None);
    assert!(matcher.matches_path("a/b", None));

    matcher.remove_path_string("a/b");
    assert!(!matcher.matches_path("a/b", None));
}
