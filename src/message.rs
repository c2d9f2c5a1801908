// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! The `Message`: an insertion-ordered, reference-counted key/field
//! container carrying a 32-bit `what` dispatch code. See spec §3.

use std::rc::Rc;

/// Reserved `what` codes. `PR_COMMAND_*` flow client -> server,
/// `PR_RESULT_*` flow server -> client.
pub mod what {
    pub const PR_COMMAND_SETDATA: u32 = 1_886_740_000;
    pub const PR_COMMAND_GETDATA: u32 = 1_886_740_001;
    pub const PR_COMMAND_REMOVEDATA: u32 = 1_886_740_002;
    pub const PR_COMMAND_SETPARAMETERS: u32 = 1_886_740_003;
    pub const PR_COMMAND_GETPARAMETERS: u32 = 1_886_740_004;
    pub const PR_COMMAND_REMOVEPARAMETERS: u32 = 1_886_740_005;
    pub const PR_COMMAND_INSERTORDEREDDATA: u32 = 1_886_740_006;
    pub const PR_COMMAND_REORDERDATA: u32 = 1_886_740_007;
    pub const PR_COMMAND_ADDBANS: u32 = 1_886_740_008;
    pub const PR_COMMAND_REMOVEBANS: u32 = 1_886_740_009;
    pub const PR_COMMAND_KICK: u32 = 1_886_740_010;
    pub const PR_COMMAND_PING: u32 = 1_886_740_011;
    pub const PR_COMMAND_JETTISON: u32 = 1_886_740_012;

    pub const PR_RESULT_DATAITEMS: u32 = 1_886_745_000;
    pub const PR_RESULT_INDEXUPDATED: u32 = 1_886_745_001;
    pub const PR_RESULT_PONG: u32 = 1_886_745_002;
    pub const PR_RESULT_PARAMETERS: u32 = 1_886_745_003;
    pub const PR_RESULT_ERRORUNIMPLEMENTED: u32 = 1_886_745_004;
    pub const PR_RESULT_ERROR_OUT_OF_MEMORY: u32 = 1_886_745_005;
    pub const PR_RESULT_ERROR_BAD_ARGUMENT: u32 = 1_886_745_006;

    /// Field name carrying the list of path patterns a GETDATA/REMOVEDATA/
    /// JETTISON command operates on.
    pub const FIELD_KEYS: &str = "KEYS";
    /// Field on `PR_RESULT_DATAITEMS` listing paths that were removed.
    pub const FIELD_REMOVED: &str = "REMOVED";
    /// Prefix for subscribe/unsubscribe fields in a SETPARAMETERS Message,
    /// e.g. `"SUBSCRIBE:foo/*"`.
    pub const FIELD_SUBSCRIBE_PREFIX: &str = "SUBSCRIBE:";
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

/// A single named entry in a Message. Every variant is a typed array, per
/// spec §3 ("A field holds a typed array"). `Pointer` is never serialized;
/// the codec rejects it on output.
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    Bool(Vec<bool>),
    I8(Vec<i8>),
    U8(Vec<u8>),
    I16(Vec<i16>),
    U16(Vec<u16>),
    I32(Vec<i32>),
    U32(Vec<u32>),
    I64(Vec<i64>),
    U64(Vec<u64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    Rect(Vec<Rect>),
    Point(Vec<Point>),
    String(Vec<String>),
    Bytes(Vec<Vec<u8>>),
    Message(Vec<Rc<Message>>),
    /// Opaque, process-local token. Never flattened; `Flatten` rejects a
    /// Message containing one (see spec §9, Open Questions).
    Pointer(Vec<usize>),
}

impl Field {
    pub fn type_code(&self) -> u32 {
        match self {
            Field::Bool(_) => type_code::BOOL,
            Field::I8(_) => type_code::INT8,
            Field::U8(_) => type_code::UINT8,
            Field::I16(_) => type_code::INT16,
            Field::U16(_) => type_code::UINT16,
            Field::I32(_) => type_code::INT32,
            Field::U32(_) => type_code::UINT32,
            Field::I64(_) => type_code::INT64,
            Field::U64(_) => type_code::UINT64,
            Field::F32(_) => type_code::FLOAT,
            Field::F64(_) => type_code::DOUBLE,
            Field::Rect(_) => type_code::RECT,
            Field::Point(_) => type_code::POINT,
            Field::String(_) => type_code::STRING,
            Field::Bytes(_) => type_code::BYTES,
            Field::Message(_) => type_code::MESSAGE,
            Field::Pointer(_) => type_code::POINTER,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Field::Bool(v) => v.len(),
            Field::I8(v) => v.len(),
            Field::U8(v) => v.len(),
            Field::I16(v) => v.len(),
            Field::U16(v) => v.len(),
            Field::I32(v) => v.len(),
            Field::U32(v) => v.len(),
            Field::I64(v) => v.len(),
            Field::U64(v) => v.len(),
            Field::F32(v) => v.len(),
            Field::F64(v) => v.len(),
            Field::Rect(v) => v.len(),
            Field::Point(v) => v.len(),
            Field::String(v) => v.len(),
            Field::Bytes(v) => v.len(),
            Field::Message(v) => v.len(),
            Field::Pointer(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Type-code constants carried on the wire (see §4.1).
pub mod type_code {
    pub const BOOL: u32 = 1;
    pub const INT8: u32 = 2;
    pub const UINT8: u32 = 3;
    pub const INT16: u32 = 4;
    pub const UINT16: u32 = 5;
    pub const INT32: u32 = 6;
    pub const UINT32: u32 = 7;
    pub const INT64: u32 = 8;
    pub const UINT64: u32 = 9;
    pub const FLOAT: u32 = 10;
    pub const DOUBLE: u32 = 11;
    pub const RECT: u32 = 12;
    pub const POINT: u32 = 13;
    pub const STRING: u32 = 14;
    pub const BYTES: u32 = 15;
    pub const MESSAGE: u32 = 16;
    pub const POINTER: u32 = 17;
}

/// An insertion-ordered mapping from field name to `Field`, plus a `what`
/// dispatch code. Messages are normally passed around as `Rc<Message>`
/// since the framework treats them as shared, immutable-by-convention
/// handles once enqueued.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub what: u32,
    names: Vec<String>,
    fields: std::collections::HashMap<String, Field>,
}

impl Message {
    pub fn new(what: u32) -> Message {
        Message {
            what,
            names: Vec::new(),
            fields: std::collections::HashMap::new(),
        }
    }

    pub fn set_field(&mut self, name: &str, field: Field) {
        if !self.fields.contains_key(name) {
            self.names.push(name.to_owned());
        }
        self.fields.insert(name.to_owned(), field);
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.get(name)
    }

    pub fn remove_field(&mut self, name: &str) -> Option<Field> {
        let removed = self.fields.remove(name);
        if removed.is_some() {
            self.names.retain(|n| n != name);
        }
        removed
    }

    /// Iterates fields in insertion order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Field)> {
        self.names
            .iter()
            .map(move |n| (n.as_str(), self.fields.get(n).expect("name index out of sync")))
    }

    pub fn field_names_with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a str> {
        self.names.iter().map(String::as_str).filter(move |n| n.starts_with(prefix))
    }

    pub fn num_fields(&self) -> usize {
        self.names.len()
    }

    pub fn contains_pointer_field(&self) -> bool {
        self.fields.values().any(|f| matches!(f, Field::Pointer(_)))
    }

    // --- convenience single-value accessors, modeled on MUSCLE's AddXxx/FindXxx ---

    pub fn add_string(&mut self, name: &str, value: impl Into<String>) {
        self.push(name, value.into(), |v| Field::String(v));
    }

    pub fn add_i32(&mut self, name: &str, value: i32) {
        self.push(name, value, |v| Field::I32(v));
    }

    pub fn add_u32(&mut self, name: &str, value: u32) {
        self.push(name, value, |v| Field::U32(v));
    }

    pub fn add_bytes(&mut self, name: &str, value: Vec<u8>) {
        self.push(name, value, |v| Field::Bytes(v));
    }

    pub fn add_message(&mut self, name: &str, value: Rc<Message>) {
        self.push(name, value, |v| Field::Message(v));
    }

    fn push<T, F: Fn(Vec<T>) -> Field>(&mut self, name: &str, value: T, wrap: F) {
        if !self.fields.contains_key(name) {
            self.names.push(name.to_owned());
        }
        match self.fields.get_mut(name) {
            Some(existing) => merge_into(existing, value),
            None => {
                self.fields.insert(name.to_owned(), wrap(vec![value]));
            }
        }
    }

    pub fn find_string(&self, name: &str, index: usize) -> Option<&str> {
        match self.field(name) {
            Some(Field::String(v)) => v.get(index).map(String::as_str),
            _ => None,
        }
    }

    pub fn find_i32(&self, name: &str, index: usize) -> Option<i32> {
        match self.field(name) {
            Some(Field::I32(v)) => v.get(index).copied(),
            _ => None,
        }
    }

    pub fn find_message(&self, name: &str, index: usize) -> Option<&Rc<Message>> {
        match self.field(name) {
            Some(Field::Message(v)) => v.get(index),
            _ => None,
        }
    }
}

fn merge_into<T>(field: &mut Field, value: T)
where
    Field: FieldPush<T>,
{
    field.push(value);
}

trait FieldPush<T> {
    fn push(&mut self, value: T);
}

impl FieldPush<String> for Field {
    fn push(&mut self, value: String) {
        if let Field::String(v) = self {
            v.push(value);
        }
    }
}

impl FieldPush<i32> for Field {
    fn push(&mut self, value: i32) {
        if let Field::I32(v) = self {
            v.push(value);
        }
    }
}

impl FieldPush<u32> for Field {
    fn push(&mut self, value: u32) {
        if let Field::U32(v) = self {
            v.push(value);
        }
    }
}

impl FieldPush<Vec<u8>> for Field {
    fn push(&mut self, value: Vec<u8>) {
        if let Field::Bytes(v) = self {
            v.push(value);
        }
    }
}

impl FieldPush<Rc<Message>> for Field {
    fn push(&mut self, value: Rc<Message>) {
        if let Field::Message(v) = self {
            v.push(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_preserve_insertion_order() {
        let mut msg = Message::new(what::PR_COMMAND_SETDATA);
        msg.add_string("z", "last-named-first-inserted");
        msg.add_string("a", "second");
        let names: Vec<&str> = msg.fields().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["z", "a"]);
    }

    #[test]
    fn repeated_add_grows_the_typed_array() {
        let mut msg = Message::new(0);
        msg.add_i32("val", 1);
        msg.add_i32("val", 2);
        assert_eq!(msg.field("val").unwrap().len(), 2);
        assert_eq!(msg.find_i32("val", 1), Some(2));
    }

    #[test]
    fn pointer_field_is_detected() {
        let mut msg = Message::new(0);
        msg.set_field("ptr", Field::Pointer(vec![0xdead]));
        assert!(msg.contains_pointer_field());
    }
}
