// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use muscle::factory::BasicFactory;
use muscle::message::{what, Message};
use muscle::{codec, ServerConfig};

/// Writes one `[u32 bodyLen][u32 encoding][body]` frame, matching
/// `FramedMessageGateway`'s wire format.
fn write_frame(stream: &mut TcpStream, msg: &Message) {
    let body = codec::flatten(msg).unwrap();
    stream.write_u32::<LittleEndian>(body.len() as u32).unwrap();
    stream.write_u32::<LittleEndian>(1).unwrap(); // Encoding::Uncompressed
    stream.write_all(&body).unwrap();
}

/// Blocks (with the stream's read timeout already set by the caller)
/// until one complete frame is available, then decodes it.
fn read_frame(stream: &mut TcpStream) -> Message {
    let body_len = stream.read_u32::<LittleEndian>().unwrap() as usize;
    let _encoding = stream.read_u32::<LittleEndian>().unwrap();
    let mut body = vec![0u8; body_len];
    stream.read_exact(&mut body).unwrap();
    (*codec::unflatten(&body).unwrap()).clone()
}

fn spawn_reflect_server(addr: std::net::SocketAddr) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let config = ServerConfig::new();
        let mut server = muscle::ReflectServer::new(config).unwrap();
        server.add_tcp_factory(addr, Box::new(BasicFactory::new(0))).unwrap();
        loop {
            server.run_once().unwrap();
        }
    })
}

#[test]
fn ping_is_echoed_back_over_tcp() {
    let _ = env_logger::try_init();
    let addr: std::net::SocketAddr = "127.0.0.1:28901".parse().unwrap();
    let _server = spawn_reflect_server(addr);
    thread::sleep(Duration::from_millis(50));

    let mut client = TcpStream::connect(addr).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    client.set_nodelay(true).unwrap();

    let mut ping = Message::new(what::PR_COMMAND_PING);
    ping.add_bytes("payload", vec![9, 8, 7]);
    write_frame(&mut client, &ping);

    // The server first sends a PR_RESULT_PARAMETERS greeting as soon as
    // the session attaches; the pong follows once the ping is processed.
    let first = read_frame(&mut client);
    let reply = if first.what == what::PR_RESULT_PARAMETERS { read_frame(&mut client) } else { first };

    assert_eq!(reply.what, what::PR_RESULT_PONG);
    match reply.field("payload") {
        Some(muscle::message::Field::Bytes(values)) => assert_eq!(values[0], vec![9, 8, 7]),
        other => panic!("unexpected reply field: {:?}", other),
    }
}

#[test]
fn subscriber_receives_notification_for_data_set_by_another_client() {
    let _ = env_logger::try_init();
    let addr: std::net::SocketAddr = "127.0.0.1:28902".parse().unwrap();
    let _server = spawn_reflect_server(addr);
    thread::sleep(Duration::from_millis(50));

    let mut subscriber = TcpStream::connect(addr).unwrap();
    subscriber.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    subscriber.set_nodelay(true).unwrap();
    let _ = read_frame(&mut subscriber); // PR_RESULT_PARAMETERS greeting

    // Subscriptions are matched clause-for-clause against the absolute
    // path of any newly created node (host/session/...), so an anchored
    // pattern is needed to see a node created under a different
    // session's home: "/*/*/shared/*" matches any host, any session id,
    // then a literal "shared" node.
    let mut sub_msg = Message::new(what::PR_COMMAND_SETPARAMETERS);
    sub_msg.add_string("SUBSCRIBE:/*/*/shared/*", "");
    write_frame(&mut subscriber, &sub_msg);

    let mut publisher = TcpStream::connect(addr).unwrap();
    publisher.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    publisher.set_nodelay(true).unwrap();
    let _ = read_frame(&mut publisher); // PR_RESULT_PARAMETERS greeting

    let mut payload = Message::new(0);
    payload.add_i32("value", 42);
    let mut set_msg = Message::new(what::PR_COMMAND_SETDATA);
    set_msg.add_message("shared/reading", std::rc::Rc::new(payload));
    write_frame(&mut publisher, &set_msg);

    let notification = read_frame(&mut subscriber);
    assert_eq!(notification.what, what::PR_RESULT_DATAITEMS);
}
