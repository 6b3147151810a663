//! End-to-end scenarios over real sockets: a server thread runs the event
//! loop, the test drives it with literal wire bytes.

use cinder_core::config::Config;
use cinder_core::logging;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

fn start_server(mut config: Config) -> u16 {
    config.server.port = 0;
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let (mut el, mut srv) = cinder_server::bootstrap(config, logging::discard());
        tx.send(srv.local_port().expect("listener must be bound"))
            .expect("port channel closed");
        el.run(&mut srv);
    });
    rx.recv_timeout(Duration::from_secs(5)).expect("server did not start")
}

fn connect(port: u16) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", port)).expect("connect failed");
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    stream.set_nodelay(true).unwrap();
    stream
}

fn read_line(stream: &mut TcpStream) -> Vec<u8> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).expect("read failed");
        assert_eq!(n, 1, "connection closed mid-line");
        line.push(byte[0]);
        if byte[0] == b'\n' {
            return line;
        }
    }
}

/// Reads one full RESP reply, returning its raw bytes.
fn read_reply(stream: &mut TcpStream) -> Vec<u8> {
    let line = read_line(stream);
    let mut out = line.clone();
    let body = &line[1..line.len() - 2];
    match line[0] {
        b'$' => {
            let len: i64 = String::from_utf8_lossy(body).parse().unwrap();
            if len >= 0 {
                let mut payload = vec![0u8; len as usize + 2];
                stream.read_exact(&mut payload).expect("short bulk read");
                out.extend_from_slice(&payload);
            }
        }
        b'*' => {
            let count: i64 = String::from_utf8_lossy(body).parse().unwrap();
            for _ in 0..count.max(0) {
                out.extend_from_slice(&read_reply(stream));
            }
        }
        _ => (),
    }
    out
}

fn command(stream: &mut TcpStream, args: &[&[u8]]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", args.len()).into_bytes();
    for arg in args {
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
    stream.write_all(&out).expect("write failed");
    read_reply(stream)
}

#[test]
fn test_ping() {
    let port = start_server(Config::default());
    let mut c = connect(port);

    c.write_all(b"*1\r\n$4\r\nPING\r\n").unwrap();
    assert_eq!(read_reply(&mut c), b"+PONG\r\n");
}

#[test]
fn test_inline_ping() {
    let port = start_server(Config::default());
    let mut c = connect(port);

    c.write_all(b"PING\r\n").unwrap();
    assert_eq!(read_reply(&mut c), b"+PONG\r\n");
}

#[test]
fn test_set_get() {
    let port = start_server(Config::default());
    let mut c = connect(port);

    c.write_all(b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n").unwrap();
    assert_eq!(read_reply(&mut c), b"+OK\r\n");

    c.write_all(b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n").unwrap();
    assert_eq!(read_reply(&mut c), b"$3\r\nbar\r\n");
}

#[test]
fn test_object_encoding_integer_string() {
    let port = start_server(Config::default());
    let mut c = connect(port);

    assert_eq!(command(&mut c, &[b"SET", b"k", b"12345"]), b"+OK\r\n");
    assert_eq!(
        command(&mut c, &[b"OBJECT", b"ENCODING", b"k"]),
        b"$3\r\nint\r\n"
    );
}

#[test]
fn test_pubsub_roundtrip() {
    let port = start_server(Config::default());
    let mut subscriber = connect(port);
    let mut publisher = connect(port);

    subscriber
        .write_all(b"*2\r\n$9\r\nSUBSCRIBE\r\n$4\r\nnews\r\n")
        .unwrap();
    assert_eq!(
        read_reply(&mut subscriber),
        b"*3\r\n$9\r\nsubscribe\r\n$4\r\nnews\r\n:1\r\n"
    );

    assert_eq!(
        command(&mut publisher, &[b"PUBLISH", b"news", b"hi"]),
        b":1\r\n"
    );
    assert_eq!(
        read_reply(&mut subscriber),
        b"*3\r\n$7\r\nmessage\r\n$4\r\nnews\r\n$2\r\nhi\r\n"
    );
}

#[test]
fn test_deferred_multibulk_reply() {
    let port = start_server(Config::default());
    let mut c = connect(port);

    assert_eq!(command(&mut c, &[b"RPUSH", b"l", b"1", b"2", b"3"]), b":3\r\n");
    assert_eq!(
        command(&mut c, &[b"LRANGE", b"l", b"0", b"-1"]),
        b"*3\r\n$1\r\n1\r\n$1\r\n2\r\n$1\r\n3\r\n"
    );
}

#[test]
fn test_protocol_error_closes_connection() {
    let port = start_server(Config::default());
    let mut c = connect(port);

    c.write_all(b"*abc\r\n").unwrap();
    let mut everything = Vec::new();
    c.read_to_end(&mut everything).expect("read failed");
    assert!(everything.starts_with(b"-ERR Protocol error"));
}

#[test]
fn test_quit_closes_after_reply() {
    let port = start_server(Config::default());
    let mut c = connect(port);

    c.write_all(b"*1\r\n$4\r\nQUIT\r\n").unwrap();
    assert_eq!(read_reply(&mut c), b"+OK\r\n");

    let mut rest = Vec::new();
    c.read_to_end(&mut rest).expect("read failed");
    assert!(rest.is_empty());
}

#[test]
fn test_client_name_and_list() {
    let port = start_server(Config::default());
    let mut c = connect(port);

    assert_eq!(command(&mut c, &[b"CLIENT", b"GETNAME"]), b"$-1\r\n");
    let bad = command(&mut c, &[b"CLIENT", b"SETNAME"]);
    assert!(bad.starts_with(b"-ERR Syntax error"));
    let bad = command(&mut c, &[b"CLIENT", b"SETNAME", b"has space"]);
    assert!(bad.starts_with(b"-ERR Client names"));
    assert_eq!(command(&mut c, &[b"CLIENT", b"SETNAME", b"worker-1"]), b"+OK\r\n");
    assert_eq!(
        command(&mut c, &[b"CLIENT", b"GETNAME"]),
        b"$8\r\nworker-1\r\n"
    );

    let list = command(&mut c, &[b"CLIENT", b"LIST"]);
    let text = String::from_utf8_lossy(&list).to_string();
    assert!(text.contains("name=worker-1"));
    assert!(text.contains("cmd=client"));
}

#[test]
fn test_keyspace_notifications() {
    let mut config = Config::default();
    config.notify.keyspace_events = "KEA".to_string();
    let port = start_server(config);

    let mut subscriber = connect(port);
    let confirm = command(&mut subscriber, &[b"SUBSCRIBE", b"__keyevent@0__:set"]);
    assert!(confirm.starts_with(b"*3\r\n$9\r\nsubscribe\r\n"));

    let mut writer = connect(port);
    assert_eq!(command(&mut writer, &[b"SET", b"foo", b"bar"]), b"+OK\r\n");

    let event = read_reply(&mut subscriber);
    let text = String::from_utf8_lossy(&event).to_string();
    assert!(text.contains("__keyevent@0__:set"));
    assert!(text.contains("foo"));
}

#[test]
fn test_expiration_sweep() {
    let port = start_server(Config::default());
    let mut c = connect(port);

    assert_eq!(command(&mut c, &[b"SET", b"gone", b"v"]), b"+OK\r\n");
    assert_eq!(command(&mut c, &[b"PEXPIRE", b"gone", b"40"]), b":1\r\n");
    thread::sleep(Duration::from_millis(250));
    assert_eq!(command(&mut c, &[b"GET", b"gone"]), b"$-1\r\n");
    assert_eq!(command(&mut c, &[b"EXISTS", b"gone"]), b":0\r\n");
}

#[test]
fn test_dump_restore_between_keys() {
    let port = start_server(Config::default());
    let mut c = connect(port);

    assert_eq!(command(&mut c, &[b"SET", b"src", b"payload"]), b"+OK\r\n");
    let dump = command(&mut c, &[b"DUMP", b"src"]);
    assert_eq!(dump[0], b'$');
    let header_end = dump.iter().position(|&b| b == b'\n').unwrap();
    let payload = dump[header_end + 1..dump.len() - 2].to_vec();

    assert_eq!(
        command(&mut c, &[b"RESTORE", b"dst", b"0", &payload]),
        b"+OK\r\n"
    );
    assert_eq!(command(&mut c, &[b"GET", b"dst"]), b"$7\r\npayload\r\n");

    let busy = command(&mut c, &[b"RESTORE", b"dst", b"0", &payload]);
    assert!(busy.starts_with(b"-BUSYKEY"));

    let bad = command(&mut c, &[b"RESTORE", b"fresh", b"0", b"garbage"]);
    assert!(bad.starts_with(b"-ERR DUMP payload version or checksum are wrong"));
}

#[test]
fn test_migrate_between_servers() {
    let source_port = start_server(Config::default());
    let target_port = start_server(Config::default());

    let mut source = connect(source_port);
    assert_eq!(command(&mut source, &[b"SET", b"foo", b"bar"]), b"+OK\r\n");

    let port_arg = target_port.to_string();
    let reply = command(
        &mut source,
        &[b"MIGRATE", b"127.0.0.1", port_arg.as_bytes(), b"foo", b"0", b"1000"],
    );
    assert_eq!(reply, b"+OK\r\n");

    assert_eq!(command(&mut source, &[b"EXISTS", b"foo"]), b":0\r\n");

    let mut target = connect(target_port);
    assert_eq!(command(&mut target, &[b"GET", b"foo"]), b"$3\r\nbar\r\n");
}

#[test]
fn test_migrate_missing_key_is_nokey() {
    let source_port = start_server(Config::default());
    let target_port = start_server(Config::default());

    let mut source = connect(source_port);
    let reply = command(
        &mut source,
        &[
            b"MIGRATE",
            b"127.0.0.1",
            target_port.to_string().as_bytes(),
            b"missing",
            b"0",
            b"1000",
        ],
    );
    assert_eq!(reply, b"+NOKEY\r\n");
}

#[test]
fn test_unknown_command_keeps_connection() {
    let port = start_server(Config::default());
    let mut c = connect(port);

    let reply = command(&mut c, &[b"BOGUS"]);
    assert!(reply.starts_with(b"-ERR unknown command"));
    assert_eq!(command(&mut c, &[b"PING"]), b"+PONG\r\n");
}

#[test]
fn test_pipelined_commands() {
    let port = start_server(Config::default());
    let mut c = connect(port);

    c.write_all(b"*1\r\n$4\r\nPING\r\n*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n*2\r\n$3\r\nGET\r\n$1\r\nk\r\n")
        .unwrap();
    assert_eq!(read_reply(&mut c), b"+PONG\r\n");
    assert_eq!(read_reply(&mut c), b"+OK\r\n");
    assert_eq!(read_reply(&mut c), b"$1\r\nv\r\n");
}

#[test]
fn test_big_argument_roundtrip() {
    let port = start_server(Config::default());
    let mut c = connect(port);

    // Larger than the donation threshold so the aligned-read path runs.
    let big = vec![b'z'; 40 * 1024];
    assert_eq!(command(&mut c, &[b"SET", b"big", &big]), b"+OK\r\n");

    let reply = command(&mut c, &[b"GET", b"big"]);
    let expected_header = format!("${}\r\n", big.len()).into_bytes();
    assert!(reply.starts_with(&expected_header));
    assert_eq!(&reply[expected_header.len()..reply.len() - 2], &big[..]);
}
