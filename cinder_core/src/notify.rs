//! Keyspace event notifications, fanned out through pub/sub on the
//! `__keyspace@<db>__:<key>` and `__keyevent@<db>__:<event>` channels.
//! Event classes are bit-encoded and configured as a string of one-letter
//! flags.

use crate::object::Obj;
use crate::pubsub;
use crate::server::Server;

pub const NOTIFY_KEYSPACE: u32 = 1; // K
pub const NOTIFY_KEYEVENT: u32 = 1 << 1; // E
pub const NOTIFY_GENERIC: u32 = 1 << 2; // g
pub const NOTIFY_STRING: u32 = 1 << 3; // $
pub const NOTIFY_LIST: u32 = 1 << 4; // l
pub const NOTIFY_SET: u32 = 1 << 5; // s
pub const NOTIFY_HASH: u32 = 1 << 6; // h
pub const NOTIFY_ZSET: u32 = 1 << 7; // z
pub const NOTIFY_EXPIRED: u32 = 1 << 8; // x
pub const NOTIFY_EVICTED: u32 = 1 << 9; // e
pub const NOTIFY_ALL: u32 = NOTIFY_GENERIC
    | NOTIFY_STRING
    | NOTIFY_LIST
    | NOTIFY_SET
    | NOTIFY_HASH
    | NOTIFY_ZSET
    | NOTIFY_EXPIRED
    | NOTIFY_EVICTED; // A

/// Parses a flags string such as "KEA" or "Kgx". None on unknown letters.
pub fn parse_flags(spec: &str) -> Option<u32> {
    let mut flags = 0;
    for c in spec.chars() {
        flags |= match c {
            'K' => NOTIFY_KEYSPACE,
            'E' => NOTIFY_KEYEVENT,
            'g' => NOTIFY_GENERIC,
            '$' => NOTIFY_STRING,
            'l' => NOTIFY_LIST,
            's' => NOTIFY_SET,
            'h' => NOTIFY_HASH,
            'z' => NOTIFY_ZSET,
            'x' => NOTIFY_EXPIRED,
            'e' => NOTIFY_EVICTED,
            'A' => NOTIFY_ALL,
            _ => return None,
        };
    }
    Some(flags)
}

/// Renders flags back into the letter syntax; the full class set collapses
/// to 'A'.
pub fn format_flags(flags: u32) -> String {
    let mut out = String::new();
    if flags & NOTIFY_KEYSPACE != 0 {
        out.push('K');
    }
    if flags & NOTIFY_KEYEVENT != 0 {
        out.push('E');
    }
    if flags & NOTIFY_ALL == NOTIFY_ALL {
        out.push('A');
        return out;
    }
    for (bit, letter) in [
        (NOTIFY_GENERIC, 'g'),
        (NOTIFY_STRING, '$'),
        (NOTIFY_LIST, 'l'),
        (NOTIFY_SET, 's'),
        (NOTIFY_HASH, 'h'),
        (NOTIFY_ZSET, 'z'),
        (NOTIFY_EXPIRED, 'x'),
        (NOTIFY_EVICTED, 'e'),
    ]
    .iter()
    {
        if flags & bit != 0 {
            out.push(*letter);
        }
    }
    out
}

/// Publishes the event when its class is enabled: the keyspace channel
/// carries the event name, the keyevent channel carries the key.
pub fn notify_keyspace_event(srv: &mut Server, class: u32, event: &str, key: &[u8], db: usize) {
    if srv.notify_flags & class == 0 {
        return;
    }

    if srv.notify_flags & NOTIFY_KEYSPACE != 0 {
        let mut channel = format!("__keyspace@{}__:", db).into_bytes();
        channel.extend_from_slice(key);
        let message = Obj::new_string_raw(event.as_bytes().to_vec());
        pubsub::publish(srv, &channel, &message);
    }

    if srv.notify_flags & NOTIFY_KEYEVENT != 0 {
        let channel = format!("__keyevent@{}__:{}", db, event).into_bytes();
        let message = Obj::new_string_raw(key.to_vec());
        pubsub::publish(srv, &channel, &message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::codec::BincodeCodec;
    use crate::config::Config;
    use crate::logging;
    use crate::server::Server;

    #[test]
    fn test_parse_flags() {
        assert_eq!(parse_flags(""), Some(0));
        assert_eq!(parse_flags("K"), Some(NOTIFY_KEYSPACE));
        assert_eq!(parse_flags("KEA"), Some(NOTIFY_KEYSPACE | NOTIFY_KEYEVENT | NOTIFY_ALL));
        assert_eq!(parse_flags("gx"), Some(NOTIFY_GENERIC | NOTIFY_EXPIRED));
        assert_eq!(parse_flags("Q"), None);
    }

    #[test]
    fn test_format_flags_roundtrip() {
        for spec in &["", "K", "E", "KE", "Kg", "KEA", "gx"] {
            let flags = parse_flags(spec).unwrap();
            assert_eq!(parse_flags(&format_flags(flags)), Some(flags));
        }
        assert_eq!(format_flags(NOTIFY_KEYSPACE | NOTIFY_ALL), "KA");
    }

    #[test]
    fn test_events_reach_both_channels() {
        let mut srv = Server::new(
            Config::default(),
            logging::discard(),
            Vec::new(),
            Box::new(BincodeCodec),
        );
        srv.notify_flags = parse_flags("KEA").unwrap();

        let id = srv.clients.next_id();
        srv.clients.insert(Client::fake(id, 0));
        pubsub::subscribe_channel(&mut srv, id, b"__keyspace@0__:mykey");
        pubsub::subscribe_channel(&mut srv, id, b"__keyevent@0__:del");
        {
            let c = srv.clients.get_mut(id).unwrap();
            let mut sink = Vec::new();
            c.reply.flush_to(&mut sink, usize::max_value(), false).unwrap();
        }

        notify_keyspace_event(&mut srv, NOTIFY_GENERIC, "del", b"mykey", 0);

        let mut out = Vec::new();
        let c = srv.clients.get_mut(id).unwrap();
        c.reply.flush_to(&mut out, usize::max_value(), false).unwrap();
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("__keyspace@0__:mykey"));
        assert!(text.contains("__keyevent@0__:del"));
        assert!(text.contains("del"));
        assert!(text.contains("mykey"));
    }

    #[test]
    fn test_disabled_class_is_silent() {
        let mut srv = Server::new(
            Config::default(),
            logging::discard(),
            Vec::new(),
            Box::new(BincodeCodec),
        );
        srv.notify_flags = parse_flags("KE").unwrap() | NOTIFY_LIST;

        let id = srv.clients.next_id();
        srv.clients.insert(Client::fake(id, 0));
        pubsub::subscribe_channel(&mut srv, id, b"__keyevent@0__:del");
        {
            let c = srv.clients.get_mut(id).unwrap();
            let mut sink = Vec::new();
            c.reply.flush_to(&mut sink, usize::max_value(), false).unwrap();
        }

        notify_keyspace_event(&mut srv, NOTIFY_GENERIC, "del", b"mykey", 0);
        let c = srv.clients.get_mut(id).unwrap();
        assert!(!c.reply.has_pending());
    }
}
