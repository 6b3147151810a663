//! DUMP payload creation and verification, plus the DUMP / RESTORE /
//! MIGRATE command surface. A payload is the codec-serialized object
//! followed by a two byte LE format version and an eight byte LE CRC64 over
//! everything before it.

use crate::client::ClientId;
use crate::crc64::crc64;
use crate::keyspace::{CodecError, ObjectCodec};
use crate::logging;
use crate::netio;
use crate::object::Obj;
use crate::protocol::Shared;
use crate::reactor::EventLoop;
use crate::server::Server;
use crate::util::IntBuf;
use byteorder::{ByteOrder, LittleEndian};
use std::time::{Duration, Instant};

pub const PAYLOAD_VERSION: u16 = 6;

const FOOTER_LEN: usize = 10;

pub fn create_payload(codec: &dyn ObjectCodec, value: &Obj) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    codec.save_object_type(&mut out, value);
    codec.save_object(&mut out, value)?;

    let mut version = [0u8; 2];
    LittleEndian::write_u16(&mut version, PAYLOAD_VERSION);
    out.extend_from_slice(&version);

    let mut crc = [0u8; 8];
    LittleEndian::write_u64(&mut crc, crc64(0, &out));
    out.extend_from_slice(&crc);
    Ok(out)
}

/// Footer check: length, format version, checksum over everything before
/// the trailing CRC.
pub fn verify_payload(payload: &[u8]) -> bool {
    if payload.len() < FOOTER_LEN {
        return false;
    }
    let footer = &payload[payload.len() - FOOTER_LEN..];
    if LittleEndian::read_u16(&footer[..2]) != PAYLOAD_VERSION {
        return false;
    }
    let expected = LittleEndian::read_u64(&footer[2..]);
    crc64(0, &payload[..payload.len() - 8]) == expected
}

/// DUMP key
pub fn dump_command(_el: &mut EventLoop<Server>, srv: &mut Server, id: ClientId) {
    let (db, key) = match srv.clients.get(id) {
        Some(c) => (c.db, c.argv[1].string_to_vec()),
        None => return,
    };

    let value = match srv.db_lookup(db, &key) {
        Some(value) => value,
        None => {
            if let Some(c) = srv.clients.get_mut(id) {
                c.add_nil();
            }
            return;
        }
    };

    match create_payload(&*srv.codec, &value) {
        Ok(payload) => {
            if let Some(c) = srv.clients.get_mut(id) {
                c.add_bulk_bytes(&payload);
            }
        }
        Err(e) => {
            logging::warn!(srv.log, "error serializing dump payload"; "error" => %e);
            if let Some(c) = srv.clients.get_mut(id) {
                c.add_error("error serializing object");
            }
        }
    }
}

/// RESTORE key ttl serialized-value
pub fn restore_command(_el: &mut EventLoop<Server>, srv: &mut Server, id: ClientId) {
    let (db, key, ttl_arg, payload) = match srv.clients.get(id) {
        Some(c) => (
            c.db,
            c.argv[1].string_to_vec(),
            c.argv[2].clone(),
            c.argv[3].string_to_vec(),
        ),
        None => return,
    };
    let now_ms = srv.unix_ms;

    if srv.db_lookup(db, &key).is_some() {
        if let Some(c) = srv.clients.get_mut(id) {
            c.add_error_full("BUSYKEY Target key name already exists.");
        }
        return;
    }

    let ttl = match ttl_arg.to_i64() {
        Some(ttl) if ttl >= 0 => ttl,
        Some(_) => {
            if let Some(c) = srv.clients.get_mut(id) {
                c.add_error("Invalid TTL value, must be >= 0");
            }
            return;
        }
        None => {
            if let Some(c) = srv.clients.get_mut(id) {
                c.add_error("value is not an integer or out of range");
            }
            return;
        }
    };

    if !verify_payload(&payload) {
        if let Some(c) = srv.clients.get_mut(id) {
            c.add_error("DUMP payload version or checksum are wrong");
        }
        return;
    }

    let share = srv.share_integers();
    let loaded = srv
        .codec
        .load_object_type(&payload)
        .and_then(|type_code| {
            let body = &payload[1..payload.len() - FOOTER_LEN];
            srv.codec
                .load_object(type_code, body, &srv.config.encodings, share)
        });

    let value = match loaded {
        Ok(value) => value,
        Err(_) => {
            if let Some(c) = srv.clients.get_mut(id) {
                c.add_error("Bad data format");
            }
            return;
        }
    };

    if let Some(store) = srv.dbs.get_mut(db) {
        store.add(&key, value);
        if ttl > 0 {
            store.set_expire(&key, now_ms + ttl as u64);
        }
    }
    if let Some(c) = srv.clients.get_mut(id) {
        c.add_shared(Shared::Ok);
    }
}

fn write_bulk_count(out: &mut Vec<u8>, prefix: u8, count: usize) {
    out.push(prefix);
    out.extend_from_slice(IntBuf::format(count as i64).as_bytes());
    out.extend_from_slice(b"\r\n");
}

fn write_bulk_bytes(out: &mut Vec<u8>, payload: &[u8]) {
    write_bulk_count(out, b'$', payload.len());
    out.extend_from_slice(payload);
    out.extend_from_slice(b"\r\n");
}

fn write_bulk_i64(out: &mut Vec<u8>, value: i64) {
    write_bulk_bytes(out, IntBuf::format(value).as_bytes());
}

/// MIGRATE host port key dbid timeout
///
/// Emits `SELECT dbid` then `RESTORE key ttl payload` to the target over a
/// synchronous deadline connection, deletes the key locally on success and
/// rewrites itself into `DEL key` for replication propagation.
pub fn migrate_command(_el: &mut EventLoop<Server>, srv: &mut Server, id: ClientId) {
    let argv: Vec<Obj> = match srv.clients.get(id) {
        Some(c) => c.argv.clone(),
        None => return,
    };
    let db = match srv.clients.get(id) {
        Some(c) => c.db,
        None => return,
    };

    let host = String::from_utf8_lossy(&argv[1].string_to_vec()).to_string();
    let port = match argv[2].to_i64() {
        Some(p) if p > 0 && p <= u16::max_value() as i64 => p as u16,
        _ => {
            if let Some(c) = srv.clients.get_mut(id) {
                c.add_error("value is not an integer or out of range");
            }
            return;
        }
    };
    let key = argv[3].string_to_vec();
    let dbid = match argv[4].to_i64() {
        Some(d) if d >= 0 => d,
        _ => {
            if let Some(c) = srv.clients.get_mut(id) {
                c.add_error("value is not an integer or out of range");
            }
            return;
        }
    };
    let mut timeout_ms = match argv[5].to_i64() {
        Some(t) => t,
        None => {
            if let Some(c) = srv.clients.get_mut(id) {
                c.add_error("timeout is not an integer or out of range");
            }
            return;
        }
    };
    if timeout_ms <= 0 {
        timeout_ms = 1;
    }

    // A missing key is a success with a marker; it may simply have expired.
    let value = match srv.db_lookup(db, &key) {
        Some(value) => value,
        None => {
            if let Some(c) = srv.clients.get_mut(id) {
                c.add_status("NOKEY");
            }
            return;
        }
    };

    let payload = match create_payload(&*srv.codec, &value) {
        Ok(payload) => payload,
        Err(e) => {
            logging::warn!(srv.log, "error serializing migrate payload"; "error" => %e);
            if let Some(c) = srv.clients.get_mut(id) {
                c.add_error("error serializing object");
            }
            return;
        }
    };

    let ttl = match srv.dbs.get(db).and_then(|store| store.get_expire(&key)) {
        Some(at_ms) => (at_ms.saturating_sub(srv.unix_ms)).max(1) as i64,
        None => 0,
    };

    let mut cmd = Vec::with_capacity(payload.len() + key.len() + 64);
    write_bulk_count(&mut cmd, b'*', 2);
    write_bulk_bytes(&mut cmd, b"SELECT");
    write_bulk_i64(&mut cmd, dbid);
    write_bulk_count(&mut cmd, b'*', 4);
    write_bulk_bytes(&mut cmd, b"RESTORE");
    write_bulk_bytes(&mut cmd, &key);
    write_bulk_i64(&mut cmd, ttl);
    write_bulk_bytes(&mut cmd, &payload);

    let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
    let mut stream = match netio::connect_deadline(&host, port, deadline) {
        Ok(stream) => stream,
        Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {
            if let Some(c) = srv.clients.get_mut(id) {
                c.add_error_full("IOERR error or timeout connecting to the client");
            }
            return;
        }
        Err(e) => {
            let text = format!("Can't connect to target node: {}", e);
            if let Some(c) = srv.clients.get_mut(id) {
                c.add_error(&text);
            }
            return;
        }
    };

    if netio::write_deadline(&mut stream, &cmd, deadline).is_err() {
        if let Some(c) = srv.clients.get_mut(id) {
            c.add_error_full("IOERR error or timeout writing to target instance");
        }
        return;
    }

    let select_reply = netio::read_line_deadline(&mut stream, deadline);
    let restore_reply = select_reply
        .as_ref()
        .ok()
        .map(|_| netio::read_line_deadline(&mut stream, deadline));

    let (select_reply, restore_reply) = match (select_reply, restore_reply) {
        (Ok(first), Some(Ok(second))) => (first, second),
        _ => {
            if let Some(c) = srv.clients.get_mut(id) {
                c.add_error_full("IOERR error or timeout reading from target node");
            }
            return;
        }
    };

    let failed = [&select_reply, &restore_reply]
        .iter()
        .find(|line| line.first() == Some(&b'-'))
        .map(|line| String::from_utf8_lossy(&line[1..]).to_string());

    if let Some(error) = failed {
        let text = format!("Target instance replied with error: {}", error);
        if let Some(c) = srv.clients.get_mut(id) {
            c.add_error(&text);
        }
        return;
    }

    if let Some(store) = srv.dbs.get_mut(db) {
        store.delete(&key);
    }
    logging::debug!(srv.log, "key migrated to target instance";
                    "key" => %String::from_utf8_lossy(&key), "target" => %host, "port" => port);

    if let Some(c) = srv.clients.get_mut(id) {
        c.add_shared(Shared::Ok);
        let key_obj = argv[3].clone();
        c.rewrite_command_vector(vec![Obj::new_string_raw(b"DEL".to_vec()), key_obj]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BincodeCodec;

    #[test]
    fn test_payload_roundtrip_verifies() {
        let codec = BincodeCodec;
        for value in vec![
            Obj::new_string_raw(b"hello".to_vec()),
            Obj::new_string_raw(Vec::new()),
            Obj::new_string_int(42, false),
        ] {
            let payload = create_payload(&codec, &value).unwrap();
            assert!(verify_payload(&payload));
        }
    }

    #[test]
    fn test_corrupt_payload_rejected() {
        let codec = BincodeCodec;
        let mut payload =
            create_payload(&codec, &Obj::new_string_raw(b"data".to_vec())).unwrap();

        let last = payload.len() - 1;
        payload[last] ^= 0xFF;
        assert!(!verify_payload(&payload));
    }

    #[test]
    fn test_truncated_payload_rejected() {
        assert!(!verify_payload(b""));
        assert!(!verify_payload(b"123456789"));
    }

    #[test]
    fn test_wrong_version_rejected() {
        let codec = BincodeCodec;
        let mut payload =
            create_payload(&codec, &Obj::new_string_raw(b"data".to_vec())).unwrap();

        let version_at = payload.len() - FOOTER_LEN;
        payload[version_at] = PAYLOAD_VERSION as u8 + 1;
        // Fix the CRC so only the version mismatches.
        let crc_at = payload.len() - 8;
        let crc = crc64(0, &payload[..crc_at]);
        let mut word = [0u8; 8];
        LittleEndian::write_u64(&mut word, crc);
        payload[crc_at..].copy_from_slice(&word);

        assert!(!verify_payload(&payload));
    }

    #[test]
    fn test_resp_command_encoding() {
        let mut out = Vec::new();
        write_bulk_count(&mut out, b'*', 2);
        write_bulk_bytes(&mut out, b"SELECT");
        write_bulk_i64(&mut out, 5);
        assert_eq!(out, b"*2\r\n$6\r\nSELECT\r\n$1\r\n5\r\n".to_vec());
    }
}
