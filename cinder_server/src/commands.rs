//! Data commands wired into the core dispatcher: strings, expiry, lists,
//! sets, hashes and sorted sets, with the compact-to-general encoding
//! upgrades applied at the configured thresholds.

use cinder_core::client::{Client, ClientId};
use cinder_core::notify::{
    self, NOTIFY_GENERIC, NOTIFY_HASH, NOTIFY_LIST, NOTIFY_SET, NOTIFY_STRING, NOTIFY_ZSET,
};
use cinder_core::object::ziplist::ZipList;
use cinder_core::object::{Obj, ObjType, Value};
use cinder_core::protocol::Shared;
use cinder_core::reactor::EventLoop;
use cinder_core::server::Server;
use cinder_core::util::{fmt_f64, string_to_f64, string_to_i64};

type El = EventLoop<Server>;

pub fn register_all(srv: &mut Server) {
    srv.register_command("ping", -1, ping_command);
    srv.register_command("echo", 2, echo_command);
    srv.register_command("select", 2, select_command);

    srv.register_command("set", -3, set_command);
    srv.register_command("get", 2, get_command);
    srv.register_command("del", -2, del_command);
    srv.register_command("exists", 2, exists_command);
    srv.register_command("type", 2, type_command);

    srv.register_command("expire", 3, expire_command);
    srv.register_command("pexpire", 3, pexpire_command);
    srv.register_command("ttl", 2, ttl_command);
    srv.register_command("pttl", 2, pttl_command);
    srv.register_command("persist", 2, persist_command);

    srv.register_command("lpush", -3, lpush_command);
    srv.register_command("rpush", -3, rpush_command);
    srv.register_command("lpop", 2, lpop_command);
    srv.register_command("rpop", 2, rpop_command);
    srv.register_command("llen", 2, llen_command);
    srv.register_command("lrange", 4, lrange_command);

    srv.register_command("sadd", -3, sadd_command);
    srv.register_command("srem", -3, srem_command);
    srv.register_command("sismember", 3, sismember_command);
    srv.register_command("scard", 2, scard_command);
    srv.register_command("smembers", 2, smembers_command);

    srv.register_command("hset", 4, hset_command);
    srv.register_command("hget", 3, hget_command);
    srv.register_command("hdel", -3, hdel_command);
    srv.register_command("hlen", 2, hlen_command);
    srv.register_command("hgetall", 2, hgetall_command);

    srv.register_command("zadd", -4, zadd_command);
    srv.register_command("zscore", 3, zscore_command);
    srv.register_command("zcard", 2, zcard_command);
    srv.register_command("zrange", -4, zrange_command);
}

fn with_client<F: FnOnce(&mut Client)>(srv: &mut Server, id: ClientId, f: F) {
    if let Some(c) = srv.clients.get_mut(id) {
        f(c);
    }
}

fn reply_wrongtype(srv: &mut Server, id: ClientId) {
    with_client(srv, id, |c| c.add_shared(Shared::WrongType));
}

/// Looks the key up and type-checks it. `Err` means a WRONGTYPE reply was
/// already sent.
fn lookup_typed(
    srv: &mut Server,
    id: ClientId,
    db: usize,
    key: &[u8],
    expected: ObjType,
) -> Result<Option<Obj>, ()> {
    match srv.db_lookup(db, key) {
        Some(value) => {
            if value.obj_type() == expected {
                Ok(Some(value))
            } else {
                reply_wrongtype(srv, id);
                Err(())
            }
        }
        None => Ok(None),
    }
}

fn client_db(srv: &Server, id: ClientId) -> usize {
    srv.clients.get(id).map_or(0, |c| c.db)
}

fn arg_bytes(srv: &Server, id: ClientId, index: usize) -> Vec<u8> {
    srv.clients
        .get(id)
        .map_or_else(Vec::new, |c| c.argv[index].string_to_vec())
}

fn argc(srv: &Server, id: ClientId) -> usize {
    srv.clients.get(id).map_or(0, |c| c.argv.len())
}

fn ping_command(_el: &mut El, srv: &mut Server, id: ClientId) {
    match argc(srv, id) {
        1 => with_client(srv, id, |c| c.add_shared(Shared::Pong)),
        2 => {
            let msg = arg_bytes(srv, id, 1);
            with_client(srv, id, |c| c.add_bulk_bytes(&msg));
        }
        _ => with_client(srv, id, |c| {
            c.add_error("wrong number of arguments for 'ping' command")
        }),
    }
}

fn echo_command(_el: &mut El, srv: &mut Server, id: ClientId) {
    let msg = arg_bytes(srv, id, 1);
    with_client(srv, id, |c| c.add_bulk_bytes(&msg));
}

fn select_command(_el: &mut El, srv: &mut Server, id: ClientId) {
    let dbid = srv
        .clients
        .get(id)
        .and_then(|c| c.argv[1].to_i64());
    match dbid {
        Some(n) if n >= 0 && (n as usize) < srv.dbs.len() => {
            with_client(srv, id, |c| {
                c.db = n as usize;
                c.add_shared(Shared::Ok);
            });
        }
        Some(_) => with_client(srv, id, |c| c.add_error("invalid DB index")),
        None => with_client(srv, id, |c| {
            c.add_error("invalid DB index")
        }),
    }
}

/// SET key value [EX seconds] [PX milliseconds] [NX|XX]
fn set_command(_el: &mut El, srv: &mut Server, id: ClientId) {
    let db = client_db(srv, id);
    let key = arg_bytes(srv, id, 1);

    let argv: Vec<Obj> = match srv.clients.get(id) {
        Some(c) => c.argv.clone(),
        None => return,
    };

    let mut nx = false;
    let mut xx = false;
    let mut expire_ms: Option<i64> = None;

    let mut i = 3;
    while i < argv.len() {
        let opt = argv[i].string_bytes(|b| b.to_ascii_lowercase());
        match opt.as_slice() {
            b"nx" => {
                nx = true;
                i += 1;
            }
            b"xx" => {
                xx = true;
                i += 1;
            }
            b"ex" | b"px" if i + 1 < argv.len() => {
                let unit_ms = opt.as_slice() == b"px";
                match argv[i + 1].to_i64() {
                    Some(n) => {
                        expire_ms = Some(if unit_ms { n } else { n.saturating_mul(1000) })
                    }
                    None => {
                        with_client(srv, id, |c| {
                            c.add_error("value is not an integer or out of range")
                        });
                        return;
                    }
                }
                i += 2;
            }
            _ => {
                with_client(srv, id, |c| c.add_error("syntax error"));
                return;
            }
        }
    }

    if let Some(ms) = expire_ms {
        if ms <= 0 {
            with_client(srv, id, |c| c.add_error("invalid expire time in SET"));
            return;
        }
    }

    let exists = srv.db_lookup(db, &key).is_some();
    if (nx && exists) || (xx && !exists) {
        with_client(srv, id, |c| c.add_nil());
        return;
    }

    // Detach the value from argv so the single-holder compaction can run,
    // then put the encoded handle back.
    let share = srv.share_integers();
    let value = match srv.clients.get_mut(id) {
        Some(c) => {
            let raw = std::mem::replace(&mut c.argv[2], Obj::new_string_raw(Vec::new()));
            let encoded = raw.try_encode(share);
            c.rewrite_command_argument(2, encoded.clone());
            encoded
        }
        None => return,
    };

    let now_ms = srv.unix_ms;
    if let Some(store) = srv.dbs.get_mut(db) {
        store.add(&key, value);
        if let Some(ms) = expire_ms {
            store.set_expire(&key, now_ms + ms as u64);
        }
    }
    notify::notify_keyspace_event(srv, NOTIFY_STRING, "set", &key, db);
    with_client(srv, id, |c| c.add_shared(Shared::Ok));
}

fn get_command(_el: &mut El, srv: &mut Server, id: ClientId) {
    let db = client_db(srv, id);
    let key = arg_bytes(srv, id, 1);
    match lookup_typed(srv, id, db, &key, ObjType::String) {
        Ok(Some(value)) => with_client(srv, id, |c| c.add_bulk_obj(&value)),
        Ok(None) => with_client(srv, id, |c| c.add_nil()),
        Err(()) => (),
    }
}

fn del_command(_el: &mut El, srv: &mut Server, id: ClientId) {
    let db = client_db(srv, id);
    let keys: Vec<Vec<u8>> = match srv.clients.get(id) {
        Some(c) => c.argv[1..].iter().map(|o| o.string_to_vec()).collect(),
        None => return,
    };

    let mut deleted = 0;
    for key in keys {
        let removed = srv.dbs.get_mut(db).map_or(false, |store| store.delete(&key));
        if removed {
            deleted += 1;
            notify::notify_keyspace_event(srv, NOTIFY_GENERIC, "del", &key, db);
        }
    }
    with_client(srv, id, |c| c.add_integer(deleted));
}

fn exists_command(_el: &mut El, srv: &mut Server, id: ClientId) {
    let db = client_db(srv, id);
    let key = arg_bytes(srv, id, 1);
    let exists = srv.db_lookup(db, &key).is_some();
    with_client(srv, id, |c| c.add_integer(if exists { 1 } else { 0 }));
}

fn type_command(_el: &mut El, srv: &mut Server, id: ClientId) {
    let db = client_db(srv, id);
    let key = arg_bytes(srv, id, 1);
    let name = srv.db_lookup(db, &key).map(|o| o.obj_type().name());
    with_client(srv, id, |c| c.add_status(name.unwrap_or("none")));
}

fn expire_generic(srv: &mut Server, id: ClientId, unit_ms: bool) {
    let db = client_db(srv, id);
    let key = arg_bytes(srv, id, 1);
    let ttl = match srv.clients.get(id).and_then(|c| c.argv[2].to_i64()) {
        Some(ttl) => ttl,
        None => {
            with_client(srv, id, |c| {
                c.add_error("value is not an integer or out of range")
            });
            return;
        }
    };

    if srv.db_lookup(db, &key).is_none() {
        with_client(srv, id, |c| c.add_integer(0));
        return;
    }

    let ttl_ms = if unit_ms { ttl } else { ttl.saturating_mul(1000) };
    let now_ms = srv.unix_ms;

    if ttl_ms <= 0 {
        if let Some(store) = srv.dbs.get_mut(db) {
            store.delete(&key);
        }
        notify::notify_keyspace_event(srv, NOTIFY_GENERIC, "del", &key, db);
    } else {
        if let Some(store) = srv.dbs.get_mut(db) {
            store.set_expire(&key, now_ms + ttl_ms as u64);
        }
        notify::notify_keyspace_event(srv, NOTIFY_GENERIC, "expire", &key, db);
    }
    with_client(srv, id, |c| c.add_integer(1));
}

fn expire_command(_el: &mut El, srv: &mut Server, id: ClientId) {
    expire_generic(srv, id, false);
}

fn pexpire_command(_el: &mut El, srv: &mut Server, id: ClientId) {
    expire_generic(srv, id, true);
}

fn ttl_generic(srv: &mut Server, id: ClientId, unit_ms: bool) {
    let db = client_db(srv, id);
    let key = arg_bytes(srv, id, 1);

    if srv.db_lookup(db, &key).is_none() {
        with_client(srv, id, |c| c.add_integer(-2));
        return;
    }
    let reply = match srv.dbs.get(db).and_then(|store| store.get_expire(&key)) {
        Some(at_ms) => {
            let left = at_ms.saturating_sub(srv.unix_ms) as i64;
            if unit_ms {
                left
            } else {
                (left + 500) / 1000
            }
        }
        None => -1,
    };
    with_client(srv, id, |c| c.add_integer(reply));
}

fn ttl_command(_el: &mut El, srv: &mut Server, id: ClientId) {
    ttl_generic(srv, id, false);
}

fn pttl_command(_el: &mut El, srv: &mut Server, id: ClientId) {
    ttl_generic(srv, id, true);
}

fn persist_command(_el: &mut El, srv: &mut Server, id: ClientId) {
    let db = client_db(srv, id);
    let key = arg_bytes(srv, id, 1);

    let removed = srv.db_lookup(db, &key).is_some()
        && srv
            .dbs
            .get_mut(db)
            .map_or(false, |store| store.remove_expire(&key));
    with_client(srv, id, |c| c.add_integer(if removed { 1 } else { 0 }));
}

fn push_generic(srv: &mut Server, id: ClientId, head: bool) {
    let db = client_db(srv, id);
    let key = arg_bytes(srv, id, 1);
    let values: Vec<Vec<u8>> = match srv.clients.get(id) {
        Some(c) => c.argv[2..].iter().map(|o| o.string_to_vec()).collect(),
        None => return,
    };

    let list = match lookup_typed(srv, id, db, &key, ObjType::List) {
        Ok(Some(list)) => list,
        Ok(None) => {
            let list = Obj::new_list_ziplist();
            if let Some(store) = srv.dbs.get_mut(db) {
                store.add(&key, list.clone());
            }
            list
        }
        Err(()) => return,
    };

    let enc = srv.config.encodings.clone();
    let mut new_len = 0;
    list.with_value_mut(|v| {
        for value in &values {
            if let Value::ListZip(zl) = v {
                if value.len() > enc.list_max_ziplist_value || zl.len() >= enc.list_max_ziplist_entries
                {
                    v.list_upgrade();
                }
            }
            match v {
                Value::ListZip(zl) => {
                    if head {
                        zl.push_head(value);
                    } else {
                        zl.push_tail(value);
                    }
                    new_len = zl.len();
                }
                Value::ListLinked(items) => {
                    if head {
                        items.push_front(value.clone());
                    } else {
                        items.push_back(value.clone());
                    }
                    new_len = items.len();
                }
                _ => unreachable!(),
            }
        }
    });

    let event = if head { "lpush" } else { "rpush" };
    notify::notify_keyspace_event(srv, NOTIFY_LIST, event, &key, db);
    with_client(srv, id, |c| c.add_integer(new_len as i64));
}

fn lpush_command(_el: &mut El, srv: &mut Server, id: ClientId) {
    push_generic(srv, id, true);
}

fn rpush_command(_el: &mut El, srv: &mut Server, id: ClientId) {
    push_generic(srv, id, false);
}

fn pop_generic(srv: &mut Server, id: ClientId, head: bool) {
    let db = client_db(srv, id);
    let key = arg_bytes(srv, id, 1);

    let list = match lookup_typed(srv, id, db, &key, ObjType::List) {
        Ok(Some(list)) => list,
        Ok(None) => {
            with_client(srv, id, |c| c.add_nil());
            return;
        }
        Err(()) => return,
    };

    let mut remaining = 0;
    let popped = list.with_value_mut(|v| match v {
        Value::ListZip(zl) => {
            let index = if head { 0 } else { zl.len().saturating_sub(1) };
            let out = zl.remove(index).map(|val| val.into_vec());
            remaining = zl.len();
            out
        }
        Value::ListLinked(items) => {
            let out = if head { items.pop_front() } else { items.pop_back() };
            remaining = items.len();
            out
        }
        _ => unreachable!(),
    });

    match popped {
        Some(value) => {
            let event = if head { "lpop" } else { "rpop" };
            notify::notify_keyspace_event(srv, NOTIFY_LIST, event, &key, db);
            if remaining == 0 {
                if let Some(store) = srv.dbs.get_mut(db) {
                    store.delete(&key);
                }
                notify::notify_keyspace_event(srv, NOTIFY_GENERIC, "del", &key, db);
            }
            with_client(srv, id, |c| c.add_bulk_bytes(&value));
        }
        None => with_client(srv, id, |c| c.add_nil()),
    }
}

fn lpop_command(_el: &mut El, srv: &mut Server, id: ClientId) {
    pop_generic(srv, id, true);
}

fn rpop_command(_el: &mut El, srv: &mut Server, id: ClientId) {
    pop_generic(srv, id, false);
}

fn llen_command(_el: &mut El, srv: &mut Server, id: ClientId) {
    let db = client_db(srv, id);
    let key = arg_bytes(srv, id, 1);
    match lookup_typed(srv, id, db, &key, ObjType::List) {
        Ok(Some(list)) => {
            let len = list.with_value(|v| match v {
                Value::ListZip(zl) => zl.len(),
                Value::ListLinked(items) => items.len(),
                _ => 0,
            });
            with_client(srv, id, |c| c.add_integer(len as i64));
        }
        Ok(None) => with_client(srv, id, |c| c.add_integer(0)),
        Err(()) => (),
    }
}

/// Resolves redis-style start/stop indexes against a length. None means the
/// range is empty.
fn resolve_range(mut start: i64, mut stop: i64, len: i64) -> Option<(usize, usize)> {
    if start < 0 {
        start += len;
    }
    if stop < 0 {
        stop += len;
    }
    if start < 0 {
        start = 0;
    }
    if start > stop || start >= len {
        return None;
    }
    if stop >= len {
        stop = len - 1;
    }
    Some((start as usize, stop as usize))
}

fn lrange_command(_el: &mut El, srv: &mut Server, id: ClientId) {
    let db = client_db(srv, id);
    let key = arg_bytes(srv, id, 1);
    let range = srv
        .clients
        .get(id)
        .map(|c| (c.argv[2].to_i64(), c.argv[3].to_i64()));
    let (start, stop) = match range {
        Some((Some(a), Some(b))) => (a, b),
        Some(_) => {
            with_client(srv, id, |c| {
                c.add_error("value is not an integer or out of range")
            });
            return;
        }
        None => return,
    };

    let list = match lookup_typed(srv, id, db, &key, ObjType::List) {
        Ok(Some(list)) => list,
        Ok(None) => {
            with_client(srv, id, |c| c.add_multibulk_len(0));
            return;
        }
        Err(()) => return,
    };

    let items: Vec<Vec<u8>> = list.with_value(|v| {
        let len = match v {
            Value::ListZip(zl) => zl.len(),
            Value::ListLinked(items) => items.len(),
            _ => 0,
        } as i64;
        match resolve_range(start, stop, len) {
            Some((from, to)) => match v {
                Value::ListZip(zl) => zl
                    .iter()
                    .skip(from)
                    .take(to - from + 1)
                    .map(|e| e.to_vec())
                    .collect(),
                Value::ListLinked(items) => items
                    .iter()
                    .skip(from)
                    .take(to - from + 1)
                    .cloned()
                    .collect(),
                _ => Vec::new(),
            },
            None => Vec::new(),
        }
    });

    with_client(srv, id, |c| {
        let deferred = c.defer_multibulk_len();
        let count = items.len();
        for item in &items {
            c.add_bulk_bytes(item);
        }
        c.set_deferred_multibulk_len(deferred, count);
    });
}

fn sadd_command(_el: &mut El, srv: &mut Server, id: ClientId) {
    let db = client_db(srv, id);
    let key = arg_bytes(srv, id, 1);
    let members: Vec<Vec<u8>> = match srv.clients.get(id) {
        Some(c) => c.argv[2..].iter().map(|o| o.string_to_vec()).collect(),
        None => return,
    };

    let set = match lookup_typed(srv, id, db, &key, ObjType::Set) {
        Ok(Some(set)) => set,
        Ok(None) => {
            let set = if string_to_i64(&members[0]).is_some() {
                Obj::new_set_intset()
            } else {
                Obj::new_set_ht()
            };
            if let Some(store) = srv.dbs.get_mut(db) {
                store.add(&key, set.clone());
            }
            set
        }
        Err(()) => return,
    };

    let max_intset = srv.config.encodings.set_max_intset_entries;
    let mut added = 0;
    set.with_value_mut(|v| {
        for member in &members {
            match v {
                Value::SetInt(ints) => match string_to_i64(member) {
                    Some(n) => {
                        if ints.insert(n) {
                            added += 1;
                        }
                        let too_big = ints.len() > max_intset;
                        if too_big {
                            v.set_upgrade();
                        }
                    }
                    None => {
                        v.set_upgrade();
                        if let Value::SetHt(ht) = v {
                            if ht.insert(member.clone()) {
                                added += 1;
                            }
                        }
                    }
                },
                Value::SetHt(ht) => {
                    if ht.insert(member.clone()) {
                        added += 1;
                    }
                }
                _ => unreachable!(),
            }
        }
    });

    if added > 0 {
        notify::notify_keyspace_event(srv, NOTIFY_SET, "sadd", &key, db);
    }
    with_client(srv, id, |c| c.add_integer(added));
}

fn srem_command(_el: &mut El, srv: &mut Server, id: ClientId) {
    let db = client_db(srv, id);
    let key = arg_bytes(srv, id, 1);
    let members: Vec<Vec<u8>> = match srv.clients.get(id) {
        Some(c) => c.argv[2..].iter().map(|o| o.string_to_vec()).collect(),
        None => return,
    };

    let set = match lookup_typed(srv, id, db, &key, ObjType::Set) {
        Ok(Some(set)) => set,
        Ok(None) => {
            with_client(srv, id, |c| c.add_integer(0));
            return;
        }
        Err(()) => return,
    };

    let mut removed = 0;
    let mut remaining = 0;
    set.with_value_mut(|v| {
        for member in &members {
            let gone = match v {
                Value::SetInt(ints) => match string_to_i64(member) {
                    Some(n) => ints.remove(n),
                    None => false,
                },
                Value::SetHt(ht) => ht.remove(member.as_slice()),
                _ => false,
            };
            if gone {
                removed += 1;
            }
        }
        remaining = match v {
            Value::SetInt(ints) => ints.len(),
            Value::SetHt(ht) => ht.len(),
            _ => 0,
        };
    });

    if removed > 0 {
        notify::notify_keyspace_event(srv, NOTIFY_SET, "srem", &key, db);
        if remaining == 0 {
            if let Some(store) = srv.dbs.get_mut(db) {
                store.delete(&key);
            }
            notify::notify_keyspace_event(srv, NOTIFY_GENERIC, "del", &key, db);
        }
    }
    with_client(srv, id, |c| c.add_integer(removed));
}

fn sismember_command(_el: &mut El, srv: &mut Server, id: ClientId) {
    let db = client_db(srv, id);
    let key = arg_bytes(srv, id, 1);
    let member = arg_bytes(srv, id, 2);

    match lookup_typed(srv, id, db, &key, ObjType::Set) {
        Ok(Some(set)) => {
            let found = set.with_value(|v| match v {
                Value::SetInt(ints) => {
                    string_to_i64(&member).map_or(false, |n| ints.contains(n))
                }
                Value::SetHt(ht) => ht.contains(member.as_slice()),
                _ => false,
            });
            with_client(srv, id, |c| c.add_integer(if found { 1 } else { 0 }));
        }
        Ok(None) => with_client(srv, id, |c| c.add_integer(0)),
        Err(()) => (),
    }
}

fn scard_command(_el: &mut El, srv: &mut Server, id: ClientId) {
    let db = client_db(srv, id);
    let key = arg_bytes(srv, id, 1);
    match lookup_typed(srv, id, db, &key, ObjType::Set) {
        Ok(Some(set)) => {
            let len = set.with_value(|v| match v {
                Value::SetInt(ints) => ints.len(),
                Value::SetHt(ht) => ht.len(),
                _ => 0,
            });
            with_client(srv, id, |c| c.add_integer(len as i64));
        }
        Ok(None) => with_client(srv, id, |c| c.add_integer(0)),
        Err(()) => (),
    }
}

fn smembers_command(_el: &mut El, srv: &mut Server, id: ClientId) {
    let db = client_db(srv, id);
    let key = arg_bytes(srv, id, 1);

    let members: Vec<Vec<u8>> = match lookup_typed(srv, id, db, &key, ObjType::Set) {
        Ok(Some(set)) => set.with_value(|v| match v {
            Value::SetInt(ints) => ints
                .iter()
                .map(|n| cinder_core::util::IntBuf::format(n).as_bytes().to_vec())
                .collect(),
            Value::SetHt(ht) => ht.iter().cloned().collect(),
            _ => Vec::new(),
        }),
        Ok(None) => Vec::new(),
        Err(()) => return,
    };

    with_client(srv, id, |c| {
        let deferred = c.defer_multibulk_len();
        let count = members.len();
        for member in &members {
            c.add_bulk_bytes(member);
        }
        c.set_deferred_multibulk_len(deferred, count);
    });
}

fn hash_ziplist_find(zl: &ZipList, field: &[u8]) -> Option<usize> {
    let mut index = 0;
    let mut it = zl.iter();
    while let (Some(f), Some(_)) = (it.next(), it.next()) {
        if f.matches(field) {
            return Some(index);
        }
        index += 1;
    }
    None
}

fn hset_command(_el: &mut El, srv: &mut Server, id: ClientId) {
    let db = client_db(srv, id);
    let key = arg_bytes(srv, id, 1);
    let field = arg_bytes(srv, id, 2);
    let value = arg_bytes(srv, id, 3);

    let hash = match lookup_typed(srv, id, db, &key, ObjType::Hash) {
        Ok(Some(hash)) => hash,
        Ok(None) => {
            let hash = Obj::new_hash_ziplist();
            if let Some(store) = srv.dbs.get_mut(db) {
                store.add(&key, hash.clone());
            }
            hash
        }
        Err(()) => return,
    };

    let enc = srv.config.encodings.clone();
    let mut created = false;
    hash.with_value_mut(|v| {
        if let Value::HashZip(zl) = v {
            let oversized = field.len() > enc.hash_max_ziplist_value
                || value.len() > enc.hash_max_ziplist_value
                || zl.len() / 2 >= enc.hash_max_ziplist_entries;
            if oversized {
                v.hash_upgrade();
            }
        }
        match v {
            Value::HashZip(zl) => match hash_ziplist_find(zl, &field) {
                Some(pair) => {
                    zl.remove(2 * pair);
                    zl.remove(2 * pair);
                    zl.push_tail(&field);
                    zl.push_tail(&value);
                }
                None => {
                    zl.push_tail(&field);
                    zl.push_tail(&value);
                    created = true;
                }
            },
            Value::HashHt(map) => {
                created = map.insert(field.clone(), value.clone()).is_none();
            }
            _ => unreachable!(),
        }
    });

    notify::notify_keyspace_event(srv, NOTIFY_HASH, "hset", &key, db);
    with_client(srv, id, |c| c.add_integer(if created { 1 } else { 0 }));
}

fn hget_command(_el: &mut El, srv: &mut Server, id: ClientId) {
    let db = client_db(srv, id);
    let key = arg_bytes(srv, id, 1);
    let field = arg_bytes(srv, id, 2);

    let found: Option<Vec<u8>> = match lookup_typed(srv, id, db, &key, ObjType::Hash) {
        Ok(Some(hash)) => hash.with_value(|v| match v {
            Value::HashZip(zl) => hash_ziplist_find(zl, &field).and_then(|pair| {
                zl.get(2 * pair + 1).map(|e| e.to_vec())
            }),
            Value::HashHt(map) => map.get(field.as_slice()).cloned(),
            _ => None,
        }),
        Ok(None) => None,
        Err(()) => return,
    };

    match found {
        Some(value) => with_client(srv, id, |c| c.add_bulk_bytes(&value)),
        None => with_client(srv, id, |c| c.add_nil()),
    }
}

fn hdel_command(_el: &mut El, srv: &mut Server, id: ClientId) {
    let db = client_db(srv, id);
    let key = arg_bytes(srv, id, 1);
    let fields: Vec<Vec<u8>> = match srv.clients.get(id) {
        Some(c) => c.argv[2..].iter().map(|o| o.string_to_vec()).collect(),
        None => return,
    };

    let hash = match lookup_typed(srv, id, db, &key, ObjType::Hash) {
        Ok(Some(hash)) => hash,
        Ok(None) => {
            with_client(srv, id, |c| c.add_integer(0));
            return;
        }
        Err(()) => return,
    };

    let mut removed = 0;
    let mut remaining = 0;
    hash.with_value_mut(|v| {
        for field in &fields {
            let gone = match v {
                Value::HashZip(zl) => match hash_ziplist_find(zl, field) {
                    Some(pair) => {
                        zl.remove(2 * pair);
                        zl.remove(2 * pair);
                        true
                    }
                    None => false,
                },
                Value::HashHt(map) => map.remove(field.as_slice()).is_some(),
                _ => false,
            };
            if gone {
                removed += 1;
            }
        }
        remaining = match v {
            Value::HashZip(zl) => zl.len() / 2,
            Value::HashHt(map) => map.len(),
            _ => 0,
        };
    });

    if removed > 0 {
        notify::notify_keyspace_event(srv, NOTIFY_HASH, "hdel", &key, db);
        if remaining == 0 {
            if let Some(store) = srv.dbs.get_mut(db) {
                store.delete(&key);
            }
            notify::notify_keyspace_event(srv, NOTIFY_GENERIC, "del", &key, db);
        }
    }
    with_client(srv, id, |c| c.add_integer(removed));
}

fn hlen_command(_el: &mut El, srv: &mut Server, id: ClientId) {
    let db = client_db(srv, id);
    let key = arg_bytes(srv, id, 1);
    match lookup_typed(srv, id, db, &key, ObjType::Hash) {
        Ok(Some(hash)) => {
            let len = hash.with_value(|v| match v {
                Value::HashZip(zl) => zl.len() / 2,
                Value::HashHt(map) => map.len(),
                _ => 0,
            });
            with_client(srv, id, |c| c.add_integer(len as i64));
        }
        Ok(None) => with_client(srv, id, |c| c.add_integer(0)),
        Err(()) => (),
    }
}

fn hgetall_command(_el: &mut El, srv: &mut Server, id: ClientId) {
    let db = client_db(srv, id);
    let key = arg_bytes(srv, id, 1);

    let pairs: Vec<Vec<u8>> = match lookup_typed(srv, id, db, &key, ObjType::Hash) {
        Ok(Some(hash)) => hash.with_value(|v| match v {
            Value::HashZip(zl) => zl.iter().map(|e| e.to_vec()).collect(),
            Value::HashHt(map) => {
                let mut out = Vec::with_capacity(map.len() * 2);
                for (field, value) in map.iter() {
                    out.push(field.clone());
                    out.push(value.clone());
                }
                out
            }
            _ => Vec::new(),
        }),
        Ok(None) => Vec::new(),
        Err(()) => return,
    };

    with_client(srv, id, |c| {
        let deferred = c.defer_multibulk_len();
        let count = pairs.len();
        for item in &pairs {
            c.add_bulk_bytes(item);
        }
        c.set_deferred_multibulk_len(deferred, count);
    });
}

fn zip_zset_pairs(zl: &ZipList) -> Vec<(Vec<u8>, f64)> {
    let mut out = Vec::with_capacity(zl.len() / 2);
    let mut it = zl.iter();
    while let (Some(member), Some(score)) = (it.next(), it.next()) {
        let score = string_to_f64(&score.to_vec()).unwrap_or(0.0);
        out.push((member.to_vec(), score));
    }
    out
}

/// Inserts or updates a member in a ziplist-encoded sorted set, keeping
/// (score, member) order. Returns true for a brand new member.
fn zip_zset_insert(zl: &mut ZipList, member: &[u8], score: f64) -> bool {
    let mut pairs = zip_zset_pairs(zl);
    let mut existed = false;
    if let Some(pos) = pairs.iter().position(|(m, _)| m.as_slice() == member) {
        if pairs[pos].1 == score {
            return false;
        }
        pairs.remove(pos);
        existed = true;
    }

    let insert_at = pairs
        .iter()
        .position(|(m, s)| {
            score < *s || (score == *s && member < m.as_slice())
        })
        .unwrap_or_else(|| pairs.len());
    pairs.insert(insert_at, (member.to_vec(), score));

    *zl = ZipList::new();
    for (m, s) in &pairs {
        zl.push_tail(m);
        zl.push_tail(fmt_f64(*s).as_bytes());
    }
    !existed
}

fn zadd_command(_el: &mut El, srv: &mut Server, id: ClientId) {
    let db = client_db(srv, id);
    let key = arg_bytes(srv, id, 1);

    let argv: Vec<Obj> = match srv.clients.get(id) {
        Some(c) => c.argv.clone(),
        None => return,
    };
    if (argv.len() - 2) % 2 != 0 {
        with_client(srv, id, |c| c.add_error("syntax error"));
        return;
    }

    let mut pairs: Vec<(f64, Vec<u8>)> = Vec::with_capacity((argv.len() - 2) / 2);
    let mut i = 2;
    while i < argv.len() {
        let score = match argv[i].to_f64() {
            Some(score) => score,
            None => {
                with_client(srv, id, |c| c.add_error("value is not a valid float"));
                return;
            }
        };
        pairs.push((score, argv[i + 1].string_to_vec()));
        i += 2;
    }

    let zset = match lookup_typed(srv, id, db, &key, ObjType::ZSet) {
        Ok(Some(zset)) => zset,
        Ok(None) => {
            let zset = Obj::new_zset_ziplist();
            if let Some(store) = srv.dbs.get_mut(db) {
                store.add(&key, zset.clone());
            }
            zset
        }
        Err(()) => return,
    };

    let enc = srv.config.encodings.clone();
    let mut added = 0;
    zset.with_value_mut(|v| {
        for (score, member) in &pairs {
            if let Value::ZSetZip(zl) = v {
                if member.len() > enc.zset_max_ziplist_value
                    || zl.len() / 2 >= enc.zset_max_ziplist_entries
                {
                    v.zset_upgrade();
                }
            }
            match v {
                Value::ZSetZip(zl) => {
                    if zip_zset_insert(zl, member, *score) {
                        added += 1;
                    }
                }
                Value::ZSetSkip(set) => {
                    if set.insert(member, *score) {
                        added += 1;
                    }
                }
                _ => unreachable!(),
            }
        }
    });

    notify::notify_keyspace_event(srv, NOTIFY_ZSET, "zadd", &key, db);
    with_client(srv, id, |c| c.add_integer(added));
}

fn zscore_command(_el: &mut El, srv: &mut Server, id: ClientId) {
    let db = client_db(srv, id);
    let key = arg_bytes(srv, id, 1);
    let member = arg_bytes(srv, id, 2);

    let score: Option<f64> = match lookup_typed(srv, id, db, &key, ObjType::ZSet) {
        Ok(Some(zset)) => zset.with_value(|v| match v {
            Value::ZSetZip(zl) => zip_zset_pairs(zl)
                .into_iter()
                .find(|(m, _)| m.as_slice() == member.as_slice())
                .map(|(_, s)| s),
            Value::ZSetSkip(set) => set.score(&member),
            _ => None,
        }),
        Ok(None) => None,
        Err(()) => return,
    };

    match score {
        Some(score) => with_client(srv, id, |c| c.add_double(score)),
        None => with_client(srv, id, |c| c.add_nil()),
    }
}

fn zcard_command(_el: &mut El, srv: &mut Server, id: ClientId) {
    let db = client_db(srv, id);
    let key = arg_bytes(srv, id, 1);
    match lookup_typed(srv, id, db, &key, ObjType::ZSet) {
        Ok(Some(zset)) => {
            let len = zset.with_value(|v| match v {
                Value::ZSetZip(zl) => zl.len() / 2,
                Value::ZSetSkip(set) => set.len(),
                _ => 0,
            });
            with_client(srv, id, |c| c.add_integer(len as i64));
        }
        Ok(None) => with_client(srv, id, |c| c.add_integer(0)),
        Err(()) => (),
    }
}

fn zrange_command(_el: &mut El, srv: &mut Server, id: ClientId) {
    let db = client_db(srv, id);
    let key = arg_bytes(srv, id, 1);

    let argv: Vec<Obj> = match srv.clients.get(id) {
        Some(c) => c.argv.clone(),
        None => return,
    };
    if argv.len() > 5 {
        with_client(srv, id, |c| c.add_error("syntax error"));
        return;
    }
    let withscores = match argv.get(4) {
        Some(arg) => {
            let flag = arg.string_bytes(|b| b.to_ascii_lowercase());
            if flag != b"withscores" {
                with_client(srv, id, |c| c.add_error("syntax error"));
                return;
            }
            true
        }
        None => false,
    };
    let (start, stop) = match (argv[2].to_i64(), argv[3].to_i64()) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            with_client(srv, id, |c| {
                c.add_error("value is not an integer or out of range")
            });
            return;
        }
    };

    let pairs: Vec<(Vec<u8>, f64)> = match lookup_typed(srv, id, db, &key, ObjType::ZSet) {
        Ok(Some(zset)) => zset.with_value(|v| match v {
            Value::ZSetZip(zl) => zip_zset_pairs(zl),
            Value::ZSetSkip(set) => set.iter().map(|(m, s)| (m.to_vec(), s)).collect(),
            _ => Vec::new(),
        }),
        Ok(None) => Vec::new(),
        Err(()) => return,
    };

    let window: Vec<(Vec<u8>, f64)> = match resolve_range(start, stop, pairs.len() as i64) {
        Some((from, to)) => pairs[from..=to].to_vec(),
        None => Vec::new(),
    };

    with_client(srv, id, |c| {
        let count = window.len() * if withscores { 2 } else { 1 };
        c.add_multibulk_len(count);
        for (member, score) in &window {
            c.add_bulk_bytes(member);
            if withscores {
                c.add_bulk_bytes(fmt_f64(*score).as_bytes());
            }
        }
    });
}
