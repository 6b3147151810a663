//! Channel and glob-pattern subscription routing. The server keeps the
//! authoritative maps; every client mirrors its own subscriptions so
//! teardown and introspection stay cheap.
//!
//! Within one publish, exact-channel subscribers always see the message
//! before pattern subscribers, each group in subscription order.

use crate::client::{Client, ClientId};
use crate::glob::glob_match;
use crate::object::Obj;
use crate::reactor::EventLoop;
use crate::server::Server;
use hashbrown::HashMap;
use indexmap::IndexSet;

pub struct PubSubState {
    pub channels: HashMap<Vec<u8>, IndexSet<ClientId>>,
    pub patterns: Vec<(ClientId, Vec<u8>)>,
}

impl PubSubState {
    pub fn new() -> PubSubState {
        PubSubState { channels: HashMap::new(), patterns: Vec::new() }
    }

    #[inline]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    #[inline]
    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }
}

impl Default for PubSubState {
    fn default() -> PubSubState {
        PubSubState::new()
    }
}

/// Subscribes the client, replying with the confirmation triple. Returns
/// true when the channel was newly added for this client.
pub fn subscribe_channel(srv: &mut Server, id: ClientId, channel: &[u8]) -> bool {
    let Server { pubsub, clients, .. } = srv;
    let c = match clients.get_mut(id) {
        Some(c) => c,
        None => return false,
    };

    let added = c.channels.insert(channel.to_vec());
    if added {
        pubsub
            .channels
            .entry(channel.to_vec())
            .or_insert_with(IndexSet::new)
            .insert(id);
    }

    c.add_multibulk_len(3);
    c.add_bulk_bytes(b"subscribe");
    c.add_bulk_bytes(channel);
    c.add_integer(c.subscription_count() as i64);
    added
}

/// Unsubscribes the client from one channel, pruning the server-side entry
/// when its last subscriber leaves.
pub fn unsubscribe_channel(srv: &mut Server, id: ClientId, channel: &[u8], notify: bool) -> bool {
    let Server { pubsub, clients, .. } = srv;
    let c = match clients.get_mut(id) {
        Some(c) => c,
        None => return false,
    };

    let removed = c.channels.remove(channel);
    if removed {
        let now_empty = match pubsub.channels.get_mut(channel) {
            Some(subscribers) => {
                subscribers.shift_remove(&id);
                subscribers.is_empty()
            }
            None => false,
        };
        if now_empty {
            pubsub.channels.remove(channel);
        }
    }

    if notify {
        c.add_multibulk_len(3);
        c.add_bulk_bytes(b"unsubscribe");
        c.add_bulk_bytes(channel);
        c.add_integer(c.subscription_count() as i64);
    }
    removed
}

pub fn subscribe_pattern(srv: &mut Server, id: ClientId, pattern: &[u8]) -> bool {
    let Server { pubsub, clients, .. } = srv;
    let c = match clients.get_mut(id) {
        Some(c) => c,
        None => return false,
    };

    let added = !c.patterns.iter().any(|p| p == pattern);
    if added {
        c.patterns.push(pattern.to_vec());
        pubsub.patterns.push((id, pattern.to_vec()));
    }

    c.add_multibulk_len(3);
    c.add_bulk_bytes(b"psubscribe");
    c.add_bulk_bytes(pattern);
    c.add_integer(c.subscription_count() as i64);
    added
}

pub fn unsubscribe_pattern(srv: &mut Server, id: ClientId, pattern: &[u8], notify: bool) -> bool {
    let Server { pubsub, clients, .. } = srv;
    let c = match clients.get_mut(id) {
        Some(c) => c,
        None => return false,
    };

    let removed = match c.patterns.iter().position(|p| p == pattern) {
        Some(pos) => {
            c.patterns.remove(pos);
            pubsub
                .patterns
                .retain(|(cid, p)| !(*cid == id && p == pattern));
            true
        }
        None => false,
    };

    if notify {
        c.add_multibulk_len(3);
        c.add_bulk_bytes(b"punsubscribe");
        c.add_bulk_bytes(pattern);
        c.add_integer(c.subscription_count() as i64);
    }
    removed
}

/// Drops every channel subscription. With `notify`, the client always gets
/// a response, a nil channel when it had none.
pub fn unsubscribe_all_channels(srv: &mut Server, id: ClientId, notify: bool) -> usize {
    let channels: Vec<Vec<u8>> = match srv.clients.get(id) {
        Some(c) => c.channels.iter().cloned().collect(),
        None => return 0,
    };

    let count = channels.len();
    for channel in channels {
        unsubscribe_channel(srv, id, &channel, notify);
    }

    if count == 0 && notify {
        if let Some(c) = srv.clients.get_mut(id) {
            c.add_multibulk_len(3);
            c.add_bulk_bytes(b"unsubscribe");
            c.add_nil();
            c.add_integer(c.subscription_count() as i64);
        }
    }
    count
}

pub fn unsubscribe_all_patterns(srv: &mut Server, id: ClientId, notify: bool) -> usize {
    let patterns: Vec<Vec<u8>> = match srv.clients.get(id) {
        Some(c) => c.patterns.clone(),
        None => return 0,
    };

    let count = patterns.len();
    for pattern in patterns {
        unsubscribe_pattern(srv, id, &pattern, notify);
    }

    if count == 0 && notify {
        if let Some(c) = srv.clients.get_mut(id) {
            c.add_multibulk_len(3);
            c.add_bulk_bytes(b"punsubscribe");
            c.add_nil();
            c.add_integer(c.subscription_count() as i64);
        }
    }
    count
}

/// Server-side cleanup for a client that is already out of the registry.
pub fn drop_subscriptions(srv: &mut Server, id: ClientId, client: &Client) {
    for channel in &client.channels {
        let now_empty = match srv.pubsub.channels.get_mut(channel.as_slice()) {
            Some(subscribers) => {
                subscribers.shift_remove(&id);
                subscribers.is_empty()
            }
            None => false,
        };
        if now_empty {
            srv.pubsub.channels.remove(channel.as_slice());
        }
    }
    srv.pubsub.patterns.retain(|(cid, _)| *cid != id);
}

/// Pushes the message into every subscriber's output buffer. Returns the
/// number of receivers; bytes are staged before this returns, the actual
/// socket writes happen later.
pub fn publish(srv: &mut Server, channel: &[u8], message: &Obj) -> usize {
    let mut touched: Vec<ClientId> = Vec::new();
    {
        let Server { pubsub, clients, .. } = srv;

        if let Some(subscribers) = pubsub.channels.get(channel) {
            for &cid in subscribers.iter() {
                if let Some(c) = clients.get_mut(cid) {
                    c.add_multibulk_len(3);
                    c.add_bulk_bytes(b"message");
                    c.add_bulk_bytes(channel);
                    c.add_bulk_obj(message);
                    touched.push(cid);
                }
            }
        }

        for (cid, pattern) in pubsub.patterns.iter() {
            if glob_match(pattern, channel, false) {
                if let Some(c) = clients.get_mut(*cid) {
                    c.add_multibulk_len(4);
                    c.add_bulk_bytes(b"pmessage");
                    c.add_bulk_bytes(pattern);
                    c.add_bulk_bytes(channel);
                    c.add_bulk_obj(message);
                    touched.push(*cid);
                }
            }
        }
    }

    let receivers = touched.len();
    for cid in touched {
        crate::client::check_output_buffer_limits(srv, cid);
    }
    receivers
}

pub fn subscribe_command(_el: &mut EventLoop<Server>, srv: &mut Server, id: ClientId) {
    let channels: Vec<Vec<u8>> = match srv.clients.get(id) {
        Some(c) => c.argv[1..].iter().map(|o| o.string_to_vec()).collect(),
        None => return,
    };
    for channel in channels {
        subscribe_channel(srv, id, &channel);
    }
}

pub fn unsubscribe_command(_el: &mut EventLoop<Server>, srv: &mut Server, id: ClientId) {
    let channels: Vec<Vec<u8>> = match srv.clients.get(id) {
        Some(c) => c.argv[1..].iter().map(|o| o.string_to_vec()).collect(),
        None => return,
    };
    if channels.is_empty() {
        unsubscribe_all_channels(srv, id, true);
    } else {
        for channel in channels {
            unsubscribe_channel(srv, id, &channel, true);
        }
    }
}

pub fn psubscribe_command(_el: &mut EventLoop<Server>, srv: &mut Server, id: ClientId) {
    let patterns: Vec<Vec<u8>> = match srv.clients.get(id) {
        Some(c) => c.argv[1..].iter().map(|o| o.string_to_vec()).collect(),
        None => return,
    };
    for pattern in patterns {
        subscribe_pattern(srv, id, &pattern);
    }
}

pub fn punsubscribe_command(_el: &mut EventLoop<Server>, srv: &mut Server, id: ClientId) {
    let patterns: Vec<Vec<u8>> = match srv.clients.get(id) {
        Some(c) => c.argv[1..].iter().map(|o| o.string_to_vec()).collect(),
        None => return,
    };
    if patterns.is_empty() {
        unsubscribe_all_patterns(srv, id, true);
    } else {
        for pattern in patterns {
            unsubscribe_pattern(srv, id, &pattern, true);
        }
    }
}

pub fn publish_command(_el: &mut EventLoop<Server>, srv: &mut Server, id: ClientId) {
    let (channel, message) = match srv.clients.get(id) {
        Some(c) => (c.argv[1].string_to_vec(), c.argv[2].clone()),
        None => return,
    };
    let receivers = publish(srv, &channel, &message);
    if let Some(c) = srv.clients.get_mut(id) {
        c.add_integer(receivers as i64);
    }
}

/// PUBSUB CHANNELS [pattern] | NUMSUB [channel ...] | NUMPAT
pub fn pubsub_command(_el: &mut EventLoop<Server>, srv: &mut Server, id: ClientId) {
    let argv: Vec<Obj> = match srv.clients.get(id) {
        Some(c) => c.argv.clone(),
        None => return,
    };
    let sub = argv[1].string_bytes(|b| b.to_ascii_lowercase());

    match sub.as_slice() {
        b"channels" if argv.len() == 2 || argv.len() == 3 => {
            let pattern = argv.get(2).map(|o| o.string_to_vec());
            let mut names: Vec<Vec<u8>> = Vec::new();
            for name in srv.pubsub.channels.keys() {
                let matched = match &pattern {
                    Some(p) => glob_match(p, name, false),
                    None => true,
                };
                if matched {
                    names.push(name.clone());
                }
            }
            if let Some(c) = srv.clients.get_mut(id) {
                c.add_multibulk_len(names.len());
                for name in names {
                    c.add_bulk_bytes(&name);
                }
            }
        }
        b"numsub" => {
            let counts: Vec<(Vec<u8>, usize)> = argv[2..]
                .iter()
                .map(|o| {
                    let name = o.string_to_vec();
                    let count = srv
                        .pubsub
                        .channels
                        .get(name.as_slice())
                        .map_or(0, |s| s.len());
                    (name, count)
                })
                .collect();
            if let Some(c) = srv.clients.get_mut(id) {
                c.add_multibulk_len(counts.len() * 2);
                for (name, count) in counts {
                    c.add_bulk_bytes(&name);
                    c.add_integer(count as i64);
                }
            }
        }
        b"numpat" if argv.len() == 2 => {
            let count = srv.pubsub.pattern_count();
            if let Some(c) = srv.clients.get_mut(id) {
                c.add_integer(count as i64);
            }
        }
        _ => {
            let text = format!(
                "Unknown PUBSUB subcommand or wrong number of arguments for '{}'",
                String::from_utf8_lossy(&sub)
            );
            if let Some(c) = srv.clients.get_mut(id) {
                c.add_error(&text);
            }
        }
    }
}
