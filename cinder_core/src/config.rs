use serde_derive::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_PORT: u16 = 6379;

/// Per-class output buffer limits. A hard limit closes the client at once,
/// a soft limit closes it after `soft_seconds` of continuous overrun.
/// Zero disables the corresponding check.
#[derive(Serialize, Deserialize, Clone, Copy, Debug)]
pub struct BufferLimit {
    pub hard_bytes: usize,
    pub soft_bytes: usize,
    pub soft_seconds: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ServerConfig {
    pub address: String,
    pub port: u16,
    pub databases: usize,
    pub max_clients: usize,
    pub event_setsize: usize,
    /// Readiness backend: "mio" or "select".
    pub backend: String,
    pub tcp_keepalive_secs: u64,
    /// Idle client timeout in seconds, 0 disables the sweep.
    pub client_timeout_secs: u64,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            address: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            databases: 16,
            max_clients: 10000,
            event_setsize: 10240,
            backend: "mio".to_string(),
            tcp_keepalive_secs: 0,
            client_timeout_secs: 0,
            log_level: "info".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct LimitsConfig {
    pub io_buf_len: usize,
    pub inline_max_size: usize,
    pub query_buf_max: usize,
    pub proto_max_bulk_len: usize,
    pub multibulk_max: usize,
    pub max_write_per_event: usize,
    /// Memory cap in bytes; 0 means unlimited. A configured cap disables the
    /// shared integer pool and lifts the per-event write limit.
    pub maxmemory: u64,
    pub normal: BufferLimit,
    pub replica: BufferLimit,
    pub pubsub: BufferLimit,
}

impl Default for LimitsConfig {
    fn default() -> LimitsConfig {
        LimitsConfig {
            io_buf_len: 16 * 1024,
            inline_max_size: 64 * 1024,
            query_buf_max: 1024 * 1024 * 1024,
            proto_max_bulk_len: 512 * 1024 * 1024,
            multibulk_max: 1024 * 1024,
            max_write_per_event: 64 * 1024,
            maxmemory: 0,
            normal: BufferLimit { hard_bytes: 0, soft_bytes: 0, soft_seconds: 0 },
            replica: BufferLimit {
                hard_bytes: 256 * 1024 * 1024,
                soft_bytes: 64 * 1024 * 1024,
                soft_seconds: 60,
            },
            pubsub: BufferLimit {
                hard_bytes: 32 * 1024 * 1024,
                soft_bytes: 8 * 1024 * 1024,
                soft_seconds: 60,
            },
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct EncodingConfig {
    pub list_max_ziplist_entries: usize,
    pub list_max_ziplist_value: usize,
    pub set_max_intset_entries: usize,
    pub hash_max_ziplist_entries: usize,
    pub hash_max_ziplist_value: usize,
    pub zset_max_ziplist_entries: usize,
    pub zset_max_ziplist_value: usize,
}

impl Default for EncodingConfig {
    fn default() -> EncodingConfig {
        EncodingConfig {
            list_max_ziplist_entries: 128,
            list_max_ziplist_value: 64,
            set_max_intset_entries: 512,
            hash_max_ziplist_entries: 128,
            hash_max_ziplist_value: 64,
            zset_max_ziplist_entries: 128,
            zset_max_ziplist_value: 64,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct NotifyConfig {
    /// Keyspace event classes, same letters the NOTIFY flag parser accepts.
    pub keyspace_events: String,
}

impl Default for NotifyConfig {
    fn default() -> NotifyConfig {
        NotifyConfig { keyspace_events: String::new() }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct SlowlogConfig {
    /// Threshold in microseconds; -1 disables logging, 0 logs every command.
    pub log_slower_than_us: i64,
    pub max_len: usize,
}

impl Default for SlowlogConfig {
    fn default() -> SlowlogConfig {
        SlowlogConfig { log_slower_than_us: 10_000, max_len: 128 }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub limits: LimitsConfig,
    pub encodings: EncodingConfig,
    pub notify: NotifyConfig,
    pub slowlog: SlowlogConfig,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Config {
        serdeconv::from_toml_file(path).expect("Error loading the configuration file")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, DEFAULT_PORT);
        assert_eq!(config.limits.proto_max_bulk_len, 512 * 1024 * 1024);
        assert_eq!(config.encodings.list_max_ziplist_entries, 128);
        assert_eq!(config.slowlog.max_len, 128);
    }

    #[test]
    fn test_partial_toml() {
        let config: Config =
            serdeconv::from_toml_str("[server]\nport = 7000\n").unwrap();
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.server.databases, 16);
        assert_eq!(config.limits.io_buf_len, 16 * 1024);
    }
}
