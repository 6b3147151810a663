//! Bounded log of commands that ran slower than the configured threshold.
//! Entries keep a trimmed copy of the argv so huge arguments cannot pin
//! memory.

use crate::object::Obj;
use std::collections::VecDeque;

const MAX_ARGS: usize = 32;
const MAX_ARG_BYTES: usize = 128;

pub struct SlowlogEntry {
    pub id: u64,
    pub time_secs: u64,
    pub duration_us: u64,
    pub argv: Vec<Obj>,
}

pub struct Slowlog {
    entries: VecDeque<SlowlogEntry>,
    next_id: u64,
    threshold_us: i64,
    max_len: usize,
}

impl Slowlog {
    pub fn new(threshold_us: i64, max_len: usize) -> Slowlog {
        Slowlog {
            entries: VecDeque::new(),
            next_id: 0,
            threshold_us,
            max_len,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn reset(&mut self) {
        self.entries.clear();
    }

    /// Records the command when it crossed the threshold. A negative
    /// threshold disables the log entirely; zero records everything.
    pub fn maybe_record(&mut self, argv: &[Obj], time_secs: u64, duration_us: u64) {
        if self.threshold_us < 0 || (duration_us as i64) < self.threshold_us {
            return;
        }

        let mut trimmed: Vec<Obj> = Vec::with_capacity(argv.len().min(MAX_ARGS));
        for (i, arg) in argv.iter().enumerate() {
            if i == MAX_ARGS - 1 && argv.len() > MAX_ARGS {
                let marker = format!("... ({} more arguments)", argv.len() - MAX_ARGS + 1);
                trimmed.push(Obj::new_string_raw(marker.into_bytes()));
                break;
            }
            if arg.string_len() > MAX_ARG_BYTES {
                let mut short = arg.string_bytes(|b| b[..MAX_ARG_BYTES].to_vec());
                short.extend_from_slice(b"...");
                trimmed.push(Obj::new_string_raw(short));
            } else {
                trimmed.push(arg.clone());
            }
        }

        self.entries.push_front(SlowlogEntry {
            id: self.next_id,
            time_secs,
            duration_us,
            argv: trimmed,
        });
        self.next_id += 1;
        self.entries.truncate(self.max_len);
    }

    /// Newest first.
    pub fn iter(&self) -> impl Iterator<Item = &SlowlogEntry> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&[u8]]) -> Vec<Obj> {
        parts.iter().map(|p| Obj::new_string_raw(p.to_vec())).collect()
    }

    #[test]
    fn test_threshold_filter() {
        let mut log = Slowlog::new(1000, 16);
        log.maybe_record(&argv(&[b"GET", b"k"]), 1, 999);
        assert_eq!(log.len(), 0);
        log.maybe_record(&argv(&[b"GET", b"k"]), 1, 1000);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_disabled_with_negative_threshold() {
        let mut log = Slowlog::new(-1, 16);
        log.maybe_record(&argv(&[b"GET", b"k"]), 1, u64::max_value());
        assert_eq!(log.len(), 0);
    }

    #[test]
    fn test_newest_first_and_bounded() {
        let mut log = Slowlog::new(0, 3);
        for i in 0..5u64 {
            log.maybe_record(&argv(&[b"CMD"]), i, 10);
        }
        assert_eq!(log.len(), 3);
        let ids: Vec<u64> = log.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![4, 3, 2]);
    }

    #[test]
    fn test_argument_trimming() {
        let mut log = Slowlog::new(0, 8);
        let huge = vec![b'x'; 500];
        log.maybe_record(&argv(&[b"SET", b"k", &huge]), 1, 10);

        let entry = log.iter().next().unwrap();
        assert_eq!(entry.argv[2].string_len(), MAX_ARG_BYTES + 3);
        entry.argv[2].string_bytes(|b| assert!(b.ends_with(b"...")));
    }

    #[test]
    fn test_argv_count_cap() {
        let mut log = Slowlog::new(0, 8);
        let parts: Vec<Vec<u8>> = (0..40).map(|i| format!("a{}", i).into_bytes()).collect();
        let objs: Vec<Obj> = parts.iter().map(|p| Obj::new_string_raw(p.clone())).collect();
        log.maybe_record(&objs, 1, 10);

        let entry = log.iter().next().unwrap();
        assert_eq!(entry.argv.len(), MAX_ARGS);
        entry.argv[MAX_ARGS - 1]
            .string_bytes(|b| assert_eq!(b, b"... (9 more arguments)"));
    }

    #[test]
    fn test_reset() {
        let mut log = Slowlog::new(0, 8);
        log.maybe_record(&argv(&[b"X"]), 1, 10);
        log.reset();
        assert_eq!(log.len(), 0);
    }
}
