//! Polymorphic value objects. Every value carries a logical type and an
//! internal encoding picked for memory efficiency; encodings only ever move
//! from the compact form to the general one. Handles are reference counted
//! through `Rc`, except small shared integers which are plain value handles:
//! cloning copies, dropping is a no-op, the refcount reads as a sentinel and
//! their decimal byte views come from a process-wide immutable pool.

pub mod intset;
pub mod skiplist;
pub mod ziplist;

use crate::util::{self, string_to_f64, string_to_i64, IntBuf};
use hashbrown::{HashMap, HashSet};
use lazy_static::lazy_static;
use intset::IntSet;
use skiplist::SortedSet;
use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::rc::Rc;
use ziplist::ZipList;

/// Integers below this are served from the shared pool when sharing is on.
pub const SHARED_INTEGERS: i64 = 10000;

pub const LRU_CLOCK_MAX: u32 = (1 << 21) - 1;
pub const LRU_CLOCK_RESOLUTION_SECS: u64 = 10;

/// Refcount reported for shared handles; they are never freed.
pub const SHARED_REFCOUNT: usize = usize::max_value();

lazy_static! {
    static ref SHARED_INT_BYTES: Vec<Vec<u8>> = (0..SHARED_INTEGERS)
        .map(|v| IntBuf::format(v).as_bytes().to_vec())
        .collect();
}

/// Byte view of a pooled integer, borrowed from the process-wide table.
#[inline]
fn shared_int_bytes(value: i64) -> &'static [u8] {
    let pool: &'static Vec<Vec<u8>> = &SHARED_INT_BYTES;
    &pool[value as usize]
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ObjType {
    String,
    List,
    Set,
    Hash,
    ZSet,
}

impl ObjType {
    pub fn name(self) -> &'static str {
        match self {
            ObjType::String => "string",
            ObjType::List => "list",
            ObjType::Set => "set",
            ObjType::Hash => "hash",
            ObjType::ZSet => "zset",
        }
    }

    #[inline]
    pub fn code(self) -> u8 {
        match self {
            ObjType::String => 0,
            ObjType::List => 1,
            ObjType::Set => 2,
            ObjType::Hash => 3,
            ObjType::ZSet => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<ObjType> {
        Some(match code {
            0 => ObjType::String,
            1 => ObjType::List,
            2 => ObjType::Set,
            3 => ObjType::Hash,
            4 => ObjType::ZSet,
            _ => return None,
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Encoding {
    Raw,
    Int,
    Ziplist,
    LinkedList,
    Hashtable,
    Intset,
    Skiplist,
}

impl Encoding {
    pub fn name(self) -> &'static str {
        match self {
            Encoding::Raw => "raw",
            Encoding::Int => "int",
            Encoding::Ziplist => "ziplist",
            Encoding::LinkedList => "linkedlist",
            Encoding::Hashtable => "hashtable",
            Encoding::Intset => "intset",
            Encoding::Skiplist => "skiplist",
        }
    }
}

/// The payload, tagged by (type, encoding).
pub enum Value {
    Raw(Vec<u8>),
    Int(i64),
    ListZip(ZipList),
    ListLinked(VecDeque<Vec<u8>>),
    SetInt(IntSet),
    SetHt(HashSet<Vec<u8>>),
    HashZip(ZipList),
    HashHt(HashMap<Vec<u8>, Vec<u8>>),
    ZSetZip(ZipList),
    ZSetSkip(SortedSet),
}

impl Value {
    pub fn obj_type(&self) -> ObjType {
        match self {
            Value::Raw(_) | Value::Int(_) => ObjType::String,
            Value::ListZip(_) | Value::ListLinked(_) => ObjType::List,
            Value::SetInt(_) | Value::SetHt(_) => ObjType::Set,
            Value::HashZip(_) | Value::HashHt(_) => ObjType::Hash,
            Value::ZSetZip(_) | Value::ZSetSkip(_) => ObjType::ZSet,
        }
    }

    pub fn encoding(&self) -> Encoding {
        match self {
            Value::Raw(_) => Encoding::Raw,
            Value::Int(_) => Encoding::Int,
            Value::ListZip(_) | Value::HashZip(_) | Value::ZSetZip(_) => Encoding::Ziplist,
            Value::ListLinked(_) => Encoding::LinkedList,
            Value::SetInt(_) => Encoding::Intset,
            Value::SetHt(_) | Value::HashHt(_) => Encoding::Hashtable,
            Value::ZSetSkip(_) => Encoding::Skiplist,
        }
    }

    /// Ziplist list to linked list, keeping element order.
    pub fn list_upgrade(&mut self) {
        if let Value::ListZip(zl) = self {
            let items = zl.iter().map(|e| e.to_vec()).collect();
            *self = Value::ListLinked(items);
        }
    }

    /// Intset to hashtable, formatting members in decimal.
    pub fn set_upgrade(&mut self) {
        if let Value::SetInt(set) = self {
            let members = set
                .iter()
                .map(|v| IntBuf::format(v).as_bytes().to_vec())
                .collect();
            *self = Value::SetHt(members);
        }
    }

    /// Ziplist hash to hashtable. Entries alternate field, value.
    pub fn hash_upgrade(&mut self) {
        if let Value::HashZip(zl) = self {
            let mut map = HashMap::new();
            let mut it = zl.iter();
            while let (Some(field), Some(value)) = (it.next(), it.next()) {
                map.insert(field.to_vec(), value.to_vec());
            }
            *self = Value::HashHt(map);
        }
    }

    /// Ziplist zset to skiplist. Entries alternate member, score.
    pub fn zset_upgrade(&mut self) {
        if let Value::ZSetZip(zl) = self {
            let mut set = SortedSet::new();
            let mut it = zl.iter();
            while let (Some(member), Some(score)) = (it.next(), it.next()) {
                let score = string_to_f64(&score.to_vec()).unwrap_or(0.0);
                set.insert(&member.to_vec(), score);
            }
            *self = Value::ZSetSkip(set);
        }
    }
}

pub struct ObjCell {
    lru: Cell<u32>,
    value: RefCell<Value>,
}

#[derive(Clone)]
enum Repr {
    SharedInt(i64),
    Owned(Rc<ObjCell>),
}

/// A counted handle to a value object.
#[derive(Clone)]
pub struct Obj {
    repr: Repr,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CompareMode {
    Binary,
    Collation,
}

/// Current LRU tick, wrapping at `LRU_CLOCK_MAX`.
#[inline]
pub fn lru_clock() -> u32 {
    ((util::now_secs() / LRU_CLOCK_RESOLUTION_SECS) as u32) & LRU_CLOCK_MAX
}

impl Obj {
    fn owned(value: Value) -> Obj {
        Obj {
            repr: Repr::Owned(Rc::new(ObjCell {
                lru: Cell::new(lru_clock()),
                value: RefCell::new(value),
            })),
        }
    }

    pub fn new_string_raw(bytes: Vec<u8>) -> Obj {
        Obj::owned(Value::Raw(bytes))
    }

    /// Integer string. `share` routes eligible values through the shared
    /// pool; callers pass false when a memory cap is configured, since
    /// shared handles have no per-holder access clock.
    pub fn new_string_int(value: i64, share: bool) -> Obj {
        if share && value >= 0 && value < SHARED_INTEGERS {
            Obj { repr: Repr::SharedInt(value) }
        } else {
            Obj::owned(Value::Int(value))
        }
    }

    pub fn new_list_ziplist() -> Obj {
        Obj::owned(Value::ListZip(ZipList::new()))
    }

    pub fn new_list_linked() -> Obj {
        Obj::owned(Value::ListLinked(VecDeque::new()))
    }

    pub fn new_set_intset() -> Obj {
        Obj::owned(Value::SetInt(IntSet::new()))
    }

    pub fn new_set_ht() -> Obj {
        Obj::owned(Value::SetHt(HashSet::new()))
    }

    pub fn new_hash_ziplist() -> Obj {
        Obj::owned(Value::HashZip(ZipList::new()))
    }

    pub fn new_hash_ht() -> Obj {
        Obj::owned(Value::HashHt(HashMap::new()))
    }

    pub fn new_zset_ziplist() -> Obj {
        Obj::owned(Value::ZSetZip(ZipList::new()))
    }

    pub fn new_zset_skiplist() -> Obj {
        Obj::owned(Value::ZSetSkip(SortedSet::new()))
    }

    pub fn from_value(value: Value) -> Obj {
        Obj::owned(value)
    }

    #[inline]
    pub fn is_shared(&self) -> bool {
        match self.repr {
            Repr::SharedInt(_) => true,
            Repr::Owned(_) => false,
        }
    }

    /// Number of live holders. Shared handles report a sentinel; the value
    /// is informational only and such objects are never freed.
    pub fn refcount(&self) -> usize {
        match &self.repr {
            Repr::SharedInt(_) => SHARED_REFCOUNT,
            Repr::Owned(cell) => Rc::strong_count(cell),
        }
    }

    pub fn obj_type(&self) -> ObjType {
        match &self.repr {
            Repr::SharedInt(_) => ObjType::String,
            Repr::Owned(cell) => cell.value.borrow().obj_type(),
        }
    }

    pub fn encoding(&self) -> Encoding {
        match &self.repr {
            Repr::SharedInt(_) => Encoding::Int,
            Repr::Owned(cell) => cell.value.borrow().encoding(),
        }
    }

    /// Stamps the access clock.
    #[inline]
    pub fn touch(&self, clock: u32) {
        if let Repr::Owned(cell) = &self.repr {
            cell.lru.set(clock);
        }
    }

    /// Seconds since the last access, modular over the clock range. Shared
    /// handles have no clock and always read as fresh.
    pub fn idle_time(&self, clock: u32) -> u64 {
        match &self.repr {
            Repr::SharedInt(_) => 0,
            Repr::Owned(cell) => {
                let lru = cell.lru.get();
                let ticks = if clock >= lru {
                    clock - lru
                } else {
                    LRU_CLOCK_MAX - lru + clock
                };
                u64::from(ticks) * LRU_CLOCK_RESOLUTION_SECS
            }
        }
    }

    pub fn with_value<R>(&self, f: impl FnOnce(&Value) -> R) -> R {
        match &self.repr {
            Repr::SharedInt(v) => f(&Value::Int(*v)),
            Repr::Owned(cell) => f(&cell.value.borrow()),
        }
    }

    /// Mutable access to the payload. Shared handles are immutable; callers
    /// intending mutation must detach first.
    pub fn with_value_mut<R>(&self, f: impl FnOnce(&mut Value) -> R) -> R {
        match &self.repr {
            Repr::SharedInt(_) => panic!("Attempted to mutate a shared object"),
            Repr::Owned(cell) => f(&mut cell.value.borrow_mut()),
        }
    }

    /// Logical byte length of a string object.
    pub fn string_len(&self) -> usize {
        self.string_bytes(<[u8]>::len)
    }

    /// Runs `f` over the string bytes. Shared handles borrow their decimal
    /// form from the pool, owned integer encodings are formatted on the
    /// stack; no allocation happens either way.
    pub fn string_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        match &self.repr {
            Repr::SharedInt(v) => f(shared_int_bytes(*v)),
            Repr::Owned(cell) => match &*cell.value.borrow() {
                Value::Raw(s) => f(s),
                Value::Int(v) => f(IntBuf::format(*v).as_bytes()),
                _ => panic!("Expected a string object"),
            },
        }
    }

    pub fn string_to_vec(&self) -> Vec<u8> {
        self.string_bytes(<[u8]>::to_vec)
    }

    /// Raw view of the object: raw strings share the handle, integer
    /// encodings produce a fresh raw copy.
    pub fn decoded(&self) -> Obj {
        match self.encoding() {
            Encoding::Raw => self.clone(),
            Encoding::Int => Obj::new_string_raw(self.string_to_vec()),
            _ => panic!("Expected a string object"),
        }
    }

    /// Tries to compact a raw string: integer contents re-encode to Int (or
    /// a shared handle when eligible), long strings with excessive slack are
    /// shrunk. Objects with more than one holder are returned unchanged.
    pub fn try_encode(self, share: bool) -> Obj {
        let cell = match &self.repr {
            Repr::SharedInt(_) => return self,
            Repr::Owned(cell) => cell,
        };
        if Rc::strong_count(cell) > 1 {
            return self;
        }

        let parsed = match &*cell.value.borrow() {
            Value::Raw(s) if s.len() <= 21 => string_to_i64(s),
            _ => None,
        };
        if let Some(v) = parsed {
            if share && v >= 0 && v < SHARED_INTEGERS {
                return Obj { repr: Repr::SharedInt(v) };
            }
            *cell.value.borrow_mut() = Value::Int(v);
            return self;
        }

        if let Value::Raw(s) = &mut *cell.value.borrow_mut() {
            if s.len() > 32 && s.capacity() - s.len() > s.len() / 10 {
                s.shrink_to_fit();
            }
        }
        self
    }

    pub fn to_i64(&self) -> Option<i64> {
        match &self.repr {
            Repr::SharedInt(v) => Some(*v),
            Repr::Owned(cell) => match &*cell.value.borrow() {
                Value::Int(v) => Some(*v),
                Value::Raw(s) => string_to_i64(s),
                _ => None,
            },
        }
    }

    pub fn to_f64(&self) -> Option<f64> {
        match &self.repr {
            Repr::SharedInt(v) => Some(*v as f64),
            Repr::Owned(cell) => match &*cell.value.borrow() {
                Value::Int(v) => Some(*v as f64),
                Value::Raw(s) => string_to_f64(s),
                _ => None,
            },
        }
    }

    /// String comparison, numeric-aware: integer encodings are formatted on
    /// the stack rather than decoded into fresh allocations.
    pub fn compare(a: &Obj, b: &Obj, mode: CompareMode) -> Ordering {
        if let (Some(av), Some(bv)) = (a.int_value(), b.int_value()) {
            return av.cmp(&bv);
        }
        a.string_bytes(|ab| {
            b.string_bytes(|bb| match mode {
                CompareMode::Binary => ab.cmp(bb),
                CompareMode::Collation => {
                    String::from_utf8_lossy(ab).cmp(&String::from_utf8_lossy(bb))
                }
            })
        })
    }

    #[inline]
    fn int_value(&self) -> Option<i64> {
        match &self.repr {
            Repr::SharedInt(v) => Some(*v),
            Repr::Owned(cell) => match &*cell.value.borrow() {
                Value::Int(v) => Some(*v),
                _ => None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_constructor_roundtrip() {
        for &v in &[0i64, 1, 9999, 10000, -1, i64::max_value(), i64::min_value()] {
            let o = Obj::new_string_int(v, true);
            assert_eq!(o.to_i64(), Some(v));
            assert_eq!(o.obj_type(), ObjType::String);
            assert_eq!(o.encoding(), Encoding::Int);
        }
    }

    #[test]
    fn test_shared_pool_eligibility() {
        assert!(Obj::new_string_int(0, true).is_shared());
        assert!(Obj::new_string_int(9999, true).is_shared());
        assert!(!Obj::new_string_int(10000, true).is_shared());
        assert!(!Obj::new_string_int(-1, true).is_shared());
        assert!(!Obj::new_string_int(5, false).is_shared());
    }

    #[test]
    fn test_shared_int_bytes_come_from_pool() {
        let a = Obj::new_string_int(123, true);
        let b = Obj::new_string_int(123, true);
        a.string_bytes(|bytes| assert_eq!(bytes, b"123"));
        // Two handles for the same value resolve into the same pooled bytes.
        a.string_bytes(|ab| b.string_bytes(|bb| assert_eq!(ab.as_ptr(), bb.as_ptr())));
    }

    #[test]
    fn test_shared_refcount_sentinel() {
        let o = Obj::new_string_int(7, true);
        assert_eq!(o.refcount(), SHARED_REFCOUNT);
        let copy = o.clone();
        drop(copy);
        assert_eq!(o.refcount(), SHARED_REFCOUNT);
        assert_eq!(o.to_i64(), Some(7));
    }

    #[test]
    fn test_refcount_tracks_holders() {
        let o = Obj::new_string_raw(b"hello".to_vec());
        assert_eq!(o.refcount(), 1);
        let second = o.clone();
        assert_eq!(o.refcount(), 2);
        drop(second);
        assert_eq!(o.refcount(), 1);
    }

    #[test]
    fn test_try_encode_integer() {
        let o = Obj::new_string_raw(b"12345".to_vec()).try_encode(false);
        assert_eq!(o.encoding(), Encoding::Int);
        assert_eq!(o.to_i64(), Some(12345));

        let shared = Obj::new_string_raw(b"42".to_vec()).try_encode(true);
        assert!(shared.is_shared());
        assert_eq!(shared.to_i64(), Some(42));
    }

    #[test]
    fn test_try_encode_preserves_bytes() {
        for s in &[&b"hello"[..], b"007", b"12.5", b"", b"9223372036854775808"] {
            let o = Obj::new_string_raw(s.to_vec()).try_encode(true);
            o.string_bytes(|bytes| assert_eq!(bytes, *s));
        }
    }

    #[test]
    fn test_try_encode_skips_multi_holder() {
        let o = Obj::new_string_raw(b"123".to_vec());
        let extra = o.clone();
        let encoded = o.try_encode(true);
        assert_eq!(encoded.encoding(), Encoding::Raw);
        drop(extra);
    }

    #[test]
    fn test_decoded_int() {
        let o = Obj::new_string_int(451, false);
        let raw = o.decoded();
        assert_eq!(raw.encoding(), Encoding::Raw);
        raw.string_bytes(|b| assert_eq!(b, b"451"));
    }

    #[test]
    fn test_decoded_raw_shares() {
        let o = Obj::new_string_raw(b"abc".to_vec());
        let view = o.decoded();
        assert_eq!(o.refcount(), 2);
        drop(view);
    }

    #[test]
    fn test_compare_numeric_and_binary() {
        let a = Obj::new_string_int(9, false);
        let b = Obj::new_string_int(10, false);
        assert_eq!(Obj::compare(&a, &b, CompareMode::Binary), Ordering::Less);

        let x = Obj::new_string_raw(b"9".to_vec());
        assert_eq!(Obj::compare(&a, &x, CompareMode::Binary), Ordering::Equal);

        let s1 = Obj::new_string_raw(b"abc".to_vec());
        let s2 = Obj::new_string_raw(b"abd".to_vec());
        assert_eq!(Obj::compare(&s1, &s2, CompareMode::Binary), Ordering::Less);
    }

    #[test]
    fn test_idle_time_modular() {
        let o = Obj::new_string_raw(b"x".to_vec());
        o.touch(100);
        assert_eq!(o.idle_time(100), 0);
        assert_eq!(o.idle_time(106), 6 * LRU_CLOCK_RESOLUTION_SECS);

        o.touch(LRU_CLOCK_MAX - 2);
        assert_eq!(o.idle_time(1), 3 * LRU_CLOCK_RESOLUTION_SECS);
    }

    #[test]
    fn test_list_upgrade() {
        let o = Obj::new_list_ziplist();
        o.with_value_mut(|v| {
            if let Value::ListZip(zl) = v {
                zl.push_tail(b"a");
                zl.push_tail(b"b");
            }
            v.list_upgrade();
        });
        assert_eq!(o.encoding(), Encoding::LinkedList);
        o.with_value(|v| {
            if let Value::ListLinked(items) = v {
                assert_eq!(items.len(), 2);
                assert_eq!(items[0], b"a");
            } else {
                panic!("Expected a linked list");
            }
        });
    }

    #[test]
    fn test_set_upgrade() {
        let o = Obj::new_set_intset();
        o.with_value_mut(|v| {
            if let Value::SetInt(set) = v {
                set.insert(3);
                set.insert(11);
            }
            v.set_upgrade();
        });
        assert_eq!(o.encoding(), Encoding::Hashtable);
        o.with_value(|v| {
            if let Value::SetHt(members) = v {
                assert!(members.contains(&b"3"[..]));
                assert!(members.contains(&b"11"[..]));
            } else {
                panic!("Expected a hashtable set");
            }
        });
    }

    #[test]
    fn test_zset_upgrade() {
        let o = Obj::new_zset_ziplist();
        o.with_value_mut(|v| {
            if let Value::ZSetZip(zl) = v {
                zl.push_tail(b"m1");
                zl.push_tail(b"1.5");
                zl.push_tail(b"m2");
                zl.push_tail(b"0.5");
            }
            v.zset_upgrade();
        });
        assert_eq!(o.encoding(), Encoding::Skiplist);
        o.with_value(|v| {
            if let Value::ZSetSkip(set) = v {
                assert_eq!(set.score(b"m1"), Some(1.5));
                let first = set.iter().next().map(|(m, _)| m.to_vec());
                assert_eq!(first, Some(b"m2".to_vec()));
            } else {
                panic!("Expected a skiplist zset");
            }
        });
    }

    #[test]
    fn test_mutating_shared_panics() {
        let o = Obj::new_string_int(1, true);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            o.with_value_mut(|_| ());
        }));
        assert!(result.is_err());
    }
}
