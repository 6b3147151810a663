//! Default object codec: the payload body is a bincode-serialized plain
//! rendition of the value. Loading re-applies the compact encoding
//! thresholds, so a small hash dumped from a hashtable comes back a ziplist.

use crate::config::EncodingConfig;
use crate::keyspace::{CodecError, ObjectCodec};
use crate::object::{intset::IntSet, skiplist::SortedSet, ziplist::ZipList, Obj, ObjType, Value};
use crate::util::{fmt_f64, string_to_i64};
use hashbrown::{HashMap, HashSet};
use serde_derive::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Serialize, Deserialize)]
enum PlainValue {
    Str(Vec<u8>),
    List(Vec<Vec<u8>>),
    Set(Vec<Vec<u8>>),
    Hash(Vec<(Vec<u8>, Vec<u8>)>),
    ZSet(Vec<(Vec<u8>, f64)>),
}

impl PlainValue {
    fn obj_type(&self) -> ObjType {
        match self {
            PlainValue::Str(_) => ObjType::String,
            PlainValue::List(_) => ObjType::List,
            PlainValue::Set(_) => ObjType::Set,
            PlainValue::Hash(_) => ObjType::Hash,
            PlainValue::ZSet(_) => ObjType::ZSet,
        }
    }
}

fn flatten(value: &Value) -> PlainValue {
    match value {
        Value::Raw(s) => PlainValue::Str(s.clone()),
        Value::Int(v) => PlainValue::Str(crate::util::IntBuf::format(*v).as_bytes().to_vec()),
        Value::ListZip(zl) => PlainValue::List(zl.iter().map(|e| e.to_vec()).collect()),
        Value::ListLinked(items) => PlainValue::List(items.iter().cloned().collect()),
        Value::SetInt(set) => PlainValue::Set(
            set.iter()
                .map(|v| crate::util::IntBuf::format(v).as_bytes().to_vec())
                .collect(),
        ),
        Value::SetHt(set) => PlainValue::Set(set.iter().cloned().collect()),
        Value::HashZip(zl) => {
            let mut pairs = Vec::new();
            let mut it = zl.iter();
            while let (Some(field), Some(value)) = (it.next(), it.next()) {
                pairs.push((field.to_vec(), value.to_vec()));
            }
            PlainValue::Hash(pairs)
        }
        Value::HashHt(map) => {
            PlainValue::Hash(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        }
        Value::ZSetZip(zl) => {
            let mut pairs = Vec::new();
            let mut it = zl.iter();
            while let (Some(member), Some(score)) = (it.next(), it.next()) {
                let score = crate::util::string_to_f64(&score.to_vec()).unwrap_or(0.0);
                pairs.push((member.to_vec(), score));
            }
            PlainValue::ZSet(pairs)
        }
        Value::ZSetSkip(set) => {
            PlainValue::ZSet(set.iter().map(|(m, s)| (m.to_vec(), s)).collect())
        }
    }
}

fn rebuild(plain: PlainValue, enc: &EncodingConfig, share: bool) -> Obj {
    match plain {
        PlainValue::Str(s) => Obj::new_string_raw(s).try_encode(share),
        PlainValue::List(items) => {
            let compact = items.len() <= enc.list_max_ziplist_entries
                && items.iter().all(|i| i.len() <= enc.list_max_ziplist_value);
            if compact {
                let mut zl = ZipList::new();
                for item in &items {
                    zl.push_tail(item);
                }
                Obj::from_value(Value::ListZip(zl))
            } else {
                Obj::from_value(Value::ListLinked(items.into_iter().collect::<VecDeque<_>>()))
            }
        }
        PlainValue::Set(members) => {
            let ints: Option<Vec<i64>> =
                members.iter().map(|m| string_to_i64(m)).collect();
            match ints {
                Some(values) if values.len() <= enc.set_max_intset_entries => {
                    let mut set = IntSet::new();
                    for v in values {
                        set.insert(v);
                    }
                    Obj::from_value(Value::SetInt(set))
                }
                _ => Obj::from_value(Value::SetHt(
                    members.into_iter().collect::<HashSet<_>>(),
                )),
            }
        }
        PlainValue::Hash(pairs) => {
            let compact = pairs.len() <= enc.hash_max_ziplist_entries
                && pairs.iter().all(|(f, v)| {
                    f.len() <= enc.hash_max_ziplist_value && v.len() <= enc.hash_max_ziplist_value
                });
            if compact {
                let mut zl = ZipList::new();
                for (field, value) in &pairs {
                    zl.push_tail(field);
                    zl.push_tail(value);
                }
                Obj::from_value(Value::HashZip(zl))
            } else {
                Obj::from_value(Value::HashHt(pairs.into_iter().collect::<HashMap<_, _>>()))
            }
        }
        PlainValue::ZSet(pairs) => {
            let compact = pairs.len() <= enc.zset_max_ziplist_entries
                && pairs.iter().all(|(m, _)| m.len() <= enc.zset_max_ziplist_value);
            if compact {
                let mut zl = ZipList::new();
                for (member, score) in &pairs {
                    zl.push_tail(member);
                    zl.push_tail(fmt_f64(*score).as_bytes());
                }
                Obj::from_value(Value::ZSetZip(zl))
            } else {
                let mut set = SortedSet::new();
                for (member, score) in &pairs {
                    set.insert(member, *score);
                }
                Obj::from_value(Value::ZSetSkip(set))
            }
        }
    }
}

pub struct BincodeCodec;

impl ObjectCodec for BincodeCodec {
    fn save_object_type(&self, out: &mut Vec<u8>, value: &Obj) {
        out.push(value.obj_type().code());
    }

    fn save_object(&self, out: &mut Vec<u8>, value: &Obj) -> Result<(), CodecError> {
        let plain = value.with_value(flatten);
        bincode::serialize_into(out, &plain).map_err(|_| CodecError::Corrupt)
    }

    fn load_object_type(&self, payload: &[u8]) -> Result<u8, CodecError> {
        let code = *payload.first().ok_or(CodecError::Corrupt)?;
        ObjType::from_code(code).ok_or(CodecError::UnknownType(code))?;
        Ok(code)
    }

    fn load_object(
        &self,
        type_code: u8,
        body: &[u8],
        encodings: &EncodingConfig,
        share: bool,
    ) -> Result<Obj, CodecError> {
        let plain: PlainValue =
            bincode::deserialize(body).map_err(|_| CodecError::Corrupt)?;
        let expected = ObjType::from_code(type_code).ok_or(CodecError::UnknownType(type_code))?;
        if plain.obj_type() != expected {
            return Err(CodecError::Corrupt);
        }
        Ok(rebuild(plain, encodings, share))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Encoding;

    fn roundtrip(value: Obj) -> Obj {
        let codec = BincodeCodec;
        let enc = EncodingConfig::default();
        let mut type_buf = Vec::new();
        codec.save_object_type(&mut type_buf, &value);
        let mut body = Vec::new();
        codec.save_object(&mut body, &value).unwrap();

        let code = codec.load_object_type(&type_buf).unwrap();
        codec.load_object(code, &body, &enc, true).unwrap()
    }

    #[test]
    fn test_string_roundtrip() {
        let restored = roundtrip(Obj::new_string_raw(b"hello".to_vec()));
        restored.string_bytes(|b| assert_eq!(b, b"hello"));

        let restored = roundtrip(Obj::new_string_int(12345, false));
        assert_eq!(restored.to_i64(), Some(12345));
    }

    #[test]
    fn test_small_list_comes_back_ziplist() {
        let list = Obj::new_list_linked();
        list.with_value_mut(|v| {
            if let Value::ListLinked(items) = v {
                items.push_back(b"a".to_vec());
                items.push_back(b"b".to_vec());
            }
        });
        let restored = roundtrip(list);
        assert_eq!(restored.encoding(), Encoding::Ziplist);
        restored.with_value(|v| {
            if let Value::ListZip(zl) = v {
                assert_eq!(zl.len(), 2);
            } else {
                panic!("Expected a ziplist");
            }
        });
    }

    #[test]
    fn test_large_list_stays_linked() {
        let list = Obj::new_list_linked();
        list.with_value_mut(|v| {
            if let Value::ListLinked(items) = v {
                for i in 0..200 {
                    items.push_back(format!("item-{}", i).into_bytes());
                }
            }
        });
        let restored = roundtrip(list);
        assert_eq!(restored.encoding(), Encoding::LinkedList);
    }

    #[test]
    fn test_integer_set_comes_back_intset() {
        let set = Obj::new_set_ht();
        set.with_value_mut(|v| {
            if let Value::SetHt(members) = v {
                members.insert(b"10".to_vec());
                members.insert(b"20".to_vec());
            }
        });
        let restored = roundtrip(set);
        assert_eq!(restored.encoding(), Encoding::Intset);
    }

    #[test]
    fn test_hash_roundtrip() {
        let hash = Obj::new_hash_ziplist();
        hash.with_value_mut(|v| {
            if let Value::HashZip(zl) = v {
                zl.push_tail(b"field");
                zl.push_tail(b"value");
            }
        });
        let restored = roundtrip(hash);
        assert_eq!(restored.encoding(), Encoding::Ziplist);
        restored.with_value(|v| {
            if let Value::HashZip(zl) = v {
                assert_eq!(zl.find(b"field"), Some(0));
            } else {
                panic!("Expected a ziplist hash");
            }
        });
    }

    #[test]
    fn test_zset_scores_survive() {
        let zset = Obj::new_zset_skiplist();
        zset.with_value_mut(|v| {
            if let Value::ZSetSkip(set) = v {
                set.insert(b"m1", 1.5);
                set.insert(b"m2", -3.0);
            }
        });
        let restored = roundtrip(zset);
        restored.with_value(|v| match v {
            Value::ZSetZip(zl) => {
                let entries: Vec<_> = zl.iter().map(|e| e.to_vec()).collect();
                assert_eq!(entries[0], b"m2".to_vec());
                assert_eq!(entries[1], b"-3".to_vec());
                assert_eq!(entries[2], b"m1".to_vec());
                assert_eq!(entries[3], b"1.5".to_vec());
            }
            _ => panic!("Expected a ziplist zset"),
        });
    }

    #[test]
    fn test_load_rejects_mismatched_type() {
        let codec = BincodeCodec;
        let enc = EncodingConfig::default();
        let mut body = Vec::new();
        codec
            .save_object(&mut body, &Obj::new_string_raw(b"x".to_vec()))
            .unwrap();
        assert!(matches!(
            codec.load_object(ObjType::List.code(), &body, &enc, true),
            Err(CodecError::Corrupt)
        ));
    }

    #[test]
    fn test_load_rejects_garbage() {
        let codec = BincodeCodec;
        let enc = EncodingConfig::default();
        assert!(codec.load_object(0, b"\xff\xff\xff", &enc, true).is_err());
        assert!(codec.load_object_type(b"").is_err());
        assert_eq!(codec.load_object_type(b"\x09"), Err(CodecError::UnknownType(9)));
    }
}
