use cinder_core::config::LimitsConfig;
use cinder_core::object::ziplist::ZipList;
use cinder_core::protocol::{parse, ParseResult, RequestState};
use criterion::{criterion_group, criterion_main, Criterion};

fn multibulk_parse(c: &mut Criterion) {
    let limits = LimitsConfig::default();
    let request = b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n".to_vec();

    c.bench_function("parse multibulk set", |b| {
        b.iter(|| {
            let mut state = RequestState::new();
            let mut querybuf = request.clone();
            let mut argv = Vec::new();
            match parse(&mut state, &mut querybuf, &mut argv, &limits) {
                ParseResult::Ready => argv.len(),
                _ => panic!("expected a complete request"),
            }
        })
    });
}

fn ziplist_push(c: &mut Criterion) {
    c.bench_function("ziplist push 128 tail", |b| {
        b.iter(|| {
            let mut zl = ZipList::new();
            for i in 0..128 {
                zl.push_tail(format!("value-{}", i).as_bytes());
            }
            zl.len()
        })
    });
}

criterion_group!(benches, multibulk_parse, ziplist_push);
criterion_main!(benches);
