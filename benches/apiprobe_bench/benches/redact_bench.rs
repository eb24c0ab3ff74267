//! Redaction benchmarks
//!
//! Measures masking cost for header lists and JSON documents of growing size.

use apiprobe_core::{HeaderList, Redactor};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::{json, Value};

fn headers(count: usize) -> HeaderList {
    let mut list = HeaderList::new();
    list.append("authorization", "Bearer abc.def.ghi");
    list.append("cookie", "session=1234");
    for i in 0..count {
        list.append(format!("x-custom-{i}"), format!("value-{i}"));
    }
    list
}

fn document(users: usize) -> Value {
    let users: Vec<Value> = (0..users)
        .map(|i| {
            json!({
                "id": i,
                "name": format!("user {i}"),
                "ssn": "555-00-1111",
                "card": {"number": "4111111111111111", "exp": "12/30"},
                "tags": ["a", "b", "c"],
            })
        })
        .collect();
    json!({"users": users, "total": users.len()})
}

fn bench_headers(c: &mut Criterion) {
    let redactor = Redactor::new().header("Authorization").header("Cookie");
    let mut group = c.benchmark_group("redact_headers");

    for count in [4, 16, 64] {
        let list = headers(count);
        group.bench_with_input(BenchmarkId::from_parameter(count), &list, |b, list| {
            b.iter(|| redactor.headers(black_box(list)))
        });
    }

    group.finish();
}

fn bench_json(c: &mut Criterion) {
    let bare = Redactor::new().response_field("ssn").unwrap();
    let path = Redactor::new()
        .response_field("$.users[*].card.number")
        .unwrap();
    let mut group = c.benchmark_group("redact_json");

    for users in [1, 10, 100] {
        let doc = document(users);
        group.bench_with_input(BenchmarkId::new("bare_name", users), &doc, |b, doc| {
            b.iter(|| bare.response_body(black_box(doc)))
        });
        group.bench_with_input(BenchmarkId::new("json_path", users), &doc, |b, doc| {
            b.iter(|| path.response_body(black_box(doc)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_headers, bench_json);
criterion_main!(benches);
