//! Payload building benchmarks
//!
//! Covers the work done once per request after the handler returns: body
//! classification, redaction and record assembly.

use apiprobe_core::{
    CapturedBody, CorrelationId, Exchange, PayloadBuilder, ProbeConfig, RequestSnapshot,
    ResponseSnapshot, SdkKind, DEFAULT_MAX_BODY_SIZE,
};
use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use http::{HeaderMap, HeaderValue, Method, StatusCode};

fn json_body(items: usize) -> Bytes {
    let items: Vec<String> = (0..items)
        .map(|i| format!(r#"{{"id":{i},"email":"user{i}@example.com","password":"pw{i}"}}"#))
        .collect();
    Bytes::from(format!(r#"{{"items":[{}]}}"#, items.join(",")))
}

fn exchange(body: &Bytes) -> Exchange {
    let mut headers = HeaderMap::new();
    headers.insert("content-type", HeaderValue::from_static("application/json"));
    headers.insert("authorization", HeaderValue::from_static("Bearer token"));

    let request = RequestSnapshot::new(Method::POST, "/orders/7?token=abc&page=1".parse().unwrap())
        .with_headers(headers.clone())
        .with_route(
            Some("/orders/{id}".to_string()),
            [("id".to_string(), "7".to_string())],
        )
        .with_body(CapturedBody::from_bytes(body, DEFAULT_MAX_BODY_SIZE));
    let response = ResponseSnapshot::new(StatusCode::OK)
        .with_headers(headers)
        .with_body(CapturedBody::from_bytes(body, DEFAULT_MAX_BODY_SIZE));

    Exchange {
        sdk: SdkKind::Tower,
        correlation_id: CorrelationId::new(),
        parent_id: None,
        request,
        response,
        errors: Vec::new(),
        extra: None,
    }
}

fn bench_build(c: &mut Criterion) {
    let builder = PayloadBuilder::new(
        &ProbeConfig::new()
            .service_name("bench")
            .redact_headers(["Authorization"])
            .redact_request_body(["password", "token"])
            .redact_response_body(["$.items[*].email"]),
    )
    .unwrap();
    let mut group = c.benchmark_group("payload_build");

    for items in [1, 10, 100] {
        let body = json_body(items);
        group.bench_with_input(BenchmarkId::from_parameter(items), &body, |b, body| {
            b.iter_batched(
                || exchange(body),
                |exchange| builder.build(black_box(exchange)),
                criterion::BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

fn bench_serialize(c: &mut Criterion) {
    let builder = PayloadBuilder::new(&ProbeConfig::new()).unwrap();
    let payload = builder.build(exchange(&json_body(10)));

    c.bench_function("payload_to_json", |b| {
        b.iter(|| serde_json::to_vec(black_box(&payload)).unwrap())
    });
}

criterion_group!(benches, bench_build, bench_serialize);
criterion_main!(benches);
