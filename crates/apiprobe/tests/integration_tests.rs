//! End-to-end tests through the tower adapter.
//!
//! These drive real `tower` stacks the way a hyper server would and check
//! both what the client receives and what gets published.

use apiprobe::prelude::*;
use apiprobe::{
    BodyRecord, CapturedBody, RequestSnapshot, ResponseSnapshot, TeeRequestBody, PARENT_ID_HEADER,
};
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use std::convert::Infallible;
use std::time::Duration;
use tower::{service_fn, Layer, ServiceBuilder, ServiceExt};

type HandlerRequest = Request<TeeRequestBody<Full<Bytes>>>;

fn probe(config: ProbeConfig) -> (Probe, MemoryExporter) {
    let memory = MemoryExporter::new();
    let probe = Probe::new(config, Publisher::inline(memory.clone())).unwrap();
    (probe, memory)
}

fn json_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from_static(body.as_bytes())))
        .unwrap()
}

// ============================================================================
// Redaction
// ============================================================================

mod redaction_tests {
    use super::*;

    #[tokio::test]
    async fn test_users_scenario() {
        let (probe, memory) = probe(
            ProbeConfig::new()
                .service_name("users-api")
                .redact_headers(["Authorization"])
                .redact_response_body(["ssn"]),
        );
        let routes = TemplateRoutes::new(["/users/{id}"]).unwrap();
        let svc = ServiceBuilder::new()
            .layer(ProbeLayer::new(probe).with_resolver(routes))
            .service(service_fn(|_req: HandlerRequest| async {
                Ok::<_, Infallible>(json_response(
                    StatusCode::OK,
                    r#"{"id":42,"ssn":"555-00-1111"}"#,
                ))
            }));

        let req = Request::get("/users/42")
            .header("Authorization", "secret123")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let res = svc.oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let client_bytes = res.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&client_bytes[..], br#"{"id":42,"ssn":"555-00-1111"}"#);

        let payloads = memory.payloads();
        assert_eq!(payloads.len(), 1);
        let payload = &payloads[0];
        assert_eq!(payload.service_name, "users-api");
        assert_eq!(payload.request.path_template.as_deref(), Some("/users/{id}"));
        assert_eq!(payload.request.path_params["id"], "42");
        assert_eq!(
            payload.request.headers.get("authorization"),
            Some(&["[MASKED]".to_string()][..])
        );
        assert_eq!(
            payload.response.body.json(),
            Some(&json!({"id": 42, "ssn": "[MASKED]"}))
        );
    }

    #[tokio::test]
    async fn test_request_body_and_params_redacted_handler_sees_original() {
        let (probe, memory) = probe(
            ProbeConfig::new().redact_request_body(["password", "token", "$.card.number"]),
        );
        let svc = ProbeLayer::new(probe).layer(service_fn(|req: HandlerRequest| async move {
            let body = req.into_body().collect().await.unwrap().to_bytes();
            let seen: Value = serde_json::from_slice(&body).unwrap();
            assert_eq!(seen["password"], "hunter2");
            assert_eq!(seen["card"]["number"], "4111");
            Ok::<_, Infallible>(Response::new(Full::new(Bytes::new())))
        }));

        let req = Request::post("/login?token=abc&page=2")
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from_static(
                br#"{"user":"ann","password":"hunter2","card":{"number":"4111","exp":"12/30"}}"#,
            )))
            .unwrap();
        drop(svc.oneshot(req).await.unwrap());

        let request = &memory.payloads()[0].request;
        assert_eq!(
            request.body.json(),
            Some(&json!({
                "user": "ann",
                "password": "[MASKED]",
                "card": {"number": "[MASKED]", "exp": "12/30"}
            }))
        );
        assert_eq!(request.query_params["token"], vec!["[MASKED]".to_string()]);
        assert_eq!(request.query_params["page"], vec!["2".to_string()]);
        assert!(!request.query_string.contains("abc"));
        assert!(!request.url.contains("abc"));
    }
}

// ============================================================================
// Error reporting and panics
// ============================================================================

mod error_tests {
    use super::*;
    use futures_util::FutureExt;
    use std::panic::AssertUnwindSafe;
    use tower_http::catch_panic::CatchPanicLayer;

    #[derive(Debug)]
    struct StepError(&'static str);

    impl std::fmt::Display for StepError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "step {} failed", self.0)
        }
    }

    impl std::error::Error for StepError {}

    async fn helper_that_reports(step: &'static str) {
        tokio::task::yield_now().await;
        report_error(&StepError(step));
    }

    #[tokio::test]
    async fn test_errors_keep_report_order() {
        let (probe, memory) = probe(ProbeConfig::new());
        let svc = ProbeLayer::new(probe).layer(service_fn(|_req: HandlerRequest| async {
            helper_that_reports("e1").await;
            helper_that_reports("e2").await;
            helper_that_reports("e3").await;
            Ok::<_, Infallible>(Response::new(Full::new(Bytes::from_static(b"done"))))
        }));

        let res = svc.oneshot(Request::new(Full::new(Bytes::new()))).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        res.into_body().collect().await.unwrap();

        let payload = &memory.payloads()[0];
        let messages: Vec<_> = payload.errors.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, ["step e1 failed", "step e2 failed", "step e3 failed"]);
        assert!(payload.errors.iter().all(|e| e.error_type.ends_with("StepError")));
        assert!(payload.is_error());
    }

    #[tokio::test]
    async fn test_panic_reaches_outer_recovery_layer() {
        let (probe, memory) = probe(ProbeConfig::new());
        let svc = ServiceBuilder::new()
            .layer(CatchPanicLayer::new())
            .layer(ProbeLayer::new(probe))
            .service(service_fn(|_req: HandlerRequest| async {
                report_error(&StepError("validate"));
                if true {
                    panic!("database pool poisoned");
                }
                Ok::<_, Infallible>(Response::new(Full::new(Bytes::new())))
            }));

        let res = svc.oneshot(Request::new(Full::new(Bytes::new()))).await.unwrap();
        // the recovery layer, not the probe, produced this response
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let payload = &memory.payloads()[0];
        assert_eq!(payload.response.status, 500);
        assert_eq!(payload.errors.len(), 2);
        assert_eq!(payload.errors[0].message, "step validate failed");
        assert_eq!(payload.errors[1].kind, ErrorKind::Panic);
        assert_eq!(payload.errors[1].message, "database pool poisoned");
    }

    #[tokio::test]
    async fn test_panic_value_is_unchanged() {
        let (probe, memory) = probe(ProbeConfig::new());
        let svc = ProbeLayer::new(probe).layer(service_fn(|_req: HandlerRequest| async {
            if true {
                std::panic::panic_any(42_u32);
            }
            Ok::<_, Infallible>(Response::new(Full::new(Bytes::new())))
        }));

        let panic = AssertUnwindSafe(svc.oneshot(Request::new(Full::new(Bytes::new()))))
            .catch_unwind()
            .await
            .err()
            .unwrap();
        assert_eq!(panic.downcast_ref::<u32>(), Some(&42));
        assert_eq!(memory.len(), 1);
    }
}

// ============================================================================
// Transparency
// ============================================================================

mod transparency_tests {
    use super::*;

    async fn echo(req: HandlerRequest) -> Result<Response<Full<Bytes>>, Infallible> {
        let content_type = req.headers().get("content-type").cloned();
        let body = req.into_body().collect().await.unwrap().to_bytes();
        let mut res = Response::builder()
            .status(StatusCode::ACCEPTED)
            .header("x-echo", "1");
        if let Some(ct) = content_type {
            res = res.header("content-type", ct);
        }
        Ok(res.body(Full::new(body)).unwrap())
    }

    async fn roundtrip(config: ProbeConfig, content_type: &str, body: Vec<u8>) -> (Response<Bytes>, Payload) {
        let (probe, memory) = probe(config);
        let svc = ProbeLayer::new(probe).layer(service_fn(echo));
        let req = Request::put("/blob")
            .header("content-type", content_type)
            .body(Full::new(Bytes::from(body)))
            .unwrap();
        let res = svc.oneshot(req).await.unwrap();
        let (parts, body) = res.into_parts();
        let bytes = body.collect().await.unwrap().to_bytes();
        (Response::from_parts(parts, bytes), memory.payloads().remove(0))
    }

    #[tokio::test]
    async fn test_client_sees_exact_bytes_status_and_headers() {
        let bodies: Vec<(&str, Vec<u8>)> = vec![
            ("application/json", br#"{"password":"x","n":[1,2,3]}"#.to_vec()),
            ("application/octet-stream", vec![0, 159, 146, 150, 255]),
            ("text/plain", "héllo wörld".as_bytes().to_vec()),
            ("application/json", b"{not json".to_vec()),
            ("text/plain", Vec::new()),
        ];
        for (content_type, body) in bodies {
            for capture in [true, false] {
                let config = ProbeConfig::new()
                    .redact_request_body(["password"])
                    .redact_response_body(["password"])
                    .capture_request_body(capture)
                    .capture_response_body(capture);
                let (res, _) = roundtrip(config, content_type, body.clone()).await;
                assert_eq!(res.status(), StatusCode::ACCEPTED);
                assert_eq!(res.headers()["x-echo"], "1");
                assert_eq!(&res.body()[..], &body[..]);
            }
        }
    }

    #[tokio::test]
    async fn test_large_body_truncated_in_payload_only() {
        let body = format!("{{\"data\":\"{}\"}}", "x".repeat(64)).into_bytes();
        let config = ProbeConfig::new().max_body_size(16);
        let (res, payload) = roundtrip(config, "application/json", body.clone()).await;

        assert_eq!(&res.body()[..], &body[..]);
        for record in [&payload.request.body, &payload.response.body] {
            assert!(record.is_truncated());
            assert_eq!(record.size(), body.len());
            assert!(matches!(record, BodyRecord::Opaque { .. }));
        }
    }

    #[tokio::test]
    async fn test_malformed_json_is_opaque() {
        let (_, payload) = roundtrip(ProbeConfig::new(), "application/json", b"{oops".to_vec()).await;
        assert!(matches!(
            payload.response.body,
            BodyRecord::Opaque { truncated: false, size: 5, .. }
        ));
    }

    #[tokio::test]
    async fn test_skip_prefix_bypasses_capture() {
        let (probe, memory) = probe(ProbeConfig::new().skip_path_prefix("/static/"));
        let svc = ProbeLayer::new(probe).layer(service_fn(echo));
        let res = svc
            .oneshot(Request::get("/static/app.js").body(Full::new(Bytes::new())).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::ACCEPTED);
        res.into_body().collect().await.unwrap();
        assert!(memory.is_empty());
    }
}

// ============================================================================
// Concurrency
// ============================================================================

mod concurrency_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_are_isolated() {
        let (probe, memory) = probe(ProbeConfig::new());
        let svc = ProbeLayer::new(probe).layer(service_fn(|req: HandlerRequest| async move {
            let n = req.headers()["x-n"].to_str().unwrap().to_string();
            req.into_body().collect().await.unwrap();
            let ctx = ProbeContext::current().unwrap();
            for _ in 0..3 {
                tokio::task::yield_now().await;
                ctx.report_message(format!("request {n}"));
            }
            Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(n))))
        }));

        let mut handles = Vec::new();
        for n in 0..32 {
            let svc = svc.clone();
            handles.push(tokio::spawn(async move {
                let req = Request::post("/work")
                    .header("x-n", n.to_string())
                    .body(Full::new(Bytes::from(format!("body {n}"))))
                    .unwrap();
                let res = svc.oneshot(req).await.unwrap();
                let bytes = res.into_body().collect().await.unwrap().to_bytes();
                assert_eq!(bytes, n.to_string());
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let payloads = memory.payloads();
        assert_eq!(payloads.len(), 32);
        let mut ids = std::collections::HashSet::new();
        for payload in &payloads {
            assert!(ids.insert(payload.correlation_id));
            let n = &payload.request.headers.get("x-n").unwrap()[0];
            assert_eq!(payload.errors.len(), 3);
            assert!(payload.errors.iter().all(|e| e.message == format!("request {n}")));
            match &payload.request.body {
                BodyRecord::Text { text, .. } => assert_eq!(text, &format!("body {n}")),
                other => panic!("unexpected body record {other:?}"),
            }
        }
    }
}

// ============================================================================
// Publishing and correlation
// ============================================================================

mod publish_tests {
    use super::*;

    #[tokio::test]
    async fn test_background_publisher_writes_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payloads.jsonl");
        let publisher = Publisher::background(FileExporter::new(&path).unwrap(), 16).unwrap();
        let probe = Probe::new(ProbeConfig::new().service_name("files"), publisher.clone()).unwrap();

        let svc = ProbeLayer::new(probe).layer(service_fn(|_req: HandlerRequest| async {
            Ok::<_, Infallible>(json_response(StatusCode::OK, r#"{"ok":true}"#))
        }));
        for _ in 0..3 {
            let res = svc
                .clone()
                .oneshot(Request::get("/ping").body(Full::new(Bytes::new())).unwrap())
                .await
                .unwrap();
            res.into_body().collect().await.unwrap();
        }

        publisher.flush().unwrap();
        publisher.shutdown().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<Payload> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert!(lines.iter().all(|p| p.service_name == "files" && p.response.status == 200));
        assert_eq!(publisher.stats().published, 3);
    }

    #[tokio::test]
    async fn test_outgoing_call_is_linked_to_parent() {
        let (probe, memory) = probe(ProbeConfig::new());
        let svc = ProbeLayer::new(probe).layer(service_fn(|_req: HandlerRequest| async {
            let ctx = ProbeContext::current().unwrap();
            let mut outgoing = RequestSnapshot::new(
                http::Method::GET,
                "http://billing.internal/invoices".parse().unwrap(),
            );
            ctx.inject_headers(&mut outgoing.headers);
            let reply = ResponseSnapshot::new(StatusCode::OK)
                .with_body(CapturedBody::from_bytes(&Bytes::from_static(b"[]"), 1024));
            ctx.record_outgoing(outgoing, reply);
            Ok::<_, Infallible>(Response::new(Full::new(Bytes::new())))
        }));

        let res = svc.oneshot(Request::new(Full::new(Bytes::new()))).await.unwrap();
        res.into_body().collect().await.unwrap();

        let payloads = memory.wait_for(2, Duration::from_secs(1));
        let outgoing = payloads.iter().find(|p| p.sdk == SdkKind::Outgoing).unwrap();
        let inbound = payloads.iter().find(|p| p.sdk == SdkKind::Tower).unwrap();
        assert_eq!(outgoing.parent_id, Some(inbound.correlation_id));
        assert_eq!(
            outgoing.request.headers.get(PARENT_ID_HEADER),
            Some(&[inbound.correlation_id.to_string()][..])
        );
    }

    #[tokio::test]
    async fn test_upstream_parent_id_is_recorded() {
        let (probe, memory) = probe(ProbeConfig::new());
        let svc = ProbeLayer::new(probe).layer(service_fn(|_req: HandlerRequest| async {
            Ok::<_, Infallible>(Response::new(Full::new(Bytes::new())))
        }));
        let parent = CorrelationId::new();
        let req = Request::get("/child")
            .header(PARENT_ID_HEADER, parent.to_string())
            .body(Full::new(Bytes::new()))
            .unwrap();
        svc.oneshot(req).await.unwrap().into_body().collect().await.unwrap();

        assert_eq!(memory.payloads()[0].parent_id, Some(parent));
    }
}
