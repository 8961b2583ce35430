use std::sync::Arc;

use anyhow::Result;
use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use serde::Serialize;
use serde_json::Value;
use tower::ServiceExt;
use zimfarm_api::create_app;
use zimfarm_dispatcher::{NewRequestedTask, SchedulerService};
use zimfarm_domain::{
    CheckIn, EventReport, OfferRequest, PlatformPolicy, Resources, TaskStatus,
};
use zimfarm_infrastructure::{InMemoryStore, LoggingIpChangeListener};
use zimfarm_testing_utils::{test_config, RecordingNotifier};

fn app() -> Router {
    let service = SchedulerService::new(
        Arc::new(InMemoryStore::new()),
        PlatformPolicy::default(),
        Arc::new(RecordingNotifier::new()),
        Arc::new(LoggingIpChangeListener),
        86400,
    );
    create_app(Arc::new(service))
}

async fn call(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<&impl Serialize>,
    headers: &[(&str, &str)],
) -> Result<(StatusCode, Value)> {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(body)?))?,
        None => builder.body(Body::empty())?,
    };

    let response = app.clone().oneshot(request).await?;
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)?
    };
    Ok((status, value))
}

const NO_BODY: Option<&()> = None;

fn check_in(name: &str) -> CheckIn {
    CheckIn {
        worker_name: name.to_string(),
        resources: Resources::new(4, 4096, 4096),
        offliners: vec!["mwoffliner".to_string()],
        platform_overrides: Default::default(),
        cordoned: false,
        selfish: false,
        contexts: Default::default(),
    }
}

fn offer(name: &str) -> OfferRequest {
    OfferRequest {
        worker_name: name.to_string(),
        available: Resources::new(4, 4096, 4096),
        source_ip: None,
    }
}

fn new_task(schedule: &str) -> NewRequestedTask {
    NewRequestedTask {
        schedule_name: Some(schedule.to_string()),
        ..NewRequestedTask::new(test_config("mwoffliner"))
    }
}

#[tokio::test]
async fn test_health_endpoint() -> Result<()> {
    let (status, body) = call(&app(), Method::GET, "/health", NO_BODY, &[]).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    Ok(())
}

#[tokio::test]
async fn test_worker_protocol_round() -> Result<()> {
    let app = app();
    let (status, _) = call(
        &app,
        Method::POST,
        "/v1/workers/w1/check-in",
        Some(&check_in("w1")),
        &[],
    )
    .await?;
    assert_eq!(status, StatusCode::OK);

    let (status, created) = call(
        &app,
        Method::POST,
        "/v1/requested-tasks",
        Some(&new_task("wikipedia_fr")),
        &[],
    )
    .await?;
    assert_eq!(status, StatusCode::CREATED);
    let id = created["data"]["id"].as_str().unwrap_or_default().to_string();

    let (status, offered) = call(
        &app,
        Method::POST,
        "/v1/requested-tasks/offer",
        Some(&offer("w1")),
        &[("x-forwarded-for", "203.0.113.7, 10.0.0.1")],
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(offered["data"]["id"], id.as_str());

    let (_, worker) = call(&app, Method::GET, "/v1/workers/w1", NO_BODY, &[]).await?;
    assert_eq!(worker["data"]["last_ip"], "203.0.113.7");

    let claim = serde_json::json!({ "worker_name": "w1" });
    let claim_uri = format!("/v1/tasks/{id}/claim");
    let (status, task) = call(&app, Method::POST, &claim_uri, Some(&claim), &[]).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(task["data"]["status"], "reserved");

    let (status, body) = call(&app, Method::POST, &claim_uri, Some(&claim), &[]).await?;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["success"], false);

    let task_uri = format!("/v1/tasks/{id}");
    let report = EventReport::new(TaskStatus::Started);
    let (status, task) = call(&app, Method::PATCH, &task_uri, Some(&report), &[]).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(task["data"]["status"], "started");

    let cancel = serde_json::json!({ "canceled_by": "admin" });
    let (status, task) = call(
        &app,
        Method::POST,
        &format!("/v1/tasks/{id}/cancel"),
        Some(&cancel),
        &[],
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(task["data"]["status"], "cancel_requested");
    assert_eq!(task["data"]["canceled_by"], "admin");
    Ok(())
}

#[tokio::test]
async fn test_not_found_errors_use_error_envelope() -> Result<()> {
    let app = app();
    let id = uuid::Uuid::new_v4();

    let (status, body) = call(&app, Method::GET, &format!("/v1/tasks/{id}"), NO_BODY, &[]).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["type"], "TASK_NOT_FOUND");

    let (status, _) = call(&app, Method::POST, "/v1/requested-tasks/offer", Some(&offer("ghost")), &[]).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(
        &app,
        Method::DELETE,
        &format!("/v1/requested-tasks/{id}"),
        NO_BODY,
        &[],
    )
    .await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn test_unrequest_and_list_filter() -> Result<()> {
    let app = app();
    let mut ids = Vec::new();
    for schedule in ["wikipedia_fr", "wikipedia_en"] {
        let (_, created) = call(
            &app,
            Method::POST,
            "/v1/requested-tasks",
            Some(&new_task(schedule)),
            &[],
        )
        .await?;
        ids.push(created["data"]["id"].as_str().unwrap_or_default().to_string());
    }

    let (status, listed) = call(
        &app,
        Method::GET,
        "/v1/requested-tasks?schedule_names=wikipedia_en&offliners=mwoffliner",
        NO_BODY,
        &[],
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    let listed = listed["data"].as_array().cloned().unwrap_or_default();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["id"], ids[1].as_str());

    let uri = format!("/v1/requested-tasks/{}", ids[0]);
    let (status, _) = call(&app, Method::DELETE, &uri, NO_BODY, &[]).await?;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(&app, Method::GET, &uri, NO_BODY, &[]).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn test_invalid_request_is_bad_request() -> Result<()> {
    let app = app();
    let mut bad = new_task("empty");
    bad.config.offliner = " ".to_string();
    let (status, body) = call(&app, Method::POST, "/v1/requested-tasks", Some(&bad), &[]).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "BAD_REQUEST");

    let (status, _) = call(
        &app,
        Method::POST,
        "/v1/workers/w2/check-in",
        Some(&check_in("w1")),
        &[],
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn test_disabled_worker_gets_no_offer() -> Result<()> {
    let app = app();
    call(&app, Method::POST, "/v1/workers/w1/check-in", Some(&check_in("w1")), &[]).await?;
    call(&app, Method::POST, "/v1/requested-tasks", Some(&new_task("wikipedia_fr")), &[]).await?;

    let (status, worker) = call(&app, Method::POST, "/v1/workers/w1/disable", NO_BODY, &[]).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(worker["data"]["admin_disabled"], true);

    let (_, offered) = call(&app, Method::POST, "/v1/requested-tasks/offer", Some(&offer("w1")), &[]).await?;
    assert!(offered["data"].is_null());

    call(&app, Method::POST, "/v1/workers/w1/enable", NO_BODY, &[]).await?;
    let (_, offered) = call(&app, Method::POST, "/v1/requested-tasks/offer", Some(&offer("w1")), &[]).await?;
    assert!(offered["data"].is_object());

    let (_, workers) = call(&app, Method::GET, "/v1/workers", NO_BODY, &[]).await?;
    assert_eq!(workers["data"].as_array().map(Vec::len), Some(1));
    Ok(())
}
