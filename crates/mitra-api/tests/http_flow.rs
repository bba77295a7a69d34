mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;

use mitra_db::messages::NewMessage;
use mitra_types::api::{ErrorBody, ExitQrResponse, ExitResponse, RegistrationEnvelope, UploadResponse};
use mitra_types::models::{AttendanceStats, Message, Registration, Role};

use common::{TestApp, body_bytes, body_json, json_request, user};

#[tokio::test]
async fn health_is_public_and_api_requires_token() {
    let app = TestApp::new("http://localhost:3000").await;

    let resp = app
        .router
        .clone()
        .oneshot(json_request("GET", "/api/health", None, None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let health: Value = body_json(resp).await;
    assert_eq!(health["status"], "ok");
    assert_eq!(health["connections"], 0);

    let uri = format!("/api/chatbox/events/{}/messages", Uuid::new_v4());
    let resp = app
        .router
        .clone()
        .oneshot(json_request("GET", &uri, None, None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let err: ErrorBody = body_json(resp).await;
    assert_eq!(err.error, "unauthorized");

    let resp = app
        .router
        .clone()
        .oneshot(json_request("GET", &uri, Some("not-a-jwt"), None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn history_pages_backwards_and_pin_is_exclusive() {
    let app = TestApp::new("http://localhost:3000").await;
    let volunteer = user("asha", Role::Volunteer);
    let organizer = user("ravi", Role::Organizer);
    let event_id = Uuid::new_v4();

    let start = Utc::now();
    let mut sent = Vec::new();
    for i in 0..25 {
        let message = app
            .db()
            .insert_message(
                NewMessage {
                    event_id,
                    sender_id: volunteer.id,
                    sender_name: volunteer.name.clone(),
                    text: Some(format!("m{i}")),
                    attachment: None,
                    reply_to: None,
                },
                start + chrono::Duration::milliseconds(i),
            )
            .unwrap();
        sent.push(message);
    }

    let uri = format!("/api/chatbox/events/{event_id}/messages?limit=20");
    let resp = app
        .router
        .clone()
        .oneshot(json_request("GET", &uri, Some(&volunteer.token), None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let latest: Vec<Message> = body_json(resp).await;
    assert_eq!(latest.len(), 20);
    assert_eq!(latest[0].id, sent[5].id);

    let uri = format!(
        "/api/chatbox/events/{event_id}/messages?limit=20&before={}",
        latest[0].id
    );
    let resp = app
        .router
        .clone()
        .oneshot(json_request("GET", &uri, Some(&volunteer.token), None))
        .await
        .unwrap();
    let older: Vec<Message> = body_json(resp).await;
    assert_eq!(older.len(), 5);
    assert_eq!(older[0].id, sent[0].id);

    // volunteers cannot pin
    let pin_uri = |id: Uuid| format!("/api/chatbox/messages/{id}/pin");
    let resp = app
        .router
        .clone()
        .oneshot(json_request(
            "PATCH",
            &pin_uri(sent[0].id),
            Some(&volunteer.token),
            Some(json!({ "eventId": event_id })),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let resp = app
        .router
        .clone()
        .oneshot(json_request(
            "PATCH",
            &pin_uri(sent[0].id),
            Some(&organizer.token),
            Some(json!({ "eventId": event_id })),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let pinned: Message = body_json(resp).await;
    assert!(pinned.is_pinned);

    let resp = app
        .router
        .clone()
        .oneshot(json_request(
            "PATCH",
            &pin_uri(sent[1].id),
            Some(&organizer.token),
            Some(json!({ "eventId": event_id, "pinned": true })),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let err: ErrorBody = body_json(resp).await;
    assert_eq!(err.error, "pin_conflict");

    let uri = format!("/api/chatbox/events/{event_id}/pinned");
    let resp = app
        .router
        .clone()
        .oneshot(json_request("GET", &uri, Some(&volunteer.token), None))
        .await
        .unwrap();
    let current: Option<Message> = body_json(resp).await;
    assert_eq!(current.map(|m| m.id), Some(sent[0].id));
}

#[tokio::test]
async fn attendance_entry_exit_and_locks() {
    let app = TestApp::new("http://localhost:3000").await;
    let volunteer = user("asha", Role::Volunteer);
    let organizer = user("ravi", Role::Organizer);
    let event_id = Uuid::new_v4();

    let resp = app
        .router
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/registrations",
            Some(&volunteer.token),
            Some(json!({ "eventId": event_id })),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let RegistrationEnvelope { registration } = body_json(resp).await;
    let reg_id = registration.registration_id;

    let attendance = |token: &str, value: bool| {
        json_request(
            "PATCH",
            &format!("/api/registrations/{reg_id}/attendance"),
            Some(token),
            Some(json!({ "hasAttended": value })),
        )
    };

    let resp = app
        .router
        .clone()
        .oneshot(attendance(&volunteer.token, true))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let resp = app
        .router
        .clone()
        .oneshot(attendance(&organizer.token, true))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let first: RegistrationEnvelope = body_json(resp).await;
    let in_time = first.registration.in_time.unwrap();

    // scanning the entry code again keeps the first entry time
    let resp = app
        .router
        .clone()
        .oneshot(attendance(&organizer.token, true))
        .await
        .unwrap();
    let again: RegistrationEnvelope = body_json(resp).await;
    assert_eq!(again.registration.in_time, Some(in_time));

    let resp = app
        .router
        .clone()
        .oneshot(attendance(&organizer.token, false))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let err: ErrorBody = body_json(resp).await;
    assert_eq!(err.error, "attendance_locked");

    let resp = app
        .router
        .clone()
        .oneshot(json_request(
            "GET",
            &format!("/api/registrations/{reg_id}/exit-qr"),
            Some(&volunteer.token),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let ExitQrResponse { exit_qr_token } = body_json(resp).await;

    let exit_uri = format!("/api/registrations/exit/{exit_qr_token}");
    let resp = app
        .router
        .clone()
        .oneshot(json_request("POST", &exit_uri, Some(&organizer.token), None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let exit: ExitResponse = body_json(resp).await;
    assert_eq!(exit.registration_id, reg_id);

    let resp = app
        .router
        .clone()
        .oneshot(json_request("POST", &exit_uri, Some(&organizer.token), None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let err: ErrorBody = body_json(resp).await;
    assert_eq!(err.error, "exit_token_used");

    let resp = app
        .router
        .clone()
        .oneshot(json_request(
            "GET",
            &format!("/api/registrations/event/{event_id}"),
            Some(&organizer.token),
            None,
        ))
        .await
        .unwrap();
    let rows: Vec<Registration> = body_json(resp).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].out_time, Some(exit.out_time));

    let resp = app
        .router
        .clone()
        .oneshot(json_request(
            "GET",
            &format!("/api/registrations/event/{event_id}/stats"),
            Some(&organizer.token),
            None,
        ))
        .await
        .unwrap();
    let stats: AttendanceStats = body_json(resp).await;
    assert_eq!(stats.checked_out, 1);
    assert_eq!(stats.currently_present, 0);
}

#[tokio::test]
async fn manual_times_reject_inverted_range() {
    let app = TestApp::new("http://localhost:3000").await;
    let volunteer = user("asha", Role::Volunteer);
    let organizer = user("ravi", Role::Organizer);
    let registration = app
        .db()
        .create_registration(Uuid::new_v4(), volunteer.id, Utc::now())
        .unwrap();
    let reg_id = registration.registration_id;

    let resp = app
        .router
        .clone()
        .oneshot(json_request(
            "PATCH",
            &format!("/api/registrations/{reg_id}/in-time"),
            Some(&organizer.token),
            Some(json!({ "inTime": "2026-03-01T09:00:00Z" })),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let RegistrationEnvelope { registration } = body_json(resp).await;
    assert!(!registration.has_attended);

    let resp = app
        .router
        .clone()
        .oneshot(json_request(
            "PATCH",
            &format!("/api/registrations/{reg_id}/out-time"),
            Some(&organizer.token),
            Some(json!({ "outTime": "2026-03-01T08:00:00Z" })),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = app
        .router
        .clone()
        .oneshot(json_request(
            "PATCH",
            &format!("/api/registrations/{reg_id}/out-time"),
            Some(&organizer.token),
            Some(json!({ "outTime": "2026-03-01T17:30:00Z" })),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

fn multipart(filename: &str, mime: &str, data: &[u8]) -> (String, Vec<u8>) {
    let boundary = "mitra-test-boundary";
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(
        format!("Content-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n")
            .as_bytes(),
    );
    body.extend_from_slice(format!("Content-Type: {mime}\r\n\r\n").as_bytes());
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    (format!("multipart/form-data; boundary={boundary}"), body)
}

fn upload_request(token: &str, filename: &str, mime: &str, data: &[u8]) -> Request<Body> {
    let (content_type, body) = multipart(filename, mime, data);
    Request::builder()
        .method("POST")
        .uri("/api/chatbox/upload")
        .header("authorization", format!("Bearer {token}"))
        .header("content-type", content_type)
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test]
async fn upload_then_download_with_etag() {
    let app = TestApp::new("http://files.test").await;
    let volunteer = user("asha", Role::Volunteer);

    let resp = app
        .router
        .clone()
        .oneshot(upload_request(&volunteer.token, "notes.txt", "text/plain", b"hello mitra"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let uploaded: UploadResponse = body_json(resp).await;
    assert_eq!(uploaded.file_url.filename, "notes.txt");
    assert_eq!(uploaded.file_type, "text/plain");
    assert_eq!(uploaded.size_bytes, 11);

    let path = uploaded
        .file_url
        .url
        .strip_prefix("http://files.test")
        .unwrap()
        .to_string();
    let resp = app
        .router
        .clone()
        .oneshot(json_request("GET", &path, Some(&volunteer.token), None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let etag = resp.headers()["etag"].to_str().unwrap().to_string();
    assert_eq!(body_bytes(resp).await, b"hello mitra");

    let req = Request::builder()
        .uri(&path)
        .header("authorization", format!("Bearer {}", volunteer.token))
        .header("if-none-match", &etag)
        .body(Body::empty())
        .unwrap();
    let resp = app.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_MODIFIED);
}

#[tokio::test]
async fn upload_rejects_bad_type_and_oversize() {
    let app = TestApp::new("http://files.test").await;
    let volunteer = user("asha", Role::Volunteer);

    let resp = app
        .router
        .clone()
        .oneshot(upload_request(
            &volunteer.token,
            "run.exe",
            "application/x-msdownload",
            b"MZ",
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let err: ErrorBody = body_json(resp).await;
    assert_eq!(err.error, "unsupported_type");

    let big = vec![0u8; 10 * 1024 * 1024 + 1];
    let resp = app
        .router
        .clone()
        .oneshot(upload_request(&volunteer.token, "big.png", "image/png", &big))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let err: ErrorBody = body_json(resp).await;
    assert!(err.message.contains("10 MB"));
}
