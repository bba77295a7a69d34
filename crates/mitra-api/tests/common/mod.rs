#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response};
use http_body_util::BodyExt;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use mitra_api::auth::create_token;
use mitra_api::storage::Storage;
use mitra_api::{AppState, AppStateInner, build_router};
use mitra_db::Database;
use mitra_gateway::{Actions, Dispatcher, Heartbeat, RoomKey};
use mitra_types::models::Role;

pub const SECRET: &str = "integration-test-secret";

pub struct TestApp {
    pub state: AppState,
    pub router: Router,
}

pub struct TestUser {
    pub id: Uuid,
    pub name: String,
    pub token: String,
}

impl TestApp {
    pub async fn new(public_url: &str) -> Self {
        Self::with_heartbeat(public_url, Heartbeat::default()).await
    }

    pub async fn with_heartbeat(public_url: &str, heartbeat: Heartbeat) -> Self {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let dir = std::env::temp_dir().join(format!("mitra-test-{}", Uuid::new_v4()));
        let storage = Storage::new(dir).await.unwrap();
        let state: AppState = Arc::new(AppStateInner {
            actions: Actions::new(db, Dispatcher::new()),
            storage,
            jwt_secret: SECRET.into(),
            public_url: public_url.into(),
            heartbeat,
        });
        let router = build_router(state.clone());
        Self { state, router }
    }

    pub fn db(&self) -> &Database {
        self.state.actions.db()
    }

    /// Serve the router on an ephemeral port.
    pub async fn serve(&self) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = self.router.clone();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    /// Socket commands are handled asynchronously; poll until a join lands.
    pub async fn wait_for_members(&self, room: RoomKey, count: usize) {
        for _ in 0..100 {
            if self.state.actions.dispatcher().room_size(room).await == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("room {room:?} never reached {count} members");
    }
}

pub fn user(name: &str, role: Role) -> TestUser {
    let id = Uuid::new_v4();
    TestUser {
        id,
        name: name.into(),
        token: create_token(SECRET, id, name, role).unwrap(),
    }
}

pub fn json_request(method: &str, uri: &str, token: Option<&str>, body: Option<serde_json::Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

pub async fn body_bytes(resp: Response<Body>) -> Vec<u8> {
    resp.into_body().collect().await.unwrap().to_bytes().to_vec()
}

pub async fn body_json<T: DeserializeOwned>(resp: Response<Body>) -> T {
    serde_json::from_slice(&body_bytes(resp).await).unwrap()
}
