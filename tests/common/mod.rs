#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::Body,
    extract::Path,
    http::{header, Request, StatusCode},
    routing::post,
    Router,
};
use reconnect::{
    broker::LocalBroker,
    profiles::{self, NewProfile, Role},
    session, AppState, Config, ShutdownSignal,
};
use tokio::sync::watch;
use tower::ServiceExt;
use tower_sessions::Session;
use uuid::Uuid;

pub struct TestApp {
    pub state: AppState,
    pub router: Router,
    pub shutdown: watch::Sender<bool>,
}

async fn login(session: Session, Path(user_id): Path<Uuid>) -> StatusCode {
    session::sign_in(&session, user_id).await.unwrap();
    StatusCode::NO_CONTENT
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(Config::default()).await
    }

    pub async fn with_config(config: Config) -> Self {
        let db_pool = reconnect::db::memory().await.unwrap();
        let (shutdown, signal) = ShutdownSignal::channel();
        let state = AppState {
            db_pool,
            broker: Arc::new(LocalBroker::new()),
            config: Arc::new(config),
            shutdown: signal,
        };

        // Stands in for the external sign-in flow.
        let router = reconnect::routes()
            .route("/test/login/{user_id}", post(login))
            .layer(session::layer(60))
            .with_state(state.clone());

        Self { state, router, shutdown }
    }

    pub async fn user(&self, username: &str, first: &str, last: &str) -> Uuid {
        profiles::register(&self.state.db_pool, NewProfile {
            username: username.to_owned(),
            first_name: first.to_owned(),
            last_name: last.to_owned(),
            enrollment_number: format!("EN-{username}"),
            role: Role::Student,
        })
        .await
        .unwrap()
        .id
    }

    /// Signs `user_id` in and returns the session cookie (`id=...`).
    pub async fn cookie(&self, user_id: Uuid) -> String {
        let resp = self
            .router
            .clone()
            .oneshot(
                Request::post(format!("/test/login/{user_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let set_cookie = resp.headers()[header::SET_COOKIE].to_str().unwrap();
        set_cookie.split(';').next().unwrap().to_owned()
    }

    pub async fn request(
        &self,
        method: &str,
        uri: &str,
        cookie: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        let body = match body {
            Some(json) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };

        let resp = self.router.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };
        (status, json)
    }
}
