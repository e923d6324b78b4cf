//! Axum + Askama admin surface for xrate: table view and manual refresh.

use std::net::SocketAddr;
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{info, warn};
use xrate_core::IndicatorRecord;
use xrate_sync::SyncEngine;

pub const CRATE_NAME: &str = "xrate-web";

pub const UPDATED_NOTICE: &str = "Data has been updated successfully.";

#[derive(Clone)]
pub struct AppState {
    pub engine: SyncEngine,
}

impl AppState {
    pub fn new(engine: SyncEngine) -> Self {
        Self { engine }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WebIndicator {
    pub item_id: i64,
    pub name: String,
    pub title: String,
    pub price: String,
    pub high_price: String,
    pub low_price: String,
    pub open_price: String,
    pub change_value: String,
    pub change_percent: String,
    pub updated_at: String,
    pub dt: String,
    pub t: String,
    pub prices: String,
}

impl From<IndicatorRecord> for WebIndicator {
    fn from(r: IndicatorRecord) -> Self {
        Self {
            item_id: r.item_id,
            name: r.name,
            title: r.title,
            price: r.price,
            high_price: r.high_price,
            low_price: r.low_price,
            open_price: r.open_price,
            change_value: r.change_value,
            change_percent: format!("{:.2}", r.change_percent),
            updated_at: r.updated_at,
            dt: r.dt,
            t: r.t,
            prices: r.prices,
        }
    }
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    rows: Vec<WebIndicator>,
    notice_class: String,
    notice_text: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/refresh", post(refresh_handler))
        .route("/api/indicators", get(indicators_json_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "admin surface listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub fn port_from_env() -> u16 {
    std::env::var("XRATE_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000)
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    render_table(&state, String::new(), String::new()).await
}

/// Runs a pass in-request and re-renders the table. Record-level failures still count
/// as an update; only a failed fetch changes the notice.
async fn refresh_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.engine.run_sync_pass().await {
        Ok(outcome) => {
            info!(
                pass_id = %outcome.pass_id,
                applied = outcome.applied(),
                failed = outcome.failed,
                "manual sync pass completed"
            );
            render_table(&state, "updated".into(), UPDATED_NOTICE.into()).await
        }
        Err(err) => {
            warn!(error = %err, "manual sync pass failed");
            render_table(&state, "error".into(), format!("Update failed: {err}")).await
        }
    }
}

async fn indicators_json_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.engine.store().list_all().await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => server_error(anyhow::Error::new(err)),
    }
}

async fn render_table(state: &AppState, notice_class: String, notice_text: String) -> Response {
    match state.engine.store().list_all().await {
        Ok(records) => render_html(IndexTemplate {
            rows: records.into_iter().map(WebIndicator::from).collect(),
            notice_class,
            notice_text,
        }),
        Err(err) => server_error(anyhow::Error::new(err)),
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};
    use xrate_adapters::TgjuWidgetSource;
    use xrate_storage::{HttpClientConfig, HttpFetcher, IndicatorStore, MemoryIndicatorStore};

    const USD_PAYLOAD: &str = r#"{"response":{"indicators":[{"item_id":"523875","name":"usd","title":"US Dollar","p":"50000","h":"50500","l":"49500","o":"49800","d":"200","dp":"0.4","updated_at":"2024-01-01 10:00:00"}]}}"#;

    fn state_for(uri: String, store: Arc<MemoryIndicatorStore>) -> AppState {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(2),
            ..Default::default()
        })
        .unwrap();
        let source = TgjuWidgetSource::new("tgju", uri, vec![523875]);
        AppState::new(SyncEngine::new(Arc::new(source), Arc::new(http), store))
    }

    async fn body_text(resp: Response) -> String {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(body.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn handler_smoke_get_index_empty() {
        let app = app(state_for("http://127.0.0.1:9".into(), Arc::new(MemoryIndicatorStore::new())));
        let resp = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let text = body_text(resp).await;
        assert!(text.contains("No data found in the database."));
        assert!(text.contains("Update Data"));
    }

    #[tokio::test]
    async fn refresh_runs_a_pass_and_renders_the_table() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(USD_PAYLOAD))
            .expect(1)
            .mount(&server)
            .await;
        let store = Arc::new(MemoryIndicatorStore::new());
        let app = app(state_for(server.uri(), store.clone()));

        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/refresh")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let text = body_text(resp).await;
        assert!(text.contains(UPDATED_NOTICE));
        assert!(text.contains("US Dollar"));
        assert!(text.contains("0.40"));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn refresh_with_unreachable_endpoint_keeps_existing_rows() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;
        let store = Arc::new(MemoryIndicatorStore::new());
        let mut existing = IndicatorRecord::blank(523875);
        existing.title = "US Dollar".into();
        store.upsert(&existing).await.unwrap();
        let app = app(state_for(server.uri(), store.clone()));

        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/refresh")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let text = body_text(resp).await;
        assert!(text.contains("Update failed"));
        assert!(text.contains("US Dollar"));
        assert_eq!(store.list_all().await.unwrap(), vec![existing]);
    }

    #[tokio::test]
    async fn table_cells_are_html_escaped() {
        let store = Arc::new(MemoryIndicatorStore::new());
        let mut rec = IndicatorRecord::blank(1);
        rec.title = "Gold & Silver".into();
        store.upsert(&rec).await.unwrap();
        let app = app(state_for("http://127.0.0.1:9".into(), store));

        let resp = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let text = body_text(resp).await;
        assert!(text.contains("Gold &amp; Silver"));
    }

    #[tokio::test]
    async fn indicators_json_lists_every_row() {
        let store = Arc::new(MemoryIndicatorStore::new());
        store.upsert(&IndicatorRecord::blank(2)).await.unwrap();
        store.upsert(&IndicatorRecord::blank(1)).await.unwrap();
        let app = app(state_for("http://127.0.0.1:9".into(), store));

        let resp = app
            .oneshot(Request::builder().uri("/api/indicators").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE].to_str().unwrap(),
            "application/json"
        );
        let rows: Vec<IndicatorRecord> = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(rows.iter().map(|r| r.item_id).collect::<Vec<_>>(), vec![1, 2]);
    }
}
