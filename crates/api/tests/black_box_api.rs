use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::multipart::{Form, Part};
use serde_json::Value;
use tempfile::TempDir;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use shelfsync_api::app::build_app;
use shelfsync_api::app::services::{AppServices, InMemoryBackends};
use shelfsync_events::CatalogEvent;
use shelfsync_infra::config::Settings;
use shelfsync_infra::webhooks::WebhookSubscription;

struct TestServer {
    base_url: String,
    backends: InMemoryBackends,
    handle: tokio::task::JoinHandle<()>,
    _uploads: TempDir,
}

impl TestServer {
    async fn spawn() -> Self {
        let uploads = TempDir::new().unwrap();
        let settings = Settings::default()
            .with_uploads_dir(uploads.path())
            .with_import_chunk_size(2)
            .with_workers(1, 2)
            .with_webhook_retry(2, Duration::from_millis(5), Duration::from_millis(10))
            .with_webhook_timeout(Duration::from_secs(2));

        // Same router as prod, bound to an ephemeral port.
        let backends = InMemoryBackends::new();
        let services = Arc::new(AppServices::in_memory(&settings, backends.clone()).unwrap());
        let app = build_app(services);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            backends,
            handle,
            _uploads: uploads,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn csv_form(filename: &str, body: &'static [u8]) -> Form {
    Form::new().part("file", Part::bytes(body).file_name(filename.to_string()))
}

async fn job_eventually_terminal(client: &reqwest::Client, srv: &TestServer, job_id: &str) -> Value {
    for _ in 0..500 {
        let res = client.get(srv.url(&format!("/jobs/{job_id}"))).send().await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let job: Value = res.json().await.unwrap();
        if job["status"] == "completed" || job["status"] == "failed" {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} did not finish within timeout");
}

#[tokio::test]
async fn health_reports_ok() {
    let srv = TestServer::spawn().await;
    let res = reqwest::get(srv.url("/health")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["backend"], "in_memory");
}

#[tokio::test]
async fn upload_is_accepted_and_completes() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .post(srv.url("/imports"))
        .multipart(csv_form(
            "products.csv",
            b"sku,name,description\nA1,Widget,desc\nA1,Widget v2,desc2\n,NoSku,desc3\n",
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let accepted: Value = res.json().await.unwrap();
    assert_eq!(accepted["status"], "pending");
    let job_id = accepted["job_id"].as_str().unwrap().to_string();

    let job = job_eventually_terminal(&client, &srv, &job_id).await;
    assert_eq!(job["status"], "completed");
    assert_eq!(job["type"], "import");
    assert_eq!(job["progress"], 1.0);
    assert_eq!(job["processed_rows"], 2);
    assert_eq!(job["total_rows"], 3);
    assert_eq!(job["meta"]["skipped"], 1);
    assert!(job["finished_at"].is_string());
    assert_eq!(srv.backends.catalog.len(), 1);

    let listed: Vec<Value> = client
        .get(srv.url("/jobs?type=import&status=completed"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(listed.iter().any(|j| j["id"] == job_id.as_str()));
}

#[tokio::test]
async fn bad_uploads_are_rejected() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .post(srv.url("/imports"))
        .multipart(csv_form("products.txt", b"sku,name\nA1,Widget\n"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid_upload");

    let res = client
        .post(srv.url("/imports"))
        .multipart(Form::new().text("other", "value"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn job_lookup_errors() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client.get(srv.url("/jobs/not-a-uuid")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid_id");

    let unknown = shelfsync_core::JobId::new();
    let res = client.get(srv.url(&format!("/jobs/{unknown}"))).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = client.get(srv.url(&format!("/jobs/{unknown}/stream"))).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = client.get(srv.url("/jobs?status=sleeping")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn stream_emits_progress_until_terminal() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let accepted: Value = client
        .post(srv.url("/imports"))
        .multipart(csv_form("products.csv", b"sku,name\nS1,Saw\nS2,Sander\n"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let job_id = accepted["job_id"].as_str().unwrap().to_string();

    let res = client
        .get(srv.url(&format!("/jobs/{job_id}/stream")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert!(
        res.headers()[reqwest::header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream")
    );

    // The stream closes after the terminal snapshot.
    let body = tokio::time::timeout(Duration::from_secs(10), res.text()).await.unwrap().unwrap();
    assert!(body.contains("event: progress"));
    assert!(body.contains(r#""status":"completed""#));
}

#[tokio::test]
async fn webhook_test_endpoint() {
    let hook = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&hook)
        .await;

    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let unknown = shelfsync_core::SubscriptionId::new();
    let res = client
        .post(srv.url(&format!("/webhooks/{unknown}/test")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let sub_id = srv
        .backends
        .subscriptions
        .insert(WebhookSubscription::new(hook.uri(), CatalogEvent::ProductCreated).with_secret("k"));
    let res = client
        .post(srv.url(&format!("/webhooks/{sub_id}/test")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let accepted: Value = res.json().await.unwrap();
    let job_id = accepted["job_id"].as_str().unwrap().to_string();

    let job = job_eventually_terminal(&client, &srv, &job_id).await;
    assert_eq!(job["status"], "completed");
    assert_eq!(job["type"], "webhook_test");
    assert_eq!(job["meta"]["status_code"], 200);
}
