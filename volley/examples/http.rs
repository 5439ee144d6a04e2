//! `cargo run --example http [health-check|create-user] [config.json]`
//!
//! Set `TARGET_URL` to point at the service (default `http://localhost:3000`).
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde_json::json;
use tracing_subscriber::EnvFilter;
use volley::{BoxError, Iteration, JsonFileReporter, RunConfig, RunController};

// Ramping health check against `GET /`, with the usual thresholds
const HEALTH_CHECK: &str = r#"{
    "name": "ramping_health_check",
    "scenario": {
        "executor": "ramping-arrival-rate",
        "timeUnit": "1s",
        "startRate": 10,
        "preAllocatedVUs": 50,
        "maxVUs": 500,
        "stages": [
            { "duration": "5s", "target": 20 },
            { "duration": "5s", "target": 100 },
            { "duration": "5s", "target": 200 },
            { "duration": "5s", "target": 0 }
        ],
        "gracefulStop": "5s"
    },
    "thresholds": {
        "http_req_failed": [{ "threshold": "rate<0.01", "abortOnFail": true }],
        "http_req_duration": [{ "threshold": "p(95)<500", "abortOnFail": false }, "p(99)<1200"],
        "checks": ["rate>0.99"]
    },
    "pacing": "1s",
    "iterationTimeout": "10s"
}"#;

// Constant `POST /users` load
const CREATE_USER: &str = r#"{
    "name": "constant_create_user",
    "scenario": {
        "executor": "constant-arrival-rate",
        "rate": 100,
        "timeUnit": "1s",
        "duration": "30s",
        "preAllocatedVUs": 200
    },
    "thresholds": {
        "http_req_failed": [{ "threshold": "rate<0.01", "abortOnFail": true }],
        "http_req_duration": [{ "threshold": "p(95)<500", "abortOnFail": false }, "p(99)<1200"],
        "checks": ["rate>0.99"]
    },
    "pacing": "1s"
}"#;

async fn health_check(client: Client, target: String, it: Iteration) -> Result<(), BoxError> {
    let res = client.get(&target).send().await?;
    if !it.check("status was 200", res.status() == StatusCode::OK) {
        return Err(format!("unexpected status {}", res.status()).into());
    }
    Ok(())
}

async fn create_user(client: Client, target: String, it: Iteration) -> Result<(), BoxError> {
    let body = json!({ "username": "optest", "email": "optest@example.com" });
    let res = client.post(format!("{target}/users")).json(&body).send().await?;
    if !it.check("status was 201", res.status() == StatusCode::CREATED) {
        return Err(format!("unexpected status {}", res.status()).into());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let target = std::env::var("TARGET_URL").unwrap_or_else(|_| "http://localhost:3000".to_string());
    let create = std::env::args().nth(1).as_deref() == Some("create-user");
    let config = match std::env::args().nth(2) {
        Some(path) => RunConfig::from_path(path)?,
        None => RunConfig::from_json_str(if create { CREATE_USER } else { HEALTH_CHECK })?,
    };

    // NEVER build the client inside the action unless you want to kill performance
    let client = Client::builder().timeout(Duration::from_secs(5)).build()?;
    let reporter = JsonFileReporter::new("reports");
    let summary = if create {
        RunController::new(&config, move |it: Iteration| {
            create_user(client.clone(), target.clone(), it)
        })?
        .run_and_report(&reporter)
        .await?
    } else {
        RunController::new(&config, move |it: Iteration| {
            health_check(client.clone(), target.clone(), it)
        })?
        .run_and_report(&reporter)
        .await?
    };
    if !summary.passed() {
        std::process::exit(99);
    }
    Ok(())
}
