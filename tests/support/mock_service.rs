use std::{
    collections::HashMap,
    convert::Infallible,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{Context, Result};
use hyper::service::{make_service_fn, service_fn};
use hyper::{header, Body, Method, Request, Response, Server, StatusCode};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Default)]
pub struct MockAccount {
    pub running: bool,
    pub points: u64,
    pub proof: Option<String>,
    pub fail_points: bool,
    pub check_in_delay: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub authorization: Option<String>,
}

/// Shared state behind the mock account service.
#[derive(Clone, Default)]
pub struct MockAccounts {
    accounts: Arc<Mutex<HashMap<String, MockAccount>>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl MockAccounts {
    pub fn insert(&self, address: &str, account: MockAccount) {
        self.accounts
            .lock()
            .unwrap()
            .insert(address.to_owned(), account);
    }

    pub fn account(&self, address: &str) -> Option<MockAccount> {
        self.accounts.lock().unwrap().get(address).cloned()
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn paths_for(&self, address: &str) -> Vec<String> {
        let prefix = format!("/accounts/{address}");
        self.requests()
            .into_iter()
            .filter_map(|req| req.path.strip_prefix(&prefix).map(str::to_owned))
            .collect()
    }
}

pub struct MockAccountService {
    url: String,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl MockAccountService {
    pub async fn start(accounts: MockAccounts) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("failed to bind mock service listener")?;
        let addr = listener
            .local_addr()
            .context("failed to read mock listener address")?;
        let std_listener = listener
            .into_std()
            .context("failed to convert mock listener")?;
        std_listener
            .set_nonblocking(true)
            .context("failed to set mock listener non-blocking")?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let make_service = make_service_fn(move |_| {
            let accounts = accounts.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| serve_request(accounts.clone(), req)))
            }
        });

        let server = Server::from_tcp(std_listener)
            .context("failed to build mock HTTP server")?
            .serve(make_service);
        let graceful = server.with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });

        let handle = tokio::spawn(async move {
            if let Err(err) = graceful.await {
                eprintln!("mock account service stopped: {err}");
            }
        });

        Ok(Self {
            url: format!("http://{}", addr),
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

async fn serve_request(
    accounts: MockAccounts,
    req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let authorization = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    accounts.requests.lock().unwrap().push(RecordedRequest {
        method: method.clone(),
        path: path.clone(),
        authorization,
    });

    let mut segments = path.trim_start_matches('/').splitn(3, '/');
    let (Some("accounts"), Some(address), Some(action)) =
        (segments.next(), segments.next(), segments.next())
    else {
        return Ok(status(StatusCode::NOT_FOUND, "unknown route"));
    };

    let Some(account) = accounts.account(address) else {
        return Ok(status(StatusCode::NOT_FOUND, "unknown account"));
    };

    let response = match (method, action) {
        (Method::POST, "check-in") => {
            if let Some(delay) = account.check_in_delay {
                tokio::time::sleep(delay).await;
            }
            json_response(json!({ "ok": true }))
        }
        (Method::GET, "node") => json_response(json!({ "running": account.running })),
        (Method::POST, "node/stop") => {
            update(&accounts, address, |account| account.running = false);
            json_response(json!({ "ok": true }))
        }
        (Method::POST, "node/start") => {
            update(&accounts, address, |account| account.running = true);
            json_response(json!({ "ok": true }))
        }
        (Method::GET, "points") if account.fail_points => {
            status(StatusCode::INTERNAL_SERVER_ERROR, "points backend unavailable")
        }
        (Method::GET, "points") => json_response(json!({
            "points": account.points,
            "referralCode": "MOCK",
            "referralCount": 3,
        })),
        (Method::GET, "proof") => json_response(json!({ "proof": account.proof })),
        _ => status(StatusCode::METHOD_NOT_ALLOWED, "unsupported"),
    };
    Ok(response)
}

fn update(accounts: &MockAccounts, address: &str, apply: impl FnOnce(&mut MockAccount)) {
    if let Some(account) = accounts.accounts.lock().unwrap().get_mut(address) {
        apply(account);
    }
}

fn json_response(value: serde_json::Value) -> Response<Body> {
    let mut response = Response::new(Body::from(value.to_string()));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    response
}

fn status(code: StatusCode, message: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(message));
    *response.status_mut() = code;
    response
}
