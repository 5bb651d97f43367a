//! Uploads against a real HTTP client and a scripted local server.
//!
//! Every answer the agent cannot read as an attendance envelope must leave
//! the event pending; only an explicit `success: false` consumes it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use office_presence::api::ApiClient;
use office_presence::auth::TokenManager;
use office_presence::identity::IdentityProvider;
use office_presence::model::{NewEvent, SessionToken, SyncMode, SyncState};
use office_presence::queue::EventQueue;
use office_presence::service::NoopObserver;
use office_presence::storage::MemoryCredentialStore;
use office_presence::sync::{CycleOutcome, SyncEngine};
use office_presence::test_support::identity;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

struct Answer {
    status: &'static str,
    content_type: &'static str,
    body: &'static str,
}

const fn answer(status: &'static str, content_type: &'static str, body: &'static str) -> Answer {
    Answer {
        status,
        content_type,
        body,
    }
}

/// Serves one scripted answer per connection, in order
async fn serve(answers: Vec<Answer>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let answers = Arc::new(Mutex::new(VecDeque::from(answers)));

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let Some(answer) = answers.lock().unwrap().pop_front() else {
                break;
            };
            tokio::spawn(async move {
                read_request(&mut stream).await;
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    answer.status,
                    answer.content_type,
                    answer.body.len(),
                    answer.body
                );
                stream.write_all(response.as_bytes()).await.unwrap();
                stream.shutdown().await.ok();
            });
        }
    });

    format!("http://{addr}")
}

async fn read_request(stream: &mut TcpStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).await.unwrap();
        if n == 0 {
            return;
        }
        buf.extend_from_slice(&chunk[..n]);

        let text = String::from_utf8_lossy(&buf);
        let Some(head_end) = text.find("\r\n\r\n") else {
            continue;
        };
        let content_length = text[..head_end]
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        if buf.len() >= head_end + 4 + content_length {
            return;
        }
    }
}

fn setup(base_url: &str) -> (Arc<EventQueue>, Arc<TokenManager>, SyncEngine) {
    let api = Arc::new(ApiClient::new(base_url, Duration::from_secs(5)).unwrap());
    let queue = Arc::new(EventQueue::open_in_memory().unwrap());
    let token = SessionToken {
        access_token: "access-1".into(),
        refresh_token: Some("refresh-1".into()),
        expires_at: Utc::now() + ChronoDuration::hours(1),
        email: "dev@example.com".into(),
    };
    let tokens = Arc::new(TokenManager::new(
        api.clone(),
        Arc::new(MemoryCredentialStore::with_token(token)),
        Arc::new(NoopObserver),
        300,
        3600,
    ));
    tokens.restore().unwrap();
    let engine = SyncEngine::new(queue.clone(), tokens.clone(), api);
    (queue, tokens, engine)
}

#[tokio::test]
async fn unreadable_and_throttled_answers_keep_the_event_pending() {
    let base_url = serve(vec![
        answer("200 OK", "text/html", "<html><body>Sign in to the guest Wi-Fi</body></html>"),
        answer("404 Not Found", "text/plain", "no such route"),
        answer("408 Request Timeout", "text/plain", ""),
        answer("429 Too Many Requests", "application/json", r#"{"success":false,"message":"slow down"}"#),
        answer("200 OK", "application/json", r#"{"success":true,"data":{"recordId":1}}"#),
    ])
    .await;
    let (queue, tokens, engine) = setup(&base_url);
    let id = queue
        .append(&NewEvent::connect("OfficeNet", identity().capture(), Utc::now()))
        .unwrap();

    for _ in 0..4 {
        let report = engine.run_cycle().await;

        assert_eq!(report.outcome, CycleOutcome::Interrupted);
        assert_eq!(report.uploaded, 0);
        assert_eq!(tokens.mode(), SyncMode::Offline);
        assert_eq!(queue.pending_count().unwrap(), 1);

        tokens.set_mode(SyncMode::Online);
    }

    let report = engine.run_cycle().await;
    assert_eq!(report.outcome, CycleOutcome::Completed);
    assert_eq!(report.uploaded, 1);
    assert_eq!(queue.pending_count().unwrap(), 0);
    assert_eq!(queue.get(id).unwrap().unwrap().sync_state, SyncState::Synced);
}

#[tokio::test]
async fn explicit_rejection_consumes_the_event() {
    let base_url = serve(vec![
        answer("200 OK", "application/json", r#"{"success":false,"message":"Invalid event type"}"#),
        answer("200 OK", "application/json", r#"{"success":true,"data":null}"#),
    ])
    .await;
    let (queue, tokens, engine) = setup(&base_url);
    let t0 = Utc::now();
    queue
        .append(&NewEvent::connect("OfficeNet", identity().capture(), t0))
        .unwrap();
    queue
        .append(&NewEvent::disconnect(
            "OfficeNet",
            identity().capture(),
            t0 + ChronoDuration::seconds(30),
            Some(t0),
        ))
        .unwrap();

    let report = engine.run_cycle().await;

    assert_eq!(report.outcome, CycleOutcome::Completed);
    assert_eq!(report.uploaded, 1);
    assert_eq!(tokens.mode(), SyncMode::Online);
    assert_eq!(queue.pending_count().unwrap(), 0);
}
