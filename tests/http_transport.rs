use std::collections::HashMap;
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use manga_dl::catalog::{CatalogResolver, ManifestResolver};
use manga_dl::error::MangaError;
use manga_dl::fetcher::{HttpTransport, RetryPolicy, RetryingFetcher, TransferError, Transport};
use manga_dl::shutdown::Shutdown;

struct TestServer {
    base_url: String,
    hits: Arc<Mutex<HashMap<String, u32>>>,
    shutdown_tx: mpsc::Sender<()>,
    handle: Option<thread::JoinHandle<()>>,
}

impl TestServer {
    fn start() -> Self {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("start tiny_http server");
        let base_url = format!("http://{}", server.server_addr());
        let hits = Arc::new(Mutex::new(HashMap::<String, u32>::new()));
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let counter = Arc::clone(&hits);
        let manifest_base = base_url.clone();
        let handle = thread::spawn(move || {
            loop {
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }
                let request = match server.recv_timeout(Duration::from_millis(50)) {
                    Ok(Some(req)) => req,
                    Ok(None) => continue,
                    Err(_) => break,
                };
                let path = request.url().to_string();
                let seen = {
                    let mut hits = counter.lock().unwrap();
                    let count = hits.entry(path.clone()).or_insert(0);
                    *count += 1;
                    *count
                };

                let response = match path.as_str() {
                    "/img/ok.png" => tiny_http::Response::from_data(b"PNGDATA".to_vec()),
                    "/img/flaky.png" if seen == 1 => {
                        tiny_http::Response::from_data(Vec::new()).with_status_code(503)
                    }
                    "/img/flaky.png" => tiny_http::Response::from_data(b"LATE".to_vec()),
                    "/img/slow.png" => {
                        thread::sleep(Duration::from_millis(400));
                        tiny_http::Response::from_data(b"SLOW".to_vec())
                    }
                    "/series/7" => tiny_http::Response::from_data(
                        format!(
                            r#"{{"id": 7, "title": "Served", "chapters": [
                                {{"id": "1", "url": "{manifest_base}/chapter/1", "name": "One",
                                  "images": ["{manifest_base}/img/ok.png"]}}
                            ]}}"#
                        )
                        .into_bytes(),
                    ),
                    _ => tiny_http::Response::from_data(b"missing".to_vec()).with_status_code(404),
                };
                let _ = request.respond(response);
            }
        });

        Self {
            base_url,
            hits,
            shutdown_tx,
            handle: Some(handle),
        }
    }

    fn hits(&self, path: &str) -> u32 {
        self.hits.lock().unwrap().get(path).copied().unwrap_or(0)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn fetcher() -> RetryingFetcher<HttpTransport> {
    RetryingFetcher::new(
        HttpTransport::new("manga-dl-test").unwrap(),
        RetryPolicy {
            attempts: 3,
            delay: Duration::from_millis(10),
        },
        Arc::new(Shutdown::new()),
    )
}

fn temp_dir() -> (tempfile::TempDir, Utf8PathBuf) {
    let temp = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    (temp, path)
}

#[test]
fn streams_body_to_padded_file() {
    let server = TestServer::start();
    let (_temp, dir) = temp_dir();

    let path = fetcher()
        .fetch(&format!("{}/img/ok.png", server.base_url), &dir, 4)
        .unwrap();

    assert_eq!(path, dir.join("004.png"));
    assert_eq!(std::fs::read(&path).unwrap(), b"PNGDATA");
    assert_eq!(server.hits("/img/ok.png"), 1);
}

#[test]
fn retries_server_errors() {
    let server = TestServer::start();
    let (_temp, dir) = temp_dir();

    let path = fetcher()
        .fetch(&format!("{}/img/flaky.png", server.base_url), &dir, 1)
        .unwrap();

    assert_eq!(std::fs::read(&path).unwrap(), b"LATE");
    assert_eq!(server.hits("/img/flaky.png"), 2);
}

#[test]
fn gives_up_after_configured_attempts() {
    let server = TestServer::start();
    let (_temp, dir) = temp_dir();

    let err = fetcher()
        .fetch(&format!("{}/img/missing.png", server.base_url), &dir, 1)
        .unwrap_err();

    assert_matches!(err, MangaError::Fetch { attempts: 3, .. });
    assert_eq!(server.hits("/img/missing.png"), 3);
}

#[test]
fn manifest_resolver_reads_series_over_http() {
    let server = TestServer::start();
    let resolver = ManifestResolver::new("manga-dl-test").unwrap();
    let url = format!("{}/series/7", server.base_url);

    let series = resolver.resolve_series(&url).unwrap();
    assert_eq!(series.url(), url);
    assert_eq!(series.title(), "Served");
    assert_eq!(series.chapters().len(), 1);
    assert_eq!(series.chapters()[0].series().id, 7);

    let err = resolver
        .resolve_series(&format!("{}/series/unknown", server.base_url))
        .unwrap_err();
    assert_matches!(err, MangaError::Resolver(_));
}

#[test]
fn slow_response_within_request_timeout_succeeds() {
    let server = TestServer::start();
    let (_temp, dir) = temp_dir();
    let url = format!("{}/img/slow.png", server.base_url);

    let patient = HttpTransport::with_timeout("manga-dl-test", Duration::from_secs(5)).unwrap();
    let destination = dir.join("001.png");
    patient.fetch_to(&url, &destination).unwrap();
    assert_eq!(std::fs::read(&destination).unwrap(), b"SLOW");

    let hasty = HttpTransport::with_timeout("manga-dl-test", Duration::from_millis(100)).unwrap();
    let err = hasty.fetch_to(&url, &dir.join("002.png")).unwrap_err();
    assert_matches!(err, TransferError::Transport(_));
}
