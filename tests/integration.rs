use std::fs;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use tempfile::TempDir;

const DIMS: usize = 64;

fn notectx_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("notectx");
    path
}

/// Bag-of-words hashing embedder: texts sharing words get similar vectors.
fn embed(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; DIMS];
    for word in text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let h = word
            .bytes()
            .fold(2166136261u32, |h, b| (h ^ b as u32).wrapping_mul(16777619));
        v[h as usize % DIMS] += 1.0;
    }
    if v.iter().all(|x| *x == 0.0) {
        v[0] = 1.0;
    }
    v
}

async fn handle_embed(State(calls): State<Arc<AtomicUsize>>, Json(body): Json<Value>) -> Json<Value> {
    calls.fetch_add(1, Ordering::SeqCst);
    let embeddings: Vec<Vec<f32>> = body["input"]
        .as_array()
        .map(|items| items.iter().map(|t| embed(t.as_str().unwrap_or(""))).collect())
        .unwrap_or_default();
    Json(json!({ "model": body["model"], "embeddings": embeddings }))
}

/// Start an Ollama-compatible `/api/embed` server on an ephemeral port.
fn spawn_fake_ollama() -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let state = calls.clone();

    std::thread::spawn(move || {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            let app = Router::new()
                .route("/api/embed", post(handle_embed))
                .with_state(state);
            axum::serve(listener, app).await.unwrap();
        });
    });

    (format!("http://{}", addr), calls)
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

const NOTES: &str = r#"[
  {
    "id": "deploy",
    "title": "Deploy checklist",
    "content": "Run database migrations before every deploy. Watch the rollout dashboard after the deploy finishes.",
    "tags": ["ops"],
    "updated_at": "2024-03-02T10:30:00Z"
  },
  {
    "id": "groceries",
    "title": "Groceries",
    "content": "Eggs, flour, coffee, and milk for the weekend.",
    "tags": ["home"],
    "updated_at": "2024-02-10T08:00:00Z"
  },
  {
    "id": "reading",
    "title": "Reading list",
    "content": "Books to read: systems performance, designing data intensive applications.",
    "tags": ["books"],
    "updated_at": "2023-12-24T18:00:00Z"
  }
]"#;

struct TestEnv {
    _tmp: TempDir,
    root: PathBuf,
    config_path: PathBuf,
    embed_calls: Arc<AtomicUsize>,
}

fn setup_test_env_with(provider_section: &str, bind: &str) -> TestEnv {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let exports_dir = root.join("exports");
    fs::create_dir_all(&exports_dir).unwrap();
    fs::write(exports_dir.join("bear.json"), NOTES).unwrap();
    fs::write(
        exports_dir.join("wiki.json"),
        r#"{"notes": [{"id": "w1", "title": "Wiki home", "content": "Team wiki about deploy tooling."}]}"#,
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/notectx.sqlite"

{provider_section}

[chunking]
chunk_size = 400
overlap = 40

[server]
bind = "{bind}"

[[collections]]
collection_name = "bear"
description = "Bear notes"
json_file = "{root}/exports/bear.json"

[[collections]]
collection_name = "wiki"
json_file = "{root}/exports/wiki.json"
"#,
        root = root.display(),
    );

    let config_path = config_dir.join("notectx.toml");
    fs::write(&config_path, config_content).unwrap();

    TestEnv {
        _tmp: tmp,
        root,
        config_path,
        embed_calls: Arc::new(AtomicUsize::new(0)),
    }
}

fn setup_test_env() -> TestEnv {
    let (url, calls) = spawn_fake_ollama();
    let provider = format!(
        r#"[provider]
type = "ollama"
base_url = "{url}"
embedding_model = "fake-embed"
dims = {DIMS}
max_retries = 1
[provider.rate_limit]
concurrency = 2"#
    );
    let mut env = setup_test_env_with(&provider, "127.0.0.1:7341");
    env.embed_calls = calls;
    env
}

fn run_notectx(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = notectx_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run notectx binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn search_json(config_path: &Path, args: &[&str]) -> Value {
    let mut full = vec!["search"];
    full.extend_from_slice(args);
    full.push("--json");
    let (stdout, stderr, success) = run_notectx(config_path, &full);
    assert!(success, "search failed: stdout={}, stderr={}", stdout, stderr);
    serde_json::from_str(&stdout).unwrap()
}

fn note_ids(response: &Value) -> Vec<String> {
    response["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|i| i["note_id"].as_str().unwrap().to_string())
        .collect()
}

#[test]
fn test_init_creates_database() {
    let env = setup_test_env();

    let (stdout, stderr, success) = run_notectx(&env.config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(env.root.join("data/notectx.sqlite").exists());

    let (_, _, again) = run_notectx(&env.config_path, &["init"]);
    assert!(again, "Second init failed (not idempotent)");
}

#[test]
fn test_index_collection() {
    let env = setup_test_env();

    let (stdout, stderr, success) = run_notectx(&env.config_path, &["index", "bear"]);
    assert!(success, "index failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("index bear (incremental)"));
    assert!(stdout.contains("committed notes: 3"));
    assert!(stdout.contains("state: committed"));
    assert!(stdout.contains("ok"));
    assert!(env.embed_calls.load(Ordering::SeqCst) > 0);
}

#[test]
fn test_reindex_skips_unchanged_notes() {
    let env = setup_test_env();

    run_notectx(&env.config_path, &["index", "bear"]);
    let calls_after_first = env.embed_calls.load(Ordering::SeqCst);

    let (stdout, _, success) = run_notectx(&env.config_path, &["index", "bear"]);
    assert!(success);
    assert!(stdout.contains("committed notes: 0"));
    assert!(stdout.contains("unchanged notes: 3"));
    assert_eq!(env.embed_calls.load(Ordering::SeqCst), calls_after_first);
}

#[test]
fn test_search_returns_cited_context() {
    let env = setup_test_env();
    run_notectx(&env.config_path, &["index", "bear"]);

    let response = search_json(&env.config_path, &["deploy migrations rollout"]);
    let ids = note_ids(&response);
    assert_eq!(ids[0], "deploy");
    assert_eq!(response["collections_searched"], json!(["bear"]));
    let first = &response["items"][0];
    assert_eq!(first["note_title"], "Deploy checklist");
    assert_eq!(first["collection"], "bear");
    assert!(first["score"].as_f64().unwrap() > 0.0);

    let (stdout, _, success) = run_notectx(&env.config_path, &["search", "deploy migrations"]);
    assert!(success);
    assert!(stdout.starts_with("[1] Deploy checklist (collection: bear, note: deploy"));
}

#[test]
fn test_search_deterministic() {
    let env = setup_test_env();
    run_notectx(&env.config_path, &["index", "bear"]);

    let a = search_json(&env.config_path, &["weekend coffee books"]);
    let b = search_json(&env.config_path, &["weekend coffee books"]);
    assert_eq!(a, b);
}

#[test]
fn test_search_filters() {
    let env = setup_test_env();
    run_notectx(&env.config_path, &["index", "bear"]);

    let tagged = search_json(&env.config_path, &["deploy", "--tag", "home"]);
    assert_eq!(note_ids(&tagged), vec!["groceries"]);

    let recent = search_json(&env.config_path, &["deploy", "--since", "2024-01-01"]);
    let ids = note_ids(&recent);
    assert!(!ids.contains(&"reading".to_string()));
    assert!(ids.contains(&"deploy".to_string()));

    let limited = search_json(&env.config_path, &["deploy", "--limit", "1"]);
    assert_eq!(note_ids(&limited).len(), 1);
}

#[test]
fn test_search_across_collections() {
    let env = setup_test_env();
    let (stdout, stderr, success) = run_notectx(&env.config_path, &["index", "--all"]);
    assert!(success, "index --all failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("index bear"));
    assert!(stdout.contains("index wiki"));

    let all = search_json(&env.config_path, &["deploy tooling"]);
    assert_eq!(all["collections_searched"], json!(["bear", "wiki"]));

    let wiki_only = search_json(&env.config_path, &["deploy", "--collection", "wiki"]);
    assert_eq!(note_ids(&wiki_only), vec!["w1"]);
}

#[test]
fn test_search_unknown_collection_errors() {
    let env = setup_test_env();
    run_notectx(&env.config_path, &["index", "bear"]);

    let (_, stderr, success) = run_notectx(
        &env.config_path,
        &["search", "deploy", "--collection", "nope"],
    );
    assert!(!success);
    assert!(stderr.contains("not found"), "stderr={}", stderr);
}

#[test]
fn test_search_empty_query() {
    let env = setup_test_env();
    let (stdout, _, success) = run_notectx(&env.config_path, &["search", ""]);
    assert!(success);
    assert!(stdout.contains("No results."));
}

#[test]
fn test_removed_note_disappears_from_results() {
    let env = setup_test_env();
    run_notectx(&env.config_path, &["index", "bear"]);

    let mut notes: Vec<Value> = serde_json::from_str(NOTES).unwrap();
    notes.retain(|n| n["id"] != "groceries");
    fs::write(
        env.root.join("exports/bear.json"),
        serde_json::to_string(&notes).unwrap(),
    )
    .unwrap();

    let (stdout, _, success) = run_notectx(&env.config_path, &["index", "bear"]);
    assert!(success);
    assert!(stdout.contains("removed notes: 1"));
    assert!(stdout.contains("unchanged notes: 2"));

    let response = search_json(&env.config_path, &["eggs flour coffee"]);
    assert!(!note_ids(&response).contains(&"groceries".to_string()));
}

#[test]
fn test_invalid_note_is_rejected_alone() {
    let env = setup_test_env();
    let mut notes: Vec<Value> = serde_json::from_str(NOTES).unwrap();
    notes.push(json!({ "title": "no id", "content": "orphan" }));
    fs::write(
        env.root.join("exports/bear.json"),
        serde_json::to_string(&notes).unwrap(),
    )
    .unwrap();

    let (stdout, stderr, success) = run_notectx(&env.config_path, &["index", "bear"]);
    assert!(success, "index failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("committed notes: 3"));
    assert!(stdout.contains("failed notes: 1"));
    assert!(stdout.contains("#3 [validation]"));
}

#[test]
fn test_force_recreate() {
    let env = setup_test_env();
    run_notectx(&env.config_path, &["index", "bear"]);

    let (stdout, stderr, success) = run_notectx(&env.config_path, &["index", "bear", "--force"]);
    assert!(success, "force failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("index bear (force_recreate)"));
    assert!(stdout.contains("committed notes: 3"));

    let (stdout, _, success) = run_notectx(&env.config_path, &["collections", "--json"]);
    assert!(success);
    let list: Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(list[0]["name"], "bear");
    assert_eq!(list[0]["mode"], "force_recreate");
    assert_eq!(list[0]["note_count"], 3);
}

#[test]
fn test_collections_listing() {
    let env = setup_test_env();
    let (stdout, _, success) = run_notectx(&env.config_path, &["collections"]);
    assert!(success);
    assert!(stdout.contains("No collections"));

    run_notectx(&env.config_path, &["index", "--all"]);
    let (stdout, _, success) = run_notectx(&env.config_path, &["collections"]);
    assert!(success);
    assert!(stdout.contains("bear"));
    assert!(stdout.contains("wiki"));
    assert!(stdout.contains("fake-embed"));
}

#[test]
fn test_index_unknown_collection_errors() {
    let env = setup_test_env();
    let (_, stderr, success) = run_notectx(&env.config_path, &["index", "nope"]);
    assert!(!success);
    assert!(stderr.contains("Unknown collection"));
}

#[test]
fn test_index_errors_when_provider_disabled() {
    let env = setup_test_env_with("", "127.0.0.1:7341");
    let (_, stderr, success) = run_notectx(&env.config_path, &["index", "bear"]);
    assert!(!success);
    assert!(stderr.contains("requires embeddings"));
}

#[test]
fn test_index_fails_when_provider_unreachable() {
    let port = free_port();
    let provider = format!(
        r#"[provider]
type = "ollama"
base_url = "http://127.0.0.1:{port}"
embedding_model = "fake-embed"
dims = {DIMS}
max_retries = 0
timeout_secs = 2"#
    );
    let env = setup_test_env_with(&provider, "127.0.0.1:7341");

    let (stdout, _, success) = run_notectx(&env.config_path, &["index", "bear"]);
    assert!(!success);
    assert!(stdout.contains("[provider_transient]"), "stdout={}", stdout);
}

struct ServerGuard(Child);

impl Drop for ServerGuard {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn wait_for_health(base: &str) {
    let client = reqwest::blocking::Client::new();
    let deadline = Instant::now() + Duration::from_secs(15);
    while Instant::now() < deadline {
        if let Ok(resp) = client.get(format!("{base}/health")).send() {
            if resp.status().is_success() {
                return;
            }
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    panic!("server at {} did not become healthy", base);
}

#[test]
fn test_serve_tools_over_http() {
    let (url, _calls) = spawn_fake_ollama();
    let port = free_port();
    let bind = format!("127.0.0.1:{port}");
    let provider = format!(
        r#"[provider]
type = "ollama"
base_url = "{url}"
embedding_model = "fake-embed"
dims = {DIMS}"#
    );
    let env = setup_test_env_with(&provider, &bind);
    let (_, _, indexed) = run_notectx(&env.config_path, &["index", "bear"]);
    assert!(indexed);

    let child = Command::new(notectx_binary())
        .arg("--config")
        .arg(&env.config_path)
        .args(["serve", "mcp"])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .unwrap();
    let _guard = ServerGuard(child);

    let base = format!("http://{bind}");
    wait_for_health(&base);
    let client = reqwest::blocking::Client::new();

    let list: Value = client
        .get(format!("{base}/tools/list"))
        .send()
        .unwrap()
        .json()
        .unwrap();
    assert_eq!(list["tools"].as_array().unwrap().len(), 2);

    let resp = client
        .post(format!("{base}/tools/search"))
        .json(&json!({ "query": "deploy migrations", "collection": "bear" }))
        .send()
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().unwrap();
    assert_eq!(body["result"]["items"][0]["note_id"], "deploy");
    assert!(body["result"]["context"]
        .as_str()
        .unwrap()
        .starts_with("[1] Deploy checklist"));

    let resp = client
        .post(format!("{base}/tools/search"))
        .json(&json!({ "query": "deploy", "collection": "nope" }))
        .send()
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().unwrap();
    assert_eq!(body["error"]["code"], "not_found");

    let collections: Value = client
        .post(format!("{base}/tools/collections"))
        .json(&json!({}))
        .send()
        .unwrap()
        .json()
        .unwrap();
    assert_eq!(collections["result"]["collections"][0]["name"], "bear");
}
