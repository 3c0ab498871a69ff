use std::io::Read;

use axum::http::{self, Request, StatusCode};
use axum::routing::RouterIntoService;
use http_body_util::BodyExt;
use mock_daemon::{app, ContainerInspect, CreatedContainer, ImageSummary};
use tower::{Service, ServiceExt};

type App = RouterIntoService<String>;

async fn body_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_bytes(response: axum::response::Response) -> bytes::Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

fn json_request(method: &str, uri: &str, body: &str) -> Request<String> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(body.to_string())
        .unwrap()
}

fn empty_request(method: &str, uri: &str) -> Request<String> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(String::new())
        .unwrap()
}

async fn call(app: &mut App, request: Request<String>) -> axum::response::Response {
    ServiceExt::ready(app)
        .await
        .unwrap()
        .call(request)
        .await
        .unwrap()
}

/// Pull busybox and create a container running `cmd`; returns its id.
async fn busybox_container(app: &mut App, cmd: &str) -> String {
    let resp = call(app, empty_request("POST", "/images/create?fromImage=busybox&tag=latest")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    body_bytes(resp).await;

    let resp = call(
        app,
        json_request("POST", "/containers/create", &format!(r#"{{"Image":"busybox","Cmd":{cmd}}}"#)),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let created: CreatedContainer = body_json(resp).await;
    created.id
}

/// Split a multiplexed body into (stream, payload) pairs.
fn frames(mut body: &[u8]) -> Vec<(u8, Vec<u8>)> {
    let mut out = Vec::new();
    while !body.is_empty() {
        let size = u32::from_be_bytes([body[4], body[5], body[6], body[7]]) as usize;
        out.push((body[0], body[8..8 + size].to_vec()));
        body = &body[8 + size..];
    }
    out
}

#[tokio::test]
async fn ping_answers_ok() {
    let resp = app().oneshot(empty_request("GET", "/_ping")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(&body_bytes(resp).await[..], b"OK");
}

#[tokio::test]
async fn create_needs_a_pulled_image() {
    let resp = app()
        .oneshot(json_request("POST", "/containers/create", r#"{"Image":"alpine"}"#))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body: serde_json::Value = body_json(resp).await;
    assert_eq!(body["message"], "No such image: alpine:latest");
}

#[tokio::test]
async fn unknown_container_is_404_with_message() {
    let resp = app()
        .oneshot(empty_request("GET", "/containers/abc123/json"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body: serde_json::Value = body_json(resp).await;
    assert_eq!(body["message"], "No such container: abc123");
}

#[tokio::test]
async fn pull_streams_json_lines_and_registers_the_image() {
    let mut app = app().into_service();
    let resp = call(&mut app, empty_request("POST", "/images/create?fromImage=busybox&tag=1.36")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().get(http::header::CONTENT_LENGTH).is_none());

    let body = body_bytes(resp).await;
    let lines: Vec<serde_json::Value> = body
        .split(|&b| b == b'\n')
        .filter(|l| !l.is_empty())
        .map(|l| serde_json::from_slice(l).unwrap())
        .collect();
    assert_eq!(lines[0]["status"], "Pulling from library/busybox");
    assert_eq!(
        lines.last().unwrap()["status"],
        "Status: Downloaded newer image for busybox:1.36"
    );

    let resp = call(&mut app, empty_request("GET", "/images/json")).await;
    let images: Vec<ImageSummary> = body_json(resp).await;
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].repo_tags, ["busybox:1.36"]);
}

#[tokio::test]
async fn failed_pull_reports_in_band() {
    let resp = app()
        .oneshot(empty_request("POST", "/images/create?fromImage=nonexistent-image"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = String::from_utf8(body_bytes(resp).await.to_vec()).unwrap();
    let last: serde_json::Value = serde_json::from_str(body.lines().last().unwrap()).unwrap();
    assert!(last["error"].as_str().unwrap().contains("manifest unknown"));
}

#[tokio::test]
async fn container_lifecycle() {
    let mut app = app().into_service();
    let id = busybox_container(&mut app, r#"["echo","hello","world"]"#).await;

    let resp = call(&mut app, empty_request("POST", &format!("/containers/{id}/start"))).await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    let resp = call(&mut app, empty_request("POST", &format!("/containers/{id}/start"))).await;
    assert_eq!(resp.status(), StatusCode::NOT_MODIFIED);

    let resp = call(&mut app, empty_request("GET", &format!("/containers/{}/json", &id[..12]))).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let inspect: ContainerInspect = body_json(resp).await;
    assert_eq!(inspect.id, id);
    assert!(inspect.state.running);
    assert_eq!(inspect.config.cmd, ["echo", "hello", "world"]);

    let resp = call(&mut app, empty_request("DELETE", &format!("/containers/{id}"))).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let resp = call(&mut app, empty_request("DELETE", &format!("/containers/{id}?force=1"))).await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    let resp = call(&mut app, empty_request("GET", &format!("/containers/{id}/json"))).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn container_names_are_unique() {
    let mut app = app().into_service();
    busybox_container(&mut app, "[]").await;
    let create = || json_request("POST", "/containers/create?name=web", r#"{"Image":"busybox"}"#);
    assert_eq!(call(&mut app, create()).await.status(), StatusCode::CREATED);
    assert_eq!(call(&mut app, create()).await.status(), StatusCode::CONFLICT);
    let resp = call(&mut app, empty_request("GET", "/containers/web/json")).await;
    let inspect: ContainerInspect = body_json(resp).await;
    assert_eq!(inspect.name, "/web");
}

#[tokio::test]
async fn logs_are_multiplexed() {
    let mut app = app().into_service();
    let ok = busybox_container(&mut app, r#"["echo","out"]"#).await;
    let bad = busybox_container(&mut app, r#"["ls","-l"]"#).await;
    for id in [&ok, &bad] {
        call(&mut app, empty_request("POST", &format!("/containers/{id}/start"))).await;
    }

    let resp = call(&mut app, empty_request("GET", &format!("/containers/{ok}/logs?stdout=1&stderr=1"))).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(frames(&body_bytes(resp).await), [(1, b"out\n".to_vec())]);

    let resp = call(&mut app, empty_request("GET", &format!("/containers/{bad}/logs?stdout=1&stderr=1"))).await;
    assert_eq!(
        frames(&body_bytes(resp).await),
        [(2, b"ls: command not found\n".to_vec())]
    );

    let resp = call(&mut app, empty_request("GET", &format!("/containers/{ok}/logs"))).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn stats_once_or_forever() {
    let mut app = app().into_service();
    let id = busybox_container(&mut app, "[]").await;

    let resp = call(&mut app, empty_request("GET", &format!("/containers/{id}/stats?stream=0"))).await;
    let sample: serde_json::Value = body_json(resp).await;
    assert_eq!(sample["id"], id.as_str());

    let resp = call(&mut app, empty_request("GET", &format!("/containers/{id}/stats?stream=1"))).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let mut body = resp.into_body();
    for n in 0..3u64 {
        let frame = body.frame().await.unwrap().unwrap().into_data().unwrap();
        assert_eq!(frame.last(), Some(&b'\n'));
        let sample: serde_json::Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(sample["cpu_stats"]["cpu_usage"]["total_usage"], 1_000_000 * n);
    }
}

#[tokio::test]
async fn archives_round_trip() {
    let mut app = app().into_service();
    let id = busybox_container(&mut app, "[]").await;

    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_ustar();
    header.set_size(6);
    header.set_mode(0o644);
    builder.append_data(&mut header, "motd", &b"hello\n"[..]).unwrap();
    let upload = builder.into_inner().unwrap();

    let put = Request::builder()
        .method("PUT")
        .uri(format!("/containers/{id}/archive?path=/etc"))
        .header(http::header::CONTENT_TYPE, "application/x-tar")
        .body(String::from_utf8_lossy(&upload).into_owned())
        .unwrap();
    // Tar headers and "hello\n" are ASCII, so the lossy conversion is exact.
    assert_eq!(put.body().len(), upload.len());
    assert_eq!(call(&mut app, put).await.status(), StatusCode::OK);

    let resp = call(&mut app, empty_request("GET", &format!("/containers/{id}/archive?path=/etc/motd"))).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get(http::header::CONTENT_TYPE).unwrap(),
        "application/x-tar"
    );
    let archive = body_bytes(resp).await;
    let mut reader = tar::Archive::new(&archive[..]);
    let mut entry = reader.entries().unwrap().next().unwrap().unwrap();
    assert_eq!(entry.path().unwrap().to_str(), Some("motd"));
    let mut content = String::new();
    entry.read_to_string(&mut content).unwrap();
    assert_eq!(content, "hello\n");

    let resp = call(&mut app, empty_request("GET", &format!("/containers/{id}/archive?path=/etc/shadow"))).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let resp = call(&mut app, empty_request("GET", &format!("/containers/{id}/archive?path=etc"))).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}
