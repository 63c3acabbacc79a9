use folder_import_core::{ApiErrorClass, GoogleDriveClient};
use serde_json::json;
use wiremock::matchers::{method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(server: &MockServer) -> GoogleDriveClient {
    GoogleDriveClient::with_base_urls(
        &format!("{}/drive/v3", server.uri()),
        &server.uri(),
        "test-key",
    )
    .unwrap()
}

#[tokio::test]
async fn list_folder_all_follows_page_tokens() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/drive/v3/files"))
        .and(query_param("key", "test-key"))
        .and(query_param("pageSize", "100"))
        .and(query_param_is_missing("pageToken"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "nextPageToken": "page-2",
            "files": [
                { "id": "f1", "name": "a.jpg", "mimeType": "image/jpeg", "size": "120" }
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/drive/v3/files"))
        .and(query_param("pageToken", "page-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "files": [
                { "id": "f2", "name": "b.png", "mimeType": "image/png", "size": "7" },
                { "id": "f3", "name": "c.gif", "mimeType": "image/gif" }
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let files = client_for(&server).list_folder_all("folder-1").await.unwrap();

    assert_eq!(files.len(), 3);
    assert_eq!(files[0].id, "f1");
    assert_eq!(files[0].size, 120);
    assert_eq!(files[1].mime_type, "image/png");
    assert_eq!(files[2].size, 0);
}

#[tokio::test]
async fn list_folder_page_sends_folder_query() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/drive/v3/files"))
        .and(query_param(
            "fields",
            "nextPageToken, files(id, name, mimeType, size)",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "files": [] })))
        .mount(&server)
        .await;

    let page = client_for(&server)
        .list_folder_page("folder-1", None)
        .await
        .unwrap();

    assert!(page.files.is_empty());
    assert!(page.next_page_token.is_none());
    let requests = server.received_requests().await.unwrap();
    let q = requests[0]
        .url
        .query_pairs()
        .find(|(key, _)| key == "q")
        .map(|(_, value)| value.into_owned())
        .unwrap();
    assert!(q.starts_with("'folder-1' in parents and trashed = false"));
}

#[tokio::test]
async fn download_file_returns_bytes() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/uc"))
        .and(query_param("export", "download"))
        .and(query_param("id", "f1"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"jpeg-bytes".to_vec()))
        .mount(&server)
        .await;

    let bytes = client_for(&server).download_file("f1").await.unwrap();
    assert_eq!(&bytes[..], b"jpeg-bytes");
}

#[tokio::test]
async fn missing_folder_is_classified_not_found() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/drive/v3/files"))
        .respond_with(ResponseTemplate::new(404).set_body_string("File not found"))
        .mount(&server)
        .await;

    let err = client_for(&server)
        .list_folder_all("missing")
        .await
        .expect_err("expected 404");
    assert_eq!(err.classification(), ApiErrorClass::NotFound);
}

#[tokio::test]
async fn upstream_outage_is_retryable() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/uc"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let err = client_for(&server)
        .download_file("f1")
        .await
        .expect_err("expected 503");
    assert!(err.is_retryable());
}

#[tokio::test]
async fn slow_page_times_out_as_transient() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/drive/v3/files"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "files": [] }))
                .set_delay(std::time::Duration::from_millis(500)),
        )
        .mount(&server)
        .await;

    let err = client_for(&server)
        .with_timeout(std::time::Duration::from_millis(50))
        .unwrap()
        .list_folder_page("folder-1", None)
        .await
        .expect_err("request should time out");

    assert_eq!(err.classification(), ApiErrorClass::Transient);
    assert!(err.is_retryable());
}
