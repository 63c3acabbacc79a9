use folder_import_core::DropboxClient;
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const LINK: &str = "https://www.dropbox.com/sh/abc/def?dl=1";

fn client_for(server: &MockServer) -> DropboxClient {
    DropboxClient::with_base_urls(
        &format!("{}/api/2", server.uri()),
        &format!("{}/content/2", server.uri()),
        "test-token",
    )
    .unwrap()
}

#[tokio::test]
async fn list_shared_folder_images_follows_cursor_and_filters() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/2/files/list_folder"))
        .and(header("authorization", "Bearer test-token"))
        .and(body_json(json!({
            "path": "",
            "shared_link": { "url": LINK },
            "recursive": true,
            "include_media_info": true,
            "limit": 100
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "entries": [
                { ".tag": "folder", "name": "Nested", "path_display": "/Nested" },
                { ".tag": "file", "name": "a.JPG", "id": "id:a", "path_display": "/a.JPG", "size": 10 },
                { ".tag": "file", "name": "notes.txt", "id": "id:n", "path_display": "/notes.txt", "size": 3 }
            ],
            "cursor": "cursor-1",
            "has_more": true
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/api/2/files/list_folder/continue"))
        .and(body_json(json!({ "cursor": "cursor-1" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "entries": [
                { ".tag": "file", "name": "b.webp", "id": "id:b", "path_lower": "/nested/b.webp", "size": 4 }
            ],
            "cursor": "cursor-2",
            "has_more": false
        })))
        .expect(1)
        .mount(&server)
        .await;

    let files = client_for(&server)
        .list_shared_folder_images(LINK)
        .await
        .unwrap();

    assert_eq!(files.len(), 2);
    assert_eq!(files[0].id.as_deref(), Some("id:a"));
    assert_eq!(files[0].mime_type(), Some("image/jpeg"));
    assert_eq!(files[1].path(), Some("/nested/b.webp"));
}

#[tokio::test]
async fn download_shared_file_sends_api_arg_header() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/content/2/sharing/get_shared_link_file"))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"img".to_vec()))
        .mount(&server)
        .await;

    let bytes = client_for(&server)
        .download_shared_file(LINK, "/a.JPG")
        .await
        .unwrap();
    assert_eq!(&bytes[..], b"img");

    let requests = server.received_requests().await.unwrap();
    let arg = requests[0]
        .headers
        .get("dropbox-api-arg")
        .and_then(|value| value.to_str().ok())
        .unwrap();
    let arg: serde_json::Value = serde_json::from_str(arg).unwrap();
    assert_eq!(arg, json!({ "url": LINK, "path": "/a.JPG" }));
}

#[tokio::test]
async fn rejected_link_is_not_retryable() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/2/files/list_folder"))
        .respond_with(ResponseTemplate::new(409).set_body_string("shared_link_not_found"))
        .mount(&server)
        .await;

    let err = client_for(&server)
        .list_shared_folder_images(LINK)
        .await
        .expect_err("expected conflict");
    assert!(!err.is_retryable());
}
