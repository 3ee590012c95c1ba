use std::io;

use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::response::{Json, Response};
use corestash_common::SearchResult;
use futures::TryStreamExt;
use serde::Deserialize;
use tokio_util::io::{StreamReader, SyncIoBridge};
use ulid::Ulid;

use crate::index::IndexError;
use crate::service::CoreService;
use crate::upload;

use super::{stream_file, ResponseError};

/// Ingests one dump: the multi-segment gzip body described in the upload
/// wire format.
///
/// The body is bridged into blocking code and processed there; a request
/// only gets its 200 once the core is stored and indexed. The analysis
/// queue is bounded, so a busy analyzer backpressures uploads here.
pub async fn ingest(
    State(service): State<CoreService>,
    request: Request,
) -> Result<StatusCode, ResponseError> {
    let uid = Ulid::new().to_string();
    tracing::info!(uid, "receiving dump");

    let stream = request
        .into_body()
        .into_data_stream()
        .map_err(io::Error::other);
    let body = SyncIoBridge::new(StreamReader::new(stream));

    let store = service.store();
    let index = service.index();
    let task_uid = uid.clone();
    let core = tokio::task::spawn_blocking(move || {
        upload::process(
            body,
            task_uid,
            store.as_ref(),
            index.as_ref(),
            env!("CARGO_PKG_VERSION"),
        )
    })
    .await?
    .map_err(|err| {
        tracing::error!(uid, "indexing failed: {err:#}");
        ResponseError::from(err)
    })?;

    service.metrics().observe_received(&core);
    service.enqueue_analysis(core).await?;

    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SearchParams {
    q: String,
    sort: String,
    order: String,
    size: usize,
    from: usize,
}

impl Default for SearchParams {
    fn default() -> Self {
        SearchParams {
            q: "*".to_owned(),
            sort: "dumped_at".to_owned(),
            order: "desc".to_owned(),
            size: 50,
            from: 0,
        }
    }
}

pub async fn search(
    State(service): State<CoreService>,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchResult>, ResponseError> {
    let query = if params.q.is_empty() {
        "*".to_owned()
    } else {
        params.q
    };

    match params.sort.as_str() {
        "dumped_at" | "hostname" => {}
        other => {
            return Err(ResponseError::bad_request(format!(
                "invalid sort field {other:?}"
            )));
        }
    }
    let sort = match params.order.as_str() {
        "asc" => params.sort,
        "desc" => format!("-{}", params.sort),
        other => {
            return Err(ResponseError::bad_request(format!(
                "invalid sort order {other:?}"
            )));
        }
    };

    let index = service.index();
    let (results, total) = tokio::task::spawn_blocking(move || {
        index.search(&query, &sort, params.size, params.from)
    })
    .await??;

    Ok(Json(SearchResult { results, total }))
}

pub async fn download(
    State(service): State<CoreService>,
    Path(uid): Path<String>,
) -> Result<Response, ResponseError> {
    let store = service.store();
    let file = tokio::task::spawn_blocking(move || store.core(&uid)).await??;
    stream_file(file).await
}

pub async fn delete(
    State(service): State<CoreService>,
    Path(uid): Path<String>,
) -> Result<StatusCode, ResponseError> {
    let index = service.index();
    let lookup = uid.clone();
    match tokio::task::spawn_blocking(move || index.find(&lookup)).await? {
        Ok(core) => {
            service.enqueue_cleanup(core).await?;
            Ok(StatusCode::OK)
        }
        Err(IndexError::NotFound) => Err(ResponseError::bad_request("unknown core")),
        Err(err) => Err(err.into()),
    }
}

/// Re-enqueues an already indexed core for analysis, so existing dumps can
/// pick up new analyzer features.
pub async fn analyze(
    State(service): State<CoreService>,
    Path(uid): Path<String>,
) -> Result<StatusCode, ResponseError> {
    let index = service.index();
    let lookup = uid.clone();
    match tokio::task::spawn_blocking(move || index.find(&lookup)).await? {
        Ok(core) => {
            service.enqueue_analysis(core).await?;
            Ok(StatusCode::ACCEPTED)
        }
        Err(IndexError::NotFound) => Err(ResponseError::bad_request("unknown core")),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use corestash_common::{SearchResult, UploadHeader};
    use reqwest::StatusCode;

    use crate::service::CoreService;
    use crate::test;

    fn upload_header(hash: &str, include_executable: bool) -> UploadHeader {
        UploadHeader {
            dumped_at: "2020-05-01T10:00:00Z".parse().unwrap(),
            hostname: "h1".to_owned(),
            executable_path: "/bin/x".to_owned(),
            executable_hash: hash.to_owned(),
            include_executable,
            metadata: BTreeMap::from([("service".to_owned(), "s".to_owned())]),
            forwarder_version: "0.1.0".to_owned(),
            links: Vec::new(),
        }
    }

    async fn upload(server: &test::Server, body: Vec<u8>) -> reqwest::Response {
        reqwest::Client::new()
            .post(server.url("/cores"))
            .body(body)
            .send()
            .await
            .unwrap()
    }

    async fn search(server: &test::Server, q: &str) -> SearchResult {
        reqwest::get(server.url(&format!("/cores?q={q}")))
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fresh_ingest_roundtrip() {
        let (_tmp, _service, server) = test::server().await;

        let body = test::upload_body(&upload_header("aa", true), &[b"CORE1", b"ELF1"]);
        let response = upload(&server, body).await;
        assert_eq!(response.status(), StatusCode::OK);

        let found = search(&server, "meta.service:s").await;
        assert_eq!(found.total, 1);
        let core = &found.results[0];
        assert_eq!(core.hostname, "h1");
        assert_eq!(core.executable, "x");
        assert_eq!(core.size, 5);
        assert_eq!(core.executable_size, 4);

        let response = reqwest::get(server.url(&format!("/cores/{}", core.uid)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-length"], "5");
        assert!(response.headers().get("last-modified").is_some());
        assert_eq!(response.bytes().await.unwrap().as_ref(), b"CORE1");

        let response = reqwest::Client::new()
            .head(server.url("/executables/aa"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn same_executable_is_deduplicated() {
        let (_tmp, service, server) = test::server().await;

        let body = test::upload_body(&upload_header("aa", true), &[b"CORE1", b"EXEC"]);
        assert_eq!(upload(&server, body).await.status(), StatusCode::OK);

        let body = test::upload_body(&upload_header("aa", false), &[b"CORE2"]);
        assert_eq!(upload(&server, body).await.status(), StatusCode::OK);

        let found = search(&server, "*").await;
        assert_eq!(found.total, 2);
        assert_ne!(found.results[0].uid, found.results[1].uid);
        // Both documents report the size of the single stored blob.
        assert_eq!(found.results[0].executable_size, 4);
        assert_eq!(found.results[1].executable_size, 4);

        assert_eq!(service.store().stat_executable("aa").unwrap(), 4);
        let response = reqwest::get(server.url("/executables/aa")).await.unwrap();
        assert_eq!(response.bytes().await.unwrap().as_ref(), b"EXEC");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn uploads_get_analyzed() {
        let (_tmp, service, server) = test::server_with(|config| {
            config.analyzers.c = vec![
                "sh".to_owned(),
                "-c".to_owned(),
                "echo stack trace".to_owned(),
            ];
        })
        .await;

        let executable = test::elf_fixture(&[".text"]);
        let body = test::upload_body(&upload_header("aa", true), &[b"CORE1", &executable]);
        assert_eq!(upload(&server, body).await.status(), StatusCode::OK);

        let index = service.index();
        test::wait_until(|| {
            let index = index.clone();
            async move {
                let (results, _) = index.search("*", "dumped_at", 1, 0).unwrap();
                results.first().map(|c| c.analyzed).unwrap_or(false)
            }
        })
        .await;

        let found = search(&server, "analyzed:true").await;
        assert_eq!(found.total, 1);
        let core = &found.results[0];
        assert_eq!(core.lang, Some(corestash_common::Language::C));
        assert!(core.analyzed_at.is_some());
        assert!(core.trace.as_deref().unwrap().contains("stack trace"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn deleting_the_last_referencer_reclaims_the_executable() {
        let (_tmp, service, server) = test::server().await;

        let body = test::upload_body(&upload_header("aa", true), &[b"CORE1", b"EXEC"]);
        assert_eq!(upload(&server, body).await.status(), StatusCode::OK);
        let uid = search(&server, "*").await.results[0].uid.clone();

        let response = reqwest::Client::new()
            .delete(server.url(&format!("/cores/{uid}")))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let store = service.store();
        test::wait_until(|| {
            let store = store.clone();
            async move { !store.executable_exists("aa").unwrap() }
        })
        .await;

        let response = reqwest::get(server.url(&format!("/cores/{uid}"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = reqwest::Client::new()
            .head(server.url("/executables/aa"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(search(&server, "*").await.total, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn restart_resumes_failed_analyses() {
        test::setup();
        let tmp = test::tempdir();

        // First run: the analyzer always fails, the document stays
        // un-analyzed.
        {
            let mut config = test::config(tmp.path());
            config.analyzers.c =
                vec!["sh".to_owned(), "-c".to_owned(), "exit 1".to_owned()];
            let (service, _workers) = CoreService::create(config).unwrap();
            let server = test::Server::with_service(service.clone()).await;

            let executable = test::elf_fixture(&[".text"]);
            let body =
                test::upload_body(&upload_header("aa", true), &[b"CORE1", &executable]);
            assert_eq!(upload(&server, body).await.status(), StatusCode::OK);

            tokio::time::sleep(Duration::from_millis(500)).await;
            let (results, _) = service.index().search("*", "dumped_at", 1, 0).unwrap();
            assert!(!results[0].analyzed);
        }

        // Second run over the same data directory with the analyzer fixed:
        // the recovery sweep picks the document up.
        let mut config = test::config(tmp.path());
        config.analyzers.c = vec![
            "sh".to_owned(),
            "-c".to_owned(),
            "echo recovered".to_owned(),
        ];
        let (service, _workers) = CoreService::create(config).unwrap();

        let index = service.index();
        test::wait_until(|| {
            let index = index.clone();
            async move {
                let (results, _) = index.search("*", "dumped_at", 1, 0).unwrap();
                results.first().map(|c| c.analyzed).unwrap_or(false)
            }
        })
        .await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reanalyze_endpoint_requeues() {
        let (_tmp, service, server) = test::server_with(|config| {
            config.analyzers.c = vec![
                "sh".to_owned(),
                "-c".to_owned(),
                "echo trace".to_owned(),
            ];
        })
        .await;

        let executable = test::elf_fixture(&[".text"]);
        let body = test::upload_body(&upload_header("aa", true), &[b"CORE1", &executable]);
        assert_eq!(upload(&server, body).await.status(), StatusCode::OK);

        let index = service.index();
        test::wait_until(|| {
            let index = index.clone();
            async move {
                let (results, _) = index.search("*", "dumped_at", 1, 0).unwrap();
                results.first().map(|c| c.analyzed).unwrap_or(false)
            }
        })
        .await;
        let uid = search(&server, "*").await.results[0].uid.clone();

        let response = reqwest::Client::new()
            .post(server.url(&format!("/cores/{uid}/_analyze")))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let response = reqwest::Client::new()
            .post(server.url("/cores/unknown/_analyze"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn invalid_search_parameters_are_rejected() {
        let (_tmp, _service, server) = test::server().await;

        let response = reqwest::get(server.url("/cores?sort=trace")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = reqwest::get(server.url("/cores?order=sideways"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = reqwest::get(server.url("/cores?q=dumped_at:<notadate"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_core_is_not_found() {
        let (_tmp, _service, server) = test::server().await;

        let response = reqwest::get(server.url("/cores/doesnotexist")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = reqwest::Client::new()
            .delete(server.url("/cores/doesnotexist"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn broken_upload_is_rejected_and_not_indexed() {
        let (_tmp, _service, server) = test::server().await;

        let response = upload(&server, b"this is not gzip".to_vec()).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        assert_eq!(search(&server, "*").await.total, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn search_defaults_sort_newest_first() {
        let (_tmp, _service, server) = test::server().await;

        for (hash, day) in [("aa", "01"), ("bb", "03"), ("cc", "02")] {
            let mut header = upload_header(hash, true);
            header.dumped_at = format!("2020-05-{day}T10:00:00Z").parse().unwrap();
            let body = test::upload_body(&header, &[b"CORE", b"EXEC"]);
            assert_eq!(upload(&server, body).await.status(), StatusCode::OK);
        }

        let found = search(&server, "*").await;
        assert_eq!(found.total, 3);
        let hashes: Vec<_> = found
            .results
            .iter()
            .map(|c| c.executable_hash.as_str())
            .collect();
        assert_eq!(hashes, vec!["bb", "cc", "aa"]);

        // size=0 still reports the full total.
        let found = search(&server, "*&size=0").await;
        assert_eq!(found.total, 3);
        assert!(found.results.is_empty());
    }
}
