//! REST adjunct.
//!
//! Helpers for clients preparing pushes: the current account nonce, and
//! merge-request descriptors.

use std::str::FromStr;
use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;

use keel::chain::Address;
use keel::crypto::hash::Digest;
use keel::git::Oid;
use keel::tx::MergeId;

use crate::error::Error;
use crate::Context;

pub fn router(ctx: Arc<Context>) -> Router {
    Router::new()
        .route("/nonce", post(nonce))
        .route("/merge-request", post(merge_request))
        .with_state(ctx)
}

#[derive(Debug, Deserialize)]
struct NonceRequest {
    address: String,
}

/// `POST /api/nonce {address}` returns the account's next nonce.
async fn nonce(
    State(ctx): State<Arc<Context>>,
    Json(request): Json<NonceRequest>,
) -> Result<impl IntoResponse, Error> {
    let address = Address::from_str(&request.address)?;
    let account = ctx.chain.account(&address)?.ok_or(Error::NotFound)?;

    Ok(Json(json!({ "nonce": account.nonce })))
}

#[derive(Debug, Serialize, Deserialize)]
struct MergeRequest {
    id: MergeId,
    repo: String,
    #[serde(rename = "baseBranch")]
    base_branch: String,
    #[serde(rename = "baseHash")]
    base_hash: Oid,
    #[serde(rename = "targetBranch")]
    target_branch: String,
    #[serde(rename = "targetHash")]
    target_hash: Oid,
}

/// `POST /api/merge-request {…}` builds the merge-request descriptor a
/// client signs and submits on chain: its content hash and the height
/// it was prepared at.
async fn merge_request(
    State(ctx): State<Arc<Context>>,
    Json(request): Json<MergeRequest>,
) -> Result<impl IntoResponse, Error> {
    let height = ctx.chain.height()?;
    let canonical = serde_json::to_vec(&request).expect("merge request serializes");
    let hash = Digest::new(canonical);

    Ok(Json(json!({
        "hash": hash.to_string(),
        "height": height,
        "code": 0,
    })))
}

#[cfg(test)]
mod routes {
    use std::str::FromStr;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use tower::ServiceExt;

    use keel::chain::mock::{MockChain, MockDht, MockMempool};
    use keel::chain::{Account, Address};
    use keel::crypto::test::signer::MockSigner;
    use keel::node::{Config, Node};

    use crate::Context;

    fn app(tmp: &std::path::Path, chain: Arc<MockChain>) -> (Node, axum::Router) {
        let node = Node::start(
            Config::new(tmp.join("repos"), tmp.join("data")),
            chain.clone(),
            Arc::new(MockDht::default()),
            Arc::new(MockMempool::default()),
            Arc::new(MockSigner::default()),
        )
        .unwrap();
        let router = crate::router(Context::new(&node, chain));

        (node, router)
    }

    async fn post(app: &axum::Router, path: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);

        (status, json)
    }

    #[tokio::test]
    async fn test_nonce() {
        let tmp = tempfile::tempdir().unwrap();
        let chain = Arc::new(MockChain::default());
        chain.set_account(
            Address::from_str("os1alice").unwrap(),
            Account {
                balance: 100,
                nonce: 7,
            },
        );
        let (node, app) = app(tmp.path(), chain);

        let (status, body) = post(&app, "/api/nonce", serde_json::json!({"address": "os1alice"})).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["nonce"], 7);
        node.shutdown();
    }

    #[tokio::test]
    async fn test_nonce_unknown_account() {
        let tmp = tempfile::tempdir().unwrap();
        let (node, app) = app(tmp.path(), Arc::new(MockChain::default()));

        let (status, body) = post(&app, "/api/nonce", serde_json::json!({"address": "os1ghost"})).await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], 404);
        node.shutdown();
    }

    #[tokio::test]
    async fn test_merge_request() {
        let tmp = tempfile::tempdir().unwrap();
        let (node, app) = app(tmp.path(), Arc::new(MockChain::default()));

        let (status, body) = post(
            &app,
            "/api/merge-request",
            serde_json::json!({
                "id": "0001",
                "repo": "alice",
                "baseBranch": "master",
                "baseHash": "0000000000000000000000000000000000000000",
                "targetBranch": "feature",
                "targetHash": "0000000000000000000000000000000000000000",
            }),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["code"], 0);
        assert_eq!(body["height"], 0);
        assert_eq!(body["hash"].as_str().unwrap().len(), 64);
        node.shutdown();
    }
}
