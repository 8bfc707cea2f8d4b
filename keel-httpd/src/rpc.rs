//! HTTP-backed ports.
//!
//! The daemon reaches its chain node, DHT gateway and mempool over a
//! JSON/HTTP interface. Each adapter is a thin client for one of the
//! core's port traits; timeouts map to retriable errors.

use std::io::Read as _;
use std::time::Duration;

use serde_json::json;

use keel::chain::{
    self, Account, Block, ChainView, Dht, Error, Host, Mempool, PusherKey, RepoState,
};
use keel::note::PushTx;
use keel::storage::RepoName;
use keel::tx::PushKeyId;
use keel::wire;

/// Chain RPC request timeout.
const CHAIN_TIMEOUT: Duration = Duration::from_secs(10);

fn agent(timeout: Duration) -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_read(timeout)
        .timeout_write(timeout)
        .build()
}

fn convert(err: ureq::Error) -> Error {
    match err {
        ureq::Error::Transport(t)
            if t.kind() == ureq::ErrorKind::Io || t.kind() == ureq::ErrorKind::ConnectionFailed =>
        {
            Error::Timeout
        }
        other => Error::rpc(other),
    }
}

/// Read-only chain view over HTTP.
pub struct HttpChain {
    base: String,
    agent: ureq::Agent,
}

impl HttpChain {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            agent: agent(CHAIN_TIMEOUT),
        }
    }

    fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<Option<T>, Error> {
        let url = format!("{}{path}", self.base);

        match self.agent.get(&url).call() {
            Ok(response) => Ok(Some(response.into_json().map_err(Error::rpc)?)),
            Err(ureq::Error::Status(404, _)) => Ok(None),
            Err(err) => Err(convert(err)),
        }
    }
}

impl ChainView for HttpChain {
    fn pusher_key(&self, id: &PushKeyId) -> Result<Option<PusherKey>, Error> {
        self.get(&format!("/v1/pusher-keys/{id}"))
    }

    fn account(&self, addr: &chain::Address) -> Result<Option<Account>, Error> {
        self.get(&format!("/v1/accounts/{addr}"))
    }

    fn top_hosts(&self, epoch: u64) -> Result<Vec<Host>, Error> {
        Ok(self
            .get(&format!("/v1/hosts?epoch={epoch}"))?
            .unwrap_or_default())
    }

    fn repo_state(&self, name: &RepoName) -> Result<Option<RepoState>, Error> {
        self.get(&format!("/v1/repos/{name}"))
    }

    fn block(&self, height: u64) -> Result<Option<Block>, Error> {
        self.get(&format!("/v1/blocks/{height}"))
    }

    fn height(&self) -> Result<u64, Error> {
        let value: serde_json::Value = self
            .get("/v1/height")?
            .ok_or_else(|| Error::rpc("height endpoint missing"))?;

        value["height"]
            .as_u64()
            .ok_or_else(|| Error::rpc("malformed height response"))
    }
}

/// DHT gateway over HTTP.
pub struct HttpDht {
    base: String,
    agent: ureq::Agent,
}

impl HttpDht {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            agent: agent(chain::DHT_TIMEOUT),
        }
    }
}

impl Dht for HttpDht {
    fn announce(&self, key: &str) -> Result<(), Error> {
        self.agent
            .post(&format!("{}/v1/dht/announce", self.base))
            .send_json(json!({ "module": chain::DHT_OBJECT_MODULE, "key": key }))
            .map_err(convert)?;

        Ok(())
    }

    fn get_object(&self, key: &str) -> Result<Vec<u8>, Error> {
        let response = self
            .agent
            .post(&format!("{}/v1/dht/get", self.base))
            .send_json(json!({ "module": chain::DHT_OBJECT_MODULE, "key": key }))
            .map_err(|err| match err {
                ureq::Error::Status(404, _) => Error::NotFound(key.to_owned()),
                other => convert(other),
            })?;
        let mut bytes = Vec::new();

        response
            .into_reader()
            .read_to_end(&mut bytes)
            .map_err(Error::from)?;

        Ok(bytes)
    }
}

/// Mempool over HTTP.
pub struct HttpMempool {
    base: String,
    agent: ureq::Agent,
}

impl HttpMempool {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            agent: agent(CHAIN_TIMEOUT),
        }
    }
}

impl Mempool for HttpMempool {
    fn add(&self, tx: PushTx) -> Result<(), Error> {
        self.agent
            .post(&format!("{}/v1/mempool", self.base))
            .send_json(json!({ "tx": wire::serialize(&tx) }))
            .map_err(convert)?;

        Ok(())
    }

    fn references_repo(&self, name: &RepoName) -> Result<bool, Error> {
        let response = self
            .agent
            .get(&format!("{}/v1/mempool/repos/{name}", self.base))
            .call()
            .map_err(convert)?;
        let value: serde_json::Value = response.into_json().map_err(Error::rpc)?;

        Ok(value["referenced"].as_bool().unwrap_or(false))
    }
}
