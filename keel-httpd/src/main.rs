use std::path::PathBuf;
use std::sync::Arc;
use std::{net::SocketAddr, process};

use keel::node::{self, Node};
use keel::sync::Mode;
use keel_httpd as httpd;

use httpd::rpc::{HttpChain, HttpDht, HttpMempool};

struct Options {
    listen: SocketAddr,
    repos_root: PathBuf,
    data_dir: PathBuf,
    key: Option<PathBuf>,
    chain_rpc: String,
    dht_rpc: String,
    mempool_rpc: String,
    validator: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options = parse_options()?;

    httpd::logger::init().expect("Global logger hasn't already been set");
    tracing::info!("version {}", env!("CARGO_PKG_VERSION"));

    let chain = Arc::new(HttpChain::new(options.chain_rpc));
    let dht = Arc::new(HttpDht::new(options.dht_rpc));
    let mempool = Arc::new(HttpMempool::new(options.mempool_rpc));

    let signer = match &options.key {
        Some(path) => Arc::new(keel_crypto::MemorySigner::load(path)?),
        None => {
            tracing::warn!("no --key given; using an ephemeral node key");
            Arc::new(keel_crypto::MemorySigner::generate())
        }
    };

    let mut config = node::Config::new(options.repos_root, options.data_dir);
    if options.validator {
        config.mode = Mode::Validator;
    }
    let node = Node::start(config, chain.clone(), dht, mempool, signer)?;
    let ctx = httpd::Context::new(&node, chain);

    match httpd::run(httpd::Options { listen: options.listen }, ctx).await {
        Ok(()) => {}
        Err(err) => {
            tracing::error!("Fatal: {:#}", err);
            process::exit(1);
        }
    }
    node.shutdown();

    Ok(())
}

/// Parse command-line arguments into daemon options.
fn parse_options() -> Result<Options, lexopt::Error> {
    use lexopt::prelude::*;

    let mut parser = lexopt::Parser::from_env();
    let mut listen = None;
    let mut repos_root = None;
    let mut data_dir = None;
    let mut key = None;
    let mut chain_rpc = None;
    let mut dht_rpc = None;
    let mut mempool_rpc = None;
    let mut validator = false;

    while let Some(arg) = parser.next()? {
        match arg {
            Long("listen") => {
                let addr = parser.value()?.parse()?;
                listen = Some(addr);
            }
            Long("repos") => {
                repos_root = Some(PathBuf::from(parser.value()?));
            }
            Long("data") => {
                data_dir = Some(PathBuf::from(parser.value()?));
            }
            Long("key") => {
                key = Some(PathBuf::from(parser.value()?));
            }
            Long("chain-rpc") => {
                chain_rpc = Some(parser.value()?.string()?);
            }
            Long("dht-rpc") => {
                dht_rpc = Some(parser.value()?.string()?);
            }
            Long("mempool-rpc") => {
                mempool_rpc = Some(parser.value()?.string()?);
            }
            Long("validator") => {
                validator = true;
            }
            Long("help") | Short('h') => {
                println!(
                    "usage: keel-httpd [--listen <addr>] [--repos <dir>] [--data <dir>] [--key <file>] \
                     [--chain-rpc <url>] [--dht-rpc <url>] [--mempool-rpc <url>] [--validator].."
                );
                process::exit(0);
            }
            _ => return Err(arg.unexpected()),
        }
    }
    let chain_rpc = chain_rpc.unwrap_or_else(|| "http://127.0.0.1:9657".to_owned());

    Ok(Options {
        listen: listen.unwrap_or_else(|| ([0, 0, 0, 0], 8080).into()),
        repos_root: repos_root.unwrap_or_else(|| PathBuf::from("repos")),
        data_dir: data_dir.unwrap_or_else(|| PathBuf::from("data")),
        key,
        dht_rpc: dht_rpc.unwrap_or_else(|| chain_rpc.clone()),
        mempool_rpc: mempool_rpc.unwrap_or_else(|| chain_rpc.clone()),
        chain_rpc,
        validator,
    })
}
