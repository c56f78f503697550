use std::time::Duration;

use ckb_sql_indexer::client::HttpClient;
use ckb_sql_indexer::service::{Config, Service};
use ckb_sql_indexer::store::{PgStore, SqliteStore, Store};

const RPC_TIMEOUT: Duration = Duration::from_secs(30);

fn main() {
    drop(env_logger::try_init());
    let mut args = std::env::args().skip(1);
    let store_url = args
        .next()
        .unwrap_or_else(|| "ckb-indexer.db".to_string());
    let rpc_uri = args
        .next()
        .unwrap_or_else(|| "http://127.0.0.1:8114".to_string());

    let client = HttpClient::new(rpc_uri, RPC_TIMEOUT);
    let result = if store_url.starts_with("postgres://") || store_url.starts_with("postgresql://") {
        let store = PgStore::new(store_url);
        run(store, client)
    } else {
        let store = SqliteStore::new(store_url);
        run(store, client)
    };
    if let Err(error) = result {
        eprintln!("Error: {:?}", error);
        std::process::exit(1);
    }
}

fn run<S: Store>(store: S, client: HttpClient) -> Result<(), Box<dyn std::error::Error>> {
    store.init()?;
    let service = Service::new(store, client, Config::default());
    service.start_forever()?;
    Ok(())
}
