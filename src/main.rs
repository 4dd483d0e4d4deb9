use std::fs;
use std::process::ExitCode;

mod auth;
mod config;
mod credentials;
mod error;
mod graph;
mod sync;

use auth::{Authenticator, DeviceCodeProvider};
use config::Config;
use credentials::TokenCacheStore;
use error::SyncError;
use graph::GraphClient;
use sync::SyncEngine;

/// Public client registration for this tool in the Microsoft identity
/// platform.
const APP_ID: &str = "855929bc-bbb8-475b-84ff-7a93c0b91019";

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        // Missing config keys and unlocated resources end the run quietly
        // with exit 0; the message is the whole story.
        Err(err) if err.is_controlled_stop() => {
            println!("{}", err.message());
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("Error: {}", err.message());
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), SyncError> {
    let data_dir = config::data_dir();
    fs::create_dir_all(&data_dir)?;

    let config = Config::load(&config::config_path(&data_dir))?;

    let provider = DeviceCodeProvider::new(APP_ID);
    let store = TokenCacheStore::new(credentials::token_cache_path(&data_dir));
    let authenticator = Authenticator::new(provider, store, data_dir);
    let graph = GraphClient::new(authenticator);

    let report = SyncEngine::new(&graph, &config).run()?;
    println!("{}", report.summary());
    println!("Done!");
    Ok(())
}
