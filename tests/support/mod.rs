//! Shared fixture for the integration tests: a mini backend plus a driver
//! wired to it through a [`MemoryProvider`].

#![allow(dead_code)]

pub mod server;

use mdz::{Config, Driver, MemoryProvider, Schema};

pub use server::MiniRedis;

pub struct Fixture {
    pub server: MiniRedis,
    pub provider: MemoryProvider,
    pub driver: Driver,
}

pub fn config_for(server: &MiniRedis) -> Config {
    Config {
        addr: server.addr().to_string(),
        repair_freq_ms: 10,
        ..Config::default()
    }
}

/// Starts a backend, deploys `schema`, and initializes a driver against it.
pub async fn fixture(schema: Schema) -> anyhow::Result<Fixture> {
    fixture_with(schema, |config| config).await
}

fn init_tracing() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub async fn fixture_with(
    schema: Schema,
    tweak: impl FnOnce(Config) -> Config,
) -> anyhow::Result<Fixture> {
    init_tracing();
    let server = MiniRedis::start().await?;
    let provider = MemoryProvider::new();
    provider.deploy(schema)?;
    let config = tweak(config_for(&server));
    let driver = Driver::init(&provider, config).await?;
    Ok(Fixture {
        server,
        provider,
        driver,
    })
}
