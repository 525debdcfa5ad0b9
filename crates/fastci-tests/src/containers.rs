//! Throwaway PostgreSQL and NATS servers for the `integration` tests.
//!
//! Each server lives as long as its handle; dropping the handle stops the
//! container, so a test keeps it in scope for as long as it talks to it.

use fastci_db::Database;
use fastci_nats::NatsNotifier;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::{nats::Nats, postgres::Postgres};

const POSTGRES_TAG: &str = "16-alpine";
const NATS_TAG: &str = "2.10-alpine";

/// A PostgreSQL server backing `PgStore`.
pub struct PostgresContainer {
    _server: ContainerAsync<Postgres>,
    connection_string: String,
}

impl PostgresContainer {
    pub async fn start() -> anyhow::Result<Self> {
        let server = Postgres::default().with_tag(POSTGRES_TAG).start().await?;
        let host = server.get_host().await?;
        let port = server.get_host_port_ipv4(5432).await?;

        Ok(Self {
            _server: server,
            connection_string: format!("postgres://postgres:postgres@{host}:{port}/postgres"),
        })
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    /// A fresh pool with the fastci schema applied. Every call opens its own
    /// pool, which is how a second fastci process would see the database.
    pub async fn database(&self) -> anyhow::Result<Database> {
        let db = Database::connect(&self.connection_string).await?;
        db.migrate().await?;
        Ok(db)
    }
}

/// A NATS server receiving change notifications.
pub struct NatsContainer {
    _server: ContainerAsync<Nats>,
    url: String,
}

impl NatsContainer {
    pub async fn start() -> anyhow::Result<Self> {
        let server = Nats::default().with_tag(NATS_TAG).start().await?;
        let host = server.get_host().await?;
        let port = server.get_host_port_ipv4(4222).await?;

        Ok(Self {
            _server: server,
            url: format!("nats://{host}:{port}"),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn notifier(&self) -> anyhow::Result<NatsNotifier> {
        Ok(NatsNotifier::connect(&self.url).await?)
    }
}
