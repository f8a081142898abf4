#[macro_use]
extern crate rocket;

pub mod config;
pub mod db;
pub mod error;
pub mod import;
pub mod request_logger;
pub mod routes;
pub mod store;

use crate::config::ImportConfig;
use crate::db::ImportDb;
use crate::import::{ChannelBroadcaster, ImportCoordinator, LogNotifier, SideEffects};
use crate::request_logger::RequestLogger;
use crate::store::PgStore;
use env_logger::Env;
use rocket::fairing::AdHoc;
use rocket::http::Method;
use rocket::{Build, Rocket};
use rocket_cors::{AllowedOrigins, CorsOptions};
use rocket_db_pools::Database;
use rocket_okapi::{
    openapi_get_routes,
    rapidoc::{GeneralConfig, HideShowConfig, RapiDocConfig, make_rapidoc},
    settings::UrlObject,
    swagger_ui::{SwaggerUIConfig, make_swagger_ui},
};
use std::sync::{Arc, Once};

static LOGGER: Once = Once::new();

pub fn init_logger() {
    LOGGER.call_once(|| {
        env_logger::Builder::from_env(
            Env::default().default_filter_or("info,rocket::server=warn,rocket::request=warn"),
        )
        .init();
    });
}

/// Capacity of the in-process broadcast channel handed to subscribers.
const BROADCAST_CAPACITY: usize = 64;

pub fn rocket() -> Rocket<Build> {
    init_logger();

    let cors = CorsOptions::default()
        .allowed_origins(AllowedOrigins::all())
        .allowed_methods(
            vec![Method::Get, Method::Post]
                .into_iter()
                .map(From::from)
                .collect(),
        )
        .to_cors()
        .expect("Error creating CORS");

    rocket::build()
        .attach(RequestLogger)
        .attach(ImportDb::init())
        .attach(cors)
        // Run database migrations on startup
        .attach(AdHoc::try_on_ignite(
            "Run Migrations",
            |rocket| async move {
                match ImportDb::fetch(&rocket) {
                    Some(db) => {
                        let pool = (**db).clone();
                        match store::run_migrations(&pool).await {
                            Ok(_) => {
                                log::info!("database migrations successful");
                                Ok(rocket)
                            }
                            Err(e) => {
                                log::error!("database migrations failed: {}", e);
                                Err(rocket)
                            }
                        }
                    }
                    None => {
                        log::error!("database pool not available for migrations");
                        Err(rocket)
                    }
                }
            },
        ))
        .attach(AdHoc::try_on_ignite(
            "Import Coordinator",
            |rocket| async move {
                let Some(db) = ImportDb::fetch(&rocket) else {
                    log::error!("database pool not available for the import coordinator");
                    return Err(rocket);
                };
                let store = Arc::new(PgStore::new((**db).clone()));
                let config = ImportConfig::from_env();
                let broadcaster = ChannelBroadcaster::new(BROADCAST_CAPACITY);
                let side_effects = SideEffects::spawn(
                    config.side_effect_buffer,
                    Arc::new(LogNotifier),
                    Arc::new(broadcaster.clone()),
                );

                log::info!(
                    "import coordinator: max_concurrency={}, timeout={:?}",
                    config.max_concurrency,
                    config.timeout
                );

                match ImportCoordinator::new(store, config, side_effects) {
                    Ok(coordinator) => Ok(rocket.manage(coordinator).manage(broadcaster)),
                    Err(err) => {
                        log::error!("invalid stage topology: {}", err);
                        Err(rocket)
                    }
                }
            },
        ))
        .mount(
            "/api/v1",
            openapi_get_routes![
                routes::health::health_check,
                routes::import::import,
                routes::import::plan_import,
            ],
        )
        .mount(
            "/api/docs/swagger/",
            make_swagger_ui(&SwaggerUIConfig {
                url: "../../v1/openapi.json".to_owned(),
                ..Default::default()
            }),
        )
        .mount(
            "/api/docs/rapidoc/",
            make_rapidoc(&RapiDocConfig {
                general: GeneralConfig {
                    spec_urls: vec![UrlObject::new("Chain Import API", "../../v1/openapi.json")],
                    ..Default::default()
                },
                hide_show: HideShowConfig {
                    allow_spec_url_load: false,
                    allow_spec_file_load: false,
                    ..Default::default()
                },
                ..Default::default()
            }),
        )
}

#[cfg_attr(not(test), allow(dead_code))]
pub mod test_support {
    use crate::config::ImportConfig;
    use crate::import::{ImportCoordinator, SideEffects};
    use crate::store::ImportStore;
    use rocket::config::LogLevel;
    use rocket::figment::Figment;
    use rocket::local::asynchronous::Client as AsyncClient;
    use rocket::local::blocking::Client;
    use rocket::{Build, Rocket, Route};
    use std::sync::Arc;

    pub use database::{TestDatabase, TestDatabaseError};

    /// Record builders for integration tests.
    pub mod fixtures {
        use crate::import::RawRecord;
        use serde_json::{Value, json};

        pub fn record(value: Value) -> RawRecord {
            match value {
                Value::Object(map) => map,
                other => panic!("fixture is not an object: {other}"),
            }
        }

        pub fn block(number: i64) -> RawRecord {
            record(json!({
                "number": number,
                "hash": format!("0x{number:064x}"),
                "timestamp": "2024-01-01T00:00:00Z",
                "gas_used": "21000",
            }))
        }

        pub fn address(hash: &str) -> RawRecord {
            record(json!({"hash": hash}))
        }

        pub fn transaction(hash: &str, block_number: i64, from: &str) -> RawRecord {
            record(json!({
                "hash": hash,
                "block_number": block_number,
                "from_address_hash": from,
                "value": "1000000000000000000",
            }))
        }

        pub fn log(transaction_hash: &str, index: i64, block_number: i64) -> RawRecord {
            record(json!({
                "transaction_hash": transaction_hash,
                "index": index,
                "block_number": block_number,
                "data": "0x",
            }))
        }
    }

    pub mod database {
        use crate::store::run_migrations;
        use log::LevelFilter;
        use rocket_db_pools::sqlx::postgres::{PgConnectOptions, PgPoolOptions};
        use rocket_db_pools::sqlx::{self, ConnectOptions, Connection, PgPool};
        use testcontainers::core::error::TestcontainersError;
        use testcontainers::runners::AsyncRunner;
        use testcontainers::{ContainerAsync, ImageExt};
        use testcontainers_modules::postgres::Postgres;
        use thiserror::Error;
        use uuid::Uuid;

        #[derive(Debug, Error)]
        pub enum TestDatabaseError {
            #[error("TEST_DATABASE_URL not set and IMPORT_TEST_CONTAINERS not enabled")]
            MissingUrl,
            #[error("database error: {0}")]
            Sqlx(#[from] sqlx::Error),
            #[error("migration error: {0}")]
            Migration(#[from] sqlx::migrate::MigrateError),
            #[error("container error: {0}")]
            Container(#[from] TestcontainersError),
        }

        /// A throwaway database holding the import schema.
        ///
        /// The server comes from `TEST_DATABASE_URL`, or from a Postgres
        /// container when `IMPORT_TEST_CONTAINERS` is set. Call
        /// [`TestDatabase::close`] to drop the database again.
        pub struct TestDatabase {
            pool: PgPool,
            server: PgConnectOptions,
            name: String,
            _container: Option<ContainerAsync<Postgres>>,
        }

        impl TestDatabase {
            pub async fn new_from_env() -> Result<Self, TestDatabaseError> {
                let (server, container) = match std::env::var("TEST_DATABASE_URL") {
                    Ok(url) => (url.parse::<PgConnectOptions>()?, None),
                    Err(_) if std::env::var_os("IMPORT_TEST_CONTAINERS").is_some() => {
                        let (server, container) = start_container().await?;
                        (server, Some(container))
                    }
                    Err(_) => return Err(TestDatabaseError::MissingUrl),
                };

                let server = server.log_statements(LevelFilter::Off).database("postgres");
                let name = format!("chain_import_test_{}", Uuid::new_v4().simple());
                execute(&server, &format!("CREATE DATABASE \"{name}\"")).await?;

                let pool = PgPoolOptions::new()
                    .max_connections(5)
                    .connect_with(server.clone().database(&name))
                    .await?;
                run_migrations(&pool).await?;

                Ok(Self {
                    pool,
                    server,
                    name,
                    _container: container,
                })
            }

            pub fn pool(&self) -> &PgPool {
                &self.pool
            }

            /// Close the pool and drop the database.
            pub async fn close(self) -> Result<(), TestDatabaseError> {
                self.pool.close().await;
                execute(
                    &self.server,
                    &format!("DROP DATABASE IF EXISTS \"{}\" WITH (FORCE)", self.name),
                )
                .await?;
                Ok(())
            }
        }

        async fn start_container()
        -> Result<(PgConnectOptions, ContainerAsync<Postgres>), TestcontainersError> {
            let container = Postgres::default().with_tag("16-alpine").start().await?;
            let host = container.get_host().await?.to_string();
            let port = container.get_host_port_ipv4(5432).await?;

            let server = PgConnectOptions::new()
                .host(&host)
                .port(port)
                .username("postgres")
                .password("postgres");
            Ok((server, container))
        }

        /// Run one statement on the maintenance database.
        async fn execute(server: &PgConnectOptions, sql: &str) -> Result<(), sqlx::Error> {
            let mut conn = server.connect().await?;
            sqlx::query(sql).execute(&mut conn).await?;
            conn.close().await
        }
    }

    /// Builder for constructing Rocket instances tailored for integration tests.
    #[derive(Default)]
    pub struct TestRocketBuilder {
        figment: Figment,
        mounts: Vec<(String, Vec<Route>)>,
        coordinator: Option<ImportCoordinator>,
    }

    impl TestRocketBuilder {
        /// Start a builder with sensible defaults: random port, logging disabled.
        pub fn new() -> Self {
            let figment = rocket::Config::figment()
                .merge(("port", 0))
                .merge(("log_level", LogLevel::Off))
                .merge(("cli_colors", false));

            Self {
                figment,
                mounts: Vec::new(),
                coordinator: None,
            }
        }

        /// Mount routes under `/api/v1`.
        pub fn mount_api_routes(mut self, routes: Vec<Route>) -> Self {
            self.mounts.push(("/api/v1".to_string(), routes));
            self
        }

        /// Manage an import coordinator over `store` with side effects off.
        pub fn manage_store(self, store: Arc<dyn ImportStore>) -> Self {
            let coordinator =
                ImportCoordinator::new(store, ImportConfig::default(), SideEffects::disabled())
                    .expect("default stage topology is valid");
            self.manage_coordinator(coordinator)
        }

        pub fn manage_coordinator(mut self, coordinator: ImportCoordinator) -> Self {
            self.coordinator = Some(coordinator);
            self
        }

        /// Finish building the Rocket instance.
        pub fn build(self) -> Rocket<Build> {
            let mut rocket = rocket::custom(self.figment);

            for (base, routes) in self.mounts {
                rocket = rocket.mount(base, routes);
            }

            if let Some(coordinator) = self.coordinator {
                rocket = rocket.manage(coordinator);
            }

            rocket
        }

        /// Convenience helper to produce a blocking local client.
        pub fn blocking_client(self) -> Client {
            Client::tracked(self.build()).expect("valid Rocket instance")
        }

        /// Convenience helper to produce an asynchronous local client.
        pub async fn async_client(self) -> AsyncClient {
            AsyncClient::tracked(self.build())
                .await
                .expect("valid Rocket instance")
        }
    }
}
