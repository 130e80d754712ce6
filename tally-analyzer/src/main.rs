use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use tally_analyzer::clock::SystemClock;
use tally_analyzer::executor::ReportExecutor;
use tally_analyzer::generator::ReportGenerator;
use tally_analyzer::scheduler::ReportScheduler;
use tally_analyzer::service::ReportService;
use tally_analyzer::settings::AnalyzerSettings;
use tally_analyzer::state::AppState;
#[cfg(feature = "postgres")]
use tally_analyzer::store::PostgresStore;
use tally_analyzer::store::{DataStore, MemoryStore, ObservationStore, ReportStore};
use tally_wire::registry::ProjectRegistry;

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let settings = AnalyzerSettings::from_env();

    let registry = Arc::new(load_registry(&settings));

    #[cfg(feature = "postgres")]
    let data_store: Arc<dyn DataStore> = match &settings.database_url {
        Some(url) => Arc::new(PostgresStore::connect(url).await.unwrap()),
        None => Arc::new(MemoryStore::new()),
    };
    #[cfg(not(feature = "postgres"))]
    let data_store: Arc<dyn DataStore> = {
        if settings.database_url.is_some() {
            warn!("DATABASE_URL is set but the postgres feature is disabled; using the in-memory store");
        }
        Arc::new(MemoryStore::new())
    };

    let clock = Arc::new(SystemClock);
    let observation_store = Arc::new(ObservationStore::new(Arc::clone(&data_store)));
    let report_store = Arc::new(ReportStore::new(Arc::clone(&data_store), clock.clone()));

    let generator = ReportGenerator::new(
        Arc::clone(&registry),
        Arc::clone(&observation_store),
        Arc::clone(&report_store),
    );
    let executor = Arc::new(ReportExecutor::new(Arc::clone(&report_store), generator));
    executor.start();

    let service = Arc::new(ReportService::new(
        Arc::clone(&registry),
        Arc::clone(&report_store),
        Arc::clone(&executor),
    ));

    let scheduler = ReportScheduler::new(
        Arc::clone(&registry),
        Arc::clone(&report_store),
        Arc::clone(&service) as Arc<dyn tally_analyzer::scheduler::ReportStarter>,
        clock,
        settings.scheduler_settings(),
    );
    let scheduler_handle = scheduler.spawn();

    let listener = TcpListener::bind(&settings.listen_addr).await.unwrap();
    info!("listening on http://{}", listener.local_addr().unwrap());

    let state = AppState::new(Arc::clone(&service));
    if let Err(e) = axum::serve(listener, state.into_router())
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("webserver crashed: {}", e);
    }

    // Drain: let the executor finish what was enqueued, then stop the
    // background tasks.
    info!("waiting for in-flight reports to finish");
    service.wait_until_idle().await;
    scheduler_handle.shutdown().await;
    executor.shutdown().await;
}

fn load_registry(settings: &AnalyzerSettings) -> ProjectRegistry {
    match &settings.registry_path {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .unwrap_or_else(|err| panic!("cannot read registry file {path}: {err}"));
            ProjectRegistry::from_json_str(&contents)
                .unwrap_or_else(|err| panic!("cannot parse registry file {path}: {err}"))
        }
        None => {
            warn!("no TALLY_REGISTRY_PATH set, starting with an empty registry");
            ProjectRegistry::default()
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
