use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tagwatch::*;
use tokio::time::Duration;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::FormatTime;

struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(
            w,
            "{}",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z")
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_timer(LocalTimer)
        .with_env_filter(filter)
        .init();

    let app_config = config::AppConfig::load()?;
    tracing::info!("{} is starting (version = {})", version::NAME, version::VERSION);

    let bus = event::EventBus::default();
    let store = Arc::new(if app_config.store.in_memory {
        store::ContainerStore::in_memory(bus.clone())
    } else {
        store::ContainerStore::open(&app_config.store.path, bus.clone()).await?
    });
    store.init(version::VERSION).await?;

    let http = reqwest::Client::builder()
        .user_agent(format!("{}/{}", version::NAME, version::VERSION))
        .build()?;
    let registries = registry::Registries::from_config(&app_config.registries, http.clone());
    let output = trigger::OutputHub::new(Duration::from_secs(
        app_config.install.output_retention_secs,
    ));
    let triggers = trigger::Triggers::from_config(&app_config.triggers, http, output.clone());
    if triggers.install_availability() == trigger::InstallAvailability::Ambiguous {
        tracing::warn!("Multiple triggers have install enabled; install action will be disabled.");
    }

    let mut watchers = Vec::new();
    let mut engines: HashMap<String, Arc<dyn engine::ContainerEngine>> = HashMap::new();
    for (name, watcher_config) in app_config.watchers() {
        let docker: Arc<dyn engine::ContainerEngine> =
            match engine::DockerEngine::connect(watcher_config.endpoint()) {
                Ok(docker) => Arc::new(docker),
                Err(e) => {
                    tracing::warn!(watcher = %name, error = %e, "Unable to connect to the container engine");
                    continue;
                }
            };
        engines.insert(name.clone(), docker.clone());
        watchers.push(Arc::new(watcher::Watcher::new(
            &name,
            watcher_config,
            docker,
            registries.clone(),
            store.clone(),
        )));
    }
    let installer = Arc::new(trigger::Installer::new(
        store.clone(),
        engines,
        (&app_config.install).into(),
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let dispatcher_handle = trigger::spawn(triggers.clone(), &bus, shutdown_rx.clone());
    let watcher_handles: Vec<_> = watchers
        .iter()
        .map(|w| watcher::spawn(w.clone(), shutdown_rx.clone()))
        .collect();

    let app = routes::app(
        routes::AppDeps {
            store,
            watchers,
            registries,
            triggers,
            installer,
            output,
        },
        app_config.clone(),
    );
    let addr = format!("{}:{}", app_config.server.host, app_config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on http://{}", addr);

    let in_container = std::path::Path::new("/.dockerenv").exists()
        || std::env::var("CONTAINER").as_deref() == Ok("1");

    if in_container {
        // In Docker: run server until error or SIGTERM (no signal handler; avoids immediate exit)
        axum::serve(listener, app).await?;
    } else {
        tokio::select! {
            result = axum::serve(listener, app) => {
                result?;
            }
            _ = async {
                #[cfg(unix)]
                {
                    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                        Ok(s) => s,
                        Err(_) => {
                            let _ = tokio::signal::ctrl_c().await;
                            return;
                        }
                    };
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = sigterm.recv() => {}
                    }
                }
                #[cfg(not(unix))]
                {
                    let _ = tokio::signal::ctrl_c().await;
                }
            } => {
                tracing::info!("Received shutdown signal");
                let _ = shutdown_tx.send(true);
                for handle in watcher_handles {
                    let _ = handle.await;
                }
                let _ = dispatcher_handle.await;
            }
        }
    }

    Ok(())
}
