//! Subsystem assembly and the background task set.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use prepline_api::{ApiState, NodeMailboxes, build_router};
use prepline_core::{PreplineConfig, SharedClock};
use prepline_decisions::{DecisionLog, DecisionPersister};
use prepline_predict::PatternPredictor;
use prepline_prewarm::{ChannelAgent, PrewarmScheduler};
use prepline_registry::NodeRegistry;
use prepline_router::{FunctionDirectory, Router, RouterDeps, StaticDirectory};
use prepline_sizer::WarmPoolSizer;
use prepline_state::{ScaleCommand, StateStore};
use prepline_traffic::{CompletionEvent, TrafficObserver, recorder_channel};

use crate::demo;

/// Undelivered scale commands kept per node before the oldest is dropped.
const MAILBOX_CAPACITY: usize = 256;

/// Every subsystem, wired but not yet running.
pub struct Daemon {
    api: ApiState,
    events: mpsc::Receiver<CompletionEvent>,
    commands: mpsc::Receiver<ScaleCommand>,
    persister: DecisionPersister,
    demo: bool,
}

impl Daemon {
    pub fn assemble(
        config: PreplineConfig,
        store: StateStore,
        clock: SharedClock,
        demo: bool,
    ) -> anyhow::Result<Self> {
        let mut profiles = config.functions.clone();
        if demo && profiles.is_empty() {
            profiles = demo::functions();
        }
        let directory: Arc<dyn FunctionDirectory> = Arc::new(StaticDirectory::new(profiles));
        info!(functions = directory.list_functions().len(), "function directory loaded");

        let registry = Arc::new(NodeRegistry::new(config.registry.clone(), clock.clone()));

        let observer = Arc::new(
            TrafficObserver::new(config.traffic.clone(), clock.clone()).with_store(store.clone()),
        );
        observer.load_history()?;
        if demo {
            demo::seed_history(&observer, &directory.list_functions(), clock.now_ms());
        }
        let (recorder, events) = recorder_channel(config.traffic.channel_capacity);

        let predictor = Arc::new(PatternPredictor::new(
            Arc::clone(&observer),
            config.predictor.clone(),
            clock.clone(),
        ));
        predictor.refresh_all();

        let sizer = Arc::new(WarmPoolSizer::new(
            Arc::clone(&directory),
            Arc::clone(&observer),
            Arc::clone(&predictor),
            config.sizer.clone(),
            clock.clone(),
        ));
        let targets = sizer.tick();
        info!(targets = targets.len(), "initial warm targets computed");

        let (log, persister) = DecisionLog::with_persistence(&config.decisions, store.clone());
        let reloaded = log.reload(&store)?;
        info!(records = reloaded, "decision log reloaded");
        let log = Arc::new(log);

        let (agent, commands) = ChannelAgent::new(config.prewarm.command_channel_capacity);
        let scheduler = Arc::new(PrewarmScheduler::new(
            Arc::clone(&registry),
            Arc::clone(&sizer),
            Arc::clone(&observer),
            Arc::clone(&log),
            Arc::new(agent),
            config.prewarm.clone(),
            clock.clone(),
        ));

        if demo {
            demo::register_nodes(&registry)?;
        }

        let deps = RouterDeps {
            directory,
            registry,
            observer,
            recorder,
            sizer,
            log,
        };
        let router = Arc::new(Router::new(deps, config.router.clone(), clock));

        Ok(Self {
            api: ApiState {
                router,
                scheduler,
                predictor,
                mailboxes: Arc::new(NodeMailboxes::new(MAILBOX_CAPACITY)),
            },
            events,
            commands,
            persister,
            demo,
        })
    }

    /// The HTTP surface over the assembled subsystems.
    pub fn app(&self) -> axum::Router {
        build_router(self.api.clone())
    }

    /// Start the background loops and serve until Ctrl-C.
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let app = self.app();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = self.spawn_loops(&shutdown_rx);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "failed to install Ctrl-C handler");
                    std::future::pending::<()>().await;
                }
                info!("shutdown signal received");
                let _ = shutdown_tx.send(true);
            })
            .await?;

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "background task panicked");
            }
        }
        Ok(())
    }

    fn spawn_loops(self, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let Daemon {
            api,
            events,
            commands,
            persister,
            demo,
        } = self;
        let deps = api.router.deps().clone();
        let mut handles = Vec::new();

        let observer = Arc::clone(&deps.observer);
        let rx = shutdown.clone();
        handles.push(tokio::spawn(async move { observer.run(events, rx).await }));

        let predictor = Arc::clone(&api.predictor);
        let rx = shutdown.clone();
        handles.push(tokio::spawn(async move { predictor.run(rx).await }));

        let sizer = Arc::clone(&deps.sizer);
        let rx = shutdown.clone();
        handles.push(tokio::spawn(async move { sizer.run(rx).await }));

        handles.push(tokio::spawn(Arc::clone(&api.scheduler).run(shutdown.clone())));

        let router = Arc::clone(&api.router);
        let rx = shutdown.clone();
        handles.push(tokio::spawn(async move { router.run(rx).await }));

        handles.push(tokio::spawn(persister.run(shutdown.clone())));
        handles.push(tokio::spawn(
            Arc::clone(&api.mailboxes).run(commands, shutdown.clone()),
        ));

        if demo {
            handles.push(tokio::spawn(demo::simulate_agents(
                Arc::clone(&deps.registry),
                Arc::clone(&api.mailboxes),
                demo::AGENT_INTERVAL,
                shutdown.clone(),
            )));
        }

        info!(tasks = handles.len(), "background tasks started");
        handles
    }
}
