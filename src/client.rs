use crate::ui;
use alloy::{
    primitives::Address,
    signers::local::PrivateKeySigner,
};
use color_eyre::eyre::{
    Result,
    WrapErr,
    eyre,
};
use deployments::Deployments;
use std::{
    collections::HashMap,
    sync::Arc,
};
use team_lottery::{
    cache::ReadCache,
    chain::{
        AlloyChainClient,
        ChainClient,
        Connection,
    },
    config::{
        ClientConfig,
        NetworkConfig,
    },
    coordinator::{
        SyncHandle,
        SyncWorker,
        SyncWorkerEvent,
    },
    error::{
        FetchError,
        MutationError,
    },
    session::SessionTracker,
    submitter::{
        MutationOutcome,
        MutationPhase,
        MutationSubmitter,
    },
    types::{
        MutationKind,
        TeamSnapshot,
        TriggerSource,
        format_native,
    },
    validation::{
        GuessForm,
        RegisterTeamForm,
    },
    wallets::{
        self,
        WalletDescriptor,
    },
};
use tokio::{
    sync::{
        mpsc,
        watch,
    },
    task::AbortHandle,
};
use tracing::{
    error,
    info,
    warn,
};

const MAX_ERRORS: usize = 50;

pub struct AppConfig {
    pub config: ClientConfig,
    /// Index into `config.networks`.
    pub network: usize,
    pub deployments: Deployments,
    pub wallet: WalletDescriptor,
}

#[derive(Clone, Debug)]
pub struct ConnectionView {
    pub connected: bool,
    pub account: Option<Address>,
    pub chain_id: Option<u64>,
    pub network: String,
    pub contract: Option<Address>,
}

/// Everything the UI needs for one frame.
#[derive(Clone, Debug)]
pub struct AppSnapshot {
    pub connection: ConnectionView,
    pub teams: Arc<TeamSnapshot>,
    pub refreshing: bool,
    pub register_phase: MutationPhase,
    pub guess_phase: MutationPhase,
    pub deposit: String,
    pub status: String,
    pub errors: Vec<String>,
}

type MutationResult = (MutationKind, Result<MutationOutcome, MutationError>);

/// Abort handles of the spawned mutation tasks, at most one per kind.
#[derive(Default)]
struct MutationTasks {
    tasks: HashMap<MutationKind, AbortHandle>,
}

impl MutationTasks {
    fn is_running(&self, kind: MutationKind) -> bool {
        self.tasks.get(&kind).is_some_and(|task| !task.is_finished())
    }

    /// Records `task` unless a live task of the same kind is tracked already.
    fn track(&mut self, kind: MutationKind, task: AbortHandle) -> bool {
        if self.is_running(kind) {
            return false;
        }
        self.tasks.insert(kind, task);
        true
    }

    fn finish(&mut self, kind: MutationKind) {
        if !self.is_running(kind) {
            self.tasks.remove(&kind);
        }
    }

    fn abort_all(&mut self) {
        for (kind, task) in self.tasks.drain() {
            info!(%kind, "cancelling in-flight mutation");
            task.abort();
        }
    }
}

pub struct AppController {
    config: ClientConfig,
    deployments: Deployments,
    network: usize,
    wallet: WalletDescriptor,
    signer: PrivateKeySigner,
    tracker: SessionTracker,
    sync: SyncHandle<AlloyChainClient>,
    submitter: MutationSubmitter,
    connection: Option<Connection<AlloyChainClient>>,
    mutations: MutationTasks,
    mutation_tx: mpsc::UnboundedSender<MutationResult>,
    refreshing: bool,
    status: String,
    errors: Vec<String>,
}

impl AppController {
    fn new(
        app: AppConfig,
        signer: PrivateKeySigner,
    ) -> Result<(
        Self,
        mpsc::UnboundedReceiver<SyncWorkerEvent>,
        mpsc::UnboundedReceiver<MutationResult>,
    )> {
        let deposit = app.config.registration_deposit_wei()?;
        let tracker = SessionTracker::new();
        let cache = ReadCache::new(tracker.watcher());
        let (sync, sync_events, _worker) =
            SyncWorker::spawn(cache, app.config.refresh_interval());
        let submitter =
            MutationSubmitter::new(deposit, tracker.watcher(), sync.refresh().clone());
        let (mutation_tx, mutation_rx) = mpsc::unbounded_channel();
        let controller = Self {
            config: app.config,
            deployments: app.deployments,
            network: app.network,
            wallet: app.wallet,
            signer,
            tracker,
            sync,
            submitter,
            connection: None,
            mutations: MutationTasks::default(),
            mutation_tx,
            refreshing: false,
            status: "Disconnected".to_string(),
            errors: Vec::new(),
        };
        Ok((controller, sync_events, mutation_rx))
    }

    fn network_config(&self) -> Result<&NetworkConfig> {
        self.config
            .networks
            .get(self.network)
            .ok_or_else(|| eyre!("network index {} out of range", self.network))
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub async fn connect(&mut self) -> Result<()> {
        self.disconnect();
        let network = self.network_config()?.clone();
        self.set_status(format!("Connecting to {}...", network.name));
        let client =
            AlloyChainClient::connect(&network, self.signer.clone(), &self.deployments)
                .await
                .wrap_err_with(|| format!("Failed to connect to {}", network.name))?;
        let key = self.tracker.connect(client.chain_id());
        let connection = Connection::new(client, key);
        if connection.client.contract_address().is_none() {
            self.push_errors(vec![format!(
                "No Lottery deployment known for chain {}; switch network with 'n'",
                key.chain_id
            )]);
        }
        self.sync.connect(connection.clone());
        self.connection = Some(connection);
        self.set_status(format!(
            "Connected to {} as {}",
            network.name,
            self.signer.address()
        ));
        Ok(())
    }

    /// Drops the connection and everything tied to it. The unlocked key is
    /// kept so reconnecting does not prompt again.
    pub fn disconnect(&mut self) {
        if self.connection.take().is_none() {
            return;
        }
        self.tracker.disconnect();
        self.mutations.abort_all();
        self.submitter.reset();
        self.sync.disconnect();
        self.refreshing = false;
        self.set_status("Disconnected");
    }

    pub async fn next_network(&mut self) -> Result<()> {
        self.network = (self.network + 1) % self.config.networks.len().max(1);
        let name = self.network_config()?.name.clone();
        info!(network = %name, "switching network");
        if self.is_connected() {
            self.connect().await
        } else {
            self.set_status(format!("Selected {name}"));
            Ok(())
        }
    }

    pub fn request_refresh(&mut self) {
        if !self.is_connected() {
            self.set_status("Connect a wallet to load teams");
            return;
        }
        self.sync.refresh().trigger(TriggerSource::Manual);
    }

    pub fn register_team(&mut self, form: RegisterTeamForm) {
        let submitter = self.submitter.clone();
        self.spawn_mutation(MutationKind::RegisterTeam, move |connection| async move {
            submitter.register_team(&connection, &form).await
        });
    }

    pub fn make_guess(&mut self, form: GuessForm) {
        let submitter = self.submitter.clone();
        self.spawn_mutation(MutationKind::MakeGuess, move |connection| async move {
            submitter.make_guess(&connection, &form).await
        });
    }

    fn spawn_mutation<F, Fut>(&mut self, kind: MutationKind, run: F)
    where
        F: FnOnce(Connection<AlloyChainClient>) -> Fut,
        Fut: Future<Output = Result<MutationOutcome, MutationError>> + Send + 'static,
    {
        let Some(connection) = self.connection.clone() else {
            self.push_errors(vec![format!("Connect a wallet before you {kind}")]);
            return;
        };
        if self.submitter.is_in_flight(kind) || self.mutations.is_running(kind) {
            self.set_status(format!("{kind} is already pending"));
            return;
        }
        let results = self.mutation_tx.clone();
        let fut = run(connection);
        let task = tokio::spawn(async move {
            let result = fut.await;
            let _ = results.send((kind, result));
        });
        if !self.mutations.track(kind, task.abort_handle()) {
            task.abort();
        }
    }

    fn ingest_mutation_result(&mut self, (kind, result): MutationResult) {
        match result {
            Ok(MutationOutcome::Confirmed(hash)) => {
                self.mutations.finish(kind);
                self.set_status(format!("{kind} confirmed ({})", hash_preview(&hash.to_string())));
            }
            Ok(MutationOutcome::AlreadyInFlight) => self.mutations.finish(kind),
            Err(MutationError::Stale) => self.mutations.finish(kind),
            Err(err) => {
                self.mutations.finish(kind);
                self.push_errors(vec![format!("{kind} failed: {err}")]);
            }
        }
    }

    fn ingest_sync_event(&mut self, event: SyncWorkerEvent) {
        match event {
            SyncWorkerEvent::Connected {
                session,
                contract_resolved,
            } => {
                info!(chain_id = session.chain_id, contract_resolved, "sync worker connected");
            }
            SyncWorkerEvent::Disconnected => self.refreshing = false,
            SyncWorkerEvent::RefreshStarted { .. } => self.refreshing = true,
            SyncWorkerEvent::RefreshFinished { result, .. } => {
                self.refreshing = false;
                match result {
                    Ok(()) | Err(FetchError::Stale) => {}
                    Err(err) => self.push_errors(vec![format!("Refresh failed: {err}")]),
                }
            }
            SyncWorkerEvent::SubscriptionFailed(err) => {
                self.push_errors(vec![format!("Event subscription failed: {err}")]);
            }
        }
    }

    fn build_snapshot(&self, teams: Arc<TeamSnapshot>) -> AppSnapshot {
        let network = self
            .config
            .networks
            .get(self.network)
            .map(|n| n.name.clone())
            .unwrap_or_default();
        let connection = ConnectionView {
            connected: self.connection.is_some(),
            account: self.connection.as_ref().map(|c| c.client.account()),
            chain_id: self.connection.as_ref().map(|c| c.chain_id()),
            network,
            contract: self
                .connection
                .as_ref()
                .and_then(|c| c.client.contract_address()),
        };
        let symbol = self
            .connection
            .as_ref()
            .map(|c| c.client.native_symbol().to_string())
            .unwrap_or_else(|| "ETH".to_string());
        AppSnapshot {
            connection,
            teams,
            refreshing: self.refreshing,
            register_phase: self.submitter.phase(MutationKind::RegisterTeam),
            guess_phase: self.submitter.phase(MutationKind::MakeGuess),
            deposit: format!("{} {symbol}", format_native(self.submitter.deposit(), 2)),
            status: self.status.clone(),
            errors: self.errors.clone(),
        }
    }

    fn set_status(&mut self, message: impl Into<String>) {
        self.status = message.into();
        info!(status = %self.status);
    }

    fn push_errors(&mut self, mut items: Vec<String>) {
        if items.is_empty() {
            return;
        }
        for item in &items {
            error!("{}", item);
        }
        self.errors.append(&mut items);
        if self.errors.len() > MAX_ERRORS {
            let drain = self.errors.len() - MAX_ERRORS;
            self.errors.drain(0..drain);
        }
    }
}

fn hash_preview(hash: &str) -> String {
    if hash.len() <= 14 {
        return hash.to_string();
    }
    format!("{}…{}", &hash[..8], &hash[hash.len() - 4..])
}

pub async fn run_app(app: AppConfig) -> Result<()> {
    let signer = wallets::unlock_wallet(&app.wallet)?;
    let (mut controller, sync_events, mutation_results) = AppController::new(app, signer)?;
    info!(wallet = %controller.wallet.name, account = %controller.signer.address(), "wallet unlocked");
    if let Err(err) = controller.connect().await {
        controller.push_errors(vec![format!("{err:#}")]);
    }

    let mut ui_state = ui::UiState::default();
    let mut input_events = ui::input_event_stream();
    ui::terminal_enter(&mut ui_state)?;
    let res = run_loop(
        &mut controller,
        &mut ui_state,
        &mut input_events,
        sync_events,
        mutation_results,
    )
    .await;
    controller.disconnect();
    controller.sync.shutdown();
    ui::terminal_exit()?;
    res
}

async fn run_loop(
    controller: &mut AppController,
    ui_state: &mut ui::UiState,
    input_events: &mut ui::InputEventReceiver,
    mut sync_events: mpsc::UnboundedReceiver<SyncWorkerEvent>,
    mut mutation_results: mpsc::UnboundedReceiver<MutationResult>,
) -> Result<()> {
    let mut snapshots: watch::Receiver<Arc<TeamSnapshot>> = controller.sync.snapshots();
    let mut register_phase = controller.submitter.watch_phase(MutationKind::RegisterTeam);
    let mut guess_phase = controller.submitter.watch_phase(MutationKind::MakeGuess);

    let mut snapshot = controller.build_snapshot(snapshots.borrow().clone());
    ui::draw(ui_state, &snapshot)?;

    loop {
        tokio::select! {
            Some(event) = sync_events.recv() => controller.ingest_sync_event(event),
            Some(result) = mutation_results.recv() => controller.ingest_mutation_result(result),
            Ok(()) = snapshots.changed() => {}
            Ok(()) = register_phase.changed() => {}
            Ok(()) = guess_phase.changed() => {}
            _ = tokio::signal::ctrl_c() => break,
            raw_ev = ui::next_raw_event(input_events) => {
                let event = raw_ev?;
                let Some(ev) = ui::interpret_event(ui_state, &snapshot, event) else {
                    continue;
                };
                match ev {
                    ui::UserEvent::Quit => break,
                    ui::UserEvent::Redraw => {}
                    ui::UserEvent::ToggleConnection => {
                        if controller.is_connected() {
                            controller.disconnect();
                        } else {
                            controller.set_status("Connecting...");
                            ui::draw(ui_state, &controller.build_snapshot(snapshots.borrow().clone()))
                                .wrap_err("draw while connecting failed")?;
                            if let Err(err) = controller.connect().await {
                                warn!("connect failed: {err:#}");
                                controller.push_errors(vec![format!("{err:#}")]);
                            }
                        }
                    }
                    ui::UserEvent::NextNetwork => {
                        if let Err(err) = controller.next_network().await {
                            controller.push_errors(vec![format!("{err:#}")]);
                        }
                    }
                    ui::UserEvent::Refresh => controller.request_refresh(),
                    ui::UserEvent::SubmitRegistration(form) => controller.register_team(form),
                    ui::UserEvent::SubmitGuess(form) => controller.make_guess(form),
                }
            }
        }
        snapshot = controller.build_snapshot(snapshots.borrow_and_update().clone());
        ui::draw(ui_state, &snapshot).wrap_err("draw failed")?;
    }
    Ok(())
}
