//! Nutrix Core
//!
//! Scenario orchestration for the Nutrix bot: one active flow per user,
//! atomic start/step/cancel transitions, and the event router that turns
//! chat adapter events into flow operations.

mod scenarios;

pub use scenarios::{MealPhotoScenario, RegistrationScenario, StatsScenario};

use anyhow::Result;
use async_trait::async_trait;
use nutrix_config::Config;
use nutrix_i18n::Localizer;
use nutrix_ipc::{ChatUser, Envelope, EventBus, MessageKind, Messenger};
use nutrix_storage::{MealRecord, Storage};
use nutrix_vision::{FoodAnalysis, FoodAnalyzer, MockAnalyzer, OpenAiVision};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, Semaphore};
use tracing::{debug, error, info, warn};

const MAX_INBOUND_CONCURRENCY: usize = 8;

/// Closed set of conversation flows the bot can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScenarioKind {
    Registration,
    MealPhoto,
    Stats,
}

impl ScenarioKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScenarioKind::Registration => "registration",
            ScenarioKind::MealPhoto => "meal_photo",
            ScenarioKind::Stats => "stats",
        }
    }
}

impl std::fmt::Display for ScenarioKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live position inside the meal photo flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MealPhotoStep {
    /// Analysis done, waiting for the user to pick a meal category.
    Confirm,
    Completed,
}

/// Flow-specific context payload. The variant always matches the scenario
/// that owns the context, so scenarios never see another flow's fields.
#[derive(Debug, Clone)]
pub enum FlowState {
    Registration {
        profile_id: Option<i64>,
    },
    MealPhoto {
        step: MealPhotoStep,
        photo_path: PathBuf,
        analysis: Option<FoodAnalysis>,
        draft: Option<MealRecord>,
        meal_id: Option<i64>,
    },
    Stats,
}

/// State bag threaded through a flow's start/step/cancel calls. The
/// orchestrator owns it between steps; scenarios take it by value and
/// return the updated version.
#[derive(Debug, Clone)]
pub struct FlowContext {
    pub scenario: ScenarioKind,
    /// Once true the orchestrator drops the flow and routes no further
    /// events to it.
    pub completed: bool,
    pub chat_id: i64,
    pub user: ChatUser,
    /// IETF language tag reported by the channel, e.g. "it" or "en-US".
    pub user_language: Option<String>,
    pub reply_to_message_id: Option<i64>,
    pub state: FlowState,
}

impl FlowContext {
    pub fn registration(chat_id: i64, user: ChatUser) -> Self {
        Self::new(
            ScenarioKind::Registration,
            chat_id,
            user,
            FlowState::Registration { profile_id: None },
        )
    }

    pub fn meal_photo(chat_id: i64, user: ChatUser, photo_path: PathBuf) -> Self {
        Self::new(
            ScenarioKind::MealPhoto,
            chat_id,
            user,
            FlowState::MealPhoto {
                step: MealPhotoStep::Confirm,
                photo_path,
                analysis: None,
                draft: None,
                meal_id: None,
            },
        )
    }

    pub fn stats(chat_id: i64, user: ChatUser) -> Self {
        Self::new(ScenarioKind::Stats, chat_id, user, FlowState::Stats)
    }

    fn new(scenario: ScenarioKind, chat_id: i64, user: ChatUser, state: FlowState) -> Self {
        Self {
            scenario,
            completed: false,
            chat_id,
            user,
            user_language: None,
            reply_to_message_id: None,
            state,
        }
    }

    pub fn with_language(mut self, language: Option<String>) -> Self {
        self.user_language = language;
        self
    }

    pub fn with_reply_to(mut self, message_id: Option<i64>) -> Self {
        self.reply_to_message_id = message_id;
        self
    }

    pub fn locale(&self) -> Option<&str> {
        self.user_language.as_deref()
    }
}

/// One externally supplied event advancing a retained flow.
#[derive(Debug, Clone)]
pub enum UpdateInput {
    Text { text: String },
    Photo { path: PathBuf },
}

/// Failures of orchestrator operations. `UnknownScenario` and
/// `NoActiveFlow` are contract violations the event router answers with a
/// fallback reply; `Scenario` wraps an unexpected collaborator fault
/// passing through to the caller.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("scenario '{0}' is not registered")]
    UnknownScenario(ScenarioKind),
    #[error("no active scenario for user {0}")]
    NoActiveFlow(i64),
    #[error("scenario failed: {0}")]
    Scenario(#[source] anyhow::Error),
}

/// A named multi-turn interaction protocol. Implementations are stateless;
/// everything per-flow lives in the context passed through each call.
#[async_trait]
pub trait Scenario: Send + Sync {
    /// Begin the flow. Must decide `completed`: true means the exchange
    /// finished in one shot and no state is retained.
    async fn start(&self, ctx: FlowContext) -> Result<FlowContext>;

    /// Advance a retained flow with one user event.
    async fn next_step(&self, ctx: FlowContext, input: UpdateInput) -> Result<FlowContext>;

    /// Terminate a retained flow, cleaning up any artifacts it holds.
    /// Expected to confirm by setting `completed`.
    async fn cancel(&self, ctx: FlowContext) -> Result<FlowContext>;
}

/// The orchestrator's record of a user's in-progress flow.
#[derive(Debug, Clone)]
pub struct ActiveFlow {
    pub scenario: ScenarioKind,
    pub context: FlowContext,
}

/// Routes flow operations to registered scenarios and tracks at most one
/// active flow per user. Every mutating operation serializes on a per-user
/// lock held for the whole operation, scenario calls included, so
/// concurrent deliveries for the same user cannot interleave.
pub struct Orchestrator {
    scenarios: HashMap<ScenarioKind, Box<dyn Scenario>>,
    flows: Mutex<HashMap<i64, ActiveFlow>>,
    user_locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl Orchestrator {
    pub fn new() -> Self {
        Self {
            scenarios: HashMap::new(),
            flows: Mutex::new(HashMap::new()),
            user_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Insert a scenario into the registry; a later registration under the
    /// same kind replaces the earlier one. Takes `&mut self`: the registry
    /// is sealed before the orchestrator is shared, so lookups at runtime
    /// need no lock.
    pub fn register_scenario(&mut self, kind: ScenarioKind, scenario: Box<dyn Scenario>) {
        if self.scenarios.insert(kind, scenario).is_some() {
            warn!("Scenario {} registered twice, keeping the newer one", kind);
        } else {
            info!("Registered scenario: {}", kind);
        }
    }

    /// Begin a flow for a user. Any flow already active for that user is
    /// cancelled first so its cleanup runs, then the new scenario starts.
    /// If the scenario completes immediately nothing is retained.
    pub async fn start_scenario(
        &self,
        kind: ScenarioKind,
        user_id: i64,
        context: FlowContext,
    ) -> Result<FlowContext, OrchestratorError> {
        let lock = self.user_lock(user_id).await;
        let _guard = lock.lock_owned().await;

        let Some(scenario) = self.scenarios.get(&kind) else {
            error!("Scenario not found: {}", kind);
            return Err(OrchestratorError::UnknownScenario(kind));
        };

        if let Some(previous) = self.take_flow(user_id).await {
            info!(
                "Superseding active scenario {} for user {}",
                previous.scenario, user_id
            );
            if let Some(old) = self.scenarios.get(&previous.scenario) {
                if let Err(e) = old.cancel(previous.context).await {
                    warn!(
                        "Cancel of superseded scenario {} failed: {}",
                        previous.scenario, e
                    );
                }
            }
        }

        info!("Starting scenario {} for user {}", kind, user_id);
        let mut context = context;
        context.scenario = kind;

        let updated = scenario
            .start(context)
            .await
            .map_err(OrchestratorError::Scenario)?;

        if updated.completed {
            info!("Completed scenario {} for user {}", kind, user_id);
        } else {
            self.flows.lock().await.insert(
                user_id,
                ActiveFlow {
                    scenario: kind,
                    context: updated.clone(),
                },
            );
        }
        Ok(updated)
    }

    /// Feed one event to the user's active flow. On a scenario fault the
    /// stored context stays untouched, so the flow keeps its pre-fault
    /// state and remains active.
    pub async fn process_update(
        &self,
        user_id: i64,
        input: UpdateInput,
    ) -> Result<FlowContext, OrchestratorError> {
        let lock = self.user_lock(user_id).await;
        let _guard = lock.lock_owned().await;

        let Some(active) = self.get_flow(user_id).await else {
            warn!("No active scenario for user {}", user_id);
            return Err(OrchestratorError::NoActiveFlow(user_id));
        };

        let Some(scenario) = self.scenarios.get(&active.scenario) else {
            error!("Active flow references unregistered scenario {}", active.scenario);
            return Err(OrchestratorError::UnknownScenario(active.scenario));
        };

        let updated = scenario
            .next_step(active.context, input)
            .await
            .map_err(OrchestratorError::Scenario)?;

        let mut flows = self.flows.lock().await;
        if updated.completed {
            flows.remove(&user_id);
            info!("Completed scenario {} for user {}", active.scenario, user_id);
        } else {
            flows.insert(
                user_id,
                ActiveFlow {
                    scenario: active.scenario,
                    context: updated.clone(),
                },
            );
        }
        Ok(updated)
    }

    /// Terminate the user's active flow. The record is removed before the
    /// scenario's own cancel runs, so cancellation clears the flow even
    /// when the scenario misbehaves.
    pub async fn cancel_scenario(&self, user_id: i64) -> Result<FlowContext, OrchestratorError> {
        let lock = self.user_lock(user_id).await;
        let _guard = lock.lock_owned().await;

        let Some(active) = self.take_flow(user_id).await else {
            warn!("No active scenario for user {}", user_id);
            return Err(OrchestratorError::NoActiveFlow(user_id));
        };

        let Some(scenario) = self.scenarios.get(&active.scenario) else {
            error!("Active flow references unregistered scenario {}", active.scenario);
            return Err(OrchestratorError::UnknownScenario(active.scenario));
        };

        let final_context = scenario
            .cancel(active.context)
            .await
            .map_err(OrchestratorError::Scenario)?;
        if !final_context.completed {
            warn!(
                "Scenario {} did not confirm cancellation, flow dropped anyway",
                active.scenario
            );
        }
        info!("Cancelled scenario {} for user {}", active.scenario, user_id);
        Ok(final_context)
    }

    /// Pure lookup of the user's active flow, if any.
    pub async fn get_active_scenario(&self, user_id: i64) -> Option<ActiveFlow> {
        self.flows.lock().await.get(&user_id).cloned()
    }

    async fn get_flow(&self, user_id: i64) -> Option<ActiveFlow> {
        self.flows.lock().await.get(&user_id).cloned()
    }

    async fn take_flow(&self, user_id: i64) -> Option<ActiveFlow> {
        self.flows.lock().await.remove(&user_id)
    }

    async fn user_lock(&self, user_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.user_locks.lock().await;
        locks
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Runtime {
    config: Config,
    orchestrator: Arc<Orchestrator>,
    event_bus: EventBus,
    localizer: Arc<Localizer>,
}

impl Runtime {
    pub fn new(config: Config, storage: Storage) -> Result<Self> {
        let data_dir = Self::resolve_data_dir(&config)?;
        let temp_dir = Self::resolve_temp_dir(&config, &data_dir);
        std::fs::create_dir_all(&temp_dir)?;

        let locale_dir = match &config.core.locale_dir {
            Some(dir) => PathBuf::from(dir),
            None => data_dir.join("locales"),
        };
        let localizer = Arc::new(Localizer::load(&locale_dir, &config.core.default_language));

        let event_bus = EventBus::new();
        let storage = Arc::new(Mutex::new(storage));
        let analyzer = Self::build_analyzer(&config);
        let orchestrator = Self::wire_scenarios(
            storage,
            analyzer,
            event_bus.messenger(),
            Arc::clone(&localizer),
            config.stats.default_days,
        );

        Ok(Self {
            config,
            orchestrator: Arc::new(orchestrator),
            event_bus,
            localizer,
        })
    }

    fn build_analyzer(config: &Config) -> Arc<dyn FoodAnalyzer> {
        match &config.vision {
            Some(vision) if vision.mock => {
                info!("Vision analysis in mock mode");
                Arc::new(MockAnalyzer)
            }
            Some(vision) => Arc::new(OpenAiVision::new(
                &vision.api_key,
                &vision.base_url,
                &vision.model,
                vision.timeout_secs,
            )),
            None => {
                warn!("No [vision] section in config, falling back to canned analysis results");
                Arc::new(MockAnalyzer)
            }
        }
    }

    fn wire_scenarios(
        storage: Arc<Mutex<Storage>>,
        analyzer: Arc<dyn FoodAnalyzer>,
        messenger: Messenger,
        localizer: Arc<Localizer>,
        stats_window_days: u32,
    ) -> Orchestrator {
        let mut orchestrator = Orchestrator::new();
        orchestrator.register_scenario(
            ScenarioKind::Registration,
            Box::new(RegistrationScenario::new(
                Arc::clone(&storage),
                messenger.clone(),
                Arc::clone(&localizer),
            )),
        );
        orchestrator.register_scenario(
            ScenarioKind::MealPhoto,
            Box::new(MealPhotoScenario::new(
                analyzer,
                Arc::clone(&storage),
                messenger.clone(),
                Arc::clone(&localizer),
            )),
        );
        orchestrator.register_scenario(
            ScenarioKind::Stats,
            Box::new(StatsScenario::new(
                storage,
                messenger,
                localizer,
                stats_window_days,
            )),
        );
        orchestrator
    }

    pub async fn run(&self) -> Result<()> {
        info!("Nutrix runtime starting...");

        self.start_telegram_adapter()?;

        let mut inbound_rx = self.event_bus.subscribe();
        let orchestrator_for_router = Arc::clone(&self.orchestrator);
        let messenger_for_router = self.event_bus.messenger();
        let localizer_for_router = Arc::clone(&self.localizer);
        let inbound_semaphore = Arc::new(Semaphore::new(MAX_INBOUND_CONCURRENCY));

        tokio::spawn(async move {
            loop {
                match inbound_rx.recv().await {
                    Ok(envelope) => {
                        let orchestrator = Arc::clone(&orchestrator_for_router);
                        let messenger = messenger_for_router.clone();
                        let localizer = Arc::clone(&localizer_for_router);
                        let semaphore = Arc::clone(&inbound_semaphore);
                        let trace_id = envelope.trace_id.clone();

                        tokio::spawn(async move {
                            let _permit = match semaphore.acquire_owned().await {
                                Ok(permit) => permit,
                                Err(err) => {
                                    error!(
                                        "Inbound worker semaphore closed (trace_id={}): {}",
                                        trace_id, err
                                    );
                                    return;
                                }
                            };

                            if let Err(e) = Self::route_envelope(
                                &orchestrator,
                                &messenger,
                                &localizer,
                                envelope,
                            )
                            .await
                            {
                                error!(
                                    "Error processing inbound event (trace_id={}): {}",
                                    trace_id, e
                                );
                            }
                        });
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Event bus closed, stopping event router");
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Event bus lagged by {} messages", n);
                    }
                }
            }
        });

        loop {
            tokio::time::sleep(tokio::time::Duration::from_secs(60)).await;
            info!("Nutrix runtime heartbeat");
        }
    }

    fn start_telegram_adapter(&self) -> Result<()> {
        let Some(telegram_config) = &self.config.telegram else {
            warn!("No [telegram] section in config, chat adapter disabled");
            return Ok(());
        };
        info!("Telegram adapter enabled");

        let data_dir = Self::resolve_data_dir(&self.config)?;
        let temp_dir = Self::resolve_temp_dir(&self.config, &data_dir);
        let config_clone = telegram_config.clone();
        let event_bus = self.event_bus.clone();

        tokio::spawn(async move {
            let outbound_rx = event_bus.outbound_subscribe();
            let adapter = nutrix_telegram::TelegramAdapter::new(
                &config_clone,
                data_dir.clone(),
                temp_dir.clone(),
            )
            .with_event_bus(event_bus);

            let adapter_for_outbound =
                nutrix_telegram::TelegramAdapter::new(&config_clone, data_dir, temp_dir);

            tokio::spawn(async move {
                adapter_for_outbound.run_outbound_handler(outbound_rx).await;
            });

            if let Err(e) = adapter.poll().await {
                error!("Telegram adapter failed: {}", e);
            }
        });
        Ok(())
    }

    /// Map one inbound event to an orchestrator operation. Photos start a
    /// meal logging flow; commands start their scenario or cancel; any
    /// other text feeds the active flow. Contract violations get fallback
    /// replies here, scenario faults bubble up to the caller's log.
    async fn route_envelope(
        orchestrator: &Orchestrator,
        messenger: &Messenger,
        localizer: &Localizer,
        envelope: Envelope,
    ) -> Result<()> {
        let Envelope {
            trace_id,
            kind,
            chat_id,
            message_id,
            sender,
            language,
            ..
        } = envelope;

        let Some(chat_id) = chat_id else {
            debug!("Dropping event without chat id (trace_id={})", trace_id);
            return Ok(());
        };
        let Some(user) = sender else {
            debug!("Dropping event without sender identity (trace_id={})", trace_id);
            return Ok(());
        };
        let user_id = user.id;

        match kind {
            MessageKind::Photo { path, .. } => {
                let context = FlowContext::meal_photo(chat_id, user, path)
                    .with_language(language)
                    .with_reply_to(message_id);
                match orchestrator
                    .start_scenario(ScenarioKind::MealPhoto, user_id, context)
                    .await
                {
                    Ok(_) => {}
                    Err(OrchestratorError::Scenario(e)) => return Err(e),
                    Err(e) => error!("Failed to start meal photo flow: {}", e),
                }
            }
            MessageKind::Message { text, .. } => match command_name(&text).as_deref() {
                Some("start") | Some("help") => {
                    let context = FlowContext::registration(chat_id, user)
                        .with_language(language)
                        .with_reply_to(message_id);
                    match orchestrator
                        .start_scenario(ScenarioKind::Registration, user_id, context)
                        .await
                    {
                        Ok(_) => {}
                        Err(OrchestratorError::Scenario(e)) => return Err(e),
                        Err(e) => error!("Failed to start registration flow: {}", e),
                    }
                }
                Some("stats") => {
                    let context = FlowContext::stats(chat_id, user)
                        .with_language(language)
                        .with_reply_to(message_id);
                    match orchestrator
                        .start_scenario(ScenarioKind::Stats, user_id, context)
                        .await
                    {
                        Ok(_) => {}
                        Err(OrchestratorError::Scenario(e)) => return Err(e),
                        Err(e) => error!("Failed to start stats flow: {}", e),
                    }
                }
                Some("cancel") => match orchestrator.cancel_scenario(user_id).await {
                    Ok(_) => {}
                    Err(OrchestratorError::NoActiveFlow(_)) => {
                        let text = localizer.translate(
                            "Nothing to cancel: no active operation.",
                            language.as_deref(),
                        );
                        messenger.send(chat_id, text, message_id);
                    }
                    Err(OrchestratorError::Scenario(e)) => return Err(e),
                    Err(e) => error!("Failed to cancel flow: {}", e),
                },
                // Unknown commands behave like plain text: the active flow
                // interprets them, or the user gets the photo hint.
                _ => match orchestrator
                    .process_update(user_id, UpdateInput::Text { text })
                    .await
                {
                    Ok(_) => {}
                    Err(OrchestratorError::NoActiveFlow(_)) => {
                        let hint = localizer.translate(
                            "Send me a photo of your food and I'll estimate its calories and nutritional value.",
                            language.as_deref(),
                        );
                        messenger.send(chat_id, hint, message_id);
                    }
                    Err(OrchestratorError::Scenario(e)) => return Err(e),
                    Err(e) => error!("Failed to process update: {}", e),
                },
            },
        }
        Ok(())
    }

    fn resolve_data_dir(config: &Config) -> Result<PathBuf> {
        if let Some(data_dir) = &config.core.data_dir {
            if data_dir == "~" || data_dir.starts_with("~/") {
                let home = dirs::home_dir()
                    .ok_or_else(|| anyhow::anyhow!("Home directory not found"))?;
                if data_dir == "~" {
                    Ok(home)
                } else {
                    Ok(home.join(data_dir.trim_start_matches("~/")))
                }
            } else {
                Ok(PathBuf::from(data_dir))
            }
        } else {
            let home =
                dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Home directory not found"))?;
            Ok(home.join(".nutrix"))
        }
    }

    fn resolve_temp_dir(config: &Config, data_dir: &std::path::Path) -> PathBuf {
        match &config.core.temp_dir {
            Some(dir) => PathBuf::from(dir),
            None => data_dir.join("temp"),
        }
    }
}

/// Extract a bot command from message text: the leading `/word` token with
/// any `@botname` suffix stripped, lowercased. Returns None for plain text.
fn command_name(text: &str) -> Option<String> {
    let first = text.trim().split_whitespace().next()?;
    let name = first.strip_prefix('/')?;
    let name = name.split('@').next().unwrap_or(name);
    if name.is_empty() {
        None
    } else {
        Some(name.to_ascii_lowercase())
    }
}
