//! The three conversation flows: registration, photo meal logging, stats.
//!
//! Scenarios are stateless singletons holding collaborator handles;
//! everything belonging to one conversation lives in the FlowContext they
//! receive and return.

use crate::{FlowContext, FlowState, MealPhotoStep, Scenario, UpdateInput};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use nutrix_i18n::Localizer;
use nutrix_ipc::Messenger;
use nutrix_storage::{MealRecord, MealType, Storage, UserProfile};
use nutrix_vision::FoodAnalyzer;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Best-effort removal of a downloaded photo; the flow outcome never
/// depends on it.
fn remove_temp_photo(path: &Path) {
    if !path.exists() {
        return;
    }
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed temporary photo: {}", path.display()),
        Err(e) => warn!("Failed to remove temporary photo {}: {}", path.display(), e),
    }
}

/// Single-exchange flow: greet a returning user or create the profile for
/// a new one. Completes inside `start`, so nothing is ever retained.
pub struct RegistrationScenario {
    storage: Arc<Mutex<Storage>>,
    messenger: Messenger,
    localizer: Arc<Localizer>,
}

impl RegistrationScenario {
    pub fn new(storage: Arc<Mutex<Storage>>, messenger: Messenger, localizer: Arc<Localizer>) -> Self {
        Self {
            storage,
            messenger,
            localizer,
        }
    }
}

#[async_trait]
impl Scenario for RegistrationScenario {
    async fn start(&self, mut ctx: FlowContext) -> Result<FlowContext> {
        info!("Starting registration for user {}", ctx.user.id);
        let name = ctx.user.display_name();

        let existing = self.storage.lock().await.get_user(ctx.user.id)?;
        if existing.is_some() {
            info!("User {} already registered, welcoming back", ctx.user.id);
            let text = self.localizer.translate_with(
                "Welcome back, %name%! I'm ready to help you track your nutrition.",
                ctx.locale(),
                &[("name", name.as_str())],
            );
            self.messenger.send(ctx.chat_id, text, ctx.reply_to_message_id);
            ctx.completed = true;
            return Ok(ctx);
        }

        let profile = UserProfile::new(
            ctx.user.id,
            ctx.user.username.clone(),
            ctx.user.first_name.clone(),
            ctx.user.last_name.clone(),
        );
        let profile_id = self.storage.lock().await.save_user(&profile)?;
        ctx.state = FlowState::Registration {
            profile_id: Some(profile_id),
        };
        info!("Registered user {} as profile {}", ctx.user.id, profile_id);

        let welcome = [
            self.localizer.translate_with(
                "👋 Welcome, %name%!",
                ctx.locale(),
                &[("name", name.as_str())],
            ),
            String::new(),
            self.localizer.translate(
                "I'm a nutrition tracking bot. Send me a photo of your food and I'll estimate its calories and nutritional value.",
                ctx.locale(),
            ),
            String::new(),
            self.localizer.translate("You can use these commands:", ctx.locale()),
            self.localizer.translate("/stats - View your nutrition statistics", ctx.locale()),
        ]
        .join("\n");
        self.messenger.send(ctx.chat_id, welcome, ctx.reply_to_message_id);

        ctx.completed = true;
        Ok(ctx)
    }

    async fn next_step(&self, mut ctx: FlowContext, _input: UpdateInput) -> Result<FlowContext> {
        // Registration finishes inside start; if an update ever lands here
        // the flow is stale and must not stay alive.
        ctx.completed = true;
        Ok(ctx)
    }

    async fn cancel(&self, mut ctx: FlowContext) -> Result<FlowContext> {
        let text = self.localizer.translate(
            "Registration cancelled. You can start again with the /start command.",
            ctx.locale(),
        );
        self.messenger.send(ctx.chat_id, text, ctx.reply_to_message_id);
        ctx.completed = true;
        Ok(ctx)
    }
}

/// Two-step flow: analyze a food photo, then let the user confirm the meal
/// category before the record is persisted. The downloaded photo is a
/// temporary artifact removed whenever the flow ends.
pub struct MealPhotoScenario {
    analyzer: Arc<dyn FoodAnalyzer>,
    storage: Arc<Mutex<Storage>>,
    messenger: Messenger,
    localizer: Arc<Localizer>,
}

impl MealPhotoScenario {
    pub fn new(
        analyzer: Arc<dyn FoodAnalyzer>,
        storage: Arc<Mutex<Storage>>,
        messenger: Messenger,
        localizer: Arc<Localizer>,
    ) -> Self {
        Self {
            analyzer,
            storage,
            messenger,
            localizer,
        }
    }

    fn send_photo_error(&self, ctx: &FlowContext) {
        let text = self.localizer.translate(
            "Something went wrong while processing your photo. Please try again.",
            ctx.locale(),
        );
        self.messenger.send(ctx.chat_id, text, None);
    }

    /// The food name and macro lines shared by the confirmation prompt and
    /// the saved-meal summary.
    fn macros_block(&self, meal: &MealRecord, locale: Option<&str>) -> String {
        let calories = meal.calories.to_string();
        let proteins = meal.proteins.to_string();
        let fats = meal.fats.to_string();
        let carbs = meal.carbs.to_string();
        self.localizer.translate_with(
            "🍽 *%food%*\n\n🔥 Calories: *%calories% kcal*\n🥩 Proteins: *%proteins% g*\n🧈 Fats: *%fats% g*\n🍚 Carbs: *%carbs% g*",
            locale,
            &[
                ("food", meal.food_name.as_str()),
                ("calories", calories.as_str()),
                ("proteins", proteins.as_str()),
                ("fats", fats.as_str()),
                ("carbs", carbs.as_str()),
            ],
        )
    }

    fn category_menu(&self, locale: Option<&str>) -> String {
        let mut lines = vec![self.localizer.translate("Choose the meal type:", locale)];
        for meal_type in MealType::ALL {
            let mut line = format!(
                "{}. {}",
                meal_type.menu_digit(),
                self.localizer.translate(meal_type.source_name(), locale)
            );
            if meal_type == MealType::default() {
                line.push(' ');
                line.push_str(&self.localizer.translate("(default)", locale));
            }
            lines.push(line);
        }
        lines.join("\n")
    }

    /// Map raw user text to a category: the exact menu digit, else a
    /// case-insensitive match on the localized category name, else the
    /// snack default.
    fn match_meal_type(&self, text: &str, locale: Option<&str>) -> MealType {
        let lowered = text.to_lowercase();
        for meal_type in MealType::ALL {
            if lowered == meal_type.menu_digit().to_string()
                || lowered
                    == self
                        .localizer
                        .translate(meal_type.source_name(), locale)
                        .to_lowercase()
            {
                return meal_type;
            }
        }
        MealType::default()
    }
}

#[async_trait]
impl Scenario for MealPhotoScenario {
    async fn start(&self, mut ctx: FlowContext) -> Result<FlowContext> {
        info!("Starting meal photo flow for user {}", ctx.user.id);

        let photo_path = match &ctx.state {
            FlowState::MealPhoto { photo_path, .. } => photo_path.clone(),
            _ => {
                error!("Meal photo flow started without a photo for user {}", ctx.user.id);
                self.send_photo_error(&ctx);
                ctx.completed = true;
                return Ok(ctx);
            }
        };

        if !photo_path.exists() {
            error!("Photo not found: {}", photo_path.display());
            self.send_photo_error(&ctx);
            ctx.completed = true;
            return Ok(ctx);
        }

        let progress = self.localizer.translate(
            "🔍 Analyzing your food photo... This may take a few seconds.",
            ctx.locale(),
        );
        self.messenger.send(ctx.chat_id, progress, None);
        self.messenger.chat_action(ctx.chat_id, "typing");

        let analysis = match self.analyzer.analyze(&photo_path).await {
            Ok(analysis) => analysis,
            Err(e) => {
                error!("Food analysis failed: {}", e);
                let text = self.localizer.translate_with(
                    "Could not analyze the image: %error%\nPlease try another photo with a clearer view of the food.",
                    ctx.locale(),
                    &[("error", e.to_string().as_str())],
                );
                self.messenger.send(ctx.chat_id, text, None);
                remove_temp_photo(&photo_path);
                ctx.completed = true;
                return Ok(ctx);
            }
        };
        info!(
            "Analyzed photo for user {}: {} ({} kcal)",
            ctx.user.id, analysis.food_name, analysis.calories
        );

        let draft = MealRecord {
            id: None,
            user_id: ctx.user.id,
            timestamp: Utc::now(),
            meal_type: MealType::default(),
            food_name: analysis.food_name.clone(),
            calories: analysis.calories,
            proteins: analysis.proteins,
            fats: analysis.fats,
            carbs: analysis.carbs,
            image_url: None,
        };

        let prompt = [
            self.localizer.translate("✅ Analysis results:", ctx.locale()),
            String::new(),
            self.macros_block(&draft, ctx.locale()),
            String::new(),
            self.category_menu(ctx.locale()),
            String::new(),
            self.localizer.translate(
                "Send the number or the name of the meal type.",
                ctx.locale(),
            ),
        ]
        .join("\n");
        self.messenger.send(ctx.chat_id, prompt, None);

        ctx.state = FlowState::MealPhoto {
            step: MealPhotoStep::Confirm,
            photo_path,
            analysis: Some(analysis),
            draft: Some(draft),
            meal_id: None,
        };
        Ok(ctx)
    }

    async fn next_step(&self, mut ctx: FlowContext, input: UpdateInput) -> Result<FlowContext> {
        let (step, photo_path, analysis, draft) = match &ctx.state {
            FlowState::MealPhoto {
                step,
                photo_path,
                analysis,
                draft,
                ..
            } => (*step, photo_path.clone(), analysis.clone(), draft.clone()),
            _ => {
                error!("Meal photo update without meal photo state for user {}", ctx.user.id);
                ctx.completed = true;
                return Ok(ctx);
            }
        };

        if step != MealPhotoStep::Confirm {
            return Ok(ctx);
        }

        let UpdateInput::Text { text } = input else {
            let reprompt = self.localizer.translate(
                "Please choose the meal type by sending a number from 1 to 4.",
                ctx.locale(),
            );
            self.messenger.send(ctx.chat_id, reprompt, None);
            return Ok(ctx);
        };

        let Some(mut meal) = draft else {
            error!("Meal draft missing in confirm step for user {}", ctx.user.id);
            self.send_photo_error(&ctx);
            remove_temp_photo(&photo_path);
            ctx.completed = true;
            return Ok(ctx);
        };

        meal.meal_type = self.match_meal_type(text.trim(), ctx.locale());
        let meal_id = self.storage.lock().await.save_meal(&meal)?;
        info!(
            "Saved meal {} for user {}: {} as {}",
            meal_id, ctx.user.id, meal.food_name, meal.meal_type.as_str()
        );
        remove_temp_photo(&photo_path);

        let type_name = self
            .localizer
            .translate(meal.meal_type.source_name(), ctx.locale());
        let confirmation = [
            self.localizer.translate_with(
                "✅ %meal_type% logged!",
                ctx.locale(),
                &[("meal_type", type_name.as_str())],
            ),
            String::new(),
            self.macros_block(&meal, ctx.locale()),
            String::new(),
            self.localizer.translate("Send me another food photo to analyze.", ctx.locale()),
        ]
        .join("\n");
        self.messenger.send(ctx.chat_id, confirmation, None);

        ctx.state = FlowState::MealPhoto {
            step: MealPhotoStep::Completed,
            photo_path,
            analysis,
            draft: Some(meal),
            meal_id: Some(meal_id),
        };
        ctx.completed = true;
        Ok(ctx)
    }

    async fn cancel(&self, mut ctx: FlowContext) -> Result<FlowContext> {
        let text = self
            .localizer
            .translate("❌ Meal logging cancelled.", ctx.locale());
        self.messenger.send(ctx.chat_id, text, None);

        if let FlowState::MealPhoto { photo_path, .. } = &ctx.state {
            remove_temp_photo(photo_path);
        }

        info!("Meal photo flow cancelled for user {}", ctx.user.id);
        ctx.completed = true;
        Ok(ctx)
    }
}

/// Statistics flow. The aggregates are computed, but the reply is still
/// the placeholder while the formatted view is under construction; like
/// registration it completes in a single exchange.
pub struct StatsScenario {
    storage: Arc<Mutex<Storage>>,
    messenger: Messenger,
    localizer: Arc<Localizer>,
    window_days: u32,
}

impl StatsScenario {
    pub fn new(
        storage: Arc<Mutex<Storage>>,
        messenger: Messenger,
        localizer: Arc<Localizer>,
        window_days: u32,
    ) -> Self {
        Self {
            storage,
            messenger,
            localizer,
            window_days,
        }
    }
}

#[async_trait]
impl Scenario for StatsScenario {
    async fn start(&self, mut ctx: FlowContext) -> Result<FlowContext> {
        info!("Starting stats flow for user {}", ctx.user.id);

        let stats = self
            .storage
            .lock()
            .await
            .get_user_stats(ctx.user.id, self.window_days)?;
        // TODO: format these aggregates into the reply once the stats view ships.
        debug!(
            "Stats for user {}: {} meals over {} days, {} kcal total",
            ctx.user.id, stats.meals_count, stats.days, stats.total.calories
        );

        let text = self.localizer.translate(
            "📊 Statistics are temporarily unavailable.\n\nA future version will show your nutrition summary here.",
            ctx.locale(),
        );
        self.messenger.send(ctx.chat_id, text, ctx.reply_to_message_id);

        ctx.completed = true;
        Ok(ctx)
    }

    async fn next_step(&self, mut ctx: FlowContext, _input: UpdateInput) -> Result<FlowContext> {
        ctx.completed = true;
        Ok(ctx)
    }

    async fn cancel(&self, mut ctx: FlowContext) -> Result<FlowContext> {
        let text = self
            .localizer
            .translate("Stats view cancelled.", ctx.locale());
        self.messenger.send(ctx.chat_id, text, ctx.reply_to_message_id);
        ctx.completed = true;
        Ok(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nutrix_ipc::{ChatUser, EventBus, OutboundMessage};
    use nutrix_vision::{AnalysisError, FoodAnalysis, MockAnalyzer};
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::broadcast;

    static DIR_COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "nutrix-scenarios-test-{}-{}",
            std::process::id(),
            DIR_COUNTER.fetch_add(1, Ordering::SeqCst)
        ));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    fn chat_user(id: i64) -> ChatUser {
        ChatUser {
            id,
            username: Some("anna_b".to_string()),
            first_name: Some("Anna".to_string()),
            last_name: None,
        }
    }

    fn test_localizer() -> Arc<Localizer> {
        let mut it = HashMap::new();
        it.insert("Breakfast".to_string(), "Colazione".to_string());
        it.insert("Lunch".to_string(), "Pranzo".to_string());
        it.insert("Dinner".to_string(), "Cena".to_string());
        it.insert("Snack".to_string(), "Spuntino".to_string());
        it.insert(
            "✅ %meal_type% logged!".to_string(),
            "✅ %meal_type% registrato!".to_string(),
        );
        let mut locales = HashMap::new();
        locales.insert("it".to_string(), it);
        Arc::new(Localizer::with_locales(locales, "en"))
    }

    fn drain(rx: &mut broadcast::Receiver<OutboundMessage>) -> Vec<OutboundMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn texts(messages: &[OutboundMessage]) -> Vec<String> {
        messages
            .iter()
            .filter(|m| m.chat_action.is_none())
            .map(|m| m.text.clone())
            .collect()
    }

    struct Rig {
        storage: Arc<Mutex<Storage>>,
        messenger: Messenger,
        localizer: Arc<Localizer>,
        outbound: broadcast::Receiver<OutboundMessage>,
        dir: PathBuf,
    }

    fn rig() -> Rig {
        let dir = temp_dir();
        let storage = Arc::new(Mutex::new(
            Storage::new(dir.join("test.db")).expect("open storage"),
        ));
        let bus = EventBus::new();
        let outbound = bus.outbound_subscribe();
        let messenger = bus.messenger();
        Rig {
            storage,
            messenger,
            localizer: test_localizer(),
            outbound,
            dir,
        }
    }

    fn registration(rig: &Rig) -> RegistrationScenario {
        RegistrationScenario::new(
            Arc::clone(&rig.storage),
            rig.messenger.clone(),
            Arc::clone(&rig.localizer),
        )
    }

    fn meal_photo(rig: &Rig) -> MealPhotoScenario {
        MealPhotoScenario::new(
            Arc::new(MockAnalyzer),
            Arc::clone(&rig.storage),
            rig.messenger.clone(),
            Arc::clone(&rig.localizer),
        )
    }

    fn stats(rig: &Rig) -> StatsScenario {
        StatsScenario::new(
            Arc::clone(&rig.storage),
            rig.messenger.clone(),
            Arc::clone(&rig.localizer),
            7,
        )
    }

    fn write_photo(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, b"jpeg bytes").expect("write photo");
        path
    }

    struct FailingAnalyzer;

    #[async_trait]
    impl FoodAnalyzer for FailingAnalyzer {
        async fn analyze(&self, _image_path: &Path) -> Result<FoodAnalysis, AnalysisError> {
            Err(AnalysisError::MalformedResponse)
        }
    }

    #[tokio::test]
    async fn registration_creates_profile_and_welcomes() {
        let mut rig = rig();
        let scenario = registration(&rig);

        let ctx = FlowContext::registration(100, chat_user(42)).with_reply_to(Some(5));
        let result = scenario.start(ctx).await.expect("start");

        assert!(result.completed);
        match result.state {
            FlowState::Registration { profile_id } => assert!(profile_id.is_some()),
            other => panic!("unexpected state: {:?}", other),
        }

        let profile = rig
            .storage
            .lock()
            .await
            .get_user(42)
            .expect("query")
            .expect("profile");
        assert_eq!(profile.first_name.as_deref(), Some("Anna"));

        let messages = drain(&mut rig.outbound);
        assert_eq!(messages.len(), 1);
        assert!(messages[0].text.contains("👋 Welcome, Anna!"));
        assert!(messages[0].text.contains("/stats"));
        assert_eq!(messages[0].reply_to, Some(5));
    }

    #[tokio::test]
    async fn registration_welcomes_back_without_second_profile() {
        let mut rig = rig();
        let scenario = registration(&rig);

        let first = scenario
            .start(FlowContext::registration(100, chat_user(42)))
            .await
            .expect("first start");
        let first_id = match first.state {
            FlowState::Registration { profile_id } => profile_id,
            other => panic!("unexpected state: {:?}", other),
        };
        drain(&mut rig.outbound);

        let second = scenario
            .start(FlowContext::registration(100, chat_user(42)))
            .await
            .expect("second start");
        assert!(second.completed);

        let stored = rig
            .storage
            .lock()
            .await
            .get_user(42)
            .expect("query")
            .expect("profile");
        assert_eq!(stored.id, first_id);

        let messages = texts(&drain(&mut rig.outbound));
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("Welcome back, Anna!"));
    }

    #[tokio::test]
    async fn registration_next_step_forces_completion() {
        let rig = rig();
        let scenario = registration(&rig);

        let mut ctx = FlowContext::registration(100, chat_user(42));
        ctx.completed = false;
        let result = scenario
            .next_step(
                ctx,
                UpdateInput::Text {
                    text: "hello".to_string(),
                },
            )
            .await
            .expect("next_step");
        assert!(result.completed);
    }

    #[tokio::test]
    async fn registration_cancel_notifies_user() {
        let mut rig = rig();
        let scenario = registration(&rig);

        let result = scenario
            .cancel(FlowContext::registration(100, chat_user(42)))
            .await
            .expect("cancel");
        assert!(result.completed);

        let messages = texts(&drain(&mut rig.outbound));
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("/start"));
    }

    #[tokio::test]
    async fn meal_photo_missing_file_completes_with_error() {
        let mut rig = rig();
        let scenario = meal_photo(&rig);

        let ctx = FlowContext::meal_photo(200, chat_user(7), rig.dir.join("absent.jpg"));
        let result = scenario.start(ctx).await.expect("start");

        assert!(result.completed);
        let messages = texts(&drain(&mut rig.outbound));
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("went wrong"));

        let meals = rig
            .storage
            .lock()
            .await
            .get_meals(7, None, None)
            .expect("query meals");
        assert!(meals.is_empty());
    }

    #[tokio::test]
    async fn meal_photo_start_prompts_with_category_menu() {
        let mut rig = rig();
        let scenario = meal_photo(&rig);
        let photo = write_photo(&rig.dir, "pizza_4stagioni.jpg");

        let result = scenario
            .start(FlowContext::meal_photo(200, chat_user(7), photo))
            .await
            .expect("start");

        assert!(!result.completed);
        match &result.state {
            FlowState::MealPhoto {
                step,
                analysis,
                draft,
                meal_id,
                ..
            } => {
                assert_eq!(*step, MealPhotoStep::Confirm);
                assert_eq!(
                    analysis.as_ref().map(|a| a.food_name.as_str()),
                    Some("Pizza")
                );
                assert_eq!(draft.as_ref().map(|d| d.meal_type), Some(MealType::Snack));
                assert!(meal_id.is_none());
            }
            other => panic!("unexpected state: {:?}", other),
        }

        let messages = drain(&mut rig.outbound);
        let typing: Vec<_> = messages
            .iter()
            .filter(|m| m.chat_action.as_deref() == Some("typing"))
            .collect();
        assert_eq!(typing.len(), 1);

        let prompt_texts = texts(&messages);
        assert_eq!(prompt_texts.len(), 2);
        assert!(prompt_texts[0].contains("Analyzing your food photo"));
        assert!(prompt_texts[1].contains("*Pizza*"));
        assert!(prompt_texts[1].contains("🔥 Calories: *285 kcal*"));
        assert!(prompt_texts[1].contains("1. Breakfast"));
        assert!(prompt_texts[1].contains("4. Snack (default)"));
    }

    #[tokio::test]
    async fn meal_photo_digit_selects_category() {
        let mut rig = rig();
        let scenario = meal_photo(&rig);
        let photo = write_photo(&rig.dir, "pizza_slice.jpg");

        let started = scenario
            .start(FlowContext::meal_photo(200, chat_user(7), photo.clone()))
            .await
            .expect("start");
        drain(&mut rig.outbound);

        let result = scenario
            .next_step(
                started,
                UpdateInput::Text {
                    text: "1".to_string(),
                },
            )
            .await
            .expect("confirm");

        assert!(result.completed);
        match &result.state {
            FlowState::MealPhoto { step, meal_id, .. } => {
                assert_eq!(*step, MealPhotoStep::Completed);
                assert!(meal_id.is_some());
            }
            other => panic!("unexpected state: {:?}", other),
        }
        assert!(!photo.exists());

        let meals = rig
            .storage
            .lock()
            .await
            .get_meals(7, None, None)
            .expect("query meals");
        assert_eq!(meals.len(), 1);
        assert_eq!(meals[0].meal_type, MealType::Breakfast);

        let messages = texts(&drain(&mut rig.outbound));
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("✅ Breakfast logged!"));
        assert!(messages[0].contains("another food photo"));
    }

    #[tokio::test]
    async fn meal_photo_localized_name_selects_category() {
        let mut rig = rig();
        let scenario = meal_photo(&rig);
        let photo = write_photo(&rig.dir, "pizza_margherita.jpg");

        let started = scenario
            .start(
                FlowContext::meal_photo(200, chat_user(7), photo)
                    .with_language(Some("it".to_string())),
            )
            .await
            .expect("start");
        drain(&mut rig.outbound);

        let result = scenario
            .next_step(
                started,
                UpdateInput::Text {
                    text: "pranzo".to_string(),
                },
            )
            .await
            .expect("confirm");
        assert!(result.completed);

        let meals = rig
            .storage
            .lock()
            .await
            .get_meals(7, None, None)
            .expect("query meals");
        assert_eq!(meals.len(), 1);
        assert_eq!(meals[0].meal_type, MealType::Lunch);

        let messages = texts(&drain(&mut rig.outbound));
        assert!(messages[0].contains("✅ Pranzo registrato!"));
    }

    #[tokio::test]
    async fn meal_photo_unrecognized_text_defaults_to_snack() {
        let mut rig = rig();
        let scenario = meal_photo(&rig);
        let photo = write_photo(&rig.dir, "burger_menu.jpg");

        let started = scenario
            .start(FlowContext::meal_photo(200, chat_user(7), photo))
            .await
            .expect("start");
        drain(&mut rig.outbound);

        let result = scenario
            .next_step(
                started,
                UpdateInput::Text {
                    text: "xyz".to_string(),
                },
            )
            .await
            .expect("confirm");
        assert!(result.completed);

        let meals = rig
            .storage
            .lock()
            .await
            .get_meals(7, None, None)
            .expect("query meals");
        assert_eq!(meals[0].meal_type, MealType::Snack);
    }

    #[tokio::test]
    async fn meal_photo_non_text_input_reprompts() {
        let mut rig = rig();
        let scenario = meal_photo(&rig);
        let photo = write_photo(&rig.dir, "salad_caprese.jpg");

        let started = scenario
            .start(FlowContext::meal_photo(200, chat_user(7), photo.clone()))
            .await
            .expect("start");
        drain(&mut rig.outbound);

        let result = scenario
            .next_step(
                started,
                UpdateInput::Photo {
                    path: rig.dir.join("another.jpg"),
                },
            )
            .await
            .expect("next_step");

        assert!(!result.completed);
        assert!(photo.exists());

        let messages = texts(&drain(&mut rig.outbound));
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("number from 1 to 4"));

        let meals = rig
            .storage
            .lock()
            .await
            .get_meals(7, None, None)
            .expect("query meals");
        assert!(meals.is_empty());
    }

    #[tokio::test]
    async fn meal_photo_analysis_failure_completes_and_cleans_up() {
        let mut rig = rig();
        let scenario = MealPhotoScenario::new(
            Arc::new(FailingAnalyzer),
            Arc::clone(&rig.storage),
            rig.messenger.clone(),
            Arc::clone(&rig.localizer),
        );
        let photo = write_photo(&rig.dir, "blurry.jpg");

        let result = scenario
            .start(FlowContext::meal_photo(200, chat_user(7), photo.clone()))
            .await
            .expect("start");

        assert!(result.completed);
        assert!(!photo.exists());

        let messages = texts(&drain(&mut rig.outbound));
        assert_eq!(messages.len(), 2);
        assert!(messages[1].contains("Could not analyze the image"));
        assert!(messages[1].contains("Failed to parse analysis results"));
    }

    #[tokio::test]
    async fn meal_photo_cancel_removes_temp_photo() {
        let mut rig = rig();
        let scenario = meal_photo(&rig);
        let photo = write_photo(&rig.dir, "salad_nicoise.jpg");

        let started = scenario
            .start(FlowContext::meal_photo(200, chat_user(7), photo.clone()))
            .await
            .expect("start");
        drain(&mut rig.outbound);

        let result = scenario.cancel(started).await.expect("cancel");
        assert!(result.completed);
        assert!(!photo.exists());

        let messages = texts(&drain(&mut rig.outbound));
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("cancelled"));
    }

    #[test]
    fn meal_type_matching_rules() {
        let rig = rig();
        let scenario = meal_photo(&rig);

        assert_eq!(scenario.match_meal_type("1", None), MealType::Breakfast);
        assert_eq!(scenario.match_meal_type("2", None), MealType::Lunch);
        assert_eq!(scenario.match_meal_type("3", None), MealType::Dinner);
        assert_eq!(scenario.match_meal_type("4", None), MealType::Snack);
        assert_eq!(scenario.match_meal_type("DINNER", None), MealType::Dinner);
        assert_eq!(scenario.match_meal_type("breakfast", None), MealType::Breakfast);
        assert_eq!(
            scenario.match_meal_type("Pranzo", Some("it")),
            MealType::Lunch
        );
        assert_eq!(
            scenario.match_meal_type("colazione", Some("it")),
            MealType::Breakfast
        );
        assert_eq!(scenario.match_meal_type("5", None), MealType::Snack);
        assert_eq!(scenario.match_meal_type("xyz", None), MealType::Snack);
        assert_eq!(scenario.match_meal_type("", None), MealType::Snack);
    }

    #[tokio::test]
    async fn stats_placeholder_completes_immediately() {
        let mut rig = rig();
        let scenario = stats(&rig);

        let result = scenario
            .start(FlowContext::stats(300, chat_user(9)).with_reply_to(Some(11)))
            .await
            .expect("start");

        assert!(result.completed);
        let messages = drain(&mut rig.outbound);
        assert_eq!(messages.len(), 1);
        assert!(messages[0].text.contains("📊"));
        assert_eq!(messages[0].reply_to, Some(11));
    }

    #[tokio::test]
    async fn stats_cancel_notifies_user() {
        let mut rig = rig();
        let scenario = stats(&rig);

        let result = scenario
            .cancel(FlowContext::stats(300, chat_user(9)))
            .await
            .expect("cancel");
        assert!(result.completed);

        let messages = texts(&drain(&mut rig.outbound));
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("cancelled"));
    }
}
