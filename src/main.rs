//! Questline bot entry point.
//!
//! Wires the Discord gateway to the activity engine, spawns the periodic
//! background tasks (orphan voice sweep, database keep-alive), and serves
//! the health check endpoint.

use std::sync::Arc;

use chrono::Utc;
use serenity::model::application::Interaction;
use serenity::model::gateway::Ready;
use serenity::model::voice::VoiceState;
use serenity::prelude::*;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use questline::account::AccountLedger;
use questline::activity::{ActivityEngine, ActivityOutcome, MessageEvent};
use questline::commands::CommandHandler;
use questline::config::BotConfig;
use questline::database::Database;
use questline::error::{QuestlineError, Result};
use questline::health::{spawn_health_server, HealthState};
use questline::progress::ProgressStore;
use questline::quests::QuestCatalog;
use questline::rewards::RewardEconomy;
use questline::stats::StatsRecorder;
use questline::voice::VoiceTracker;

/// Shared application state for all handlers.
struct AppState {
    engine: Arc<ActivityEngine>,
    command_handler: Arc<CommandHandler>,
}

/// Main event handler for the bot.
struct QuestlineHandler {
    state: Arc<AppState>,
}

impl QuestlineHandler {
    fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Announce what an event produced. Expired collections and orphan
    /// recoveries never reach this point; they are silent on purpose.
    async fn announce(
        &self,
        ctx: &Context,
        channel_id: serenity::model::id::ChannelId,
        user_id: u64,
        outcome: &ActivityOutcome,
    ) {
        for quest in &outcome.completed_quests {
            let text = format!(
                "{} <@{}> completed **{}**! Claim it with `/quest claim id:{}`.",
                quest.emoji, user_id, quest.name, quest.id
            );
            if let Err(e) = channel_id.say(&ctx.http, text).await {
                tracing::warn!(error = %e, "failed to announce quest completion");
            }
        }

        if let Some(up) = outcome.level_up {
            let text = format!(
                "🎉 <@{}> reached **level {}** (+{} XP)!",
                user_id, up.new_level, up.xp_awarded
            );
            if let Err(e) = channel_id.say(&ctx.http, text).await {
                tracing::warn!(error = %e, "failed to announce level up");
            }
        }
    }
}

#[serenity::async_trait]
impl EventHandler for QuestlineHandler {
    async fn message(&self, ctx: Context, msg: serenity::model::channel::Message) {
        // Ignore bots and DMs
        if msg.author.bot {
            return;
        }
        let Some(guild_id) = msg.guild_id else {
            return;
        };

        let event = MessageEvent {
            user_id: msg.author.id.get(),
            guild_id: guild_id.get(),
            channel_id: msg.channel_id.get(),
            content: msg.content.clone(),
            is_reply: msg.message_reference.is_some(),
        };

        // A single failed event must never stop the event loop.
        match self.state.engine.on_message(&event, Utc::now()).await {
            Ok(outcome) => {
                self.announce(&ctx, msg.channel_id, event.user_id, &outcome)
                    .await;
            }
            Err(e) => {
                tracing::error!(error = %e, message_id = %msg.id, "failed to process message");
            }
        }
    }

    async fn voice_state_update(&self, _ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let Some(guild_id) = new.guild_id else {
            return;
        };
        let user_id = new.user_id.get();
        let before = old.and_then(|state| state.channel_id).map(|c| c.get());
        let after = new.channel_id.map(|c| c.get());

        match self
            .state
            .engine
            .on_voice_state(user_id, guild_id.get(), before, after, Utc::now())
            .await
        {
            Ok(outcome) => {
                // No text channel is tied to a voice event; log instead of
                // announcing.
                if let Some(up) = outcome.level_up {
                    tracing::info!(
                        user_id = user_id,
                        level = up.new_level,
                        "level up from voice activity"
                    );
                }
            }
            Err(e) => {
                tracing::error!(error = %e, user_id = user_id, "failed to process voice state");
            }
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        if let Interaction::Command(command) = interaction {
            if let Err(e) = self
                .state
                .command_handler
                .handle_command(&ctx, &command)
                .await
            {
                tracing::error!(error = %e, "failed to handle slash command");
            }
        }
    }

    async fn ready(&self, ctx: Context, ready: Ready) {
        tracing::info!(user = %ready.user.name, "questline bot connected");

        // Register slash commands globally
        let commands = CommandHandler::register_commands();
        if let Err(e) = serenity::all::Command::set_global_commands(&ctx.http, commands).await {
            tracing::error!(error = %e, "failed to register slash commands");
        } else {
            tracing::info!("slash commands registered");
        }

        // Credit voice time accrued while the process was down
        if let Err(e) = self.state.engine.catch_up_voice_sessions(Utc::now()).await {
            tracing::error!(error = %e, "startup voice catch-up failed");
        }
    }

    async fn resume(&self, _ctx: Context, _resumed: serenity::model::event::ResumedEvent) {
        tracing::info!("gateway session resumed");

        if let Err(e) = self.state.engine.catch_up_voice_sessions(Utc::now()).await {
            tracing::error!(error = %e, "reconnect voice catch-up failed");
        }
    }

    async fn shard_stage_update(
        &self,
        _ctx: Context,
        event: serenity::gateway::ShardStageUpdateEvent,
    ) {
        use serenity::gateway::ConnectionStage;
        if event.new == ConnectionStage::Disconnected {
            self.state.engine.on_disconnect();
        }
    }
}

/// Spawn background tasks for periodic operations.
fn spawn_background_tasks(engine: Arc<ActivityEngine>, db: Arc<Database>, config: &BotConfig) {
    // Orphan voice-session sweep
    let sweep_engine = engine.clone();
    let sweep_secs = config.orphan_sweep_secs;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(sweep_secs));
        loop {
            interval.tick().await;
            match sweep_engine.sweep_orphan_sessions(Utc::now()).await {
                Ok(count) => {
                    if count > 0 {
                        tracing::info!(count = count, "recovered orphaned voice sessions");
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "orphan sweep failed");
                }
            }
        }
    });

    // Database keep-alive ping
    let keepalive_secs = config.keepalive_secs;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(keepalive_secs));
        loop {
            interval.tick().await;
            if let Err(e) = db.health_check().await {
                tracing::warn!(error = %e, "keep-alive ping failed");
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    // Initialize tracing; RUST_LOG controls levels, default info.
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("questline bot starting...");

    let config = BotConfig::from_env()?;
    tracing::info!("configuration loaded");

    let db = Arc::new(Database::new(&config.database_path).await?);
    tracing::info!(path = %config.database_path, "database initialized");

    spawn_health_server(config.health_port, HealthState { db: db.clone() });

    // Build core services
    let ledger = Arc::new(AccountLedger::new(db.clone()));
    let stats = Arc::new(StatsRecorder::new(db.clone()));
    let catalog = Arc::new(QuestCatalog::new(db.clone()));
    let progress = Arc::new(ProgressStore::new(db.clone()));
    let rewards = Arc::new(RewardEconomy::new(
        ledger.clone(),
        progress.clone(),
        catalog.clone(),
    ));
    let voice = Arc::new(VoiceTracker::new(db.clone()));

    let engine = Arc::new(ActivityEngine::new(
        ledger.clone(),
        stats.clone(),
        catalog.clone(),
        progress.clone(),
        rewards.clone(),
        voice,
    ));
    tracing::info!("activity engine initialized");

    let command_handler = Arc::new(CommandHandler::new(
        ledger, stats, catalog, progress, rewards,
    ));
    tracing::info!("command handler initialized");

    spawn_background_tasks(engine.clone(), db, &config);
    tracing::info!("background tasks spawned");

    let state = Arc::new(AppState {
        engine,
        command_handler,
    });
    let handler = QuestlineHandler::new(state);

    let intents = GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT
        | GatewayIntents::GUILD_VOICE_STATES;

    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(handler)
        .await
        .map_err(|e| QuestlineError::DiscordApi(Box::new(e)))?;

    tracing::info!("starting Discord client...");

    client
        .start()
        .await
        .map_err(|e| QuestlineError::DiscordApi(Box::new(e)))?;

    Ok(())
}
