//! Slash command handler for the questline bot.
//!
//! `/quest` for the claim/autoclaim/progress surface, `/rank` for the
//! member's own progression, `/leaderboard` for the guild top list. All
//! progression rules live in the engine modules; this layer only
//! translates outcomes into replies.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serenity::all::{
    CommandDataOption, CommandDataOptionValue, CommandInteraction, CommandOptionType, Context,
    CreateCommand, CreateCommandOption, CreateInteractionResponse,
    CreateInteractionResponseMessage, Permissions,
};

use crate::account::AccountLedger;
use crate::error::{QuestlineError, Result};
use crate::levels::requirement_for;
use crate::progress::{build_snapshot, ProgressStore};
use crate::quests::QuestCatalog;
use crate::rewards::{ClaimOutcome, RewardEconomy};
use crate::stats::{day_key, week_start_key, StatsRecorder};

/// Slash command handler.
pub struct CommandHandler {
    ledger: Arc<AccountLedger>,
    stats: Arc<StatsRecorder>,
    catalog: Arc<QuestCatalog>,
    progress: Arc<ProgressStore>,
    rewards: Arc<RewardEconomy>,
}

impl CommandHandler {
    /// Create a new command handler.
    pub fn new(
        ledger: Arc<AccountLedger>,
        stats: Arc<StatsRecorder>,
        catalog: Arc<QuestCatalog>,
        progress: Arc<ProgressStore>,
        rewards: Arc<RewardEconomy>,
    ) -> Self {
        Self {
            ledger,
            stats,
            catalog,
            progress,
            rewards,
        }
    }

    /// Register all slash commands with Discord.
    pub fn register_commands() -> Vec<CreateCommand> {
        vec![
            Self::create_quest_command(),
            CreateCommand::new("rank").description("Show your level, XP, and progress"),
            CreateCommand::new("leaderboard").description("Show the guild's top members by XP"),
        ]
    }

    fn create_quest_command() -> CreateCommand {
        CreateCommand::new("quest")
            .description("Quest progress and rewards")
            .add_option(CreateCommandOption::new(
                CommandOptionType::SubCommand,
                "list",
                "List quests and their status",
            ))
            .add_option(
                CreateCommandOption::new(
                    CommandOptionType::SubCommand,
                    "claim",
                    "Claim a completed quest at full value",
                )
                .add_sub_option(
                    CreateCommandOption::new(CommandOptionType::String, "id", "Quest id")
                        .required(true),
                ),
            )
            .add_option(CreateCommandOption::new(
                CommandOptionType::SubCommand,
                "claimall",
                "Claim every completed quest at the 85% bulk rate",
            ))
            .add_option(
                CreateCommandOption::new(
                    CommandOptionType::SubCommand,
                    "autoclaim",
                    "Toggle automatic claiming at the 70% rate",
                )
                .add_sub_option(
                    CreateCommandOption::new(CommandOptionType::Boolean, "enabled", "On or off")
                        .required(true),
                ),
            )
            .add_option(
                CreateCommandOption::new(
                    CommandOptionType::SubCommand,
                    "progress",
                    "Show your progress toward one quest",
                )
                .add_sub_option(
                    CreateCommandOption::new(CommandOptionType::String, "id", "Quest id")
                        .required(true),
                ),
            )
            .add_option(
                CreateCommandOption::new(
                    CommandOptionType::SubCommand,
                    "create",
                    "Create a custom quest for this guild (admin)",
                )
                .add_sub_option(
                    CreateCommandOption::new(CommandOptionType::String, "name", "Quest name")
                        .required(true),
                )
                .add_sub_option(
                    CreateCommandOption::new(
                        CommandOptionType::String,
                        "requirements",
                        "JSON map of stat thresholds, e.g. {\"daily_messages\": 30}",
                    )
                    .required(true),
                )
                .add_sub_option(
                    CreateCommandOption::new(CommandOptionType::Integer, "xp", "XP reward")
                        .required(true),
                )
                .add_sub_option(CreateCommandOption::new(
                    CommandOptionType::String,
                    "emoji",
                    "Display emoji",
                )),
            )
            .add_option(
                CreateCommandOption::new(
                    CommandOptionType::SubCommand,
                    "toggle",
                    "Enable or disable a custom quest (admin)",
                )
                .add_sub_option(
                    CreateCommandOption::new(CommandOptionType::String, "id", "Quest id")
                        .required(true),
                )
                .add_sub_option(
                    CreateCommandOption::new(CommandOptionType::Boolean, "enabled", "On or off")
                        .required(true),
                ),
            )
    }

    /// Handle an incoming slash command interaction.
    pub async fn handle_command(&self, ctx: &Context, command: &CommandInteraction) -> Result<()> {
        let Some(guild_id) = command.guild_id.map(|g| g.get()) else {
            return self
                .respond(ctx, command, "Commands only work inside a server.")
                .await;
        };
        let user_id = command.user.id.get();

        let reply = match command.data.name.as_str() {
            "rank" => self.handle_rank(user_id, guild_id).await,
            "leaderboard" => self.handle_leaderboard(guild_id).await,
            "quest" => {
                let subcommand = command.data.options.first();
                let name = subcommand.map(|o| o.name.as_str()).unwrap_or("list");
                let options = subcommand.map(sub_options).unwrap_or_default();

                match name {
                    "list" => self.handle_list(user_id, guild_id).await,
                    "claim" => self.handle_claim(user_id, guild_id, &options).await,
                    "claimall" => self.handle_claim_all(user_id, guild_id).await,
                    "autoclaim" => self.handle_autoclaim(user_id, guild_id, &options).await,
                    "progress" => self.handle_progress(user_id, guild_id, &options).await,
                    "create" => {
                        if !is_admin(command) {
                            Ok("You need administrator permission for that.".to_string())
                        } else {
                            self.handle_create(guild_id, &options).await
                        }
                    }
                    "toggle" => {
                        if !is_admin(command) {
                            Ok("You need administrator permission for that.".to_string())
                        } else {
                            self.handle_toggle(guild_id, &options).await
                        }
                    }
                    _ => Ok("Unknown subcommand.".to_string()),
                }
            }
            _ => Ok("Unknown command.".to_string()),
        };

        match reply {
            Ok(text) => self.respond(ctx, command, &text).await,
            Err(e) => {
                tracing::error!(error = %e, command = %command.data.name, "command failed");
                self.respond(ctx, command, e.user_message()).await
            }
        }
    }

    async fn handle_claim(
        &self,
        user_id: u64,
        guild_id: u64,
        options: &[CommandDataOption],
    ) -> Result<String> {
        let quest_id = required_string(options, "id")?;
        let outcome = self
            .rewards
            .claim(user_id, guild_id, &quest_id, Utc::now())
            .await?;
        Ok(claim_reply(&outcome))
    }

    async fn handle_claim_all(&self, user_id: u64, guild_id: u64) -> Result<String> {
        let claimed = self.rewards.claim_all(user_id, guild_id, Utc::now()).await?;
        if claimed.is_empty() {
            return Ok("Nothing to claim right now.".to_string());
        }

        let total: i64 = claimed.iter().map(|(_, credited)| credited).sum();
        let names: Vec<String> = claimed
            .iter()
            .map(|(q, credited)| format!("{} {} (+{} XP)", q.emoji, q.name, credited))
            .collect();
        Ok(format!(
            "Claimed {} quests at the bulk rate for **{} XP**:\n{}",
            claimed.len(),
            total,
            names.join("\n")
        ))
    }

    async fn handle_autoclaim(
        &self,
        user_id: u64,
        guild_id: u64,
        options: &[CommandDataOption],
    ) -> Result<String> {
        let enabled = required_bool(options, "enabled")?;
        self.rewards.set_autoclaim(user_id, guild_id, enabled).await?;
        Ok(if enabled {
            "Autoclaim enabled: completed quests are collected automatically at 70% value."
                .to_string()
        } else {
            "Autoclaim disabled: claim quests yourself for full value.".to_string()
        })
    }

    async fn handle_progress(
        &self,
        user_id: u64,
        guild_id: u64,
        options: &[CommandDataOption],
    ) -> Result<String> {
        let quest_id = required_string(options, "id")?;
        let Some(quest) = self.catalog.find(guild_id, &quest_id).await? else {
            return Ok("No quest with that id exists here.".to_string());
        };

        if let Some(p) = self.progress.get(user_id, guild_id, &quest_id).await? {
            if p.claimed {
                return Ok(format!("{} **{}** — already claimed.", quest.emoji, quest.name));
            }
            if p.completed {
                return Ok(format!(
                    "{} **{}** — completed! Claim it with `/quest claim id:{}`.",
                    quest.emoji, quest.name, quest.id
                ));
            }
        }

        let snapshot = self.snapshot_for(user_id, guild_id).await?;
        let lines: Vec<String> = quest
            .requirements
            .iter()
            .map(|(key, threshold)| {
                let current = snapshot.get(key).copied().unwrap_or(0).min(*threshold);
                format!("• {}: {}/{}", key, current, threshold)
            })
            .collect();

        Ok(format!(
            "{} **{}** ({} XP)\n{}",
            quest.emoji,
            quest.name,
            quest.xp_reward,
            lines.join("\n")
        ))
    }

    async fn handle_list(&self, user_id: u64, guild_id: u64) -> Result<String> {
        let catalog = self.catalog.catalog_for_guild(guild_id).await?;

        let mut lines = Vec::with_capacity(catalog.len());
        for quest in &catalog {
            let status = match self.progress.get(user_id, guild_id, &quest.id).await? {
                Some(p) if p.claimed => "claimed",
                Some(p) if p.completed => "ready to claim",
                _ => "in progress",
            };
            lines.push(format!(
                "{} **{}** (`{}`, {} XP) — {}",
                quest.emoji, quest.name, quest.id, quest.xp_reward, status
            ));
        }

        Ok(lines.join("\n"))
    }

    async fn handle_create(&self, guild_id: u64, options: &[CommandDataOption]) -> Result<String> {
        let name = required_string(options, "name")?;
        let requirements_json = required_string(options, "requirements")?;
        let xp = required_int(options, "xp")?;
        let emoji = optional_string(options, "emoji").unwrap_or_else(|| "⭐".to_string());

        let requirements: HashMap<String, i64> = serde_json::from_str(&requirements_json)
            .map_err(|e| QuestlineError::InvalidQuest(format!("requirements JSON: {}", e)))?;

        match self
            .catalog
            .create_custom(guild_id, &name, &emoji, requirements, xp)
            .await
        {
            Ok(quest) => Ok(format!(
                "Created {} **{}** (`{}`, {} XP).",
                quest.emoji, quest.name, quest.id, quest.xp_reward
            )),
            Err(QuestlineError::InvalidQuest(reason)) => {
                Ok(format!("That quest definition was rejected: {}.", reason))
            }
            Err(e) => Err(e),
        }
    }

    async fn handle_toggle(&self, guild_id: u64, options: &[CommandDataOption]) -> Result<String> {
        let quest_id = required_string(options, "id")?;
        let enabled = required_bool(options, "enabled")?;

        if self.catalog.set_enabled(guild_id, &quest_id, enabled).await? {
            Ok(format!(
                "Quest `{}` is now {}.",
                quest_id,
                if enabled { "enabled" } else { "disabled" }
            ))
        } else {
            Ok("No custom quest with that id exists here.".to_string())
        }
    }

    async fn handle_rank(&self, user_id: u64, guild_id: u64) -> Result<String> {
        let mut account = self.ledger.get(user_id, guild_id).await?;
        let now = Utc::now();
        account.normalize_periods(&day_key(now), &week_start_key(now));

        let mut reply = format!(
            "**Level {}** — {} XP (multiplier ×{:.1})\n\
             Words: {} · Voice: {} min · Messages: {} · Quests: {}\n\
             Today: {} daily quests · This week: {} weekly quests",
            account.level,
            account.xp,
            account.xp_multiplier,
            account.unique_words,
            account.voice_seconds / 60,
            account.messages_sent,
            account.quests_completed,
            account.daily_quests_done,
            account.weekly_quests_done,
        );

        if let Some(req) = requirement_for(account.level + 1) {
            reply.push_str(&format!(
                "\nNext level: {}/{} words, {}/{} voice min, {}/{} messages, {}/{} quests",
                account.unique_words.min(req.words),
                req.words,
                (account.voice_seconds / 60).min(req.voice_minutes),
                req.voice_minutes,
                account.messages_sent.min(req.messages),
                req.messages,
                account.quests_completed.min(req.quests),
                req.quests,
            ));
        } else {
            reply.push_str("\nMaximum level reached.");
        }

        Ok(reply)
    }

    async fn handle_leaderboard(&self, guild_id: u64) -> Result<String> {
        let top = self.ledger.top_by_xp(guild_id, 10).await?;
        if top.is_empty() {
            return Ok("No activity tracked here yet.".to_string());
        }

        let lines: Vec<String> = top
            .iter()
            .enumerate()
            .map(|(i, account)| {
                format!(
                    "{}. <@{}> — level {}, {} XP",
                    i + 1,
                    account.user_id,
                    account.level,
                    account.xp
                )
            })
            .collect();
        Ok(lines.join("\n"))
    }

    async fn snapshot_for(&self, user_id: u64, guild_id: u64) -> Result<HashMap<String, i64>> {
        let now = Utc::now();
        let account = self.ledger.get(user_id, guild_id).await?;
        let daily = self.stats.daily(user_id, guild_id, &day_key(now)).await?;
        let weekly = self
            .stats
            .weekly(user_id, guild_id, &week_start_key(now))
            .await?;
        Ok(build_snapshot(&daily, &weekly, &account))
    }

    async fn respond(
        &self,
        ctx: &Context,
        command: &CommandInteraction,
        content: &str,
    ) -> Result<()> {
        command
            .create_response(
                &ctx.http,
                CreateInteractionResponse::Message(
                    CreateInteractionResponseMessage::new().content(content),
                ),
            )
            .await
            .map_err(|e| QuestlineError::DiscordApi(Box::new(e)))
    }
}

/// Reply text for a claim attempt; the three rejections stay distinct.
fn claim_reply(outcome: &ClaimOutcome) -> String {
    match outcome {
        ClaimOutcome::Claimed { quest, credited } => format!(
            "{} **{}** claimed — **{} XP** credited.",
            quest.emoji, quest.name, credited
        ),
        ClaimOutcome::UnknownQuest => "No quest with that id exists here.".to_string(),
        ClaimOutcome::NotReady => {
            "That quest isn't finished yet — check `/quest progress`.".to_string()
        }
        ClaimOutcome::AlreadyClaimed => "You already claimed that quest.".to_string(),
    }
}

fn is_admin(command: &CommandInteraction) -> bool {
    command
        .member
        .as_ref()
        .and_then(|m| m.permissions)
        .unwrap_or(Permissions::empty())
        .administrator()
}

fn sub_options(option: &CommandDataOption) -> Vec<CommandDataOption> {
    match &option.value {
        CommandDataOptionValue::SubCommand(options) => options.clone(),
        _ => Vec::new(),
    }
}

fn required_string(options: &[CommandDataOption], name: &str) -> Result<String> {
    options
        .iter()
        .find(|o| o.name == name)
        .and_then(|o| o.value.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| QuestlineError::Config(format!("missing option: {}", name)))
}

fn optional_string(options: &[CommandDataOption], name: &str) -> Option<String> {
    options
        .iter()
        .find(|o| o.name == name)
        .and_then(|o| o.value.as_str())
        .map(|s| s.to_string())
}

fn required_bool(options: &[CommandDataOption], name: &str) -> Result<bool> {
    options
        .iter()
        .find(|o| o.name == name)
        .and_then(|o| o.value.as_bool())
        .ok_or_else(|| QuestlineError::Config(format!("missing option: {}", name)))
}

fn required_int(options: &[CommandDataOption], name: &str) -> Result<i64> {
    options
        .iter()
        .find(|o| o.name == name)
        .and_then(|o| o.value.as_i64())
        .ok_or_else(|| QuestlineError::Config(format!("missing option: {}", name)))
}
