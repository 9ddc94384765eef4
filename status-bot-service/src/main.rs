// Copyright (C) 2026 Craftwatch
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use anyhow::Context as AnyhowContext;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_dynamodb::{Client as DynamoClient, types::AttributeValue};
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use craftwatch_common::{
    AnnounceRequest, AnnouncementKind, ControlAck, GATED_COMMANDS, SetupRequest, StatusMessage,
    StatusProbe, TenantRecord, TenantRequest, compose_announcement, compose_status_message,
    format_ping_reply, is_valid_duration, is_valid_target_address, probe_from_response,
    render_permission_table, status_channel_name, STATUS_ICON_FILENAME,
    DEFAULT_POLL_INTERVAL_MS, DEFAULT_STATUS_TIMEOUT_SECONDS, StatusApiResponse,
};
use serenity::all::{
    ChannelId, ChannelType, Colour, Command, CommandInteraction, CommandOptionType, Context,
    CreateActionRow, CreateAttachment, CreateButton, CreateChannel, CreateCommand,
    CreateCommandOption, CreateEmbed, CreateEmbedFooter, CreateInteractionResponse,
    CreateInteractionResponseMessage, CreateMessage, EditAttachments, EditMessage, EventHandler,
    GatewayIntents, GuildId, Http, HttpError, Interaction, MessageId, Ready, ResolvedOption,
    ResolvedValue, ShardManager, Timestamp,
};
use tokio::{
    sync::Mutex,
    task::JoinSet,
    time::MissedTickBehavior,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};

const MAX_CONCURRENT_POLLS: usize = 8;
const REFERENCE_PING_TIMEOUT_SECONDS: u64 = 3;

#[derive(Clone)]
struct AppState {
    config: BotConfig,
    tenants: TenantStore,
    permissions: PermissionRegistry,
    status: Arc<dyn StatusProvider>,
    messenger: Arc<dyn StatusMessenger>,
    gateway: GatewayHandle,
}

#[derive(Clone)]
struct BotConfig {
    discord_token: String,
    guild_id: Option<u64>,
    invite_url: String,
    reference_host: String,
    status_api_base_url: String,
    poll_interval_ms: u64,
}

impl BotConfig {
    fn from_env() -> anyhow::Result<Self> {
        let discord_token = std::env::var("DISCORD_BOT_TOKEN")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .context("DISCORD_BOT_TOKEN is required")?;
        let guild_id = std::env::var("DISCORD_GUILD_ID")
            .ok()
            .and_then(|value| value.parse::<u64>().ok());
        let invite_url = std::env::var("COMMUNITY_INVITE_URL")
            .ok()
            .unwrap_or_default();
        let reference_host = std::env::var("REFERENCE_HOST")
            .ok()
            .unwrap_or_else(|| "8.8.8.8:53".to_string());
        let status_api_base_url = std::env::var("STATUS_API_BASE_URL")
            .ok()
            .unwrap_or_else(|| "https://api.mcsrvstat.us/2".to_string());
        let poll_interval_ms = std::env::var("POLL_INTERVAL_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS);

        Ok(Self {
            discord_token,
            guild_id,
            invite_url,
            reference_host,
            status_api_base_url,
            poll_interval_ms,
        })
    }
}

// ---------------------------------------------------------------------------
// Tenant store
// ---------------------------------------------------------------------------

/// In-memory tenant map with optional DynamoDB write-through. The outer lock
/// only guards map membership; each record carries its own lock so a slow
/// persistence write for one guild never blocks the others.
#[derive(Clone)]
struct TenantStore {
    records: Arc<Mutex<HashMap<String, Arc<Mutex<TenantRecord>>>>>,
    persistence: Option<TenantStateStore>,
}

impl TenantStore {
    fn new(persistence: Option<TenantStateStore>) -> Self {
        Self {
            records: Arc::new(Mutex::new(HashMap::new())),
            persistence,
        }
    }

    async fn hydrate(&self) -> anyhow::Result<usize> {
        let Some(store) = &self.persistence else {
            return Ok(0);
        };
        let records = store.scan_records().await?;
        let count = records.len();
        let mut map = self.records.lock().await;
        for record in records {
            map.insert(
                record.guild_id.clone(),
                Arc::new(Mutex::new(record)),
            );
        }
        Ok(count)
    }

    async fn get(&self, guild_id: &str) -> Option<TenantRecord> {
        let entry = self.records.lock().await.get(guild_id).cloned()?;
        let record = entry.lock().await;
        Some(record.clone())
    }

    async fn guild_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.records.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn entry(&self, guild_id: &str) -> Arc<Mutex<TenantRecord>> {
        let mut records = self.records.lock().await;
        records
            .entry(guild_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(TenantRecord::new(guild_id))))
            .clone()
    }

    /// Point the tenant at a new target and display channel. Always restarts
    /// monitoring and drops the tracked message, which belongs to the old
    /// channel.
    async fn apply_setup(
        &self,
        guild_id: &str,
        target_address: &str,
        display_channel_id: u64,
    ) -> anyhow::Result<()> {
        let entry = self.entry(guild_id).await;
        let mut record = entry.lock().await;
        record.target_address = Some(target_address.to_string());
        record.display_channel_id = Some(display_channel_id);
        record.monitoring_enabled = true;
        record.last_message_id = None;
        self.persist(&record).await
    }

    /// Returns `false` when the tenant has never completed setup; flipping the
    /// flag on an unconfigured record would be meaningless.
    async fn set_monitoring(&self, guild_id: &str, enabled: bool) -> anyhow::Result<bool> {
        let entry = self.records.lock().await.get(guild_id).cloned();
        let Some(entry) = entry else {
            return Ok(false);
        };
        let mut record = entry.lock().await;
        if record.target_address.is_none() || record.display_channel_id.is_none() {
            return Ok(false);
        }
        if record.monitoring_enabled != enabled {
            record.monitoring_enabled = enabled;
            self.persist(&record).await?;
        }
        Ok(true)
    }

    async fn record_status_message(
        &self,
        guild_id: &str,
        message_id: u64,
    ) -> anyhow::Result<()> {
        let entry = self.records.lock().await.get(guild_id).cloned();
        let Some(entry) = entry else {
            return Ok(());
        };
        let mut record = entry.lock().await;
        if record.last_message_id != Some(message_id) {
            record.last_message_id = Some(message_id);
            self.persist(&record).await?;
        }
        Ok(())
    }

    async fn persist(&self, record: &TenantRecord) -> anyhow::Result<()> {
        if let Some(store) = &self.persistence {
            store.put_record(record).await?;
        }
        Ok(())
    }
}

#[derive(Clone)]
struct TenantStateStore {
    client: DynamoClient,
    table_name: String,
}

impl TenantStateStore {
    async fn put_record(&self, record: &TenantRecord) -> anyhow::Result<()> {
        let mut item = HashMap::new();
        item.insert(
            "guild_id".to_string(),
            AttributeValue::S(record.guild_id.clone()),
        );
        item.insert(
            "target_address".to_string(),
            match &record.target_address {
                Some(address) => AttributeValue::S(address.clone()),
                None => AttributeValue::Null(true),
            },
        );
        item.insert(
            "display_channel_id".to_string(),
            match record.display_channel_id {
                Some(channel_id) => AttributeValue::N(channel_id.to_string()),
                None => AttributeValue::Null(true),
            },
        );
        item.insert(
            "monitoring_enabled".to_string(),
            AttributeValue::Bool(record.monitoring_enabled),
        );
        item.insert(
            "last_message_id".to_string(),
            match record.last_message_id {
                Some(message_id) => AttributeValue::N(message_id.to_string()),
                None => AttributeValue::Null(true),
            },
        );
        item.insert(
            "updated_at".to_string(),
            AttributeValue::S(Utc::now().to_rfc3339()),
        );

        self.client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(item))
            .send()
            .await
            .context("failed to persist tenant record")?;
        Ok(())
    }

    async fn scan_records(&self) -> anyhow::Result<Vec<TenantRecord>> {
        let mut records = Vec::new();
        let mut exclusive_start_key: Option<HashMap<String, AttributeValue>> = None;

        loop {
            let mut request = self.client.scan().table_name(&self.table_name);
            if let Some(key) = exclusive_start_key.take() {
                request = request.set_exclusive_start_key(Some(key));
            }
            let output = request
                .send()
                .await
                .context("failed to scan tenant table")?;

            for item in output.items() {
                match record_from_item(item) {
                    Some(record) => records.push(record),
                    None => warn!("skipping malformed tenant item"),
                }
            }

            match output.last_evaluated_key() {
                Some(key) if !key.is_empty() => exclusive_start_key = Some(key.clone()),
                _ => break,
            }
        }

        Ok(records)
    }
}

fn record_from_item(item: &HashMap<String, AttributeValue>) -> Option<TenantRecord> {
    let guild_id = item.get("guild_id")?.as_s().ok()?.clone();
    Some(TenantRecord {
        guild_id,
        target_address: string_attr(item, "target_address"),
        display_channel_id: number_attr(item, "display_channel_id"),
        monitoring_enabled: item
            .get("monitoring_enabled")
            .and_then(|value| value.as_bool().ok())
            .copied()
            .unwrap_or(false),
        last_message_id: number_attr(item, "last_message_id"),
    })
}

fn string_attr(item: &HashMap<String, AttributeValue>, name: &str) -> Option<String> {
    item.get(name).and_then(|value| value.as_s().ok()).cloned()
}

fn number_attr(item: &HashMap<String, AttributeValue>, name: &str) -> Option<u64> {
    item.get(name)
        .and_then(|value| value.as_n().ok())
        .and_then(|value| value.parse::<u64>().ok())
}

async fn load_tenant_state_store() -> Option<TenantStateStore> {
    if std::env::var("DYNAMODB_ENDPOINT").is_err() && std::env::var("AWS_REGION").is_err() {
        return None;
    }

    let mut loader = aws_config::defaults(BehaviorVersion::latest());
    if let Ok(endpoint) = std::env::var("DYNAMODB_ENDPOINT") {
        loader = loader.endpoint_url(endpoint);
    }
    let config = loader.load().await;
    let table_name = std::env::var("TENANT_TABLE")
        .ok()
        .unwrap_or_else(|| "craftwatch_tenants".to_string());

    info!(table_name = %table_name, "tenant DynamoDB state store enabled");
    Some(TenantStateStore {
        client: DynamoClient::new(&config),
        table_name,
    })
}

// ---------------------------------------------------------------------------
// Permission registry
// ---------------------------------------------------------------------------

/// Per-guild allow-lists keyed by command name. A command with no entry is
/// open to everyone; an entry restricts it to the listed roles, and an entry
/// whose list has been emptied denies everyone until it is re-allowed or the
/// guild is reset.
#[derive(Clone, Default)]
struct PermissionRegistry {
    table: Arc<Mutex<HashMap<String, HashMap<String, HashSet<String>>>>>,
}

impl PermissionRegistry {
    async fn is_allowed(&self, guild_id: &str, command: &str, roles: &[String]) -> bool {
        let table = self.table.lock().await;
        let Some(allowed) = table
            .get(guild_id)
            .and_then(|commands| commands.get(command))
        else {
            return true;
        };
        roles.iter().any(|role| allowed.contains(role))
    }

    async fn allow(&self, guild_id: &str, command: &str, role_id: &str) {
        let mut table = self.table.lock().await;
        table
            .entry(guild_id.to_string())
            .or_default()
            .entry(command.to_string())
            .or_default()
            .insert(role_id.to_string());
    }

    // The entry survives even when its last role is removed: an empty
    // allow-list denies everyone rather than reopening the command.
    async fn deny(&self, guild_id: &str, command: &str, role_id: &str) {
        let mut table = self.table.lock().await;
        if let Some(commands) = table.get_mut(guild_id) {
            if let Some(allowed) = commands.get_mut(command) {
                allowed.remove(role_id);
            }
        }
    }

    async fn reset(&self, guild_id: &str) {
        self.table.lock().await.remove(guild_id);
    }

    async fn list(&self, guild_id: &str) -> BTreeMap<String, BTreeSet<String>> {
        let table = self.table.lock().await;
        table
            .get(guild_id)
            .map(|commands| {
                commands
                    .iter()
                    .map(|(command, roles)| {
                        (command.clone(), roles.iter().cloned().collect())
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Status provider
// ---------------------------------------------------------------------------

/// Any status fetch failure is transient by definition; the poller keeps the
/// last rendered message and tries again next cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
enum StatusError {
    Transient(String),
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient(message) => write!(f, "{message}"),
        }
    }
}

#[async_trait]
trait StatusProvider: Send + Sync {
    async fn fetch(&self, target_address: &str) -> Result<StatusProbe, StatusError>;
}

#[derive(Clone)]
struct McStatusClient {
    client: reqwest::Client,
    base_url: String,
}

impl McStatusClient {
    fn new(base_url: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_STATUS_TIMEOUT_SECONDS))
            .build()
            .context("failed to build status HTTP client")?;
        Ok(Self { client, base_url })
    }
}

#[async_trait]
impl StatusProvider for McStatusClient {
    async fn fetch(&self, target_address: &str) -> Result<StatusProbe, StatusError> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), target_address);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|error| StatusError::Transient(format!("status request failed: {error}")))?
            .error_for_status()
            .map_err(|error| {
                StatusError::Transient(format!("status API returned an error: {error}"))
            })?;
        let body: StatusApiResponse = response.json().await.map_err(|error| {
            StatusError::Transient(format!("invalid status API payload: {error}"))
        })?;
        Ok(probe_from_response(target_address, body))
    }
}

// ---------------------------------------------------------------------------
// Messenger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum PlatformError {
    /// The tracked message no longer exists (deleted by a moderator).
    MessageMissing,
    Other(String),
}

impl std::fmt::Display for PlatformError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MessageMissing => write!(f, "message no longer exists"),
            Self::Other(message) => write!(f, "{message}"),
        }
    }
}

#[async_trait]
trait StatusMessenger: Send + Sync {
    async fn create_status_channel(
        &self,
        guild_id: u64,
        name: &str,
    ) -> Result<u64, PlatformError>;
    async fn create_message(
        &self,
        channel_id: u64,
        message: &StatusMessage,
    ) -> Result<u64, PlatformError>;
    async fn edit_message(
        &self,
        channel_id: u64,
        message_id: u64,
        message: &StatusMessage,
    ) -> Result<(), PlatformError>;
}

#[derive(Clone)]
struct DiscordMessenger {
    http: Arc<Http>,
}

impl DiscordMessenger {
    fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl StatusMessenger for DiscordMessenger {
    async fn create_status_channel(
        &self,
        guild_id: u64,
        name: &str,
    ) -> Result<u64, PlatformError> {
        let channel = GuildId::new(guild_id)
            .create_channel(
                &self.http,
                CreateChannel::new(name).kind(ChannelType::Text),
            )
            .await
            .map_err(classify_platform_error)?;
        Ok(channel.id.get())
    }

    async fn create_message(
        &self,
        channel_id: u64,
        message: &StatusMessage,
    ) -> Result<u64, PlatformError> {
        let mut builder = CreateMessage::new()
            .embed(build_embed(message))
            .components(build_components(message));
        if let Some(icon) = &message.icon {
            builder = builder.add_file(CreateAttachment::bytes(
                icon.clone(),
                STATUS_ICON_FILENAME,
            ));
        }
        let sent = ChannelId::new(channel_id)
            .send_message(&self.http, builder)
            .await
            .map_err(classify_platform_error)?;
        Ok(sent.id.get())
    }

    async fn edit_message(
        &self,
        channel_id: u64,
        message_id: u64,
        message: &StatusMessage,
    ) -> Result<(), PlatformError> {
        let mut attachments = EditAttachments::new();
        if let Some(icon) = &message.icon {
            attachments = attachments.add(CreateAttachment::bytes(
                icon.clone(),
                STATUS_ICON_FILENAME,
            ));
        }
        ChannelId::new(channel_id)
            .edit_message(
                &self.http,
                MessageId::new(message_id),
                EditMessage::new()
                    .embed(build_embed(message))
                    .components(build_components(message))
                    .attachments(attachments),
            )
            .await
            .map_err(classify_platform_error)?;
        Ok(())
    }
}

fn build_embed(message: &StatusMessage) -> CreateEmbed {
    let spec = &message.embed;
    let mut embed = CreateEmbed::new()
        .title(spec.title.clone())
        .colour(Colour::new(spec.color));
    if let Some(description) = &spec.description {
        embed = embed.description(description.clone());
    }
    for field in &spec.fields {
        embed = embed.field(field.name.clone(), field.value.clone(), field.inline);
    }
    if let Some(footer) = &spec.footer {
        embed = embed.footer(CreateEmbedFooter::new(footer.clone()));
    }
    if let Some(url) = &spec.thumbnail_url {
        embed = embed.thumbnail(url.clone());
    }
    if spec.timestamp {
        embed = embed.timestamp(Timestamp::now());
    }
    embed
}

fn build_components(message: &StatusMessage) -> Vec<CreateActionRow> {
    let Some(button) = &message.link_button else {
        return Vec::new();
    };
    let mut create = CreateButton::new_link(button.url.clone()).label(button.label.clone());
    if let Some(emoji) = button.emoji {
        create = create.emoji(emoji);
    }
    vec![CreateActionRow::Buttons(vec![create])]
}

/// Discord error 10008 ("Unknown Message") means the tracked message was
/// deleted out from under us; everything else is opaque.
fn classify_platform_error(error: serenity::Error) -> PlatformError {
    if let serenity::Error::Http(HttpError::UnsuccessfulRequest(ref response)) = error {
        if response.error.code == 10008 {
            return PlatformError::MessageMissing;
        }
    }
    PlatformError::Other(error.to_string())
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

/// Converge the tenant's status channel onto exactly one live status message:
/// edit the tracked message in place, fall back to creating a replacement only
/// when the tracked message is gone, and surface every other failure.
async fn reconcile_status_message(
    messenger: &dyn StatusMessenger,
    channel_id: u64,
    prior_message_id: Option<u64>,
    payload: &StatusMessage,
) -> Result<u64, PlatformError> {
    if let Some(message_id) = prior_message_id {
        match messenger.edit_message(channel_id, message_id, payload).await {
            Ok(()) => return Ok(message_id),
            Err(PlatformError::MessageMissing) => {
                info!(
                    channel_id,
                    message_id, "tracked status message is gone; creating a replacement"
                );
            }
            Err(error) => return Err(error),
        }
    }
    messenger.create_message(channel_id, payload).await
}

// ---------------------------------------------------------------------------
// Poller
// ---------------------------------------------------------------------------

async fn run_status_poller(state: AppState) {
    let mut ticker = tokio::time::interval(Duration::from_millis(state.config.poll_interval_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(
        interval_ms = state.config.poll_interval_ms,
        "status poller started"
    );

    loop {
        ticker.tick().await;
        run_poll_cycle(&state).await;
    }
}

/// One fan-out over every known tenant. The cycle finishes only after every
/// spawned poll completes, so a tenant is never polled twice concurrently.
async fn run_poll_cycle(state: &AppState) {
    let guild_ids = state.tenants.guild_ids().await;
    let mut tasks: JoinSet<(String, anyhow::Result<()>)> = JoinSet::new();

    for guild_id in guild_ids {
        if tasks.len() >= MAX_CONCURRENT_POLLS {
            if let Some(result) = tasks.join_next().await {
                log_poll_result(result);
            }
        }
        let task_state = state.clone();
        tasks.spawn(async move {
            let outcome = poll_tenant(&task_state, &guild_id).await;
            (guild_id, outcome)
        });
    }

    while let Some(result) = tasks.join_next().await {
        log_poll_result(result);
    }
}

fn log_poll_result(result: Result<(String, anyhow::Result<()>), tokio::task::JoinError>) {
    match result {
        Ok((_, Ok(()))) => {}
        Ok((guild_id, Err(error))) => {
            warn!(guild_id = %guild_id, error = %error, "tenant poll failed");
        }
        Err(error) => warn!(error = %error, "tenant poll task panicked"),
    }
}

async fn poll_tenant(state: &AppState, guild_id: &str) -> anyhow::Result<()> {
    let Some(record) = state.tenants.get(guild_id).await else {
        return Ok(());
    };
    if !record.is_pollable() {
        return Ok(());
    }
    // is_pollable guarantees both fields.
    let Some(target_address) = record.target_address else {
        return Ok(());
    };
    let Some(channel_id) = record.display_channel_id else {
        return Ok(());
    };

    let probe = match state.status.fetch(&target_address).await {
        Ok(probe) => probe,
        Err(StatusError::Transient(message)) => {
            warn!(
                guild_id = %guild_id,
                target_address = %target_address,
                error = %message,
                "status fetch failed; keeping previous status message"
            );
            return Ok(());
        }
    };

    let payload = compose_status_message(&target_address, &probe, &state.config.invite_url);
    let message_id = reconcile_status_message(
        state.messenger.as_ref(),
        channel_id,
        record.last_message_id,
        &payload,
    )
    .await
    .map_err(|error| anyhow::anyhow!("status message reconciliation failed: {error}"))?;

    if record.last_message_id != Some(message_id) {
        state
            .tenants
            .record_status_message(guild_id, message_id)
            .await?;
        debug!(guild_id = %guild_id, message_id, "tracking new status message");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum BotCommand {
    Setup { address: String },
    Stop,
    Start,
    Announce { kind: AnnouncementKind, duration: String },
    PermissionSet { role_id: u64, command: String, allow: bool },
    PermissionReset,
    PermissionList,
    Ping,
}

impl BotCommand {
    fn gate_name(&self) -> &'static str {
        match self {
            Self::Setup { .. } => "setup",
            Self::Stop => "stop",
            Self::Start => "start",
            Self::Announce { .. } => "announce",
            Self::PermissionSet { .. } | Self::PermissionReset => "perm",
            Self::PermissionList => "perm_list",
            Self::Ping => "ping",
        }
    }

    /// Read-only commands stay open so members can always see the table and
    /// check liveness.
    fn skips_permission_check(&self) -> bool {
        matches!(self, Self::Ping | Self::PermissionList)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CommandError {
    Denied,
    Rejected(String),
    Failed(String),
}

impl CommandError {
    fn user_message(&self) -> String {
        match self {
            Self::Denied => "⛔ You lack permission to use this command.".to_string(),
            Self::Rejected(message) => message.clone(),
            Self::Failed(_) => "❌ An error occurred. Please try again later.".to_string(),
        }
    }
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Denied => write!(f, "permission denied"),
            Self::Rejected(message) => write!(f, "{message}"),
            Self::Failed(message) => write!(f, "{message}"),
        }
    }
}

async fn dispatch_command(
    state: &AppState,
    guild_id: &str,
    invoker_roles: &[String],
    invoker_name: &str,
    command: BotCommand,
) -> Result<String, CommandError> {
    if !command.skips_permission_check()
        && !state
            .permissions
            .is_allowed(guild_id, command.gate_name(), invoker_roles)
            .await
    {
        return Err(CommandError::Denied);
    }

    match command {
        BotCommand::Setup { address } => {
            let channel_id = setup_tenant(state, guild_id, &address).await?;
            Ok(format!(
                "✅ Now monitoring **{address}** in <#{channel_id}>."
            ))
        }
        BotCommand::Stop => {
            if !set_monitoring(state, guild_id, false).await? {
                return Err(CommandError::Rejected(
                    "⚠️ No status channel found. Use /setup first.".to_string(),
                ));
            }
            Ok("🛑 Monitoring stopped.".to_string())
        }
        BotCommand::Start => {
            if !set_monitoring(state, guild_id, true).await? {
                return Err(CommandError::Rejected(
                    "⚠️ No status channel found. Use /setup first.".to_string(),
                ));
            }
            Ok("▶️ Monitoring resumed.".to_string())
        }
        BotCommand::Announce { kind, duration } => {
            send_announcement(state, guild_id, kind, &duration, invoker_name).await?;
            Ok("📨 Announcement sent to the status channel.".to_string())
        }
        BotCommand::PermissionSet {
            role_id,
            command,
            allow,
        } => {
            if !GATED_COMMANDS.contains(&command.as_str()) {
                return Err(CommandError::Rejected(
                    "❌ Unknown permission name.".to_string(),
                ));
            }
            let role = role_id.to_string();
            if allow {
                state.permissions.allow(guild_id, &command, &role).await;
                Ok(format!("✅ Allowed **{command}** for <@&{role_id}>."))
            } else {
                state.permissions.deny(guild_id, &command, &role).await;
                Ok(format!("⛔ Denied **{command}** for <@&{role_id}>."))
            }
        }
        BotCommand::PermissionReset => {
            state.permissions.reset(guild_id).await;
            Ok("🔄 All permissions reset.".to_string())
        }
        BotCommand::PermissionList => {
            let table = state.permissions.list(guild_id).await;
            Ok(render_permission_table(&table))
        }
        BotCommand::Ping => {
            let gateway_ms = state.gateway.latency_ms().await;
            let reference_ms =
                measure_reference_latency(&state.config.reference_host).await;
            Ok(format_ping_reply(
                gateway_ms,
                &state.config.reference_host,
                reference_ms,
            ))
        }
    }
}

/// Shared by the `setup` slash command and the control plane. Creates the
/// status channel and flips the tenant to monitoring.
async fn setup_tenant(
    state: &AppState,
    guild_id: &str,
    address: &str,
) -> Result<u64, CommandError> {
    let address = address.trim();
    if !is_valid_target_address(address) {
        return Err(CommandError::Rejected(
            "❌ Invalid server address format.".to_string(),
        ));
    }
    // GuildId asserts non-zero, so a zero id must be caught here.
    let numeric_guild_id = guild_id
        .parse::<u64>()
        .ok()
        .filter(|id| *id != 0)
        .ok_or_else(|| CommandError::Rejected("❌ Invalid guild id.".to_string()))?;

    let channel_name = status_channel_name(address);
    let channel_id = state
        .messenger
        .create_status_channel(numeric_guild_id, &channel_name)
        .await
        .map_err(|error| CommandError::Failed(format!("channel creation failed: {error}")))?;

    state
        .tenants
        .apply_setup(guild_id, address, channel_id)
        .await
        .map_err(|error| CommandError::Failed(format!("tenant persistence failed: {error}")))?;

    info!(
        guild_id = %guild_id,
        target_address = %address,
        channel_id,
        "tenant setup complete"
    );
    Ok(channel_id)
}

/// Returns `false` for a tenant that was never set up.
async fn set_monitoring(
    state: &AppState,
    guild_id: &str,
    enabled: bool,
) -> Result<bool, CommandError> {
    let configured = state
        .tenants
        .set_monitoring(guild_id, enabled)
        .await
        .map_err(|error| CommandError::Failed(format!("tenant persistence failed: {error}")))?;
    if configured {
        info!(guild_id = %guild_id, enabled, "monitoring toggled");
    }
    Ok(configured)
}

/// Announcements are one-off posts; they are never tracked as the status
/// message, so the next poll leaves them in the channel's history.
async fn send_announcement(
    state: &AppState,
    guild_id: &str,
    kind: AnnouncementKind,
    duration: &str,
    announced_by: &str,
) -> Result<(), CommandError> {
    let duration = duration.trim();
    if !is_valid_duration(duration) {
        return Err(CommandError::Rejected(
            "❌ Invalid time format. Use e.g. \"1h\" or \"30m\".".to_string(),
        ));
    }

    let record = state.tenants.get(guild_id).await;
    let (Some(address), Some(channel_id)) = record
        .map(|record| (record.target_address, record.display_channel_id))
        .unwrap_or((None, None))
    else {
        return Err(CommandError::Rejected(
            "⚠️ No status channel found. Use /setup first.".to_string(),
        ));
    };

    let payload = compose_announcement(
        &address,
        kind,
        duration,
        announced_by,
        &state.config.invite_url,
    );
    state
        .messenger
        .create_message(channel_id, &payload)
        .await
        .map_err(|error| CommandError::Failed(format!("announcement send failed: {error}")))?;

    info!(guild_id = %guild_id, kind = ?kind, "announcement posted");
    Ok(())
}

async fn measure_reference_latency(host: &str) -> Option<u64> {
    let started = std::time::Instant::now();
    match tokio::time::timeout(
        Duration::from_secs(REFERENCE_PING_TIMEOUT_SECONDS),
        tokio::net::TcpStream::connect(host),
    )
    .await
    {
        Ok(Ok(_)) => Some(started.elapsed().as_millis() as u64),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Discord gateway
// ---------------------------------------------------------------------------

/// Late-bound handle to the shard manager; the manager only exists once the
/// serenity client is built, after the poller and control plane have started.
#[derive(Clone, Default)]
struct GatewayHandle {
    shard_manager: Arc<Mutex<Option<Arc<ShardManager>>>>,
}

impl GatewayHandle {
    async fn install(&self, manager: Arc<ShardManager>) {
        *self.shard_manager.lock().await = Some(manager);
    }

    async fn latency_ms(&self) -> Option<u64> {
        let guard = self.shard_manager.lock().await;
        let manager = guard.as_ref()?;
        let runners = manager.runners.lock().await;
        runners
            .values()
            .find_map(|runner| runner.latency)
            .map(|latency| latency.as_millis() as u64)
    }
}

struct BotEventHandler {
    state: AppState,
}

#[serenity::async_trait]
impl EventHandler for BotEventHandler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!(user = %ready.user.name, guilds = ready.guilds.len(), "gateway connected");

        let definitions = slash_command_definitions();
        let result = match self.state.config.guild_id {
            Some(guild_id) => {
                GuildId::new(guild_id)
                    .set_commands(&ctx.http, definitions)
                    .await
            }
            None => Command::set_global_commands(&ctx.http, definitions).await,
        };
        match result {
            Ok(commands) => info!(count = commands.len(), "slash commands registered"),
            Err(error) => warn!(error = %error, "failed to register slash commands"),
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        let Interaction::Command(command) = interaction else {
            return;
        };

        let reply = self.handle_command(&command).await;
        let response = CreateInteractionResponse::Message(
            CreateInteractionResponseMessage::new()
                .content(reply)
                .ephemeral(true),
        );
        if let Err(error) = command.create_response(&ctx.http, response).await {
            warn!(error = %error, command = %command.data.name, "failed to answer interaction");
        }
    }
}

impl BotEventHandler {
    async fn handle_command(&self, command: &CommandInteraction) -> String {
        let Some(guild_id) = command.guild_id else {
            return "❌ This command only works in a server.".to_string();
        };
        let guild_id = guild_id.get().to_string();
        let invoker_roles: Vec<String> = command
            .member
            .as_ref()
            .map(|member| member.roles.iter().map(|role| role.get().to_string()).collect())
            .unwrap_or_default();

        let parsed = match parse_interaction(command) {
            Ok(parsed) => parsed,
            Err(message) => return message,
        };

        match dispatch_command(
            &self.state,
            &guild_id,
            &invoker_roles,
            &command.user.name,
            parsed,
        )
        .await
        {
            Ok(reply) => reply,
            Err(error) => {
                if let CommandError::Failed(message) = &error {
                    warn!(guild_id = %guild_id, error = %message, "command failed");
                }
                error.user_message()
            }
        }
    }
}

fn slash_command_definitions() -> Vec<CreateCommand> {
    vec![
        CreateCommand::new("setup")
            .description("Create a status channel and start monitoring a server")
            .dm_permission(false)
            .add_option(
                CreateCommandOption::new(
                    CommandOptionType::String,
                    "address",
                    "Server address, e.g. play.example.com:25565",
                )
                .required(true),
            ),
        CreateCommand::new("stop")
            .description("Pause status monitoring")
            .dm_permission(false),
        CreateCommand::new("start")
            .description("Resume status monitoring")
            .dm_permission(false),
        CreateCommand::new("msg")
            .description("Post a maintenance or downtime announcement")
            .dm_permission(false)
            .add_option(
                CreateCommandOption::new(CommandOptionType::String, "type", "Announcement type")
                    .required(true)
                    .add_string_choice("Maintenance", "maintenance")
                    .add_string_choice("Server Stop", "server_stop"),
            )
            .add_option(
                CreateCommandOption::new(
                    CommandOptionType::String,
                    "duration",
                    "Estimated duration, e.g. 1h or 30m",
                )
                .required(true),
            ),
        CreateCommand::new("perm")
            .description("Restrict a command to a role, or lift a restriction")
            .dm_permission(false)
            .add_option(CreateCommandOption::new(
                CommandOptionType::Role,
                "role",
                "Role to allow or deny",
            ))
            .add_option(
                CreateCommandOption::new(
                    CommandOptionType::String,
                    "permission",
                    "Command to restrict",
                )
                .add_string_choice("setup", "setup")
                .add_string_choice("stop", "stop")
                .add_string_choice("start", "start")
                .add_string_choice("announce", "announce")
                .add_string_choice("perm", "perm")
                .add_string_choice("perm_list", "perm_list")
                .add_string_choice("ping", "ping"),
            )
            .add_option(CreateCommandOption::new(
                CommandOptionType::Boolean,
                "toggle",
                "true to allow, false to deny",
            ))
            .add_option(CreateCommandOption::new(
                CommandOptionType::Boolean,
                "reset",
                "Reset all permissions for this server",
            )),
        CreateCommand::new("perm_list")
            .description("Show the current command permissions")
            .dm_permission(false),
        CreateCommand::new("ping")
            .description("Check bot and network latency")
            .dm_permission(false),
    ]
}

fn parse_interaction(command: &CommandInteraction) -> Result<BotCommand, String> {
    let options = command.data.options();
    match command.data.name.as_str() {
        "setup" => {
            let address = str_option(&options, "address")
                .ok_or_else(|| "❌ Please provide a server address.".to_string())?;
            Ok(BotCommand::Setup {
                address: address.to_string(),
            })
        }
        "stop" => Ok(BotCommand::Stop),
        "start" => Ok(BotCommand::Start),
        "msg" => {
            let kind = str_option(&options, "type")
                .and_then(AnnouncementKind::parse)
                .ok_or_else(|| "❌ Unknown announcement type.".to_string())?;
            let duration = str_option(&options, "duration")
                .ok_or_else(|| "❌ Please provide a duration.".to_string())?;
            Ok(BotCommand::Announce {
                kind,
                duration: duration.to_string(),
            })
        }
        "perm" => {
            if bool_option(&options, "reset") == Some(true) {
                return Ok(BotCommand::PermissionReset);
            }
            match (
                role_option(&options, "role"),
                str_option(&options, "permission"),
                bool_option(&options, "toggle"),
            ) {
                (Some(role_id), Some(permission), Some(allow)) => {
                    Ok(BotCommand::PermissionSet {
                        role_id,
                        command: permission.to_string(),
                        allow,
                    })
                }
                _ => Err(
                    "❌ Please provide role, permission, and toggle (allow/deny).".to_string(),
                ),
            }
        }
        "perm_list" => Ok(BotCommand::PermissionList),
        "ping" => Ok(BotCommand::Ping),
        other => Err(format!("❌ Unknown command: {other}")),
    }
}

fn str_option<'a>(options: &'a [ResolvedOption<'a>], name: &str) -> Option<&'a str> {
    options.iter().find(|option| option.name == name).and_then(
        |option| match option.value {
            ResolvedValue::String(value) => Some(value),
            _ => None,
        },
    )
}

fn role_option(options: &[ResolvedOption<'_>], name: &str) -> Option<u64> {
    options
        .iter()
        .find(|option| option.name == name)
        .and_then(|option| match &option.value {
            ResolvedValue::Role(role) => Some(role.id.get()),
            _ => None,
        })
}

fn bool_option(options: &[ResolvedOption<'_>], name: &str) -> Option<bool> {
    options
        .iter()
        .find(|option| option.name == name)
        .and_then(|option| match option.value {
            ResolvedValue::Boolean(value) => Some(value),
            _ => None,
        })
}

// ---------------------------------------------------------------------------
// Control plane
// ---------------------------------------------------------------------------

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/control/setup", post(control_setup_handler))
        .route("/control/start", post(control_start_handler))
        .route("/control/stop", post(control_stop_handler))
        .route("/control/announce", post(control_announce_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true, "service": "status-bot-service"}))
}

async fn control_setup_handler(
    State(state): State<AppState>,
    Json(request): Json<SetupRequest>,
) -> Result<Json<ControlAck>, ApiError> {
    setup_tenant(&state, &request.tenant_id, &request.address)
        .await
        .map_err(ApiError::from_command)?;
    Ok(Json(ControlAck { ok: true }))
}

async fn control_start_handler(
    State(state): State<AppState>,
    Json(request): Json<TenantRequest>,
) -> Result<Json<ControlAck>, ApiError> {
    let configured = set_monitoring(&state, &request.tenant_id, true)
        .await
        .map_err(ApiError::from_command)?;
    if !configured {
        return Err(ApiError::bad_request("tenant has no status channel"));
    }
    Ok(Json(ControlAck { ok: true }))
}

async fn control_stop_handler(
    State(state): State<AppState>,
    Json(request): Json<TenantRequest>,
) -> Result<Json<ControlAck>, ApiError> {
    let configured = set_monitoring(&state, &request.tenant_id, false)
        .await
        .map_err(ApiError::from_command)?;
    if !configured {
        return Err(ApiError::bad_request("tenant has no status channel"));
    }
    Ok(Json(ControlAck { ok: true }))
}

async fn control_announce_handler(
    State(state): State<AppState>,
    Json(request): Json<AnnounceRequest>,
) -> Result<Json<ControlAck>, ApiError> {
    send_announcement(
        &state,
        &request.tenant_id,
        request.kind,
        &request.duration,
        "Dashboard",
    )
    .await
    .map_err(ApiError::from_command)?;
    Ok(Json(ControlAck { ok: true }))
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn from_command(error: CommandError) -> Self {
        match error {
            CommandError::Denied => Self {
                status: StatusCode::FORBIDDEN,
                message: "permission denied".to_string(),
            },
            CommandError::Rejected(message) => Self::bad_request(message),
            CommandError::Failed(message) => Self::internal(message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        warn!(status = %self.status, message = %self.message, "request failed");
        (
            self.status,
            Json(serde_json::json!({"error": self.message})),
        )
            .into_response()
    }
}

fn parse_bind_addr(var_name: &str, default: &str) -> anyhow::Result<SocketAddr> {
    let value = std::env::var(var_name)
        .ok()
        .unwrap_or_else(|| default.to_string());
    value.parse().context(format!("invalid {var_name}"))
}

async fn run_control_server(state: AppState) -> anyhow::Result<()> {
    let bind_addr = parse_bind_addr("CONTROL_SERVICE_BIND", "0.0.0.0:3001")?;
    let app = build_router(state);
    info!(%bind_addr, "control plane listening");
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Entrypoint
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "status_bot_service=debug,tower_http=info".to_string()),
        )
        .init();

    let config = BotConfig::from_env()?;
    let tenants = TenantStore::new(load_tenant_state_store().await);
    match tenants.hydrate().await {
        Ok(count) => info!(count, "tenant records hydrated"),
        Err(error) => warn!(error = %error, "tenant hydration failed; starting empty"),
    }

    let http = Arc::new(Http::new(&config.discord_token));
    let state = AppState {
        config: config.clone(),
        tenants,
        permissions: PermissionRegistry::default(),
        status: Arc::new(McStatusClient::new(config.status_api_base_url.clone())?),
        messenger: Arc::new(DiscordMessenger::new(http)),
        gateway: GatewayHandle::default(),
    };

    let control_state = state.clone();
    tokio::spawn(async move {
        if let Err(error) = run_control_server(control_state).await {
            error!(error = %error, "control plane terminated");
        }
    });
    tokio::spawn(run_status_poller(state.clone()));

    let mut client = serenity::Client::builder(&config.discord_token, GatewayIntents::GUILDS)
        .event_handler(BotEventHandler {
            state: state.clone(),
        })
        .await
        .context("failed to build Discord client")?;
    state.gateway.install(client.shard_manager.clone()).await;

    client
        .start()
        .await
        .context("Discord gateway terminated")?;
    Ok(())
}
