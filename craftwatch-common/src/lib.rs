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

use std::collections::{BTreeMap, BTreeSet};

use base64::Engine;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5000;
pub const DEFAULT_STATUS_TIMEOUT_SECONDS: u64 = 8;

/// Discord caps embed descriptions well above this, but the MOTD block is
/// limited to an embed-field-sized chunk so the rest of the card stays visible.
pub const MAX_MOTD_CHARS: usize = 1024;

pub const COLOR_ONLINE: u32 = 0x00FF00;
pub const COLOR_OFFLINE: u32 = 0xFF0000;
pub const COLOR_MAINTENANCE: u32 = 0xFFA500;

pub const STATUS_ICON_FILENAME: &str = "server-icon.png";

pub const MAINTENANCE_THUMBNAIL_URL: &str = "https://i.imgur.com/8W0Z5gN.png";
pub const SERVER_STOP_THUMBNAIL_URL: &str = "https://i.imgur.com/X7qZ4kN.png";

/// Command names that can carry a role restriction, in registration order.
pub const GATED_COMMANDS: [&str; 7] = [
    "setup",
    "stop",
    "start",
    "announce",
    "perm",
    "perm_list",
    "ping",
];

/// Durable per-guild monitoring state.
///
/// `last_message_id` is only meaningful while `display_channel_id` is set and
/// is mutated exclusively by the reconciliation path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TenantRecord {
    pub guild_id: String,
    pub target_address: Option<String>,
    pub display_channel_id: Option<u64>,
    pub monitoring_enabled: bool,
    pub last_message_id: Option<u64>,
}

impl TenantRecord {
    pub fn new(guild_id: impl Into<String>) -> Self {
        Self {
            guild_id: guild_id.into(),
            target_address: None,
            display_channel_id: None,
            monitoring_enabled: false,
            last_message_id: None,
        }
    }

    /// A record only qualifies for polling when monitoring is on and both the
    /// target and the display channel exist; anything else is treated as
    /// disabled.
    pub fn is_pollable(&self) -> bool {
        self.monitoring_enabled && self.target_address.is_some() && self.display_channel_id.is_some()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AnnouncementKind {
    Maintenance,
    ServerStop,
}

impl AnnouncementKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "maintenance" => Some(Self::Maintenance),
            "server_stop" => Some(Self::ServerStop),
            _ => None,
        }
    }
}

/// Outcome of one status fetch. `Unreachable` is a normal, renderable state,
/// not a fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusProbe {
    Reachable(StatusSnapshot),
    Unreachable,
}

/// Ephemeral view of one live server; never persisted, only its rendered
/// message survives a cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub name: String,
    pub players_online: u32,
    pub players_max: u32,
    pub version: String,
    pub motd: String,
    pub protocol: String,
    pub icon: Option<Vec<u8>>,
}

/// Wire shape of the status API response; only the consumed fields are
/// modelled, everything else is ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusApiResponse {
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub players: Option<StatusApiPlayers>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub motd: Option<StatusApiMotd>,
    #[serde(default)]
    pub protocol: Option<i64>,
    #[serde(default)]
    pub icon: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct StatusApiPlayers {
    #[serde(default)]
    pub online: u32,
    #[serde(default)]
    pub max: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusApiMotd {
    #[serde(default)]
    pub clean: Option<MotdText>,
}

/// The API serves the MOTD either as one string or as a list of lines.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MotdText {
    Lines(Vec<String>),
    Single(String),
}

impl MotdText {
    fn joined(&self) -> String {
        match self {
            Self::Lines(lines) => lines.join("\n"),
            Self::Single(text) => text.clone(),
        }
    }
}

/// Map a decoded status API body to a probe result for `target_address`.
pub fn probe_from_response(target_address: &str, response: StatusApiResponse) -> StatusProbe {
    if !response.online {
        return StatusProbe::Unreachable;
    }

    let players = response.players.unwrap_or_default();
    StatusProbe::Reachable(StatusSnapshot {
        name: response
            .hostname
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| target_address.to_string()),
        players_online: players.online,
        players_max: players.max,
        version: response.version.unwrap_or_else(|| "Unknown".to_string()),
        motd: response
            .motd
            .and_then(|motd| motd.clean)
            .map(|clean| clean.joined())
            .filter(|text| !text.trim().is_empty())
            .unwrap_or_else(|| "N/A".to_string()),
        protocol: response
            .protocol
            .map(|protocol| protocol.to_string())
            .unwrap_or_else(|| "Unknown".to_string()),
        icon: response.icon.as_deref().and_then(decode_icon_data_uri),
    })
}

/// Decode the API's `data:image/png;base64,...` icon into raw bytes.
pub fn decode_icon_data_uri(value: &str) -> Option<Vec<u8>> {
    if !value.starts_with("data:image") {
        return None;
    }
    let encoded = value.split_once(',')?.1;
    base64::engine::general_purpose::STANDARD.decode(encoded).ok()
}

pub fn is_valid_target_address(value: &str) -> bool {
    let re = Regex::new(r"^[A-Za-z0-9.-]+(:[0-9]+)?$").unwrap();
    re.is_match(value)
}

pub fn is_valid_duration(value: &str) -> bool {
    let re = Regex::new(r"^[0-9]+[hmHM]?$").unwrap();
    re.is_match(value)
}

/// Channel name for a freshly set-up tenant, derived from the first label of
/// the monitored address.
pub fn status_channel_name(target_address: &str) -> String {
    let first_label = target_address
        .split('.')
        .next()
        .unwrap_or(target_address)
        .split(':')
        .next()
        .unwrap_or(target_address);
    format!("mc-{}-status", first_label.to_lowercase())
}

/// Truncate to at most `max` bytes without splitting a character.
pub fn truncate_chars(value: &str, max: usize) -> &str {
    if value.len() <= max {
        return value;
    }
    let mut end = max;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

impl EmbedField {
    fn inline(name: &str, value: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            value: value.into(),
            inline: true,
        }
    }

    fn block(name: &str, value: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            value: value.into(),
            inline: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmbedSpec {
    pub title: String,
    pub description: Option<String>,
    pub color: u32,
    pub fields: Vec<EmbedField>,
    pub footer: Option<String>,
    pub thumbnail_url: Option<String>,
    pub timestamp: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkButton {
    pub label: String,
    pub url: String,
    pub emoji: Option<char>,
}

/// Platform-agnostic message payload handed to the messenger; the icon, when
/// present, is attached as [`STATUS_ICON_FILENAME`] and referenced by the
/// embed thumbnail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMessage {
    pub embed: EmbedSpec,
    pub link_button: Option<LinkButton>,
    pub icon: Option<Vec<u8>>,
}

fn join_button(invite_url: &str, label: &str) -> Option<LinkButton> {
    if invite_url.trim().is_empty() {
        return None;
    }
    Some(LinkButton {
        label: label.to_string(),
        url: invite_url.to_string(),
        emoji: Some('🌐'),
    })
}

/// Render one poll outcome as the canonical status card.
pub fn compose_status_message(
    target_address: &str,
    probe: &StatusProbe,
    invite_url: &str,
) -> StatusMessage {
    match probe {
        StatusProbe::Unreachable => StatusMessage {
            embed: EmbedSpec {
                title: "🔴 Server Offline".to_string(),
                description: Some(format!("**{target_address}** is currently offline.")),
                color: COLOR_OFFLINE,
                fields: Vec::new(),
                footer: Some("Last Updated".to_string()),
                thumbnail_url: None,
                timestamp: true,
            },
            link_button: join_button(invite_url, "Join Community"),
            icon: None,
        },
        StatusProbe::Reachable(snapshot) => {
            let thumbnail_url = snapshot
                .icon
                .as_ref()
                .map(|_| format!("attachment://{STATUS_ICON_FILENAME}"));
            StatusMessage {
                embed: EmbedSpec {
                    title: format!("🟢 {}", snapshot.name),
                    description: Some(format!(
                        "**IP**: `{target_address}`\n**MOTD**:\n{}",
                        truncate_chars(&snapshot.motd, MAX_MOTD_CHARS)
                    )),
                    color: COLOR_ONLINE,
                    fields: vec![
                        EmbedField::inline("📊 Status", "Online"),
                        EmbedField::inline(
                            "👥 Players",
                            format!("{}/{}", snapshot.players_online, snapshot.players_max),
                        ),
                        EmbedField::inline("📦 Version", snapshot.version.clone()),
                        EmbedField::inline("🔗 Protocol", snapshot.protocol.clone()),
                    ],
                    footer: Some("Last Updated".to_string()),
                    thumbnail_url,
                    timestamp: true,
                },
                link_button: join_button(invite_url, "Join Server"),
                icon: snapshot.icon.clone(),
            }
        }
    }
}

/// Render a one-off operator announcement; never tracked as the status card.
pub fn compose_announcement(
    target_address: &str,
    kind: AnnouncementKind,
    duration: &str,
    announced_by: &str,
    invite_url: &str,
) -> StatusMessage {
    let embed = match kind {
        AnnouncementKind::Maintenance => EmbedSpec {
            title: "🛠️ Scheduled Maintenance".to_string(),
            description: Some(format!(
                "**{target_address}** is undergoing scheduled maintenance to improve your experience."
            )),
            color: COLOR_MAINTENANCE,
            fields: vec![
                EmbedField::inline("⏰ Estimated Duration", duration),
                EmbedField::inline("📢 Status", "Maintenance in Progress"),
                EmbedField::block(
                    "ℹ️ Details",
                    "We're upgrading the server to ensure optimal performance. Join our community for updates!",
                ),
            ],
            footer: Some(format!("Announced by {announced_by}")),
            thumbnail_url: Some(MAINTENANCE_THUMBNAIL_URL.to_string()),
            timestamp: true,
        },
        AnnouncementKind::ServerStop => EmbedSpec {
            title: "🟥 Server Offline".to_string(),
            description: Some(format!(
                "**{target_address}** is currently offline for scheduled downtime."
            )),
            color: COLOR_OFFLINE,
            fields: vec![
                EmbedField::inline("⏰ Estimated Uptime", duration),
                EmbedField::inline("📢 Status", "Server Stopped"),
                EmbedField::block(
                    "ℹ️ Details",
                    "The server is down temporarily. Stay tuned for updates in our community!",
                ),
            ],
            footer: Some(format!("Announced by {announced_by}")),
            thumbnail_url: Some(SERVER_STOP_THUMBNAIL_URL.to_string()),
            timestamp: true,
        },
    };

    StatusMessage {
        embed,
        link_button: join_button(invite_url, "Join Community"),
        icon: None,
    }
}

/// Plain-text liveness reply for the `ping` command.
pub fn format_ping_reply(gateway_ms: Option<u64>, reference_host: &str, reference_ms: Option<u64>) -> String {
    let gateway = gateway_ms
        .map(|ms| format!("{ms}ms"))
        .unwrap_or_else(|| "N/A".to_string());
    let reference = reference_ms
        .map(|ms| format!("{ms}ms"))
        .unwrap_or_else(|| "N/A".to_string());
    format!("🏓 Bot Ping: {gateway} · {reference_host}: {reference}")
}

/// Render the per-guild permission table for the `perm_list` reply.
pub fn render_permission_table(table: &BTreeMap<String, BTreeSet<String>>) -> String {
    if table.is_empty() {
        return "🔐 **Command Permissions**\nNo permissions set.".to_string();
    }

    let mut lines = vec!["🔐 **Command Permissions**".to_string()];
    for (command, roles) in table {
        let mentions: Vec<String> = roles.iter().map(|role| format!("<@&{role}>")).collect();
        // A restricted command whose list has been emptied admits nobody.
        let rendered = if mentions.is_empty() {
            "None".to_string()
        } else {
            mentions.join(", ")
        };
        lines.push(format!("**/{command}**: {rendered}"));
    }
    lines.join("\n")
}

// ---------------------------------------------------------------------------
// Control-plane wire types (camelCase, consumed by the dashboard)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupRequest {
    pub tenant_id: String,
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantRequest {
    pub tenant_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnounceRequest {
    pub tenant_id: String,
    pub kind: AnnouncementKind,
    pub duration: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlAck {
    pub ok: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_address_validation_accepts_host_and_port() {
        assert!(is_valid_target_address("play.example.com"));
        assert!(is_valid_target_address("play.example.com:25565"));
        assert!(is_valid_target_address("192.168.0.10:25565"));
    }

    #[test]
    fn target_address_validation_rejects_garbage() {
        assert!(!is_valid_target_address("not a host"));
        assert!(!is_valid_target_address(""));
        assert!(!is_valid_target_address("play.example.com:25565/extra"));
        assert!(!is_valid_target_address("host:port"));
    }

    #[test]
    fn duration_validation_accepts_number_plus_unit() {
        assert!(is_valid_duration("45m"));
        assert!(is_valid_duration("1h"));
        assert!(is_valid_duration("30"));
        assert!(is_valid_duration("2H"));
    }

    #[test]
    fn duration_validation_rejects_words() {
        assert!(!is_valid_duration("soon"));
        assert!(!is_valid_duration("45 m"));
        assert!(!is_valid_duration("m45"));
        assert!(!is_valid_duration(""));
    }

    #[test]
    fn status_channel_name_uses_first_label() {
        assert_eq!(status_channel_name("play.example.com"), "mc-play-status");
        assert_eq!(status_channel_name("Hypixel.net:25565"), "mc-hypixel-status");
        assert_eq!(status_channel_name("localhost:25565"), "mc-localhost-status");
    }

    #[test]
    fn probe_maps_offline_response_to_unreachable() {
        let response: StatusApiResponse = serde_json::from_value(serde_json::json!({
            "online": false
        }))
        .unwrap();
        assert_eq!(probe_from_response("play.example.com", response), StatusProbe::Unreachable);
    }

    #[test]
    fn probe_maps_online_response_fields() {
        let response: StatusApiResponse = serde_json::from_value(serde_json::json!({
            "online": true,
            "hostname": "play.example.com",
            "players": {"online": 12, "max": 100},
            "version": "1.21",
            "protocol": 767,
            "motd": {"clean": ["Welcome", "Have fun"]}
        }))
        .unwrap();

        let StatusProbe::Reachable(snapshot) = probe_from_response("play.example.com", response)
        else {
            panic!("expected reachable probe");
        };
        assert_eq!(snapshot.name, "play.example.com");
        assert_eq!(snapshot.players_online, 12);
        assert_eq!(snapshot.players_max, 100);
        assert_eq!(snapshot.version, "1.21");
        assert_eq!(snapshot.protocol, "767");
        assert_eq!(snapshot.motd, "Welcome\nHave fun");
        assert!(snapshot.icon.is_none());
    }

    #[test]
    fn probe_defaults_missing_fields() {
        let response: StatusApiResponse =
            serde_json::from_value(serde_json::json!({"online": true})).unwrap();

        let StatusProbe::Reachable(snapshot) = probe_from_response("mc.example.net", response)
        else {
            panic!("expected reachable probe");
        };
        assert_eq!(snapshot.name, "mc.example.net");
        assert_eq!(snapshot.version, "Unknown");
        assert_eq!(snapshot.protocol, "Unknown");
        assert_eq!(snapshot.motd, "N/A");
        assert_eq!(snapshot.players_online, 0);
    }

    #[test]
    fn probe_accepts_single_string_motd() {
        let response: StatusApiResponse = serde_json::from_value(serde_json::json!({
            "online": true,
            "motd": {"clean": "one line"}
        }))
        .unwrap();

        let StatusProbe::Reachable(snapshot) = probe_from_response("mc.example.net", response)
        else {
            panic!("expected reachable probe");
        };
        assert_eq!(snapshot.motd, "one line");
    }

    #[test]
    fn icon_data_uri_decodes_to_bytes() {
        // "craft" base64-encoded.
        let decoded = decode_icon_data_uri("data:image/png;base64,Y3JhZnQ=").unwrap();
        assert_eq!(decoded, b"craft");
    }

    #[test]
    fn icon_decode_rejects_non_image_uris() {
        assert!(decode_icon_data_uri("Y3JhZnQ=").is_none());
        assert!(decode_icon_data_uri("data:image/png;base64,!!!").is_none());
    }

    #[test]
    fn truncate_chars_respects_char_boundaries() {
        assert_eq!(truncate_chars("abcdef", 4), "abcd");
        assert_eq!(truncate_chars("ab", 4), "ab");
        // Multi-byte character straddling the limit is dropped whole.
        assert_eq!(truncate_chars("aé", 2), "a");
    }

    #[test]
    fn online_status_message_carries_server_card() {
        let probe = StatusProbe::Reachable(StatusSnapshot {
            name: "Example SMP".to_string(),
            players_online: 3,
            players_max: 20,
            version: "1.21".to_string(),
            motd: "Welcome".to_string(),
            protocol: "767".to_string(),
            icon: Some(vec![1, 2, 3]),
        });

        let message = compose_status_message("play.example.com", &probe, "https://discord.gg/example");
        assert_eq!(message.embed.title, "🟢 Example SMP");
        assert_eq!(message.embed.color, COLOR_ONLINE);
        assert_eq!(message.embed.fields.len(), 4);
        assert_eq!(message.embed.fields[1].value, "3/20");
        assert_eq!(
            message.embed.thumbnail_url.as_deref(),
            Some("attachment://server-icon.png")
        );
        assert_eq!(message.icon, Some(vec![1, 2, 3]));
        assert_eq!(message.link_button.as_ref().unwrap().label, "Join Server");
    }

    #[test]
    fn offline_status_message_is_red_and_iconless() {
        let message =
            compose_status_message("play.example.com", &StatusProbe::Unreachable, "https://discord.gg/example");
        assert_eq!(message.embed.title, "🔴 Server Offline");
        assert_eq!(message.embed.color, COLOR_OFFLINE);
        assert!(message.icon.is_none());
        assert!(message.embed.fields.is_empty());
    }

    #[test]
    fn maintenance_announcement_carries_duration() {
        let message = compose_announcement(
            "play.example.com",
            AnnouncementKind::Maintenance,
            "45m",
            "Dashboard",
            "https://discord.gg/example",
        );
        assert_eq!(message.embed.title, "🛠️ Scheduled Maintenance");
        assert_eq!(message.embed.color, COLOR_MAINTENANCE);
        assert_eq!(message.embed.fields[0].value, "45m");
        assert_eq!(message.embed.footer.as_deref(), Some("Announced by Dashboard"));
        assert_eq!(
            message.embed.thumbnail_url.as_deref(),
            Some(MAINTENANCE_THUMBNAIL_URL)
        );
    }

    #[test]
    fn server_stop_announcement_is_red() {
        let message = compose_announcement(
            "play.example.com",
            AnnouncementKind::ServerStop,
            "1h",
            "ops",
            "",
        );
        assert_eq!(message.embed.title, "🟥 Server Offline");
        assert_eq!(message.embed.color, COLOR_OFFLINE);
        assert!(message.link_button.is_none());
        assert_eq!(
            message.embed.thumbnail_url.as_deref(),
            Some(SERVER_STOP_THUMBNAIL_URL)
        );
    }

    #[test]
    fn ping_reply_renders_missing_latencies_as_unavailable() {
        assert_eq!(
            format_ping_reply(Some(42), "8.8.8.8:53", None),
            "🏓 Bot Ping: 42ms · 8.8.8.8:53: N/A"
        );
        assert_eq!(
            format_ping_reply(None, "8.8.8.8:53", Some(12)),
            "🏓 Bot Ping: N/A · 8.8.8.8:53: 12ms"
        );
    }

    #[test]
    fn permission_table_lists_role_mentions_per_command() {
        let mut table = BTreeMap::new();
        table.insert(
            "setup".to_string(),
            BTreeSet::from(["111".to_string(), "222".to_string()]),
        );
        let rendered = render_permission_table(&table);
        assert!(rendered.contains("**/setup**: <@&111>, <@&222>"));
    }

    #[test]
    fn permission_table_marks_emptied_entries_as_locked() {
        let mut table = BTreeMap::new();
        table.insert("announce".to_string(), BTreeSet::new());
        let rendered = render_permission_table(&table);
        assert!(rendered.contains("**/announce**: None"));
    }

    #[test]
    fn empty_permission_table_says_so() {
        let rendered = render_permission_table(&BTreeMap::new());
        assert!(rendered.contains("No permissions set."));
    }

    #[test]
    fn announcement_kind_parses_wire_values() {
        assert_eq!(AnnouncementKind::parse("maintenance"), Some(AnnouncementKind::Maintenance));
        assert_eq!(AnnouncementKind::parse("server_stop"), Some(AnnouncementKind::ServerStop));
        assert_eq!(AnnouncementKind::parse("party"), None);
    }

    #[test]
    fn announce_request_uses_camel_case_wire_fields() {
        let request: AnnounceRequest = serde_json::from_value(serde_json::json!({
            "tenantId": "guild-1",
            "kind": "maintenance",
            "duration": "45m"
        }))
        .unwrap();
        assert_eq!(request.tenant_id, "guild-1");
        assert_eq!(request.kind, AnnouncementKind::Maintenance);
    }

    #[test]
    fn unconfigured_record_is_not_pollable() {
        let mut record = TenantRecord::new("guild-1");
        record.monitoring_enabled = true;
        assert!(!record.is_pollable());

        record.target_address = Some("play.example.com".to_string());
        assert!(!record.is_pollable());

        record.display_channel_id = Some(42);
        assert!(record.is_pollable());

        record.monitoring_enabled = false;
        assert!(!record.is_pollable());
    }
}
