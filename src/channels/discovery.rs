//! Permission-aware channel discovery.
//!
//! Walks the guilds the token belongs to, keeps their text channels and
//! read-probes each one through [`ChannelAccessProbe`], so discovery spends
//! the same rate budget and feeds the same blacklist as the poll cycle.

use std::collections::HashSet;

use serde::Deserialize;
use tracing::{debug, info, warn};

use super::access::{ChannelAccessProbe, ProbeOutcome};
use crate::error::GatewayError;

/// Guild text and announcement channels.
const TEXT_CHANNEL_TYPES: [u8; 2] = [0, 5];

#[derive(Debug, Clone, Deserialize)]
pub struct CurrentUser {
    pub id: String,
    #[serde(default)]
    pub username: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuildSummary {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GuildChannel {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub kind: u8,
    #[serde(default)]
    pub guild_id: Option<String>,
}

impl GuildChannel {
    pub fn is_text(&self) -> bool {
        TEXT_CHANNEL_TYPES.contains(&self.kind)
    }
}

impl ChannelAccessProbe {
    /// Check the token with `GET /users/@me`. Invalid credentials come back
    /// as [`GatewayError::AuthFailed`].
    pub async fn verify_token(&self) -> Result<CurrentUser, GatewayError> {
        let user: CurrentUser = self.get_json("/users/@me").await?;
        info!(user_id = %user.id, username = %user.username, "Source token verified");
        Ok(user)
    }

    pub async fn list_guilds(&self) -> Result<Vec<GuildSummary>, GatewayError> {
        self.get_json("/users/@me/guilds").await
    }

    pub async fn list_guild_channels(
        &self,
        guild_id: &str,
    ) -> Result<Vec<GuildChannel>, GatewayError> {
        self.get_json(&format!("/guilds/{guild_id}/channels")).await
    }

    /// Text channels the token can read, in guild order.
    ///
    /// A non-empty `wanted` restricts discovery to those ids. Blacklisted
    /// channels are dropped without a request and denied ones after their
    /// probe. An inconclusive probe keeps the channel; the poll cycle checks
    /// it again. A guild whose channel list cannot be read is skipped.
    pub async fn discover_channels(
        &self,
        wanted: &[String],
    ) -> Result<Vec<GuildChannel>, GatewayError> {
        let guilds = self.list_guilds().await?;
        info!(guilds = guilds.len(), "Discovering channels");

        let mut seen = HashSet::new();
        let mut readable = Vec::new();
        for guild in &guilds {
            let channels = match self.list_guild_channels(&guild.id).await {
                Ok(channels) => channels,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(
                        guild_id = %guild.id,
                        error = %e,
                        "Skipping guild, channel list unavailable"
                    );
                    continue;
                }
            };
            debug!(
                guild_id = %guild.id,
                guild = %guild.name,
                channels = channels.len(),
                "Guild channels listed"
            );

            for mut channel in channels {
                if !channel.is_text() || (!wanted.is_empty() && !wanted.contains(&channel.id)) {
                    continue;
                }
                seen.insert(channel.id.clone());
                if self.registry().is_blacklisted(&channel.id) {
                    debug!(channel_id = %channel.id, "Skipping blacklisted channel");
                    continue;
                }
                match self.check(&channel.id).await {
                    ProbeOutcome::Denied { reason, .. } => {
                        debug!(channel_id = %channel.id, reason = %reason, "Channel not readable");
                    }
                    ProbeOutcome::Accessible(_) | ProbeOutcome::Inconclusive(_) => {
                        channel.guild_id.get_or_insert_with(|| guild.id.clone());
                        readable.push(channel);
                    }
                }
            }
        }

        for id in wanted.iter().filter(|id| !seen.contains(*id)) {
            warn!(channel_id = %id, "Configured channel not found in any guild");
        }
        info!(readable = readable.len(), "Channel discovery complete");
        Ok(readable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_text_and_announcement_channels_count() {
        let channels: Vec<GuildChannel> = serde_json::from_str(
            r#"[
                {"id": "1", "name": "general", "type": 0},
                {"id": "2", "name": "voice", "type": 2},
                {"id": "3", "name": "Info", "type": 4},
                {"id": "4", "name": "news", "type": 5, "guild_id": "g"}
            ]"#,
        )
        .unwrap();
        let text: Vec<&str> = channels
            .iter()
            .filter(|c| c.is_text())
            .map(|c| c.id.as_str())
            .collect();
        assert_eq!(text, vec!["1", "4"]);
        assert_eq!(channels[3].guild_id.as_deref(), Some("g"));
    }
}
