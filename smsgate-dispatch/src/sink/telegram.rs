use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use smsgate_core::Event;
use tracing::{debug, info};

use super::{EventSink, SinkError};
use crate::config::TelegramConfig;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S UTC";

/// Posts events to a Telegram chat through the Bot API.
pub struct TelegramSink {
    http: reqwest::Client,
    api_base: String,
    bot_token: String,
    chat_id: String,
}

#[derive(Debug, Deserialize)]
struct ApiReply {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    result: Option<serde_json::Value>,
}

impl TelegramSink {
    pub fn new(config: &TelegramConfig) -> Result<Self, SinkError> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;

        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            bot_token: config.bot_token.clone(),
            chat_id: config.chat_id.clone(),
        })
    }

    /// Check the bot token with `getMe`, returning the bot's username.
    pub async fn verify(&self) -> Result<String, SinkError> {
        let response = self.http.get(self.endpoint("getMe")).send().await?;
        let reply = read_reply(response).await?;

        let username = reply
            .result
            .as_ref()
            .and_then(|bot| bot.get("username"))
            .and_then(|name| name.as_str())
            .unwrap_or_default()
            .to_string();
        info!(bot = %username, "telegram bot verified");
        Ok(username)
    }

    async fn send(&self, text: &str) -> Result<(), SinkError> {
        let body = json!({
            "chat_id": self.chat_id,
            "text": text,
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });

        let response = self
            .http
            .post(self.endpoint("sendMessage"))
            .json(&body)
            .send()
            .await?;
        read_reply(response).await?;
        debug!("telegram message sent");
        Ok(())
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_base, self.bot_token)
    }
}

async fn read_reply(response: reqwest::Response) -> Result<ApiReply, SinkError> {
    let status = response.status();
    let reply: Option<ApiReply> = response.json().await.ok();

    match reply {
        Some(reply) if status.is_success() && reply.ok => Ok(reply),
        Some(reply) => Err(SinkError::Rejected(
            reply
                .description
                .unwrap_or_else(|| format!("status {status}")),
        )),
        None => Err(SinkError::Rejected(format!("status {status}"))),
    }
}

#[async_trait]
impl EventSink for TelegramSink {
    async fn publish(&self, event: &Event) -> Result<(), SinkError> {
        self.send(&format_event(event)).await
    }

    async fn announce(&self, text: &str) -> Result<(), SinkError> {
        self.send(&escape_html(text)).await
    }
}

/// Render an event as a Telegram HTML message.
pub fn format_event(event: &Event) -> String {
    match event {
        Event::Sms(sms) => {
            let mut text = format!(
                "📱 <b>New SMS Received</b>\n\n\
                 <b>Device:</b> {}\n\
                 <b>From:</b> <code>{}</code>\n\
                 <b>Date:</b> {}\n",
                escape_html(&sms.device),
                escape_html(&sms.sender_number),
                sms.timestamp.strftime(TIME_FORMAT),
            );
            if let Some(part) = sms.part {
                text.push_str(&format!("<b>Part:</b> {}/{}\n", part.sequence, part.total));
            }
            text.push_str(&format!("\n<b>Message:</b>\n{}", escape_html(&sms.body)));
            text
        }
        Event::Call(call) => format!(
            "📞 <b>Incoming Call</b>\n\n\
             <b>Device:</b> {}\n\
             <b>From:</b> <code>{}</code>\n\
             <b>Status:</b> {}\n\
             <b>Type:</b> {}\n\
             <b>Time:</b> {}",
            escape_html(&call.device),
            escape_html(&call.caller_number),
            call.direction.as_str(),
            call.call_type.as_str(),
            call.timestamp.strftime(TIME_FORMAT),
        ),
    }
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}
