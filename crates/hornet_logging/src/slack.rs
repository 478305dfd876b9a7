//! Slack notification sink.
//!
//! A `tracing` layer buffers formatted records per channel; a flusher
//! thread posts each non-empty buffer once per second to the Slack web
//! API. Alerts (ERROR) and notices (WARN plus events on the `notice`
//! target) go to separately configured channels. The sink is a logging
//! side-channel: if it fails repeatedly it shuts itself down and the
//! process carries on.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Deserialize;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::NOTICE_TARGET;

const SLACK_API_URL: &str = "https://slack.com/api/chat.postMessage";
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);
const MAX_ERRORS: u32 = 10;
/// Per-channel cap; a stalled flusher must not grow the buffers without
/// bound.
const MAX_BUFFER_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone)]
pub struct SlackConfig {
    pub token: String,
    pub username: String,
    pub alerts_channel: String,
    pub notices_channel: String,
}

/// Channel name -> pending text. Shared between the layer and the
/// flusher.
#[derive(Clone, Default)]
pub struct MessageBuffers {
    inner: Arc<Mutex<HashMap<String, String>>>,
}

impl MessageBuffers {
    fn append(&self, channel: &str, line: &str) {
        let mut buffers = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let buffer = buffers.entry(channel.to_string()).or_default();
        if buffer.len() + line.len() > MAX_BUFFER_BYTES {
            return;
        }
        if !buffer.is_empty() {
            buffer.push('\n');
        }
        buffer.push_str(line);
    }

    fn drain(&self) -> Vec<(String, String)> {
        let mut buffers = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        buffers
            .iter_mut()
            .filter(|(_, text)| !text.is_empty())
            .map(|(channel, text)| (channel.clone(), std::mem::take(text)))
            .collect()
    }

    #[cfg(test)]
    pub fn snapshot(&self) -> HashMap<String, String> {
        self.inner.lock().unwrap().clone()
    }
}

/// Routes log records into the per-channel buffers.
pub struct SlackLayer {
    buffers: MessageBuffers,
    alerts_channel: String,
    notices_channel: String,
}

impl SlackLayer {
    pub fn new(config: &SlackConfig) -> SlackLayer {
        SlackLayer {
            buffers: MessageBuffers::default(),
            alerts_channel: config.alerts_channel.clone(),
            notices_channel: config.notices_channel.clone(),
        }
    }

    pub fn buffers(&self) -> MessageBuffers {
        self.buffers.clone()
    }
}

impl<S: Subscriber> Layer<S> for SlackLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        let channel = if level == Level::ERROR {
            &self.alerts_channel
        } else if level == Level::WARN || event.metadata().target() == NOTICE_TARGET {
            &self.notices_channel
        } else {
            return;
        };
        if channel.is_empty() {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let line = format!("{} > {}", level, visitor.message);
        self.buffers.append(channel, &line);
    }
}

/// Extracts the `message` field of an event.
#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        }
    }
}

/// Handle over the flusher thread.
pub struct SlackSink {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl SlackSink {
    /// Ask the flusher to stop and wait for it.
    pub fn shutdown(self) {
        self.stop.store(true, Ordering::Relaxed);
        let _ = self.handle.join();
    }
}

/// Spawn the flusher thread for a set of buffers.
pub fn spawn_flusher(config: SlackConfig, buffers: MessageBuffers) -> SlackSink {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stop);
    let handle = thread::spawn(move || flusher_loop(config, buffers, stop_flag));
    SlackSink { stop, handle }
}

fn flusher_loop(config: SlackConfig, buffers: MessageBuffers, stop: Arc<AtomicBool>) {
    let client = reqwest::blocking::Client::new();
    let hostname = whoami::fallible::hostname().unwrap_or_else(|_| "unknown".to_string());
    let mut error_count: u32 = 0;

    while !stop.load(Ordering::Relaxed) {
        thread::sleep(FLUSH_INTERVAL);
        for (channel, text) in buffers.drain() {
            if let Err(err) = post_message(&client, &config, &hostname, &channel, &text) {
                error_count += 1;
                tracing::debug!("Slack post to {channel} failed: {err}");
                if error_count >= MAX_ERRORS {
                    tracing::error!("Maximum number of Slack errors reached; stopping the Slack sink");
                    return;
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct PostMessageResponse {
    ok: bool,
    #[serde(default)]
    error: String,
}

fn post_message(
    client: &reqwest::blocking::Client,
    config: &SlackConfig,
    hostname: &str,
    channel: &str,
    text: &str,
) -> anyhow::Result<()> {
    let message = format!("[{hostname}] {text}");
    let params = [
        ("token", config.token.as_str()),
        ("channel", channel),
        ("text", message.as_str()),
        ("username", config.username.as_str()),
        ("as_user", "true"),
    ];
    let response: PostMessageResponse = client
        .post(SLACK_API_URL)
        .form(&params)
        .send()?
        .json()?;
    if !response.ok {
        anyhow::bail!("Slack API error: {}", response.error);
    }
    Ok(())
}
