//! Wake-up trigger engine.
//!
//! Subscribes to channel events, maps each posted message to the set of
//! agents that should be woken, and dispatches gateway calls for them on
//! detached tasks. A per-(agent, channel) cooldown gate keeps chatter from
//! turning into a wake-up storm. All channel events are re-broadcast to the
//! websocket stream so dashboards refresh without polling.

use crate::channels::ChannelMessage;
use crate::gateway::AgentCall;
use crate::{now_ms, ChannelEvent, CompanyDeps, EpochMillis};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio_util::task::TaskTracker;

/// How many recent messages the wake-up prompt quotes.
const TRANSCRIPT_LIMIT: i64 = 15;

/// Cooldown pruner cadence.
const PRUNE_INTERVAL: Duration = Duration::from_secs(30);

/// Per-(agent, channel) wake-up rate gate. Entries are never persisted; the
/// map rebuilds from nothing after a restart.
#[derive(Debug)]
pub struct CooldownGate {
    window_ms: i64,
    entries: Mutex<HashMap<(String, String), EpochMillis>>,
}

impl CooldownGate {
    pub fn new(window_ms: i64) -> Self {
        Self {
            window_ms,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Check-and-record in one step: returns `true` and stamps the gate when
    /// the wake-up may fire, `false` when the window is still closed.
    pub fn pass(&self, agent_id: &str, channel_id: &str, now: EpochMillis) -> bool {
        let mut entries = self.entries.lock().expect("cooldown lock poisoned");
        let key = (agent_id.to_string(), channel_id.to_string());
        if let Some(last) = entries.get(&key) {
            if now - last < self.window_ms {
                return false;
            }
        }
        entries.insert(key, now);
        true
    }

    /// Drop entries older than twice the window.
    pub fn prune(&self, now: EpochMillis) {
        let horizon = self.window_ms * 2;
        let mut entries = self.entries.lock().expect("cooldown lock poisoned");
        entries.retain(|_, last| now - *last <= horizon);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().expect("cooldown lock poisoned").len()
    }
}

pub struct TriggerEngine {
    deps: CompanyDeps,
    gate: CooldownGate,
    tracker: TaskTracker,
}

impl TriggerEngine {
    pub fn new(deps: CompanyDeps) -> Self {
        let gate = CooldownGate::new(deps.config.trigger_cooldown_ms);
        Self {
            deps,
            gate,
            tracker: TaskTracker::new(),
        }
    }

    /// Start the event loop and the cooldown pruner. Both stop when the
    /// shutdown flag flips.
    pub fn start(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let events = self.deps.channel_store.subscribe();

        let engine = self.clone();
        let mut loop_shutdown = shutdown.clone();
        let event_loop = tokio::spawn(async move {
            let mut events = events;
            loop {
                tokio::select! {
                    _ = async { let _ = loop_shutdown.wait_for(|stop| *stop).await; } => break,
                    event = events.recv() => match event {
                        Ok(event) => {
                            engine.handle_event(event).await;
                        }
                        Err(broadcast::error::RecvError::Lagged(count)) => {
                            tracing::warn!(count, "trigger engine lagged behind channel events");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            tracing::debug!("trigger engine event loop stopped");
        });

        let engine = self.clone();
        let mut prune_shutdown = shutdown;
        let pruner = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = async { let _ = prune_shutdown.wait_for(|stop| *stop).await; } => break,
                    _ = ticker.tick() => engine.gate.prune(now_ms()),
                }
            }
            tracing::debug!("cooldown pruner stopped");
        });

        vec![event_loop, pruner]
    }

    /// Stop accepting new dispatches and wait out in-flight gateway calls,
    /// up to the grace period.
    pub async fn drain(&self, grace: Duration) {
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                grace_secs = grace.as_secs(),
                "gateway calls still in flight at shutdown, abandoning"
            );
        }
    }

    pub async fn handle_event(&self, event: ChannelEvent) {
        // Dashboards see every channel event, not just messages.
        self.deps
            .broadcaster
            .broadcast(event.kind(), event.payload());

        if let ChannelEvent::Message {
            message,
            channel_name,
        } = event
        {
            self.wake_recipients(&message, &channel_name).await;
        }
    }

    /// Resolve recipients for a posted message and dispatch a gateway call
    /// for each, without awaiting any of them.
    async fn wake_recipients(
        &self,
        message: &ChannelMessage,
        channel_name: &str,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let members = match self.deps.channel_store.get_members(&message.channel_id).await {
            Ok(members) => members,
            Err(error) => {
                tracing::error!(
                    %error,
                    channel_id = %message.channel_id,
                    "failed to resolve members for wake-up"
                );
                return Vec::new();
            }
        };

        let recipients: Vec<String> = members
            .into_iter()
            .map(|member| member.member_id)
            .filter(|id| *id != message.sender_id && self.deps.config.is_agent(id))
            .collect();
        if recipients.is_empty() {
            return Vec::new();
        }

        let prompt = match self.build_prompt(message, channel_name).await {
            Ok(prompt) => prompt,
            Err(error) => {
                tracing::error!(%error, channel = channel_name, "failed to build wake-up prompt");
                return Vec::new();
            }
        };

        let now = now_ms();
        let mut handles = Vec::new();
        for agent_id in recipients {
            if !self.gate.pass(&agent_id, &message.channel_id, now) {
                tracing::debug!(
                    agent_id = %agent_id,
                    channel = %channel_name,
                    "wake-up suppressed by cooldown"
                );
                continue;
            }

            let session_key = format!(
                "agent:{}:webchat:channel:{}",
                agent_id, message.channel_id
            );
            let call = AgentCall::new(session_key, prompt.clone());
            let gateway = self.deps.gateway.clone();
            let channel = channel_name.to_string();

            tracing::info!(
                agent_id = %agent_id,
                channel = %channel,
                idempotency_key = %call.idempotency_key,
                "waking agent"
            );

            // Fire-and-forget: the post is already durable, the wake-up is
            // best-effort.
            handles.push(self.tracker.spawn(async move {
                if let Err(error) = gateway.agent(call).await {
                    tracing::warn!(%error, agent_id, channel, "agent wake-up failed");
                }
            }));
        }
        handles
    }

    async fn build_prompt(&self, message: &ChannelMessage, channel_name: &str) -> crate::Result<String> {
        let recent = self
            .deps
            .channel_store
            .get_messages(
                &message.channel_id,
                crate::channels::MessageQuery {
                    limit: Some(TRANSCRIPT_LIMIT),
                    ..Default::default()
                },
            )
            .await?;

        let mut prompt = format!(
            "New message in #{} from {}:\n\n> {}\n",
            channel_name, message.sender_id, message.body
        );
        prompt.push_str(&format!("\nRecent messages in #{channel_name}:\n"));
        for entry in &recent {
            prompt.push_str(&format!("[{}]: {}\n", entry.sender_id, entry.body));
        }
        prompt.push_str(
            "\nReply in the channel with the company.channels.post operation. \
             Use company.channels.history if you need more context. \
             If you have nothing to add, reply with exactly PASS.",
        );
        Ok(prompt)
    }
}
