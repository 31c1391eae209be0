//! Helper-agent fabric.
//!
//! A bounded pool of ephemeral sub-sessions the main session delegates work
//! to. Each helper has its own in-memory conversation (never persisted), a
//! templated system prompt, the terminal tool only, and a worker that drains
//! its inbox serially. Replies flow back two ways: resolved to the caller,
//! and queued for injection into the parent log as tool messages named after
//! the helper — injected only while the parent sits idle.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use aegis_core::AegisConfig;
use aegis_llm::LlmClient;
use aegis_store::Store;
use aegis_vm::Sandbox;

use crate::session::{ChatSession, SessionParams};

struct HelperJob {
    message: String,
    reply: oneshot::Sender<String>,
    /// Queue the reply for injection into the parent log as well.
    enqueue: bool,
}

struct Helper {
    inbox: mpsc::UnboundedSender<HelperJob>,
    worker: tokio::task::JoinHandle<()>,
    session: Arc<ChatSession>,
}

/// Replies waiting to be flushed into the parent log: (helper name, text).
pub type ReplyQueue = Arc<Mutex<VecDeque<(String, String)>>>;

pub struct HelperFabric {
    config: Arc<AegisConfig>,
    store: Arc<Store>,
    llm: Arc<dyn LlmClient>,
    sandbox: Arc<Sandbox>,
    username: String,
    parent_session: String,
    replies: ReplyQueue,
    /// Non-owning backref used to flush replies when the parent is idle.
    parent: Mutex<Weak<ChatSession>>,
    agents: tokio::sync::Mutex<HashMap<String, Helper>>,
    max_agents: usize,
}

impl HelperFabric {
    pub fn new(
        config: Arc<AegisConfig>,
        store: Arc<Store>,
        llm: Arc<dyn LlmClient>,
        sandbox: Arc<Sandbox>,
        username: String,
        parent_session: String,
        replies: ReplyQueue,
    ) -> Self {
        let max_agents = config.session.max_mini_agents;
        Self {
            config,
            store,
            llm,
            sandbox,
            username,
            parent_session,
            replies,
            parent: Mutex::new(Weak::new()),
            agents: tokio::sync::Mutex::new(HashMap::new()),
            max_agents,
        }
    }

    /// Attach the parent session once it exists. Weak: helpers never keep
    /// their parent alive.
    pub fn bind_parent(&self, parent: &Arc<ChatSession>) {
        *self.parent.lock().unwrap() = Arc::downgrade(parent);
    }

    pub async fn count(&self) -> usize {
        self.agents.lock().await.len()
    }

    pub async fn names(&self) -> Vec<String> {
        self.agents.lock().await.keys().cloned().collect()
    }

    /// Handle to a helper's private sub-session, for host-side inspection.
    pub async fn session(&self, name: &str) -> Option<Arc<ChatSession>> {
        self.agents
            .lock()
            .await
            .get(name)
            .map(|h| Arc::clone(&h.session))
    }

    /// Create a helper. Fails when the name is taken or the pool is full;
    /// neither failure leaves any state behind.
    pub async fn spawn(
        &self,
        name: &str,
        details: &str,
        context: &str,
    ) -> std::result::Result<(), String> {
        let mut agents = self.agents.lock().await;
        if agents.contains_key(name) {
            return Err(format!("Agent '{name}' already exists"));
        }
        if agents.len() >= self.max_agents {
            return Err("Agent limit reached".to_string());
        }

        let prompt = self
            .config
            .session
            .mini_agent_prompt
            .replace("{name}", name)
            .replace("{details}", details)
            .replace("{context}", context);

        let session = ChatSession::open(SessionParams {
            config: Arc::clone(&self.config),
            store: Arc::clone(&self.store),
            llm: Arc::clone(&self.llm),
            sandbox: Arc::clone(&self.sandbox),
            registry: None,
            username: self.username.clone(),
            session_name: format!("{}-{name}", self.parent_session),
            think: false,
            persist: false,
            system_prompt: Some(prompt),
            helper_tools_only: true,
            background_tasks: false,
            extra_tools: Vec::new(),
        })
        .map_err(|e| format!("Failed to create agent '{name}': {e}"))?;

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(helper_worker(
            name.to_string(),
            Arc::clone(&session),
            inbox_rx,
            Arc::clone(&self.replies),
            self.parent.lock().unwrap().clone(),
        ));

        agents.insert(
            name.to_string(),
            Helper {
                inbox: inbox_tx,
                worker,
                session,
            },
        );
        info!(helper = name, "helper agent spawned");
        Ok(())
    }

    /// Send `message` to helper `name` and wait for its reply. With
    /// `enqueue`, the reply is also queued for the parent log.
    pub async fn send(
        &self,
        name: &str,
        message: &str,
        enqueue: bool,
    ) -> std::result::Result<String, String> {
        let inbox = {
            let agents = self.agents.lock().await;
            let Some(helper) = agents.get(name) else {
                return Err(format!("No agent named '{name}'"));
            };
            helper.inbox.clone()
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        inbox
            .send(HelperJob {
                message: message.to_string(),
                reply: reply_tx,
                enqueue,
            })
            .map_err(|_| format!("Agent '{name}' is no longer running"))?;

        reply_rx
            .await
            .map_err(|_| format!("Agent '{name}' did not reply"))
    }

    /// Remove one helper, cancelling its worker.
    pub async fn reclaim(&self, name: &str) -> bool {
        let Some(helper) = self.agents.lock().await.remove(name) else {
            return false;
        };
        helper.worker.abort();
        helper.session.close().await;
        debug!(helper = name, "helper agent reclaimed");
        true
    }

    /// Stop and drop every helper. Parent-exit path.
    pub async fn shutdown(&self) {
        let mut agents = self.agents.lock().await;
        for (name, helper) in agents.drain() {
            helper.worker.abort();
            helper.session.close().await;
            debug!(helper = %name, "helper agent stopped");
        }
    }
}

/// Per-helper worker: drains the inbox serially. Each message lands in the
/// helper's log as a tool message from "senior", then the helper runs one
/// turn and the streamed text becomes the reply.
async fn helper_worker(
    name: String,
    session: Arc<ChatSession>,
    mut inbox: mpsc::UnboundedReceiver<HelperJob>,
    replies: ReplyQueue,
    parent: Weak<ChatSession>,
) {
    while let Some(job) = inbox.recv().await {
        if let Err(e) = session.append_tool_message("senior", &job.message).await {
            warn!(helper = %name, "failed to record senior message: {e}");
            let _ = job.reply.send(format!("Error: {e}"));
            continue;
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let result = session.continue_stream(&tx).await;
        drop(tx);
        let text = crate::events::drain_text(&mut rx).join("\n");

        if let Err(e) = result {
            warn!(helper = %name, "helper turn failed: {e}");
            let _ = job.reply.send(format!("Error: {e}"));
            continue;
        }

        if job.enqueue && !text.trim().is_empty() {
            replies
                .lock()
                .unwrap()
                .push_back((name.clone(), text.clone()));
        }
        let _ = job.reply.send(text);

        // Inject queued replies now if the parent happens to be idle;
        // otherwise the parent picks them up at its next idle point.
        if let Some(parent) = parent.upgrade() {
            parent.flush_helper_replies().await;
        }
    }
}
