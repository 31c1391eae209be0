//! The per-session orchestration state machine.
//!
//! One `ChatSession` owns one conversation: its message log, prompt inbox,
//! turn state, pending notifications, helper fabric, and a reference to the
//! sandbox. A single worker task pumps the inbox FIFO; within a turn, tool
//! execution races a speculative follow-up LLM request so the model can
//! narrate while the tool runs. Whichever finishes first dictates the path;
//! both results land in the log before the next request.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use base64::Engine;
use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use aegis_core::types::VmKey;
use aegis_core::AegisConfig;
use aegis_llm::{ChatMessage, ChatRequest, ChatResponse, LlmClient, Role, ToolCall};
use aegis_store::{memory, SessionRecord, Store, UserRecord};
use aegis_vm::{ReturnWatcher, Sandbox, VmRegistry};

use crate::error::{Result, SessionError};
use crate::events::{AgentEvent, EventSender};
use crate::helpers::{HelperFabric, ReplyQueue};
use crate::history;
use crate::state::{ActiveTool, Status, TurnState};
use crate::tools::{
    execute_terminal::ExecuteTerminalTool, manage_memory::ManageMemoryTool, normalize_args,
    send_to_agent::SendToAgentTool, spawn_agent::SpawnAgentTool, Tool, ToolContext, ToolRegistry,
};

struct PromptJob {
    prompt: String,
    extra: Option<serde_json::Map<String, Value>>,
    tx: EventSender,
}

/// Construction parameters for `ChatSession::open`.
pub struct SessionParams {
    pub config: Arc<AegisConfig>,
    pub store: Arc<Store>,
    pub llm: Arc<dyn LlmClient>,
    pub sandbox: Arc<Sandbox>,
    /// When set, one registry reference is released on close.
    pub registry: Option<Arc<VmRegistry>>,
    pub username: String,
    pub session_name: String,
    pub think: bool,
    /// Persist the conversation to the store. Helper sessions run in-memory.
    pub persist: bool,
    /// Overrides the configured base system prompt.
    pub system_prompt: Option<String>,
    /// Restrict the toolset to `execute_terminal` (helper sessions).
    pub helper_tools_only: bool,
    /// Spawn the inbox worker, notification poller, and return watcher.
    pub background_tasks: bool,
    /// Additional tools registered ahead of the built-ins; a tool with a
    /// built-in's name overrides it.
    pub extra_tools: Vec<Arc<dyn Tool>>,
}

pub struct ChatSession {
    config: Arc<AegisConfig>,
    store: Arc<Store>,
    llm: Arc<dyn LlmClient>,
    sandbox: Arc<Sandbox>,
    registry: Option<(Arc<VmRegistry>, VmKey)>,

    user: UserRecord,
    session_name: String,
    conversation: Option<SessionRecord>,
    persist: bool,
    think: bool,
    base_prompt: String,

    tools: ToolRegistry,
    helpers: Option<Arc<HelperFabric>>,
    helper_replies: ReplyQueue,

    state: Mutex<TurnState>,
    log: Mutex<Vec<ChatMessage>>,

    /// Tool-role messages waiting for an idle point to enter the log.
    pending_notes: Arc<StdMutex<VecDeque<ChatMessage>>>,
    /// Frames waiting for the client-facing poller (returned files etc).
    user_notes: Arc<StdMutex<VecDeque<AgentEvent>>>,

    inbox: mpsc::UnboundedSender<PromptJob>,
    queued: AtomicUsize,
    cancel: CancellationToken,
    closed: AtomicBool,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    watcher: StdMutex<Option<Arc<ReturnWatcher>>>,
}

impl ChatSession {
    /// Build a session from explicit parts. `connect` is the common
    /// gateway-facing entry; helper sessions and tests come through here.
    pub fn open(params: SessionParams) -> Result<Arc<Self>> {
        let SessionParams {
            config,
            store,
            llm,
            sandbox,
            registry,
            username,
            session_name,
            think,
            persist,
            system_prompt,
            helper_tools_only,
            background_tasks,
            extra_tools,
        } = params;

        let user = store.get_or_create_user(&username)?;
        let conversation = if persist {
            Some(store.get_or_create_session(user.id, &session_name)?)
        } else {
            None
        };

        let log = match conversation {
            Some(ref conv) => store
                .list_messages(conv.id)?
                .iter()
                .filter_map(history::decode_record)
                .collect(),
            None => Vec::new(),
        };

        let base_prompt =
            system_prompt.unwrap_or_else(|| config.session.system_prompt.clone());

        let helper_replies: ReplyQueue = Arc::new(StdMutex::new(VecDeque::new()));

        let mut tools = ToolRegistry::new();
        for tool in extra_tools {
            tools.register(tool);
        }
        tools.register(Arc::new(ExecuteTerminalTool));
        let helpers = if helper_tools_only {
            None
        } else {
            tools.register(Arc::new(SpawnAgentTool));
            tools.register(Arc::new(SendToAgentTool));
            tools.register(Arc::new(ManageMemoryTool));
            Some(Arc::new(HelperFabric::new(
                Arc::clone(&config),
                Arc::clone(&store),
                Arc::clone(&llm),
                Arc::clone(&sandbox),
                username.clone(),
                session_name.clone(),
                Arc::clone(&helper_replies),
            )))
        };

        let registry = registry.map(|reg| {
            let key = VmKey::new(username.as_str(), session_name.as_str());
            (reg, key)
        });

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();

        let session = Arc::new(Self {
            config,
            store,
            llm,
            sandbox,
            registry,
            user,
            session_name,
            conversation,
            persist,
            think,
            base_prompt,
            tools,
            helpers,
            helper_replies,
            state: Mutex::new(TurnState::new()),
            log: Mutex::new(log),
            pending_notes: Arc::new(StdMutex::new(VecDeque::new())),
            user_notes: Arc::new(StdMutex::new(VecDeque::new())),
            inbox: inbox_tx,
            queued: AtomicUsize::new(0),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            tasks: StdMutex::new(Vec::new()),
            watcher: StdMutex::new(None),
        });

        if let Some(ref fabric) = session.helpers {
            fabric.bind_parent(&session);
        }

        if background_tasks {
            session.spawn_background_tasks(inbox_rx);
        }

        Ok(session)
    }

    /// Acquire the sandbox for (user, session) and open a full session with
    /// the standard toolset and background tasks.
    pub async fn connect(
        config: Arc<AegisConfig>,
        store: Arc<Store>,
        llm: Arc<dyn LlmClient>,
        registry: Arc<VmRegistry>,
        username: &str,
        session_name: &str,
        think: bool,
    ) -> Result<Arc<Self>> {
        let key = VmKey::new(username, session_name);
        let sandbox = registry.acquire(&key).await?;
        Self::open(SessionParams {
            config,
            store,
            llm,
            sandbox,
            registry: Some(registry),
            username: username.to_string(),
            session_name: session_name.to_string(),
            think,
            persist: true,
            system_prompt: None,
            helper_tools_only: false,
            background_tasks: true,
            extra_tools: Vec::new(),
        })
    }

    fn spawn_background_tasks(self: &Arc<Self>, inbox_rx: mpsc::UnboundedReceiver<PromptJob>) {
        let mut tasks = self.tasks.lock().unwrap();

        let worker = {
            let session = Arc::clone(self);
            tokio::spawn(async move { session.worker_loop(inbox_rx).await })
        };
        tasks.push(worker);

        let poller = {
            let session = Arc::clone(self);
            let interval =
                std::time::Duration::from_secs(self.config.session.notification_poll_interval.max(1));
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = session.cancel.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {
                            let _ = session.poll_notifications(false).await;
                        }
                    }
                }
            })
        };
        tasks.push(poller);

        // Return watcher: surfaced files become pending tool messages for the
        // agent and returned_file frames for the client poller.
        let pending = Arc::clone(&self.pending_notes);
        let user_notes = Arc::clone(&self.user_notes);
        let callback: aegis_vm::watcher::ReturnCallback = Arc::new(move |name, data| {
            let encoded = base64::engine::general_purpose::STANDARD.encode(&data);
            let payload =
                serde_json::json!({ "returned_file": name, "data": encoded }).to_string();
            pending
                .lock()
                .unwrap()
                .push_back(ChatMessage::tool("notification", payload));
            user_notes.lock().unwrap().push_back(AgentEvent::ReturnedFile {
                name: name.to_string(),
                data,
            });
            Ok(())
        });
        let watcher = Arc::new(ReturnWatcher::new(
            self.sandbox.return_queue_dir(),
            self.sandbox.return_dir(),
            self.config.session.notification_poll_interval.max(1),
            callback,
        ));
        watcher.start();
        *self.watcher.lock().unwrap() = Some(watcher);
    }

    // -----------------------------------------------------------------------
    // Public surface
    // -----------------------------------------------------------------------

    pub fn username(&self) -> &str {
        &self.user.username
    }

    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    pub fn sandbox(&self) -> Arc<Sandbox> {
        Arc::clone(&self.sandbox)
    }

    pub fn helpers(&self) -> Option<Arc<HelperFabric>> {
        self.helpers.as_ref().map(Arc::clone)
    }

    pub async fn status(&self) -> Status {
        self.state.lock().await.status
    }

    /// Snapshot of the in-memory message log.
    pub async fn history(&self) -> Vec<ChatMessage> {
        self.log.lock().await.clone()
    }

    /// Enqueue a prompt and stream the resulting events. The channel closes
    /// when the turn completes.
    pub fn chat_stream(
        &self,
        prompt: impl Into<String>,
        extra: Option<serde_json::Map<String, Value>>,
    ) -> mpsc::UnboundedReceiver<AgentEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let job = PromptJob {
            prompt: prompt.into(),
            extra,
            tx,
        };
        self.queued.fetch_add(1, Ordering::SeqCst);
        if self.inbox.send(job).is_err() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::unbounded_channel();
            let _ = tx.send(AgentEvent::Error("session is closed".to_string()));
            return rx;
        }
        rx
    }

    /// Post a notification into the sandbox queue and deliver it right away
    /// when the session is idle.
    pub async fn send_notification(&self, message: &str) -> Result<()> {
        self.sandbox.post_notification(message)?;
        let _ = self.poll_notifications(false).await;
        Ok(())
    }

    /// Drain sandbox notifications and returned files into the pending
    /// queue, delivering them into the conversation when the session is idle
    /// with an empty inbox. Returns the events a client poller should
    /// forward (`for_user`) plus any assistant replies generated.
    pub async fn poll_notifications(&self, for_user: bool) -> Vec<AgentEvent> {
        let notes = self.sandbox.fetch_notifications();
        let returned = self.sandbox.fetch_returned_files();
        let mut parts = Vec::new();

        for note in notes {
            self.pending_notes
                .lock()
                .unwrap()
                .push_back(ChatMessage::tool("notification", note.clone()));
            parts.push(AgentEvent::Text(note));
        }

        for (name, data) in returned {
            let encoded = base64::engine::general_purpose::STANDARD.encode(&data);
            let payload =
                serde_json::json!({ "returned_file": name, "data": encoded }).to_string();
            self.pending_notes
                .lock()
                .unwrap()
                .push_back(ChatMessage::tool("notification", payload));
            if for_user {
                parts.push(AgentEvent::ReturnedFile { name, data });
            }
        }

        if for_user {
            let mut queued = self.user_notes.lock().unwrap();
            while let Some(event) = queued.pop_front() {
                parts.push(event);
            }
        }

        let idle = self.state.lock().await.status == Status::Idle
            && self.queued.load(Ordering::SeqCst) == 0;
        if idle && !self.pending_notes.lock().unwrap().is_empty() {
            let (tx, mut rx) = mpsc::unbounded_channel();
            if let Err(e) = self.deliver_notifications(&tx).await {
                warn!("notification delivery failed: {e}");
            }
            drop(tx);
            while let Ok(event) = rx.try_recv() {
                parts.push(event);
            }
        }

        parts
    }

    /// Run one more LLM turn against the current log. No-op unless idle.
    /// This is how queued notifications and helper messages reach the model.
    pub async fn continue_stream(&self, tx: &EventSender) -> Result<()> {
        {
            let mut st = self.state.lock().await;
            if st.status != Status::Idle {
                return Ok(());
            }
            st.status = Status::Generating;
        }

        let response = match self.ask().await {
            Ok(response) => response,
            Err(e) => {
                // failed before entering the tool loop; don't wedge the session
                self.set_idle().await;
                return Err(e);
            }
        };
        self.append_assistant(&response.message).await?;
        emit_content(tx, &response);
        self.run_tool_loop(response, tx).await
    }

    /// Append queued helper replies to the log as tool messages named by
    /// helper. Only runs at idle; otherwise replies wait for the next
    /// turn boundary.
    pub async fn flush_helper_replies(&self) {
        if self.state.lock().await.status != Status::Idle {
            return;
        }
        loop {
            let item = self.helper_replies.lock().unwrap().pop_front();
            let Some((name, text)) = item else { break };
            if let Err(e) = self.append_tool_message(&name, &text).await {
                warn!(helper = %name, "failed to append helper reply: {e}");
            }
        }
    }

    /// Tear the session down: cancel the worker and background tasks, abort
    /// any in-flight tool, stop helpers, and release the sandbox reference.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(user = %self.user.username, session = %self.session_name, "closing session");
        self.cancel.cancel();

        {
            let mut st = self.state.lock().await;
            if let Some(tool) = st.tool.take() {
                tool.abort.abort();
            }
            st.status = Status::Idle;
        }

        if let Some(ref fabric) = self.helpers {
            Box::pin(fabric.shutdown()).await;
        }

        let watcher = self.watcher.lock().unwrap().take();
        if let Some(watcher) = watcher {
            watcher.stop().await;
        }

        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            task.abort();
        }

        if let Some((ref registry, ref key)) = self.registry {
            registry.release(key).await;
        }
    }

    // -----------------------------------------------------------------------
    // Worker
    // -----------------------------------------------------------------------

    async fn worker_loop(self: Arc<Self>, mut inbox: mpsc::UnboundedReceiver<PromptJob>) {
        loop {
            let job = tokio::select! {
                _ = self.cancel.cancelled() => break,
                job = inbox.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            self.flush_helper_replies().await;
            let _ = self.deliver_pending(&job.tx).await;

            if let Err(e) = self.generate_stream(&job.prompt, job.extra.as_ref(), &job.tx).await {
                warn!("turn failed: {e}");
                let _ = job.tx.send(AgentEvent::Error(e.to_string()));
                self.reset_after_error().await;
            }

            self.queued.fetch_sub(1, Ordering::SeqCst);
            self.flush_helper_replies().await;
            // job.tx drops here, closing this turn's stream
        }
        debug!("session worker exited");
    }

    /// One prompt, one turn.
    async fn generate_stream(
        &self,
        prompt: &str,
        extra: Option<&serde_json::Map<String, Value>>,
        tx: &EventSender,
    ) -> Result<()> {
        // A prompt landing while a tool is still running takes the
        // interleaved path: raced against the tool instead of queued
        // behind it.
        let interleaved = {
            let mut st = self.state.lock().await;
            if st.status == Status::AwaitingTool && st.tool.is_some() {
                true
            } else {
                st.status = Status::Generating;
                false
            }
        };
        if interleaved {
            return self.chat_during_tool(prompt, extra, tx).await;
        }

        let prompt = append_extra(prompt, extra);
        self.append_user(&prompt).await?;

        let response = self.ask().await?;
        self.append_assistant(&response.message).await?;
        emit_content(tx, &response);

        self.run_tool_loop(response, tx).await?;
        self.deliver_notifications(tx).await
    }

    /// Interleaved prompt while a tool is running: append the prompt, issue
    /// a fresh request against the log (placeholder still present), and race
    /// it against the still-running tool. Resolution mirrors the normal
    /// tool race.
    async fn chat_during_tool(
        &self,
        prompt: &str,
        extra: Option<&serde_json::Map<String, Value>>,
        tx: &EventSender,
    ) -> Result<()> {
        let Some(active) = self.state.lock().await.tool.clone() else {
            // tool finished in the meantime; fall back to a plain turn
            self.state.lock().await.status = Status::Generating;
            let prompt = append_extra(prompt, extra);
            self.append_user(&prompt).await?;
            let response = self.ask().await?;
            self.append_assistant(&response.message).await?;
            emit_content(tx, &response);
            self.run_tool_loop(response, tx).await?;
            return self.deliver_notifications(tx).await;
        };

        let prompt = append_extra(prompt, extra);
        self.append_user(&prompt).await?;

        let follow = self.spawn_ask().await;
        let response = self
            .race_tool_and_followup(active, follow, tx)
            .await?;

        self.run_tool_loop(response, tx).await?;
        self.deliver_notifications(tx).await
    }

    // -----------------------------------------------------------------------
    // Tool loop
    // -----------------------------------------------------------------------

    /// Drive tool calls until the model stops asking or the depth cap hits.
    /// The initial response's text has already been emitted by the caller.
    async fn run_tool_loop(&self, response: ChatResponse, tx: &EventSender) -> Result<()> {
        if !response.has_tool_calls() {
            self.set_idle().await;
            return Ok(());
        }

        let max_depth = self.config.session.max_tool_call_depth;
        let mut depth = 0;
        let mut calls: VecDeque<ToolCall> = response.message.tool_calls.clone().into();

        while depth < max_depth {
            let Some(call) = calls.pop_front() else { break };
            match self.process_tool_call(call, tx).await? {
                // the new reply's calls drive the next iteration
                Some(next) => calls = next.message.tool_calls.clone().into(),
                // unsupported tool: keep working through the current batch
                None => {}
            }
            depth += 1;
        }

        if depth >= max_depth && !calls.is_empty() {
            warn!(max_depth, "tool call depth cap reached, ending turn");
        }

        self.set_idle().await;
        Ok(())
    }

    /// Launch one tool concurrently with a speculative follow-up request and
    /// resolve whichever finishes first. Returns the assistant reply that
    /// closes this step, or `None` for an unsupported tool.
    async fn process_tool_call(
        &self,
        call: ToolCall,
        tx: &EventSender,
    ) -> Result<Option<ChatResponse>> {
        let Some(tool) = self.tools.get(&call.name) else {
            warn!(tool = %call.name, "unsupported tool call");
            self.append_tool_message(&call.name, &format!("Unsupported tool: {}", call.name))
                .await?;
            return Ok(None);
        };

        let args = normalize_args(&call.name, call.arguments);
        let display_name = if call.name == "send_to_agent" {
            args.get("name")
                .and_then(|v| v.as_str())
                .unwrap_or("agent")
                .to_string()
        } else {
            call.name.clone()
        };

        // The placeholder enters the in-memory log so the speculative
        // request sees a complete tool exchange. It is never persisted and
        // is removed before the real result lands.
        self.push_placeholder(&display_name).await;

        let tool_task = {
            let tool = Arc::clone(tool);
            let ctx = self.tool_context();
            tokio::spawn(async move {
                let result = tool.execute(ctx, args).await;
                result.content
            })
        };
        let abort = tool_task.abort_handle();
        let result: Shared<BoxFuture<'static, String>> = async move {
            match tool_task.await {
                Ok(content) => content,
                Err(e) => format!("Tool task failed: {e}"),
            }
        }
        .boxed()
        .shared();

        let active = ActiveTool {
            result,
            abort,
            display_name: display_name.clone(),
        };

        let follow = self.spawn_ask().await;
        {
            let mut st = self.state.lock().await;
            st.status = Status::AwaitingTool;
            st.tool = Some(active.clone());
        }

        self.race_tool_and_followup(active, follow, tx)
            .await
            .map(Some)
    }

    /// Wait for either the tool or the speculative follow-up, then bring the
    /// log to a consistent state and issue the post-tool request.
    async fn race_tool_and_followup(
        &self,
        active: ActiveTool,
        mut follow: JoinHandle<Result<ChatResponse>>,
        tx: &EventSender,
    ) -> Result<ChatResponse> {
        let mut tool_result = active.result.clone();
        let display_name = active.display_name.clone();

        tokio::select! {
            result = &mut tool_result => {
                // Tool first: the narration is moot, cancel it. A cancelled
                // request appends nothing; appends happen only on this path.
                follow.abort();
                self.finish_tool(&display_name, &result).await?;
                let next = self.ask().await?;
                self.append_assistant(&next.message).await?;
                emit_content(tx, &next);
                Ok(next)
            }
            followup = &mut follow => {
                let followup = followup
                    .map_err(|e| SessionError::Internal(format!("follow-up task failed: {e}")))??;
                // Interim narration lands (and streams) first, then we wait
                // out the tool.
                self.append_assistant(&followup.message).await?;
                emit_content(tx, &followup);

                let result = tool_result.await;
                self.finish_tool(&display_name, &result).await?;
                let next = self.ask().await?;
                self.append_assistant(&next.message).await?;
                emit_content(tx, &next);
                Ok(next)
            }
        }
    }

    /// Replace the placeholder with the real tool result and return the
    /// session to `generating` for the follow-on request.
    async fn finish_tool(&self, display_name: &str, result: &str) -> Result<()> {
        self.remove_placeholder().await;
        self.append_tool_message(display_name, result).await?;
        let mut st = self.state.lock().await;
        st.status = Status::Generating;
        st.tool = None;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // LLM plumbing
    // -----------------------------------------------------------------------

    /// The configured base prompt with the user's memory JSON inlined.
    /// Recomputed every request so memory edits apply mid-conversation.
    fn system_prompt(&self) -> String {
        let memory = memory::get_memory(
            &self.store,
            &self.user.username,
            &self.config.session.default_memory_template,
        )
        .unwrap_or_default();
        format!("{}\n<memory>\n{}\n</memory>", self.base_prompt, memory)
    }

    fn build_request(&self, messages: Vec<ChatMessage>) -> ChatRequest {
        let mut payload = Vec::with_capacity(messages.len() + 1);
        payload.push(ChatMessage::system(self.system_prompt()));
        payload.extend(messages);
        ChatRequest {
            model: self.config.llm.model_name.clone(),
            messages: payload,
            tools: self.tools.definitions(),
            think: self.think,
            num_ctx: self.config.llm.num_ctx,
        }
    }

    /// Chat request against the current log, awaited in place.
    async fn ask(&self) -> Result<ChatResponse> {
        let snapshot = self.log.lock().await.clone();
        let req = self.build_request(snapshot);
        Ok(self.llm.chat(&req).await?)
    }

    /// Chat request against the current log as a detached task, for the
    /// speculative side of the race.
    async fn spawn_ask(&self) -> JoinHandle<Result<ChatResponse>> {
        let snapshot = self.log.lock().await.clone();
        let req = self.build_request(snapshot);
        let llm = Arc::clone(&self.llm);
        tokio::spawn(async move { llm.chat(&req).await.map_err(SessionError::from) })
    }

    // -----------------------------------------------------------------------
    // Log + persistence
    // -----------------------------------------------------------------------

    async fn append_user(&self, content: &str) -> Result<()> {
        self.log.lock().await.push(ChatMessage::user(content));
        if let Some(ref conv) = self.conversation {
            self.store.append_message(conv.id, "user", content)?;
        }
        Ok(())
    }

    async fn append_assistant(&self, message: &ChatMessage) -> Result<()> {
        self.log.lock().await.push(message.clone());
        if let Some(ref conv) = self.conversation {
            if let Some(encoded) = history::encode_assistant(message) {
                self.store.append_message(conv.id, "assistant", &encoded)?;
            }
        }
        Ok(())
    }

    /// Append a tool-role message (tool results, notifications, helper
    /// replies) under its display name.
    pub async fn append_tool_message(&self, name: &str, content: &str) -> Result<()> {
        self.log.lock().await.push(ChatMessage::tool(name, content));
        if let Some(ref conv) = self.conversation {
            self.store
                .append_message(conv.id, "tool", &history::encode_tool(name, content))?;
        }
        Ok(())
    }

    async fn push_placeholder(&self, display_name: &str) {
        self.log.lock().await.push(ChatMessage::tool(
            display_name,
            self.config.session.tool_placeholder_content.as_str(),
        ));
    }

    async fn remove_placeholder(&self) {
        let placeholder = &self.config.session.tool_placeholder_content;
        let mut log = self.log.lock().await;
        if let Some(pos) = log
            .iter()
            .rposition(|m| m.role == Role::Tool && &m.content == placeholder)
        {
            log.remove(pos);
        }
    }

    // -----------------------------------------------------------------------
    // Notifications
    // -----------------------------------------------------------------------

    /// Move pending notifications into the log. Returns whether any landed.
    async fn flush_pending_notes(&self) -> Result<bool> {
        let mut delivered = false;
        loop {
            let note = self.pending_notes.lock().unwrap().pop_front();
            let Some(msg) = note else { break };
            let name = msg.name.as_deref().unwrap_or("notification").to_string();
            self.append_tool_message(&name, &msg.content).await?;
            delivered = true;
        }
        Ok(delivered)
    }

    /// Flush pending notifications and, when any landed, run one more turn
    /// so the model reacts to them.
    async fn deliver_notifications(&self, tx: &EventSender) -> Result<()> {
        if self.flush_pending_notes().await? {
            self.continue_stream(tx).await?;
        }
        Ok(())
    }

    /// Worker-side pre-turn delivery; ignores "not idle" silently.
    async fn deliver_pending(&self, tx: &EventSender) -> Result<()> {
        if self.state.lock().await.status != Status::Idle {
            return Ok(());
        }
        self.deliver_notifications(tx).await
    }

    // -----------------------------------------------------------------------
    // State helpers
    // -----------------------------------------------------------------------

    fn tool_context(&self) -> ToolContext {
        ToolContext {
            sandbox: Arc::clone(&self.sandbox),
            store: Arc::clone(&self.store),
            username: self.user.username.clone(),
            memory_limit: self.config.session.memory_limit,
            memory_template: self.config.session.default_memory_template.clone(),
            helpers: self.helpers.as_ref().map(Arc::clone),
        }
    }

    async fn set_idle(&self) {
        let mut st = self.state.lock().await;
        st.status = Status::Idle;
        st.tool = None;
    }

    /// A turn died mid-flight: drop any placeholder, abort the tool, and
    /// return to idle so the session stays usable.
    async fn reset_after_error(&self) {
        self.remove_placeholder().await;
        let mut st = self.state.lock().await;
        if let Some(tool) = st.tool.take() {
            tool.abort.abort();
        }
        st.status = Status::Idle;
    }
}

/// Embed request metadata into the prompt the way clients expect to see it
/// reflected in history.
fn append_extra(prompt: &str, extra: Option<&serde_json::Map<String, Value>>) -> String {
    let Some(extra) = extra else {
        return prompt.to_string();
    };
    let cleaned: serde_json::Map<String, Value> = extra
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| {
            let text = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), Value::String(text))
        })
        .collect();
    if cleaned.is_empty() {
        return prompt.to_string();
    }
    let rendered = serde_json::to_string_pretty(&Value::Object(cleaned))
        .unwrap_or_else(|_| "{}".to_string());
    format!("{prompt}\n<extra>\n{rendered}\n</extra>")
}

fn emit_content(tx: &EventSender, response: &ChatResponse) {
    if !response.content().is_empty() {
        let _ = tx.send(AgentEvent::Text(response.content().to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::append_extra;

    #[test]
    fn extra_metadata_is_embedded_as_json() {
        let mut extra = serde_json::Map::new();
        extra.insert("channel".into(), serde_json::json!("voice"));
        extra.insert("skip".into(), serde_json::Value::Null);
        let out = append_extra("hello", Some(&extra));
        assert!(out.starts_with("hello\n<extra>\n"));
        assert!(out.contains("\"channel\": \"voice\""));
        assert!(!out.contains("skip"));
        assert!(out.ends_with("</extra>"));
    }

    #[test]
    fn no_extra_leaves_prompt_untouched() {
        assert_eq!(append_extra("hello", None), "hello");
        let empty = serde_json::Map::new();
        assert_eq!(append_extra("hello", Some(&empty)), "hello");
    }
}
