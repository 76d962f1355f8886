//! Conversation orchestration: one user message in, one model reply out.

use crate::config::Config;
use crate::conversation::context::DEFAULT_SYSTEM_PROMPT;
use crate::conversation::{HistoryManager, Message, assemble_prompt};
use crate::error::{Error, Result, ValidationError};
use crate::llm::ModelClient;
use crate::storage::Storage;

use chrono::{DateTime, Utc};
use regex::Regex;

use std::sync::{Arc, LazyLock};

static THOUGHT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*\((.*?)\)\*").expect("hardcoded thought regex"));

/// Per-request state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Received,
    HistoryLoaded,
    PromptBuilt,
    ModelInvoked,
    HistoryUpdated,
    Persisted,
    Responded,
    Failed,
}

/// Progress of a single `handle_message` call.
struct Turn<'a> {
    user_id: &'a str,
    state: TurnState,
}

impl<'a> Turn<'a> {
    fn new(user_id: &'a str) -> Self {
        tracing::debug!(%user_id, state = ?TurnState::Received, "turn started");
        Self {
            user_id,
            state: TurnState::Received,
        }
    }

    fn can_transition_to(&self, target: TurnState) -> bool {
        use TurnState::*;

        matches!(
            (self.state, target),
            (Received, HistoryLoaded)
                | (HistoryLoaded, PromptBuilt)
                | (PromptBuilt, ModelInvoked)
                | (ModelInvoked, HistoryUpdated)
                | (HistoryUpdated, Persisted)
                | (Persisted, Responded)
        ) || (target == Failed && !self.is_done())
    }

    fn transition_to(&mut self, target: TurnState) -> Result<()> {
        if !self.can_transition_to(target) {
            return Err(Error::InvalidTransition(format!(
                "can't transition from {:?} to {:?}",
                self.state, target
            )));
        }

        tracing::debug!(user_id = %self.user_id, from = ?self.state, to = ?target, "turn state");
        self.state = target;
        Ok(())
    }

    /// Move to `Failed` and hand the error back for propagation.
    fn fail(&mut self, error: impl Into<Error>) -> Error {
        let error = error.into();
        tracing::debug!(user_id = %self.user_id, from = ?self.state, %error, "turn failed");
        self.state = TurnState::Failed;
        error
    }

    fn is_done(&self) -> bool {
        matches!(self.state, TurnState::Responded | TurnState::Failed)
    }
}

/// A model reply as returned to the caller.
#[derive(Debug, Clone)]
pub struct Reply {
    pub text: String,
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Ties history, prompt assembly and the model together.
///
/// Constructed once at startup and shared behind an `Arc`.
pub struct Relay {
    history: HistoryManager,
    model: Arc<dyn ModelClient>,
    system_prompt: String,
    prompt_window: usize,
}

impl Relay {
    pub fn new(
        history: HistoryManager,
        model: Arc<dyn ModelClient>,
        system_prompt: Option<String>,
        prompt_window: usize,
    ) -> Self {
        Self {
            history,
            model,
            system_prompt: system_prompt.unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            prompt_window,
        }
    }

    pub fn from_config(
        config: &Config,
        storage: Arc<Storage>,
        model: Arc<dyn ModelClient>,
    ) -> Self {
        Self::new(
            HistoryManager::new(storage, config.history.retention),
            model,
            config.system_prompt.clone(),
            config.history.prompt_window,
        )
    }

    pub fn history(&self) -> &HistoryManager {
        &self.history
    }

    pub fn model(&self) -> &dyn ModelClient {
        self.model.as_ref()
    }

    /// Run one conversational turn for `user_id`.
    ///
    /// A model failure leaves stored history untouched. The user message and
    /// the reply are persisted together only once the model has answered.
    pub async fn handle_message(&self, user_id: &str, text: &str) -> Result<Reply> {
        validate_user_id(user_id)?;
        if text.trim().is_empty() {
            return Err(ValidationError::EmptyMessage.into());
        }

        let mut turn = Turn::new(user_id);
        let received = Message::user(text);

        let mut session = self.history.session().await;
        let history = session.get_history(user_id, self.prompt_window).await;
        turn.transition_to(TurnState::HistoryLoaded)?;

        let prompt = assemble_prompt(&history, text, Some(self.system_prompt.as_str()));
        turn.transition_to(TurnState::PromptBuilt)?;
        tracing::debug!(%user_id, history = history.len(), prompt = prompt.len(), "prompt assembled");

        let reply_text = match self.model.invoke(&prompt).await {
            Ok(reply) => reply,
            Err(error) => {
                tracing::warn!(%user_id, model = %self.model.model_name(), %error, "model invocation failed");
                return Err(turn.fail(error));
            }
        };
        turn.transition_to(TurnState::ModelInvoked)?;
        log_thoughts(user_id, &reply_text);

        let reply = Message::assistant(reply_text);
        let timestamp = reply.timestamp;
        let text = reply.content.clone();
        turn.transition_to(TurnState::HistoryUpdated)?;

        if let Err(error) = session.append_turn(user_id, vec![received, reply]).await {
            tracing::error!(%user_id, %error, "failed to persist conversation turn");
            return Err(turn.fail(error));
        }
        turn.transition_to(TurnState::Persisted)?;

        if session.is_degraded() {
            tracing::info!(%user_id, "turn persisted to local history file");
        }

        turn.transition_to(TurnState::Responded)?;
        Ok(Reply {
            text,
            message_id: format!("{user_id}_{}", timestamp.timestamp_millis()),
            timestamp,
        })
    }

    /// The `limit` most recent messages for `user_id`, oldest first.
    pub async fn get_history(&self, user_id: &str, limit: usize) -> Result<Vec<Message>> {
        validate_user_id(user_id)?;
        Ok(self.history.get_history(user_id, limit).await)
    }

    /// Forget everything stored for `user_id`. `false` when storage refused.
    pub async fn clear_history(&self, user_id: &str) -> Result<bool> {
        validate_user_id(user_id)?;
        match self.history.clear(user_id).await {
            Ok(()) => Ok(true),
            Err(error) => {
                tracing::error!(%user_id, %error, "failed to clear history");
                Ok(false)
            }
        }
    }
}

fn validate_user_id(user_id: &str) -> std::result::Result<(), ValidationError> {
    if user_id.trim().is_empty() {
        return Err(ValidationError::EmptyUserId);
    }
    Ok(())
}

/// `*( ... )*` asides the persona uses for its inner voice.
fn extract_thoughts(reply: &str) -> Vec<&str> {
    THOUGHT_REGEX
        .captures_iter(reply)
        .filter_map(|captures| captures.get(1))
        .map(|thought| thought.as_str().trim())
        .filter(|thought| !thought.is_empty())
        .collect()
}

fn log_thoughts(user_id: &str, reply: &str) {
    let thoughts = extract_thoughts(reply);
    if thoughts.is_empty() {
        tracing::debug!(%user_id, "reply carried no thoughts");
        return;
    }
    for thought in thoughts {
        tracing::debug!(%user_id, thought, "reply thought");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{PromptMessage, PromptRole, Role};
    use crate::error::{ModelError, StorageError};
    use crate::storage::tests::MemoryStore;
    use crate::storage::{FallbackPolicy, FileHistoryStore, HistoryStore};

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use std::collections::VecDeque;
    use std::sync::atomic::Ordering;

    /// Replays scripted outcomes and records every prompt it receives.
    #[derive(Default)]
    struct ScriptedModel {
        outcomes: Mutex<VecDeque<std::result::Result<String, ModelError>>>,
        prompts: Mutex<Vec<Vec<PromptMessage>>>,
    }

    impl ScriptedModel {
        fn replying(replies: &[&str]) -> Self {
            let model = Self::default();
            model
                .outcomes
                .try_lock()
                .unwrap()
                .extend(replies.iter().map(|reply| Ok(reply.to_string())));
            model
        }

        async fn push(&self, outcome: std::result::Result<String, ModelError>) {
            self.outcomes.lock().await.push_back(outcome);
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedModel {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn invoke(
            &self,
            messages: &[PromptMessage],
        ) -> std::result::Result<String, ModelError> {
            self.prompts.lock().await.push(messages.to_vec());
            self.outcomes
                .lock()
                .await
                .pop_front()
                .unwrap_or(Err(ModelError::EmptyResponse))
        }
    }

    fn relay_with(storage: Storage, model: Arc<ScriptedModel>) -> Relay {
        Relay::new(
            HistoryManager::new(Arc::new(storage), 50),
            model,
            Some("system".into()),
            50,
        )
    }

    fn local_relay(model: Arc<ScriptedModel>) -> Relay {
        relay_with(Storage::local_only(Arc::new(MemoryStore::default())), model)
    }

    #[tokio::test]
    async fn turn_is_persisted_and_fed_back() {
        let model = Arc::new(ScriptedModel::replying(&["first reply", "second reply"]));
        let relay = local_relay(model.clone());

        let reply = relay.handle_message("alice", "hello").await.unwrap();
        assert_eq!(reply.text, "first reply");
        assert_eq!(
            reply.message_id,
            format!("alice_{}", reply.timestamp.timestamp_millis())
        );

        relay.handle_message("alice", "again").await.unwrap();

        let prompts = model.prompts.lock().await;
        let contents: Vec<_> = prompts[1].iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["system", "hello", "first reply", "again"]);
        assert_eq!(prompts[1][0].role, PromptRole::System);

        let history = relay.get_history("alice", 10).await.unwrap();
        let roles: Vec<_> = history.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::Assistant, Role::User, Role::Assistant]
        );
    }

    #[tokio::test]
    async fn model_failure_leaves_history_unchanged() {
        let model = Arc::new(ScriptedModel::replying(&["ok"]));
        let relay = local_relay(model.clone());
        relay.handle_message("alice", "hello").await.unwrap();
        let before = relay.get_history("alice", 50).await.unwrap();

        model.push(Err(ModelError::RateLimited)).await;
        let error = relay.handle_message("alice", "fail me").await.unwrap_err();
        assert!(matches!(error, Error::Model(ModelError::RateLimited)));

        let after = relay.get_history("alice", 50).await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn replies_from_local_file_when_durable_is_down() {
        let dir = tempfile::tempdir().unwrap();
        let durable = Arc::new(MemoryStore::unavailable());
        let local = Arc::new(FileHistoryStore::new(dir.path().join("history.json")));
        let storage = Storage::with_fallback(
            durable.clone(),
            local.clone(),
            FallbackPolicy::PerRequest,
            None,
        );
        let relay = relay_with(storage, Arc::new(ScriptedModel::replying(&["still here"])));

        let reply = relay.handle_message("alice", "hello").await.unwrap();
        assert_eq!(reply.text, "still here");

        let history = relay.get_history("alice", 10).await.unwrap();
        let contents: Vec<_> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["hello", "still here"]);
        assert_eq!(durable.len("alice").await, 0);

        // The turn is on disk, not only in memory.
        let reopened = FileHistoryStore::new(local.path());
        assert_eq!(reopened.load("alice").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn clear_is_not_reported_while_durable_copy_survives() {
        let durable = Arc::new(MemoryStore::default());
        let local = Arc::new(MemoryStore::default());
        let mut seeded = crate::conversation::ConversationLog::new();
        seeded.push(Message::user("secret"));
        durable.save("alice", &seeded).await.unwrap();

        let storage = Storage::with_fallback(
            durable.clone(),
            local,
            FallbackPolicy::PerRequest,
            None,
        );
        let relay = relay_with(storage, Arc::new(ScriptedModel::default()));

        durable.unavailable.store(true, Ordering::SeqCst);
        assert!(!relay.clear_history("alice").await.unwrap());

        durable.unavailable.store(false, Ordering::SeqCst);
        assert!(relay.clear_history("alice").await.unwrap());
        assert!(relay.get_history("alice", 50).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_persist_fails_the_turn() {
        let durable = Arc::new(MemoryStore::unavailable());
        let local = Arc::new(MemoryStore::unavailable());
        let storage =
            Storage::with_fallback(durable, local, FallbackPolicy::PerRequest, None);
        let relay = relay_with(storage, Arc::new(ScriptedModel::replying(&["lost"])));

        let error = relay.handle_message("alice", "hello").await.unwrap_err();
        assert!(matches!(error, Error::Storage(_)));
    }

    #[tokio::test]
    async fn clear_then_talk_starts_fresh() {
        let model = Arc::new(ScriptedModel::replying(&["one", "two"]));
        let relay = local_relay(model.clone());
        relay.handle_message("alice", "hello").await.unwrap();

        assert!(relay.clear_history("alice").await.unwrap());
        assert!(relay.get_history("alice", 50).await.unwrap().is_empty());

        relay.handle_message("alice", "fresh").await.unwrap();
        let history = relay.get_history("alice", 50).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "fresh");

        // The second prompt carried no pre-clear history.
        let prompts = model.prompts.lock().await;
        assert_eq!(prompts[1].len(), 2);
    }

    #[tokio::test]
    async fn clear_reports_storage_refusal() {
        let local = Arc::new(MemoryStore::default());
        local.unavailable.store(true, Ordering::SeqCst);
        let relay = relay_with(Storage::local_only(local), Arc::new(ScriptedModel::default()));

        assert!(!relay.clear_history("alice").await.unwrap());
    }

    #[tokio::test]
    async fn rejects_blank_input_before_touching_history() {
        let store = Arc::new(MemoryStore::default());
        let model = Arc::new(ScriptedModel::replying(&["unused"]));
        let relay = relay_with(Storage::local_only(store.clone()), model.clone());

        let error = relay.handle_message("alice", "   ").await.unwrap_err();
        assert!(matches!(
            error,
            Error::Validation(ValidationError::EmptyMessage)
        ));

        let error = relay.handle_message(" ", "hello").await.unwrap_err();
        assert!(matches!(
            error,
            Error::Validation(ValidationError::EmptyUserId)
        ));
        assert!(relay.get_history("", 10).await.is_err());
        assert!(relay.clear_history("").await.is_err());

        assert!(model.prompts.lock().await.is_empty());
        assert_eq!(store.len("alice").await, 0);
    }

    #[tokio::test]
    async fn prompt_window_limits_history_sent() {
        let store = Arc::new(MemoryStore::default());
        let mut log = crate::conversation::ConversationLog::new();
        for index in 0..10 {
            log.push(Message::user(format!("m{index}")));
        }
        store.save("alice", &log).await.unwrap();

        let model = Arc::new(ScriptedModel::replying(&["ok"]));
        let relay = Relay::new(
            HistoryManager::new(Arc::new(Storage::local_only(store)), 50),
            model.clone(),
            None,
            3,
        );
        relay.handle_message("alice", "next").await.unwrap();

        let prompts = model.prompts.lock().await;
        let contents: Vec<_> = prompts[0].iter().skip(1).map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m7", "m8", "m9", "next"]);
        assert_eq!(prompts[0][0].content, DEFAULT_SYSTEM_PROMPT);
    }

    #[test]
    fn turn_rejects_skipped_states() {
        let mut turn = Turn::new("alice");
        assert!(turn.transition_to(TurnState::ModelInvoked).is_err());
        turn.transition_to(TurnState::HistoryLoaded).unwrap();

        let _ = turn.fail(StorageError::BackendUnavailable("down".into()));
        assert!(turn.is_done());
        assert!(!turn.can_transition_to(TurnState::Failed));
    }

    #[test]
    fn extracts_thoughts() {
        let reply = "Certainly. *(they seem tired)* Here you go. *( keep it short )*";
        assert_eq!(extract_thoughts(reply), vec!["they seem tired", "keep it short"]);
        assert!(extract_thoughts("plain reply").is_empty());
    }
}
