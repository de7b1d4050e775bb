//! Client-side conversation state.
//!
//! One exchange at a time moves through
//! `Draft -> UserPersisting -> Streaming -> AssistantPersisting -> Settled`,
//! or into `Error` from `Streaming`. Message ids are minted here before any
//! write so the optimistic view and the durable view merge by id.

use crate::auth::Identity;
use crate::client::{ChatStream, ClientError, FrameStream};
use crate::messages::{Conversation, Message, Role, new_id};
use crate::relay::Frame;
use crate::store::{ChatStore, StoreResult};
use chrono::Utc;
use futures_util::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinHandle;

const NAME_CHARS: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangePhase {
    Draft,
    UserPersisting,
    Streaming,
    AssistantPersisting,
    Settled,
    Error(String),
}

impl ExchangePhase {
    fn is_busy(&self) -> bool {
        matches!(
            self,
            Self::UserPersisting | Self::Streaming | Self::AssistantPersisting
        )
    }
}

#[derive(Debug)]
pub struct Exchange {
    phase: ExchangePhase,
    user: Message,
    assistant: Message,
    completed: bool,
    user_write: Option<JoinHandle<StoreResult<()>>>,
}

impl Exchange {
    pub fn phase(&self) -> &ExchangePhase {
        &self.phase
    }

    pub fn user(&self) -> &Message {
        &self.user
    }

    /// The assistant text received so far.
    pub fn assistant(&self) -> &Message {
        &self.assistant
    }
}

pub struct ConversationSession {
    store: Arc<dyn ChatStore>,
    stream: Arc<dyn ChatStream>,
    owner: Identity,
    model: String,
    conversation_id: Option<String>,
    durable: Vec<Message>,
    exchange: Option<Exchange>,
}

impl ConversationSession {
    pub fn new(
        store: Arc<dyn ChatStore>,
        stream: Arc<dyn ChatStream>,
        owner: Identity,
        model: impl Into<String>,
    ) -> Self {
        Self {
            store,
            stream,
            owner,
            model: model.into(),
            conversation_id: None,
            durable: Vec::new(),
            exchange: None,
        }
    }

    /// Attaches to an existing conversation and loads its messages.
    pub async fn resume(
        store: Arc<dyn ChatStore>,
        stream: Arc<dyn ChatStream>,
        owner: Identity,
        model: impl Into<String>,
        conversation_id: impl Into<String>,
    ) -> Result<Self, ClientError> {
        let mut session = Self::new(store, stream, owner, model);
        session.conversation_id = Some(conversation_id.into());
        session.refresh().await?;
        Ok(session)
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn exchange(&self) -> Option<&Exchange> {
        self.exchange.as_ref()
    }

    pub fn phase(&self) -> ExchangePhase {
        self.exchange
            .as_ref()
            .map(|e| e.phase.clone())
            .unwrap_or(ExchangePhase::Draft)
    }

    /// The error text of a failed exchange.
    pub fn error(&self) -> Option<&str> {
        match self.exchange.as_ref().map(|e| &e.phase) {
            Some(ExchangePhase::Error(message)) => Some(message.as_str()),
            _ => None,
        }
    }

    /// Durable messages followed by in-flight ones not yet durable.
    pub fn messages(&self) -> Vec<Message> {
        let mut out = self.durable.clone();
        let Some(exchange) = &self.exchange else {
            return out;
        };
        let known: HashSet<&str> = self.durable.iter().map(|m| m.id.as_str()).collect();
        if exchange.phase != ExchangePhase::Draft && !known.contains(exchange.user.id.as_str()) {
            out.push(exchange.user.clone());
        }
        let show_assistant = matches!(
            exchange.phase,
            ExchangePhase::Streaming | ExchangePhase::AssistantPersisting | ExchangePhase::Settled
        );
        if show_assistant && !known.contains(exchange.assistant.id.as_str()) {
            out.push(exchange.assistant.clone());
        }
        out
    }

    /// Replaces the durable view, as a realtime subscription would.
    pub fn apply_durable(&mut self, mut messages: Vec<Message>) {
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        self.durable = messages;
        let caught_up = self.exchange.as_ref().is_some_and(|e| {
            e.phase == ExchangePhase::Settled
                && self.durable.iter().any(|m| m.id == e.assistant.id)
                && self.durable.iter().any(|m| m.id == e.user.id)
        });
        if caught_up {
            self.exchange = None;
        }
    }

    pub async fn refresh(&mut self) -> Result<(), ClientError> {
        let Some(conversation_id) = self.conversation_id.clone() else {
            return Ok(());
        };
        let messages = self.store.list_messages(&conversation_id).await?;
        self.apply_durable(messages);
        Ok(())
    }

    /// Waits for the pending user-message write, if any.
    pub async fn flush(&mut self) -> Result<(), ClientError> {
        let Some(handle) = self.exchange.as_mut().and_then(|e| e.user_write.take()) else {
            return Ok(());
        };
        match handle.await {
            Ok(result) => result.map_err(ClientError::from),
            Err(err) => Err(ClientError::Protocol(format!("user message write aborted: {err}"))),
        }
    }

    /// Persists the user message and opens the generation stream. The write
    /// is not awaited before the stream opens.
    pub async fn begin(&mut self, text: &str) -> Result<FrameStream, ClientError> {
        if self.exchange.as_ref().is_some_and(|e| e.phase.is_busy()) {
            return Err(ClientError::Busy);
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(ClientError::EmptyMessage);
        }

        if let Some(previous) = self.exchange.take() {
            self.retire(previous);
        }
        let conversation_id = self.ensure_conversation(text).await?;
        let now = Utc::now();
        let user = Message {
            id: new_id(),
            conversation_id: conversation_id.clone(),
            role: Role::User,
            content: text.to_string(),
            model: String::new(),
            created_at: now,
        };
        let assistant = Message {
            id: new_id(),
            conversation_id,
            role: Role::Assistant,
            content: String::new(),
            model: self.model.clone(),
            created_at: now,
        };
        self.exchange = Some(Exchange {
            phase: ExchangePhase::Draft,
            user: user.clone(),
            assistant,
            completed: false,
            user_write: None,
        });

        let store = self.store.clone();
        let write = tokio::spawn(async move { store.insert_message(&user).await });
        if let Some(exchange) = self.exchange.as_mut() {
            exchange.phase = ExchangePhase::UserPersisting;
            exchange.user_write = Some(write);
        }

        let history: Vec<_> = self
            .messages()
            .iter()
            .filter(|m| !(m.role == Role::Assistant && m.content.is_empty()))
            .map(Message::to_chat)
            .collect();
        match self.stream.open(&self.model, &history).await {
            Ok(frames) => {
                self.set_phase(ExchangePhase::Streaming);
                Ok(frames)
            }
            Err(err) => {
                self.set_phase(ExchangePhase::Error(err.to_string()));
                Err(err)
            }
        }
    }

    /// Applies one downstream frame to the in-flight exchange.
    pub fn apply_frame(&mut self, frame: Frame) {
        let Some(exchange) = self.exchange.as_mut() else {
            return;
        };
        if exchange.phase != ExchangePhase::Streaming {
            return;
        }
        match frame {
            Frame::Text { text } => exchange.assistant.content.push_str(&text),
            Frame::Metadata { model } => {
                exchange.assistant.model = model;
                exchange.completed = true;
            }
            Frame::Error { message } => exchange.phase = ExchangePhase::Error(message),
        }
    }

    /// Marks a transport failure on the open stream.
    pub fn fail(&mut self, err: &ClientError) {
        if self.phase() == ExchangePhase::Streaming {
            self.set_phase(ExchangePhase::Error(err.to_string()));
        }
    }

    /// Persists the assistant message once the metadata frame has arrived.
    /// A stream that ends without one was cut short and is not persisted.
    pub async fn finish(&mut self) -> Result<(), ClientError> {
        let Some(exchange) = self.exchange.as_mut() else {
            return Ok(());
        };
        match &exchange.phase {
            ExchangePhase::Streaming => {}
            ExchangePhase::Error(message) => return Err(ClientError::Generation(message.clone())),
            _ => return Ok(()),
        }
        if !exchange.completed {
            let err = ClientError::Protocol("stream ended before completion".to_string());
            exchange.phase = ExchangePhase::Error(err.to_string());
            return Err(err);
        }
        exchange.phase = ExchangePhase::AssistantPersisting;
        exchange.assistant.created_at = Utc::now();
        let assistant = exchange.assistant.clone();
        match self.store.insert_message(&assistant).await {
            Ok(()) => {
                self.set_phase(ExchangePhase::Settled);
                Ok(())
            }
            Err(err) => {
                self.set_phase(ExchangePhase::Error(err.to_string()));
                Err(err.into())
            }
        }
    }

    /// Runs a whole exchange: begin, drain the stream, persist.
    pub async fn submit(&mut self, text: &str) -> Result<(), ClientError> {
        let mut frames = self.begin(text).await?;
        while let Some(item) = frames.next().await {
            match item {
                Ok(frame) => {
                    let terminal = frame.is_terminal();
                    self.apply_frame(frame);
                    if terminal {
                        break;
                    }
                }
                Err(err) => {
                    self.fail(&err);
                    break;
                }
            }
        }
        self.finish().await
    }

    async fn ensure_conversation(&mut self, first_text: &str) -> Result<String, ClientError> {
        if let Some(id) = &self.conversation_id {
            return Ok(id.clone());
        }
        let name: String = first_text.chars().take(NAME_CHARS).collect();
        let conversation = Conversation {
            id: new_id(),
            name: name.trim().to_string(),
            created_at: Utc::now(),
            user_id: self.owner.user_id().map(str::to_string),
            session_id: self.owner.session_id().map(str::to_string),
        };
        self.store.create_conversation(&conversation).await?;
        tracing::debug!(conversation_id = %conversation.id, "conversation created");
        self.conversation_id = Some(conversation.id.clone());
        Ok(conversation.id)
    }

    /// Folds a finished exchange into the local durable view until the next
    /// refresh replaces it.
    fn retire(&mut self, previous: Exchange) {
        let mut kept = Vec::new();
        match previous.phase {
            ExchangePhase::Settled => {
                kept.push(previous.user);
                kept.push(previous.assistant);
            }
            ExchangePhase::Error(_) => kept.push(previous.user),
            _ => {}
        }
        for message in kept {
            if !self.durable.iter().any(|m| m.id == message.id) {
                self.durable.push(message);
            }
        }
    }

    fn set_phase(&mut self, phase: ExchangePhase) {
        if let Some(exchange) = self.exchange.as_mut() {
            exchange.phase = phase;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::ChatMessage;
    use crate::store::MemoryChatStore;
    use async_trait::async_trait;
    use futures_util::stream;
    use std::sync::Mutex;

    /// Replays a fixed frame script and records the history it was opened with.
    struct Scripted {
        frames: Vec<Result<Frame, String>>,
        seen: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl Scripted {
        fn new(frames: Vec<Result<Frame, String>>) -> Arc<Self> {
            Arc::new(Self {
                frames,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ChatStream for Scripted {
        async fn open(
            &self,
            _model: &str,
            history: &[ChatMessage],
        ) -> Result<FrameStream, ClientError> {
            self.seen.lock().unwrap().push(history.to_vec());
            let frames: Vec<Result<Frame, ClientError>> = self
                .frames
                .iter()
                .cloned()
                .map(|f| f.map_err(ClientError::Protocol))
                .collect();
            Ok(Box::pin(stream::iter(frames)))
        }
    }

    struct Refusing;

    #[async_trait]
    impl ChatStream for Refusing {
        async fn open(&self, _: &str, _: &[ChatMessage]) -> Result<FrameStream, ClientError> {
            Err(ClientError::Rejected {
                status: 400,
                message: "Usage limit reached".into(),
            })
        }
    }

    fn text(s: &str) -> Result<Frame, String> {
        Ok(Frame::Text { text: s.into() })
    }

    fn done(model: &str) -> Result<Frame, String> {
        Ok(Frame::Metadata {
            model: model.into(),
        })
    }

    fn anon() -> Identity {
        Identity::Anonymous {
            session_id: "s1".into(),
        }
    }

    #[tokio::test]
    async fn settled_exchange_persists_both_messages() {
        let store = Arc::new(MemoryChatStore::new());
        let stream = Scripted::new(vec![
            text("Hi"),
            text(" there"),
            Ok(Frame::Metadata {
                model: "openai/gpt-4.1-nano".into(),
            }),
        ]);
        let mut session =
            ConversationSession::new(store.clone(), stream.clone(), anon(), "openai/gpt-4.1-nano");
        session
            .submit("  Tell me something interesting about Rust  ")
            .await
            .unwrap();
        assert_eq!(session.phase(), ExchangePhase::Settled);
        session.flush().await.unwrap();

        let id = session.conversation_id().unwrap().to_string();
        let conversation = store.get_conversation(&id).await.unwrap().unwrap();
        assert_eq!(conversation.name, "Tell me something in");
        assert_eq!(conversation.session_id.as_deref(), Some("s1"));

        let durable = store.list_messages(&id).await.unwrap();
        assert_eq!(durable.len(), 2);
        assert_eq!(durable[1].content, "Hi there");
        assert_eq!(durable[1].model, "openai/gpt-4.1-nano");

        // The stream saw the new user message as the last history entry.
        let seen = stream.seen.lock().unwrap();
        assert_eq!(
            seen[0].last().unwrap().content,
            "Tell me something interesting about Rust"
        );
    }

    #[tokio::test]
    async fn merged_view_dedupes_once_durable_catches_up() {
        let store = Arc::new(MemoryChatStore::new());
        let stream = Scripted::new(vec![text("ok"), done("google/gemini-2.0-flash")]);
        let mut session = ConversationSession::new(store, stream, anon(), "google/gemini-2.0-flash");
        session.submit("hello").await.unwrap();
        assert_eq!(session.messages().len(), 2);

        session.flush().await.unwrap();
        session.refresh().await.unwrap();
        let merged = session.messages();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].role, Role::User);
        assert_eq!(merged[1].role, Role::Assistant);
        assert!(session.exchange().is_none());
    }

    #[tokio::test]
    async fn error_frame_abandons_assistant_but_keeps_user() {
        let store = Arc::new(MemoryChatStore::new());
        let stream = Scripted::new(vec![
            text("partial "),
            text("answer"),
            Ok(Frame::Error {
                message: "OpenAI request failed".into(),
            }),
        ]);
        let mut session = ConversationSession::new(store.clone(), stream, anon(), "openai/gpt-4o");
        let err = session.submit("question").await.unwrap_err();
        assert!(matches!(err, ClientError::Generation(ref m) if m == "OpenAI request failed"));
        assert_eq!(session.error(), Some("OpenAI request failed"));

        session.flush().await.unwrap();
        let id = session.conversation_id().unwrap().to_string();
        let durable = store.list_messages(&id).await.unwrap();
        assert_eq!(durable.len(), 1);
        assert_eq!(durable[0].role, Role::User);

        let view = session.messages();
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].content, "question");
    }

    #[tokio::test]
    async fn transport_failure_mid_stream_is_an_error() {
        let store = Arc::new(MemoryChatStore::new());
        let stream = Scripted::new(vec![text("a"), Err("connection reset".into())]);
        let mut session = ConversationSession::new(store, stream, anon(), "openai/gpt-4o");
        assert!(session.submit("q").await.is_err());
        assert!(matches!(session.phase(), ExchangePhase::Error(_)));
    }

    #[tokio::test]
    async fn stream_cut_before_metadata_is_not_persisted() {
        let store = Arc::new(MemoryChatStore::new());
        let stream = Scripted::new(vec![text("half an ans")]);
        let mut session = ConversationSession::new(store.clone(), stream, anon(), "openai/gpt-4o");
        let err = session.submit("q").await.unwrap_err();
        assert!(matches!(err, ClientError::Protocol(_)));
        assert!(matches!(session.phase(), ExchangePhase::Error(_)));

        session.flush().await.unwrap();
        let id = session.conversation_id().unwrap().to_string();
        let durable = store.list_messages(&id).await.unwrap();
        assert_eq!(durable.len(), 1);
        assert_eq!(durable[0].role, Role::User);
        assert_eq!(session.messages().len(), 1);
    }

    #[tokio::test]
    async fn frames_after_metadata_are_not_read() {
        let store = Arc::new(MemoryChatStore::new());
        let stream = Scripted::new(vec![
            text("done"),
            done("openai/gpt-4o"),
            text(" and more"),
        ]);
        let mut session = ConversationSession::new(store, stream, anon(), "openai/gpt-4o");
        session.submit("q").await.unwrap();
        assert_eq!(session.exchange().unwrap().assistant().content, "done");
    }

    #[tokio::test]
    async fn rejected_open_keeps_user_message() {
        let store = Arc::new(MemoryChatStore::new());
        let mut session =
            ConversationSession::new(store.clone(), Arc::new(Refusing), anon(), "openai/gpt-4o");
        let err = session.submit("hi").await.unwrap_err();
        assert!(matches!(err, ClientError::Rejected { status: 400, .. }));
        session.flush().await.unwrap();
        let id = session.conversation_id().unwrap().to_string();
        assert_eq!(store.list_messages(&id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn submit_while_streaming_is_rejected() {
        let store = Arc::new(MemoryChatStore::new());
        let stream = Scripted::new(vec![text("x")]);
        let mut session = ConversationSession::new(store, stream, anon(), "openai/gpt-4o");
        let _frames = session.begin("first").await.unwrap();
        assert_eq!(session.phase(), ExchangePhase::Streaming);
        assert!(matches!(session.begin("second").await, Err(ClientError::Busy)));
    }

    #[tokio::test]
    async fn second_exchange_reuses_conversation_and_carries_history() {
        let store = Arc::new(MemoryChatStore::new());
        let stream = Scripted::new(vec![text("reply"), done("openai/gpt-4o")]);
        let mut session = ConversationSession::new(store, stream.clone(), anon(), "openai/gpt-4o");
        session.submit("one").await.unwrap();
        let first_id = session.conversation_id().unwrap().to_string();
        session.submit("two").await.unwrap();
        assert_eq!(session.conversation_id(), Some(first_id.as_str()));

        let seen = stream.seen.lock().unwrap();
        let roles: Vec<Role> = seen[1].iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User]);
    }

    #[tokio::test]
    async fn blank_text_is_not_submitted() {
        let store = Arc::new(MemoryChatStore::new());
        let mut session =
            ConversationSession::new(store, Scripted::new(vec![]), anon(), "openai/gpt-4o");
        assert!(matches!(session.submit("   ").await, Err(ClientError::EmptyMessage)));
        assert!(session.conversation_id().is_none());
    }
}
