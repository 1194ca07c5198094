//! Client side of a chat turn: the conversation state machine and the
//! incremental reader for the relay's line-delimited event stream.

use crate::client::RelayClient;
use crate::platform::Platform;
use crate::protocol::{Message, Sender, StreamEvent};
use crate::speech::SpeechOutput;
use crate::tools::execute_tool;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::fmt::Display;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

pub const FAILURE_TEXT: &str = "Oops! Something went wrong. Please try again.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Sending,
    Streaming,
    Completed,
    ToolExecuted,
    Failed,
    /// The turn was dropped by `clear` before it settled. Reported by
    /// `consume_stream`; a `Conversation` never holds this state.
    Abandoned,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TurnError {
    #[error("a reply is still streaming")]
    Busy,
    #[error("nothing to send")]
    Empty,
}

/// Identifies one turn by its in-progress assistant message. Message ids are
/// never reused, so updates through a handle from before a `clear` are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnHandle {
    message_id: u64,
}

#[derive(Debug)]
pub struct Conversation {
    messages: Vec<Message>,
    next_id: u64,
    state: TurnState,
    in_progress: Option<TurnHandle>,
    muted: bool,
}

pub type SharedConversation = Arc<Mutex<Conversation>>;

pub fn lock(conversation: &SharedConversation) -> MutexGuard<'_, Conversation> {
    conversation.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

impl Conversation {
    pub fn new() -> Self {
        Self {
            messages: Vec::new(),
            next_id: 0,
            state: TurnState::Idle,
            in_progress: None,
            muted: false,
        }
    }

    pub fn into_shared(self) -> SharedConversation {
        Arc::new(Mutex::new(self))
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn is_busy(&self) -> bool {
        matches!(self.state, TurnState::Sending | TurnState::Streaming)
    }

    pub fn muted(&self) -> bool {
        self.muted
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    /// The assistant message still being streamed, if any.
    pub fn in_progress(&self) -> Option<&Message> {
        let handle = self.in_progress?;
        self.messages.iter().find(|m| m.id == handle.message_id)
    }

    fn push(&mut self, sender: Sender, text: impl Into<String>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.messages.push(Message::new(id, sender, text));
        id
    }

    /// Records the user's message and an empty assistant placeholder. Returns
    /// the turn handle and the history to post to the relay.
    pub fn begin_turn(
        &mut self,
        text: &str,
        image: Option<String>,
    ) -> Result<(TurnHandle, Vec<Message>), TurnError> {
        if self.is_busy() {
            return Err(TurnError::Busy);
        }
        if text.trim().is_empty() && image.is_none() {
            return Err(TurnError::Empty);
        }

        let user_id = self.push(Sender::User, text);
        if let Some(last) = self.messages.last_mut() {
            last.image = image;
        }
        let history = self.messages.clone();

        let message_id = self.push(Sender::Ai, "");
        let handle = TurnHandle { message_id };
        self.in_progress = Some(handle);
        self.state = TurnState::Sending;
        tracing::debug!(user_id, message_id, "turn started");

        Ok((handle, history))
    }

    fn is_current(&self, turn: &TurnHandle) -> bool {
        self.in_progress.as_ref() == Some(turn)
    }

    fn mark_streaming(&mut self, turn: &TurnHandle) {
        if self.is_current(turn) {
            self.state = TurnState::Streaming;
        }
    }

    fn append_text(&mut self, turn: &TurnHandle, text: &str) {
        if !self.is_current(turn) {
            return;
        }
        if let Some(message) = self.messages.iter_mut().find(|m| m.id == turn.message_id) {
            message.text.push_str(text);
        }
    }

    fn remove_placeholder(&mut self, turn: &TurnHandle) {
        self.messages.retain(|m| m.id != turn.message_id);
        self.in_progress = None;
    }

    /// Ends the turn normally and returns the assistant text, if any.
    fn complete(&mut self, turn: &TurnHandle) -> Option<String> {
        if !self.is_current(turn) {
            return None;
        }
        self.in_progress = None;
        self.state = TurnState::Completed;

        self.messages
            .iter()
            .find(|m| m.id == turn.message_id)
            .map(|m| m.text.clone())
            .filter(|text| !text.is_empty())
    }

    /// Replaces the assistant placeholder with the result of a silent action.
    fn finish_with_action(&mut self, turn: &TurnHandle, result: String) {
        if !self.is_current(turn) {
            return;
        }
        self.remove_placeholder(turn);
        self.push(Sender::System, result);
        self.state = TurnState::ToolExecuted;
    }

    /// Replaces the assistant placeholder with the generic failure message.
    /// Returns false when the turn was already abandoned.
    fn fail(&mut self, turn: &TurnHandle) -> bool {
        if !self.is_current(turn) {
            return false;
        }
        self.remove_placeholder(turn);
        self.push(Sender::Ai, FAILURE_TEXT);
        self.state = TurnState::Failed;
        true
    }

    /// Drops every message and abandons any turn in flight.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.in_progress = None;
        self.state = TurnState::Idle;
    }
}

/// Reassembles newline-terminated lines from arbitrarily split UTF-8 chunks.
#[derive(Debug, Default)]
pub struct LineDecoder {
    pending: Vec<u8>,
    buffer: String,
}

impl LineDecoder {
    /// Feeds one network chunk and returns every line it completed, trimmed,
    /// with empty lines dropped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        self.decode_pending();

        let mut lines = Vec::new();
        while let Some(idx) = self.buffer.find('\n') {
            let line = self.buffer[..idx].trim().to_string();
            self.buffer.drain(..=idx);
            if !line.is_empty() {
                lines.push(line);
            }
        }
        lines
    }

    /// Flushes whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        if !self.pending.is_empty() {
            self.buffer.push_str(&String::from_utf8_lossy(&self.pending));
            self.pending.clear();
        }
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim();
        (!rest.is_empty()).then(|| rest.to_string())
    }

    // Moves the longest valid prefix of `pending` into `buffer`, keeping an
    // incomplete trailing sequence for the next chunk.
    fn decode_pending(&mut self) {
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    self.buffer.push_str(text);
                    self.pending.clear();
                    return;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    self.buffer
                        .push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match err.error_len() {
                        Some(len) => {
                            self.buffer.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                        None => {
                            self.pending.drain(..valid);
                            return;
                        }
                    }
                }
            }
        }
    }
}

enum LineOutcome {
    Continue,
    ToolExecuted,
    Abandoned,
}

async fn handle_line(
    conversation: &SharedConversation,
    turn: &TurnHandle,
    line: &str,
    platform: &dyn Platform,
) -> LineOutcome {
    let event: StreamEvent = match serde_json::from_str(line) {
        Ok(event) => event,
        Err(err) => {
            tracing::warn!(error = %err, line, "skipping malformed stream line");
            return LineOutcome::Continue;
        }
    };

    match event {
        StreamEvent::Text(text) => {
            let mut conversation = lock(conversation);
            if !conversation.is_current(turn) {
                return LineOutcome::Abandoned;
            }
            conversation.append_text(turn, &text);
            LineOutcome::Continue
        }
        StreamEvent::ToolCall(call) => {
            if !lock(conversation).is_current(turn) {
                tracing::info!(tool = %call.name, "dropping silent action from abandoned turn");
                return LineOutcome::Abandoned;
            }
            tracing::info!(tool = %call.name, args = ?call.args, "model requested silent action");
            let result = match execute_tool(&call, platform).await {
                Ok(message) => message,
                Err(err) => {
                    tracing::error!(error = ?err, "silent action failed");
                    err.to_string()
                }
            };
            lock(conversation).finish_with_action(turn, result);
            LineOutcome::ToolExecuted
        }
    }
}

fn fail_turn(
    conversation: &SharedConversation,
    turn: &TurnHandle,
    speech: &dyn SpeechOutput,
) -> TurnState {
    let (failed, muted) = {
        let mut conversation = lock(conversation);
        (conversation.fail(turn), conversation.muted())
    };
    if !failed {
        return TurnState::Abandoned;
    }
    if !muted {
        speech.speak(FAILURE_TEXT);
    }
    TurnState::Failed
}

/// Reads the event stream for `turn` until it ends, a silent action runs, or
/// the read fails. Dropping `body` on return cancels the underlying read.
pub async fn consume_stream<S, E>(
    conversation: &SharedConversation,
    turn: &TurnHandle,
    mut body: S,
    platform: &dyn Platform,
    speech: &dyn SpeechOutput,
) -> TurnState
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Display,
{
    if !lock(conversation).is_current(turn) {
        return TurnState::Abandoned;
    }
    lock(conversation).mark_streaming(turn);
    let mut decoder = LineDecoder::default();

    loop {
        let (lines, ended) = match body.next().await {
            Some(Ok(chunk)) => (decoder.push(&chunk), false),
            Some(Err(err)) => {
                tracing::error!(error = %err, "event stream read failed");
                return fail_turn(conversation, turn, speech);
            }
            None => (decoder.finish().into_iter().collect(), true),
        };

        for line in &lines {
            match handle_line(conversation, turn, line, platform).await {
                LineOutcome::Continue => {}
                LineOutcome::ToolExecuted => return TurnState::ToolExecuted,
                LineOutcome::Abandoned => return TurnState::Abandoned,
            }
        }

        if ended {
            break;
        }
    }

    let (text, muted) = {
        let mut conversation = lock(conversation);
        if !conversation.is_current(turn) {
            return TurnState::Abandoned;
        }
        (conversation.complete(turn), conversation.muted())
    };
    if let Some(text) = text {
        if !muted {
            speech.speak(&text);
        }
    }
    TurnState::Completed
}

/// Runs one full turn: records the user message, posts the history to the
/// relay and consumes the reply.
pub async fn run_turn(
    conversation: &SharedConversation,
    client: &RelayClient,
    text: &str,
    image: Option<String>,
    platform: &dyn Platform,
    speech: &dyn SpeechOutput,
) -> Result<TurnState, TurnError> {
    let (turn, history) = lock(conversation).begin_turn(text, image)?;
    speech.cancel();

    match client.open_stream(&history).await {
        Ok(body) => Ok(consume_stream(conversation, &turn, body, platform, speech).await),
        Err(err) => {
            tracing::error!(error = %err, "failed to reach relay");
            Ok(fail_turn(conversation, &turn, speech))
        }
    }
}
