//! Live, task-based streaming.
//!
//! A [`ContinuousExecutor`] runs a program on its own tokio task for the whole
//! conversation. Assistant messages flow out through one queue and user
//! replies flow in through another; no scope or cache is involved, so every
//! step runs live.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, Stream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::engine::codec::Structural;
use crate::engine::{
    Args, Context, Conversation, EngineError, Interrupt, Message, Program, ProtocolError,
};

/// Where the program stands, from the caller's side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    /// The program is blocked on a reply that has not been posted.
    AwaitingReply,
    Ended,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct LiveStatus {
    input_requests: u64,
    ended: bool,
}

/// Program-side endpoints.
struct LiveConversation {
    assistant_tx: mpsc::UnboundedSender<String>,
    user_rx: Mutex<mpsc::UnboundedReceiver<String>>,
    status: Arc<watch::Sender<LiveStatus>>,
}

#[async_trait]
impl Conversation for LiveConversation {
    async fn next_user_message(&self) -> Result<Message, Interrupt> {
        self.status.send_modify(|status| status.input_requests += 1);
        let mut user_rx = self.user_rx.lock().await;
        match user_rx.recv().await {
            Some(text) => Ok(Message::user(text)),
            None => Err(ProtocolError::ChannelClosed.into()),
        }
    }

    async fn post_assistant_message(&self, text: String) -> Result<(), Interrupt> {
        self.assistant_tx
            .send(text)
            .map_err(|_| ProtocolError::ChannelClosed.into())
    }
}

/// Runs one conversation live on a spawned task.
///
/// Dropping the executor closes both queues; a program blocked on either
/// side then fails with [`ProtocolError::ChannelClosed`].
pub struct ContinuousExecutor<R> {
    assistant_rx: mpsc::UnboundedReceiver<String>,
    user_tx: Option<mpsc::UnboundedSender<String>>,
    status: watch::Receiver<LiveStatus>,
    replies_posted: u64,
    task: Option<JoinHandle<Result<R, EngineError>>>,
}

impl<R: Structural> ContinuousExecutor<R> {
    /// Spawn `program` with `args`. Must be called within a tokio runtime.
    pub fn start(program: Arc<Program<R>>, args: Args) -> Self {
        let (assistant_tx, assistant_rx) = mpsc::unbounded_channel();
        let (user_tx, user_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(LiveStatus::default());
        let status_tx = Arc::new(status_tx);

        let conversation = Arc::new(LiveConversation {
            assistant_tx,
            user_rx: Mutex::new(user_rx),
            status: status_tx.clone(),
        });

        let task = tokio::spawn(async move {
            let cx = Context::builder().conversation(conversation).build();
            let outcome = program.run(&cx, args).await;
            // Release the program-side queue ends before reporting the end.
            drop(cx);
            status_tx.send_modify(|status| status.ended = true);

            match outcome {
                Ok(value) => {
                    tracing::info!(program = %program.name(), "live conversation completed");
                    Ok(value)
                }
                Err(Interrupt::Suspend) => Err(ProtocolError::UnexpectedSuspend.into()),
                Err(Interrupt::Failed(err)) => {
                    tracing::warn!(program = %program.name(), error = %err, "live conversation failed");
                    Err(err)
                }
            }
        });

        Self {
            assistant_rx,
            user_tx: Some(user_tx),
            status: status_rx,
            replies_posted: 0,
            task: Some(task),
        }
    }

    /// The next assistant message, or `None` once the program has finished
    /// and every message has been consumed.
    pub async fn next_message(&mut self) -> Option<String> {
        self.assistant_rx.recv().await
    }

    /// An already-produced assistant message, without waiting.
    pub fn try_next_message(&mut self) -> Option<String> {
        self.assistant_rx.try_recv().ok()
    }

    /// Every assistant message produced so far.
    pub fn drain_messages(&mut self) -> Vec<String> {
        std::iter::from_fn(|| self.try_next_message()).collect()
    }

    /// Assistant messages as a stream, ending with the conversation.
    pub fn messages(&mut self) -> impl Stream<Item = String> + '_ {
        stream::poll_fn(move |cx| self.assistant_rx.poll_recv(cx))
    }

    /// Queue a user reply. Replies posted before the program asks are
    /// buffered in order.
    pub fn post_reply(&mut self, text: impl Into<String>) -> Result<(), ProtocolError> {
        if self.has_ended() {
            return Err(ProtocolError::ConversationEnded);
        }
        let user_tx = self.user_tx.as_ref().ok_or(ProtocolError::ChannelClosed)?;
        user_tx.send(text.into()).map_err(|_| {
            if self.status.borrow().ended {
                ProtocolError::ConversationEnded
            } else {
                ProtocolError::ChannelClosed
            }
        })?;
        self.replies_posted += 1;
        Ok(())
    }

    /// Wait until the program either needs a reply that has not been posted
    /// yet or has finished.
    pub async fn wait_for_turn(&mut self) -> Result<TurnState, ProtocolError> {
        let replies_posted = self.replies_posted;
        let status = self
            .status
            .wait_for(|status| status.ended || status.input_requests > replies_posted)
            .await
            .map_err(|_| ProtocolError::ChannelClosed)?;
        Ok(if status.ended {
            TurnState::Ended
        } else {
            TurnState::AwaitingReply
        })
    }

    pub fn has_ended(&self) -> bool {
        self.status.borrow().ended
    }

    /// Close the reply queue and wait for the program's result.
    pub async fn join(mut self) -> Result<R, EngineError> {
        self.user_tx.take();
        let task = self
            .task
            .take()
            .ok_or_else(|| EngineError::Task("conversation task already joined".to_string()))?;
        match task.await {
            Ok(result) => result,
            Err(err) => Err(EngineError::Task(err.to_string())),
        }
    }
}

impl<R> Drop for ContinuousExecutor<R> {
    fn drop(&mut self) {
        self.assistant_rx.close();
        self.user_tx.take();
    }
}
