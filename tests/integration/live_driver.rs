//! Integration tests for the live streaming driver

use std::time::Duration;

use colloquy::engine::ProtocolError;
use colloquy::{Args, ContinuousExecutor, TurnState};
use futures::StreamExt;
use tokio::time::timeout;

use super::common::{number_echo, word_stats, EffectCounter};

const TIMEOUT: Duration = Duration::from_secs(5);

/// The "Enter a number" conversation, live
#[tokio::test]
async fn test_number_echo_live() {
    let mut executor = ContinuousExecutor::start(number_echo(EffectCounter::new()), Args::new());

    let first = timeout(TIMEOUT, executor.next_message())
        .await
        .expect("first message in time");
    assert_eq!(first.as_deref(), Some("Enter a number"));

    executor.post_reply("5").unwrap();
    assert_eq!(executor.next_message().await.as_deref(), Some("Got: 5"));
    executor.post_reply("stop").unwrap();
    assert_eq!(executor.next_message().await.as_deref(), Some("Done"));

    assert_eq!(executor.wait_for_turn().await, Ok(TurnState::Ended));
    assert_eq!(executor.next_message().await, None);
    assert_eq!(
        executor.post_reply("anything"),
        Err(ProtocolError::ConversationEnded)
    );
    assert_eq!(executor.join().await.unwrap(), 0);
}

/// Without a cache every step call runs
#[tokio::test]
async fn test_live_steps_always_run() {
    let effects = EffectCounter::new();
    let mut executor = ContinuousExecutor::start(word_stats(effects.clone()), Args::new());
    for reply in ["hello big world", "ab", ""] {
        executor.post_reply(reply).unwrap();
    }

    let messages: Vec<String> = timeout(TIMEOUT, executor.messages().collect())
        .await
        .expect("conversation should finish");
    assert_eq!(
        messages,
        [
            "Say something",
            "3 words, 13 letters",
            "1 words, 2 letters",
            "4 words in all"
        ]
    );
    assert_eq!(effects.get(), 6);
    assert_eq!(executor.join().await.unwrap(), 4);
}

/// Conversations on separate executors do not share state
#[tokio::test]
async fn test_concurrent_conversations_are_independent() {
    let effects = EffectCounter::new();
    let program = number_echo(effects.clone());
    let mut left = ContinuousExecutor::start(program.clone(), Args::new());
    let mut right = ContinuousExecutor::start(program, Args::new());

    assert_eq!(left.next_message().await.as_deref(), Some("Enter a number"));
    assert_eq!(right.next_message().await.as_deref(), Some("Enter a number"));

    right.post_reply("2").unwrap();
    left.post_reply("1").unwrap();
    assert_eq!(left.next_message().await.as_deref(), Some("Got: 1"));
    assert_eq!(right.next_message().await.as_deref(), Some("Got: 2"));

    left.post_reply("stop").unwrap();
    assert_eq!(left.next_message().await.as_deref(), Some("Done"));
    assert_eq!(left.wait_for_turn().await, Ok(TurnState::Ended));
    assert_eq!(right.wait_for_turn().await, Ok(TurnState::AwaitingReply));
    assert!(!right.has_ended());

    right.post_reply("stop").unwrap();
    assert_eq!(right.join().await.unwrap(), 0);
    assert_eq!(left.join().await.unwrap(), 0);
    assert_eq!(effects.get(), 4);
}

/// Arguments the entry does not declare fail the conversation
#[tokio::test]
async fn test_unknown_entry_argument() {
    let executor = ContinuousExecutor::start(
        number_echo(EffectCounter::new()),
        Args::new().named("end_phrase", "bye"),
    );
    let err = executor.join().await.unwrap_err();
    assert!(err.to_string().contains("end_phrase"));
}
