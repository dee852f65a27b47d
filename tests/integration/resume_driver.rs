//! Integration tests for the stateless resume driver
//!
//! Every turn here goes through a fresh executor built from a record, the way
//! a server handling one request per turn would use it.

use std::sync::Arc;

use chrono::Utc;
use colloquy::engine::ReplayError;
use colloquy::{
    Args, CallId, EngineError, Message, Program, ResultCache, StepExecutor, Structural,
    TurnOutcome, TurnRecord,
};
use serde_json::json;

use super::common::{number_echo, word_stats, EffectCounter, ScopeIdSequence};

/// Run one turn from `record`, optionally answering the last message first.
async fn turn<R: Structural>(
    program: &Arc<Program<R>>,
    record: TurnRecord,
    reply: Option<&str>,
) -> (TurnOutcome<R>, TurnRecord) {
    let mut executor =
        StepExecutor::from_record(program.clone(), record).expect("record should load");
    if let Some(reply) = reply {
        executor
            .push_user_message(reply)
            .expect("conversation should await a reply");
    }
    let outcome = executor.run(Args::new()).await.expect("turn should run");
    (outcome, executor.to_record())
}

fn texts(record: &TurnRecord) -> Vec<&str> {
    record.transcript.iter().map(|m| m.text.as_str()).collect()
}

/// The three-turn "Enter a number" conversation
#[tokio::test]
async fn test_number_echo_conversation() {
    let program = number_echo(EffectCounter::new());

    let (outcome, record) = turn(&program, TurnRecord::default(), None).await;
    assert_eq!(outcome.message(), &Message::assistant("Enter a number"));
    assert_eq!(texts(&record), ["Enter a number"]);
    assert!(!record.ended);

    let (outcome, record) = turn(&program, record, Some("5")).await;
    assert_eq!(outcome.message().text, "Got: 5");
    assert_eq!(texts(&record), ["Enter a number", "5", "Got: 5"]);
    assert!(!record.ended);

    let (outcome, record) = turn(&program, record, Some("stop")).await;
    match outcome {
        TurnOutcome::Completed { message, value } => {
            assert_eq!(message.text, "Done");
            assert_eq!(value, 0);
        }
        other => panic!("Expected completion, got {:?}", other),
    }
    assert!(record.ended);
    assert_eq!(record.result, Some(json!(0)));
}

/// Re-running at the frontier returns the pending message and changes nothing
#[tokio::test]
async fn test_frontier_run_is_idempotent() {
    let program = number_echo(EffectCounter::new());
    let (_, record) = turn(&program, TurnRecord::default(), None).await;

    let (outcome, again) = turn(&program, record.clone(), None).await;
    assert_eq!(
        outcome,
        TurnOutcome::Suspended {
            message: Message::assistant("Enter a number")
        }
    );
    assert_eq!(again.scope_ids, record.scope_ids);
    assert_eq!(again.transcript, record.transcript);
    assert_eq!(again.cache, record.cache);
    assert!(!again.ended);
}

/// Completed steps are replayed from the cache, never re-run
#[tokio::test]
async fn test_replay_does_not_repeat_effects() {
    let effects = EffectCounter::new();
    let program = word_stats(effects.clone());

    let (_, record) = turn(&program, TurnRecord::default(), None).await;
    assert_eq!(effects.get(), 0);

    let (outcome, record) = turn(&program, record, Some("hello big world")).await;
    assert_eq!(outcome.message().text, "3 words, 13 letters");
    // summarize + three measures
    assert_eq!(effects.get(), 4);

    let (outcome, record) = turn(&program, record, Some("ab")).await;
    assert_eq!(outcome.message().text, "1 words, 2 letters");
    assert_eq!(effects.get(), 6);

    let (outcome, _) = turn(&program, record, Some("")).await;
    assert_eq!(outcome.message().text, "4 words in all");
    assert_eq!(effects.get(), 6);
}

/// Nested calls are keyed by position under the turn's scope id
#[tokio::test]
async fn test_call_ids_follow_nesting() {
    let program = word_stats(EffectCounter::new());
    let (_, record) = turn(&program, TurnRecord::default(), None).await;

    let mut executor = StepExecutor::from_record(program.clone(), record).unwrap();
    executor.push_user_message("one two").unwrap();
    executor.run(Args::new()).await.unwrap();

    let scope = executor.scope_ids()[1];
    let mut keys: Vec<CallId> = executor.delta().iter().map(|(id, _)| id.clone()).collect();
    keys.sort();
    assert_eq!(
        keys,
        vec![
            CallId::new(scope, &[0]),
            CallId::new(scope, &[0, 0]),
            CallId::new(scope, &[0, 1]),
        ]
    );
    assert_eq!(executor.delta().get(&CallId::new(scope, &[0])), Some(&json!([3, 3])));
}

/// A hand-built record with known scope ids is honoured
#[tokio::test]
async fn test_hand_built_record_resumes() {
    let effects = EffectCounter::new();
    let program = number_echo(effects.clone());
    let ids = ScopeIdSequence::new().take(2);

    // Turn one's normalize result is already known, under the second scope id.
    let record = TurnRecord {
        scope_ids: ids.clone(),
        transcript: vec![
            Message::assistant("Enter a number"),
            Message::user(" 5 "),
            Message::assistant("Got: 5"),
            Message::user("stop"),
        ],
        cache: [(CallId::new(ids[1], &[0]), json!("5"))].into_iter().collect(),
        ended: false,
        result: None,
        entry_args: None,
        updated_at: Utc::now(),
    };

    let (outcome, record) = turn(&program, record, None).await;
    assert!(outcome.is_completed());
    assert_eq!(outcome.message().text, "Done");
    // Only "stop" was normalized live.
    assert_eq!(effects.get(), 1);
    assert_eq!(record.scope_ids.len(), 3);
    assert_eq!(&record.scope_ids[..2], &ids[..]);
}

/// Two executors resuming the same record record the same call positions
#[tokio::test]
async fn test_resume_is_deterministic() {
    let program = word_stats(EffectCounter::new());
    let (_, record) = turn(&program, TurnRecord::default(), None).await;
    let (_, record) = turn(&program, record, Some("a bb")).await;

    let mut positions = Vec::new();
    for _ in 0..2 {
        let mut executor = StepExecutor::from_record(program.clone(), record.clone()).unwrap();
        executor.push_user_message("ccc dddd").unwrap();
        let outcome = executor.run(Args::new()).await.unwrap();
        assert_eq!(outcome.message().text, "2 words, 7 letters");

        let scope = executor.scope_ids()[2].to_string();
        let mut suffixes: Vec<String> = executor
            .delta()
            .iter()
            .map(|(id, _)| id.as_str().trim_start_matches(scope.as_str()).to_string())
            .collect();
        suffixes.sort();
        positions.push(suffixes);
    }
    assert_eq!(positions[0], positions[1]);
    assert_eq!(positions[0], ["/0", "/0/0", "/0/1"]);
}

/// A cache entry that no longer decodes aborts the turn
#[tokio::test]
async fn test_divergent_cache_is_fatal() {
    let program = number_echo(EffectCounter::new());
    let (_, record) = turn(&program, TurnRecord::default(), None).await;
    let (_, mut record) = turn(&program, record, Some("5")).await;

    let call_id = CallId::new(record.scope_ids[1], &[0]);
    record.cache = [(call_id, json!(5))].into_iter().collect();
    record.transcript.push(Message::user("6"));

    let mut executor = StepExecutor::from_record(program, record.clone()).unwrap();
    let err = executor.run(Args::new()).await.unwrap_err();
    assert!(matches!(err, EngineError::Codec(_)));
    assert_eq!(executor.transcript(), &record.transcript[..]);
    assert_eq!(executor.cache(), &record.cache);
}

/// Dropping the cache makes replay impossible
#[tokio::test]
async fn test_missing_cache_is_fatal() {
    let program = number_echo(EffectCounter::new());
    let (_, record) = turn(&program, TurnRecord::default(), None).await;
    let (_, mut record) = turn(&program, record, Some("5")).await;
    record.cache = ResultCache::new();
    record.transcript.push(Message::user("6"));

    let mut executor = StepExecutor::from_record(program, record).unwrap();
    let err = executor.run(Args::new()).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Replay(ReplayError::MissingCacheEntry { .. })
    ));
}

/// Records survive a round trip through disk between turns
#[tokio::test]
async fn test_turns_across_saved_records() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("conversation.json");
    let program = number_echo(EffectCounter::new());

    for reply in [None, Some("1"), Some("2"), Some("stop")] {
        let record = TurnRecord::load_or_default(&path).unwrap();
        let (_, record) = turn(&program, record, reply).await;
        record.save(&path).unwrap();
    }

    let record = TurnRecord::load(&path).unwrap();
    assert!(record.ended);
    assert_eq!(
        texts(&record),
        ["Enter a number", "1", "Got: 1", "2", "Got: 2", "stop", "Done"]
    );
    assert_eq!(record.cache.len(), 3);
    assert_eq!(record.scope_ids.len(), 4);
}

/// Later turns must bind to the same entry arguments as the first
#[tokio::test]
async fn test_changed_entry_arguments_are_rejected() {
    let program = colloquy::demo::shared_prime_counter().unwrap();
    let mut executor = StepExecutor::start(program.clone());
    executor
        .run(Args::new().named("end_phrase", "Bye"))
        .await
        .unwrap();
    assert_eq!(executor.entry_args(), Some(&json!({ "end_phrase": "Bye" })));
    let record = executor.to_record();
    assert_eq!(record.entry_args, Some(json!({ "end_phrase": "Bye" })));

    // Falling back to the default end phrase would replay under other inputs.
    let mut resumed = StepExecutor::from_record(program.clone(), record.clone()).unwrap();
    resumed.push_user_message("Bye").unwrap();
    let err = resumed.run(Args::new()).await.unwrap_err();
    match err {
        EngineError::Replay(ReplayError::EntryArgsChanged { recorded, given }) => {
            assert_eq!(recorded, json!({ "end_phrase": "Bye" }));
            assert_eq!(given, json!({ "end_phrase": "End" }));
        }
        other => panic!("Expected changed entry arguments, got {:?}", other),
    }
    assert_eq!(resumed.transcript().len(), record.transcript.len() + 1);
    assert!(!resumed.has_ended());

    let outcome = resumed
        .run(Args::new().named("end_phrase", "Bye"))
        .await
        .unwrap();
    assert!(outcome.is_completed());
    assert_eq!(outcome.message().text, "0 prime number(s) received!");
}

/// Records written before entry arguments were kept adopt the next turn's
#[tokio::test]
async fn test_record_without_entry_arguments_adopts_them() {
    let program = number_echo(EffectCounter::new());
    let (_, mut record) = turn(&program, TurnRecord::default(), None).await;
    assert_eq!(record.entry_args, Some(json!({})));

    record.entry_args = None;
    let (outcome, record) = turn(&program, record, Some("3")).await;
    assert_eq!(outcome.message().text, "Got: 3");
    assert_eq!(record.entry_args, Some(json!({})));
}
