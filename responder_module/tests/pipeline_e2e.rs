mod test_support;

use std::sync::atomic::Ordering;

use chrono::Utc;
use uuid::Uuid;

use responder_module::connection_store::ConnectionStore;
use responder_module::notification_queue::{EnqueueOutcome, NotificationQueue, QueueStatus};
use responder_module::processing_log::ProcessingLog;
use responder_module::rule_store::RuleStore;
use responder_module::rules::{PatternType, ReplyMode, RuleAction, SenderRule};
use test_support::build_pipeline;

fn rule(
    user_id: Uuid,
    pattern: &str,
    pattern_type: PatternType,
    action: RuleAction,
    priority: i32,
) -> SenderRule {
    SenderRule {
        id: Uuid::new_v4(),
        user_id,
        pattern: pattern.to_string(),
        pattern_type,
        action,
        reply_mode_override: None,
        custom_instructions: None,
        priority,
        active: true,
        created_at: Utc::now(),
    }
}

async fn enqueue_and_process(pipeline: &test_support::Pipeline, cursor: i64) -> Uuid {
    let outcome = pipeline
        .queue
        .enqueue(pipeline.user_id, "user@example.com", cursor)
        .expect("enqueue");
    let EnqueueOutcome::Enqueued(entry_id) = outcome else {
        panic!("expected enqueue, got duplicate");
    };
    pipeline.dispatcher.process_entry(entry_id).await;
    entry_id
}

#[tokio::test]
async fn new_message_with_no_rules_creates_draft() {
    let pipeline = build_pipeline("user@example.com", ReplyMode::Draft);
    pipeline.provider.plan_delivery(&["m1"], 120);
    pipeline
        .provider
        .add_message("m1", "boss@co.com", "Quarterly numbers", "Please review.");

    let entry_id = enqueue_and_process(&pipeline, 120).await;

    let entry = pipeline.queue.get(entry_id).expect("get").expect("entry");
    assert_eq!(entry.status, QueueStatus::Completed);

    let drafts = pipeline.provider.drafts.lock().unwrap();
    assert_eq!(drafts.len(), 1);
    assert_eq!(drafts[0].to, "boss@co.com");
    assert_eq!(drafts[0].subject, "Re: Quarterly numbers");

    let log = pipeline.log.entries_for_user(pipeline.user_id);
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].action, "replied_draft");
    assert!(log[0].result_id.is_some());
    assert!(log[0].error.is_none());

    let stats = pipeline
        .log
        .daily_stats(pipeline.user_id, Utc::now().date_naive())
        .expect("stats")
        .expect("row");
    assert_eq!(stats.total_processed, 1);
    assert_eq!(stats.drafts_created, 1);
    assert_eq!(stats.emails_sent, 0);
}

#[tokio::test]
async fn ignore_rule_suppresses_generation_and_provider_calls() {
    let pipeline = build_pipeline("user@example.com", ReplyMode::Draft);
    pipeline.rules.insert(&rule(
        pipeline.user_id,
        "*@spam.com",
        PatternType::Domain,
        RuleAction::Ignore,
        0,
    )).expect("rule");
    pipeline.provider.plan_delivery(&["m1"], 120);
    pipeline
        .provider
        .add_message("m1", "x@spam.com", "WIN BIG", "Click here.");

    enqueue_and_process(&pipeline, 120).await;

    assert_eq!(pipeline.generator.calls.load(Ordering::SeqCst), 0);
    assert!(pipeline.provider.drafts.lock().unwrap().is_empty());
    assert!(pipeline.provider.sent.lock().unwrap().is_empty());

    let log = pipeline.log.entries_for_user(pipeline.user_id);
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].action, "ignored");

    let stats = pipeline
        .log
        .daily_stats(pipeline.user_id, Utc::now().date_naive())
        .expect("stats")
        .expect("row");
    assert_eq!(stats.total_ignored, 1);
    assert_eq!(stats.total_processed, 1);
}

#[tokio::test]
async fn generation_failure_does_not_abort_the_batch() {
    let pipeline = build_pipeline("user@example.com", ReplyMode::Draft);
    pipeline.generator.fail_for("broken@co.com");
    pipeline.provider.plan_delivery(&["m1", "m2"], 130);
    pipeline
        .provider
        .add_message("m1", "broken@co.com", "First", "body");
    pipeline
        .provider
        .add_message("m2", "fine@co.com", "Second", "body");

    let entry_id = enqueue_and_process(&pipeline, 130).await;

    // Per-message isolation: the second message still gets its draft and
    // the entry completes.
    let entry = pipeline.queue.get(entry_id).expect("get").expect("entry");
    assert_eq!(entry.status, QueueStatus::Completed);
    assert_eq!(pipeline.provider.drafts.lock().unwrap().len(), 1);

    let log = pipeline.log.entries_for_user(pipeline.user_id);
    assert_eq!(log.len(), 2);
    let failed = log.iter().find(|entry| entry.message_id == "m1").unwrap();
    assert_eq!(failed.action, "failed");
    assert!(failed.error.is_some());
    let ok = log.iter().find(|entry| entry.message_id == "m2").unwrap();
    assert_eq!(ok.action, "replied_draft");

    let stats = pipeline
        .log
        .daily_stats(pipeline.user_id, Utc::now().date_naive())
        .expect("stats")
        .expect("row");
    assert_eq!(stats.total_processed, 2);
    assert_eq!(stats.total_failed, 1);
    assert_eq!(stats.drafts_created, 1);
}

#[tokio::test]
async fn duplicate_delivery_processes_once() {
    let pipeline = build_pipeline("user@example.com", ReplyMode::Draft);
    pipeline.provider.plan_delivery(&["m1"], 120);
    pipeline
        .provider
        .add_message("m1", "boss@co.com", "Hello", "body");

    let first = pipeline
        .queue
        .enqueue(pipeline.user_id, "user@example.com", 120)
        .expect("enqueue");
    let second = pipeline
        .queue
        .enqueue(pipeline.user_id, "user@example.com", 120)
        .expect("enqueue");
    assert_eq!(second, EnqueueOutcome::Duplicate);

    let EnqueueOutcome::Enqueued(entry_id) = first else {
        panic!("expected enqueue");
    };
    pipeline.dispatcher.process_entry(entry_id).await;

    assert_eq!(pipeline.provider.history_calls.load(Ordering::SeqCst), 1);
    assert_eq!(pipeline.log.entries_for_user(pipeline.user_id).len(), 1);
    assert_eq!(pipeline.queue.entries_for_user(pipeline.user_id).len(), 1);
}

#[tokio::test]
async fn stale_cursor_rebaselines_without_error() {
    let pipeline = build_pipeline("user@example.com", ReplyMode::Draft);
    pipeline.provider.plan_stale();
    pipeline.provider.current_cursor.store(500, Ordering::SeqCst);

    let summary = pipeline
        .dispatcher
        .pull_now(pipeline.user_id)
        .await
        .expect("pull succeeds despite stale cursor");
    assert_eq!(summary.total, 0);

    let connection = pipeline
        .connections
        .find_by_user(pipeline.user_id)
        .expect("lookup")
        .expect("present");
    assert_eq!(connection.last_history_id, Some(500));
    assert!(connection.last_synced_at.is_some());
}

#[tokio::test]
async fn first_run_baseline_returns_no_messages() {
    let pipeline = build_pipeline("user@example.com", ReplyMode::Draft);
    let mut connection = pipeline
        .connections
        .find_by_user(pipeline.user_id)
        .expect("lookup")
        .expect("present");
    connection.last_history_id = None;
    pipeline.connections.upsert(&connection).expect("upsert");
    pipeline.provider.current_cursor.store(700, Ordering::SeqCst);

    let summary = pipeline
        .dispatcher
        .pull_now(pipeline.user_id)
        .await
        .expect("pull");
    assert_eq!(summary.total, 0);
    assert_eq!(pipeline.provider.history_calls.load(Ordering::SeqCst), 0);

    let connection = pipeline
        .connections
        .find_by_user(pipeline.user_id)
        .expect("lookup")
        .expect("present");
    assert_eq!(connection.last_history_id, Some(700));
}

#[tokio::test]
async fn quiet_sync_stamps_sync_time_without_moving_the_cursor() {
    let pipeline = build_pipeline("user@example.com", ReplyMode::Draft);
    // Empty plan: the provider reports no new history past cursor 100.

    let summary = pipeline
        .dispatcher
        .pull_now(pipeline.user_id)
        .await
        .expect("pull");
    assert_eq!(summary.total, 0);

    let connection = pipeline
        .connections
        .find_by_user(pipeline.user_id)
        .expect("lookup")
        .expect("present");
    assert_eq!(connection.last_history_id, Some(100));
    assert!(connection.last_synced_at.is_some());
}

#[tokio::test]
async fn lower_priority_value_wins_on_collision() {
    let pipeline = build_pipeline("user@example.com", ReplyMode::Draft);
    let mut send_rule = rule(
        pipeline.user_id,
        "boss@co.com",
        PatternType::Exact,
        RuleAction::Reply,
        1,
    );
    send_rule.reply_mode_override = Some(ReplyMode::Send);
    pipeline.rules.insert(&send_rule).expect("rule");
    pipeline.rules.insert(&rule(
        pipeline.user_id,
        "*@co.com",
        PatternType::Domain,
        RuleAction::Ignore,
        2,
    )).expect("rule");

    pipeline.provider.plan_delivery(&["m1"], 120);
    pipeline
        .provider
        .add_message("m1", "boss@co.com", "Urgent", "body");

    enqueue_and_process(&pipeline, 120).await;

    assert_eq!(pipeline.provider.sent.lock().unwrap().len(), 1);
    assert!(pipeline.provider.drafts.lock().unwrap().is_empty());
    let log = pipeline.log.entries_for_user(pipeline.user_id);
    assert_eq!(log[0].action, "replied_sent");
    assert_eq!(log[0].matched_rule_id, Some(send_rule.id));
}

#[tokio::test]
async fn custom_instructions_reach_the_generator() {
    let pipeline = build_pipeline("user@example.com", ReplyMode::Draft);
    let mut instructed = rule(
        pipeline.user_id,
        "vip@co.com",
        PatternType::Exact,
        RuleAction::Reply,
        0,
    );
    instructed.custom_instructions = Some("Be extra warm.".to_string());
    pipeline.rules.insert(&instructed).expect("rule");

    pipeline.provider.plan_delivery(&["m1"], 120);
    pipeline
        .provider
        .add_message("m1", "vip@co.com", "Hi", "body");

    enqueue_and_process(&pipeline, 120).await;

    let drafts = pipeline.provider.drafts.lock().unwrap();
    assert_eq!(drafts.len(), 1);
    assert!(drafts[0].body.contains("Be extra warm."));
}

#[tokio::test]
async fn auto_reply_disabled_completes_without_provider_calls() {
    let pipeline = build_pipeline("user@example.com", ReplyMode::Draft);
    let mut connection = pipeline
        .connections
        .find_by_user(pipeline.user_id)
        .expect("lookup")
        .expect("present");
    connection.auto_reply_enabled = false;
    pipeline.connections.upsert(&connection).expect("upsert");

    let entry_id = enqueue_and_process(&pipeline, 120).await;

    let entry = pipeline.queue.get(entry_id).expect("get").expect("entry");
    assert_eq!(entry.status, QueueStatus::Completed);
    assert_eq!(pipeline.provider.history_calls.load(Ordering::SeqCst), 0);
    assert!(pipeline.log.entries_for_user(pipeline.user_id).is_empty());
}

#[tokio::test]
async fn manual_pull_reports_per_message_outcomes() {
    let pipeline = build_pipeline("user@example.com", ReplyMode::Draft);
    pipeline.rules.insert(&rule(
        pipeline.user_id,
        "*@spam.com",
        PatternType::Domain,
        RuleAction::Ignore,
        0,
    )).expect("rule");
    pipeline.provider.plan_delivery(&["m1", "m2"], 140);
    pipeline
        .provider
        .add_message("m1", "x@spam.com", "Spam", "body");
    pipeline
        .provider
        .add_message("m2", "boss@co.com", "Real", "body");

    let summary = pipeline
        .dispatcher
        .pull_now(pipeline.user_id)
        .await
        .expect("pull");
    assert_eq!(summary.total, 2);
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.skipped, 1);
    let ignored = summary
        .results
        .iter()
        .find(|result| result.message_id == "m1")
        .unwrap();
    assert_eq!(ignored.action, "ignored");
    let drafted = summary
        .results
        .iter()
        .find(|result| result.message_id == "m2")
        .unwrap();
    assert_eq!(drafted.action, "replied_draft");
    assert!(drafted.error.is_none());
}

#[tokio::test]
async fn failed_entry_is_reprocessed_after_redelivery() {
    let pipeline = build_pipeline("user@example.com", ReplyMode::Draft);
    pipeline.generator.fail_for("only@co.com");
    pipeline.provider.plan_delivery(&["m1"], 120);
    pipeline
        .provider
        .add_message("m1", "only@co.com", "Hi", "body");

    let entry_id = enqueue_and_process(&pipeline, 120).await;
    let entry = pipeline.queue.get(entry_id).expect("get").expect("entry");
    // Generation failure is per-message, the entry itself completes.
    assert_eq!(entry.status, QueueStatus::Completed);

    // Force the entry into failed to exercise the redelivery reset.
    pipeline.queue.mark_failed(entry_id, "operator note").expect("mark");
    let outcome = pipeline
        .queue
        .enqueue(pipeline.user_id, "user@example.com", 120)
        .expect("enqueue");
    assert_eq!(outcome, EnqueueOutcome::Enqueued(entry_id));
    let entry = pipeline.queue.get(entry_id).expect("get").expect("entry");
    assert_eq!(entry.status, QueueStatus::Pending);
}
