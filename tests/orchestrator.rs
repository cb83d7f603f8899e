mod common;

use batch_translate::client::TranslateError;
use batch_translate::error::JobError;
use batch_translate::job::{ChunkStatus, FailureKind, JobHandle, JobStatus};
use batch_translate::journal::MemoryJournal;
use batch_translate::metadata::MemoryStore;
use batch_translate::orchestrator::{Callbacks, RunOptions};
use batch_translate::progress::Progress;
use common::{ScriptClient, harness, harness_with, numbered_lines, test_config};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

const HOUR: Duration = Duration::from_secs(3600);

#[tokio::test(start_paused = true)]
async fn output_follows_index_order_not_completion_order() {
    let mut cfg = test_config();
    cfg.chunking.max_chunk_size = 1;

    let order = Arc::new(Mutex::new(Vec::new()));
    let sink = order.clone();
    let callbacks = Callbacks {
        progress: Some(Arc::new(move |p: &Progress| {
            sink.lock().unwrap().push(p.current_chunk_index.unwrap());
        })),
        status: None,
    };

    let client = ScriptClient::uppercase().with_delay(|text| match text {
        "a" => Duration::from_millis(30),
        "b" => Duration::from_millis(10),
        _ => Duration::ZERO,
    });
    let h = harness_with(
        cfg,
        client,
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryJournal::new()),
        callbacks,
    );

    let job = h.orchestrator.create_job("abc", "abc").unwrap();
    assert_eq!(job.len(), 3);
    let outcome = h
        .orchestrator
        .start(job, RunOptions::default())
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(outcome.status, JobStatus::Completed);
    assert_eq!(outcome.output, "ABC");
    // Notifications arrive in completion order.
    assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    assert_eq!(outcome.progress.processed_chunks, 3);
    assert_eq!(outcome.progress.succeeded_chunks, 3);
}

#[tokio::test]
async fn one_failed_chunk_yields_partial_failure_with_placeholder() {
    let mut cfg = test_config();
    cfg.chunking.max_chunk_size = 8;

    let client = ScriptClient::new(|text| {
        if text.starts_with("line 4") {
            Err(TranslateError::ContentPolicy("flagged".into()))
        } else {
            Ok(text.to_uppercase())
        }
    });
    let h = harness(cfg, client);

    let job = h.orchestrator.create_job("ten", &numbered_lines(10)).unwrap();
    assert_eq!(job.len(), 10);
    let outcome = h
        .orchestrator
        .start(job, RunOptions::default())
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(outcome.status, JobStatus::PartiallyFailed);
    assert_eq!(outcome.progress.failed_chunks, 1);
    assert_eq!(outcome.progress.succeeded_chunks, 9);
    assert!(outcome.output.contains(
        "LINE 3\n[translation failed for chunk 4: content_policy]\nLINE 5\n"
    ));
    assert_eq!(outcome.output.matches("LINE").count(), 9);

    let failed = outcome.job.chunk(4).unwrap();
    assert_eq!(failed.status(), ChunkStatus::Failed);
    assert_eq!(failed.failure().unwrap().kind, FailureKind::ContentPolicy);
    assert_eq!(outcome.report.failed_chunks().count(), 1);

    let meta = h.store.get("ten").unwrap();
    assert_eq!(meta.status, JobStatus::PartiallyFailed);
    assert_eq!(meta.record(4).unwrap().failure, Some(FailureKind::ContentPolicy));
    // One save per resolved chunk plus the final snapshot.
    assert_eq!(h.store.save_count(), 11);
}

#[tokio::test]
async fn resumed_run_skips_exactly_the_chunks_already_translated() {
    let mut cfg = test_config();
    cfg.chunking.max_chunk_size = 8;
    cfg.global.max_workers = 1;
    let text = numbered_lines(8);

    let store = Arc::new(MemoryStore::new());
    let journal = Arc::new(MemoryJournal::new());

    // First run: chunks 0..3 finish, chunk 3 hangs until cancelled.
    let (tx, mut rx) = mpsc::unbounded_channel();
    let callbacks = Callbacks {
        progress: Some(Arc::new(move |p: &Progress| {
            let _ = tx.send(p.processed_chunks);
        })),
        status: None,
    };
    let client = ScriptClient::uppercase().with_delay(|text| {
        if text.starts_with("line 3") {
            HOUR
        } else {
            Duration::ZERO
        }
    });
    let first = harness_with(cfg.clone(), client, store.clone(), journal.clone(), callbacks);
    let job = first.orchestrator.create_job("novel", &text).unwrap();
    let running = first
        .orchestrator
        .start(job, RunOptions::default())
        .await
        .unwrap();
    while let Some(processed) = rx.recv().await {
        if processed == 3 {
            break;
        }
    }
    running.cancel();
    let interrupted = running.wait().await.unwrap();
    assert_eq!(interrupted.status, JobStatus::Cancelled);
    assert_eq!(interrupted.progress.succeeded_chunks, 3);

    let meta = store.get("novel").unwrap();
    assert_eq!(meta.count(ChunkStatus::Succeeded), 3);
    assert_eq!(meta.status, JobStatus::Cancelled);

    // Second run resumes and only translates what is left.
    let second = harness_with(
        cfg,
        ScriptClient::uppercase(),
        store.clone(),
        journal.clone(),
        Callbacks::default(),
    );
    let job = second.orchestrator.create_job("novel", &text).unwrap();
    let outcome = second
        .orchestrator
        .start(job, RunOptions::default())
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(outcome.status, JobStatus::Completed);
    assert_eq!(outcome.progress.skipped_chunks, 3);
    assert_eq!(second.client.calls(), 5);
    assert!(second.client.seen().iter().all(|t| !t.starts_with("line 0")));
    assert_eq!(outcome.output, text.to_uppercase());
}

#[tokio::test]
async fn changed_settings_discard_stored_progress() {
    let mut cfg = test_config();
    cfg.chunking.max_chunk_size = 8;
    let text = numbered_lines(4);

    let first = harness(cfg.clone(), ScriptClient::uppercase());
    let job = first.orchestrator.create_job("doc", &text).unwrap();
    first
        .orchestrator
        .start(job, RunOptions::default())
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    let mut changed = cfg.clone();
    changed.api.model = "another-model".into();
    let second = harness_with(
        changed,
        ScriptClient::uppercase(),
        first.store.clone(),
        first.journal.clone(),
        Callbacks::default(),
    );
    let job = second.orchestrator.create_job("doc", &text).unwrap();
    let outcome = second
        .orchestrator
        .start(job, RunOptions::default())
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(outcome.progress.skipped_chunks, 0);
    assert_eq!(second.client.calls(), 4);
}

#[tokio::test]
async fn snapshot_with_different_chunk_count_is_ignored() {
    let mut cfg = test_config();
    cfg.chunking.max_chunk_size = 8;

    let first = harness(cfg.clone(), ScriptClient::uppercase());
    let job = first.orchestrator.create_job("doc", &numbered_lines(4)).unwrap();
    first
        .orchestrator
        .start(job, RunOptions::default())
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    // Same settings, but the document grew.
    let second = harness_with(
        cfg,
        ScriptClient::uppercase(),
        first.store.clone(),
        first.journal.clone(),
        Callbacks::default(),
    );
    let job = second.orchestrator.create_job("doc", &numbered_lines(6)).unwrap();
    let outcome = second
        .orchestrator
        .start(job, RunOptions::default())
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(outcome.progress.skipped_chunks, 0);
    assert_eq!(second.client.calls(), 6);
}

#[tokio::test]
async fn retry_failed_only_redispatches_failed_chunks() {
    let mut cfg = test_config();
    cfg.chunking.max_chunk_size = 8;
    let text = numbered_lines(6);

    let flaky = ScriptClient::new(|text| {
        if text.starts_with("line 2") {
            Err(TranslateError::Rejected("bad request".into()))
        } else {
            Ok(text.to_uppercase())
        }
    });
    let first = harness(cfg.clone(), flaky);
    let job = first.orchestrator.create_job("doc", &text).unwrap();
    let outcome = first
        .orchestrator
        .start(job, RunOptions::default())
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(outcome.status, JobStatus::PartiallyFailed);
    assert_eq!(
        outcome.job.chunk(2).unwrap().failure().unwrap().kind,
        FailureKind::Rejected
    );

    let second = harness_with(
        cfg,
        ScriptClient::uppercase(),
        first.store.clone(),
        first.journal.clone(),
        Callbacks::default(),
    );
    let job = second.orchestrator.create_job("doc", &text).unwrap();
    let opts = RunOptions {
        resume: false,
        retry_failed_only: true,
    };
    let outcome = second
        .orchestrator
        .start(job, opts)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(outcome.status, JobStatus::Completed);
    assert_eq!(second.client.seen(), vec!["line 2\n".to_string()]);
    assert_eq!(outcome.output, text.to_uppercase());
    // Attempts carry over from the first run.
    assert_eq!(outcome.job.chunk(2).unwrap().attempts(), 2);
}

#[tokio::test]
async fn fresh_run_ignores_stored_progress() {
    let mut cfg = test_config();
    cfg.chunking.max_chunk_size = 8;
    let text = numbered_lines(3);

    let first = harness(cfg.clone(), ScriptClient::uppercase());
    let job = first.orchestrator.create_job("doc", &text).unwrap();
    first
        .orchestrator
        .start(job, RunOptions::default())
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    let second = harness_with(
        cfg,
        ScriptClient::uppercase(),
        first.store.clone(),
        first.journal.clone(),
        Callbacks::default(),
    );
    let job = second.orchestrator.create_job("doc", &text).unwrap();
    let opts = RunOptions {
        resume: false,
        retry_failed_only: false,
    };
    second
        .orchestrator
        .start(job, opts)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(second.client.calls(), 3);
}

#[tokio::test]
async fn cancel_does_not_wait_for_in_flight_calls() {
    let mut cfg = test_config();
    cfg.chunking.max_chunk_size = 8;
    cfg.global.max_workers = 2;

    let statuses = Arc::new(Mutex::new(Vec::new()));
    let sink = statuses.clone();
    let callbacks = Callbacks {
        progress: None,
        status: Some(Arc::new(move |msg: &str| sink.lock().unwrap().push(msg.to_string()))),
    };
    let client = ScriptClient::uppercase().with_delay(|_| HOUR);
    let h = harness_with(
        cfg,
        client,
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryJournal::new()),
        callbacks,
    );

    let job = h.orchestrator.create_job("big", &numbered_lines(20)).unwrap();
    let running = h
        .orchestrator
        .start(job, RunOptions::default())
        .await
        .unwrap();
    let handle = running.handle().clone();
    assert_eq!(handle.status(), JobStatus::Running);

    tokio::time::sleep(Duration::from_millis(50)).await;
    h.orchestrator.cancel("big").unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(1), running.wait())
        .await
        .expect("cancellation took too long")
        .unwrap();

    assert_eq!(outcome.status, JobStatus::Cancelled);
    assert_eq!(handle.status(), JobStatus::Cancelled);
    assert_eq!(h.client.calls(), 2);
    assert_eq!(outcome.progress.processed_chunks, 0);
    assert!(outcome
        .job
        .chunks()
        .iter()
        .all(|c| c.status() == ChunkStatus::Pending));
    assert_eq!(h.store.get("big").unwrap().status, JobStatus::Cancelled);

    let statuses = statuses.lock().unwrap();
    assert!(statuses.iter().any(|m| m.contains("cancelling")));
    assert!(statuses.last().unwrap().contains("cancelled"));
}

#[tokio::test]
async fn second_start_of_an_active_job_is_rejected() {
    let mut cfg = test_config();
    cfg.chunking.max_chunk_size = 8;
    let h = harness(cfg, ScriptClient::uppercase().with_delay(|_| HOUR));

    let first = h.orchestrator.create_job("dup", &numbered_lines(2)).unwrap();
    let again = h.orchestrator.create_job("dup", &numbered_lines(2)).unwrap();

    let running = h
        .orchestrator
        .start(first, RunOptions::default())
        .await
        .unwrap();
    let err = h
        .orchestrator
        .start(again, RunOptions::default())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, JobError::AlreadyRunning(id) if id == "dup"));

    running.cancel();
    running.wait().await.unwrap();

    // Once terminal, the id is free again.
    assert!(h.orchestrator.handle("dup").is_none());
}

#[tokio::test]
async fn cancelling_unknown_job_is_not_found() {
    let h = harness(test_config(), ScriptClient::uppercase());
    assert!(matches!(
        h.orchestrator.cancel("missing"),
        Err(JobError::NotFound(_))
    ));
}

#[tokio::test]
async fn bad_configuration_fails_before_dispatch() {
    let mut cfg = test_config();
    cfg.global.max_workers = 0;
    let h = harness(cfg, ScriptClient::uppercase());
    assert!(matches!(
        h.orchestrator.create_job("x", "text"),
        Err(JobError::Configuration(_))
    ));
    assert_eq!(h.client.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn workers_never_exceed_the_limit() {
    let mut cfg = test_config();
    cfg.chunking.max_chunk_size = 8;
    cfg.global.max_workers = 3;
    let client = ScriptClient::uppercase().with_delay(|_| Duration::from_millis(20));
    let h = harness(cfg, client);

    let job = h.orchestrator.create_job("pool", &numbered_lines(12)).unwrap();
    let outcome = h
        .orchestrator
        .start(job, RunOptions::default())
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(outcome.status, JobStatus::Completed);
    assert_eq!(h.client.calls(), 12);
    assert_eq!(h.client.max_in_flight(), 3);
}

#[tokio::test]
async fn missing_journal_text_forces_retranslation() {
    let mut cfg = test_config();
    cfg.chunking.max_chunk_size = 8;
    let text = numbered_lines(3);

    let first = harness(cfg.clone(), ScriptClient::uppercase());
    let job = first.orchestrator.create_job("doc", &text).unwrap();
    first
        .orchestrator
        .start(job, RunOptions::default())
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    first.journal.forget("doc", 1);

    let second = harness_with(
        cfg,
        ScriptClient::uppercase(),
        first.store.clone(),
        first.journal.clone(),
        Callbacks::default(),
    );
    let job = second.orchestrator.create_job("doc", &text).unwrap();
    let outcome = second
        .orchestrator
        .start(job, RunOptions::default())
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(second.client.seen(), vec!["line 1\n".to_string()]);
    assert_eq!(outcome.progress.skipped_chunks, 2);
    assert_eq!(outcome.output, text.to_uppercase());
}

#[tokio::test]
async fn cancel_after_the_last_chunk_resolved_still_completes() {
    let mut cfg = test_config();
    cfg.chunking.max_chunk_size = 8;

    // The client requests cancellation while answering the only chunk, so the
    // run loop sees the cancel before it has settled that chunk's result.
    let slot: Arc<Mutex<Option<JobHandle>>> = Arc::new(Mutex::new(None));
    let canceller = slot.clone();
    let client = ScriptClient::new(move |text| {
        if let Some(handle) = canceller.lock().unwrap().as_ref() {
            handle.cancel();
        }
        Ok(text.to_uppercase())
    });
    let h = harness(cfg, client);

    let job = h.orchestrator.create_job("late", &numbered_lines(1)).unwrap();
    let running = h
        .orchestrator
        .start(job, RunOptions::default())
        .await
        .unwrap();
    *slot.lock().unwrap() = Some(running.handle().clone());

    let outcome = running.wait().await.unwrap();

    assert_eq!(h.client.calls(), 1);
    assert_eq!(outcome.status, JobStatus::Completed);
    assert_eq!(outcome.output, "LINE 0\n");
    assert_eq!(h.store.get("late").unwrap().status, JobStatus::Completed);
}

#[tokio::test]
async fn aborted_chunks_keep_the_calls_they_spent() {
    let mut cfg = test_config();
    cfg.chunking.max_chunk_size = 8;
    cfg.global.max_workers = 2;
    cfg.global.cancel_grace_ms = 0;
    let h = harness(cfg, ScriptClient::uppercase().with_delay(|_| HOUR));

    let job = h.orchestrator.create_job("spent", &numbered_lines(2)).unwrap();
    let running = h
        .orchestrator
        .start(job, RunOptions::default())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    running.cancel();
    let outcome = tokio::time::timeout(Duration::from_secs(1), running.wait())
        .await
        .expect("cancellation took too long")
        .unwrap();

    assert_eq!(outcome.status, JobStatus::Cancelled);
    assert_eq!(h.client.calls(), 2);
    for chunk in outcome.job.chunks() {
        assert_eq!(chunk.status(), ChunkStatus::Pending);
        assert_eq!(chunk.attempts(), 1);
    }
    let meta = h.store.get("spent").unwrap();
    assert!(meta.chunks.iter().all(|r| r.attempts == 1));
}
