//! Session controller integration tests
//!
//! Drives whole turns against in-process fakes on a paused clock.

use std::time::Duration;

use voice_tutor::history::HistoryStore;
use voice_tutor::session::{
    EMPTY_RECORDING_NOTICE, ERROR_NOTICE, TIMEOUT_NOTICE, TurnHandle, placeholder_count,
};
use voice_tutor::{
    AudioRef, ConversationMessage, EscalationDraft, Error, PracticeMode, Role, Snapshot,
    SpeakingMetrics, TurnOutcome, TurnState,
};

mod common;

use common::{
    FakeInference, FakeSource, Harness, reply_text, reply_with_audio, sample_metrics, settle,
    test_options,
};

/// Record and submit one turn
async fn speak(h: &Harness) -> TurnHandle {
    h.session.start_recording().await.unwrap();
    h.session.stop_recording().await.unwrap()
}

#[tokio::test(start_paused = true)]
async fn reply_fills_a_single_placeholder() {
    let h = Harness::new(
        FakeInference::new("I like tea")
            .script(vec![reply_text("Me"), reply_text("Me too!")])
            .paced(Duration::from_millis(100)),
    );

    let handle = speak(&h).await;
    assert_eq!(h.session.state().await, TurnState::ProcessingUpload);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let messages = h.session.messages().await;
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[1].text_content(), Some("I like tea"));
    assert_eq!(placeholder_count(&messages), 1);
    assert_eq!(h.session.state().await, TurnState::AwaitingReply);

    assert_eq!(handle.outcome().await, TurnOutcome::Completed);

    let messages = h.session.messages().await;
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0].text_content(), Some("Hi! Ready to practice?"));
    assert_eq!(messages[2].text_content(), Some("Me too!"));
    assert_eq!(placeholder_count(&messages), 0);
    assert_eq!(h.session.state().await, TurnState::Idle);
    assert_eq!(h.session.last_outcome().await, Some(TurnOutcome::Completed));
}

#[tokio::test(start_paused = true)]
async fn second_turn_keeps_earlier_messages() {
    let h = Harness::new(
        FakeInference::new("I like tea")
            .script(vec![reply_text("Me too!")])
            .script(vec![reply_text("Green or black?")]),
    );

    speak(&h).await.outcome().await;
    assert_eq!(speak(&h).await.outcome().await, TurnOutcome::Completed);

    let texts: Vec<_> = h
        .session
        .messages()
        .await
        .iter()
        .map(|m| m.text_content().unwrap_or_default().to_string())
        .collect();
    assert_eq!(
        texts,
        [
            "Hi! Ready to practice?",
            "I like tea",
            "Me too!",
            "I like tea",
            "Green or black?"
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn silent_stream_times_out_once() {
    let h = Harness::new(FakeInference::new("I like tea").hanging());

    let handle = speak(&h).await;
    assert_eq!(handle.outcome().await, TurnOutcome::TimedOut);
    settle().await;

    assert_eq!(h.inference.reply_drops(), 1);
    assert_eq!(h.session.state().await, TurnState::Idle);
    assert_eq!(h.session.last_outcome().await, Some(TurnOutcome::TimedOut));

    let messages = h.session.messages().await;
    assert_eq!(placeholder_count(&messages), 0);
    assert_eq!(messages.last().unwrap().text_content(), Some(TIMEOUT_NOTICE));
    assert_eq!(
        messages
            .iter()
            .filter(|m| m.text_content() == Some(TIMEOUT_NOTICE))
            .count(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn snapshots_keep_the_watchdog_alive() {
    let mut options = test_options();
    options.stream_timeout = Duration::from_secs(1);
    let h = Harness::build(
        FakeSource::with_bytes(vec![1, 2, 3]),
        FakeInference::new("I like tea")
            .script(vec![reply_text("M"), reply_text("Me"), reply_text("Me too!")])
            .paced(Duration::from_millis(800)),
        options,
    );

    let handle = speak(&h).await;
    assert_eq!(handle.outcome().await, TurnOutcome::Completed);
}

#[tokio::test(start_paused = true)]
async fn cancel_stops_all_mutation() {
    let h = Harness::new(
        FakeInference::new("I like tea")
            .script(vec![reply_text("too late")])
            .paced(Duration::from_millis(100))
            .hanging(),
    );

    let handle = speak(&h).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(h.session.cancel_turn().await);
    let frozen = h.session.messages().await;

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.session.messages().await, frozen);
    assert_eq!(handle.outcome().await, TurnOutcome::Cancelled);
    assert_eq!(h.session.last_outcome().await, Some(TurnOutcome::Cancelled));
    assert_eq!(h.inference.reply_drops(), 1);
    assert!(!h.session.cancel_turn().await);
}

#[tokio::test(start_paused = true)]
async fn new_recording_replaces_active_turn() {
    let h = Harness::new(FakeInference::new("I like tea").hanging());

    let first = speak(&h).await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    h.session.start_recording().await.unwrap();
    assert_eq!(first.outcome().await, TurnOutcome::Cancelled);
    assert_eq!(h.session.state().await, TurnState::Recording);

    // The abandoned slot keeps its index; the next turn starts after it
    let messages = h.session.messages().await;
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[1].text_content(), Some("I like tea"));
    assert!(messages[2].is_pending());
}

#[tokio::test(start_paused = true)]
async fn late_metrics_stay_with_their_own_turn() {
    let h = Harness::new(
        FakeInference::new("I like tea")
            .slow_transcription(Duration::from_millis(500))
            .script(vec![reply_text("Me too!")]),
    );
    let quiet = SpeakingMetrics {
        rms_dbfs: -45.0,
        ..sample_metrics()
    };
    h.metrics.delay_next(Duration::from_secs(5), quiet);

    // Replaced while its transcription is still running
    let first = speak(&h).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let second = speak(&h).await;
    let second_turn = second.id();
    assert_eq!(first.outcome().await, TurnOutcome::Cancelled);
    assert_eq!(second.outcome().await, TurnOutcome::Completed);
    settle().await;

    let messages = h.session.messages().await;
    assert_eq!(messages.len(), 5);
    assert!(messages[1].is_pending());
    assert!(messages[2].is_pending());
    assert_eq!(messages[3].text_content(), Some("I like tea"));
    assert_eq!(messages[4].text_content(), Some("Me too!"));
    assert_eq!(h.session.badges_for(3).await.unwrap().volume.label, "Good");

    tokio::time::sleep(Duration::from_secs(5)).await;
    settle().await;

    assert_eq!(h.session.badges_for(3).await.unwrap().volume.label, "Good");
    assert_eq!(h.session.badges_for(1).await.unwrap().volume.label, "Very Low");
    assert_eq!(h.session.banner().await.unwrap().turn, second_turn);
}

#[tokio::test(start_paused = true)]
async fn empty_recording_fails_fast() {
    let h = Harness::build(
        FakeSource::with_bytes(Vec::new()),
        FakeInference::new("unused"),
        test_options(),
    );

    h.session.start_recording().await.unwrap();
    let result = h.session.stop_recording().await;
    assert!(matches!(result, Err(Error::EmptyRecording)));
    settle().await;

    assert_eq!(h.inference.transcribe_calls(), 0);
    assert!(h.metrics.transcripts().is_empty());
    assert_eq!(h.session.state().await, TurnState::Idle);

    let messages = h.session.messages().await;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[1].text_content(), Some(EMPTY_RECORDING_NOTICE));
}

#[tokio::test(start_paused = true)]
async fn denied_microphone_creates_no_turn() {
    let h = Harness::build(
        FakeSource::denied(),
        FakeInference::new("unused"),
        test_options(),
    );

    let result = h.session.start_recording().await;
    assert!(matches!(result, Err(Error::PermissionDenied(_))));
    assert_eq!(h.session.state().await, TurnState::Idle);
    assert_eq!(h.session.messages().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn stream_error_posts_one_notice() {
    let h = Harness::new(
        FakeInference::new("I like tea")
            .script(vec![
                reply_text("Me"),
                Err(Error::Stream("connection reset".into())),
            ]),
    );

    assert_eq!(speak(&h).await.outcome().await, TurnOutcome::Errored);

    let messages = h.session.messages().await;
    assert_eq!(placeholder_count(&messages), 0);
    assert_eq!(
        messages
            .iter()
            .filter(|m| m.text_content() == Some(ERROR_NOTICE))
            .count(),
        1
    );
    assert_eq!(h.session.state().await, TurnState::Idle);
}

#[tokio::test(start_paused = true)]
async fn non_fatal_stream_error_keeps_the_reply() {
    let h = Harness::new(FakeInference::new("I like tea").script(vec![
        reply_text("Me too!"),
        Err(Error::Playback("clip unavailable".into())),
    ]));

    assert_eq!(speak(&h).await.outcome().await, TurnOutcome::Completed);

    let messages = h.session.messages().await;
    assert_eq!(messages.last().unwrap().text_content(), Some("Me too!"));
    assert!(messages.iter().all(|m| m.text_content() != Some(ERROR_NOTICE)));
    assert_eq!(h.session.state().await, TurnState::Idle);
}

#[tokio::test(start_paused = true)]
async fn transcription_failure_errors_the_turn() {
    let mut inference = FakeInference::new("I like tea");
    inference.fail_transcription = true;
    let h = Harness::new(inference);

    assert_eq!(speak(&h).await.outcome().await, TurnOutcome::Errored);
    assert_eq!(h.inference.transcribe_calls(), 1);

    let messages = h.session.messages().await;
    assert_eq!(messages.last().unwrap().text_content(), Some(ERROR_NOTICE));
}

#[tokio::test(start_paused = true)]
async fn transcript_metrics_requested_once_and_recorded() {
    let h = Harness::new(
        FakeInference::new("I like tea")
            .script(vec![
                reply_text("Me"),
                reply_text("Me too"),
                reply_text("Me too!"),
            ]),
    );

    assert_eq!(speak(&h).await.outcome().await, TurnOutcome::Completed);
    settle().await;

    let transcripts = h.metrics.transcripts();
    assert_eq!(transcripts.len(), 2);
    assert_eq!(
        transcripts.iter().filter(|t| t.is_some()).collect::<Vec<_>>(),
        [&Some("I like tea".to_string())]
    );

    assert!(h.session.badges_for(1).await.is_some());
    let banner = h.session.banner().await.unwrap();
    assert!(banner.score.pronunciation_score > 0.0);

    let history = h.session.history(10).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].transcript.as_deref(), Some("I like tea"));

    let stored = h.history.load().unwrap().unwrap();
    assert_eq!(stored.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn metrics_failure_leaves_turn_untouched() {
    let h = Harness::new(FakeInference::new("I like tea").script(vec![reply_text("Me too!")]));
    h.metrics
        .fail
        .store(true, std::sync::atomic::Ordering::SeqCst);

    assert_eq!(speak(&h).await.outcome().await, TurnOutcome::Completed);
    settle().await;

    assert!(h.session.badges_for(1).await.is_none());
    assert!(h.session.banner().await.is_none());
    assert!(h.session.history(10).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn hybrid_plays_each_clip_once() {
    let h = Harness::new(FakeInference::new("I like tea").script(vec![
        reply_with_audio("Hi", "http://a/1.wav"),
        reply_with_audio("Hi there", "http://a/1.wav"),
        reply_with_audio("Hi there!", "http://a/2.wav"),
    ]));

    assert_eq!(speak(&h).await.outcome().await, TurnOutcome::Completed);
    settle().await;

    let mut fetched = h.fetcher.fetched();
    fetched.sort();
    assert_eq!(fetched, ["http://a/1.wav", "http://a/2.wav"]);
    assert_eq!(h.played(), 2);
    assert!(!h.session.is_speaking());
}

#[tokio::test(start_paused = true)]
async fn immersive_plays_only_the_final_clip() {
    let mut options = test_options();
    options.mode = PracticeMode::Immersive;
    let h = Harness::build(
        FakeSource::with_bytes(vec![1, 2, 3]),
        FakeInference::new("I like tea").script(vec![
            reply_with_audio("Hi", "http://a/1.wav"),
            reply_with_audio("Hi there!", "http://a/2.wav"),
        ]),
        options,
    );

    assert_eq!(speak(&h).await.outcome().await, TurnOutcome::Completed);
    settle().await;

    assert_eq!(h.fetcher.fetched(), ["http://a/2.wav"]);
    assert_eq!(h.session.last_played_url().as_deref(), Some("http://a/2.wav"));
}

#[tokio::test(start_paused = true)]
async fn entering_immersive_replays_unplayed_reply() {
    // Reply audio listed in the conversation but never surfaced for playback
    let snapshot = Snapshot::new(vec![
        ConversationMessage::text(Role::Assistant, "Me too!"),
        ConversationMessage::audio(Role::Assistant, AudioRef::from_url("http://a/reply.wav")),
    ]);
    let h = Harness::new(FakeInference::new("I like tea").script(vec![Ok(snapshot)]));

    assert_eq!(speak(&h).await.outcome().await, TurnOutcome::Completed);
    settle().await;
    assert_eq!(h.played(), 0);

    h.session.set_mode(PracticeMode::Immersive).await;
    settle().await;
    assert_eq!(h.played(), 1);

    // Already the last clip played: no second replay
    h.session.set_mode(PracticeMode::Hybrid).await;
    h.session.set_mode(PracticeMode::Immersive).await;
    settle().await;
    assert_eq!(h.played(), 1);
}

#[tokio::test(start_paused = true)]
async fn escalation_falls_back_to_last_played_audio() {
    let snapshot = Snapshot::new(vec![ConversationMessage::text(Role::Assistant, "Me too!")])
        .with_audio(AudioRef::from_url("http://a/reply.wav"));
    let h = Harness::new(FakeInference::new("I like tea").script(vec![Ok(snapshot)]));
    assert!(h.session.escalation_enabled());

    assert_eq!(speak(&h).await.outcome().await, TurnOutcome::Completed);
    settle().await;

    let record = h
        .session
        .escalate(EscalationDraft {
            turn_index: 1,
            reasons: vec!["pronunciation".into()],
            note: Some("  ".into()),
        })
        .await
        .unwrap();
    assert_eq!(record.message_index, Some(1));

    let requests = h.escalation.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].audio_url.as_deref(), Some("http://a/reply.wav"));
    assert_eq!(requests[0].user_text, "I like tea");
    assert_eq!(requests[0].assistant_text.as_deref(), Some("Me too!"));
    assert!(requests[0].note.is_none());
    assert_eq!(h.session.escalated(), [1]);
    assert_eq!(h.session.state().await, TurnState::Idle);
}

#[tokio::test(start_paused = true)]
async fn escalation_rejects_assistant_index() {
    let h = Harness::new(FakeInference::new("I like tea").script(vec![reply_text("Me too!")]));
    speak(&h).await.outcome().await;

    let result = h
        .session
        .escalate(EscalationDraft {
            turn_index: 2,
            reasons: vec!["pronunciation".into()],
            note: None,
        })
        .await;
    assert!(result.is_err());
    assert!(h.session.escalated().is_empty());
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_and_refuses_new_turns() {
    let h = Harness::new(FakeInference::new("I like tea").hanging());
    let handle = speak(&h).await;

    h.session.shutdown().await;
    assert_eq!(handle.outcome().await, TurnOutcome::Cancelled);
    assert!(h.session.start_recording().await.is_err());
}
