use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use voice_tutor::escalation::HttpEscalationClient;
use voice_tutor::history::{FileHistoryStore, HistoryStore, PronunciationHistory};
use voice_tutor::metrics::HttpMetricsClient;
use voice_tutor::stream::HttpInferenceService;
use voice_tutor::voice::{AudioCapture, AudioSource, CpalSink, HttpAudioFetcher, level_dbfs};
use voice_tutor::{
    Config, EscalationDraft, Level, PracticeMode, SessionController, SessionOptions,
    SessionServices, SpeakingMetrics, TurnOutcome, TurnState, score_turn,
};

/// Voice Tutor - spoken conversation practice with a streaming tutor
#[derive(Parser)]
#[command(name = "tutor", version, about)]
struct Cli {
    /// Learner level (A1-C2); overrides config
    #[arg(short, long, env = "TUTOR_LEVEL")]
    level: Option<Level>,

    /// Practice mode: hybrid or immersive; overrides config
    #[arg(short, long, env = "TUTOR_PRACTICE_MODE")]
    mode: Option<PracticeMode>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start a practice session (default)
    Talk,
    /// Show the pronunciation history
    History {
        /// Number of entries to list
        #[arg(short, long, default_value = "10")]
        count: usize,
    },
    /// Score a saved metrics record without contacting the service
    Score {
        /// JSON file holding a speaking metrics record
        path: PathBuf,
    },
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn,voice_tutor=info",
        1 => "info,voice_tutor=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load()?;
    if let Some(level) = cli.level {
        config.level = level;
    }
    if let Some(mode) = cli.mode {
        config.practice_mode = mode;
    }
    tracing::debug!(?config, "loaded configuration");

    match cli.command.unwrap_or(Command::Talk) {
        Command::Talk => talk(config).await,
        Command::History { count } => show_history(&config, count),
        Command::Score { path } => score_file(&config, &path),
        Command::TestMic { duration } => test_mic(duration).await,
    }
}

/// Interactive push-to-talk loop on stdin
async fn talk(config: Config) -> anyhow::Result<()> {
    let inference =
        HttpInferenceService::new(&config.inference_url).with_retry(config.retry_policy());
    let services = SessionServices {
        source: Box::new(AudioCapture::new()),
        inference: Arc::new(inference),
        metrics: Arc::new(HttpMetricsClient::new(&config.api_base_url)),
        escalation: Arc::new(HttpEscalationClient::new(&config.api_base_url)),
        history: Arc::new(FileHistoryStore::new(&config.history_path)),
        fetcher: Arc::new(HttpAudioFetcher::new()),
        sink: Arc::new(CpalSink::new()?),
    };
    let session = SessionController::new(services, SessionOptions::from(&config));

    tracing::info!(
        level = %config.level,
        mode = %config.practice_mode,
        inference = %config.inference_url,
        "session ready"
    );

    let mut shown = print_new(&session, 0).await;
    print_help(session.escalation_enabled());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !handle_line(&session, line.trim(), &done_tx).await {
                    break;
                }
            }
            Some(outcome) = done_rx.recv() => {
                tracing::debug!(?outcome, "turn finished");
                if outcome == TurnOutcome::Completed
                    && let Some(banner) = session.banner().await
                {
                    println!(
                        "  [{}] {:.0} | {} | {} | {}",
                        banner.score.badges.pronunciation.label,
                        banner.score.pronunciation_score,
                        banner.score.badges.speed.label,
                        banner.score.badges.clarity.label,
                        banner.score.badges.volume.label
                    );
                }
            }
        }
        shown = print_new(&session, shown).await;
    }

    session.shutdown().await;
    Ok(())
}

/// Act on one input line; returns false to quit
async fn handle_line(
    session: &SessionController,
    line: &str,
    done: &mpsc::UnboundedSender<TurnOutcome>,
) -> bool {
    match line {
        "" if session.state().await == TurnState::Recording => {
            match session.stop_recording().await {
                Ok(handle) => {
                    let done = done.clone();
                    tokio::spawn(async move {
                        let _ = done.send(handle.outcome().await);
                    });
                }
                Err(e) => println!("! {e}"),
            }
        }
        "" => match session.start_recording().await {
            Ok(_) => println!("(recording, press Enter to send)"),
            Err(e) => println!("! {e}"),
        },
        "c" | "cancel" => {
            if !session.cancel_turn().await {
                println!("(nothing to cancel)");
            }
        }
        "m" | "mode" => {
            let next = match session.mode().await {
                PracticeMode::Hybrid => PracticeMode::Immersive,
                PracticeMode::Immersive => PracticeMode::Hybrid,
            };
            session.set_mode(next).await;
            println!("(mode: {next})");
        }
        "h" | "history" => print_summary(&session.history_summary().await),
        "q" | "quit" => return false,
        other => {
            if let Some(rest) = other.strip_prefix("escalate") {
                escalate(session, rest.trim()).await;
            } else if let Some(level) = other.strip_prefix("level ") {
                match level.parse::<Level>() {
                    Ok(level) => {
                        session.set_level(level).await;
                        println!("(level: {level})");
                    }
                    Err(e) => println!("! {e}"),
                }
            } else {
                print_help(session.escalation_enabled());
            }
        }
    }
    true
}

/// Escalate the most recent user turn: `escalate <reason>[; note]`
async fn escalate(session: &SessionController, args: &str) {
    let messages = session.messages().await;
    let Some((turn_index, _)) = voice_tutor::last_user_transcript(&messages) else {
        println!("! no spoken turn to escalate");
        return;
    };

    let (reason, note) = args.split_once(';').unwrap_or((args, ""));
    let reason = if reason.trim().is_empty() {
        "pronunciation feedback"
    } else {
        reason.trim()
    };

    let draft = EscalationDraft {
        turn_index,
        reasons: vec![reason.to_string()],
        note: Some(note.trim().to_string()),
    };
    match session.escalate(draft).await {
        Ok(record) => println!("(escalated as {}, {:?})", record.id, record.status),
        Err(e) => println!("! {e}"),
    }
}

async fn print_new(session: &SessionController, shown: usize) -> usize {
    let messages = session.messages().await;
    // The active turn's trailing slots are printed once they fill
    let settled = if session.state().await.is_active() {
        messages
            .iter()
            .rposition(|m| !m.is_pending())
            .map_or(0, |i| i + 1)
    } else {
        messages.len()
    };
    for message in messages.iter().take(settled).skip(shown) {
        if message.is_pending() {
            continue;
        }
        let who = match message.role {
            voice_tutor::Role::User => "you",
            voice_tutor::Role::Assistant => "tutor",
        };
        match (message.text_content(), message.audio_ref()) {
            (Some(text), _) => println!("{who}: {text}"),
            (None, Some(_)) => println!("{who}: (audio)"),
            (None, None) => {}
        }
    }
    settled.max(shown)
}

fn print_help(escalation: bool) {
    println!("Enter: start/stop recording | c: cancel | m: toggle mode | h: history | q: quit");
    println!("level <A1-C2>: change level");
    if escalation {
        println!("escalate <reason>[; note]: ask a teacher to review your last turn");
    }
}

fn print_summary(summary: &voice_tutor::ProgressSummary) {
    match summary.recent {
        Some(recent) => {
            let average = summary.average.unwrap_or(recent);
            let trend = summary
                .trend
                .map_or_else(|| "n/a".to_string(), |t| format!("{t:?}").to_lowercase());
            println!("recent {recent:.0} | average {average:.0} | trend {trend}");
        }
        None => println!("no pronunciation history yet"),
    }
}

fn show_history(config: &Config, count: usize) -> anyhow::Result<()> {
    let store = FileHistoryStore::new(&config.history_path);
    let history = store
        .load()?
        .unwrap_or_else(|| PronunciationHistory::with_capacity(config.history_capacity));

    print_summary(&history.summary());
    for entry in history.snapshot(count) {
        println!(
            "{}  {:>5.1}  {}  {}",
            entry.timestamp.format("%Y-%m-%d %H:%M"),
            entry.score,
            entry.level,
            entry.transcript.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

fn score_file(config: &Config, path: &std::path::Path) -> anyhow::Result<()> {
    let data = std::fs::read_to_string(path)?;
    let metrics: SpeakingMetrics = serde_json::from_str(&data)?;
    let level = metrics.level.unwrap_or(config.level);
    let score = score_turn(&metrics, level, &config.scoring);

    println!(
        "pronunciation: {:.1} ({})",
        score.pronunciation_score, score.badges.pronunciation.label
    );
    println!("rhythm:        {:.1}", score.rhythm_score);
    for badge in [&score.badges.speed, &score.badges.clarity, &score.badges.volume] {
        println!("{:<14} {:?}  {}", badge.label, badge.tone, badge.tooltip);
    }
    for reason in &score.reasons {
        println!("  - {reason}");
    }
    Ok(())
}

/// Test microphone input
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let mut capture = AudioCapture::new();
    capture.start()?;

    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let samples = capture.peek_buffer();
        let (rms, peak) = level_dbfs(&samples);
        println!("[{:2}s] RMS: {rms:6.1} dBFS | Peak: {peak:6.1} dBFS", i + 1);

        capture.clear_buffer();
    }

    let _ = capture.stop();

    println!("\n---");
    println!("If RMS rose above -50 dBFS while you spoke, your mic is working!");
    Ok(())
}
