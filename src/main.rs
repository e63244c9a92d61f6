//! rhovoice - talk to a Gemini Live model from the terminal
//!
//! Reads slash commands from stdin, streams the microphone while recording,
//! and plays the model's voice through PulseAudio.

use anyhow::{bail, Context, Result};
use rhovoice::capture::PulseMicrophone;
use rhovoice::commands::{self, UserCommand};
use rhovoice::config::{AppConfig, Voice, PRESETS};
use rhovoice::gemini_client::{ClientConfig, GeminiConnector};
use rhovoice::output::spawn_output;
use rhovoice::prompt::{Document, PromptGenerator, PromptReply};
use rhovoice::session::{Command, SessionController, SessionHandle, SessionSettings, SessionState, SessionStatus};
use rhovoice::tools::WeatherClient;
use rhovoice::visualizer::{spawn_sampler, Activity, Sampler, Tap, SAMPLE_PERIOD};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const APP_NAME: &str = "rhovoice";
const METER_PERIOD: Duration = Duration::from_millis(100);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppConfig::from_env().context("invalid configuration")?;
    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.first().map(String::as_str) {
        None => run_interactive(config).await,
        Some("prompt") => run_prompt(&config, args.get(1).map(Path::new)).await,
        Some(other) => bail!("unknown argument '{}'; usage: rhovoice [prompt <file.pdf>]", other),
    }
}

/// Generate a persona from a PDF and print the reply as JSON.
async fn run_prompt(config: &AppConfig, path: Option<&Path>) -> Result<()> {
    let generator = PromptGenerator::new(&config.api_key);
    let document = match path {
        Some(path) => Document::load(path).await.ok(),
        None => None,
    };

    let result = generator.generate(document.as_ref()).await;
    let status = result.as_ref().err().map(|e| e.status());
    println!("{}", serde_json::to_string_pretty(&PromptReply::from(result))?);

    match status {
        Some(status) => bail!("prompt generation failed with status {}", status),
        None => Ok(()),
    }
}

async fn run_interactive(config: AppConfig) -> Result<()> {
    info!("Starting {}", APP_NAME);

    let input_tap = Tap::new();
    let output_tap = Tap::new();

    let (mut engine, ended) =
        spawn_output(APP_NAME, None, output_tap.clone()).context("failed to open audio output")?;

    let connector = GeminiConnector::new(ClientConfig::from_api_key(&config.api_key, &config.model));
    let microphone = PulseMicrophone::new(APP_NAME, config.input_device.clone());
    let settings = SessionSettings {
        config: config.session.clone(),
        settle_delay: config.settle_delay,
        weather: WeatherClient::default(),
        input_tap: input_tap.clone(),
    };
    let controller = SessionController::new(connector, microphone, engine.handle(), settings);
    let (session, session_task) = controller.spawn(ended);

    let activity_status = session.status();
    let (sampler_task, levels) = spawn_sampler(
        Sampler::new(input_tap, output_tap),
        move || {
            let status = activity_status.borrow();
            Activity {
                recording: status.recording,
                ready: status.state == SessionState::Ready,
            }
        },
        SAMPLE_PERIOD,
    );

    let meter_on = Arc::new(AtomicBool::new(false));
    let meter_flag = meter_on.clone();
    let meter_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(METER_PERIOD);
        loop {
            ticker.tick().await;
            if meter_flag.load(Ordering::Relaxed) {
                eprint!("\r{}", levels.borrow().meter_line());
            }
        }
    });

    let mut status_rx = session.status();
    let status_task = tokio::spawn(async move {
        let mut last = status_rx.borrow_and_update().clone();
        print_status(&last);
        while status_rx.changed().await.is_ok() {
            let current = status_rx.borrow_and_update().clone();
            if current.state != last.state || current.message != last.message {
                print_status(&current);
            }
            if current.transcript != last.transcript {
                if let Some(line) = &current.transcript {
                    println!("{}", line);
                }
            }
            last = current;
        }
    });

    println!("{}", commands::HELP);
    let generator = PromptGenerator::new(&config.api_key);
    if let Err(e) = command_loop(&session, &generator, &meter_on).await {
        error!("Command loop failed: {}", e);
    }

    let _ = session.send(Command::Shutdown).await;
    if let Err(e) = session_task.await {
        error!("Session task failed: {}", e);
    }
    sampler_task.abort();
    meter_task.abort();
    status_task.abort();
    engine.shutdown();
    info!("Goodbye");
    Ok(())
}

async fn command_loop(
    session: &SessionHandle,
    generator: &PromptGenerator,
    meter_on: &AtomicBool,
) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let line = tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => line,
                None => return Ok(()),
            },
            _ = &mut ctrl_c => return Ok(()),
        };

        let command = match commands::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                println!("{}", e);
                continue;
            }
        };

        match &command {
            UserCommand::Voices => {
                let names: Vec<_> = Voice::ALL.iter().map(Voice::as_str).collect();
                println!("Voices: {}", names.join(", "));
            }
            UserCommand::Presets => {
                for preset in PRESETS {
                    println!("  {:<20} {}", preset.name, preset.prompt);
                }
            }
            UserCommand::Help => println!("{}", commands::HELP),
            UserCommand::Status => print_status_detail(&session.current()),
            UserCommand::Meter => {
                let enabled = !meter_on.fetch_xor(true, Ordering::Relaxed);
                if !enabled {
                    eprintln!();
                }
            }
            UserCommand::PersonaFrom(path) => {
                println!("Generating persona from {}...", path.display());
                let document = Document::load(path).await.ok();
                match generator.generate(document.as_ref()).await {
                    Ok(persona) => {
                        println!("Generated persona:\n{}", persona);
                        session.send(Command::SetPersona(persona)).await?;
                    }
                    Err(e) => println!("{}", e),
                }
            }
            _ => {}
        }

        if let Some(command) = command.to_session_command() {
            let quit = command == Command::Shutdown;
            session.send(command).await?;
            if quit {
                return Ok(());
            }
        }
    }
}

fn print_status(status: &SessionStatus) {
    match &status.message {
        Some(message) => println!("[{}] {}", status.state, message),
        None => println!("[{}]", status.state),
    }
}

fn print_status_detail(status: &SessionStatus) {
    println!("State:     {}", status.state);
    println!("Recording: {}", if status.recording { "yes" } else { "no" });
    println!("Voice:     {}", status.config.voice);
    let tools: Vec<_> = status.config.tools.iter().map(|t| t.name()).collect();
    println!(
        "Tools:     {}",
        if tools.is_empty() { "none".to_string() } else { tools.join(", ") }
    );
    println!("Persona:   {}", status.config.persona);
}
