//! screenpilot: drive the local desktop with a vision-language model.
//!
//! ```bash
//! screenpilot "open the settings app and enable dark mode"
//! screenpilot --config ./config.toml --max-loop 10 "search for rust"
//! ```
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use screenpilot::agent_engine::state::TurnPayload;
use screenpilot::config::{load_config, load_config_from};
use screenpilot::executor::dispatcher::ComputerOperator;
use screenpilot::executor::input::EnigoDriver;
use screenpilot::llm::providers::openai_compatible::OpenAiCompatibleModel;
use screenpilot::perception::screenshot::PrimaryMonitorCapture;
use screenpilot::{EventBus, GuiAgent, RunEvent, RunStatus};

#[derive(Parser)]
#[command(name = "screenpilot")]
#[command(version)]
#[command(about = "Vision-driven GUI automation loop")]
struct Args {
    /// Instruction in natural language
    #[arg(trailing_var_arg = true, required = true)]
    instruction: Vec<String>,

    /// Path to config.toml (default: next to the binary, cwd, then user config dir)
    #[arg(short, long, env = "SCREENPILOT_CONFIG")]
    config: Option<PathBuf>,

    /// Override agent.max_loop_count
    #[arg(long)]
    max_loop: Option<u32>,

    /// Override the system prompt with the contents of a file
    #[arg(long, value_name = "FILE")]
    system_prompt: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    screenpilot::init_tracing();

    let args = Args::parse();
    match run(args).await {
        Ok(status) => {
            println!("run finished: {status:?}");
            if matches!(status, RunStatus::Error) {
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    }
}

async fn run(args: Args) -> screenpilot::PilotResult<RunStatus> {
    let mut cfg = match &args.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    if let Some(max) = args.max_loop {
        cfg.agent.max_loop_count = max;
    }

    let model = OpenAiCompatibleModel::from_config(&cfg.model, cfg.factors());
    let operator = ComputerOperator::new(EnigoDriver, PrimaryMonitorCapture);
    let (events, mut rx) = EventBus::channel();

    let mut agent = GuiAgent::new(Arc::new(operator), Arc::new(model), cfg.loop_config())
        .with_language(cfg.agent.language.clone())
        .with_event_sink(events);
    if let Some(path) = &args.system_prompt {
        agent = agent.with_system_prompt(std::fs::read_to_string(path)?);
    } else if let Some(prompt) = &cfg.agent.system_prompt {
        agent = agent.with_system_prompt(prompt.clone());
    }

    let handle = agent.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.stop();
        }
    });

    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            print_event(&event);
        }
    });

    let instruction = args.instruction.join(" ");
    let result = agent.run(&instruction).await;
    drop(agent);
    let _ = printer.await;
    result
}

fn print_event(event: &RunEvent) {
    match event {
        RunEvent::Data(snapshot) => {
            for turn in &snapshot.turns {
                match &turn.payload {
                    TurnPayload::Screenshot { context, .. } => {
                        println!("[{}] screenshot {}x{}", snapshot.loop_count, context.width, context.height);
                    }
                    TurnPayload::Prediction { summary, .. } => {
                        println!("[{}] {}", snapshot.loop_count, summary);
                    }
                    TurnPayload::Instruction { text } => println!("> {text}"),
                }
            }
            if snapshot.turns.is_empty() {
                println!("status: {:?}", snapshot.status);
            }
        }
        RunEvent::Error(snapshot, error) => {
            eprintln!("[{}] {:?}: {}", snapshot.loop_count, error.code, error.message);
        }
    }
}
