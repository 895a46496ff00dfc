//! histwin CLI
//!
//! Runs window selection on chat request bodies, counts tokens and shows the
//! effective configuration. Every command prints one JSON document to stdout;
//! logs go to stderr.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::Read;

use histwin::{
    count_batch, counter_for, prepare_request, ChatBody, Config, Message, ModelSpec,
    SelectionPolicy, TokenizerKind,
};

#[derive(Parser)]
#[command(name = "histwin")]
#[command(about = "histwin - fit chat history into a model's token limit", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Select the history window for a chat request body
    Select {
        /// Path to a chat body JSON file (or - to read from stdin)
        #[arg(default_value = "-")]
        input: String,
        /// Selection policy (default, includeFirstPrompt); overrides MEMORY_STYLE
        #[arg(short, long)]
        policy: Option<String>,
        /// Tokens reserved for the reply; overrides MAX_TOKENS
        #[arg(short, long)]
        reserved: Option<u32>,
        /// Tokenizer (gpt3, cl100k, estimate); overrides TOKENIZER
        #[arg(short, long)]
        tokenizer: Option<String>,
    },
    /// Token counting commands
    Tokens {
        #[command(subcommand)]
        action: TokensAction,
    },
    /// Model catalogue commands
    Models {
        #[command(subcommand)]
        action: ModelsAction,
    },
    /// Configuration commands
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum TokensAction {
    /// Count tokens in one or more texts
    Count {
        /// Texts to count (- reads one text from stdin)
        #[arg(required = true)]
        texts: Vec<String>,
        /// Tokenizer (gpt3, cl100k, estimate); overrides TOKENIZER
        #[arg(short, long)]
        tokenizer: Option<String>,
    },
}

#[derive(Subcommand)]
enum ModelsAction {
    /// List built-in models and their token limits
    List,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the configuration loaded from the environment
    Show,
}

// ============ Output Types ============

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SelectOutput {
    model: String,
    policy: SelectionPolicy,
    system_prompt: String,
    temperature: f32,
    messages: Vec<Message>,
    running_total: u32,
    token_limit: u32,
    reserved_generation: u32,
    dropped: usize,
}

#[derive(Serialize)]
struct TokenCountOutput {
    tokenizer: TokenizerKind,
    tokens: u32,
    counts: Vec<u32>,
}

#[derive(Serialize)]
struct ErrorOutput {
    error: String,
}

// ============ Main ============

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Select {
            input,
            policy,
            reserved,
            tokenizer,
        } => handle_select(&input, policy, reserved, tokenizer),
        Commands::Tokens { action } => handle_tokens(action),
        Commands::Models { action } => handle_models(action),
        Commands::Config { action } => handle_config(action),
    };

    match result {
        Ok(json) => println!("{}", json),
        Err(e) => {
            let error = ErrorOutput {
                error: format!("{:#}", e),
            };
            match serde_json::to_string(&error) {
                Ok(json) => println!("{}", json),
                Err(_) => eprintln!("{:#}", e),
            }
            std::process::exit(1);
        }
    }
}

// ============ Handlers ============

fn read_input(source: &str) -> Result<String> {
    if source == "-" {
        let mut buffer = String::new();
        std::io::stdin()
            .read_to_string(&mut buffer)
            .context("Failed to read stdin")?;
        Ok(buffer)
    } else {
        std::fs::read_to_string(source).with_context(|| format!("Failed to read {}", source))
    }
}

fn load_config(
    policy: Option<String>,
    reserved: Option<u32>,
    tokenizer: Option<String>,
) -> Result<Config> {
    let mut config = Config::from_env()?;
    if let Some(policy) = policy {
        config.policy = policy.parse::<SelectionPolicy>().map_err(anyhow::Error::msg)?;
    }
    if let Some(reserved) = reserved {
        config.reserved_generation = reserved;
    }
    if let Some(tokenizer) = tokenizer {
        config.tokenizer = tokenizer.parse::<TokenizerKind>()?;
    }
    Ok(config)
}

fn handle_select(
    input: &str,
    policy: Option<String>,
    reserved: Option<u32>,
    tokenizer: Option<String>,
) -> Result<String> {
    let config = load_config(policy, reserved, tokenizer)?;
    let body = ChatBody::from_json(&read_input(input)?).context("Invalid chat body")?;

    let counter = counter_for(config.tokenizer);
    let request = prepare_request(body, &config, counter.as_ref())?;

    let output = SelectOutput {
        model: request.model.id.clone(),
        policy: config.policy,
        dropped: request.dropped,
        system_prompt: request.system_prompt,
        temperature: request.temperature,
        messages: request.messages,
        running_total: request.running_total,
        token_limit: request.token_limit,
        reserved_generation: config.reserved_generation,
    };

    Ok(serde_json::to_string(&output)?)
}

fn handle_tokens(action: TokensAction) -> Result<String> {
    match action {
        TokensAction::Count { texts, tokenizer } => {
            let config = load_config(None, None, tokenizer)?;
            let inputs = texts
                .into_iter()
                .map(|text| if text == "-" { read_input("-") } else { Ok(text) })
                .collect::<Result<Vec<_>>>()?;
            let refs: Vec<&str> = inputs.iter().map(String::as_str).collect();

            let counter = counter_for(config.tokenizer);
            let counts = count_batch(counter.as_ref(), &refs);
            let output = TokenCountOutput {
                tokenizer: config.tokenizer,
                tokens: counts.iter().sum(),
                counts,
            };

            Ok(serde_json::to_string(&output)?)
        }
    }
}

fn handle_models(action: ModelsAction) -> Result<String> {
    match action {
        ModelsAction::List => Ok(serde_json::to_string(&ModelSpec::catalogue())?),
    }
}

fn handle_config(action: ConfigAction) -> Result<String> {
    match action {
        ConfigAction::Show => {
            let config = Config::from_env()?;
            Ok(serde_json::to_string(&config)?)
        }
    }
}
