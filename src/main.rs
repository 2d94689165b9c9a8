use std::env;
use std::io;
use std::path::PathBuf;
use std::process::exit;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use tracing_subscriber::EnvFilter;

use tgpt::api::{CompletionClient, CompletionOptions};
use tgpt::api_key::{key_supplied, resolve_api_key, ApiKey, ApiKeyFile};
use tgpt::args::{Args, Command};
use tgpt::config::{Config, ConfigStore};
use tgpt::image::{ImageClient, ImageOptions, ImageSize, ResponseFormat};
use tgpt::progress::with_spinner;
use tgpt::render::format_answers;
use tgpt::repl::Repl;

#[tokio::main]
async fn main() {
    init_logging();
    let args = Args::parse();

    if let Err(e) = run(args).await {
        eprintln!("ERROR: {:#}", e);
        exit(1);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

async fn run(args: Args) -> Result<()> {
    if args.command.is_none() && !args.chat {
        Args::command().print_help()?;
        return Ok(());
    }

    let env_key = env::var("OPENAI_API_KEY").ok();
    // stdin may carry the prompt, so only ask for a key when nothing else has one
    let ask_key = !key_supplied(args.api_key.as_deref(), env_key.as_deref());
    let config = ConfigStore::default_location().load(ask_key);
    let api_base = args.api.unwrap_or_else(|| config.api_base.clone());
    let api_key = resolve_api_key(
        args.api_key.as_deref(),
        &config.api_key,
        env_key,
        &mut ApiKeyFile::default_location(),
    )
    .context(
        "API key must be provided via --key, API in ~/.tgpt/config, OPENAI_API_KEY or ~/.tgpt/api",
    )?;

    match args.command {
        Some(Command::Tx {
            prompt,
            number,
            temperature,
            max_tokens,
        }) => {
            // Read the prompt from stdin if the prompt wasn't supplied
            let prompt = match prompt {
                Some(p) => p,
                None => io::read_to_string(io::stdin())?,
            };
            if prompt.trim().is_empty() {
                eprintln!("No answer produced.");
                return Ok(());
            }
            let mut client = completion_client(&config, api_base, api_key);
            if let Some(temperature) = temperature {
                client.set_temperature(temperature);
            }
            if let Some(max_tokens) = max_tokens {
                client.set_max_tokens(max_tokens);
            }
            let options =
                CompletionOptions::with_n(number.unwrap_or(config.default_completion_count));

            eprintln!("Sending query...");
            let answers = with_spinner(client.complete(prompt.trim(), &options)).await;
            if answers.is_empty() {
                eprintln!("No answer produced.");
            } else {
                print!("{}", format_answers(&answers, config.width));
            }
        }
        Some(Command::Gi {
            prompt,
            save_path,
            size,
            number,
        }) => {
            let client = ImageClient::new(api_base, api_key);
            let options = image_options(&config, save_path, size, number);

            eprintln!("Generating image...");
            let paths = with_spinner(client.generate_image(&prompt, &options)).await;
            print_saved(&paths);
        }
        Some(Command::Gv {
            image_name,
            save_path,
            size,
            number,
        }) => {
            let client = ImageClient::new(api_base, api_key);
            let options = image_options(&config, save_path, size, number);

            eprintln!("Creating image variation...");
            let paths = with_spinner(client.generate_variation(&image_name, &options)).await;
            print_saved(&paths);
        }
        None => {
            let mut client = completion_client(&config, api_base, api_key);
            Repl::new(&mut client, config.width).run().await?;
        }
    }

    Ok(())
}

fn completion_client(config: &Config, api_base: String, api_key: ApiKey) -> CompletionClient {
    let mut client = CompletionClient::new(api_base, api_key);
    client.set_model(config.model.clone());
    client.set_max_tokens(config.max_tokens);
    client.set_temperature(config.temperature);
    client
}

fn image_options(
    config: &Config,
    save_path: Option<PathBuf>,
    size: Option<ImageSize>,
    number: Option<u32>,
) -> ImageOptions {
    ImageOptions {
        size: size.unwrap_or(config.image_size),
        n: number.unwrap_or(config.default_completion_count),
        response_format: ResponseFormat::Url,
        save_path,
    }
}

fn print_saved(paths: &[PathBuf]) {
    if paths.is_empty() {
        eprintln!("No images were saved.");
    }
    for path in paths {
        println!("Saved {}", path.display());
    }
}
