use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::image::ImageSize;

#[derive(Debug, Parser)]
#[clap(
    name = "tgpt",
    version,
    about = "Chat with GPT models and generate images from the terminal.",
    long_about = "Chat with GPT models and generate images from the terminal. \
        Settings are read from ~/.tgpt/config, which is created on first run."
)]
pub struct Args {
    #[clap(
        short('c'),
        long,
        help = "Start an interactive chat session",
        default_value_t = false
    )]
    pub chat: bool,

    #[clap(
        long("api"),
        value_name = "URL",
        global = true,
        help = "The API base URL to use instead of API_BASE from the config file"
    )]
    pub api: Option<String>,

    #[clap(
        long("key"),
        value_name = "API_KEY",
        global = true,
        help = "Sets the API key; if absent, the config file, the envvar 'OPENAI_API_KEY' and ~/.tgpt/api are checked"
    )]
    pub api_key: Option<String>,

    #[clap(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Send a single text query. Reads from STDIN if PROMPT is not supplied.
    Tx {
        #[clap(value_name = "PROMPT")]
        prompt: Option<String>,

        #[clap(
            short('n'),
            long,
            value_name = "INT",
            help = "The number of answers to generate"
        )]
        number: Option<u32>,

        #[clap(
            short('t'),
            long,
            value_name = "F32",
            help = "The temperature to use for sampling"
        )]
        temperature: Option<f32>,

        #[clap(
            short('m'),
            long("max"),
            value_name = "INT",
            help = "The maximum number of tokens to generate in the completion"
        )]
        max_tokens: Option<u32>,
    },

    /// Generate images from a text prompt.
    Gi {
        #[clap(value_name = "PROMPT")]
        prompt: String,

        #[clap(
            value_name = "SAVE_PATH",
            help = "Directory to save the images in; defaults to the current directory"
        )]
        save_path: Option<PathBuf>,

        #[clap(
            short('s'),
            long,
            value_name = "SIZE",
            help = "Image size: small, medium or large"
        )]
        size: Option<ImageSize>,

        #[clap(
            short('n'),
            long,
            value_name = "INT",
            help = "The number of images to generate"
        )]
        number: Option<u32>,
    },

    /// Generate variations of an existing image.
    Gv {
        #[clap(value_name = "IMAGE")]
        image_name: PathBuf,

        #[clap(
            value_name = "SAVE_PATH",
            help = "Directory to save the images in; defaults to the current directory"
        )]
        save_path: Option<PathBuf>,

        #[clap(
            short('s'),
            long,
            value_name = "SIZE",
            help = "Image size: small, medium or large"
        )]
        size: Option<ImageSize>,

        #[clap(
            short('n'),
            long,
            value_name = "INT",
            help = "The number of variations to generate"
        )]
        number: Option<u32>,
    },
}
