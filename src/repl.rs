use std::io::{self, BufRead, Write};

use tracing::info;

use crate::api::{CompletionClient, CompletionOptions};
use crate::progress::with_spinner;
use crate::render::wrap_text;

/// Commands available inside a chat session, decoded from a `/name [value]` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    Exit,
    Help,
    Temperature(Option<String>),
    MaxTokens(Option<String>),
    Width(Option<String>),
    Clear,
    Unknown(String),
}

/// One line of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Blank,
    Command(ChatCommand),
    Prompt(String),
}

impl Input {
    pub fn parse(line: &str) -> Input {
        let line = line.trim();
        if line.is_empty() {
            return Input::Blank;
        }
        let Some(command) = line.strip_prefix('/') else {
            return Input::Prompt(line.to_string());
        };

        let mut parts = command.split_whitespace();
        let name = parts.next().unwrap_or_default();
        let value = parts.next().map(str::to_string);
        let command = match name {
            "exit" | "quit" => ChatCommand::Exit,
            "help" => ChatCommand::Help,
            "temperature" => ChatCommand::Temperature(value),
            "max-tokens" => ChatCommand::MaxTokens(value),
            "width" => ChatCommand::Width(value),
            "clear" => ChatCommand::Clear,
            other => ChatCommand::Unknown(other.to_string()),
        };
        Input::Command(command)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

/// Interactive chat session on top of a [`CompletionClient`].
pub struct Repl<'a> {
    client: &'a mut CompletionClient,
    width: usize,
}

impl<'a> Repl<'a> {
    pub fn new(client: &'a mut CompletionClient, width: usize) -> Self {
        Repl { client, width }
    }

    pub async fn run(&mut self) -> io::Result<()> {
        let stdin = io::stdin();
        let stdout = io::stdout();
        self.run_with(stdin.lock(), stdout.lock()).await
    }

    /// Runs the session until `/exit`, `/quit` or end of input. A failing turn
    /// is reported and the session goes on.
    pub async fn run_with<R: BufRead, W: Write>(
        &mut self,
        mut input: R,
        mut out: W,
    ) -> io::Result<()> {
        info!("starting chat session with model {}", self.client.model());
        writeln!(
            out,
            "Welcome to TGPT! You are talking to model: {}",
            self.client.model()
        )?;
        writeln!(
            out,
            "Type '/exit' or '/quit' to end the session, '/help' for more commands."
        )?;

        loop {
            write!(out, "\nYou: ")?;
            out.flush()?;

            let Some(line) = read_line(&mut input)? else {
                writeln!(out)?;
                break;
            };

            match self.step(&line, &mut input, &mut out).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Exit) => break,
                Err(e) => writeln!(out, "An error occurred: {}", e)?,
            }
        }

        writeln!(out, "Goodbye!")?;
        info!("chat session ended");
        Ok(())
    }

    async fn step<R: BufRead, W: Write>(
        &mut self,
        line: &str,
        input: &mut R,
        out: &mut W,
    ) -> io::Result<Flow> {
        match Input::parse(line) {
            Input::Blank => Ok(Flow::Continue),
            Input::Prompt(prompt) => {
                let options = CompletionOptions::default();
                let answers = with_spinner(self.client.complete(&prompt, &options)).await;
                match answers.first() {
                    Some(answer) => writeln!(out, "\nGPT: {}", wrap_text(answer, self.width))?,
                    None => writeln!(out, "\nNo answer produced.")?,
                }
                Ok(Flow::Continue)
            }
            Input::Command(command) => self.handle_command(command, input, out),
        }
    }

    fn handle_command<R: BufRead, W: Write>(
        &mut self,
        command: ChatCommand,
        input: &mut R,
        out: &mut W,
    ) -> io::Result<Flow> {
        match command {
            ChatCommand::Exit => return Ok(Flow::Exit),
            ChatCommand::Help => print_help(out)?,
            ChatCommand::Temperature(value) => {
                let value = value_or_ask(value, "New temperature: ", input, out)?;
                match value.parse::<f32>() {
                    Ok(temperature) => {
                        self.client.set_temperature(temperature);
                        writeln!(out, "Temperature set to {}", temperature)?;
                    }
                    Err(_) => writeln!(out, "Invalid temperature: '{}'", value)?,
                }
            }
            ChatCommand::MaxTokens(value) => {
                let value = value_or_ask(value, "New max tokens: ", input, out)?;
                match value.parse::<u32>() {
                    Ok(max_tokens) => {
                        self.client.set_max_tokens(max_tokens);
                        writeln!(out, "Max tokens set to {}", max_tokens)?;
                    }
                    Err(_) => writeln!(out, "Invalid max tokens: '{}'", value)?,
                }
            }
            ChatCommand::Width(value) => {
                let value = value_or_ask(value, "New width: ", input, out)?;
                match value.parse::<usize>() {
                    Ok(width) => {
                        self.width = width;
                        writeln!(out, "Width set to {}", width)?;
                    }
                    Err(_) => writeln!(out, "Invalid width: '{}'", value)?,
                }
            }
            ChatCommand::Clear => {
                self.client.clear_history();
                writeln!(out, "Chat history cleared.")?;
            }
            ChatCommand::Unknown(name) => {
                writeln!(out, "Invalid command '/{}', please use one of the following:", name)?;
                print_help(out)?;
            }
        }
        Ok(Flow::Continue)
    }
}

fn read_line<R: BufRead>(input: &mut R) -> io::Result<Option<String>> {
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line))
}

/// Returns `value`, or asks for it on the next input line.
fn value_or_ask<R: BufRead, W: Write>(
    value: Option<String>,
    question: &str,
    input: &mut R,
    out: &mut W,
) -> io::Result<String> {
    if let Some(value) = value {
        return Ok(value);
    }
    write!(out, "{}", question)?;
    out.flush()?;
    Ok(read_line(input)?.unwrap_or_default().trim().to_string())
}

fn print_help<W: Write>(out: &mut W) -> io::Result<()> {
    writeln!(out, "Available commands:")?;
    writeln!(out, "/exit or /quit: Exit the program")?;
    writeln!(out, "/temperature [value]: Set a new temperature")?;
    writeln!(out, "/max-tokens [value]: Set new max tokens")?;
    writeln!(out, "/width [value]: Set a new print width")?;
    writeln!(out, "/clear: Forget the conversation so far")?;
    writeln!(out, "/help: Show this help message")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_key::ApiKey;
    use serde_json::json;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> CompletionClient {
        CompletionClient::new(format!("{}/v1", server.uri()), ApiKey::new("sk-test"))
    }

    fn reply(text: &str) -> serde_json::Value {
        json!({"choices": [{"message": {"role": "assistant", "content": text}}]})
    }

    #[test]
    fn parses_input_lines() {
        assert_eq!(Input::parse("   \n"), Input::Blank);
        assert_eq!(
            Input::parse("what is rust?\n"),
            Input::Prompt("what is rust?".into())
        );
        assert_eq!(Input::parse("/quit"), Input::Command(ChatCommand::Exit));
        assert_eq!(Input::parse("/exit\n"), Input::Command(ChatCommand::Exit));
        assert_eq!(Input::parse("/help"), Input::Command(ChatCommand::Help));
        assert_eq!(
            Input::parse("/temperature  0.2"),
            Input::Command(ChatCommand::Temperature(Some("0.2".into())))
        );
        assert_eq!(
            Input::parse("/max-tokens"),
            Input::Command(ChatCommand::MaxTokens(None))
        );
        assert_eq!(
            Input::parse("/width 120"),
            Input::Command(ChatCommand::Width(Some("120".into())))
        );
        assert_eq!(Input::parse("/clear"), Input::Command(ChatCommand::Clear));
        assert_eq!(
            Input::parse("/model gpt-4"),
            Input::Command(ChatCommand::Unknown("model".into()))
        );
        assert_eq!(
            Input::parse("/"),
            Input::Command(ChatCommand::Unknown(String::new()))
        );
    }

    #[tokio::test]
    async fn scripted_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(reply("Hi there")))
            .expect(1)
            .mount(&server)
            .await;

        let mut client = client(&server);
        let script = "/width abc\n/width 5\nHello\n\n/temperature 0.3\n/max-tokens\n250\n/bogus\n/exit\nnever sent\n";
        let mut out = Vec::new();
        Repl::new(&mut client, 80)
            .run_with(script.as_bytes(), &mut out)
            .await
            .unwrap();

        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("Invalid width: 'abc'"));
        assert!(out.contains("Width set to 5"));
        assert!(out.contains("GPT: Hi\nthere"));
        assert!(out.contains("Temperature set to 0.3"));
        assert!(out.contains("New max tokens: Max tokens set to 250"));
        assert!(out.contains("Invalid command '/bogus'"));
        assert!(out.trim_end().ends_with("Goodbye!"));

        assert_eq!(client.temperature(), 0.3);
        assert_eq!(client.max_tokens(), 250);
        assert_eq!(client.history().len(), 2);
    }

    #[tokio::test]
    async fn failed_turn_does_not_end_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let mut client = client(&server);
        let mut out = Vec::new();
        Repl::new(&mut client, 80)
            .run_with("first\nsecond\n/clear\n/quit\n".as_bytes(), &mut out)
            .await
            .unwrap();

        let out = String::from_utf8(out).unwrap();
        assert_eq!(out.matches("No answer produced.").count(), 2);
        assert!(out.contains("Chat history cleared."));
        assert!(client.history().is_empty());
    }

    #[tokio::test]
    async fn end_of_input_ends_session() {
        let server = MockServer::start().await;
        let mut client = client(&server);
        let mut out = Vec::new();
        Repl::new(&mut client, 80)
            .run_with("".as_bytes(), &mut out)
            .await
            .unwrap();

        assert!(String::from_utf8(out).unwrap().contains("Goodbye!"));
    }

    #[tokio::test]
    async fn answers_are_wrapped_to_width() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(reply("aaa bbb ccc ddd")),
            )
            .mount(&server)
            .await;

        let mut client = client(&server);
        let mut out = Vec::new();
        Repl::new(&mut client, 7)
            .run_with("go\n/exit\n".as_bytes(), &mut out)
            .await
            .unwrap();

        assert!(String::from_utf8(out).unwrap().contains("GPT: aaa bbb\nccc ddd"));
    }
}
