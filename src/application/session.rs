//! Interactive session driver: one query per line until the exit keyword.

use crate::application::agent::{Agent, QueryOutcome, SYSTEM_PROMPT, ToolStep};
use crate::application::bridge::ToolTransport;
use crate::domain::conversation::Conversation;
use crate::infrastructure::model::ModelProvider;
use thiserror::Error;
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info};

const EXIT_KEYWORD: &str = "quit";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("stdin/stdout I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn is_exit_command(input: &str) -> bool {
    input.eq_ignore_ascii_case(EXIT_KEYWORD)
}

/// Run the interactive loop. One conversation spans the whole session; a
/// failed query is reported and the session continues with the next one.
pub async fn run<P, T>(agent: &Agent<P, T>, tool_names: &[String]) -> Result<(), SessionError>
where
    P: ModelProvider,
    T: ToolTransport,
{
    let mut stdout = io::stdout();
    let stdin = BufReader::new(io::stdin());
    let mut lines = stdin.lines();
    let mut conversation = Conversation::new(SYSTEM_PROMPT);

    write_line(&mut stdout, "\nMCP client started!").await?;
    write_line(
        &mut stdout,
        &format!("Connected to server with tools: {}", tool_names.join(", ")),
    )
    .await?;
    write_line(&mut stdout, "Type your queries or 'quit' to exit.").await?;

    loop {
        stdout.write_all(b"\nQuery: ").await?;
        stdout.flush().await?;

        let line = match lines.next_line().await? {
            Some(line) => line,
            None => {
                write_line(&mut stdout, "\nInput closed, leaving session.").await?;
                break;
            }
        };

        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if is_exit_command(input) {
            info!("Exit keyword received, ending session");
            break;
        }

        match agent.process_query(&mut conversation, input.to_string()).await {
            Ok(QueryOutcome { response, steps }) => {
                print_steps(&mut stdout, &steps).await?;
                write_line(&mut stdout, "").await?;
                write_line(&mut stdout, &response).await?;
            }
            Err(err) => {
                error!(%err, "Query processing failed");
                write_line(&mut stdout, "\nQuery failed:").await?;
                write_line(&mut stdout, &err.user_message()).await?;
            }
        }
    }

    stdout.flush().await?;
    Ok(())
}

async fn print_steps(stdout: &mut io::Stdout, steps: &[ToolStep]) -> io::Result<()> {
    for step in steps {
        let status = if step.success { "ok" } else { "failed" };
        write_line(
            stdout,
            &format!("[tool {} {} -> {}]", step.tool, step.arguments, status),
        )
        .await?;
    }
    Ok(())
}

async fn write_line(stdout: &mut io::Stdout, line: &str) -> io::Result<()> {
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    Ok(())
}
