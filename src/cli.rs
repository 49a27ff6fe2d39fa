use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "toolbridge",
    version,
    about = "Chat with an OpenAI-compatible model that can call tools on an MCP server"
)]
pub struct Cli {
    /// Path to the MCP server script (.py runs under python, .js under node)
    pub server_script: PathBuf,
}
