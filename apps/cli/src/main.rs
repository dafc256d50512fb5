//! pagescribe CLI — capture, transcribe and reassemble e-books.
//!
//! Drives a reader session page by page, transcribes the page images with a
//! vision model, and stitches the text back into chapters.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
