//! upload-client -- push a local file to a resumable upload server.
//!
//! Run it again after an interruption and it continues from the offset
//! the server reports, using the location recorded in `--state`.

use std::io::Write;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use resumable_upload::client::{
    DriverOptions, FileSource, HttpTransport, UploadDriver, UploadSource,
};
use resumable_upload::protocol::ProtocolVersion;

/// Command-line arguments for the upload client.
#[derive(Parser, Debug)]
#[command(name = "upload-client", version, about = "Resumable HTTP upload client")]
struct Cli {
    /// URL that creation requests are posted to.
    #[arg(long, default_value = "http://localhost:8080/")]
    endpoint: String,

    /// File to upload.
    #[arg(long, required_unless_present = "cancel")]
    file: Option<String>,

    /// Where the resume state is kept between runs.
    #[arg(long, default_value = "./upload-state.json")]
    state: String,

    /// Protocol draft to speak.
    #[arg(long, value_enum, default_value_t = ProtocolVersion::Draft4)]
    protocol: ProtocolVersion,

    /// Give up after this many offset conflicts (unbounded if omitted).
    #[arg(long)]
    max_retries: Option<u32>,

    /// Delete the resume state once the upload is complete.
    #[arg(long)]
    clear_state: bool,

    /// Cancel the recorded upload instead of uploading.
    #[arg(long)]
    cancel: bool,

    /// Log level used when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let transport = Arc::new(HttpTransport::new(&cli.endpoint)?);
    let options = DriverOptions {
        version: cli.protocol,
        max_conflict_retries: cli.max_retries,
        clear_state_on_complete: cli.clear_state,
    };
    let driver = UploadDriver::new(transport, &cli.state, options);

    if cli.cancel {
        driver.cancel().await?;
        info!("Upload cancelled and resume state cleared");
        return Ok(());
    }

    let Some(path) = cli.file else {
        anyhow::bail!("--file is required");
    };
    let source = FileSource::open(&path).await?;
    info!(file = %path, bytes = source.len(), "Uploading");

    let report = driver.upload(&source).await?;
    info!(
        location = %report.location,
        offset = report.state.offset,
        complete = report.state.complete,
        status = %report.status,
        "Response from server"
    );

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&report.body)?;
    stdout.flush()?;
    Ok(())
}
