use clap::{Parser, Subcommand};
use imgvault::{app::ImageUpload, prelude::*};
use serde_json::{Value, json};
use std::{error::Error, path::PathBuf, process::ExitCode};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "imgvault")]
#[command(about = "Operate the image vault without going through HTTP", long_about = None)]
pub struct Cli {
    #[arg(long, global = true, help = "Print XML instead of JSON")]
    pub xml: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Store a new image.
    Upload {
        #[arg(help = "Path to image file")]
        path: PathBuf,

        #[arg(short, long, help = "Stored filename (defaults to the file's name)")]
        name: Option<String>,

        #[arg(short, long, help = "MIME type (sniffed from the content when omitted)")]
        content_type: Option<String>,
    },
    /// List every image record.
    List,
    /// Replace the content behind an existing record.
    Replace {
        id: i64,

        #[arg(help = "Path to image file")]
        path: PathBuf,

        #[arg(short, long, help = "Stored filename (defaults to the file's name)")]
        name: Option<String>,

        #[arg(short, long, help = "MIME type (sniffed from the content when omitted)")]
        content_type: Option<String>,
    },
    /// Delete a record and its blob.
    Delete { id: i64 },
    /// Report blobs without records and records without blobs.
    Audit,
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn Error>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_env()?;
    let db = Database::connect(&config.database_url, config.database_max_connections).await?;
    let bucket = Bucket::from_config(&config.storage)?;
    let images = ImageController::new(bucket, db).with_replace_order(config.replace_order);

    let format = if cli.xml {
        ResponseFormat::Xml
    } else {
        ResponseFormat::Json
    };

    let (payload, code) = match cli.command {
        Commands::Upload {
            path,
            name,
            content_type,
        } => {
            let upload = read_upload(path, name, content_type).await?;
            let uploaded = images.upload(Some(upload)).await?;
            (
                json!({
                    "message": "Image uploaded successfully",
                    "id": uploaded.id,
                    "filename": uploaded.filename,
                    "access_url": uploaded.access_url,
                }),
                ExitCode::SUCCESS,
            )
        }
        Commands::List => {
            let records = images.list().await?;
            (json!({ "images": records }), ExitCode::SUCCESS)
        }
        Commands::Replace {
            id,
            path,
            name,
            content_type,
        } => {
            let upload = read_upload(path, name, content_type).await?;
            let replaced = images.replace(id, Some(upload)).await?;
            (
                json!({
                    "message": "Image updated successfully",
                    "new_url": replaced.new_url,
                }),
                ExitCode::SUCCESS,
            )
        }
        Commands::Delete { id } => {
            let record = images.delete(id).await?;
            (
                json!({
                    "message": "Image deleted successfully",
                    "filename": record.filename,
                }),
                ExitCode::SUCCESS,
            )
        }
        Commands::Audit => {
            let report = images.audit().await?;
            let code = if report.is_clean() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            };
            (serde_json::to_value(&report)?, code)
        }
    };

    print(format, &payload)?;

    Ok(code)
}

async fn read_upload(
    path: PathBuf,
    name: Option<String>,
    content_type: Option<String>,
) -> Result<ImageUpload, Box<dyn Error>> {
    let filename = match name {
        Some(name) => name,
        None => path
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .ok_or_else(|| format!("{} has no file name", path.display()))?,
    };
    let bytes = tokio::fs::read(&path).await?;

    Ok(ImageUpload::new(filename, content_type.as_deref(), bytes))
}

fn print(format: ResponseFormat, payload: &Value) -> Result<(), Box<dyn Error>> {
    let body = match format {
        ResponseFormat::Json => serde_json::to_string_pretty(payload)?,
        ResponseFormat::Xml => String::from_utf8(format.render(payload)?)?,
    };
    println!("{body}");

    Ok(())
}
