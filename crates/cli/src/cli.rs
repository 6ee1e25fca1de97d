use crate::error::{ErrorKind, Result};
use crate::store::Store;
use cirrus_config::Config;
use cirrus_vault::models::{FileVersion, Representation, VersionId};
use cirrus_vault::{Upload, UploadSource};
use clap::{Parser, Subcommand};
use exn::ResultExt;
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Parser)]
#[command(name = "cirrus", version, about = "Content-addressed, versioned file store")]
pub struct Cli {
    /// Configuration file (TOML, YAML or JSON).
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Store a file as the next version of FILE_ID.
    Put {
        file_id: String,
        path: PathBuf,
        /// MIME type; guessed from the extension when omitted.
        #[arg(long)]
        mime: Option<String>,
        /// Original file name; defaults to the name of PATH.
        #[arg(long)]
        name: Option<String>,
    },
    /// Write the content of a version to a file or stdout.
    Get {
        version_id: i64,
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// List the versions of a file, oldest first.
    Log { file_id: String },
    /// Delete versions and release their chunks.
    Prune {
        #[arg(required = true)]
        version_ids: Vec<i64>,
    },
    /// Reclaim unreferenced chunks and orphaned blobs.
    Gc,
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let config = Config::load(self.config.as_deref()).or_raise(|| ErrorKind::Config)?;
        let store = Store::open(&config).await?;
        let result = self.command.run(&store).await;
        store.close().await;
        result
    }
}

impl Command {
    async fn run(self, store: &Store) -> Result<()> {
        match self {
            Command::Put { file_id, path, mime, name } => {
                let buffer = tokio::fs::read(&path).await.or_raise(|| ErrorKind::Io(path.clone()))?;
                let name = name
                    .or_else(|| path.file_name().map(|n| n.to_string_lossy().into_owned()))
                    .unwrap_or_else(|| file_id.clone());
                let mime = mime.unwrap_or_else(|| guess_mime(&path));
                let upload = Upload::new(file_id, UploadSource::Buffer(buffer)).with_mime(mime).with_name(name);
                let version = store.uploads.save(upload).await.or_raise(|| ErrorKind::Vault)?;
                println!("{}", describe(&version));
            },
            Command::Get { version_id, output } => {
                let content = store
                    .versions
                    .build_buffer_from_version(VersionId(version_id))
                    .await
                    .or_raise(|| ErrorKind::Vault)?;
                match output {
                    Some(path) => tokio::fs::write(&path, &content).await.or_raise(|| ErrorKind::Io(path))?,
                    None => {
                        let mut stdout = tokio::io::stdout();
                        stdout.write_all(&content).await.or_raise(|| ErrorKind::Io(PathBuf::from("-")))?;
                        stdout.flush().await.or_raise(|| ErrorKind::Io(PathBuf::from("-")))?;
                    },
                }
            },
            Command::Log { file_id } => {
                for version in store.versions.list_versions(&file_id).await.or_raise(|| ErrorKind::Vault)? {
                    println!("{}", describe(&version));
                }
            },
            Command::Prune { version_ids } => {
                let ids: Vec<VersionId> = version_ids.into_iter().map(VersionId).collect();
                let report = store.versions.release_versions(&ids).await;
                for id in &report.released {
                    println!("released {id}");
                }
                for (id, err) in &report.failed {
                    eprintln!("{id}: {}", **err);
                }
                if !report.is_complete() {
                    exn::bail!(ErrorKind::Incomplete(report.failed.len()));
                }
            },
            Command::Gc => {
                let report = store.gc.run().await.or_raise(|| ErrorKind::Vault)?;
                println!(
                    "removed {} chunk(s) and {} orphaned blob(s)",
                    report.chunks_removed, report.orphan_blobs_removed
                );
            },
        }
        Ok(())
    }
}

/// MIME type guessed from the extension, `application/octet-stream` otherwise.
fn guess_mime(path: &Path) -> String {
    mime_guess::from_path(path).first_or_octet_stream().essence_str().to_string()
}

fn describe(version: &FileVersion) -> String {
    let kind = match &version.representation {
        Representation::Snapshot { chunks } => format!("snapshot ({} chunks)", chunks.len()),
        Representation::Delta { base_version_id, patch_size, .. } => {
            format!("delta of {base_version_id} ({patch_size} byte patch)")
        },
    };
    let created = version.created_at.format(&Rfc3339).unwrap_or_else(|_| version.created_at.to_string());
    format!(
        "{}\t{}@{}\t{}\t{} bytes\t{}\t{}",
        version.id, version.file_id, version.version_number, kind, version.size, version.mime, created
    )
}
