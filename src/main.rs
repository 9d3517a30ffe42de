use clap::{Parser, Subcommand};
use omero_transfer::service::ImportWait;
use omero_transfer::transfer::DEFAULT_NAMESPACE;
use omero_transfer::{Config, OmeroClient, UnlinkedDatasetPolicy, UploadRequest, WebGateway};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Push images to and pull files from an OMERO server", long_about = None)]
struct Args {
    /// Credential file (defaults to $OMERO_TRANSFER_CREDENTIALS or the user config dir)
    #[arg(short, long, global = true)]
    credentials: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import an image into a dataset, creating project/dataset as needed
    Upload {
        file: PathBuf,

        #[arg(short, long)]
        dataset: String,

        #[arg(short, long)]
        project: Option<String>,

        /// Side file to attach to the imported image (repeatable)
        #[arg(short, long = "attach")]
        attachments: Vec<PathBuf>,

        #[arg(long, default_value = DEFAULT_NAMESPACE)]
        namespace: String,

        #[arg(long, default_value = omero_transfer::service::DEFAULT_MIMETYPE)]
        mimetype: String,

        /// Seconds to wait for the import; 0 or less waits indefinitely
        #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
        wait: i64,

        /// Link an existing project-less dataset instead of creating a new one
        #[arg(long)]
        relink_orphans: bool,
    },
    /// Download the file attachments of a shared image link
    Attachments {
        url: String,
        dest: PathBuf,

        /// Prefer attachments in this namespace
        #[arg(long)]
        namespace: Option<String>,
    },
    /// Export a shared image link as OME-TIFF
    Export { url: String, dest: PathBuf },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> omero_transfer::Result<()> {
    let config = match args.credentials {
        Some(path) => Config::from_path(path)?,
        None => Config::load()?,
    };
    let client = OmeroClient::new(config, Arc::new(WebGateway::new()));

    match args.command {
        Command::Upload {
            file,
            dataset,
            project,
            attachments,
            namespace,
            mimetype,
            wait,
            relink_orphans,
        } => {
            let policy = if relink_orphans {
                UnlinkedDatasetPolicy::Relink
            } else {
                UnlinkedDatasetPolicy::CreateNew
            };
            let mut request = UploadRequest::new(file, dataset)
                .with_namespace(namespace)
                .with_mimetype(mimetype)
                .with_wait(ImportWait::from_raw(wait))
                .with_unlinked_policy(policy);
            request.project = project;
            request.attachments = attachments;

            let image_id = client.upload(&request).await?;
            info!("Imported Image ID: {}", image_id);
            println!("{}", image_id);
        }
        Command::Attachments {
            url,
            dest,
            namespace,
        } => {
            tokio::fs::create_dir_all(&dest).await?;
            let paths = client
                .locate_attachments(&url, &dest, namespace.as_deref())
                .await?;
            for path in paths {
                println!("{}", path.display());
            }
        }
        Command::Export { url, dest } => {
            tokio::fs::create_dir_all(&dest).await?;
            let path = client.export_image(&url, &dest).await?;
            println!("{}", path.display());
        }
    }

    Ok(())
}
