use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use gallery::{
    Config, EntryId, LocalFile, MediaBackend, SubmissionCoordinator,
    SubmissionFlow, SubmissionPhase, SubmissionProgress, UploadQueue,
    telemetry::{get_subscriber, init_subscriber, log_error},
};
use payloads::{APIClient, VillaDetails, VillaId, requests::CreateVilla};
use rust_decimal::Decimal;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Manage villa listings and their image galleries.
///
/// Environment variables can be set directly or loaded from a .env file:
/// - GALLERY_BACKEND_URL: base address of the villa backend (required)
/// - GALLERY_API_TOKEN: bearer token for the admin API
/// - GALLERY_MAX_FILES, GALLERY_MAX_FILE_BYTES, GALLERY_UPLOAD_CONCURRENCY
///
/// Example:
/// GALLERY_BACKEND_URL=http://localhost:8000 \
/// villa-gallery add --villa 12 --thumbnail 0 pool.jpg terrace.png
#[derive(Debug, Parser)]
#[command(name = "villa-gallery", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a villa, sending its images along with it.
    Create(CreateArgs),
    /// Upload images to an existing villa and save it.
    Add(AddArgs),
}

#[derive(Debug, Args)]
struct ImageArgs {
    /// Gallery position (after adding) of the image to use as thumbnail.
    /// Defaults to the first image.
    #[arg(long)]
    thumbnail: Option<usize>,
    /// Image files to add.
    #[arg(value_name = "PATH", required = true)]
    images: Vec<PathBuf>,
}

#[derive(Debug, Args)]
struct CreateArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    description: Option<String>,
    /// Price per night, e.g. 320.00
    #[arg(long)]
    price: Decimal,
    /// Number of guests the villa sleeps.
    #[arg(long)]
    capacity: u32,
    #[command(flatten)]
    images: ImageArgs,
}

#[derive(Debug, Args)]
struct AddArgs {
    /// Villa whose gallery receives the images.
    #[arg(long)]
    villa: i64,
    #[command(flatten)]
    images: ImageArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Silently ignored if there is no .env file
    let _ = dotenvy::dotenv();

    init_subscriber(get_subscriber("info".into()))?;

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let client = config.api_client();
    client.health_check().await.with_context(|| {
        format!("Backend at {} is not reachable", client.address)
    })?;

    let coordinator = SubmissionCoordinator::new(config.submission.clone());
    let progress_log = log_progress(coordinator.subscribe());

    let result = match cli.command {
        Command::Create(args) => {
            create_villa(&client, &config, &coordinator, args).await
        }
        Command::Add(args) => {
            add_images(&client, &config, &coordinator, args).await
        }
    };

    drop(coordinator);
    if let Err(e) = progress_log.await {
        log_error(anyhow::Error::new(e).context("Progress logging failed"));
    }
    result
}

async fn create_villa(
    client: &APIClient,
    config: &Config,
    coordinator: &SubmissionCoordinator,
    args: CreateArgs,
) -> anyhow::Result<()> {
    let queue = UploadQueue::new(client, config.queue.clone());
    let thumbnail = load_images(&queue, &args.images).await?;
    let thumbnail_index = args.images.thumbnail.filter(|&i| i < queue.len());

    let details = VillaDetails {
        name: args.name,
        description: args.description,
        price_per_night: args.price,
        capacity: args.capacity,
    };
    let outcome = coordinator
        .submit(
            SubmissionFlow::Create,
            &details,
            &queue,
            thumbnail,
            |details: &VillaDetails| {
                let request = CreateVilla {
                    details: details.clone(),
                    images: queue.inline_images(),
                    thumbnail_index,
                };
                async move { client.create_villa(&request).await }
            },
        )
        .await?;

    tracing::info!(
        "Created villa {} with {} image(s)",
        outcome.saved.id,
        outcome.saved.images.len()
    );
    Ok(())
}

async fn add_images(
    client: &APIClient,
    config: &Config,
    coordinator: &SubmissionCoordinator,
    args: AddArgs,
) -> anyhow::Result<()> {
    let villa_id = VillaId(args.villa);
    let villa = client
        .get_villa(&villa_id)
        .await
        .with_context(|| format!("Failed to load villa {villa_id}"))?;

    let queue =
        UploadQueue::new(client, config.queue.clone()).with_owner(villa_id);
    let existing = villa.sorted_images();
    let urls: Vec<String> = existing.iter().map(|i| i.url.clone()).collect();
    let server_ids: Vec<_> = existing.iter().map(|i| Some(i.id)).collect();
    queue.hydrate_existing(&urls, &server_ids);

    let thumbnail = load_images(&queue, &args.images).await?;

    let flow = SubmissionFlow::Edit {
        villa_id,
        current_thumbnail: villa.thumbnail_image_id,
    };
    let persist = |details: &VillaDetails| {
        let details = details.clone();
        async move { client.update_villa(&villa_id, &details).await }
    };
    let outcome = coordinator
        .submit(flow, &villa.details, &queue, thumbnail, persist)
        .await?;

    if let Some(partial) = &outcome.partial_upload {
        for (id, error) in &partial.failed {
            tracing::warn!("{id} was not uploaded: {error}");
        }
    }
    tracing::info!(
        "Saved villa {} with {} image(s)",
        outcome.saved.id,
        outcome.saved.images.len()
    );
    Ok(())
}

/// Read the image files into `queue` and resolve the requested thumbnail.
async fn load_images<B: MediaBackend>(
    queue: &UploadQueue<B>,
    args: &ImageArgs,
) -> anyhow::Result<Option<EntryId>> {
    let mut files = Vec::with_capacity(args.images.len());
    for path in &args.images {
        let file = LocalFile::from_path(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        files.push(file);
    }

    let report = queue.add_files(files);
    for error in &report.errors {
        tracing::warn!("{error}");
    }
    if report.added.is_empty() {
        anyhow::bail!("None of the images could be added");
    }

    Ok(args
        .thumbnail
        .and_then(|position| queue.entries().get(position).map(|e| e.id)))
}

fn log_progress(
    mut progress: watch::Receiver<SubmissionProgress>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let snapshot = progress.borrow_and_update().clone();
            tracing::info!("{:?}: {}%", snapshot.phase, snapshot.percent());
            if matches!(
                snapshot.phase,
                SubmissionPhase::Done | SubmissionPhase::Failed
            ) {
                break;
            }
        }
    })
}
