use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facetag_core::gallery::{GalleryPolicy, IncorporateOutcome};
use facetag_core::network::OnnxModel;
use facetag_core::{Face, GalleryStore, GalleryUpdate, Photo, RecognitionContext, TagId};
use facetag_engine::{spawn_maintainer, Engine, EngineConfig, PhotoAnalysis};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "facetag", about = "Face detection and tag recognition for event photos")]
struct Cli {
    /// Gallery file (JSON)
    #[arg(short, long, global = true, default_value = "gallery.json")]
    gallery: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect and recognize faces in photos
    Analyze {
        /// Image files to analyze
        #[arg(required = true)]
        images: Vec<PathBuf>,
        /// Event the photos belong to
        #[arg(short, long)]
        event: String,
        /// Tags eligible for matching
        #[arg(short, long = "tag")]
        tags: Vec<String>,
        /// Feed confident matches back into the gallery
        #[arg(long)]
        learn: bool,
        /// Include raw embeddings in the output
        #[arg(long)]
        embeddings: bool,
    },
    /// Label a face in a photo and add it to the gallery
    Enroll {
        /// Image containing the face
        image: PathBuf,
        /// Tag to enroll the face under
        #[arg(short, long)]
        tag: String,
        #[arg(short, long)]
        event: String,
        /// Face index in detection order (highest score first)
        #[arg(long, default_value_t = 0)]
        face: usize,
    },
    /// Inspect or edit the gallery
    Gallery {
        #[command(subcommand)]
        command: GalleryCommand,
    },
    /// List known detector variants
    Variants,
    /// Check model files and load every model
    Check,
}

#[derive(Subcommand)]
enum GalleryCommand {
    /// List tags and their entry counts
    List,
    /// Remove every entry for a tag
    Remove {
        tag: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::from_env();

    match cli.command {
        Commands::Analyze {
            images,
            event,
            tags,
            learn,
            embeddings,
        } => {
            let gallery = open_gallery(&cli.gallery, &config)?;
            let engine = Engine::start(&config, Arc::clone(&gallery))?;
            let context = RecognitionContext::new(event, tags.into_iter().map(TagId::from));

            let (maintainer, task) = spawn_maintainer(Arc::clone(&gallery), 64);
            for path in &images {
                let photo = read_photo(path)?;
                let analysis = engine.analyze(photo, &context).await?;
                let report = if embeddings {
                    serde_json::to_value(&analysis)?
                } else {
                    summarize(&analysis)
                };
                println!("{}", serde_json::to_string_pretty(&report)?);
                if learn {
                    maintainer.submit_all(analysis.gallery_updates).await?;
                }
            }
            drop(maintainer);
            let stats = task.await?;
            engine.shutdown();

            if learn {
                eprintln!(
                    "gallery: {} added, {} evicted, {} rejected",
                    stats.added, stats.evicted, stats.rejected
                );
                gallery.save(&cli.gallery)?;
            }
        }
        Commands::Enroll {
            image,
            tag,
            event,
            face,
        } => {
            let gallery = open_gallery(&cli.gallery, &config)?;
            let engine = Engine::start(&config, Arc::clone(&gallery))?;
            // No eligible tags: enrollment only needs the embeddings.
            let context = RecognitionContext::new(event.clone(), std::iter::empty::<TagId>());
            let analysis = engine.analyze(read_photo(&image)?, &context).await?;
            engine.shutdown();

            let Some(mut chosen) = analysis.faces.get(face).cloned() else {
                bail!(
                    "face {face} not found: {} detected in {} ({:?})",
                    analysis.faces.len(),
                    image.display(),
                    analysis.status
                );
            };
            let update = GalleryUpdate::label(&mut chosen, TagId::from(tag.as_str()), event.into())
                .context("face has no usable embedding")?;
            println!("{}", serde_json::to_string_pretty(&face_summary(&chosen))?);

            match gallery.incorporate(update)? {
                IncorporateOutcome::Added { evicted, .. } => {
                    println!("Enrolled face {face} as '{tag}'");
                    if evicted.is_some() {
                        println!("Oldest entry for '{tag}' evicted");
                    }
                    gallery.save(&cli.gallery)?;
                }
                IncorporateOutcome::Rejected(reason) => {
                    bail!("gallery rejected the face: {reason:?}");
                }
            }
        }
        Commands::Gallery { command } => {
            let gallery = open_gallery(&cli.gallery, &config)?;
            match command {
                GalleryCommand::List => {
                    let tags = gallery.tags()?;
                    if tags.is_empty() {
                        println!("Gallery is empty");
                    }
                    for tag in tags {
                        let entries = gallery.entries_for(&tag)?;
                        let event = entries.first().map(|e| e.event.to_string()).unwrap_or_default();
                        println!("{tag}\t{event}\t{} entries", entries.len());
                    }
                }
                GalleryCommand::Remove { tag } => {
                    let removed = gallery.remove_tag(&TagId::from(tag.as_str()))?;
                    if removed == 0 {
                        println!("No entries for '{tag}'");
                    } else {
                        println!("Removed {removed} entries for '{tag}'");
                        gallery.save(&cli.gallery)?;
                    }
                }
            }
        }
        Commands::Variants => {
            let registry = config.load_variants()?;
            for id in registry.ids() {
                let variant = registry.get(id)?;
                println!(
                    "{id}\t{}px\tstrides {:?}\t{:?}",
                    variant.input_size,
                    variant.heads.iter().map(|h| h.stride).collect::<Vec<_>>(),
                    variant.box_encoding
                );
            }
        }
        Commands::Check => {
            println!("Model directory: {}", config.model_dir.display());
            for path in [
                config.detector_model_path(),
                config.identity_model_path(),
                config.appearance_model_path(),
            ] {
                let state = if OnnxModel::exists(&path) { "ok" } else { "missing" };
                println!("  {path}: {state}");
            }

            let gallery = Arc::new(GalleryStore::new(GalleryPolicy::default()));
            let engine = Engine::start(&config, gallery)?;
            let result = engine.warm_up();
            engine.shutdown();
            result?;
            println!("Models loaded");
        }
    }

    Ok(())
}

fn open_gallery(path: &Path, config: &EngineConfig) -> Result<Arc<GalleryStore>> {
    let policy = GalleryPolicy::from(&config.load_pipeline()?);
    let store = if path.exists() {
        GalleryStore::load(path, policy)
            .with_context(|| format!("failed to load gallery {}", path.display()))?
    } else {
        tracing::info!(path = %path.display(), "no gallery file yet; starting empty");
        GalleryStore::new(policy)
    };
    Ok(Arc::new(store))
}

fn read_photo(path: &Path) -> Result<Photo> {
    let image = image::open(path)
        .with_context(|| format!("failed to read image {}", path.display()))?
        .to_rgb8();
    Ok(Photo::new(path.display().to_string(), image))
}

fn summarize(analysis: &PhotoAnalysis) -> serde_json::Value {
    serde_json::json!({
        "photo": analysis.photo,
        "status": analysis.status,
        "faces": analysis.faces.iter().map(face_summary).collect::<Vec<_>>(),
    })
}

fn face_summary(face: &Face) -> serde_json::Value {
    serde_json::json!({
        "id": face.id,
        "bbox": face.bbox,
        "score": face.score,
        "pose": face.pose,
        "state": face.state,
        "tag": face.recognized_tag,
        "similarity": face.fused_score,
    })
}
