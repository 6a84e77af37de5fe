use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facecheck_core::Pipeline;
use std::io::Read;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "facecheck", about = "facecheck face analysis CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run detection and classification locally and print the report
    Analyze {
        /// Image file to analyze
        image: PathBuf,
        /// Directory containing the ONNX models
        #[arg(long)]
        model_dir: Option<PathBuf>,
        /// Print the report as JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Parse a saved summarizer response ("-" reads stdin)
    Parse {
        input: String,
    },
    /// Ask the daemon to analyze an image
    Submit {
        image: PathBuf,
    },
    /// Show daemon status
    Status,
}

#[zbus::proxy(
    interface = "org.facecheck.Analyzer1",
    default_service = "org.facecheck.Analyzer1",
    default_path = "/org/facecheck/Analyzer1"
)]
trait Analyzer {
    async fn analyze(&self, image_path: &str) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Analyze {
            image,
            model_dir,
            json,
        } => {
            let dir = model_dir.unwrap_or_else(facecheck_core::default_model_dir);
            let paths = facecheck_core::ModelPaths::in_dir(&dir);
            let missing = paths.missing();
            if !missing.is_empty() {
                for path in &missing {
                    eprintln!("missing model: {}", path.display());
                }
                bail!("models not found in {}", dir.display());
            }

            let pipeline = Pipeline::load(&paths).context("failed to load models")?;
            let report = pipeline
                .process_image(&image)
                .await
                .with_context(|| format!("failed to analyze {}", image.display()))?;

            match report {
                None => println!("No faces detected"),
                Some(report) if json => println!("{}", serde_json::to_string_pretty(&report)?),
                Some(report) => print!("{}", pipeline.print_results(Some(&report))),
            }
        }
        Commands::Parse { input } => {
            let raw = read_input(&input)?;
            let summary = facecheck_core::summary::parse(&raw);
            let out = serde_json::json!({
                "narrative_text": summary.narrative_text,
                "fields": summary.fields,
                "diagram": summary.diagram(),
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Commands::Submit { image } => {
            let image = image
                .canonicalize()
                .with_context(|| format!("cannot resolve {}", image.display()))?;
            let path = image.to_str().context("image path is not valid UTF-8")?;

            let proxy = connect().await?;
            println!("{}", proxy.analyze(path).await?);
        }
        Commands::Status => match connect().await {
            Ok(proxy) => println!("{}", proxy.status().await?),
            Err(e) => {
                tracing::debug!(error = %e, "daemon unreachable");
                println!("facecheckd: not connected");
            }
        },
    }

    Ok(())
}

async fn connect() -> Result<AnalyzerProxy<'static>> {
    let conn = zbus::Connection::session()
        .await
        .context("failed to connect to the session bus")?;
    AnalyzerProxy::new(&conn)
        .await
        .context("failed to create facecheckd proxy")
}

fn read_input(input: &str) -> Result<String> {
    if input == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read stdin")?;
        Ok(buf)
    } else {
        std::fs::read_to_string(input).with_context(|| format!("failed to read {input}"))
    }
}
