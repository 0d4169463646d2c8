use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use clap::{Parser, Subcommand};
use futures_util::future::join_all;
use tracing::info;

use cropsight::analysis::AnalysisRequest;
use cropsight::translate::Language;
use cropsight::AppContext;

#[derive(Parser)]
#[command(name = "cropsight", version, about = "Crop photo diagnosis and cached AI translation")]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API.
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Diagnose one crop photo and print the report as JSON.
    Analyze {
        /// Image file (JPEG or PNG).
        image: PathBuf,
        #[arg(long)]
        crop: Option<String>,
        #[arg(long)]
        field: Option<String>,
    },
    /// Translate text through the persistent cache.
    Translate {
        #[arg(required = true)]
        texts: Vec<String>,
        /// Target language code, e.g. hi-IN.
        #[arg(long, default_value = "hi-IN")]
        lang: String,
        /// Issue all texts at once through the debounce window, so repeats
        /// share one remote call.
        #[arg(long)]
        debounce: bool,
        /// Print cache statistics afterwards.
        #[arg(long)]
        stats: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = cropsight::load_config(cli.config.as_deref())?;
    cropsight::init_tracing(&config.logging);

    match cli.command {
        Command::Serve { host, port } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
                .parse()
                .context("invalid server address")?;
            let ctx = Arc::new(AppContext::build(config)?);
            info!("cropsight starting");
            cropsight::http::serve(ctx, addr).await
        }
        Command::Analyze { image, crop, field } => {
            let bytes = std::fs::read(&image).with_context(|| format!("failed to read {}", image.display()))?;
            let mime = match image.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref() {
                Some("png") => "image/png",
                Some("webp") => "image/webp",
                _ => "image/jpeg",
            };
            let ctx = AppContext::build(config)?;
            let report = ctx
                .orchestrator
                .analyze(AnalysisRequest {
                    image_data: Some(format!("data:{mime};base64,{}", STANDARD.encode(bytes))),
                    crop_type: crop,
                    field_name: field,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Translate { texts, lang, debounce, stats } => {
            let language = Language::from_code(&lang).with_context(|| format!("unsupported language: {lang}"))?;
            let ctx = AppContext::build(config)?;
            ctx.cache.set_language(language);
            let translated = if debounce {
                join_all(texts.iter().map(|text| ctx.cache.translate_debounced(text, true))).await
            } else {
                let mut out = Vec::with_capacity(texts.len());
                for text in &texts {
                    out.push(ctx.cache.translate(text, true).await);
                }
                out
            };
            for (text, translated) in texts.iter().zip(&translated) {
                println!("{translated}");
                if let Some(error) = ctx.cache.translation_error(text) {
                    eprintln!("translation error: {error}");
                }
            }
            if stats {
                eprintln!("{}", serde_json::to_string_pretty(&ctx.cache.stats())?);
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translate_accepts_many_texts_and_debounce() {
        let cli = Cli::try_parse_from(["cropsight", "translate", "Water early", "Water early", "--debounce"]).unwrap();
        match cli.command {
            Command::Translate { texts, lang, debounce, stats } => {
                assert_eq!(texts, ["Water early", "Water early"]);
                assert_eq!(lang, "hi-IN");
                assert!(debounce);
                assert!(!stats);
            }
            _ => panic!("expected translate"),
        }
    }

    #[test]
    fn translate_requires_text() {
        assert!(Cli::try_parse_from(["cropsight", "translate"]).is_err());
    }
}
