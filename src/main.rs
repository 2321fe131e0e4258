mod args;
mod assets;
mod caption;
mod compose;
mod config;
mod content;
mod error;
mod filtergraph;
mod media;
mod pipeline;
mod publish;
mod queue;
mod retry;
mod story;
mod subtitle;
mod thumbnail;
mod tts;

use anyhow::{bail, Context};
use clap::Parser;
use std::path::Path;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::args::{Args, Command};
use crate::assets::AssetResolver;
use crate::caption::{CaptionRenderer, OverlayRender};
use crate::compose::FfmpegComposer;
use crate::config::ChannelConfig;
use crate::media::Toolchain;
use crate::pipeline::{Pipeline, RunOptions, RunOutcome, Stages};
use crate::publish::instagram::InstagramPublisher;
use crate::publish::oauth::Authenticator;
use crate::queue::WorkQueue;
use crate::tts::{CachedSynthesizer, Narrator};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = dispatch(args.command).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn dispatch(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Run {
            channel,
            test,
            dry_run,
            keep_artifacts,
        } => {
            let options = RunOptions { dry_run, keep_artifacts };
            run(&channel.config, test, options).await
        }
        Command::Caption { channel, out } => caption_preview(&channel.config, &out),
        Command::Auth { channel } => reauthorize(&channel.config).await,
        Command::ExportToken { channel } => export_token(&channel.config),
        Command::FindIgId { channel } => find_instagram_accounts(&channel.config).await,
    }
}

fn load_config(path: &Path) -> anyhow::Result<ChannelConfig> {
    ChannelConfig::load(path).with_context(|| format!("loading channel config {}", path.display()))
}

async fn run(config: &Path, test: bool, options: RunOptions) -> anyhow::Result<()> {
    let mut cfg = load_config(config)?;
    if test {
        cfg.apply_test_mode().context("applying test-mode overrides")?;
    }
    let tools = Toolchain::discover(&cfg.tools);

    let tts_cache = cfg.tts.cache.then(|| cfg.cache_dir().join("tts"));
    let synth = CachedSynthesizer::new(tts::backend_for(&cfg.tts), tts_cache);
    info!("Speech backend: {} (voice {})", synth.backend_name(), cfg.tts.voice);
    let overlay = CaptionRenderer::new(&cfg.caption, cfg.render.width, cfg.render.height)
        .context("loading caption fonts")?;
    let publishers = if options.dry_run {
        Vec::new()
    } else {
        publish::publishers_for(&cfg)?
    };
    if publishers.is_empty() && !options.dry_run {
        bail!("channel '{}' has no [youtube], [instagram] or [facebook] section; use --dry-run to only render", cfg.name);
    }

    let stages = Stages {
        assets: AssetResolver::new(&cfg),
        narrator: Box::new(Narrator::new(synth, &cfg.tts, &tools)),
        overlay: Box::new(overlay),
        composer: Box::new(FfmpegComposer::new(&cfg, &tools)),
        publishers,
    };
    let outcome = Pipeline::new(&cfg, stages, options)
        .run_once()
        .await
        .with_context(|| format!("channel '{}' run failed; queue left untouched", cfg.name))?;

    match outcome {
        RunOutcome::QueueEmpty => warn!("Nothing to do: queue {} is empty", cfg.queue.display()),
        RunOutcome::DryRun { video } => info!("Dry run finished: {}", video.display()),
        RunOutcome::Published { uploads, kept, .. } => {
            for u in &uploads {
                info!("Published to {}: {}", u.platform, u.id);
            }
            if let Some(path) = kept {
                info!("Video kept at {}", path.display());
            }
        }
    }
    Ok(())
}

fn caption_preview(config: &Path, out: &Path) -> anyhow::Result<()> {
    let cfg = load_config(config)?;
    let queue = WorkQueue::load(&cfg.queue, cfg.kind)?;
    let Some(item) = queue.head() else {
        bail!("queue {} is empty", cfg.queue.display());
    };
    let renderer = CaptionRenderer::new(&cfg.caption, cfg.render.width, cfg.render.height)?;
    info!("Rendering with {}", renderer.body_font().path().display());
    renderer.render_to(&item.caption(cfg.caption.header.as_deref()), out)?;
    Ok(())
}

fn youtube_auth(cfg: &ChannelConfig) -> anyhow::Result<Authenticator> {
    let Some(yt) = &cfg.youtube else {
        bail!("channel '{}' has no [youtube] section", cfg.name);
    };
    Ok(Authenticator::new(yt)?)
}

async fn reauthorize(config: &Path) -> anyhow::Result<()> {
    let cfg = load_config(config)?;
    let auth = youtube_auth(&cfg)?;
    if auth.reset()? {
        info!("Removed cached token {}", auth.token_file().display());
    }
    auth.access_token().await.context("YouTube consent flow")?;
    info!("Token saved to {}", auth.token_file().display());
    Ok(())
}

fn export_token(config: &Path) -> anyhow::Result<()> {
    let cfg = load_config(config)?;
    let encoded = youtube_auth(&cfg)?.export()?;
    println!("{encoded}");
    Ok(())
}

async fn find_instagram_accounts(config: &Path) -> anyhow::Result<()> {
    let cfg = load_config(config)?;
    let Some(ig) = &cfg.instagram else {
        bail!("channel '{}' has no [instagram] section", cfg.name);
    };
    let accounts = InstagramPublisher::new(ig)?.find_business_accounts().await?;
    if accounts.is_empty() {
        warn!("The token manages no Facebook pages");
    }
    for a in accounts {
        match a.instagram_id {
            Some(id) => println!("{}\t{}\t{}", a.page_name, a.page_id, id),
            None => println!("{}\t{}\t(no linked Instagram business account)", a.page_name, a.page_id),
        }
    }
    Ok(())
}
