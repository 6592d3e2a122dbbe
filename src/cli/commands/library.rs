//! Track store commands and the ICY check.

use anyhow::Context;
use std::path::Path;
use tokio::runtime::Runtime;
use tracing::{debug, info};

use super::{collect_audio_files, open_db};
use crate::config::{self, Config};
use crate::db::{self, SqliteTrackStore, TrackStore};
use crate::metadata::batch::{TagProbe, TrackProbe};
use crate::metadata::icy::split_title;
use crate::metadata::poller::{IcyHttpSource, StreamMetadataSource};
use crate::model::{TrackId, uri_scheme};
use crate::net::HttpClient;
use crate::player::state::format_duration;

/// Create the database, and the config file when it is missing
pub fn cmd_init(rt: &Runtime, db_path: &Path, config_path: Option<&Path>, config: &Config) -> anyhow::Result<()> {
    if let Some(path) = config_path
        && !path.exists()
    {
        config::save_to(config, path).context("Failed to write config")?;
        println!("Config written to {}", path.display());
    }
    rt.block_on(async {
        open_db(db_path).await?;
        println!("Database ready at {}", db_path.display());
        Ok(())
    })
}

/// Insert tracks for URIs, files and directories
pub fn cmd_add(rt: &Runtime, db_path: &Path, sources: &[String], recursive: bool) -> anyhow::Result<()> {
    rt.block_on(async {
        let pool = open_db(db_path).await?;
        let mut added = 0usize;

        for source in sources {
            let uris: Vec<String> = if uri_scheme(source).is_some() {
                vec![source.clone()]
            } else {
                let path = Path::new(source);
                if !path.exists() {
                    eprintln!("Skipping {}: no such file or directory", source);
                    continue;
                }
                collect_audio_files(path, recursive)
                    .into_iter()
                    .map(|p| p.canonicalize().unwrap_or(p).display().to_string())
                    .collect()
            };

            for uri in uris {
                let id = db::insert_track(&pool, &uri)
                    .await
                    .with_context(|| format!("Failed to add {}", uri))?;
                debug!(target: "cli", id = %id, uri = %uri, "Track added");
                println!("{:>6}  {}", id, uri);
                added += 1;
            }
        }

        info!(target: "cli", added, "Tracks added");
        println!("Added {} track(s).", added);
        Ok(())
    })
}

/// List all tracks in the database
pub fn cmd_list(rt: &Runtime, db_path: &Path) -> anyhow::Result<()> {
    rt.block_on(async {
        let pool = open_db(db_path).await?;
        let tracks = db::get_all_tracks(&pool).await.context("Failed to list tracks")?;
        if tracks.is_empty() {
            println!("No tracks. Use `servestream add` first.");
            return Ok(());
        }
        for track in tracks {
            let duration = track
                .duration()
                .map(format_duration)
                .unwrap_or_else(|| "--:--".to_string());
            println!(
                "{:>6}  {:>8}  {} - {}  ({})",
                track.id,
                duration,
                track.display_artist(),
                track.display_title(),
                track.uri
            );
        }
        Ok(())
    })
}

/// Probe one track for tags and write them back
pub fn cmd_probe(rt: &Runtime, db_path: &Path, config: &Config, id: i64, artwork: bool) -> anyhow::Result<()> {
    rt.block_on(async {
        let store = SqliteTrackStore::new(open_db(db_path).await?);
        let id = TrackId(id);
        let track = store
            .get_track(id)
            .await?
            .with_context(|| format!("Track {} not found", id))?;

        let client = HttpClient::new(config.metadata.poll_timeout())?;
        let probe = TagProbe::new(client, config.metadata.max_probe_bytes);
        let metadata = probe
            .probe(&track)
            .await
            .with_context(|| format!("Failed to probe {}", track.uri))?;

        println!("Title:    {}", metadata.title.as_deref().unwrap_or("-"));
        println!("Artist:   {}", metadata.artist.as_deref().unwrap_or("-"));
        println!("Album:    {}", metadata.album.as_deref().unwrap_or("-"));
        println!(
            "Duration: {}",
            metadata.duration.map(format_duration).unwrap_or_else(|| "-".to_string())
        );
        if let Some(bytes) = &metadata.artwork {
            println!("Artwork:  {} bytes", bytes.len());
        }

        if !metadata.has_tags() {
            println!("No tags found; track left unchanged.");
            return Ok(());
        }
        store.update_track(id, &metadata.into_update(artwork)).await?;
        println!("Track {} updated.", id);
        Ok(())
    })
}

/// Print one ICY stream title probe
pub fn cmd_icy(rt: &Runtime, config: &Config, url: &str) -> anyhow::Result<()> {
    rt.block_on(async {
        let client = HttpClient::new(config.metadata.poll_timeout())?;
        let source = IcyHttpSource::new(client);
        match source.fetch_title(url).await? {
            Some(value) => {
                let parsed = split_title(&value);
                println!("StreamTitle: {}", value);
                println!("Artist:      {}", parsed.artist);
                println!("Title:       {}", parsed.title);
            }
            None => println!("No stream title available."),
        }
        Ok(())
    })
}
