//! M3U playlist loading and channel selection

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, info};

use crate::network::fetch_text;
use crate::types::{Channel, base_name};

static ATTRIBUTE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"([A-Za-z0-9_-]+)="([^"]*)""#).expect("attribute pattern"));

#[derive(Debug, Error)]
pub enum PlaylistError {
    #[error("Could not fetch playlist from {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Could not read playlist {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Group '{group}' not found in playlist")]
    GroupNotFound { group: String },

    #[error("Start channel '{channel}' not found in group '{group}'")]
    NotFound { channel: String, group: String },
}

/// Which slice of the playlist to tune
#[derive(Debug, Clone)]
pub struct Selection<'a> {
    pub target_group: &'a str,
    pub start_channel: &'a str,
    pub count: usize,
}

/// Fetches `source` (an http(s) URL or a local path) and selects channels from it.
pub async fn load(
    client: &Client,
    source: &str,
    selection: &Selection<'_>,
) -> Result<Vec<Channel>, PlaylistError> {
    let content = if source.starts_with("http://") || source.starts_with("https://") {
        info!("Fetching M3U from {source}");
        fetch_text(client, source)
            .await
            .map_err(|e| PlaylistError::Fetch {
                url: source.to_string(),
                source: e,
            })?
    } else {
        let path = Path::new(source);
        info!("Reading M3U from {}", path.display());
        tokio::fs::read_to_string(path)
            .await
            .map_err(|e| PlaylistError::Read {
                path: path.to_path_buf(),
                source: e,
            })?
    };

    let entries = parse_m3u(&content);
    debug!("Parsed {} playlist entries", entries.len());
    select(entries, selection)
}

/// Parses every `#EXTINF` entry in file order.
/// Entries without a group get an empty group; entries without a URL or a name are dropped.
pub fn parse_m3u(content: &str) -> Vec<Channel> {
    let lines: Vec<&str> = content.lines().map(str::trim).collect();
    let mut channels = Vec::new();

    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        i += 1;
        let Some(info) = line.strip_prefix("#EXTINF:") else {
            continue;
        };

        // URL is the next line that is neither blank nor a directive
        let url = lines[i..]
            .iter()
            .position(|l| !l.is_empty() && !l.starts_with('#'))
            .map(|offset| i + offset);
        let next_extinf = lines[i..]
            .iter()
            .position(|l| l.starts_with("#EXTINF:"))
            .map(|offset| i + offset);

        let url_idx = match (url, next_extinf) {
            (Some(u), Some(n)) if n < u => continue,
            (Some(u), _) => u,
            (None, _) => continue,
        };

        let (attributes, title) = split_title(info);
        let mut name = None;
        let mut group = String::new();
        for cap in ATTRIBUTE.captures_iter(attributes) {
            match &cap[1] {
                "tvg-name" if !cap[2].trim().is_empty() => name = Some(cap[2].trim().to_string()),
                "group-title" => group = cap[2].trim().to_string(),
                _ => {}
            }
        }

        i = url_idx + 1;
        let name = name.unwrap_or_else(|| title.trim().to_string());
        if base_name(&name).is_empty() {
            debug!("Skipping unnamed entry {}", lines[url_idx]);
            continue;
        }
        channels.push(Channel {
            name,
            group,
            stream_url: lines[url_idx].to_string(),
        });
    }
    channels
}

/// Splits `-1 key="v",Title` at the first comma outside quotes.
fn split_title(info: &str) -> (&str, &str) {
    let mut in_quotes = false;
    for (idx, ch) in info.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => return (&info[..idx], &info[idx + 1..]),
            _ => {}
        }
    }
    (info, "")
}

/// Keeps the target group, then the contiguous run starting at the start channel.
pub fn select(entries: Vec<Channel>, selection: &Selection<'_>) -> Result<Vec<Channel>, PlaylistError> {
    let in_group: Vec<Channel> = entries
        .into_iter()
        .filter(|c| c.group == selection.target_group)
        .collect();
    if in_group.is_empty() {
        return Err(PlaylistError::GroupNotFound {
            group: selection.target_group.to_string(),
        });
    }

    let start = in_group
        .iter()
        .position(|c| c.name == selection.start_channel || c.base_name() == selection.start_channel)
        .ok_or_else(|| PlaylistError::NotFound {
            channel: selection.start_channel.to_string(),
            group: selection.target_group.to_string(),
        })?;

    Ok(in_group
        .into_iter()
        .skip(start)
        .take(selection.count)
        .collect())
}
