use async_trait::async_trait;
use url::Url;

use crate::error::MetadataError;
use crate::host::MetadataExtractor;
use crate::types::{ContextInfo, SourceMetadata};

/// Describes a source from what the host already knows about its context.
///
/// Also serves as the fallback when a richer extractor fails or times out.
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicExtractor;

impl BasicExtractor {
    pub fn describe_now(context: &ContextInfo) -> SourceMetadata {
        let url = context.url.as_deref().and_then(|u| Url::parse(u).ok());
        let hostname = url
            .as_ref()
            .and_then(|u| u.host_str())
            .unwrap_or_default()
            .to_string();
        let thumbnail_url = url
            .as_ref()
            .and_then(youtube_thumbnail)
            .or_else(|| context.page_image.clone());

        SourceMetadata {
            title: context.title.clone(),
            hostname,
            favicon_url: context.favicon_url.clone(),
            thumbnail_url,
            accent_color: context.accent_color,
        }
    }

    /// Only what the host reported directly: no artwork, no accent color.
    pub fn partial(context: &ContextInfo) -> SourceMetadata {
        SourceMetadata {
            thumbnail_url: None,
            accent_color: None,
            ..Self::describe_now(context)
        }
    }
}

#[async_trait]
impl MetadataExtractor for BasicExtractor {
    async fn describe(&self, context: &ContextInfo) -> Result<SourceMetadata, MetadataError> {
        Ok(Self::describe_now(context))
    }
}

const YOUTUBE_ID_LEN: usize = 11;

/// YouTube pages carry a predictable high quality thumbnail.
fn youtube_thumbnail(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    if host != "www.youtube.com" && host != "music.youtube.com" {
        return None;
    }

    let from_query = || {
        url.query_pairs()
            .find(|(k, _)| k == "v")
            .map(|(_, v)| v.into_owned())
    };
    let from_path = || {
        let mut segments = url.path_segments()?;
        match segments.next()? {
            "embed" | "shorts" => segments.next().map(str::to_string),
            _ => None,
        }
    };

    let video = match url.path() {
        "/watch" => from_query(),
        _ => from_path(),
    }?;

    let id = video.get(..YOUTUBE_ID_LEN)?;
    id.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        .then(|| format!("https://i.ytimg.com/vi/{}/hqdefault.jpg", id))
}
