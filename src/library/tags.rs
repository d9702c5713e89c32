//! Embedded tag reading backed by `lofty`.

use std::path::{Path, PathBuf};

use lofty::file::TaggedFileExt;
use lofty::prelude::Accessor;
use lofty::tag::Tag;
use tracing::debug;

/// The tag fields reconciliation cares about. Empty values are `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackTags {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
}

fn first_non_empty<F>(primary: Option<&Tag>, tags: &[Tag], extractor: F) -> Option<String>
where
    F: Fn(&Tag) -> Option<String>,
{
    primary
        .into_iter()
        .chain(tags.iter())
        .filter_map(|tag| extractor(tag))
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
}

/// Read tags, treating unreadable or untagged files as having none.
pub fn read_tags(path: &Path) -> TrackTags {
    let tagged_file = match lofty::read_from_path(path) {
        Ok(file) => file,
        Err(e) => {
            debug!("No readable tags in {}: {}", path.display(), e);
            return TrackTags::default();
        }
    };
    let primary = tagged_file.primary_tag();
    let tags = tagged_file.tags();

    TrackTags {
        title: first_non_empty(primary, tags, |tag| tag.title().map(|v| v.into_owned())),
        artist: first_non_empty(primary, tags, |tag| tag.artist().map(|v| v.into_owned())),
        album: first_non_empty(primary, tags, |tag| tag.album().map(|v| v.into_owned())),
    }
}

/// [`read_tags`] on the blocking pool.
pub async fn read_tags_blocking(path: PathBuf) -> TrackTags {
    match tokio::task::spawn_blocking(move || read_tags(&path)).await {
        Ok(tags) => tags,
        Err(e) => {
            debug!("Tag reader task failed: {}", e);
            TrackTags::default()
        }
    }
}
