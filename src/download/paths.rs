use rand::RngCore as _;

use crate::types::MediaKind;

/// Strip the query string and fragment from a URL.
pub fn strip_query(url: &str) -> &str {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    &url[..end]
}

/// Lowercase file extension of the last path segment of `url`, without the
/// dot. Only short alphanumeric extensions are accepted.
pub fn file_extension(url: &str) -> Option<String> {
    let path = strip_query(url);
    let path = path.split_once("://").map_or(path, |(_, rest)| {
        rest.find('/').map_or("", |slash| &rest[slash..])
    });
    let segment = path.rsplit('/').next()?;
    let (stem, ext) = segment.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() || ext.len() > 5 {
        return None;
    }
    if !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Classify a media URL by its extension. Unknown extensions give `None` and
/// the media is skipped.
pub fn media_kind_from_url(url: &str) -> Option<MediaKind> {
    let ext = file_extension(url)?;
    match ext.as_str() {
        "jpg" | "jpeg" | "png" | "webp" | "heif" | "heic" => Some(MediaKind::Photo),
        "gif" => Some(MediaKind::Gif),
        "mp4" | "m4v" | "mov" | "avi" | "webm" => Some(MediaKind::Video),
        "mp3" | "m4a" | "wav" | "ogg" => Some(MediaKind::Audio),
        _ => None,
    }
}

/// Fresh store-relative filename for a download from `url`.
///
/// 20 random bytes as 40 hex chars, fanned out over two directory levels:
/// `ab/cd/abcd...<.ext>`. The extension of the source URL is kept.
pub fn store_filename(url: &str) -> String {
    let mut bytes = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut bytes);
    let name = hex::encode(bytes);
    let ext = file_extension(url)
        .map(|e| format!(".{e}"))
        .unwrap_or_default();
    format!("{}/{}/{}{}", &name[0..2], &name[2..4], name, ext)
}
