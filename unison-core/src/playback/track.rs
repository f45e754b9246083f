//! Track URL validation

/// File extensions we accept as playable audio
const AUDIO_EXTENSIONS: &[&str] = &[
    "mp3", "m4a", "aac", "ogg", "oga", "opus", "wav", "flac", "webm",
];

/// Check whether a URL plausibly resolves to an audio file.
///
/// Requires an http(s) URL whose path ends in a recognized audio extension.
/// Query strings and fragments are ignored.
pub fn is_audio_url(url: &str) -> bool {
    let url = url.trim();

    let rest = match url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
    {
        Some(rest) if !rest.is_empty() => rest,
        _ => return false,
    };

    // Path only: drop query string and fragment
    let path = rest.split(['?', '#']).next().unwrap_or("");

    let Some((_, extension)) = path.rsplit_once('.') else {
        return false;
    };

    AUDIO_EXTENSIONS
        .iter()
        .any(|known| extension.eq_ignore_ascii_case(known))
}
