// M3U8 playlist parsing: playlist text -> typed master/media playlists.
//
// The parser is line- and tag-oriented. Lexing one `#EXT` line into a typed
// tag lives in `tag`; assembling the tag stream into a playlist lives in
// `playlist`. URIs are preserved verbatim; resolving them against the base
// URL is the caller's concern.

pub mod error;
pub mod playlist;
pub mod tag;

pub use error::ParseError;
pub use playlist::{
    ExtraTags, KeyDirective, MasterPlaylist, MediaPlaylist, MediaRendition, MediaSegment,
    VariantStream,
};
pub use tag::{AttributeList, KeyMethod, PlaylistType, SourcedTag, Tag};

/// Which playlist flavor the caller expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistHint {
    Master,
    Media,
}

/// A successfully parsed playlist.
#[derive(Debug, Clone, PartialEq)]
pub enum Playlist {
    Master(MasterPlaylist),
    Media(MediaPlaylist),
}

/// One meaningful playlist line after comments and blanks are dropped.
#[derive(Debug, Clone, PartialEq)]
pub enum Line {
    Tag(SourcedTag),
    Uri { uri: String, line: usize },
}

/// Scan playlist text into a [`Line`] stream.
///
/// Blank lines and pure comments (`#` not followed by `EXT`) are skipped.
/// The first non-blank line must be `#EXTM3U`.
pub fn scan_lines(text: &str) -> Result<Vec<Line>, ParseError> {
    let mut lines = Vec::new();
    let mut header_seen = false;

    for (index, raw) in text.lines().enumerate() {
        let number = index + 1;
        let line = raw.trim_end_matches('\r').trim();
        if line.is_empty() {
            continue;
        }
        if !header_seen {
            if line != "#EXTM3U" {
                return Err(ParseError::malformed(
                    number,
                    "playlist does not start with #EXTM3U",
                ));
            }
            header_seen = true;
            continue;
        }
        if line.starts_with("#EXT") {
            lines.push(Line::Tag(tag::parse_tag_line(line, number)?));
        } else if line.starts_with('#') {
            // Comment.
        } else {
            lines.push(Line::Uri {
                uri: line.to_owned(),
                line: number,
            });
        }
    }

    if !header_seen {
        return Err(ParseError::malformed(1, "empty playlist"));
    }

    Ok(lines)
}

/// Parse playlist text into the flavor named by `hint`.
///
/// `base_url` is recorded on the result for the caller's URI resolution;
/// the parser itself never touches segment URIs.
pub fn parse(text: &str, base_url: &str, hint: PlaylistHint) -> Result<Playlist, ParseError> {
    let lines = scan_lines(text)?;
    match hint {
        PlaylistHint::Master => playlist::build_master(base_url, lines).map(Playlist::Master),
        PlaylistHint::Media => playlist::build_media(base_url, lines).map(Playlist::Media),
    }
}
