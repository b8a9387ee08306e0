// Typed playlists and the builders that assemble them from a tag stream.

use crate::error::ParseError;
use crate::tag::{KeyMethod, PlaylistType, SourcedTag, Tag};
use crate::{Line, PlaylistHint};

/// Ordered map of unrecognized tag name -> raw tag lines.
///
/// Insertion order of names is preserved; repeated tags append to the
/// existing entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtraTags {
    entries: Vec<(String, Vec<String>)>,
}

impl ExtraTags {
    pub fn push(&mut self, name: String, raw_line: String) {
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some((_, lines)) => lines.push(raw_line),
            None => self.entries.push((name, vec![raw_line])),
        }
    }

    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, lines)| lines.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(n, lines)| (n.as_str(), lines.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn raw_lines(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .flat_map(|(_, lines)| lines.iter().map(String::as_str))
    }
}

/// One `EXT-X-KEY` directive in playlist order.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyDirective {
    pub method: KeyMethod,
    pub uri: Option<String>,
    pub iv: Option<String>,
    pub key_format: Option<String>,
    /// Verbatim tag line.
    pub raw: String,
    /// Index of the first segment this directive governs.
    pub before_segment: usize,
}

/// One `EXTINF` + URI pair.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaSegment {
    pub duration: f64,
    pub title: Option<String>,
    /// URI exactly as it appeared in the playlist; resolution against the
    /// base URL happens in the engine, not here.
    pub uri: String,
    /// Index into [`MediaPlaylist::keys`] of the governing key directive,
    /// `None` when no `EXT-X-KEY` precedes this segment.
    pub key: Option<usize>,
    /// Verbatim `EXTINF` line.
    pub raw_inf: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaPlaylist {
    pub base_url: String,
    pub version: Option<u64>,
    pub target_duration: u64,
    pub media_sequence: Option<u64>,
    pub playlist_type: Option<PlaylistType>,
    pub allow_cache: Option<bool>,
    pub segments: Vec<MediaSegment>,
    pub keys: Vec<KeyDirective>,
    pub end_list: bool,
    pub extra_tags: ExtraTags,
}

impl MediaPlaylist {
    /// The key directive governing segment `index`, if any.
    pub fn effective_key(&self, index: usize) -> Option<&KeyDirective> {
        self.segments
            .get(index)
            .and_then(|seg| seg.key)
            .map(|k| &self.keys[k])
    }

    /// True when any segment is governed by a non-NONE key.
    pub fn has_encrypted_segments(&self) -> bool {
        self.segments.iter().any(|seg| {
            seg.key
                .is_some_and(|k| self.keys[k].method != KeyMethod::None)
        })
    }

    /// Sum of all segment durations, in seconds.
    pub fn total_duration(&self) -> f64 {
        self.segments.iter().map(|seg| seg.duration).sum()
    }

    /// Media sequence number of segment `index` (base sequence + index).
    pub fn sequence_of(&self, index: usize) -> u64 {
        self.media_sequence.unwrap_or(0) + index as u64
    }

    /// Serialize back to playlist text from the preserved lines and typed
    /// header values. Re-parsing the result yields an equivalent playlist.
    pub fn to_text(&self) -> String {
        let mut out = String::from("#EXTM3U\n");
        if let Some(v) = self.version {
            out.push_str(&format!("#EXT-X-VERSION:{v}\n"));
        }
        out.push_str(&format!("#EXT-X-TARGETDURATION:{}\n", self.target_duration));
        if let Some(seq) = self.media_sequence {
            out.push_str(&format!("#EXT-X-MEDIA-SEQUENCE:{seq}\n"));
        }
        if let Some(kind) = self.playlist_type {
            let kind = match kind {
                PlaylistType::Vod => "VOD",
                PlaylistType::Event => "EVENT",
            };
            out.push_str(&format!("#EXT-X-PLAYLIST-TYPE:{kind}\n"));
        }
        if let Some(allow) = self.allow_cache {
            out.push_str(&format!(
                "#EXT-X-ALLOW-CACHE:{}\n",
                if allow { "YES" } else { "NO" }
            ));
        }
        for raw in self.extra_tags.raw_lines() {
            out.push_str(raw);
            out.push('\n');
        }
        for (index, segment) in self.segments.iter().enumerate() {
            for key in self.keys.iter().filter(|k| k.before_segment == index) {
                out.push_str(&key.raw);
                out.push('\n');
            }
            out.push_str(&segment.raw_inf);
            out.push('\n');
            out.push_str(&segment.uri);
            out.push('\n');
        }
        for key in self
            .keys
            .iter()
            .filter(|k| k.before_segment == self.segments.len())
        {
            out.push_str(&key.raw);
            out.push('\n');
        }
        if self.end_list {
            out.push_str("#EXT-X-ENDLIST\n");
        }
        out
    }
}

/// One `EXT-X-STREAM-INF` + URI pair.
#[derive(Debug, Clone, PartialEq)]
pub struct VariantStream {
    pub bandwidth: u64,
    pub resolution: Option<(u32, u32)>,
    pub codecs: Option<String>,
    pub uri: String,
    /// Verbatim `EXT-X-STREAM-INF` line.
    pub raw: String,
}

/// One `EXT-X-MEDIA` rendition entry.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaRendition {
    pub media_type: String,
    pub group_id: String,
    pub name: String,
    pub uri: Option<String>,
    pub raw: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MasterPlaylist {
    pub base_url: String,
    pub version: Option<u64>,
    pub variants: Vec<VariantStream>,
    pub renditions: Vec<MediaRendition>,
    pub extra_tags: ExtraTags,
}

impl MasterPlaylist {
    /// The variant with the highest declared bandwidth.
    pub fn highest_bandwidth(&self) -> Option<&VariantStream> {
        self.variants.iter().max_by_key(|v| v.bandwidth)
    }

    pub fn to_text(&self) -> String {
        let mut out = String::from("#EXTM3U\n");
        if let Some(v) = self.version {
            out.push_str(&format!("#EXT-X-VERSION:{v}\n"));
        }
        for raw in self.extra_tags.raw_lines() {
            out.push_str(raw);
            out.push('\n');
        }
        for rendition in &self.renditions {
            out.push_str(&rendition.raw);
            out.push('\n');
        }
        for variant in &self.variants {
            out.push_str(&variant.raw);
            out.push('\n');
            out.push_str(&variant.uri);
            out.push('\n');
        }
        out
    }
}

pub(crate) fn build_media(
    base_url: &str,
    lines: Vec<Line>,
) -> Result<MediaPlaylist, ParseError> {
    let mut playlist = MediaPlaylist {
        base_url: base_url.to_owned(),
        version: None,
        target_duration: 0,
        media_sequence: None,
        playlist_type: None,
        allow_cache: None,
        segments: Vec::new(),
        keys: Vec::new(),
        end_list: false,
        extra_tags: ExtraTags::default(),
    };
    let mut target_duration = None;
    // EXTINF waiting for its URI line: (duration, title, raw line, line number).
    let mut pending: Option<(f64, Option<String>, String, usize)> = None;

    for line in lines {
        match line {
            Line::Tag(SourcedTag { tag, raw, line }) => match tag {
                Tag::Inf { duration, title } => {
                    if pending.is_some() {
                        return Err(ParseError::malformed(
                            line,
                            "EXTINF without a following segment URI",
                        ));
                    }
                    pending = Some((duration, title, raw, line));
                }
                Tag::StreamInf(_) => {
                    return Err(ParseError::PlaylistTypeMismatch {
                        expected: PlaylistHint::Media,
                        found: "EXT-X-STREAM-INF",
                        line,
                    });
                }
                Tag::Version(v) => playlist.version = Some(v),
                Tag::TargetDuration(d) => target_duration = Some(d),
                Tag::MediaSequence(seq) => playlist.media_sequence = Some(seq),
                Tag::PlaylistType(kind) => playlist.playlist_type = Some(kind),
                Tag::AllowCache(allow) => playlist.allow_cache = Some(allow),
                Tag::EndList => playlist.end_list = true,
                Tag::Key(key) => playlist.keys.push(KeyDirective {
                    method: key.method,
                    uri: key.uri,
                    iv: key.iv,
                    key_format: key.key_format,
                    raw,
                    before_segment: playlist.segments.len(),
                }),
                Tag::Media(_) => {
                    return Err(ParseError::PlaylistTypeMismatch {
                        expected: PlaylistHint::Media,
                        found: "EXT-X-MEDIA",
                        line,
                    });
                }
                Tag::Extm3u => {}
                Tag::Unknown { name } => playlist.extra_tags.push(name, raw),
            },
            Line::Uri { uri, line } => {
                let Some((duration, title, raw_inf, _)) = pending.take() else {
                    return Err(ParseError::malformed(line, "unexpected URI line"));
                };
                playlist.segments.push(MediaSegment {
                    duration,
                    title,
                    uri,
                    key: playlist.keys.len().checked_sub(1),
                    raw_inf,
                });
            }
        }
    }

    if let Some((_, _, _, line)) = pending {
        return Err(ParseError::malformed(
            line,
            "EXTINF without a following segment URI",
        ));
    }
    playlist.target_duration = target_duration.ok_or(ParseError::MissingRequiredTag {
        tag: "EXT-X-TARGETDURATION",
    })?;

    Ok(playlist)
}

pub(crate) fn build_master(
    base_url: &str,
    lines: Vec<Line>,
) -> Result<MasterPlaylist, ParseError> {
    let mut playlist = MasterPlaylist {
        base_url: base_url.to_owned(),
        version: None,
        variants: Vec::new(),
        renditions: Vec::new(),
        extra_tags: ExtraTags::default(),
    };
    // EXT-X-STREAM-INF waiting for its URI line.
    let mut pending: Option<(crate::tag::StreamInfAttributes, String, usize)> = None;

    for line in lines {
        match line {
            Line::Tag(SourcedTag { tag, raw, line }) => match tag {
                Tag::StreamInf(inf) => {
                    if pending.is_some() {
                        return Err(ParseError::malformed(
                            line,
                            "EXT-X-STREAM-INF without a following URI",
                        ));
                    }
                    pending = Some((inf, raw, line));
                }
                Tag::Inf { .. } => {
                    return Err(ParseError::PlaylistTypeMismatch {
                        expected: PlaylistHint::Master,
                        found: "EXTINF",
                        line,
                    });
                }
                Tag::Media(media) => playlist.renditions.push(MediaRendition {
                    media_type: media.media_type,
                    group_id: media.group_id,
                    name: media.name,
                    uri: media.uri,
                    raw,
                }),
                Tag::Version(v) => playlist.version = Some(v),
                Tag::Extm3u => {}
                Tag::TargetDuration(_)
                | Tag::MediaSequence(_)
                | Tag::PlaylistType(_)
                | Tag::AllowCache(_)
                | Tag::EndList
                | Tag::Key(_) => {
                    return Err(ParseError::PlaylistTypeMismatch {
                        expected: PlaylistHint::Master,
                        found: "media playlist tag",
                        line,
                    });
                }
                Tag::Unknown { name } => playlist.extra_tags.push(name, raw),
            },
            Line::Uri { uri, line } => {
                let Some((inf, raw, _)) = pending.take() else {
                    return Err(ParseError::malformed(line, "unexpected URI line"));
                };
                playlist.variants.push(VariantStream {
                    bandwidth: inf.bandwidth,
                    resolution: inf.resolution,
                    codecs: inf.codecs,
                    uri,
                    raw,
                });
            }
        }
    }

    if let Some((_, _, line)) = pending {
        return Err(ParseError::malformed(
            line,
            "EXT-X-STREAM-INF without a following URI",
        ));
    }

    Ok(playlist)
}
