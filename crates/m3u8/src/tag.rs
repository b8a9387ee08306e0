// M3U8 tag lexing: one `#EXT` line -> one typed `Tag` value.
//
// Known tags are matched against a longest-prefix table; everything else
// that starts with `#EXT` is preserved verbatim as `Tag::Unknown`.

use crate::error::ParseError;

/// Playlist type declared by `EXT-X-PLAYLIST-TYPE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistType {
    Vod,
    Event,
}

/// Encryption method declared by `EXT-X-KEY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyMethod {
    #[default]
    None,
    Aes128,
}

/// A single parsed attribute list, order preserved.
///
/// Duplicate keys keep the first-seen value, per the parser contract.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributeList {
    entries: Vec<(String, String)>,
}

impl AttributeList {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn insert_first_wins(&mut self, key: String, value: String) {
        if !self.entries.iter().any(|(k, _)| *k == key) {
            self.entries.push((key, value));
        }
    }
}

/// Split an attribute payload on commas that are not inside double quotes,
/// then split each attribute on the first `=`. Surrounding quotes are
/// stripped from values.
pub fn parse_attribute_list(
    tag: &'static str,
    payload: &str,
    line: usize,
) -> Result<AttributeList, ParseError> {
    let mut attrs = AttributeList::default();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut fields: Vec<String> = Vec::new();

    for ch in payload.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                field.push(ch);
            }
            ',' if !in_quotes => {
                fields.push(std::mem::take(&mut field));
            }
            _ => field.push(ch),
        }
    }
    if in_quotes {
        return Err(ParseError::invalid_attribute(
            tag,
            line,
            "unterminated quoted value",
        ));
    }
    if !field.is_empty() {
        fields.push(field);
    }

    for raw in fields {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        let Some((key, value)) = raw.split_once('=') else {
            return Err(ParseError::invalid_attribute(
                tag,
                line,
                format!("attribute `{raw}` has no `=`"),
            ));
        };
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(value);
        attrs.insert_first_wins(key.trim().to_owned(), value.to_owned());
    }

    Ok(attrs)
}

/// `EXT-X-KEY` directive payload.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyAttributes {
    pub method: KeyMethod,
    pub uri: Option<String>,
    pub iv: Option<String>,
    pub key_format: Option<String>,
}

/// `EXT-X-STREAM-INF` payload (the following URI line is attached by the
/// playlist builder, not the lexer).
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfAttributes {
    pub bandwidth: u64,
    pub resolution: Option<(u32, u32)>,
    pub codecs: Option<String>,
}

/// `EXT-X-MEDIA` payload.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaAttributes {
    pub media_type: String,
    pub group_id: String,
    pub name: String,
    pub uri: Option<String>,
}

/// One playlist tag in typed form.
#[derive(Debug, Clone, PartialEq)]
pub enum Tag {
    Extm3u,
    Version(u64),
    TargetDuration(u64),
    MediaSequence(u64),
    PlaylistType(PlaylistType),
    AllowCache(bool),
    /// `EXTINF:<duration>,<optional title>`; the URI follows on the next line.
    Inf {
        duration: f64,
        title: Option<String>,
    },
    Key(KeyAttributes),
    EndList,
    StreamInf(StreamInfAttributes),
    Media(MediaAttributes),
    /// Any `#EXT` tag not in the known table, keyed by its tag name.
    Unknown {
        name: String,
    },
}

/// A tag plus the verbatim line it was parsed from.
#[derive(Debug, Clone, PartialEq)]
pub struct SourcedTag {
    pub tag: Tag,
    pub raw: String,
    pub line: usize,
}

// Known tag names. Longest prefix wins, so EXT-X-MEDIA-SEQUENCE must be
// tried before EXT-X-MEDIA; the table is kept sorted by descending length.
const KNOWN_TAGS: &[&str] = &[
    "#EXT-X-MEDIA-SEQUENCE",
    "#EXT-X-TARGETDURATION",
    "#EXT-X-PLAYLIST-TYPE",
    "#EXT-X-ALLOW-CACHE",
    "#EXT-X-STREAM-INF",
    "#EXT-X-VERSION",
    "#EXT-X-ENDLIST",
    "#EXT-X-MEDIA",
    "#EXT-X-KEY",
    "#EXTM3U",
    "#EXTINF",
];

fn match_known_tag(line: &str) -> Option<(&'static str, &str)> {
    for &name in KNOWN_TAGS {
        if let Some(rest) = line.strip_prefix(name) {
            // The remainder must be empty or a `:`-introduced payload,
            // otherwise this line is a longer, unknown tag name.
            if rest.is_empty() {
                return Some((name, ""));
            }
            if let Some(payload) = rest.strip_prefix(':') {
                return Some((name, payload));
            }
        }
    }
    None
}

fn parse_int(tag: &'static str, payload: &str, line: usize) -> Result<u64, ParseError> {
    payload.trim().parse::<u64>().map_err(|_| {
        ParseError::malformed(line, format!("{tag} expects an integer, got `{payload}`"))
    })
}

fn parse_key(payload: &str, line: usize) -> Result<KeyAttributes, ParseError> {
    const TAG: &str = "#EXT-X-KEY";
    let attrs = parse_attribute_list(TAG, payload, line)?;
    let method = match attrs.get("METHOD") {
        Some("NONE") => KeyMethod::None,
        Some("AES-128") => KeyMethod::Aes128,
        Some(other) => {
            return Err(ParseError::invalid_attribute(
                TAG,
                line,
                format!("unsupported METHOD `{other}`"),
            ));
        }
        None => {
            return Err(ParseError::invalid_attribute(
                TAG,
                line,
                "required attribute METHOD is missing",
            ));
        }
    };
    Ok(KeyAttributes {
        method,
        uri: attrs.get("URI").map(str::to_owned),
        iv: attrs.get("IV").map(str::to_owned),
        key_format: attrs.get("KEYFORMAT").map(str::to_owned),
    })
}

fn parse_stream_inf(payload: &str, line: usize) -> Result<StreamInfAttributes, ParseError> {
    const TAG: &str = "#EXT-X-STREAM-INF";
    let attrs = parse_attribute_list(TAG, payload, line)?;
    let bandwidth = attrs
        .get("BANDWIDTH")
        .ok_or_else(|| {
            ParseError::invalid_attribute(TAG, line, "required attribute BANDWIDTH is missing")
        })?
        .parse::<u64>()
        .map_err(|_| ParseError::invalid_attribute(TAG, line, "BANDWIDTH is not an integer"))?;
    let resolution = match attrs.get("RESOLUTION") {
        Some(res) => Some(parse_resolution(res).ok_or_else(|| {
            ParseError::invalid_attribute(TAG, line, format!("bad RESOLUTION `{res}`"))
        })?),
        None => None,
    };
    Ok(StreamInfAttributes {
        bandwidth,
        resolution,
        codecs: attrs.get("CODECS").map(str::to_owned),
    })
}

fn parse_resolution(value: &str) -> Option<(u32, u32)> {
    let (w, h) = value.split_once(['x', 'X'])?;
    Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
}

fn parse_media(payload: &str, line: usize) -> Result<MediaAttributes, ParseError> {
    const TAG: &str = "#EXT-X-MEDIA";
    let attrs = parse_attribute_list(TAG, payload, line)?;
    let require = |key: &'static str| {
        attrs.get(key).map(str::to_owned).ok_or_else(|| {
            ParseError::invalid_attribute(TAG, line, format!("required attribute {key} is missing"))
        })
    };
    Ok(MediaAttributes {
        media_type: require("TYPE")?,
        group_id: require("GROUP-ID")?,
        name: require("NAME")?,
        uri: attrs.get("URI").map(str::to_owned),
    })
}

fn parse_inf(payload: &str, line: usize) -> Result<Tag, ParseError> {
    let (duration, title) = match payload.split_once(',') {
        Some((d, t)) => (d, Some(t)),
        None => (payload, None),
    };
    let duration = duration.trim().parse::<f64>().map_err(|_| {
        ParseError::malformed(line, format!("EXTINF duration `{duration}` is not a number"))
    })?;
    let title = title
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_owned);
    Ok(Tag::Inf { duration, title })
}

/// Parse a single `#EXT` line into a [`SourcedTag`].
///
/// The caller guarantees the line starts with `#EXT`; anything it cannot
/// match against the known table comes back as [`Tag::Unknown`].
pub fn parse_tag_line(raw: &str, line: usize) -> Result<SourcedTag, ParseError> {
    let tag = match match_known_tag(raw) {
        Some(("#EXTM3U", _)) => Tag::Extm3u,
        Some(("#EXT-X-VERSION", payload)) => Tag::Version(parse_int("#EXT-X-VERSION", payload, line)?),
        Some(("#EXT-X-TARGETDURATION", payload)) => {
            Tag::TargetDuration(parse_int("#EXT-X-TARGETDURATION", payload, line)?)
        }
        Some(("#EXT-X-MEDIA-SEQUENCE", payload)) => {
            Tag::MediaSequence(parse_int("#EXT-X-MEDIA-SEQUENCE", payload, line)?)
        }
        Some(("#EXT-X-PLAYLIST-TYPE", payload)) => match payload.trim() {
            "VOD" => Tag::PlaylistType(PlaylistType::Vod),
            "EVENT" => Tag::PlaylistType(PlaylistType::Event),
            other => {
                return Err(ParseError::malformed(
                    line,
                    format!("unknown playlist type `{other}`"),
                ));
            }
        },
        Some(("#EXT-X-ALLOW-CACHE", payload)) => match payload.trim() {
            "YES" => Tag::AllowCache(true),
            "NO" => Tag::AllowCache(false),
            other => {
                return Err(ParseError::invalid_attribute(
                    "#EXT-X-ALLOW-CACHE",
                    line,
                    format!("expected YES or NO, got `{other}`"),
                ));
            }
        },
        Some(("#EXTINF", payload)) => parse_inf(payload, line)?,
        Some(("#EXT-X-KEY", payload)) => Tag::Key(parse_key(payload, line)?),
        Some(("#EXT-X-ENDLIST", _)) => Tag::EndList,
        Some(("#EXT-X-STREAM-INF", payload)) => Tag::StreamInf(parse_stream_inf(payload, line)?),
        Some(("#EXT-X-MEDIA", payload)) => Tag::Media(parse_media(payload, line)?),
        Some((name, _)) => {
            // Table entries are exhaustive above; keep the compiler honest.
            return Err(ParseError::malformed(
                line,
                format!("unhandled known tag {name}"),
            ));
        }
        None => Tag::Unknown {
            name: raw
                .split(':')
                .next()
                .unwrap_or(raw)
                .trim_start_matches('#')
                .to_owned(),
        },
    };

    Ok(SourcedTag {
        tag,
        raw: raw.to_owned(),
        line,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn value_tags_parse_integers() {
        let parsed = parse_tag_line("#EXT-X-TARGETDURATION:10", 3).unwrap();
        assert_eq!(parsed.tag, Tag::TargetDuration(10));
        assert_eq!(parsed.raw, "#EXT-X-TARGETDURATION:10");

        let parsed = parse_tag_line("#EXT-X-MEDIA-SEQUENCE: 42", 4).unwrap();
        assert_eq!(parsed.tag, Tag::MediaSequence(42));
    }

    #[test]
    fn non_numeric_value_tag_fails() {
        let err = parse_tag_line("#EXT-X-VERSION:three", 2).unwrap_err();
        assert_eq!(err.line(), Some(2));
    }

    #[test]
    fn extinf_with_and_without_title() {
        assert_eq!(
            parse_tag_line("#EXTINF:10.5,intro", 5).unwrap().tag,
            Tag::Inf {
                duration: 10.5,
                title: Some("intro".to_owned())
            }
        );
        assert_eq!(
            parse_tag_line("#EXTINF:9.009,", 5).unwrap().tag,
            Tag::Inf {
                duration: 9.009,
                title: None
            }
        );
    }

    #[test]
    fn key_requires_method() {
        let err = parse_tag_line("#EXT-X-KEY:URI=\"k.bin\"", 7).unwrap_err();
        assert!(matches!(err, ParseError::InvalidAttribute { .. }));

        let parsed = parse_tag_line(
            "#EXT-X-KEY:METHOD=AES-128,URI=\"https://k/key\",IV=0x0102",
            7,
        )
        .unwrap();
        let Tag::Key(key) = parsed.tag else {
            panic!("expected key tag");
        };
        assert_eq!(key.method, KeyMethod::Aes128);
        assert_eq!(key.uri.as_deref(), Some("https://k/key"));
        assert_eq!(key.iv.as_deref(), Some("0x0102"));
    }

    #[test]
    fn quoted_commas_do_not_split_attributes() {
        let parsed = parse_tag_line(
            "#EXT-X-STREAM-INF:BANDWIDTH=1280000,CODECS=\"avc1.4d401f,mp4a.40.2\",RESOLUTION=640x360",
            2,
        )
        .unwrap();
        let Tag::StreamInf(inf) = parsed.tag else {
            panic!("expected stream-inf tag");
        };
        assert_eq!(inf.bandwidth, 1_280_000);
        assert_eq!(inf.codecs.as_deref(), Some("avc1.4d401f,mp4a.40.2"));
        assert_eq!(inf.resolution, Some((640, 360)));
    }

    #[test]
    fn duplicate_attribute_keeps_first_value() {
        let attrs = parse_attribute_list("#EXT-X-KEY", "METHOD=AES-128,METHOD=NONE", 1).unwrap();
        assert_eq!(attrs.get("METHOD"), Some("AES-128"));
    }

    #[test]
    fn media_sequence_not_swallowed_by_media_prefix() {
        // EXT-X-MEDIA is a prefix of EXT-X-MEDIA-SEQUENCE; longest wins.
        let parsed = parse_tag_line("#EXT-X-MEDIA-SEQUENCE:7", 1).unwrap();
        assert_eq!(parsed.tag, Tag::MediaSequence(7));
    }

    #[test]
    fn unknown_ext_tag_is_preserved() {
        let parsed = parse_tag_line("#EXT-X-DISCONTINUITY", 9).unwrap();
        assert_eq!(
            parsed.tag,
            Tag::Unknown {
                name: "EXT-X-DISCONTINUITY".to_owned()
            }
        );
        assert_eq!(parsed.raw, "#EXT-X-DISCONTINUITY");
    }

    #[test]
    fn unterminated_quote_is_rejected() {
        let err = parse_tag_line("#EXT-X-KEY:METHOD=AES-128,URI=\"broken", 3).unwrap_err();
        assert!(matches!(err, ParseError::InvalidAttribute { .. }));
    }
}
