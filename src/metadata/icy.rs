//! ICY (SHOUTcast/Icecast) in-band metadata.
//!
//! A server that honours `Icy-MetaData: 1` announces `icy-metaint: N` and
//! then interleaves a metadata block after every N audio bytes. The block
//! starts with a length byte (× 16) followed by `key='value';` fields.

/// Largest possible metadata block (255 × 16).
pub const MAX_BLOCK_LEN: usize = 4080;

const STREAM_TITLE: &str = "StreamTitle";
const STREAM_TITLE_REPLAY: &str = "StreamTitleReplay";

/// Artist/title pair recovered from a stream title.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTitle {
    pub artist: String,
    pub title: String,
}

/// Parse one `key='value'` field. Keys are ASCII letters only and the value
/// may not contain a quote.
fn parse_field(field: &str) -> Option<(&str, &str)> {
    let (key, rest) = field.split_once('=')?;
    if key.is_empty() || !key.bytes().all(|b| b.is_ascii_alphabetic()) {
        return None;
    }
    let value = rest.strip_prefix('\'')?.strip_suffix('\'')?;
    if value.contains('\'') {
        return None;
    }
    Some((key, value))
}

/// Extract the stream title from a metadata block.
///
/// Uses `StreamTitle`, falling back to `StreamTitleReplay`; blank values
/// count as absent.
pub fn parse_block(block: &str) -> Option<String> {
    let mut title = None;
    let mut replay = None;
    for (key, value) in block.split(';').filter_map(parse_field) {
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        match key {
            STREAM_TITLE => title = title.or(Some(value)),
            STREAM_TITLE_REPLAY => replay = replay.or(Some(value)),
            _ => {}
        }
    }
    title.or(replay).map(str::to_string)
}

/// Split `Artist - Title` on the first hyphen.
///
/// Without a hyphen the whole value is taken as the artist and the title is
/// empty. Titles containing their own hyphen are split too early; this
/// matches what listeners have seen historically.
pub fn split_title(value: &str) -> StreamTitle {
    match value.split_once('-') {
        Some((artist, title)) => StreamTitle {
            artist: artist.trim().to_string(),
            title: title.trim().to_string(),
        },
        None => StreamTitle {
            artist: value.trim().to_string(),
            title: String::new(),
        },
    }
}

#[derive(Debug)]
enum ReadState {
    Audio { remaining: usize },
    Length,
    Block { len: usize },
    Done,
}

/// Incremental reader for the first metadata block of a stream.
///
/// Feed response body chunks until [`IcyBlockReader::feed`] returns the
/// block text. NUL padding is stripped.
#[derive(Debug)]
pub struct IcyBlockReader {
    state: ReadState,
    block: Vec<u8>,
}

impl IcyBlockReader {
    /// `metaint` is the announced audio byte count between blocks.
    pub fn new(metaint: usize) -> Self {
        Self {
            state: ReadState::Audio { remaining: metaint },
            block: Vec::new(),
        }
    }

    /// Consume a chunk. Returns the first complete block, once.
    pub fn feed(&mut self, mut data: &[u8]) -> Option<String> {
        while !data.is_empty() {
            match self.state {
                ReadState::Audio { remaining } => {
                    let skip = remaining.min(data.len());
                    data = &data[skip..];
                    self.state = if remaining == skip {
                        ReadState::Length
                    } else {
                        ReadState::Audio { remaining: remaining - skip }
                    };
                }
                ReadState::Length => {
                    let len = data[0] as usize * 16;
                    data = &data[1..];
                    if len == 0 {
                        self.state = ReadState::Done;
                        return Some(String::new());
                    }
                    self.state = ReadState::Block { len };
                }
                ReadState::Block { len } => {
                    let take = (len - self.block.len()).min(data.len());
                    self.block.extend_from_slice(&data[..take]);
                    data = &data[take..];
                    if self.block.len() == len {
                        self.state = ReadState::Done;
                        return Some(self.finish());
                    }
                }
                ReadState::Done => return None,
            }
        }
        None
    }

    /// True once the block has been returned.
    pub fn is_done(&self) -> bool {
        matches!(self.state, ReadState::Done)
    }

    fn finish(&mut self) -> String {
        let bytes: Vec<u8> = self.block.drain(..).filter(|b| *b != 0).collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn stream(metaint: usize, block: &str) -> Vec<u8> {
        let mut data = vec![0xAAu8; metaint];
        let padded_len = block.len().div_ceil(16) * 16;
        data.push((padded_len / 16) as u8);
        data.extend_from_slice(block.as_bytes());
        data.resize(metaint + 1 + padded_len, 0);
        data.extend_from_slice(&[0xBB; 64]);
        data
    }

    #[test]
    fn test_parse_stream_title() {
        let block = "StreamTitle='Daft Punk - Around the World';StreamUrl='';";
        assert_eq!(parse_block(block).as_deref(), Some("Daft Punk - Around the World"));
    }

    #[test]
    fn test_replay_fallback() {
        assert_eq!(
            parse_block("StreamTitle='';StreamTitleReplay='Air - La Femme';").as_deref(),
            Some("Air - La Femme")
        );
        assert_eq!(parse_block("StreamUrl='http://x';"), None);
        assert_eq!(parse_block(""), None);
    }

    #[test]
    fn test_malformed_fields_are_skipped() {
        assert_eq!(parse_block("Stream Title='x';"), None);
        assert_eq!(parse_block("StreamTitle=x;"), None);
        assert_eq!(parse_block("StreamTitle='it's';"), None);
        assert_eq!(parse_block("StreamTitle2='x';"), None);
    }

    #[test]
    fn test_split_on_first_hyphen() {
        assert_eq!(
            split_title("Daft Punk - Around the World"),
            StreamTitle {
                artist: "Daft Punk".into(),
                title: "Around the World".into()
            }
        );
    }

    #[test]
    fn test_split_without_hyphen() {
        assert_eq!(
            split_title("Station Jingle"),
            StreamTitle {
                artist: "Station Jingle".into(),
                title: String::new()
            }
        );
    }

    #[test]
    fn test_split_hyphenated_artist_is_lossy() {
        // Known limitation: the first hyphen wins
        let parsed = split_title("Jay-Z - Empire State of Mind");
        assert_eq!(parsed.artist, "Jay");
        assert_eq!(parsed.title, "Z - Empire State of Mind");
    }

    #[test]
    fn test_reader_single_chunk() {
        let data = stream(32, "StreamTitle='A - B';");
        let mut reader = IcyBlockReader::new(32);
        assert_eq!(reader.feed(&data).as_deref(), Some("StreamTitle='A - B';"));
        assert!(reader.is_done());
        assert_eq!(reader.feed(&data), None);
    }

    #[test]
    fn test_reader_zero_length_block() {
        let mut data = vec![0u8; 8];
        data.push(0);
        let mut reader = IcyBlockReader::new(8);
        assert_eq!(reader.feed(&data).as_deref(), Some(""));
    }

    proptest! {
        #[test]
        fn prop_reader_handles_any_chunking(metaint in 1usize..200, split in 1usize..64) {
            let block = "StreamTitle='Artist - Title';";
            let data = stream(metaint, block);
            let mut reader = IcyBlockReader::new(metaint);
            let mut found = None;
            for chunk in data.chunks(split) {
                if let Some(b) = reader.feed(chunk) {
                    found = Some(b);
                    break;
                }
            }
            prop_assert_eq!(found.as_deref(), Some(block));
        }
    }
}
