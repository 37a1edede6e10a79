//! C3 — a restartable pull-parser over a USTAR tar byte-stream
//! (spec.md §4.3). Consumes chunks of arbitrary size (including single
//! bytes) and emits header/data events without ever buffering an entire
//! file.

use bytes::BytesMut;

use crate::error::AgentError;

const BLOCK_SIZE: usize = 512;

/// One step of parsing: how many bytes of the input chunk were
/// consumed, and what (if anything) the caller should do about it.
#[derive(Debug)]
pub struct TarStep<'a> {
    pub consumed: usize,
    pub event: TarEvent<'a>,
}

#[derive(Debug)]
pub enum TarEvent<'a> {
    /// Input was consumed (maybe zero bytes, maybe all of it), but no
    /// header or data is available yet.
    NeedMoreInput,
    /// A file header was parsed. `size` is the inner file's declared
    /// byte length.
    Header { name: String, size: u64 },
    /// A zero-copy slice of the current file's payload.
    Data { data: &'a [u8] },
    /// Two consecutive zero-filled blocks (or, per spec.md, the first
    /// observed zero-filled block) — no more files follow. Any trailing
    /// bytes after this are slack and are ignored.
    EndOfArchive,
    Error(AgentError),
}

enum Phase {
    Header { partial: BytesMut },
    File {
        remaining: u64,
        padding_remaining: u64,
    },
    Done,
    Errored,
}

/// The restartable pull-parser itself. At most one buffered partial
/// header (512 bytes) is ever held; file payload bytes are never
/// copied, only sliced from the caller's chunk.
pub struct TarParser {
    phase: Phase,
}

impl Default for TarParser {
    fn default() -> Self {
        Self::new()
    }
}

impl TarParser {
    pub fn new() -> Self {
        Self {
            phase: Phase::Header {
                partial: BytesMut::with_capacity(BLOCK_SIZE),
            },
        }
    }

    /// Feed an arbitrarily sized chunk. Returns how many leading bytes
    /// of `input` were consumed and the resulting event. Call again
    /// with the remainder of `input` (or a fresh chunk) until the
    /// stream is exhausted.
    pub fn feed<'a>(&mut self, input: &'a [u8]) -> TarStep<'a> {
        match &mut self.phase {
            Phase::Done => TarStep {
                consumed: input.len(),
                event: TarEvent::NeedMoreInput,
            },
            Phase::Errored => TarStep {
                consumed: input.len(),
                event: TarEvent::NeedMoreInput,
            },
            Phase::Header { partial } => {
                let need = BLOCK_SIZE - partial.len();
                let take = need.min(input.len());
                partial.extend_from_slice(&input[..take]);
                if partial.len() < BLOCK_SIZE {
                    return TarStep {
                        consumed: take,
                        event: TarEvent::NeedMoreInput,
                    };
                }
                let block = std::mem::replace(partial, BytesMut::with_capacity(BLOCK_SIZE));
                TarStep {
                    consumed: take,
                    event: self.finish_header_block(&block),
                }
            }
            Phase::File {
                remaining,
                padding_remaining,
            } => {
                if *remaining > 0 {
                    let take = (*remaining as usize).min(input.len());
                    *remaining -= take as u64;
                    let finished = *remaining == 0;
                    let padding_done = *padding_remaining == 0;
                    if finished && padding_done {
                        self.phase = Phase::Header {
                            partial: BytesMut::with_capacity(BLOCK_SIZE),
                        };
                    }
                    TarStep {
                        consumed: take,
                        event: TarEvent::Data {
                            data: &input[..take],
                        },
                    }
                } else if *padding_remaining > 0 {
                    let take = (*padding_remaining as usize).min(input.len());
                    *padding_remaining -= take as u64;
                    if *padding_remaining == 0 {
                        self.phase = Phase::Header {
                            partial: BytesMut::with_capacity(BLOCK_SIZE),
                        };
                    }
                    TarStep {
                        consumed: take,
                        event: TarEvent::NeedMoreInput,
                    }
                } else {
                    // A zero-size file transitions straight back to
                    // Header in finish_header_block, so this phase is
                    // never entered with nothing left to do.
                    unreachable!("File phase always has remaining or padding bytes left")
                }
            }
        }
    }

    fn finish_header_block(&mut self, block: &[u8]) -> TarEvent<'static> {
        if block.iter().all(|&b| b == 0) {
            self.phase = Phase::Done;
            return TarEvent::EndOfArchive;
        }

        if !checksum_valid(block) {
            self.phase = Phase::Errored;
            return TarEvent::Error(AgentError::Malformed(
                "tar header checksum mismatch".into(),
            ));
        }

        let name = match parse_name(block) {
            Some(n) => n,
            None => {
                self.phase = Phase::Errored;
                return TarEvent::Error(AgentError::Malformed(
                    "tar header name is not valid UTF-8".into(),
                ));
            }
        };

        let size = match parse_octal(&block[124..136]) {
            Some(s) => s,
            None => {
                self.phase = Phase::Errored;
                return TarEvent::Error(AgentError::Malformed(
                    "tar header size field is malformed".into(),
                ));
            }
        };

        let padding = (BLOCK_SIZE as u64 - (size % BLOCK_SIZE as u64)) % BLOCK_SIZE as u64;

        self.phase = if size == 0 {
            // Edge case (spec.md §4.3): a zero-size file's header event
            // is immediately followed by the transition back to
            // PARSING_HEADER.
            Phase::Header {
                partial: BytesMut::with_capacity(BLOCK_SIZE),
            }
        } else {
            Phase::File {
                remaining: size,
                padding_remaining: padding,
            }
        };

        TarEvent::Header { name, size }
    }
}

fn checksum_valid(block: &[u8]) -> bool {
    let recorded = match parse_octal(&block[148..156]) {
        Some(v) => v,
        None => return false,
    };
    let mut sum: u64 = 0;
    for (i, &byte) in block.iter().enumerate() {
        if (148..156).contains(&i) {
            sum += 0x20; // chksum field counts as spaces
        } else {
            sum += byte as u64;
        }
    }
    sum == recorded
}

fn parse_octal(field: &[u8]) -> Option<u64> {
    let text: Vec<u8> = field
        .iter()
        .copied()
        .take_while(|&b| b != 0)
        .filter(|&b| b != b' ')
        .collect();
    if text.is_empty() {
        return Some(0);
    }
    let s = std::str::from_utf8(&text).ok()?;
    u64::from_str_radix(s, 8).ok()
}

fn parse_name(block: &[u8]) -> Option<String> {
    let name = cstr_field(&block[0..100])?;
    let prefix = cstr_field(&block[345..500])?;
    if prefix.is_empty() {
        Some(name)
    } else {
        Some(format!("{}/{}", prefix, name))
    }
}

fn cstr_field(field: &[u8]) -> Option<String> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    std::str::from_utf8(&field[..end]).ok().map(str::to_owned)
}


#[cfg(test)]
mod tests {
    use super::test_support::build_tar;
    use super::*;

    fn drain_all(parser: &mut TarParser, mut input: &[u8]) -> Vec<(String, Vec<u8>)> {
        let mut files: Vec<(String, Vec<u8>)> = Vec::new();
        let mut current: Option<(String, Vec<u8>)> = None;
        loop {
            if input.is_empty() {
                break;
            }
            let step = parser.feed(input);
            match step.event {
                TarEvent::NeedMoreInput => {}
                TarEvent::Header { name, size } => {
                    if let Some(done) = current.take() {
                        files.push(done);
                    }
                    current = Some((name, Vec::with_capacity(size as usize)));
                }
                TarEvent::Data { data } => {
                    current.as_mut().unwrap().1.extend_from_slice(data);
                }
                TarEvent::EndOfArchive => {
                    if let Some(done) = current.take() {
                        files.push(done);
                    }
                }
                TarEvent::Error(e) => panic!("unexpected parse error: {e}"),
            }
            input = &input[step.consumed..];
        }
        files
    }

    #[test]
    fn single_chunk_parses_one_file() {
        let archive = build_tar(&[("hello.txt", b"hi there")]);
        let mut parser = TarParser::new();
        let files = drain_all(&mut parser, &archive);
        assert_eq!(files, vec![("hello.txt".to_string(), b"hi there".to_vec())]);
    }

    #[test]
    fn zero_size_file_emits_header_then_returns_to_header_phase() {
        let archive = build_tar(&[("empty", b""), ("next", b"x")]);
        let mut parser = TarParser::new();
        let files = drain_all(&mut parser, &archive);
        assert_eq!(
            files,
            vec![
                ("empty".to_string(), Vec::new()),
                ("next".to_string(), b"x".to_vec())
            ]
        );
    }

    #[test]
    fn chunking_invariance_byte_at_a_time() {
        let archive = build_tar(&[("a", b"0123456789"), ("b", &[7u8; 600])]);

        let mut whole_parser = TarParser::new();
        let whole = drain_all(&mut whole_parser, &archive);

        let mut byte_parser = TarParser::new();
        let mut files: Vec<(String, Vec<u8>)> = Vec::new();
        let mut current: Option<(String, Vec<u8>)> = None;
        let mut i = 0;
        while i < archive.len() {
            let step = byte_parser.feed(&archive[i..i + 1]);
            match step.event {
                TarEvent::Header { name, size } => {
                    if let Some(done) = current.take() {
                        files.push(done);
                    }
                    current = Some((name, Vec::with_capacity(size as usize)));
                }
                TarEvent::Data { data } => current.as_mut().unwrap().1.extend_from_slice(data),
                TarEvent::EndOfArchive => {
                    if let Some(done) = current.take() {
                        files.push(done);
                    }
                }
                TarEvent::NeedMoreInput => {}
                TarEvent::Error(e) => panic!("unexpected parse error: {e}"),
            }
            i += step.consumed.max(1);
        }

        assert_eq!(whole, files);
    }

    #[test]
    fn corrupted_checksum_is_malformed() {
        let mut archive = build_tar(&[("a", b"data")]);
        archive[50] ^= 0xFF; // flip a byte inside the name field's tail, header-only
        let mut parser = TarParser::new();
        let step = parser.feed(&archive);
        assert!(matches!(step.event, TarEvent::Error(AgentError::Malformed(_))));
    }

    proptest::proptest! {
        #[test]
        fn arbitrary_chunking_matches_single_chunk(
            chunk_sizes in proptest::collection::vec(1usize..37, 1..200)
        ) {
            let archive = build_tar(&[("one", b"hello world"), ("two", &[42u8; 300]), ("three", b"")]);

            let mut whole_parser = TarParser::new();
            let whole = drain_all(&mut whole_parser, &archive);

            let mut chunked_parser = TarParser::new();
            let mut files: Vec<(String, Vec<u8>)> = Vec::new();
            let mut current: Option<(String, Vec<u8>)> = None;
            let mut pos = 0usize;
            let mut size_idx = 0usize;
            while pos < archive.len() {
                let size = chunk_sizes[size_idx % chunk_sizes.len()];
                size_idx += 1;
                let end = (pos + size).min(archive.len());
                let mut chunk = &archive[pos..end];
                while !chunk.is_empty() {
                    let step = chunked_parser.feed(chunk);
                    match step.event {
                        TarEvent::Header { name, size } => {
                            if let Some(done) = current.take() { files.push(done); }
                            current = Some((name, Vec::with_capacity(size as usize)));
                        }
                        TarEvent::Data { data } => current.as_mut().unwrap().1.extend_from_slice(data),
                        TarEvent::EndOfArchive => { if let Some(done) = current.take() { files.push(done); } }
                        TarEvent::NeedMoreInput => {}
                        TarEvent::Error(e) => panic!("unexpected parse error: {e}"),
                    }
                    chunk = &chunk[step.consumed..];
                }
                pos = end;
            }

            proptest::prop_assert_eq!(whole, files);
        }
    }
}
