/// Payload framing for characteristic-sized writes
///
/// A payload is cut into consecutive bodies of at most `max_body_size`
/// characters. Each frame is sent as ASCII text `"<index>/<body>"`; the final
/// frame carries the end-of-message marker, `"<index>/<body>/EOM"`. There is no
/// length prefix and no checksum: the delimiters are the whole framing.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Default frame body size, in characters
pub const DEFAULT_MAX_BODY_SIZE: usize = 256;

/// End-of-message token appended to the final frame
pub const EOM_MARKER: &str = "EOM";

const SEPARATOR: char = '/';

/// Errors for framing and reassembly
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame body size must be positive")]
    InvalidBodySize,
    #[error("Frame is not valid UTF-8")]
    InvalidEncoding,
    #[error("Malformed frame: {0}")]
    Malformed(String),
    #[error("Frame out of order: expected index {expected}, got {got}")]
    OutOfOrder { expected: usize, got: usize },
    #[error("Frame {0} received after end of message")]
    AlreadyComplete(usize),
}

/// One ordered fragment of a payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub index: usize,
    pub body: String,
    pub is_last: bool,
}

impl Frame {
    /// Wire form of this frame
    pub fn encode(&self) -> String {
        if self.is_last {
            format!("{}{}{}{}{}", self.index, SEPARATOR, self.body, SEPARATOR, EOM_MARKER)
        } else {
            format!("{}{}{}", self.index, SEPARATOR, self.body)
        }
    }

    /// Encoded length in bytes
    pub fn wire_len(&self) -> usize {
        let index_len = self.index.to_string().len();
        let marker_len = if self.is_last { 1 + EOM_MARKER.len() } else { 0 };
        index_len + 1 + self.body.len() + marker_len
    }

    /// Parse a frame from its wire form.
    ///
    /// A body that itself ends in `/EOM` is indistinguishable from a final
    /// frame; the marker always wins.
    pub fn decode(wire: &[u8]) -> Result<Self, FrameError> {
        let text = std::str::from_utf8(wire).map_err(|_| FrameError::InvalidEncoding)?;
        let (index, rest) = text
            .split_once(SEPARATOR)
            .ok_or_else(|| FrameError::Malformed("missing index separator".to_string()))?;

        if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
            return Err(FrameError::Malformed(format!("invalid index {:?}", index)));
        }
        let index = index
            .parse::<usize>()
            .map_err(|_| FrameError::Malformed(format!("index {:?} out of range", index)))?;

        let terminal = format!("{}{}", SEPARATOR, EOM_MARKER);
        let (body, is_last) = match rest.strip_suffix(terminal.as_str()) {
            Some(body) => (body, true),
            None => (rest, false),
        };

        Ok(Self {
            index,
            body: body.to_string(),
            is_last,
        })
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// Split `payload` into ordered frames of at most `max_body_size` characters.
///
/// Always yields at least one frame: an empty payload becomes a single
/// empty-body final frame so the end-of-message marker is still sent.
pub fn frame(payload: &str, max_body_size: usize) -> Result<Vec<Frame>, FrameError> {
    if max_body_size == 0 {
        return Err(FrameError::InvalidBodySize);
    }

    let mut bodies = Vec::new();
    let mut start = 0;
    let mut count = 0;
    for (offset, _) in payload.char_indices() {
        if count == max_body_size {
            bodies.push(&payload[start..offset]);
            start = offset;
            count = 0;
        }
        count += 1;
    }
    if count > 0 || bodies.is_empty() {
        bodies.push(&payload[start..]);
    }

    let last = bodies.len() - 1;
    Ok(bodies
        .into_iter()
        .enumerate()
        .map(|(index, body)| Frame {
            index,
            body: body.to_string(),
            is_last: index == last,
        })
        .collect())
}

/// Largest encoded frame in bytes, with its index
pub fn largest_frame(frames: &[Frame]) -> Option<(usize, usize)> {
    frames
        .iter()
        .map(|f| (f.index, f.wire_len()))
        .max_by_key(|(_, len)| *len)
}

/// Progress of a [`FrameAssembler`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssemblyProgress {
    /// More frames are expected
    Partial { received: usize },
    /// End of message seen; the reassembled payload
    Complete(String),
}

/// Receiver-side reassembly of a framed payload.
///
/// Frames must arrive with contiguous indices starting at 0. A frame repeating
/// the previous index is treated as a retransmission and ignored.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    next_index: usize,
    buffer: String,
    complete: bool,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of frames accepted so far
    pub fn received(&self) -> usize {
        self.next_index
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Accept one wire frame
    pub fn push(&mut self, wire: &[u8]) -> Result<AssemblyProgress, FrameError> {
        let frame = Frame::decode(wire)?;

        if self.complete {
            return Err(FrameError::AlreadyComplete(frame.index));
        }
        if self.next_index > 0 && frame.index == self.next_index - 1 {
            return Ok(AssemblyProgress::Partial {
                received: self.next_index,
            });
        }
        if frame.index != self.next_index {
            return Err(FrameError::OutOfOrder {
                expected: self.next_index,
                got: frame.index,
            });
        }

        self.buffer.push_str(&frame.body);
        self.next_index += 1;

        if frame.is_last {
            self.complete = true;
            return Ok(AssemblyProgress::Complete(self.buffer.clone()));
        }
        Ok(AssemblyProgress::Partial {
            received: self.next_index,
        })
    }

    /// Forget everything and wait for a new message
    pub fn reset(&mut self) {
        self.next_index = 0;
        self.buffer.clear();
        self.complete = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn reassemble(frames: &[Frame]) -> String {
        frames.iter().map(|f| f.body.as_str()).collect()
    }

    #[test]
    fn test_three_hundred_chars_at_256() {
        let payload = "A".repeat(300);
        let frames = frame(&payload, 256).expect("Framing");

        let wire: Vec<String> = frames.iter().map(Frame::encode).collect();
        assert_eq!(
            wire,
            vec![
                format!("0/{}", "A".repeat(256)),
                format!("1/{}/EOM", "A".repeat(44)),
            ]
        );
    }

    #[test]
    fn test_empty_payload_single_terminal_frame() {
        let frames = frame("", 256).expect("Framing");

        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_last);
        assert_eq!(frames[0].encode(), "0//EOM");
    }

    #[test]
    fn test_exact_multiple_has_no_empty_trailer() {
        let frames = frame(&"B".repeat(512), 256).expect("Framing");

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].body.len(), 256);
        assert!(frames[1].is_last);
    }

    #[test]
    fn test_zero_body_size_rejected() {
        assert_eq!(frame("abc", 0), Err(FrameError::InvalidBodySize));
    }

    #[test]
    fn test_counts_characters_not_bytes() {
        let frames = frame("한양대학교", 2).expect("Framing");

        let bodies: Vec<&str> = frames.iter().map(|f| f.body.as_str()).collect();
        assert_eq!(bodies, vec!["한양", "대학", "교"]);
        assert_eq!(frames[0].wire_len(), frames[0].encode().len());
        assert_eq!(frames[2].wire_len(), frames[2].encode().len());
    }

    #[test]
    fn test_largest_frame() {
        let frames = frame(&"C".repeat(300), 256).expect("Framing");
        assert_eq!(largest_frame(&frames), Some((0, 258)));
        assert_eq!(largest_frame(&[]), None);
    }

    #[test]
    fn test_decode_keeps_slashes_in_body() {
        let frame = Frame::decode(b"3/did:waff:W6hLpTWEbsUW/0Hs6").expect("Decode");
        assert_eq!(frame.index, 3);
        assert_eq!(frame.body, "did:waff:W6hLpTWEbsUW/0Hs6");
        assert!(!frame.is_last);

        let last = Frame::decode(b"4/x/y/EOM").expect("Decode");
        assert_eq!(last.body, "x/y");
        assert!(last.is_last);
    }

    #[test]
    fn test_decode_rejects_bad_index() {
        assert!(matches!(Frame::decode(b"abc"), Err(FrameError::Malformed(_))));
        assert!(matches!(Frame::decode(b"/body"), Err(FrameError::Malformed(_))));
        assert!(matches!(Frame::decode(b"+1/body"), Err(FrameError::Malformed(_))));
        assert_eq!(Frame::decode(&[0xff, b'/']), Err(FrameError::InvalidEncoding));
    }

    #[test]
    fn test_assembler_roundtrip() {
        let payload = r#"{"presentation":{"id":"did:waff:W6hLpTWEbsUW/0Hs6NglWF3g"}}"#;
        let frames = frame(payload, 16).expect("Framing");
        let mut assembler = FrameAssembler::new();

        let mut result = None;
        for f in &frames {
            match assembler.push(f.encode().as_bytes()).expect("Push") {
                AssemblyProgress::Partial { received } => assert_eq!(received, f.index + 1),
                AssemblyProgress::Complete(text) => result = Some(text),
            }
        }

        assert_eq!(result.as_deref(), Some(payload));
        assert!(assembler.is_complete());
    }

    #[test]
    fn test_assembler_rejects_gap() {
        let mut assembler = FrameAssembler::new();
        assembler.push(b"0/ab").expect("First frame");

        let result = assembler.push(b"2/cd/EOM");
        assert_eq!(result, Err(FrameError::OutOfOrder { expected: 1, got: 2 }));
    }

    #[test]
    fn test_assembler_ignores_repeat_of_previous_frame() {
        let mut assembler = FrameAssembler::new();
        assembler.push(b"0/ab").expect("First frame");

        let repeat = assembler.push(b"0/ab").expect("Repeat");
        assert_eq!(repeat, AssemblyProgress::Partial { received: 1 });

        let done = assembler.push(b"1/cd/EOM").expect("Last frame");
        assert_eq!(done, AssemblyProgress::Complete("abcd".to_string()));
    }

    #[test]
    fn test_assembler_after_completion() {
        let mut assembler = FrameAssembler::new();
        assembler.push(b"0//EOM").expect("Only frame");

        assert_eq!(assembler.push(b"1/x"), Err(FrameError::AlreadyComplete(1)));

        assembler.reset();
        assert_eq!(assembler.received(), 0);
        assert!(!assembler.is_complete());
    }

    proptest! {
        #[test]
        fn prop_bodies_reassemble_payload(payload in ".{0,600}", max_body in 1usize..300) {
            let frames = frame(&payload, max_body).expect("Framing");
            prop_assert_eq!(reassemble(&frames), payload);
        }

        #[test]
        fn prop_exactly_one_terminal_frame(payload in ".{0,600}", max_body in 1usize..300) {
            let frames = frame(&payload, max_body).expect("Framing");
            let terminal: Vec<usize> = frames.iter().filter(|f| f.is_last).map(|f| f.index).collect();
            prop_assert_eq!(terminal, vec![frames.len() - 1]);
        }

        #[test]
        fn prop_indices_contiguous_and_bodies_bounded(payload in ".{0,600}", max_body in 1usize..300) {
            let frames = frame(&payload, max_body).expect("Framing");
            for (i, f) in frames.iter().enumerate() {
                prop_assert_eq!(f.index, i);
                prop_assert!(f.body.chars().count() <= max_body);
                prop_assert_eq!(f.wire_len(), f.encode().len());
            }
        }
    }
}
