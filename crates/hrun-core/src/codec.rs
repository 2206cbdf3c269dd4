//! Splitting resize control lines out of the terminal data stream.
//!
//! After the handshake line, a connection carries raw terminal bytes with
//! `resize:<width>:<height>\n` lines spliced in at arbitrary offsets. The
//! [`StreamDecoder`] is the single cursor over that stream: every byte is
//! classified exactly once, so a control line can never leak into the PTY and
//! a data byte can never be swallowed by the control path.
//!
//! Only bytes that could still be part of a control line are held back.
//! Everything else is returned from the same [`StreamDecoder::feed`] call it
//! arrived in. Held bytes are released by [`StreamDecoder::flush`] once the
//! stream goes idle, so a lone keystroke such as `r` is never stranded.

use crate::error::SessionError;
use crate::protocol::{ResizeNotification, RESIZE_PREFIX};

/// Longest body (the part after `resize:`) accepted before giving up on a
/// control line and releasing the held bytes as data.
pub const MAX_CONTROL_LINE: usize = 32;

/// One classified piece of the inbound stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Opaque terminal bytes for the PTY.
    Data(Vec<u8>),
    /// A well-formed resize line.
    Resize(ResizeNotification),
    /// A `resize:` line with a body that did not parse. Never forwarded.
    MalformedResize(String),
}

/// Incremental classifier for the post-handshake byte stream.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    /// Bytes that may belong to a control line: a partial `resize:` marker,
    /// or the full marker followed by a body still waiting for `\n`.
    held: Vec<u8>,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bytes currently held back.
    pub fn pending(&self) -> usize {
        self.held.len()
    }

    /// Release everything held back as data.
    ///
    /// Control lines are written whole by the sender, so a partial one still
    /// held when the stream is idle was ordinary input.
    pub fn flush(&mut self) -> Vec<Frame> {
        if self.held.is_empty() {
            return Vec::new();
        }
        vec![Frame::Data(std::mem::take(&mut self.held))]
    }

    /// Classify a chunk of input. Frames are returned in wire order.
    pub fn feed(&mut self, input: &[u8]) -> Vec<Frame> {
        let mut out = FrameSink::default();
        for &byte in input {
            self.push(byte, &mut out);
        }
        out.finish()
    }

    fn push(&mut self, byte: u8, out: &mut FrameSink) {
        let marker_len = RESIZE_PREFIX.len();

        if self.held.len() < marker_len {
            if byte == RESIZE_PREFIX[self.held.len()] {
                self.held.push(byte);
                return;
            }
            // The marker never repeats its first byte, so the held bytes
            // cannot start another candidate. Only `byte` itself can.
            out.data.append(&mut self.held);
            if byte == RESIZE_PREFIX[0] {
                self.held.push(byte);
            } else {
                out.data.push(byte);
            }
            return;
        }

        if byte == b'\n' {
            let body = &self.held[marker_len..];
            let frame = match ResizeNotification::parse_body(body) {
                Ok(resize) => Frame::Resize(resize),
                Err(SessionError::MalformedResize(line)) => Frame::MalformedResize(line),
                Err(e) => Frame::MalformedResize(e.to_string()),
            };
            self.held.clear();
            out.control(frame);
            return;
        }

        self.held.push(byte);
        if self.held.len() - marker_len > MAX_CONTROL_LINE {
            // Not a control line after all. The leading 'r' is data; the
            // rest is rescanned since it may hold the start of a real marker.
            let rest = self.held.split_off(1);
            out.data.append(&mut self.held);
            for byte in rest {
                self.push(byte, out);
            }
        }
    }
}

/// Accumulates output of one `feed` call, coalescing adjacent data bytes.
#[derive(Default)]
struct FrameSink {
    frames: Vec<Frame>,
    data: Vec<u8>,
}

impl FrameSink {
    fn control(&mut self, frame: Frame) {
        self.flush_data();
        self.frames.push(frame);
    }

    fn flush_data(&mut self) {
        if !self.data.is_empty() {
            self.frames.push(Frame::Data(std::mem::take(&mut self.data)));
        }
    }

    fn finish(mut self) -> Vec<Frame> {
        self.flush_data();
        self.frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(bytes: &[u8]) -> Frame {
        Frame::Data(bytes.to_vec())
    }

    fn resize(width: u16, height: u16) -> Frame {
        Frame::Resize(ResizeNotification::new(width, height))
    }

    /// Feed input one byte at a time and merge adjacent data frames.
    fn feed_bytewise(decoder: &mut StreamDecoder, input: &[u8]) -> Vec<Frame> {
        let mut merged: Vec<Frame> = Vec::new();
        for &b in input {
            for frame in decoder.feed(&[b]) {
                match (merged.last_mut(), frame) {
                    (Some(Frame::Data(prev)), Frame::Data(next)) => prev.extend(next),
                    (_, frame) => merged.push(frame),
                }
            }
        }
        merged
    }

    #[test]
    fn test_plain_data_passes_through_immediately() {
        let mut decoder = StreamDecoder::new();
        assert_eq!(decoder.feed(b"ls -la\r"), vec![data(b"ls -la\r")]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_resize_line_alone() {
        let mut decoder = StreamDecoder::new();
        assert_eq!(decoder.feed(b"resize:120:40\n"), vec![resize(120, 40)]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_resize_in_the_middle_of_data() {
        let mut decoder = StreamDecoder::new();
        let frames = decoder.feed(b"echo hiresize:100:30\nthere\r");
        assert_eq!(
            frames,
            vec![data(b"echo hi"), resize(100, 30), data(b"there\r")]
        );
    }

    #[test]
    fn test_resize_at_every_offset() {
        let payload = b"abc\rdef\x1b[A";
        for offset in 0..=payload.len() {
            let mut stream = payload[..offset].to_vec();
            stream.extend_from_slice(b"resize:132:43\n");
            stream.extend_from_slice(&payload[offset..]);

            let mut decoder = StreamDecoder::new();
            let frames = feed_bytewise(&mut decoder, &stream);

            let forwarded: Vec<u8> = frames
                .iter()
                .filter_map(|f| match f {
                    Frame::Data(d) => Some(d.clone()),
                    _ => None,
                })
                .flatten()
                .collect();
            assert_eq!(forwarded, payload.to_vec(), "offset {}", offset);
            assert!(frames.contains(&resize(132, 43)), "offset {}", offset);
        }
    }

    #[test]
    fn test_resize_split_across_reads() {
        let mut decoder = StreamDecoder::new();
        assert_eq!(decoder.feed(b"xyres"), vec![data(b"xy")]);
        assert_eq!(decoder.pending(), 3);
        assert!(decoder.feed(b"ize:80:").is_empty());
        assert_eq!(decoder.feed(b"24\nz"), vec![resize(80, 24), data(b"z")]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_flush_releases_lone_r() {
        let mut decoder = StreamDecoder::new();
        assert!(decoder.feed(b"r").is_empty());
        assert_eq!(decoder.pending(), 1);

        assert_eq!(decoder.flush(), vec![data(b"r")]);
        assert_eq!(decoder.pending(), 0);
        assert!(decoder.flush().is_empty());

        // The decoder starts clean after a flush.
        assert_eq!(decoder.feed(b"resize:80:24
"), vec![resize(80, 24)]);
    }

    #[test]
    fn test_flush_releases_incomplete_control_line() {
        let mut decoder = StreamDecoder::new();
        assert_eq!(decoder.feed(b"xresize:12"), vec![data(b"x")]);
        assert_eq!(decoder.flush(), vec![data(b"resize:12")]);
        assert_eq!(decoder.feed(b"0:40\n"), vec![data(b"0:40\n")]);
    }

    #[test]
    fn test_near_miss_marker_is_released_as_data() {
        let mut decoder = StreamDecoder::new();
        assert!(decoder.feed(b"resi").is_empty());
        assert_eq!(decoder.feed(b"dent"), vec![data(b"resident")]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_near_miss_followed_by_real_marker() {
        let mut decoder = StreamDecoder::new();
        let frames = decoder.feed(b"resresize:10:20\n");
        assert_eq!(frames, vec![data(b"res"), resize(10, 20)]);
    }

    #[test]
    fn test_malformed_resize_is_dropped() {
        let mut decoder = StreamDecoder::new();
        let frames = decoder.feed(b"aresize:wide:40\nb");
        assert_eq!(
            frames,
            vec![
                data(b"a"),
                Frame::MalformedResize("resize:wide:40".into()),
                data(b"b"),
            ]
        );
    }

    #[test]
    fn test_wrong_field_count_is_malformed() {
        let mut decoder = StreamDecoder::new();
        let frames = decoder.feed(b"resize:80\nresize:1:2:3\n");
        assert!(matches!(frames[0], Frame::MalformedResize(_)));
        assert!(matches!(frames[1], Frame::MalformedResize(_)));
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn test_overlong_body_is_released_as_data() {
        let mut decoder = StreamDecoder::new();
        let mut input = b"resize:".to_vec();
        input.extend(std::iter::repeat(b'x').take(MAX_CONTROL_LINE + 1));

        let frames = decoder.feed(&input);
        assert_eq!(frames, vec![data(&input)]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_overlong_body_rescans_for_marker() {
        let mut decoder = StreamDecoder::new();
        let mut input = b"resize:".to_vec();
        let filler = vec![b'.'; MAX_CONTROL_LINE - 5];
        input.extend_from_slice(&filler);
        input.extend_from_slice(b"resize:7:9\n");

        // The first marker's body runs past the limit, so it is data; the
        // second marker inside it must still be recognised.
        let frames = decoder.feed(&input);
        let mut expected_data = b"resize:".to_vec();
        expected_data.extend_from_slice(&filler);
        assert_eq!(frames, vec![data(&expected_data), resize(7, 9)]);
    }

    #[test]
    fn test_consecutive_resizes_keep_order() {
        let mut decoder = StreamDecoder::new();
        let frames = decoder.feed(b"resize:80:24\nresize:80:24\nresize:100:50\n");
        assert_eq!(frames, vec![resize(80, 24), resize(80, 24), resize(100, 50)]);
    }

    #[test]
    fn test_binary_data_untouched() {
        let mut decoder = StreamDecoder::new();
        let input: Vec<u8> = (0u8..=255).filter(|b| *b != b'r').collect();
        assert_eq!(decoder.feed(&input), vec![data(&input)]);
    }
}
