//! Per-socket frame reassembly.
//!
//! The state machine mirrors the wire format: accumulate four header bytes,
//! read the announced payload size, accumulate that many payload bytes, emit
//! one frame, start over. Arbitrary read fragmentation is handled; a
//! zero-length payload is a legal frame and emits empty.

use crate::support::{ErrorKind, NetError, NetResult};
use byteorder::ByteOrder;
use photon::codec::{NetOrder, HEADER_SIZE};
use std::mem;

/// Upper bound on a single announced payload. Anything larger is treated as
/// a protocol violation rather than an allocation request.
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

pub struct FrameAssembler {
    /// Payload size once the header is complete; `None` while header bytes
    /// are still being collected.
    pending_size: Option<usize>,
    header: Vec<u8>,
    body: Vec<u8>,
}

impl FrameAssembler {
    pub fn new() -> FrameAssembler {
        FrameAssembler {
            pending_size: None,
            header: Vec::with_capacity(HEADER_SIZE),
            body: Vec::new(),
        }
    }

    /// Feeds received bytes in and returns every frame completed by them,
    /// in wire order.
    pub fn push(&mut self, mut bytes: &[u8]) -> NetResult<Vec<Vec<u8>>> {
        let mut frames = Vec::new();

        while !bytes.is_empty() {
            match self.pending_size {
                None => {
                    let need = HEADER_SIZE - self.header.len();
                    let take = need.min(bytes.len());
                    self.header.extend_from_slice(&bytes[..take]);
                    bytes = &bytes[take..];

                    if self.header.len() == HEADER_SIZE {
                        let size = NetOrder::read_u32(&self.header) as usize;
                        self.header.clear();
                        if size > MAX_PAYLOAD_SIZE {
                            return Err(NetError::Fatal(ErrorKind::PayloadTooLarge));
                        }
                        if size == 0 {
                            frames.push(Vec::new());
                        } else {
                            self.pending_size = Some(size);
                            self.body.reserve(size);
                        }
                    }
                }
                Some(size) => {
                    let need = size - self.body.len();
                    let take = need.min(bytes.len());
                    self.body.extend_from_slice(&bytes[..take]);
                    bytes = &bytes[take..];

                    if self.body.len() == size {
                        frames.push(mem::replace(&mut self.body, Vec::new()));
                        self.pending_size = None;
                    }
                }
            }
        }

        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use photon::codec::frame;
    use rand::Rng;

    fn stream_of(frames: &[&[u8]]) -> Vec<u8> {
        let mut stream = Vec::new();
        for payload in frames {
            stream.extend_from_slice(&frame(payload));
        }
        stream
    }

    #[test]
    fn test_single_read_multiple_frames() {
        let payloads: Vec<&[u8]> = vec![b"hello", b"", b"world!!"];
        let stream = stream_of(&payloads);

        let mut assembler = FrameAssembler::new();
        let frames = assembler.push(&stream).unwrap();

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0], b"hello");
        assert_eq!(frames[1], b"");
        assert_eq!(frames[2], b"world!!");
    }

    #[test]
    fn test_byte_at_a_time() {
        let payloads: Vec<&[u8]> = vec![b"a", b"bb", b"", b"cccc"];
        let stream = stream_of(&payloads);

        let mut assembler = FrameAssembler::new();
        let mut frames = Vec::new();
        for byte in &stream {
            frames.extend(assembler.push(std::slice::from_ref(byte)).unwrap());
        }

        assert_eq!(frames.len(), 4);
        assert_eq!(frames[0], b"a");
        assert_eq!(frames[1], b"bb");
        assert_eq!(frames[2], b"");
        assert_eq!(frames[3], b"cccc");
    }

    #[test]
    fn test_random_splits() {
        let mut rng = rand::thread_rng();
        let payloads: Vec<Vec<u8>> = (0..40)
            .map(|_| {
                let len = rng.gen_range(0..300);
                (0..len).map(|_| rng.gen::<u8>()).collect()
            })
            .collect();

        let mut stream = Vec::new();
        for payload in &payloads {
            stream.extend_from_slice(&frame(payload));
        }

        for _ in 0..20 {
            let mut assembler = FrameAssembler::new();
            let mut frames = Vec::new();
            let mut rest = &stream[..];
            while !rest.is_empty() {
                let take = rng.gen_range(1..=rest.len().min(97));
                frames.extend(assembler.push(&rest[..take]).unwrap());
                rest = &rest[take..];
            }
            assert_eq!(frames, payloads);
        }
    }

    #[test]
    fn test_oversize_announcement_rejected() {
        let mut header = [0u8; HEADER_SIZE];
        NetOrder::write_u32(&mut header, (MAX_PAYLOAD_SIZE + 1) as u32);

        let mut assembler = FrameAssembler::new();
        assert_eq!(
            assembler.push(&header).unwrap_err(),
            NetError::Fatal(ErrorKind::PayloadTooLarge)
        );
    }
}
