//! Complete instruction streams
//!
//! A stream is a two-word preamble followed by the encoded operations:
//!
//! ```text
//! [STREAM_MAGIC] [op count] [op 0 words ...] [op 1 words ...] ...
//! ```

use super::instruction::SequenceOp;
use crate::error::{Result, RuntimeError};

/// First word of every instruction stream ("NPU1")
pub const STREAM_MAGIC: u32 = 0x4E50_5531;

/// Decoded runtime sequence
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstructionStream {
    ops: Vec<SequenceOp>,
}

impl InstructionStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: SequenceOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn ops(&self) -> &[SequenceOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Encode to the word layout the device consumes.
    pub fn to_words(&self) -> Vec<u32> {
        let mut words = vec![STREAM_MAGIC, self.ops.len() as u32];
        for op in &self.ops {
            op.encode_into(&mut words);
        }
        words
    }

    /// Decode a word stream, rejecting bad preambles, truncation, and
    /// trailing words.
    pub fn from_words(words: &[u32]) -> Result<Self> {
        match words.first() {
            Some(&STREAM_MAGIC) => {}
            Some(&other) => {
                return Err(RuntimeError::decode(
                    0,
                    format!("bad magic {other:#010x}, expected {STREAM_MAGIC:#010x}"),
                ))
            }
            None => return Err(RuntimeError::decode(0, "empty instruction stream")),
        }
        let count = *words
            .get(1)
            .ok_or_else(|| RuntimeError::decode(1, "missing operation count"))? as usize;

        let mut ops = Vec::with_capacity(count.min(words.len()));
        let mut at = 2;
        for _ in 0..count {
            let (op, used) = SequenceOp::decode(words, at)?;
            ops.push(op);
            at += used;
        }
        if at != words.len() {
            return Err(RuntimeError::decode(
                at,
                format!("{} trailing words after {count} operations", words.len() - at),
            ));
        }
        Ok(Self { ops })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::{Channel, DmaDescriptor};

    fn sample() -> InstructionStream {
        let mut stream = InstructionStream::new();
        stream
            .push(SequenceOp::DmaMemcpyNd(DmaDescriptor {
                channel: Channel::InA,
                arg: 0,
                bd_id: 0,
                offset: 0,
                sizes: [1, 1, 4, 64],
                strides: [0, 0, 64, 1],
            }))
            .push(SequenceOp::DmaWait {
                channel: Channel::OutC,
            });
        stream
    }

    #[test]
    fn test_stream_round_trip() {
        let stream = sample();
        let words = stream.to_words();
        assert_eq!(words[0], STREAM_MAGIC);
        assert_eq!(words[1], 2);
        assert_eq!(InstructionStream::from_words(&words).unwrap(), stream);
    }

    #[test]
    fn test_stream_rejects_bad_preamble() {
        let mut words = sample().to_words();
        words[0] = 0xDEAD_BEEF;
        assert!(matches!(
            InstructionStream::from_words(&words),
            Err(RuntimeError::InstructionDecode { word: 0, .. })
        ));
        assert!(InstructionStream::from_words(&[]).is_err());
        assert!(InstructionStream::from_words(&[STREAM_MAGIC]).is_err());
    }

    #[test]
    fn test_stream_rejects_truncation_and_trailing_words() {
        let words = sample().to_words();
        assert!(InstructionStream::from_words(&words[..words.len() - 3]).is_err());

        let mut padded = words.clone();
        padded.push(0);
        assert!(InstructionStream::from_words(&padded).is_err());
    }
}
