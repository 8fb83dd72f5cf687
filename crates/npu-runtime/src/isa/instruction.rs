//! Runtime sequence operations and their word encoding
//!
//! Every operation starts with one header word:
//!
//! ```text
//!  31      24 23      16 15                0
//! ┌──────────┬──────────┬──────────────────┐
//! │    op    │   aux    │   payload words  │
//! └──────────┴──────────┴──────────────────┘
//! ```
//!
//! | op   | operation       | aux        | payload                                       |
//! |------|-----------------|------------|-----------------------------------------------|
//! | 0x01 | `DMA_MEMCPY_ND` | BD id      | `channel<<8 \| arg`, offset, sizes[4], strides[4] |
//! | 0x02 | `DMA_WAIT`      | channel    | none                                          |
//! | 0x03 | `TRACE`         | 0          | arg, byte offset, byte size                   |
//!
//! Offsets, sizes, and strides of a memcpy are in elements; sizes and strides
//! are listed outermost dimension first.

use crate::error::{Result, RuntimeError};
use std::fmt;

pub const OP_DMA_MEMCPY_ND: u8 = 0x01;
pub const OP_DMA_WAIT: u8 = 0x02;
pub const OP_TRACE: u8 = 0x03;

const MEMCPY_PAYLOAD_WORDS: usize = 10;
const TRACE_PAYLOAD_WORDS: usize = 3;

/// Stream endpoint a DMA transfer feeds or drains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Channel {
    InA = 0,
    InB = 1,
    OutC = 2,
}

impl Channel {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Channel::InA),
            1 => Some(Channel::InB),
            2 => Some(Channel::OutC),
            _ => None,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::InA => write!(f, "inA"),
            Channel::InB => write!(f, "inB"),
            Channel::OutC => write!(f, "outC"),
        }
    }
}

/// One N-dimensional (N = 4) DMA transfer between a host buffer and a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaDescriptor {
    pub channel: Channel,
    /// Runtime sequence argument index (0 = A, 1 = B, 2 = C)
    pub arg: u8,
    pub bd_id: u8,
    /// Element offset of the first transferred element
    pub offset: u32,
    pub sizes: [u32; 4],
    pub strides: [u32; 4],
}

impl DmaDescriptor {
    /// Elements moved by this transfer
    pub fn element_count(&self) -> usize {
        self.sizes.iter().map(|&s| s as usize).product()
    }

    /// Buffer element index of every transferred element, in stream order.
    pub fn element_indices(&self) -> impl Iterator<Item = usize> + '_ {
        let [s0, s1, s2, s3] = self.sizes.map(|s| s as usize);
        let [t0, t1, t2, t3] = self.strides.map(|t| t as usize);
        let base = self.offset as usize;
        (0..s0).flat_map(move |i0| {
            (0..s1).flat_map(move |i1| {
                (0..s2).flat_map(move |i2| (0..s3).map(move |i3| base + i0 * t0 + i1 * t1 + i2 * t2 + i3 * t3))
            })
        })
    }

    /// One past the largest element index touched, or 0 for empty transfers
    pub fn extent(&self) -> usize {
        if self.element_count() == 0 {
            return 0;
        }
        let last: usize = self
            .sizes
            .iter()
            .zip(self.strides.iter())
            .map(|(&s, &t)| (s as usize - 1) * t as usize)
            .sum();
        self.offset as usize + last + 1
    }
}

/// One operation of a runtime sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceOp {
    DmaMemcpyNd(DmaDescriptor),
    DmaWait { channel: Channel },
    Trace { arg: u8, offset: u32, size: u32 },
}

const fn header(op: u8, aux: u8, payload: usize) -> u32 {
    ((op as u32) << 24) | ((aux as u32) << 16) | (payload as u32 & 0xFFFF)
}

impl SequenceOp {
    /// Append this operation's words to `out`.
    pub fn encode_into(&self, out: &mut Vec<u32>) {
        match self {
            SequenceOp::DmaMemcpyNd(d) => {
                out.push(header(OP_DMA_MEMCPY_ND, d.bd_id, MEMCPY_PAYLOAD_WORDS));
                out.push(((d.channel as u32) << 8) | d.arg as u32);
                out.push(d.offset);
                out.extend_from_slice(&d.sizes);
                out.extend_from_slice(&d.strides);
            }
            SequenceOp::DmaWait { channel } => {
                out.push(header(OP_DMA_WAIT, *channel as u8, 0));
            }
            SequenceOp::Trace { arg, offset, size } => {
                out.push(header(OP_TRACE, 0, TRACE_PAYLOAD_WORDS));
                out.push(*arg as u32);
                out.push(*offset);
                out.push(*size);
            }
        }
    }

    /// Decode the operation starting at `words[at]`.
    ///
    /// Returns the operation and the number of words consumed.
    pub fn decode(words: &[u32], at: usize) -> Result<(Self, usize)> {
        let head = *words.get(at).ok_or_else(|| RuntimeError::decode(at, "missing operation header"))?;
        let op = (head >> 24) as u8;
        let aux = ((head >> 16) & 0xFF) as u8;
        let payload_len = (head & 0xFFFF) as usize;

        let payload = words
            .get(at + 1..at + 1 + payload_len)
            .ok_or_else(|| RuntimeError::decode(at, format!("truncated payload, need {payload_len} words")))?;

        let expect = |n: usize| {
            if payload_len == n {
                Ok(())
            } else {
                Err(RuntimeError::decode(
                    at,
                    format!("op {op:#04x} carries {payload_len} payload words, expected {n}"),
                ))
            }
        };

        let decoded = match op {
            OP_DMA_MEMCPY_ND => {
                expect(MEMCPY_PAYLOAD_WORDS)?;
                let channel_raw = (payload[0] >> 8) as u8;
                let channel = Channel::from_u8(channel_raw)
                    .ok_or_else(|| RuntimeError::decode(at + 1, format!("unknown channel {channel_raw}")))?;
                let mut sizes = [0u32; 4];
                let mut strides = [0u32; 4];
                sizes.copy_from_slice(&payload[2..6]);
                strides.copy_from_slice(&payload[6..10]);
                SequenceOp::DmaMemcpyNd(DmaDescriptor {
                    channel,
                    arg: (payload[0] & 0xFF) as u8,
                    bd_id: aux,
                    offset: payload[1],
                    sizes,
                    strides,
                })
            }
            OP_DMA_WAIT => {
                expect(0)?;
                let channel =
                    Channel::from_u8(aux).ok_or_else(|| RuntimeError::decode(at, format!("unknown channel {aux}")))?;
                SequenceOp::DmaWait { channel }
            }
            OP_TRACE => {
                expect(TRACE_PAYLOAD_WORDS)?;
                SequenceOp::Trace {
                    arg: payload[0] as u8,
                    offset: payload[1],
                    size: payload[2],
                }
            }
            other => return Err(RuntimeError::decode(at, format!("unknown op {other:#04x}"))),
        };

        Ok((decoded, 1 + payload_len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row_major(channel: Channel, arg: u8, rows: u32, cols: u32) -> DmaDescriptor {
        DmaDescriptor {
            channel,
            arg,
            bd_id: arg,
            offset: 0,
            sizes: [1, 1, rows, cols],
            strides: [0, 0, cols, 1],
        }
    }

    #[test]
    fn test_memcpy_header_layout() {
        let mut words = Vec::new();
        SequenceOp::DmaMemcpyNd(row_major(Channel::OutC, 2, 4, 64)).encode_into(&mut words);
        assert_eq!(words.len(), 11);
        assert_eq!(words[0], 0x0102_000A);
        assert_eq!(words[1], 0x0202);
        assert_eq!(&words[3..7], &[1, 1, 4, 64]);
    }

    #[test]
    fn test_decode_each_op() {
        let ops = [
            SequenceOp::Trace {
                arg: 2,
                offset: 512,
                size: 8192,
            },
            SequenceOp::DmaMemcpyNd(row_major(Channel::InB, 1, 1, 64)),
            SequenceOp::DmaWait {
                channel: Channel::OutC,
            },
        ];
        let mut words = Vec::new();
        for op in &ops {
            op.encode_into(&mut words);
        }
        let mut at = 0;
        for op in &ops {
            let (decoded, used) = SequenceOp::decode(&words, at).unwrap();
            assert_eq!(&decoded, op);
            at += used;
        }
        assert_eq!(at, words.len());
    }

    #[test]
    fn test_decode_rejects_unknown_and_truncated() {
        assert!(matches!(
            SequenceOp::decode(&[0x7F00_0000], 0),
            Err(RuntimeError::InstructionDecode { word: 0, .. })
        ));
        assert!(SequenceOp::decode(&[header(OP_TRACE, 0, 3), 2, 0], 0).is_err());
        assert!(SequenceOp::decode(&[header(OP_DMA_WAIT, 9, 0)], 0).is_err());
        assert!(SequenceOp::decode(&[header(OP_DMA_WAIT, 2, 1), 0], 0).is_err());
    }

    #[test]
    fn test_row_major_indices() {
        let d = row_major(Channel::InA, 0, 2, 8);
        let indices: Vec<usize> = d.element_indices().collect();
        assert_eq!(indices, (0..16).collect::<Vec<_>>());
        assert_eq!(d.element_count(), 16);
        assert_eq!(d.extent(), 16);
    }

    #[test]
    fn test_repeat_dimension_rereads_tile() {
        let d = DmaDescriptor {
            channel: Channel::InB,
            arg: 1,
            bd_id: 1,
            offset: 0,
            sizes: [1, 1, 3, 4],
            strides: [0, 0, 0, 1],
        };
        let indices: Vec<usize> = d.element_indices().collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 0, 1, 2, 3, 0, 1, 2, 3]);
        assert_eq!(d.extent(), 4);
    }
}
