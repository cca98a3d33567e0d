// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_newtype {
    ($name:ident, $repr:ty) => {
        #[derive(
            Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub $repr);

        impl $name {
            pub const fn new(value: $repr) -> Self {
                Self(value)
            }

            pub const fn value(&self) -> $repr {
                self.0
            }
        }

        impl From<$repr> for $name {
            fn from(value: $repr) -> Self {
                Self(value)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(OriginId, u64);
id_newtype!(SequenceNumber, u64);
id_newtype!(ChunkNumber, u32);
id_newtype!(WatermarkTimestamp, u64);
id_newtype!(QueryId, u64);
id_newtype!(PipelineId, u32);
id_newtype!(OperatorHandlerIndex, usize);
id_newtype!(SinkId, u32);

/// `(sequenceNumber, chunkNumber, lastChunk)` stamped onto every tuple buffer by its
/// originating source. Within an origin, pairs of `(seqNo, chunkNo)` are distinct.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SequenceData {
    pub sequence_number: SequenceNumber,
    pub chunk_number: ChunkNumber,
    pub last_chunk: bool,
}

impl SequenceData {
    pub fn new(sequence_number: SequenceNumber, chunk_number: ChunkNumber, last_chunk: bool) -> Self {
        Self {
            sequence_number,
            chunk_number,
            last_chunk,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newtype_roundtrips_value() {
        let origin = OriginId::new(7);
        assert_eq!(origin.value(), 7);
        assert_eq!(OriginId::from(7), origin);
        assert_eq!(format!("{origin}"), "7");
    }

    #[test]
    fn ids_order_by_inner_value() {
        assert!(SequenceNumber::new(1) < SequenceNumber::new(2));
    }
}
