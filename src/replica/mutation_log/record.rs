use crate::commitlog;
use crate::replica::local_state::Term;
use bytes::{Buf, BufMut, Bytes};
use std::convert::TryFrom;
use std::io;

/// Appended by every new leader to commit the entries of earlier terms. Never reaches the
/// automaton.
pub(crate) const NO_OP_MUTATION_TYPE: &str = "hydra.no_op";

const VERSION: u8 = 1;
const HEADER_LEN: usize = 1 + 8 + 8 + 2;

/// One entry of the mutation log. Its sequence number is the log index it is stored at.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationRecord {
    pub term: Term,
    /// Leader wall clock when the mutation was proposed, millis since the unix epoch.
    pub timestamp: u64,
    pub mutation_type: String,
    pub payload: Bytes,
}

impl MutationRecord {
    pub(crate) fn no_op(term: Term, timestamp: u64) -> Self {
        MutationRecord {
            term,
            timestamp,
            mutation_type: NO_OP_MUTATION_TYPE.to_string(),
            payload: Bytes::new(),
        }
    }

    pub(crate) fn is_no_op(&self) -> bool {
        self.mutation_type == NO_OP_MUTATION_TYPE
    }
}

impl commitlog::Entry for MutationRecord {}

/// `[version u8][term u64 LE][timestamp u64 LE][type length u16 LE][type][payload]`
impl From<MutationRecord> for Vec<u8> {
    fn from(record: MutationRecord) -> Self {
        let type_bytes = record.mutation_type.as_bytes();
        let mut buf = Vec::with_capacity(HEADER_LEN + type_bytes.len() + record.payload.len());
        buf.put_u8(VERSION);
        buf.put_u64_le(record.term.as_u64());
        buf.put_u64_le(record.timestamp);
        buf.put_u16_le(type_bytes.len() as u16);
        buf.put_slice(type_bytes);
        buf.put_slice(&record.payload);
        buf
    }
}

impl TryFrom<Vec<u8>> for MutationRecord {
    type Error = io::Error;

    fn try_from(bytes: Vec<u8>) -> Result<Self, Self::Error> {
        let mut buf = Bytes::from(bytes);
        if buf.len() < HEADER_LEN {
            return Err(invalid_data("record shorter than its header"));
        }

        let version = buf.get_u8();
        if version != VERSION {
            return Err(invalid_data("unknown record version"));
        }
        let term = Term::new(buf.get_u64_le());
        let timestamp = buf.get_u64_le();
        let type_len = buf.get_u16_le() as usize;
        if buf.remaining() < type_len {
            return Err(invalid_data("record shorter than its mutation type"));
        }
        let type_bytes = buf.split_to(type_len);
        let mutation_type =
            String::from_utf8(type_bytes.to_vec()).map_err(|_| invalid_data("mutation type is not utf-8"))?;

        Ok(MutationRecord {
            term,
            timestamp,
            mutation_type,
            payload: buf,
        })
    }
}

fn invalid_data(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_layout() {
        let record = MutationRecord {
            term: Term::new(2),
            timestamp: 9,
            mutation_type: "t".to_string(),
            payload: Bytes::from_static(b"xy"),
        };
        let bytes: Vec<u8> = record.clone().into();
        assert_eq!(
            bytes,
            vec![1, 2, 0, 0, 0, 0, 0, 0, 0, 9, 0, 0, 0, 0, 0, 0, 0, 1, 0, b't', b'x', b'y']
        );
        assert_eq!(MutationRecord::try_from(bytes).unwrap(), record);
    }

    #[test]
    fn decode_rejects_bad_input() {
        let good: Vec<u8> = MutationRecord::no_op(Term::new(1), 0).into();

        let mut wrong_version = good.clone();
        wrong_version[0] = 9;
        assert!(MutationRecord::try_from(wrong_version).is_err());

        assert!(MutationRecord::try_from(good[..HEADER_LEN - 1].to_vec()).is_err());

        // Type length points past the end.
        let mut long_type = good[..HEADER_LEN].to_vec();
        long_type[HEADER_LEN - 2] = 200;
        assert!(MutationRecord::try_from(long_type).is_err());

        assert!(MutationRecord::try_from(good).unwrap().is_no_op());
    }
}
