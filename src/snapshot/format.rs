use crate::commitlog::Index;
use crate::snapshot::store::{Snapshot, SnapshotMeta};
use bytes::BufMut;
use std::io::{self, Read};

// Snapshot file layout, little endian:
//
// magic "HYSN" | version u8 | snapshot id u64 | last included term u64 |
// builder length u16 | builder utf-8 | state length u64 | state crc32 u32 | state
const MAGIC: &[u8; 4] = b"HYSN";
const VERSION: u8 = 1;

pub(super) fn encode(snapshot: &Snapshot) -> Vec<u8> {
    let meta = &snapshot.meta;
    let builder = meta.builder.as_bytes();
    let mut buf = Vec::with_capacity(35 + builder.len() + snapshot.state.len());
    buf.put_slice(MAGIC);
    buf.put_u8(VERSION);
    buf.put_u64_le(meta.snapshot_id.as_u64());
    buf.put_u64_le(meta.last_included_term);
    buf.put_u16_le(builder.len() as u16);
    buf.put_slice(builder);
    buf.put_u64_le(snapshot.state.len() as u64);
    buf.put_u32_le(meta.checksum);
    buf.put_slice(&snapshot.state);
    buf
}

/// Reads just the header, leaving `reader` positioned at the start of the state.
pub(super) fn read_header<R: Read>(reader: &mut R) -> Result<SnapshotMeta, io::Error> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(invalid("bad snapshot magic"));
    }
    let version = read_u8(reader)?;
    if version != VERSION {
        return Err(invalid(format!("unsupported snapshot version {}", version)));
    }

    let snapshot_id = Index::from_u64(read_u64(reader)?)
        .ok_or_else(|| invalid("snapshot id 0 is not valid"))?;
    let last_included_term = read_u64(reader)?;

    let mut builder_len = [0u8; 2];
    reader.read_exact(&mut builder_len)?;
    let mut builder = vec![0u8; u16::from_le_bytes(builder_len) as usize];
    reader.read_exact(&mut builder)?;
    let builder = String::from_utf8(builder).map_err(|_| invalid("builder is not utf-8"))?;

    let state_length = read_u64(reader)?;
    let mut checksum = [0u8; 4];
    reader.read_exact(&mut checksum)?;

    Ok(SnapshotMeta {
        snapshot_id,
        last_included_term,
        builder,
        checksum: u32::from_le_bytes(checksum),
        state_length,
    })
}

/// Decodes a complete snapshot and verifies its length and checksum.
pub(super) fn decode(bytes: &[u8]) -> Result<Snapshot, io::Error> {
    let mut reader = bytes;
    let meta = read_header(&mut reader)?;
    if reader.len() as u64 != meta.state_length {
        return Err(invalid(format!(
            "snapshot {:?} state is {} bytes, header says {}",
            meta.snapshot_id,
            reader.len(),
            meta.state_length
        )));
    }
    if crc32fast::hash(reader) != meta.checksum {
        return Err(invalid(format!(
            "snapshot {:?} checksum mismatch",
            meta.snapshot_id
        )));
    }

    Ok(Snapshot {
        meta,
        state: reader.to_vec(),
    })
}

fn read_u8<R: Read>(reader: &mut R) -> Result<u8, io::Error> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64, io::Error> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn invalid<M: Into<String>>(message: M) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}
