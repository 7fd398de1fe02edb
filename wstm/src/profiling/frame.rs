//! Binary encoding for the conflict-profile frame kinds.
//!
//! Layout transcribed from spec §6 "Conflict-profile file format" and
//! cross-checked against the `Frames::FrameType` enum
//! (`varName = 0, commit, conflict, nameData`) in
//! `examples/original_source/src/conflict_profiling_internal.h`. Every
//! multi-byte field is written little-endian. "ptr" fields (variable and
//! name identifiers) are `u64`: opaque identifiers once the stream leaves
//! this process, never real addresses to a consumer, per spec §6's
//! "consumers must treat each pointer field as an opaque identifier."

pub(crate) const TAG_VAR_NAME: u8 = 0;
pub(crate) const TAG_COMMIT: u8 = 1;
pub(crate) const TAG_CONFLICT: u8 = 2;
pub(crate) const TAG_NAME_DATA: u8 = 3;

fn pad_to(buf: &mut Vec<u8>, align: usize) {
    while buf.len() % align != 0 {
        buf.push(0);
    }
}

pub(crate) fn encode_var_name(name_id: u64, var_id: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(24);
    buf.push(TAG_VAR_NAME);
    pad_to(&mut buf, 8);
    buf.extend_from_slice(&name_id.to_le_bytes());
    buf.extend_from_slice(&var_id.to_le_bytes());
    buf
}

#[allow(clippy::too_many_arguments)]
fn encode_txn_frame(
    tag: u8,
    name: u64,
    thread_name: u64,
    start_ns: i64,
    end_ns: i64,
    file: u64,
    line: u16,
    ids: &[u64],
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64 + ids.len() * 8);
    buf.push(tag);
    pad_to(&mut buf, 8);
    buf.extend_from_slice(&name.to_le_bytes());
    buf.extend_from_slice(&thread_name.to_le_bytes());
    buf.extend_from_slice(&start_ns.to_le_bytes());
    buf.extend_from_slice(&end_ns.to_le_bytes());
    buf.extend_from_slice(&file.to_le_bytes());
    buf.extend_from_slice(&line.to_le_bytes());
    let n = ids.len().min(u16::MAX as usize) as u16;
    buf.extend_from_slice(&n.to_le_bytes());
    pad_to(&mut buf, 8);
    for id in ids.iter().take(n as usize) {
        buf.extend_from_slice(&id.to_le_bytes());
    }
    buf
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn encode_commit(
    name: u64,
    thread_name: u64,
    start_ns: i64,
    end_ns: i64,
    file: u64,
    line: u16,
    set_ids: &[u64],
) -> Vec<u8> {
    encode_txn_frame(TAG_COMMIT, name, thread_name, start_ns, end_ns, file, line, set_ids)
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn encode_conflict(
    name: u64,
    thread_name: u64,
    start_ns: i64,
    end_ns: i64,
    file: u64,
    line: u16,
    got_ids: &[u64],
) -> Vec<u8> {
    encode_txn_frame(TAG_CONFLICT, name, thread_name, start_ns, end_ns, file, line, got_ids)
}

pub(crate) fn encode_name_data(key: u64, name: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + name.len());
    buf.push(TAG_NAME_DATA);
    pad_to(&mut buf, 8);
    buf.extend_from_slice(&key.to_le_bytes());
    let n = name.len() as u32;
    buf.extend_from_slice(&n.to_le_bytes());
    buf.extend_from_slice(name);
    buf
}
