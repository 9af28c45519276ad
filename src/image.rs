// Snapshot image file format
//
// - 4 bytes: magic ("CRST", little-endian u32)
// - 4 bytes: image type
// - 4 bytes: payload size (little-endian u32)
// - N bytes: protobuf payload
use prost::Message;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::dumper::{CheckpointArgs, Pid, Scope};
use crate::error::{CrestError, Result};
use crate::procfs;
use crate::proto::{ForwardEntry, ProcessEntry, SnapshotEntry, ThreadEntry, VmaEntry};

pub const IMAGE_MAGIC: u32 = u32::from_le_bytes(*b"CRST");
pub const IMAGE_TYPE_SNAPSHOT: u32 = 1;
const HEADER_LEN: usize = 12;

pub fn encode_snapshot(entry: &SnapshotEntry) -> Result<Vec<u8>> {
    let payload = entry.encode_to_vec();
    let size = u32::try_from(payload.len()).map_err(|_| CrestError::InvalidImage {
        reason: format!("snapshot payload too large ({} bytes)", payload.len()),
    })?;
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&IMAGE_MAGIC.to_le_bytes());
    buf.extend_from_slice(&IMAGE_TYPE_SNAPSHOT.to_le_bytes());
    buf.extend_from_slice(&size.to_le_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Write one snapshot image. Returns the bytes written.
pub fn write_snapshot<W: Write>(out: &mut W, entry: &SnapshotEntry) -> Result<usize> {
    let buf = encode_snapshot(entry)?;
    out.write_all(&buf)?;
    out.flush()?;
    Ok(buf.len())
}

pub fn decode_snapshot(buf: &[u8]) -> Result<SnapshotEntry> {
    if buf.len() < HEADER_LEN {
        return Err(CrestError::InvalidImage {
            reason: format!("image is too small (< {} bytes)", HEADER_LEN),
        });
    }
    let word = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
    if word(0) != IMAGE_MAGIC {
        return Err(CrestError::InvalidImage {
            reason: format!("bad magic {:#010x}", word(0)),
        });
    }
    if word(4) != IMAGE_TYPE_SNAPSHOT {
        return Err(CrestError::InvalidImage {
            reason: format!("unexpected image type {}", word(4)),
        });
    }
    let size = word(8) as usize;
    let payload = &buf[HEADER_LEN..];
    if payload.len() < size {
        return Err(CrestError::InvalidImage {
            reason: format!("truncated payload ({} of {} bytes)", payload.len(), size),
        });
    }
    Ok(SnapshotEntry::decode(&payload[..size])?)
}

pub fn read_snapshot(path: impl AsRef<Path>) -> Result<SnapshotEntry> {
    let mut buf = Vec::new();
    File::open(path.as_ref())?.read_to_end(&mut buf)?;
    decode_snapshot(&buf)
}

fn capture_process(pid: Pid) -> Result<ProcessEntry> {
    let threads = procfs::parse_threads(pid)?
        .into_iter()
        .map(|t| ThreadEntry {
            tid: t.tid,
            name: t.name,
        })
        .collect();
    let vmas = procfs::parse_maps(pid)?
        .into_iter()
        .map(|v| VmaEntry {
            start: v.start,
            end: v.end,
            prot: v.prot,
            shared: v.shared,
            offset: v.offset,
            path: v.path,
        })
        .collect();
    Ok(ProcessEntry {
        pid,
        ppid: procfs::parse_ppid(pid)?,
        comm: procfs::read_comm(pid)?,
        threads,
        vmas,
    })
}

fn expand(pid: Pid, scope: Scope) -> Result<Vec<Pid>> {
    match scope {
        Scope::Process => Ok(vec![pid]),
        Scope::Tree => procfs::process_tree(pid),
    }
}

/// Describe `target` (and its descendants for tree scope) as a snapshot,
/// followed by any processes the request was forwarded to.
pub fn capture_snapshot(
    requester: Pid,
    target: Pid,
    args: &CheckpointArgs,
    forwarded: &[(Scope, Pid)],
) -> Result<SnapshotEntry> {
    let mut pids = expand(target, args.scope)?;
    for &(scope, pid) in forwarded {
        for p in expand(pid, scope)? {
            if !pids.contains(&p) {
                pids.push(p);
            }
        }
    }
    let mut processes = Vec::with_capacity(pids.len());
    for (i, pid) in pids.into_iter().enumerate() {
        match capture_process(pid) {
            Ok(p) => processes.push(p),
            // Descendants may exit mid-capture; the target may not.
            Err(e) if i == 0 => return Err(e),
            Err(e) => log::debug!("Skipping exited process {}: {}", pid, e),
        }
    }
    let taken_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    Ok(SnapshotEntry {
        requester,
        target,
        scope: args.scope.as_raw(),
        cwd: procfs::read_cwd(target)?.display().to_string(),
        taken_at,
        processes,
        forwarded: forwarded
            .iter()
            .map(|(scope, pid)| ForwardEntry {
                scope: scope.as_raw(),
                target: *pid,
            })
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SnapshotEntry {
        SnapshotEntry {
            requester: 10,
            target: 10,
            scope: Scope::Process.as_raw(),
            cwd: "/".to_string(),
            taken_at: 1,
            processes: vec![ProcessEntry {
                pid: 10,
                ppid: 1,
                comm: "app".to_string(),
                threads: vec![ThreadEntry {
                    tid: 10,
                    name: "app".to_string(),
                }],
                vmas: vec![],
            }],
            forwarded: vec![],
        }
    }

    #[test]
    fn test_header_layout() {
        let buf = encode_snapshot(&sample()).unwrap();
        assert_eq!(&buf[0..4], b"CRST");
        assert_eq!(u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]), IMAGE_TYPE_SNAPSHOT);
        let size = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
        assert_eq!(size, buf.len() - HEADER_LEN);
        assert_eq!(decode_snapshot(&buf).unwrap(), sample());
    }

    #[test]
    fn test_rejects_bad_images() {
        assert!(matches!(decode_snapshot(b"CRST"), Err(CrestError::InvalidImage { .. })));
        let mut buf = encode_snapshot(&sample()).unwrap();
        buf[0] = b'X';
        assert!(matches!(decode_snapshot(&buf), Err(CrestError::InvalidImage { .. })));
        let mut short = encode_snapshot(&sample()).unwrap();
        short.truncate(short.len() - 1);
        assert!(matches!(decode_snapshot(&short), Err(CrestError::InvalidImage { .. })));
    }

    #[test]
    fn test_capture_self() {
        let pid = crest_sys::signal::getpid();
        let snap = capture_snapshot(pid, pid, &CheckpointArgs::default(), &[(Scope::Process, pid)])
            .unwrap();
        assert_eq!(snap.processes.len(), 1);
        assert_eq!(snap.processes[0].pid, pid);
        assert!(!snap.processes[0].threads.is_empty());
        assert_eq!(snap.forwarded.len(), 1);
    }
}
