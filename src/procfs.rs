//! /proc readers used when capturing a snapshot.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{CrestError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub tid: libc::pid_t,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vma {
    pub start: u64,
    pub end: u64,
    /// PROT_* bits.
    pub prot: u32,
    pub shared: bool,
    pub offset: u64,
    pub path: String,
}

/// Threads of `pid`, in /proc order.
pub fn parse_threads(pid: libc::pid_t) -> Result<Vec<ThreadInfo>> {
    let task_path = format!("/proc/{}/task", pid);
    let dir = fs::read_dir(Path::new(&task_path))?;

    let mut threads = Vec::new();
    for entry in dir {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        let name = entry.file_name();
        let tid = match name.to_str().and_then(|s| s.parse::<libc::pid_t>().ok()) {
            Some(t) => t,
            None => continue,
        };
        // The thread may exit while we walk the directory.
        let comm = fs::read_to_string(entry.path().join("comm")).unwrap_or_default();
        threads.push(ThreadInfo {
            tid,
            name: comm.trim_end().to_string(),
        });
    }
    threads.sort_by_key(|t| t.tid);
    Ok(threads)
}

/// Parse one line of /proc/<pid>/maps.
pub fn parse_maps_line(line: &str) -> Option<Vma> {
    let mut fields = line.split_whitespace();
    let range = fields.next()?;
    let perms = fields.next()?.as_bytes();
    let offset = fields.next()?;
    let _dev = fields.next()?;
    let _inode = fields.next()?;
    let path = fields.collect::<Vec<_>>().join(" ");

    let (start, end) = range.split_once('-')?;
    if perms.len() < 4 {
        return None;
    }
    let mut prot = 0u32;
    if perms[0] == b'r' {
        prot |= libc::PROT_READ as u32;
    }
    if perms[1] == b'w' {
        prot |= libc::PROT_WRITE as u32;
    }
    if perms[2] == b'x' {
        prot |= libc::PROT_EXEC as u32;
    }
    Some(Vma {
        start: u64::from_str_radix(start, 16).ok()?,
        end: u64::from_str_radix(end, 16).ok()?,
        prot,
        shared: perms[3] == b's',
        offset: u64::from_str_radix(offset, 16).ok()?,
        path,
    })
}

pub fn parse_maps(pid: libc::pid_t) -> Result<Vec<Vma>> {
    let maps = fs::read_to_string(format!("/proc/{}/maps", pid))?;
    maps.lines()
        .map(|line| {
            parse_maps_line(line).ok_or_else(|| CrestError::InvalidImage {
                reason: format!("unparseable maps line: {}", line),
            })
        })
        .collect()
}

/// Parent pid from /proc/<pid>/stat.
pub fn parse_ppid(pid: libc::pid_t) -> Result<libc::pid_t> {
    let stat = fs::read_to_string(format!("/proc/{}/stat", pid))?;
    parse_stat_ppid(&stat).ok_or_else(|| CrestError::InvalidImage {
        reason: format!("unparseable stat for {}", pid),
    })
}

fn parse_stat_ppid(stat: &str) -> Option<libc::pid_t> {
    // comm may contain spaces and parentheses; fields resume after the last ')'.
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let _state = fields.next()?;
    fields.next()?.parse().ok()
}

/// Direct children of `pid` across all of its threads.
pub fn parse_children(pid: libc::pid_t) -> Result<Vec<libc::pid_t>> {
    let mut children = Vec::new();
    for thread in parse_threads(pid)? {
        let path = format!("/proc/{}/task/{}/children", pid, thread.tid);
        let list = match fs::read_to_string(path) {
            Ok(l) => l,
            Err(_) => continue,
        };
        children.extend(list.split_whitespace().filter_map(|c| c.parse::<libc::pid_t>().ok()));
    }
    children.sort_unstable();
    children.dedup();
    Ok(children)
}

/// `pid` and all of its descendants, parents before children.
pub fn process_tree(pid: libc::pid_t) -> Result<Vec<libc::pid_t>> {
    let mut tree = vec![pid];
    let mut i = 0;
    while i < tree.len() {
        // Children can exit between listing and descending.
        if let Ok(kids) = parse_children(tree[i]) {
            tree.extend(kids);
        }
        i += 1;
    }
    Ok(tree)
}

pub fn read_comm(pid: libc::pid_t) -> Result<String> {
    let comm = fs::read_to_string(format!("/proc/{}/comm", pid))?;
    Ok(comm.trim_end().to_string())
}

pub fn read_cwd(pid: libc::pid_t) -> Result<PathBuf> {
    Ok(fs::read_link(format!("/proc/{}/cwd", pid))?)
}

/// Path an open descriptor of this process refers to.
pub fn fd_path(fd: std::os::unix::io::RawFd) -> Result<PathBuf> {
    Ok(fs::read_link(format!("/proc/self/fd/{}", fd))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_maps_line() {
        let vma = parse_maps_line(
            "7f1c2a000000-7f1c2a021000 rw-p 00001000 00:00 0                          [heap]",
        )
        .unwrap();
        assert_eq!(vma.start, 0x7f1c2a000000);
        assert_eq!(vma.end, 0x7f1c2a021000);
        assert_eq!(vma.prot, (libc::PROT_READ | libc::PROT_WRITE) as u32);
        assert!(!vma.shared);
        assert_eq!(vma.offset, 0x1000);
        assert_eq!(vma.path, "[heap]");

        let anon = parse_maps_line("00400000-00452000 r-xs 00000000 08:02 173521").unwrap();
        assert!(anon.shared);
        assert_eq!(anon.path, "");
        assert!(parse_maps_line("garbage").is_none());
    }

    #[test]
    fn test_parse_stat_ppid_with_odd_comm() {
        assert_eq!(parse_stat_ppid("42 (a) b) c) S 17 42 42 0"), Some(17));
        assert_eq!(parse_stat_ppid("no parens"), None);
    }

    #[test]
    fn test_self_has_current_thread() {
        let pid = crest_sys::signal::getpid();
        let threads = parse_threads(pid).unwrap();
        assert!(threads.iter().any(|t| t.tid == crest_sys::signal::gettid()));
        assert!(!parse_maps(pid).unwrap().is_empty());
        assert_eq!(process_tree(pid).unwrap()[0], pid);
    }
}
