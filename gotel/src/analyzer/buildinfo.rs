// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of gotel

//! Parser for the `.go.buildinfo` section the Go linker stamps into every
//! binary: the toolchain version plus the module manifest of everything the
//! target links. Two encodings exist: go >= 1.18 inlines both strings into
//! the section (varint length prefix), older toolchains store two pointers
//! into the data segment.

use std::collections::HashMap;

use object::{Object, ObjectSection};
use semver::Version;

use crate::{
    errors::GotelError,
    offsets::parse_go_version,
};

const BUILDINFO_SECTION: &str = ".go.buildinfo";
const BUILDINFO_MAGIC: &[u8; 14] = b"\xff Go buildinf:";
const BUILDINFO_HEADER_LEN: usize = 32;

const FLAG_BIG_ENDIAN: u8 = 1 << 0;
const FLAG_INLINE_STRINGS: u8 = 1 << 1;

// Bracketing marker around the module manifest, emitted by the Go linker.
const MODINFO_SENTINEL_LEN: usize = 16;
const MODINFO_SENTINEL: [u8; MODINFO_SENTINEL_LEN] = [
    0x30, 0x77, 0xaf, 0x0c, 0x92, 0x74, 0x08, 0x02, 0x41, 0xe1, 0xc1, 0x07, 0xe6, 0xd6, 0x18, 0xe6,
];

#[derive(Debug, Clone)]
pub struct BuildInfo {
    pub go_version: Version,
    /// Linked modules by import path. Standard-library packages are not
    /// listed; they version with the toolchain.
    pub libraries: HashMap<String, Version>,
}

pub fn read_build_info(path: &str, file: &object::File) -> Result<BuildInfo, GotelError> {
    let section = file
        .section_by_name(BUILDINFO_SECTION)
        .ok_or_else(|| GotelError::NotAGoBinary {
            path: path.to_string(),
            reason: format!("no {BUILDINFO_SECTION} section"),
        })?;
    let data = section
        .data()
        .map_err(|e| GotelError::NotAGoBinary {
            path: path.to_string(),
            reason: format!("unreadable {BUILDINFO_SECTION} section: {e}"),
        })?;

    parse_build_info(data, |addr, len| read_va(file, addr, len)).map_err(|reason| {
        GotelError::NotAGoBinary {
            path: path.to_string(),
            reason,
        }
    })
}

/// Parses the raw section bytes. `resolve` reads `len` bytes at a virtual
/// address, for the pointer-pair encoding.
fn parse_build_info<F>(data: &[u8], resolve: F) -> Result<BuildInfo, String>
where
    F: Fn(u64, usize) -> Option<Vec<u8>>,
{
    if data.len() < BUILDINFO_HEADER_LEN || &data[..BUILDINFO_MAGIC.len()] != BUILDINFO_MAGIC {
        return Err("missing build info magic".to_string());
    }
    let ptr_size = data[14] as usize;
    let flags = data[15];

    let (version_str, modinfo) = if flags & FLAG_INLINE_STRINGS != 0 {
        let (version, rest) = read_inline_string(&data[BUILDINFO_HEADER_LEN..])
            .ok_or("truncated inline version string")?;
        let (modinfo, _) = read_inline_string(rest).ok_or("truncated inline module info")?;
        (version, modinfo)
    } else {
        if !matches!(ptr_size, 4 | 8) {
            return Err(format!("unsupported pointer size {ptr_size}"));
        }
        let big_endian = flags & FLAG_BIG_ENDIAN != 0;
        let version_ptr = read_uint(&data[16..16 + ptr_size], big_endian);
        let modinfo_ptr = read_uint(&data[16 + ptr_size..16 + 2 * ptr_size], big_endian);
        let version = read_go_string(version_ptr, ptr_size, big_endian, &resolve)
            .ok_or("unresolvable version string pointer")?;
        let modinfo = read_go_string(modinfo_ptr, ptr_size, big_endian, &resolve)
            .ok_or("unresolvable module info pointer")?;
        (version, modinfo)
    };

    let go_version =
        parse_go_version(&version_str).map_err(|e| format!("bad toolchain version: {e}"))?;

    Ok(BuildInfo {
        go_version,
        libraries: parse_modinfo(&modinfo),
    })
}

/// A varint-length-prefixed string, returning the remainder of the input.
fn read_inline_string(data: &[u8]) -> Option<(String, &[u8])> {
    let (len, rest) = read_uvarint(data)?;
    let len = len as usize;
    if rest.len() < len {
        return None;
    }
    let s = String::from_utf8_lossy(&rest[..len]).into_owned();
    Some((s, &rest[len..]))
}

fn read_uvarint(data: &[u8]) -> Option<(u64, &[u8])> {
    let mut value: u64 = 0;
    for (i, byte) in data.iter().enumerate() {
        if i >= 10 {
            return None;
        }
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value, &data[i + 1..]));
        }
    }
    None
}

fn read_uint(bytes: &[u8], big_endian: bool) -> u64 {
    bytes.iter().enumerate().fold(0u64, |acc, (i, b)| {
        let shift = if big_endian {
            8 * (bytes.len() - 1 - i)
        } else {
            8 * i
        };
        acc | (u64::from(*b) << shift)
    })
}

/// Dereferences a Go string header (data pointer, length) at `addr`.
fn read_go_string<F>(addr: u64, ptr_size: usize, big_endian: bool, resolve: &F) -> Option<String>
where
    F: Fn(u64, usize) -> Option<Vec<u8>>,
{
    let header = resolve(addr, ptr_size * 2)?;
    let data_ptr = read_uint(&header[..ptr_size], big_endian);
    let len = read_uint(&header[ptr_size..], big_endian) as usize;
    let bytes = resolve(data_ptr, len)?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

fn read_va(file: &object::File, addr: u64, len: usize) -> Option<Vec<u8>> {
    if len == 0 {
        return Some(Vec::new());
    }
    for section in file.sections() {
        let start = section.address();
        let end = start.checked_add(section.size())?;
        if addr >= start && addr.checked_add(len as u64)? <= end {
            let data = section.data().ok()?;
            let rel = (addr - start) as usize;
            return data.get(rel..rel + len).map(<[u8]>::to_vec);
        }
    }
    None
}

/// Extracts `import-path -> version` pairs from the module manifest.
///
/// The manifest is bracketed by 16-byte sentinels and holds tab-separated
/// lines: `mod` names the main module, `dep` its dependencies, `=>` a
/// replacement for the preceding `dep`.
fn parse_modinfo(modinfo: &str) -> HashMap<String, Version> {
    let bytes = modinfo.as_bytes();
    let trimmed = if bytes.len() >= 2 * MODINFO_SENTINEL_LEN
        && bytes[..MODINFO_SENTINEL_LEN] == MODINFO_SENTINEL
        && bytes[bytes.len() - MODINFO_SENTINEL_LEN..] == MODINFO_SENTINEL
    {
        &modinfo[MODINFO_SENTINEL_LEN..modinfo.len() - MODINFO_SENTINEL_LEN]
    } else {
        modinfo
    };

    let mut libraries = HashMap::new();
    for line in trimmed.lines() {
        let mut parts = line.split('\t');
        let (Some(kind), Some(path), Some(version)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        if kind != "dep" && kind != "mod" {
            continue;
        }
        // The main module is often stamped "(devel)"; unparseable versions
        // simply stay unknown.
        if let Ok(version) = parse_go_version(version) {
            libraries.insert(path.to_string(), version);
        }
    }
    libraries
}

#[cfg(test)]
mod test {
    use super::*;

    fn inline_section(version: &str, modinfo: &str) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(BUILDINFO_MAGIC);
        data.push(8); // ptr size
        data.push(FLAG_INLINE_STRINGS);
        data.resize(BUILDINFO_HEADER_LEN, 0);
        for s in [version, modinfo] {
            assert!(s.len() < 0x80, "single-byte varint only in tests");
            data.push(s.len() as u8);
            data.extend_from_slice(s.as_bytes());
        }
        data
    }

    fn sentinel_wrapped(body: &str) -> String {
        let sentinel = String::from_utf8_lossy(&MODINFO_SENTINEL).into_owned();
        format!("{sentinel}{body}{sentinel}")
    }

    #[test]
    fn test_inline_encoding() {
        let modinfo = "path\texample.com/app\nmod\texample.com/app\t(devel)\t\ndep\tgoogle.golang.org/grpc\tv1.60.1\th1:abc=\n";
        let data = inline_section("go1.21.3", modinfo);
        let info = parse_build_info(&data, |_, _| None).unwrap();
        assert_eq!(info.go_version, Version::new(1, 21, 3));
        assert_eq!(
            info.libraries.get("google.golang.org/grpc"),
            Some(&Version::new(1, 60, 1))
        );
        // "(devel)" main module version is unparseable and skipped.
        assert!(!info.libraries.contains_key("example.com/app"));
    }

    #[test]
    fn test_pointer_encoding() {
        // Fake little-endian 64-bit memory: string headers at 0x1000 and
        // 0x1010, backing bytes at 0x2000 and 0x2100.
        let version = b"go1.16.15";
        let modinfo = b"dep\tgithub.com/gorilla/mux\tv1.8.0\th1:xyz=\n";
        let mut memory: HashMap<u64, Vec<u8>> = HashMap::new();
        let header = |ptr: u64, len: usize| {
            let mut h = (ptr).to_le_bytes().to_vec();
            h.extend_from_slice(&(len as u64).to_le_bytes());
            h
        };
        memory.insert(0x1000, header(0x2000, version.len()));
        memory.insert(0x1010, header(0x2100, modinfo.len()));
        memory.insert(0x2000, version.to_vec());
        memory.insert(0x2100, modinfo.to_vec());

        let mut data = Vec::new();
        data.extend_from_slice(BUILDINFO_MAGIC);
        data.push(8);
        data.push(0); // pointer encoding, little endian
        data.extend_from_slice(&0x1000u64.to_le_bytes());
        data.extend_from_slice(&0x1010u64.to_le_bytes());
        data.resize(BUILDINFO_HEADER_LEN.max(data.len()), 0);

        let info = parse_build_info(&data, |addr, len| {
            memory.get(&addr).filter(|v| v.len() >= len).map(|v| v[..len].to_vec())
        })
        .unwrap();
        assert_eq!(info.go_version, Version::new(1, 16, 15));
        assert_eq!(
            info.libraries.get("github.com/gorilla/mux"),
            Some(&Version::new(1, 8, 0))
        );
    }

    #[test]
    fn test_sentinel_stripping() {
        let body = "dep\tgolang.org/x/net\tv0.21.0\th1:aaa=\n";
        let libraries = parse_modinfo(&sentinel_wrapped(body));
        assert_eq!(
            libraries.get("golang.org/x/net"),
            Some(&Version::new(0, 21, 0))
        );
    }

    #[test]
    fn test_missing_magic() {
        assert!(parse_build_info(&[0u8; 64], |_, _| None).is_err());
    }
}
