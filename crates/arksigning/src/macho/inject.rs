//! Load-command injection for `LC_LOAD_DYLIB` / `LC_LOAD_WEAK_DYLIB`.
//!
//! New commands are appended in the gap between the end of the existing load
//! commands and the first `__TEXT` section. Injecting a path that is already
//! referenced is a no-op.

use super::parser::slice_facts;
use super::writer::{read_u32, write_u32};
use crate::{Error, Result};

/// `LC_LOAD_DYLIB`
pub const LC_LOAD_DYLIB: u32 = 0x0c;
/// `LC_LOAD_WEAK_DYLIB` (`0x18 | LC_REQ_DYLD`)
pub const LC_LOAD_WEAK_DYLIB: u32 = 0x8000_0018;

/// dylib_command fixed part: cmd, cmdsize, name offset, timestamp,
/// current_version, compatibility_version.
const DYLIB_COMMAND_HEADER_SIZE: usize = 24;

/// Install name stored in an existing dylib load command, if any.
fn command_install_name(data: &[u8], cmd_offset: usize, cmdsize: usize) -> Option<&str> {
    let name_offset = read_u32(data, cmd_offset + 8) as usize;
    if name_offset >= cmdsize {
        return None;
    }
    let raw = &data[cmd_offset + name_offset..cmd_offset + cmdsize];
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    std::str::from_utf8(&raw[..end]).ok()
}

/// Append a dylib load command to one slice.
///
/// Returns `false` without modification when the install name is already
/// present (under either the strong or the weak command).
pub fn inject_dylib(data: &mut Vec<u8>, install_name: &str, weak: bool) -> Result<bool> {
    let facts = slice_facts(data)?;

    // Scan existing commands for the same install name.
    let mut offset = facts.header_size;
    for _ in 0..facts.ncmds {
        if offset + 8 > data.len() {
            return Err(Error::MachO("load commands run past end of file".into()));
        }
        let cmd = read_u32(data, offset);
        let cmdsize = read_u32(data, offset + 4) as usize;
        if cmdsize < 8 || offset + cmdsize > data.len() {
            return Err(Error::MachO("malformed load command".into()));
        }

        if cmd == LC_LOAD_DYLIB || cmd == LC_LOAD_WEAK_DYLIB {
            if command_install_name(data, offset, cmdsize) == Some(install_name) {
                return Ok(false);
            }
        }
        offset += cmdsize;
    }

    let cmdsize = (DYLIB_COMMAND_HEADER_SIZE + install_name.len() + 1 + 7) & !7;
    let insert_at = facts.load_commands_end;
    if insert_at + cmdsize > facts.first_section_offset {
        return Err(Error::NoLoadCommandSpace);
    }
    if insert_at + cmdsize > data.len() {
        return Err(Error::MachO("load command area extends past end of file".into()));
    }

    let cmd = if weak { LC_LOAD_WEAK_DYLIB } else { LC_LOAD_DYLIB };
    write_u32(data, insert_at, cmd);
    write_u32(data, insert_at + 4, cmdsize as u32);
    write_u32(data, insert_at + 8, DYLIB_COMMAND_HEADER_SIZE as u32);
    write_u32(data, insert_at + 12, 0); // timestamp
    write_u32(data, insert_at + 16, 0); // current_version
    write_u32(data, insert_at + 20, 0); // compatibility_version

    let name_start = insert_at + DYLIB_COMMAND_HEADER_SIZE;
    data[name_start..name_start + install_name.len()]
        .copy_from_slice(install_name.as_bytes());
    for byte in &mut data[name_start + install_name.len()..insert_at + cmdsize] {
        *byte = 0;
    }

    // ncmds at 16, sizeofcmds at 20 (same offsets for 32- and 64-bit headers)
    write_u32(data, 16, facts.ncmds + 1);
    write_u32(data, 20, facts.sizeofcmds + cmdsize as u32);

    Ok(true)
}
