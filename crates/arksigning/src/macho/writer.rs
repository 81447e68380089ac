//! Byte-level rewriting of a Mach-O slice around its signature region.
//!
//! Stripping removes the `LC_CODE_SIGNATURE` command, shrinks `__LINKEDIT`
//! back to its pre-signature size, and truncates the slice; appending grows
//! `__LINKEDIT` by the signature region and installs a fresh command as the
//! last entry in the load command list.
//!
//! Thin slices are little-endian on disk, so all patch helpers read and
//! write little-endian values.

use super::parser::{align_to, slice_facts};
use crate::{Error, Result};

/// `LC_CODE_SIGNATURE`
pub const LC_CODE_SIGNATURE: u32 = 0x1d;

/// Size of a linkedit_data_command.
const LINKEDIT_DATA_COMMAND_SIZE: usize = 16;

/// `__LINKEDIT` vmsize is rounded to this page size.
const VM_PAGE_SIZE: usize = 0x4000;

pub fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap())
}

pub fn write_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

pub fn write_u64(data: &mut [u8], offset: usize, value: u64) {
    data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

/// Patch a segment command's filesize and page-rounded vmsize.
fn patch_segment_sizes(data: &mut [u8], cmd_offset: usize, is_64: bool, filesize: u64) {
    let vmsize = align_to(filesize as usize, VM_PAGE_SIZE) as u64;
    if is_64 {
        // segment_command_64: vmsize at +32, filesize at +48
        write_u64(data, cmd_offset + 32, vmsize);
        write_u64(data, cmd_offset + 48, filesize);
    } else {
        // segment_command: vmsize at +28, filesize at +36
        write_u32(data, cmd_offset + 28, vmsize as u32);
        write_u32(data, cmd_offset + 36, filesize as u32);
    }
}

/// Remove an existing embedded signature from one slice.
///
/// Zeroes the freed load-command bytes, shrinks `__LINKEDIT`, and truncates
/// the slice at the old signature offset. Returns `false` when there was no
/// signature to remove.
pub fn strip_signature(data: &mut Vec<u8>) -> Result<bool> {
    let facts = slice_facts(data)?;
    let Some(cs) = facts.code_signature else {
        return Ok(false);
    };
    let linkedit = facts
        .linkedit
        .ok_or_else(|| Error::MachO("signed slice has no __LINKEDIT segment".into()))?;

    if (cs.dataoff as u64) < linkedit.fileoff {
        return Err(Error::MachO(
            "signature region lies outside __LINKEDIT".into(),
        ));
    }

    // Drop the command. It is normally last; if an injection slipped one in
    // behind it, shift the tail commands down over it.
    let cmd_end = cs.cmd_offset + LINKEDIT_DATA_COMMAND_SIZE;
    if cmd_end < facts.load_commands_end {
        data.copy_within(cmd_end..facts.load_commands_end, cs.cmd_offset);
    }
    for byte in
        &mut data[facts.load_commands_end - LINKEDIT_DATA_COMMAND_SIZE..facts.load_commands_end]
    {
        *byte = 0;
    }

    write_u32(data, 16, facts.ncmds - 1);
    write_u32(
        data,
        20,
        facts.sizeofcmds - LINKEDIT_DATA_COMMAND_SIZE as u32,
    );

    let mut linkedit_cmd_offset = linkedit.cmd_offset;
    if linkedit_cmd_offset > cs.cmd_offset {
        linkedit_cmd_offset -= LINKEDIT_DATA_COMMAND_SIZE;
    }
    patch_segment_sizes(
        data,
        linkedit_cmd_offset,
        facts.is_64,
        cs.dataoff as u64 - linkedit.fileoff,
    );

    data.truncate(cs.dataoff as usize);
    Ok(true)
}

/// Install a fresh `LC_CODE_SIGNATURE` and reserve the signature region.
///
/// `dataoff` must equal the current slice length (the code limit), 16-byte
/// aligned; `datasize` is the aligned region length. The slice is extended
/// with zeroes so that `dataoff + datasize == slice length`, keeping the
/// on-disk invariant for the finished binary.
pub fn append_signature_command(data: &mut Vec<u8>, dataoff: u32, datasize: u32) -> Result<()> {
    let facts = slice_facts(data)?;
    if facts.code_signature.is_some() {
        return Err(Error::MachO("slice is already signed".into()));
    }
    let linkedit = facts
        .linkedit
        .ok_or_else(|| Error::MachO("slice has no __LINKEDIT segment".into()))?;

    if dataoff as usize != data.len() || dataoff % 16 != 0 {
        return Err(Error::MachO("misaligned signature offset".into()));
    }

    let insert_at = facts.load_commands_end;
    if insert_at + LINKEDIT_DATA_COMMAND_SIZE > facts.first_section_offset {
        return Err(Error::NoLoadCommandSpace);
    }
    if insert_at + LINKEDIT_DATA_COMMAND_SIZE > data.len() {
        return Err(Error::MachO("load command area extends past end of file".into()));
    }

    write_u32(data, insert_at, LC_CODE_SIGNATURE);
    write_u32(data, insert_at + 4, LINKEDIT_DATA_COMMAND_SIZE as u32);
    write_u32(data, insert_at + 8, dataoff);
    write_u32(data, insert_at + 12, datasize);

    write_u32(data, 16, facts.ncmds + 1);
    write_u32(
        data,
        20,
        facts.sizeofcmds + LINKEDIT_DATA_COMMAND_SIZE as u32,
    );

    patch_segment_sizes(
        data,
        linkedit.cmd_offset,
        facts.is_64,
        dataoff as u64 + datasize as u64 - linkedit.fileoff,
    );

    data.resize(dataoff as usize + datasize as usize, 0);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macho::test_support::minimal_executable;

    #[test]
    fn read_write_round_trip() {
        let mut data = vec![0u8; 16];
        write_u32(&mut data, 0, 0x12345678);
        assert_eq!(read_u32(&data, 0), 0x12345678);
        assert_eq!(&data[0..4], &[0x78, 0x56, 0x34, 0x12]);

        write_u64(&mut data, 8, 0x1122334455667788);
        assert_eq!(&data[8..12], &[0x88, 0x77, 0x66, 0x55]);
    }

    #[test]
    fn strip_without_signature_is_noop() {
        let mut data = minimal_executable();
        let original = data.clone();
        assert!(!strip_signature(&mut data).unwrap());
        assert_eq!(data, original);
    }

    #[test]
    fn append_then_strip_restores_slice() {
        let mut data = minimal_executable();
        let original = data.clone();

        let dataoff = align_to(data.len(), 16) as u32;
        data.resize(dataoff as usize, 0);
        let padded = data.clone();

        append_signature_command(&mut data, dataoff, 0x200).unwrap();

        let facts = slice_facts(&data).unwrap();
        let cs = facts.code_signature.unwrap();
        assert!(cs.is_last_command);
        assert_eq!(cs.dataoff, dataoff);
        assert_eq!(cs.datasize, 0x200);
        assert_eq!(cs.dataoff as usize + cs.datasize as usize, data.len());
        assert_eq!(cs.dataoff % 16, 0);

        // __LINKEDIT grew to cover the region.
        let linkedit = facts.linkedit.unwrap();
        assert_eq!(linkedit.fileoff + linkedit.filesize, data.len() as u64);

        assert!(strip_signature(&mut data).unwrap());
        assert_eq!(data.len(), padded.len());
        // Header fields and command list return to the padded pre-sign state.
        assert_eq!(data[..32], padded[..32]);
        assert_eq!(
            slice_facts(&data).unwrap().ncmds,
            slice_facts(&original).unwrap().ncmds
        );
    }

    #[test]
    fn append_rejects_misaligned_offset() {
        let mut data = minimal_executable();
        data.push(0); // force a non-16-aligned length
        let len = data.len() as u32;
        assert!(append_signature_command(&mut data, len, 0x100).is_err());
    }
}
