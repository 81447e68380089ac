//! Mach-O container parsing.
//!
//! A [`MachOFile`] owns the bytes of every architecture slice. Thin binaries
//! have one slice covering the whole file; fat binaries are split along the
//! `fat_arch` table so each slice can be rewritten independently and the
//! container relaid out afterwards.
//!
//! Thin slices are little-endian on disk; the fat header is big-endian.

use crate::{Error, Result};
use goblin::mach::header::MH_EXECUTE;
use goblin::mach::load_command::CommandVariant;
use goblin::mach::MachO;
use std::fs;
use std::path::{Path, PathBuf};

/// 32-bit thin Mach-O magic
pub const MH_MAGIC: u32 = 0xfeedface;
/// 64-bit thin Mach-O magic
pub const MH_MAGIC_64: u32 = 0xfeedfacf;
/// Fat container magic (big-endian on disk)
pub const FAT_MAGIC: u32 = 0xcafebabe;
/// Byte-swapped fat container magic
pub const FAT_CIGAM: u32 = 0xbebafeca;

const CPU_TYPE_X86: u32 = 7;
const CPU_TYPE_X86_64: u32 = 0x0100_0007;
const CPU_TYPE_ARM: u32 = 12;
const CPU_TYPE_ARM64: u32 = 0x0100_000c;

const FAT_HEADER_SIZE: usize = 8;
const FAT_ARCH_SIZE: usize = 20;

/// One architecture slice with its owned bytes.
pub struct ArchSlice {
    pub data: Vec<u8>,
    pub cputype: u32,
    pub cpusubtype: u32,
    /// Alignment exponent from the fat_arch entry; 0 for thin binaries.
    pub align: u32,
}

/// A Mach-O binary opened for rewriting.
pub struct MachOFile {
    path: PathBuf,
    pub slices: Vec<ArchSlice>,
    is_fat: bool,
}

impl MachOFile {
    /// Read and split a binary into slices.
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = fs::read(&path)?;
        if data.len() < 8 {
            return Err(Error::MachO(format!("{}: truncated file", path.display())));
        }

        let magic_be = u32::from_be_bytes(data[0..4].try_into().unwrap());
        let magic_le = u32::from_le_bytes(data[0..4].try_into().unwrap());

        if magic_be == FAT_MAGIC || magic_be == FAT_CIGAM {
            let swapped = magic_be == FAT_CIGAM;
            let slices = split_fat(&data, swapped)
                .map_err(|e| Error::MachO(format!("{}: {}", path.display(), e)))?;
            for slice in &slices {
                check_cputype(slice.cputype)?;
            }
            Ok(Self {
                path,
                slices,
                is_fat: true,
            })
        } else if magic_le == MH_MAGIC || magic_le == MH_MAGIC_64 {
            let cputype = u32::from_le_bytes(data[4..8].try_into().unwrap());
            check_cputype(cputype)?;
            let cpusubtype = u32::from_le_bytes(data[8..12].try_into().unwrap());
            Ok(Self {
                path,
                slices: vec![ArchSlice {
                    data,
                    cputype,
                    cpusubtype,
                    align: 0,
                }],
                is_fat: false,
            })
        } else {
            Err(Error::MachO(format!(
                "{}: not a Mach-O file (magic {:#010x})",
                path.display(),
                magic_be
            )))
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_fat(&self) -> bool {
        self.is_fat
    }

    /// Write the binary back in a single pass.
    ///
    /// Fat containers are relaid out: each slice lands on its `2^align`
    /// boundary and the `fat_arch` table is renumbered. The header is always
    /// emitted in standard big-endian form.
    pub fn write(&self) -> Result<()> {
        let output = self.assemble();
        fs::write(&self.path, output)?;
        Ok(())
    }

    fn assemble(&self) -> Vec<u8> {
        if !self.is_fat {
            return self.slices[0].data.clone();
        }

        let header_end = FAT_HEADER_SIZE + self.slices.len() * FAT_ARCH_SIZE;
        let mut offsets = Vec::with_capacity(self.slices.len());
        let mut cursor = header_end;
        for slice in &self.slices {
            let alignment = 1usize << slice.align;
            cursor = align_to(cursor, alignment);
            offsets.push(cursor);
            cursor += slice.data.len();
        }

        let mut output = vec![0u8; cursor];
        output[0..4].copy_from_slice(&FAT_MAGIC.to_be_bytes());
        output[4..8].copy_from_slice(&(self.slices.len() as u32).to_be_bytes());

        for (i, slice) in self.slices.iter().enumerate() {
            let entry = FAT_HEADER_SIZE + i * FAT_ARCH_SIZE;
            output[entry..entry + 4].copy_from_slice(&slice.cputype.to_be_bytes());
            output[entry + 4..entry + 8].copy_from_slice(&slice.cpusubtype.to_be_bytes());
            output[entry + 8..entry + 12].copy_from_slice(&(offsets[i] as u32).to_be_bytes());
            output[entry + 12..entry + 16]
                .copy_from_slice(&(slice.data.len() as u32).to_be_bytes());
            output[entry + 16..entry + 20].copy_from_slice(&slice.align.to_be_bytes());

            output[offsets[i]..offsets[i] + slice.data.len()].copy_from_slice(&slice.data);
        }

        output
    }
}

fn check_cputype(cputype: u32) -> Result<()> {
    match cputype {
        CPU_TYPE_X86 | CPU_TYPE_X86_64 | CPU_TYPE_ARM | CPU_TYPE_ARM64 => Ok(()),
        other => Err(Error::UnsupportedArch(other)),
    }
}

fn split_fat(data: &[u8], swapped: bool) -> std::result::Result<Vec<ArchSlice>, String> {
    let read = |bytes: &[u8]| -> u32 {
        let arr: [u8; 4] = bytes.try_into().unwrap();
        if swapped {
            u32::from_le_bytes(arr)
        } else {
            u32::from_be_bytes(arr)
        }
    };

    let nfat = read(&data[4..8]) as usize;
    let table_end = FAT_HEADER_SIZE + nfat * FAT_ARCH_SIZE;
    if nfat == 0 || table_end > data.len() {
        return Err("invalid fat_arch table".into());
    }

    let mut slices = Vec::with_capacity(nfat);
    for i in 0..nfat {
        let entry = FAT_HEADER_SIZE + i * FAT_ARCH_SIZE;
        let cputype = read(&data[entry..entry + 4]);
        let cpusubtype = read(&data[entry + 4..entry + 8]);
        let offset = read(&data[entry + 8..entry + 12]) as usize;
        let size = read(&data[entry + 12..entry + 16]) as usize;
        let align = read(&data[entry + 16..entry + 20]);

        let end = offset.checked_add(size).ok_or("fat_arch overflow")?;
        if end > data.len() {
            return Err(format!("slice {} extends past end of file", i));
        }

        let slice_data = data[offset..end].to_vec();
        if slice_data.len() >= 4 {
            let inner = u32::from_be_bytes(slice_data[0..4].try_into().unwrap());
            if inner == FAT_MAGIC || inner == FAT_CIGAM {
                return Err("fat container nested inside fat container".into());
            }
        }

        slices.push(ArchSlice {
            data: slice_data,
            cputype,
            cpusubtype,
            align,
        });
    }

    Ok(slices)
}

/// Segment location inside a slice.
#[derive(Debug, Clone, Copy)]
pub struct SegmentInfo {
    /// Byte offset of the load command itself
    pub cmd_offset: usize,
    pub fileoff: u64,
    pub filesize: u64,
}

/// `LC_CODE_SIGNATURE` location inside a slice.
#[derive(Debug, Clone, Copy)]
pub struct CodeSignatureInfo {
    pub cmd_offset: usize,
    pub dataoff: u32,
    pub datasize: u32,
    /// Whether the command is the last one in the load command list
    pub is_last_command: bool,
}

/// Everything the rewriter needs to know about one slice.
pub struct SliceFacts {
    pub is_64: bool,
    pub is_executable: bool,
    pub header_size: usize,
    pub ncmds: u32,
    pub sizeofcmds: u32,
    /// `header_size + sizeofcmds`
    pub load_commands_end: usize,
    /// `__TEXT` vmsize, used for execSegLimit
    pub text_vmsize: u64,
    /// First `__TEXT` section's file offset; load commands must end before it
    pub first_section_offset: usize,
    pub linkedit: Option<SegmentInfo>,
    pub code_signature: Option<CodeSignatureInfo>,
}

/// Parse one slice and collect the offsets of interest.
pub fn slice_facts(data: &[u8]) -> Result<SliceFacts> {
    let macho =
        MachO::parse(data, 0).map_err(|e| Error::MachO(format!("failed to parse slice: {}", e)))?;

    let is_64 = macho.is_64;
    let header_size = if is_64 { 32 } else { 28 };
    let ncmds = macho.header.ncmds as u32;
    let sizeofcmds = macho.header.sizeofcmds as u32;

    let mut text_vmsize = 0u64;
    let mut first_section_offset = usize::MAX;
    let mut linkedit = None;
    let mut code_signature = None;
    let mut max_cmd_offset = 0usize;

    for lc in &macho.load_commands {
        if lc.offset > max_cmd_offset {
            max_cmd_offset = lc.offset;
        }

        match lc.command {
            CommandVariant::CodeSignature(cs) => {
                code_signature = Some(CodeSignatureInfo {
                    cmd_offset: lc.offset,
                    dataoff: cs.dataoff,
                    datasize: cs.datasize,
                    is_last_command: false, // fixed up below
                });
            }
            CommandVariant::Segment64(ref seg) => {
                if seg.segname.starts_with(b"__TEXT") {
                    text_vmsize = seg.vmsize;
                    // section_64 records follow the segment command
                    for i in 0..seg.nsects as usize {
                        let sect = lc.offset + 72 + i * 80;
                        if sect + 52 <= data.len() {
                            let off =
                                u32::from_le_bytes(data[sect + 48..sect + 52].try_into().unwrap());
                            if off > 0 && (off as usize) < first_section_offset {
                                first_section_offset = off as usize;
                            }
                        }
                    }
                } else if seg.segname.starts_with(b"__LINKEDIT") {
                    linkedit = Some(SegmentInfo {
                        cmd_offset: lc.offset,
                        fileoff: seg.fileoff,
                        filesize: seg.filesize,
                    });
                }
            }
            CommandVariant::Segment32(ref seg) => {
                if seg.segname.starts_with(b"__TEXT") {
                    text_vmsize = seg.vmsize as u64;
                    for i in 0..seg.nsects as usize {
                        let sect = lc.offset + 56 + i * 68;
                        if sect + 44 <= data.len() {
                            let off =
                                u32::from_le_bytes(data[sect + 40..sect + 44].try_into().unwrap());
                            if off > 0 && (off as usize) < first_section_offset {
                                first_section_offset = off as usize;
                            }
                        }
                    }
                } else if seg.segname.starts_with(b"__LINKEDIT") {
                    linkedit = Some(SegmentInfo {
                        cmd_offset: lc.offset,
                        fileoff: seg.fileoff as u64,
                        filesize: seg.filesize as u64,
                    });
                }
            }
            _ => {}
        }
    }

    if let Some(ref mut cs) = code_signature {
        cs.is_last_command = cs.cmd_offset == max_cmd_offset;
    }

    // Without sections the gap check falls back to the first segment data.
    if first_section_offset == usize::MAX {
        first_section_offset = macho
            .load_commands
            .iter()
            .filter_map(|lc| match lc.command {
                CommandVariant::Segment64(ref seg) if seg.fileoff > 0 => {
                    Some(seg.fileoff as usize)
                }
                CommandVariant::Segment32(ref seg) if seg.fileoff > 0 => {
                    Some(seg.fileoff as usize)
                }
                _ => None,
            })
            .min()
            .unwrap_or(data.len());
    }

    Ok(SliceFacts {
        is_64,
        is_executable: macho.header.filetype == MH_EXECUTE,
        header_size,
        ncmds,
        sizeofcmds,
        load_commands_end: header_size + sizeofcmds as usize,
        text_vmsize,
        first_section_offset,
        linkedit,
        code_signature,
    })
}

/// Round `value` up to a multiple of `alignment` (a power of two).
pub fn align_to(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}
