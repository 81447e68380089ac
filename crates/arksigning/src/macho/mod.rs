//! Mach-O parsing and signature rewriting.

pub mod inject;
pub mod parser;
pub mod signer;
pub mod writer;

pub use parser::{MachOFile, SliceFacts};
pub use signer::SignContext;

use crate::Result;

/// Human-readable architecture summary of one slice.
pub struct ArchDescription {
    pub arch: &'static str,
    pub is_64: bool,
    pub is_executable: bool,
    pub signed: bool,
    pub size: usize,
}

fn arch_name(cputype: u32) -> &'static str {
    match cputype {
        7 => "i386",
        0x0100_0007 => "x86_64",
        12 => "armv7",
        0x0100_000c => "arm64",
        _ => "unknown",
    }
}

impl MachOFile {
    /// Append a dylib load command to every slice.
    ///
    /// Returns `true` when at least one slice was modified; a slice that
    /// already references the install name is left alone.
    pub fn inject_dylib(&mut self, install_name: &str, weak: bool) -> Result<bool> {
        let mut changed = false;
        for slice in &mut self.slices {
            changed |= inject::inject_dylib(&mut slice.data, install_name, weak)?;
        }
        Ok(changed)
    }

    /// Describe each slice for the CLI info output.
    pub fn describe(&self) -> Result<Vec<ArchDescription>> {
        let mut out = Vec::with_capacity(self.slices.len());
        for slice in &self.slices {
            let facts = parser::slice_facts(&slice.data)?;
            out.push(ArchDescription {
                arch: arch_name(slice.cputype),
                is_64: facts.is_64,
                is_executable: facts.is_executable,
                signed: facts.code_signature.is_some(),
                size: slice.data.len(),
            });
        }
        Ok(out)
    }
}
