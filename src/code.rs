//! # Code
//!
//! Instruction encoding for the patch sites this crate rewrites.
//!
//! Every redirect in the supported build is a 5-byte `call rel32` or
//! `jmp rel32`; there is no need for a disassembler or for relocating
//! displaced instructions, because each site's byte layout is known ahead
//! of time.

use thiserror::Error;

/// Opcode of a `call rel32` instruction.
pub const CALL_REL32: u8 = 0xe8;
/// Opcode of a `jmp rel32` instruction.
pub const JMP_REL32: u8 = 0xe9;
/// Single-byte no-op.
pub const NOP: u8 = 0x90;
/// Size of a rel32 call or jump, opcode included.
pub const REDIRECT_LEN: usize = 5;

/// Error when a redirect target cannot be encoded.
#[derive(Debug, Error)]
#[error("target {target:#x} is out of rel32 range of site {site:#x}")]
pub struct DisplacementError {
    /// Address the redirect is written at.
    pub site: usize,
    /// Address the redirect should land on.
    pub target: usize,
}

/// Computes the rel32 displacement for a call/jump at `site` landing on
/// `target`, or fails when the two are further than ±2 GiB apart.
fn rel32(site: usize, target: usize) -> Result<i32, DisplacementError> {
    let displacement = target.wrapping_sub(site.wrapping_add(REDIRECT_LEN)) as isize;
    i32::try_from(displacement).map_err(|_| DisplacementError { site, target })
}

/// Encodes the displacement into a 5-byte instruction starting with `opcode`.
fn encode_rel(opcode: u8, site: usize, target: usize) -> Result<[u8; REDIRECT_LEN], DisplacementError> {
    let displacement = rel32(site, target)?;
    let mut bytes = [opcode; REDIRECT_LEN];
    bytes[1..].copy_from_slice(&displacement.to_le_bytes());
    Ok(bytes)
}

/// Generates a `call rel32` at `site` targeting `target`.
pub fn call_rel(site: usize, target: usize) -> Result<[u8; REDIRECT_LEN], DisplacementError> {
    encode_rel(CALL_REL32, site, target)
}

/// Generates a `jmp rel32` at `site` targeting `target`.
pub fn jmp_rel(site: usize, target: usize) -> Result<[u8; REDIRECT_LEN], DisplacementError> {
    encode_rel(JMP_REL32, site, target)
}

/// Returns `len` bytes of no-op filler.
pub fn nop_fill(len: usize) -> Vec<u8> {
    vec![NOP; len]
}

/// Reads back the absolute target of the rel32 call/jump at `site`.
///
/// # Safety
///
/// `site` must be valid for reads of [`REDIRECT_LEN`] bytes and must hold a
/// rel32-displacement instruction; the result is meaningless otherwise.
pub unsafe fn read_rel_target(site: *const u8) -> usize {
    let displacement = core::ptr::read_unaligned(site.add(1) as *const i32);
    (site as usize)
        .wrapping_add(REDIRECT_LEN)
        .wrapping_add(displacement as isize as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_encodes_forward_displacement() {
        let bytes = call_rel(0x1000, 0x1105).unwrap();
        assert_eq!(bytes[0], CALL_REL32);
        // 0x1105 - (0x1000 + 5) = 0x100
        assert_eq!(i32::from_le_bytes(bytes[1..].try_into().unwrap()), 0x100);
    }

    #[test]
    fn jmp_encodes_backward_displacement() {
        let bytes = jmp_rel(0x2000, 0x1000).unwrap();
        assert_eq!(bytes[0], JMP_REL32);
        assert_eq!(i32::from_le_bytes(bytes[1..].try_into().unwrap()), -0x1005);
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn out_of_range_target_is_rejected() {
        assert!(jmp_rel(0x1000, 0x1_0000_2000).is_err());
        assert!(call_rel(0x1_0000_2000, 0x1000).is_err());
    }

    #[test]
    fn read_back_recovers_encoded_target() {
        let mut site = vec![0u8; 16];
        let base = site.as_ptr() as usize;
        let target = base + 0x42;
        site[..REDIRECT_LEN].copy_from_slice(&call_rel(base, target).unwrap());
        assert_eq!(unsafe { read_rel_target(site.as_ptr()) }, target);
    }

    #[test]
    fn nop_fill_is_all_nops() {
        assert_eq!(nop_fill(3), [NOP, NOP, NOP]);
        assert!(nop_fill(0).is_empty());
    }
}
