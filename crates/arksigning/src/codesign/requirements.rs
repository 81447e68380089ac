//! Requirements blob builder.
//!
//! Emits the designated requirement that binds a signature to the signing
//! certificate:
//!
//! ```text
//! identifier "<bundle id>" and anchor apple generic
//!   and certificate leaf[subject.CN] = "<subject CN>"
//!   and certificate 1[field.1.2.840.113635.100.6.2.1] /* exists */
//! ```
//!
//! The expression is encoded with the standard requirement opcodes inside a
//! requirements set (magic `0xfade0c01`) holding one designated-requirement
//! entry. Loose dylibs signed without a bundle context get the empty set.

use super::constants::*;

/// DER bytes of OID 1.2.840.113635.100.6.2.1 (Apple WWDR intermediate marker).
const APPLE_WWDR_EXTENSION_OID: [u8; 10] =
    [0x2a, 0x86, 0x48, 0x86, 0xf7, 0x63, 0x64, 0x06, 0x02, 0x01];

/// Certificate slot index for the leaf certificate.
const CERT_SLOT_LEAF: u32 = 0;

/// Certificate slot index for the first intermediate.
const CERT_SLOT_INTERMEDIATE: u32 = 1;

/// Length-prefixed data operand, zero-padded to a 4-byte boundary.
fn push_data(buf: &mut Vec<u8>, data: &[u8]) {
    buf.extend(&(data.len() as u32).to_be_bytes());
    buf.extend(data);
    let pad = (4 - data.len() % 4) % 4;
    buf.extend(std::iter::repeat(0u8).take(pad));
}

/// `identifier "<ident>"`
fn expr_identifier(ident: &str) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend(&OP_IDENT.to_be_bytes());
    push_data(&mut buf, ident.as_bytes());
    buf
}

/// `anchor apple generic`
fn expr_apple_generic_anchor() -> Vec<u8> {
    OP_APPLE_GENERIC_ANCHOR.to_be_bytes().to_vec()
}

/// `certificate <slot>[<field>] = "<value>"`
fn expr_cert_field_equal(cert_slot: u32, field: &str, value: &str) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend(&OP_CERT_FIELD.to_be_bytes());
    buf.extend(&cert_slot.to_be_bytes());
    push_data(&mut buf, field.as_bytes());
    buf.extend(&MATCH_EQUAL.to_be_bytes());
    push_data(&mut buf, value.as_bytes());
    buf
}

/// `certificate <slot>[field.<oid>] exists`
fn expr_cert_generic_exists(cert_slot: u32, oid: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend(&OP_CERT_GENERIC.to_be_bytes());
    buf.extend(&cert_slot.to_be_bytes());
    push_data(&mut buf, oid);
    buf.extend(&MATCH_EXISTS.to_be_bytes());
    buf
}

/// Left-associative AND of two encoded sub-expressions.
fn expr_and(left: Vec<u8>, right: Vec<u8>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + left.len() + right.len());
    buf.extend(&OP_AND.to_be_bytes());
    buf.extend(left);
    buf.extend(right);
    buf
}

/// Wrap an encoded expression in a single-requirement blob (`0xfade0c00`).
fn requirement_blob(expr: &[u8]) -> Vec<u8> {
    let total_len = 12 + expr.len() as u32;
    let mut buf = Vec::with_capacity(total_len as usize);
    buf.extend(&CSMAGIC_REQUIREMENT.to_be_bytes());
    buf.extend(&total_len.to_be_bytes());
    buf.extend(&REQUIREMENT_KIND_EXPR.to_be_bytes());
    buf.extend(expr);
    buf
}

/// Build the full designated-requirement set for a bundle signature.
pub fn build_requirements(bundle_id: &str, subject_cn: &str) -> Vec<u8> {
    let expr = expr_and(
        expr_and(
            expr_and(expr_identifier(bundle_id), expr_apple_generic_anchor()),
            expr_cert_field_equal(CERT_SLOT_LEAF, "subject.CN", subject_cn),
        ),
        expr_cert_generic_exists(CERT_SLOT_INTERMEDIATE, &APPLE_WWDR_EXTENSION_OID),
    );
    let requirement = requirement_blob(&expr);

    // Set header: magic, length, count, then one (type, offset) entry.
    let total_len = 12 + 8 + requirement.len() as u32;
    let mut buf = Vec::with_capacity(total_len as usize);
    buf.extend(&CSMAGIC_REQUIREMENTS.to_be_bytes());
    buf.extend(&total_len.to_be_bytes());
    buf.extend(&1u32.to_be_bytes());
    buf.extend(&CSREQ_DESIGNATED.to_be_bytes());
    buf.extend(&20u32.to_be_bytes()); // first requirement follows the entry
    buf.extend(requirement);

    buf
}

/// The empty requirements set (header only, count 0).
pub fn build_empty_requirements() -> Vec<u8> {
    let mut buf = Vec::with_capacity(12);
    buf.extend(&CSMAGIC_REQUIREMENTS.to_be_bytes());
    buf.extend(&12u32.to_be_bytes());
    buf.extend(&0u32.to_be_bytes());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn be32(buf: &[u8], off: usize) -> u32 {
        u32::from_be_bytes(buf[off..off + 4].try_into().unwrap())
    }

    #[test]
    fn empty_requirements_layout() {
        let req = build_empty_requirements();
        assert_eq!(req.len(), 12);
        assert_eq!(be32(&req, 0), CSMAGIC_REQUIREMENTS);
        assert_eq!(be32(&req, 4), 12);
        assert_eq!(be32(&req, 8), 0);
    }

    #[test]
    fn data_operand_is_padded_to_four() {
        let mut buf = Vec::new();
        push_data(&mut buf, b"abcde");
        // 4 length bytes + 5 data bytes + 3 pad bytes
        assert_eq!(buf.len(), 12);
        assert_eq!(be32(&buf, 0), 5);
        assert_eq!(&buf[9..], &[0, 0, 0]);
    }

    #[test]
    fn full_requirements_layout() {
        let req = build_requirements("com.example.app", "Apple Development: Jane");

        assert_eq!(be32(&req, 0), CSMAGIC_REQUIREMENTS);
        assert_eq!(be32(&req, 4) as usize, req.len());
        assert_eq!(be32(&req, 8), 1);
        assert_eq!(be32(&req, 12), CSREQ_DESIGNATED);
        let offset = be32(&req, 16) as usize;
        assert_eq!(offset, 20);

        // Embedded requirement blob
        assert_eq!(be32(&req, offset), CSMAGIC_REQUIREMENT);
        assert_eq!(be32(&req, offset + 4) as usize, req.len() - offset);
        assert_eq!(be32(&req, offset + 8), REQUIREMENT_KIND_EXPR);
        // Outermost expression is an AND chain
        assert_eq!(be32(&req, offset + 12), OP_AND);

        let text = String::from_utf8_lossy(&req);
        assert!(text.contains("com.example.app"));
        assert!(text.contains("subject.CN"));
        assert!(text.contains("Apple Development: Jane"));
    }

    #[test]
    fn identifier_expression_encoding() {
        let expr = expr_identifier("abc");
        assert_eq!(be32(&expr, 0), OP_IDENT);
        assert_eq!(be32(&expr, 4), 3);
        assert_eq!(&expr[8..11], b"abc");
        assert_eq!(expr[11], 0); // padding
    }

    #[test]
    fn cert_generic_carries_oid_and_match() {
        let expr = expr_cert_generic_exists(1, &APPLE_WWDR_EXTENSION_OID);
        assert_eq!(be32(&expr, 0), OP_CERT_GENERIC);
        assert_eq!(be32(&expr, 4), 1);
        assert_eq!(be32(&expr, 8), 10);
        assert_eq!(&expr[12..22], &APPLE_WWDR_EXTENSION_OID);
        // 10 data bytes pad to 12; match op follows
        assert_eq!(be32(&expr, 24), MATCH_EXISTS);
    }
}
