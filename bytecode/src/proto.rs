use bitflags::bitflags;

bitflags! {
    /// Function class bits, the first byte of every prototype.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FnClass: u8 {
        const PRIVATE     = 0x01;
        const STATIC      = 0x02;
        const NOMASK      = 0x04;
        const ELLIPSIS    = 0x08;
        const ATOMIC      = 0x10;
        const TYPECHECKED = 0x20;
        const UNDEFINED   = 0x80;
    }
}

/// Prototype header layout:
///
/// ```text
/// byte 0:    class bits
/// byte 1:    nargs
/// byte 2:    vargs
/// bytes 3-4: total prototype size (big-endian)
/// byte 5:    return type
/// bytes 6..: parameter type descriptors; a class type is T_CLASS
///            followed by a 3-byte (inherit, index) class identifier
/// ```
pub const PROTO_ARGS_AT: usize = 6;

#[inline(always)]
pub fn proto_class(p: &[u8]) -> FnClass {
    FnClass::from_bits_retain(p[0])
}

#[inline(always)]
pub fn proto_nargs(p: &[u8]) -> usize {
    p[1] as usize
}

#[inline(always)]
pub fn proto_vargs(p: &[u8]) -> usize {
    p[2] as usize
}

#[inline(always)]
pub fn proto_size(p: &[u8]) -> usize {
    ((p[3] as usize) << 8) | p[4] as usize
}

#[inline(always)]
pub fn proto_ftype(p: &[u8]) -> u8 {
    p[5]
}

#[inline(always)]
pub fn proto_args(p: &[u8]) -> &[u8] {
    &p[PROTO_ARGS_AT..proto_size(p)]
}

/// Assemble a prototype. `argtypes` holds the encoded parameter
/// descriptors, class identifiers included.
pub fn make_proto(
    class: FnClass,
    nargs: u8,
    vargs: u8,
    ftype: u8,
    argtypes: &[u8],
) -> Vec<u8> {
    let size = PROTO_ARGS_AT + argtypes.len();
    assert!(size <= u16::MAX as usize, "prototype too large");
    let mut p = Vec::with_capacity(size);
    p.push(class.bits());
    p.push(nargs);
    p.push(vargs);
    p.push((size >> 8) as u8);
    p.push(size as u8);
    p.push(ftype);
    p.extend_from_slice(argtypes);
    p
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors_read_back() {
        let p = make_proto(
            FnClass::STATIC | FnClass::TYPECHECKED,
            2,
            1,
            0x09,
            &[0x01, 0x03, 0x09],
        );
        assert!(proto_class(&p).contains(FnClass::STATIC));
        assert!(proto_class(&p).contains(FnClass::TYPECHECKED));
        assert_eq!(proto_nargs(&p), 2);
        assert_eq!(proto_vargs(&p), 1);
        assert_eq!(proto_size(&p), 9);
        assert_eq!(proto_ftype(&p), 0x09);
        assert_eq!(proto_args(&p), &[0x01, 0x03, 0x09]);
    }
}
