//! Merge operator catalogue.
//!
//! Each operator is an associative merge: given an optional existing value
//! and an operand, produce the new stored value. Corrupted/mis-sized
//! existing values are treated as the operator's zero element rather than
//! erroring ("errors are treated as 0").
//!
//! `ListAppendOperator`, `NULAppendOperator`, `NULAppendSetOperator` and
//! `DAddOperator` have no fully-specified reference behavior; their
//! semantics here are inferred
//! from their names and from the sibling operators that *are* defined
//! (`DMulOperator`, `AppendOperator`) — see DESIGN.md.

use bytes::Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOperator {
    Replace,
    Int64Add,
    DoubleMul,
    DoubleAdd,
    Append,
    ListAppend,
    NulAppend,
    NulAppendSet,
    And,
    Or,
    Xor,
}

/// NUL byte used as the list/string separator by the NUL-append family.
const NUL: u8 = 0x00;

impl MergeOperator {
    /// Parses a table config's `mergeOperator` string (plus the codes named
    /// in spec.md section 9 that have no string form of their own but the
    /// tagged variant still needs to parse/serialize).
    pub fn from_code(code: &str) -> MergeOperator {
        match code {
            "" | "REPLACE" => MergeOperator::Replace,
            "INT64ADD" => MergeOperator::Int64Add,
            "DMUL" => MergeOperator::DoubleMul,
            "DADD" => MergeOperator::DoubleAdd,
            "APPEND" => MergeOperator::Append,
            "LISTAPPEND" => MergeOperator::ListAppend,
            "NULAPPEND" => MergeOperator::NulAppend,
            "NULAPPENDSET" => MergeOperator::NulAppendSet,
            "AND" => MergeOperator::And,
            "OR" => MergeOperator::Or,
            "XOR" => MergeOperator::Xor,
            _ => MergeOperator::Replace,
        }
    }

    /// Inverse of the `as u8` cast used to store the operator in a
    /// `TableOptions::merge_operator_code` byte.
    pub fn from_repr(v: u8) -> MergeOperator {
        const ALL: [MergeOperator; 11] = [
            MergeOperator::Replace,
            MergeOperator::Int64Add,
            MergeOperator::DoubleMul,
            MergeOperator::DoubleAdd,
            MergeOperator::Append,
            MergeOperator::ListAppend,
            MergeOperator::NulAppend,
            MergeOperator::NulAppendSet,
            MergeOperator::And,
            MergeOperator::Or,
            MergeOperator::Xor,
        ];
        ALL.get(v as usize).copied().unwrap_or(MergeOperator::Replace)
    }

    pub fn code(self) -> &'static str {
        match self {
            MergeOperator::Replace => "REPLACE",
            MergeOperator::Int64Add => "INT64ADD",
            MergeOperator::DoubleMul => "DMUL",
            MergeOperator::DoubleAdd => "DADD",
            MergeOperator::Append => "APPEND",
            MergeOperator::ListAppend => "LISTAPPEND",
            MergeOperator::NulAppend => "NULAPPEND",
            MergeOperator::NulAppendSet => "NULAPPENDSET",
            MergeOperator::And => "AND",
            MergeOperator::Or => "OR",
            MergeOperator::Xor => "XOR",
        }
    }

    /// True for the trivial replace operator — tablespace uses this to
    /// decide between engine Put and Merge (spec.md 4.2).
    pub fn is_replace(self) -> bool {
        matches!(self, MergeOperator::Replace)
    }

    pub fn apply(self, existing: Option<&[u8]>, operand: &[u8]) -> Bytes {
        match self {
            MergeOperator::Replace => Bytes::copy_from_slice(operand),
            MergeOperator::Int64Add => {
                let existing = read_i64(existing);
                let operand = read_i64(Some(operand));
                Bytes::copy_from_slice(&(existing + operand).to_ne_bytes())
            }
            MergeOperator::DoubleMul => {
                let existing = read_f64_or(existing, 0.0);
                let operand = read_f64_or(Some(operand), 0.0);
                Bytes::copy_from_slice(&(existing * operand).to_ne_bytes())
            }
            MergeOperator::DoubleAdd => {
                let existing = read_f64_or(existing, 0.0);
                let operand = read_f64_or(Some(operand), 0.0);
                Bytes::copy_from_slice(&(existing + operand).to_ne_bytes())
            }
            MergeOperator::Append => {
                let mut out = existing.map(|v| v.to_vec()).unwrap_or_default();
                out.extend_from_slice(operand);
                Bytes::from(out)
            }
            MergeOperator::ListAppend => {
                let mut out = existing.map(|v| v.to_vec()).unwrap_or_default();
                if !out.is_empty() {
                    out.push(NUL);
                }
                out.extend_from_slice(operand);
                Bytes::from(out)
            }
            MergeOperator::NulAppend => {
                let mut out = existing.map(|v| v.to_vec()).unwrap_or_default();
                out.push(NUL);
                out.extend_from_slice(operand);
                Bytes::from(out)
            }
            MergeOperator::NulAppendSet => {
                let existing = existing.unwrap_or(&[]);
                if existing.split(|&b| b == NUL).any(|elem| elem == operand) {
                    Bytes::copy_from_slice(existing)
                } else {
                    let mut out = existing.to_vec();
                    if !out.is_empty() {
                        out.push(NUL);
                    }
                    out.extend_from_slice(operand);
                    Bytes::from(out)
                }
            }
            MergeOperator::And => bitwise(existing, operand, 0xFF, |a, b| a & b),
            MergeOperator::Or => bitwise(existing, operand, 0x00, |a, b| a | b),
            MergeOperator::Xor => bitwise(existing, operand, 0x00, |a, b| a ^ b),
        }
    }
}

fn read_i64(value: Option<&[u8]>) -> i64 {
    match value {
        Some(bytes) if bytes.len() == 8 => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(bytes);
            i64::from_ne_bytes(buf)
        }
        _ => 0,
    }
}

fn read_f64_or(value: Option<&[u8]>, default: f64) -> f64 {
    match value {
        Some(bytes) if bytes.len() == 8 => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(bytes);
            f64::from_ne_bytes(buf)
        }
        _ => default,
    }
}

/// Byte-wise boolean op over operands of possibly different length. The
/// shorter operand is conceptually padded with `fill` for the missing
/// positions, matching the header doc comments on `ANDOperator`/
/// `OROperator`/`XOROperator` ("missing bytes are assumed to be copied").
fn bitwise(existing: Option<&[u8]>, operand: &[u8], fill: u8, op: fn(u8, u8) -> u8) -> Bytes {
    let existing = existing.unwrap_or(&[]);
    let len = existing.len().max(operand.len());
    let mut out = Vec::with_capacity(len);
    for i in 0..len {
        let a = existing.get(i).copied().unwrap_or(fill);
        let b = operand.get(i).copied().unwrap_or(fill);
        out.push(op(a, b));
    }
    Bytes::from(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_ignores_existing_value() {
        let result = MergeOperator::Replace.apply(Some(b"old"), b"new");
        assert_eq!(&result[..], b"new");
    }

    #[test]
    fn int64_add_treats_missing_existing_as_zero() {
        let operand = 5i64.to_ne_bytes();
        let result = MergeOperator::Int64Add.apply(None, &operand);
        assert_eq!(i64::from_ne_bytes(result[..].try_into().unwrap()), 5);
    }

    #[test]
    fn int64_add_accumulates() {
        let existing = 10i64.to_ne_bytes();
        let operand = 7i64.to_ne_bytes();
        let result = MergeOperator::Int64Add.apply(Some(&existing), &operand);
        assert_eq!(i64::from_ne_bytes(result[..].try_into().unwrap()), 17);
    }

    #[test]
    fn int64_add_treats_corrupt_existing_as_zero() {
        let operand = 3i64.to_ne_bytes();
        let result = MergeOperator::Int64Add.apply(Some(b"bad"), &operand);
        assert_eq!(i64::from_ne_bytes(result[..].try_into().unwrap()), 3);
    }

    #[test]
    fn double_mul_and_add() {
        let existing = 2.0f64.to_ne_bytes();
        let operand = 3.0f64.to_ne_bytes();
        let mul = MergeOperator::DoubleMul.apply(Some(&existing), &operand);
        assert_eq!(f64::from_ne_bytes(mul[..].try_into().unwrap()), 6.0);

        let add = MergeOperator::DoubleAdd.apply(Some(&existing), &operand);
        assert_eq!(f64::from_ne_bytes(add[..].try_into().unwrap()), 5.0);
    }

    #[test]
    fn append_concatenates() {
        let result = MergeOperator::Append.apply(Some(b"foo"), b"bar");
        assert_eq!(&result[..], b"foobar");
    }

    #[test]
    fn and_pads_short_operand_with_0xff() {
        let existing = [0x0F, 0xFF];
        let operand = [0xFF];
        let result = MergeOperator::And.apply(Some(&existing), &operand);
        assert_eq!(&result[..], &[0x0F, 0xFF]);
    }

    #[test]
    fn or_and_xor_pad_short_operand_with_zero() {
        let existing = [0x01, 0x02];
        let operand = [0x10];
        let or = MergeOperator::Or.apply(Some(&existing), &operand);
        assert_eq!(&or[..], &[0x11, 0x02]);
        let xor = MergeOperator::Xor.apply(Some(&existing), &operand);
        assert_eq!(&xor[..], &[0x11, 0x02]);
    }

    #[test]
    fn nul_append_set_does_not_duplicate_existing_element() {
        let existing = b"a\x00b";
        let once = MergeOperator::NulAppendSet.apply(Some(existing), b"b");
        assert_eq!(&once[..], existing);
        let added = MergeOperator::NulAppendSet.apply(Some(existing), b"c");
        assert_eq!(&added[..], b"a\x00b\x00c");
    }

    #[test]
    fn codes_round_trip() {
        for op in [
            MergeOperator::Replace,
            MergeOperator::Int64Add,
            MergeOperator::DoubleMul,
            MergeOperator::DoubleAdd,
            MergeOperator::Append,
            MergeOperator::ListAppend,
            MergeOperator::NulAppend,
            MergeOperator::NulAppendSet,
            MergeOperator::And,
            MergeOperator::Or,
            MergeOperator::Xor,
        ] {
            assert_eq!(MergeOperator::from_code(op.code()), op);
        }
    }

    #[test]
    fn empty_code_and_unknown_code_both_mean_replace() {
        assert_eq!(MergeOperator::from_code(""), MergeOperator::Replace);
        assert_eq!(MergeOperator::from_code("NOT_A_CODE"), MergeOperator::Replace);
    }
}
